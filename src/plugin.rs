//! The externalising resolver consulted by the bundler for every import in
//! the dependency closure of the entry. Imports either bundle inline or
//! survive as externals under a sentinel specifier that the output
//! rewriter later replaces with a real URL.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bundler::{ImportResolver, Resolution, ResolveArgs};
use crate::nodejs::is_builtin_node_module;
use crate::registry::split_specifier;

/// Marker prefixed to every externalised specifier. Survives the bundler
/// verbatim; removed during rewriting.
pub const EXTERNAL_SENTINEL: &str = "__ESM_SH_EXTERNAL:";

/// State shared between the resolver, the retry loop, and the rewriter.
pub struct ExternalResolver {
    /// Package root: `<wd>/node_modules/<name>`
    package_dir: String,
    /// Name of the package being built
    pkg_name: String,
    /// The entry specifier of the current build
    import_path: String,
    alias: BTreeMap<String, String>,
    bundle_mode: bool,
    peer_dependencies: BTreeSet<String>,
    /// The manifest's conditional-exports map, raw
    defined_exports: Option<serde_json::Value>,
    /// Externals collected during the run, in first-seen order is not
    /// needed; sorted order keeps rewriting deterministic
    external: Arc<Mutex<BTreeSet<String>>>,
    /// Names force-marked external by the retry classifier
    extra_external: Arc<Mutex<HashSet<String>>>,
}

impl ExternalResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wd: &Path,
        pkg_name: &str,
        import_path: &str,
        alias: BTreeMap<String, String>,
        bundle_mode: bool,
        peer_dependencies: BTreeSet<String>,
        defined_exports: Option<serde_json::Value>,
        external: Arc<Mutex<BTreeSet<String>>>,
        extra_external: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        Self {
            package_dir: wd
                .join("node_modules")
                .join(pkg_name)
                .to_string_lossy()
                .to_string(),
            pkg_name: pkg_name.to_string(),
            import_path: import_path.to_string(),
            alias,
            bundle_mode,
            peer_dependencies,
            defined_exports,
            external,
            extra_external,
        }
    }

    /// Externals collected so far, sorted.
    pub fn externals(&self) -> Vec<String> {
        self.external.lock().iter().cloned().collect()
    }

    fn mark_external(&self, name: &str) -> Resolution {
        self.external.lock().insert(name.to_string());
        Resolution::ExternalPath(format!("{}{}", EXTERNAL_SENTINEL, name))
    }

    /// Probe the exports map for a relative import that resolves to an
    /// exported path of the package; such imports split into their own
    /// artifact instead of bundling inline.
    fn match_defined_export(&self, resolved: &str) -> Option<String> {
        let map = self.defined_exports.as_ref()?.as_object()?;
        for (export, paths) in map {
            if export == "." {
                continue;
            }
            let Some(conditions) = paths.as_object() else {
                continue;
            };
            for value in conditions.values() {
                let Some(s) = value.as_str() else { continue };
                if s.is_empty() {
                    continue;
                }
                let mut export = export.clone();
                let mut matched = resolved == s
                    || format!("{}.js", resolved) == s
                    || format!("{}.mjs", resolved) == s;
                if !matched {
                    let parts: Vec<&str> = s.split('*').collect();
                    if parts.len() == 2 {
                        let (prefix, suffix) = (parts[0], parts[1]);
                        let with_js = format!("{}.js", resolved);
                        let with_mjs = format!("{}.mjs", resolved);
                        if resolved.starts_with(prefix)
                            && (resolved.ends_with(suffix)
                                || with_js.ends_with(suffix)
                                || with_mjs.ends_with(suffix))
                        {
                            let match_name = resolved
                                .strip_suffix(suffix)
                                .unwrap_or(resolved)
                                .strip_prefix(prefix)
                                .unwrap_or(resolved);
                            export = export.replace('*', match_name);
                            matched = true;
                        }
                    }
                }
                if matched {
                    let export = export.trim_start_matches("./");
                    return Some(format!("{}/{}", self.pkg_name, export));
                }
            }
        }
        None
    }
}

impl ImportResolver for ExternalResolver {
    fn resolve(&self, args: ResolveArgs<'_>) -> Resolution {
        if args.path.starts_with("data:") {
            return Resolution::External;
        }

        let mut specifier = args.path.trim_end_matches('/').to_string();

        if let Some(to) = self.alias.get(&specifier) {
            specifier = to.clone();
        }

        if let Some(stripped) = specifier.strip_prefix("node:") {
            specifier = stripped.to_string();
        }

        // bundle mode inlines everything except peer dependencies and
        // runtime builtins
        if self.bundle_mode && !self.extra_external.lock().contains(&specifier) {
            let (pkg_name, _) = split_specifier(&specifier);
            if !is_builtin_node_module(&pkg_name) && !self.peer_dependencies.contains(&pkg_name) {
                return Resolution::Inline;
            }
        }

        // relative imports that land on an exported path of the package
        // split into sibling artifacts
        if specifier.starts_with("./") || specifier.starts_with("../") || specifier == ".." {
            let importer_dir = args
                .importer
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut resolved_path = clean_path(&format!("{}/{}", importer_dir, specifier));
            // on macOS `/private/var/` equals `/var/`
            if let Some(stripped) = resolved_path.strip_prefix("/private/var/") {
                resolved_path = format!("/var/{}", stripped);
            }
            let resolved = format!(
                ".{}",
                resolved_path
                    .strip_prefix(&self.package_dir)
                    .unwrap_or(&resolved_path)
            );
            if let Some(url) = self.match_defined_export(&resolved) {
                if url == self.import_path {
                    return Resolution::Inline;
                }
                return self.mark_external(&url);
            }
        }

        if is_local_import(&specifier) || specifier == self.import_path {
            return Resolution::Inline;
        }

        self.mark_external(&specifier)
    }
}

/// Whether a specifier is a filesystem path rather than a package name.
fn is_local_import(specifier: &str) -> bool {
    specifier.starts_with('.') || specifier.starts_with('/')
}

/// Lexically normalise a POSIX path: collapse `.`, `..`, and repeated
/// separators.
fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.last().map(|s| *s != "..").unwrap_or(false) {
                    stack.pop();
                } else if !absolute {
                    stack.push("..");
                }
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
