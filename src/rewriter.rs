//! Output rewriting.
//!
//! The bundler leaves every external import behind as a sentinel string
//! literal. This pass replaces each sentinel with its final same-origin
//! URL, reconciles the synthetic `require(...)` call-sites the bundler
//! emits around externalised CommonJS imports, prepends one import line
//! per chosen binding, and finishes with the runtime shims and the build
//! header.
//!
//! The scan is byte-level on purpose: the output is split around each
//! sentinel occurrence and a single "inside a synthetic require call"
//! flag is carried across the splits. No regexes.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use tracing::warn;

use crate::build::{BuildTask, Engine};
use crate::bundler::Target;
use crate::error::{EsmdError, Result};
use crate::module_lexer::is_ident_char;
use crate::nodejs::{
    embedded_polyfill, is_builtin_node_module, is_deno_std_node_module, polyfilled_builtin,
};
use crate::package::{parse_pkg, Pkg};
use crate::plugin::EXTERNAL_SENTINEL;
use crate::registry::split_specifier;
use crate::resolver::{init_esm, EsmMeta};

/// Map a specifier onto the identifier charset used for binding names.
pub fn identify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Split `content` around every occurrence of `pattern`.
pub(crate) fn split_segments(content: &[u8], pattern: &[u8]) -> Vec<Vec<u8>> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + pattern.len() <= content.len() {
        if &content[i..i + pattern.len()] == pattern {
            segments.push(content[start..i].to_vec());
            i += pattern.len();
            start = i;
        } else {
            i += 1;
        }
    }
    segments.push(content[start..].to_vec());
    segments
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Whether any sentinel boundary sits inside a synthetic require call,
/// meaning the target's export shape is needed for reconciliation.
pub(crate) fn has_cjs_callsite(segments: &[Vec<u8>]) -> bool {
    segments
        .iter()
        .take(segments.len().saturating_sub(1))
        .any(|p| p.ends_with(b"(") && !p.ends_with(b"import("))
}

/// Walk the split segments once, replacing each boundary with either the
/// final URL (plain import position) or the external's binding identifier
/// (synthetic require position), and collect which bindings the consuming
/// code needs.
pub(crate) fn reconcile_segments(
    segments: Vec<Vec<u8>>,
    identifier: &str,
    import_path: &str,
    target_meta: Option<&EsmMeta>,
) -> (Vec<u8>, BTreeSet<String>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut cjs_imports: BTreeSet<String> = BTreeSet::new();
    let mut cjs_context = false;
    let last = segments.len() - 1;

    for (i, segment) in segments.into_iter().enumerate() {
        let mut p = segment;

        if cjs_context {
            if p.first() == Some(&b')') {
                p.remove(0);
            }
            let mut marked = false;
            if let Some(meta) = target_meta {
                if p.first() == Some(&b'.') {
                    // right shift over the property name to see whether it
                    // names a known export
                    let mut shift = 0;
                    for &c in p.iter().skip(1) {
                        if is_ident_char(c) {
                            shift += 1;
                        } else {
                            break;
                        }
                    }
                    if shift > 0 {
                        let import_name =
                            String::from_utf8_lossy(&p[1..1 + shift]).to_string();
                        if meta.exports.iter().any(|e| *e == import_name) {
                            cjs_imports.insert(import_name);
                            marked = true;
                            p.remove(0);
                        }
                    }
                }
                // an ES module without a default export is consumed via
                // the namespace
                if !marked && !meta.package.module.is_empty() && !meta.export_default {
                    cjs_imports.insert("*".to_string());
                    marked = true;
                }
            }
            if !marked {
                cjs_imports.insert("default".to_string());
            }
        }

        cjs_context = p.ends_with(b"(") && !p.ends_with(b"import(");
        if cjs_context {
            // left shift over the require identifier the bundler generated
            let mut shift = 0;
            for &c in p[..p.len() - 1].iter().rev() {
                if is_ident_char(c) {
                    shift += 1;
                } else {
                    break;
                }
            }
            if shift > 0 {
                p.truncate(p.len() - (shift + 1));
            }
        }

        buffer.extend_from_slice(&p);
        if i < last {
            if cjs_context {
                buffer.extend_from_slice(format!("__{}$", identifier).as_bytes());
            } else {
                buffer.extend_from_slice(format!("\"{}\"", import_path).as_bytes());
            }
        }
    }

    (buffer, cjs_imports)
}

/// One import line per chosen binding, deduplicated, joined with the
/// build's line terminator.
pub(crate) fn import_prelude(
    cjs_imports: &BTreeSet<String>,
    identifier: &str,
    import_path: &str,
    eol: &str,
) -> String {
    let mut prelude = String::new();
    for name in cjs_imports {
        match name.as_str() {
            "default" => {
                prelude.push_str(&format!(
                    "import __{}$ from \"{}\";{}",
                    identifier, import_path, eol
                ));
            }
            "*" => {
                prelude.push_str(&format!(
                    "import * as __{}$ from \"{}\";{}",
                    identifier, import_path, eol
                ));
            }
            _ => {
                prelude.push_str(&format!(
                    "import {{ {} as __{}${} }} from \"{}\";{}",
                    name, identifier, name, import_path, eol
                ));
            }
        }
    }
    prelude
}

impl Engine {
    /// Rewrite one emitted JS file: resolve every collected external to a
    /// final URL, splice those URLs in, and finish with shims and header.
    pub(crate) async fn rewrite_js_output(
        &self,
        mut content: Vec<u8>,
        externals: &[String],
        task: &BuildTask,
        esm: &EsmMeta,
        wd: &Path,
        tracing: &mut HashSet<String>,
        node_env: &str,
        eol: &str,
    ) -> Result<Vec<u8>> {
        for name in externals {
            let import_path = self
                .resolve_import_url(name, task, esm, wd, tracing)
                .await?;
            content = self
                .replace_external(content, name, &import_path, task, wd, eol)
                .await?;
        }
        Ok(self.finalize_output(content, task, node_env, eol))
    }

    /// URL selection for one external, in precedence order: remote URLs,
    /// sibling submodules (built inline), the `buffer` special case,
    /// runtime builtins, pinned deps, the materialised tree, and finally
    /// upstream registry metadata.
    async fn resolve_import_url(
        &self,
        name: &str,
        task: &BuildTask,
        esm: &EsmMeta,
        wd: &Path,
        tracing: &mut HashSet<String>,
    ) -> Result<String> {
        if name.starts_with("https://") || name.starts_with("http://") {
            return Ok(name.to_string());
        }

        if let Some(submodule) = name.strip_prefix(&format!("{}/", task.pkg.name)) {
            // sibling artifact of the package being built: built inline,
            // reusing the working directory and the tracing set
            let sub_pkg = Pkg {
                name: task.pkg.name.clone(),
                version: task.pkg.version.clone(),
                submodule: Some(submodule.to_string()),
            };
            let sub_task = BuildTask {
                build_version: task.build_version,
                pkg: sub_pkg.clone(),
                alias: task.alias.clone(),
                deps: task.deps.clone(),
                target: task.target,
                bundle_mode: false,
                dev_mode: task.dev_mode,
            };
            self.build_inner(&sub_task, wd, tracing).await?;
            return Ok(task.import_path_for(&sub_pkg, true));
        }

        if name == "buffer" {
            return Ok(if task.target == Target::Node {
                "buffer".to_string()
            } else {
                format!("/v{}/node_buffer.js", task.build_version)
            });
        }

        if is_builtin_node_module(name) {
            if task.target == Target::Node {
                return Ok(name.to_string());
            }
            if task.target == Target::Deno && is_deno_std_node_module(name) {
                return Ok(format!(
                    "https://deno.land/std@{}/node/{}.ts",
                    self.config.deno_std_version, name
                ));
            }
            if let Some(polyfill) = polyfilled_builtin(name) {
                let (p, submodule) = self
                    .registry
                    .get_package_info(wd, polyfill, "latest")
                    .await?;
                let import_path = task.import_path_for(
                    &Pkg {
                        name: p.name,
                        version: p.version,
                        submodule,
                    },
                    false,
                );
                return Ok(format!(
                    "{}.bundle.js",
                    import_path.trim_end_matches(".js")
                ));
            }
            if embedded_polyfill(name).is_some() {
                return Ok(format!("/v{}/node_{}.js", task.build_version, name));
            }
            return Ok(format!(
                "/error.js?type=unsupported-nodejs-builtin-module&name={}&importer={}",
                urlencoding::encode(name),
                urlencoding::encode(&task.pkg.name)
            ));
        }

        for dep in &task.deps {
            if name == dep.name || name.starts_with(&format!("{}/", dep.name)) {
                let submodule = name
                    .strip_prefix(&format!("{}/", dep.name))
                    .map(str::to_string);
                return Ok(task.import_path_for(
                    &Pkg {
                        name: dep.name.clone(),
                        version: dep.version.clone(),
                        submodule,
                    },
                    false,
                ));
            }
        }

        let (pkg_name, submodule) = split_specifier(name);
        let manifest = wd.join("node_modules").join(&pkg_name).join("package.json");
        if manifest.exists() {
            let p = crate::package::NpmPackage::read(&manifest)?;
            let sub_pkg = Pkg {
                name: pkg_name,
                version: p.version,
                submodule,
            };
            self.enqueue(BuildTask {
                build_version: task.build_version,
                pkg: sub_pkg.clone(),
                alias: task.alias.clone(),
                deps: task.deps.clone(),
                target: task.target,
                bundle_mode: false,
                dev_mode: task.dev_mode,
            });
            return Ok(task.import_path_for(&sub_pkg, false));
        }

        let version_hint = esm
            .package
            .dependencies
            .get(name)
            .or_else(|| esm.package.peer_dependencies.get(name))
            .cloned()
            .unwrap_or_else(|| "latest".to_string());
        if let Ok((p, submodule)) = self.registry.get_package_info(wd, name, &version_hint).await
        {
            let sub_pkg = Pkg {
                name: p.name,
                version: p.version,
                submodule,
            };
            self.enqueue(BuildTask {
                build_version: task.build_version,
                pkg: sub_pkg.clone(),
                alias: task.alias.clone(),
                deps: task.deps.clone(),
                target: task.target,
                bundle_mode: false,
                dev_mode: task.dev_mode,
            });
            return Ok(task.import_path_for(&sub_pkg, false));
        }

        Err(EsmdError::NotFound(format!(
            "Could not resolve \"{}\" (Imported by \"{}\")",
            name, task.pkg.name
        )))
    }

    /// Replace every sentinel occurrence of one external with its URL,
    /// reconciling synthetic require call-sites against the target's
    /// export shape on the way.
    async fn replace_external(
        &self,
        content: Vec<u8>,
        name: &str,
        import_path: &str,
        task: &BuildTask,
        wd: &Path,
        eol: &str,
    ) -> Result<Vec<u8>> {
        let pattern = format!("\"{}{}\"", EXTERNAL_SENTINEL, name).into_bytes();
        let segments = split_segments(&content, &pattern);
        if segments.len() == 1 {
            return Ok(content);
        }

        let target_meta = if has_cjs_callsite(&segments) && !is_builtin_node_module(name) {
            self.load_cjs_target_meta(name, task, wd).await
        } else {
            None
        };

        let identifier = identify(name);
        let (buffer, cjs_imports) =
            reconcile_segments(segments, &identifier, import_path, target_meta.as_ref());

        if cjs_imports.is_empty() {
            return Ok(buffer);
        }

        let prelude = import_prelude(&cjs_imports, &identifier, import_path, eol);
        let mut out = prelude.into_bytes();
        out.extend_from_slice(&buffer);
        Ok(out)
    }

    /// The export shape of a require'd external, materialising the package
    /// on demand when the bundled entry pulled in something the original
    /// install did not bring along. Failures degrade to a default import.
    async fn load_cjs_target_meta(
        &self,
        name: &str,
        task: &BuildTask,
        wd: &Path,
    ) -> Option<EsmMeta> {
        let pkg = parse_pkg(name).ok()?;
        let manifest = wd.join("node_modules").join(&pkg.name).join("package.json");
        if !manifest.exists() {
            let spec = format!("{}@{}", pkg.name, pkg.version);
            if let Err(e) = self.installer.add(wd, &[spec]).await {
                warn!("install require'd external {}: {}", name, e);
                return None;
            }
        }
        match init_esm(
            wd,
            &pkg,
            true,
            task.dev_mode,
            self.oracle().as_ref(),
            self.config.oracle_timeout(),
        )
        .await
        {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("resolve require'd external {}: {}", name, e);
                None
            }
        }
    }

    /// Prepend the header comment and, for non-node targets, the runtime
    /// shims for any placeholder identifiers left in the output.
    fn finalize_output(
        &self,
        content: Vec<u8>,
        task: &BuildTask,
        node_env: &str,
        eol: &str,
    ) -> Vec<u8> {
        let mut head = format!(
            "/* esm.sh - esbuild bundle({}) {} {} */\n",
            task.pkg,
            task.target.as_str(),
            node_env
        );

        if task.target != Target::Node {
            if contains(&content, b"__Process$") {
                head.push_str(&format!(
                    "import __Process$ from \"/v{}/node_process.js\";{}__Process$.env.NODE_ENV=\"{}\";{}",
                    task.build_version, eol, node_env, eol
                ));
            }
            if contains(&content, b"__Buffer$") {
                head.push_str(&format!(
                    "import {{ Buffer as __Buffer$ }} from \"/v{}/node_buffer.js\";{}",
                    task.build_version, eol
                ));
            }
            if contains(&content, b"__global$") {
                head.push_str(&format!(
                    "var __global$ = globalThis || (typeof window !== \"undefined\" ? window : self);{}",
                    eol
                ));
            }
            if contains(&content, b"__setImmediate$") {
                head.push_str(&format!(
                    "var __setImmediate$ = (cb, ...args) => setTimeout(cb, 0, ...args);{}",
                    eol
                ));
            }
            if contains(&content, b"__rResolve$") {
                head.push_str(&format!("var __rResolve$ = p => p;{}", eol));
            }
        }

        let mut out = head.into_bytes();
        out.extend_from_slice(&content);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::NpmPackage;

    #[test]
    fn test_identify() {
        assert_eq!(identify("react"), "react");
        assert_eq!(identify("preact/compat"), "preact_compat");
        assert_eq!(identify("@babel/runtime"), "_babel_runtime");
        assert_eq!(identify("string_decoder"), "string_decoder");
    }

    #[test]
    fn test_split_segments() {
        let segments = split_segments(b"a--b--c", b"--");
        assert_eq!(segments, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let segments = split_segments(b"no match", b"--");
        assert_eq!(segments, vec![b"no match".to_vec()]);
    }

    fn sentinel(name: &str) -> String {
        format!("\"{}{}\"", EXTERNAL_SENTINEL, name)
    }

    #[test]
    fn test_plain_import_replacement() {
        let content = format!("import react from {};export default react;", sentinel("react"));
        let segments = split_segments(content.as_bytes(), sentinel("react").as_bytes());
        let (buffer, imports) =
            reconcile_segments(segments, "react", "/v57/react@17.0.2/es2020/react.js", None);
        assert!(imports.is_empty());
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "import react from \"/v57/react@17.0.2/es2020/react.js\";export default react;"
        );
    }

    #[test]
    fn test_cjs_callsite_default_import() {
        let content = format!("var react = __require({});", sentinel("react"));
        let segments = split_segments(content.as_bytes(), sentinel("react").as_bytes());
        assert!(has_cjs_callsite(&segments));
        let (buffer, imports) =
            reconcile_segments(segments, "react", "/v57/react@17.0.2/es2020/react.js", None);
        assert_eq!(String::from_utf8(buffer).unwrap(), "var react = __react$;");
        assert_eq!(imports.into_iter().collect::<Vec<_>>(), vec!["default"]);
    }

    #[test]
    fn test_cjs_callsite_known_named_export() {
        // require('htmlparser').Parser where Parser is a known export
        let meta = EsmMeta {
            exports: vec!["Parser".to_string(), "DefaultHandler".to_string()],
            export_default: true,
            ..Default::default()
        };
        let content = format!("var P = __req({}).Parser;", sentinel("htmlparser"));
        let segments = split_segments(content.as_bytes(), sentinel("htmlparser").as_bytes());
        let (buffer, imports) = reconcile_segments(
            segments,
            "htmlparser",
            "/v57/htmlparser@2.0.0/es2020/htmlparser.js",
            Some(&meta),
        );
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "var P = __htmlparser$Parser;"
        );
        assert_eq!(imports.into_iter().collect::<Vec<_>>(), vec!["Parser"]);
    }

    #[test]
    fn test_cjs_callsite_star_import_for_esm_without_default() {
        let meta = EsmMeta {
            package: NpmPackage {
                module: "es/index.js".to_string(),
                ..Default::default()
            },
            export_default: false,
            ..Default::default()
        };
        let content = format!("var ns = __req({}).helper;", sentinel("util-kit"));
        let segments = split_segments(content.as_bytes(), sentinel("util-kit").as_bytes());
        let (buffer, imports) = reconcile_segments(
            segments,
            "util_kit",
            "/v57/util-kit@1.0.0/es2020/util-kit.js",
            Some(&meta),
        );
        // the property access survives on the namespace binding
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "var ns = __util_kit$.helper;"
        );
        assert_eq!(imports.into_iter().collect::<Vec<_>>(), vec!["*"]);
    }

    #[test]
    fn test_dynamic_import_not_treated_as_require() {
        let content = format!("const p = import({});", sentinel("react"));
        let segments = split_segments(content.as_bytes(), sentinel("react").as_bytes());
        assert!(!has_cjs_callsite(&segments));
        let (buffer, imports) =
            reconcile_segments(segments, "react", "/v57/react@17.0.2/es2020/react.js", None);
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "const p = import(\"/v57/react@17.0.2/es2020/react.js\");"
        );
        assert!(imports.is_empty());
    }

    #[test]
    fn test_multiple_callsites_deduplicate_bindings() {
        let content = format!(
            "var a = __req({});var b = __req2({});",
            sentinel("react"),
            sentinel("react")
        );
        let segments = split_segments(content.as_bytes(), sentinel("react").as_bytes());
        let (buffer, imports) =
            reconcile_segments(segments, "react", "/v57/react@17.0.2/es2020/react.js", None);
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "var a = __react$;var b = __react$;"
        );
        assert_eq!(imports.len(), 1);
    }

    #[test]
    fn test_import_prelude() {
        let mut imports = BTreeSet::new();
        imports.insert("default".to_string());
        imports.insert("Parser".to_string());
        let prelude = import_prelude(&imports, "htmlparser", "/v57/htmlparser.js", "\n");
        assert_eq!(
            prelude,
            "import { Parser as __htmlparser$Parser } from \"/v57/htmlparser.js\";\nimport __htmlparser$ from \"/v57/htmlparser.js\";\n"
        );

        let mut star = BTreeSet::new();
        star.insert("*".to_string());
        let prelude = import_prelude(&star, "kit", "/v57/kit.js", "");
        assert_eq!(prelude, "import * as __kit$ from \"/v57/kit.js\";");
    }
}
