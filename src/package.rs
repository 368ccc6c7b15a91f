//! Package coordinates and package.json model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{EsmdError, Result};

/// A fully-qualified package coordinate: `name@version` plus an optional
/// submodule path inside the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pkg {
    /// Package name, optionally scoped (`@scope/name`)
    pub name: String,

    /// Concrete version string (never a range at this layer)
    pub version: String,

    /// Submodule path with no leading `./`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submodule: Option<String>,
}

impl Pkg {
    /// Create a coordinate without a submodule.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            submodule: None,
        }
    }

    /// The specifier used to import this package: `name` or `name/submodule`.
    pub fn import_path(&self) -> String {
        match &self.submodule {
            Some(sub) => format!("{}/{}", self.name, sub),
            None => self.name.clone(),
        }
    }

    /// The base name used as the artifact leaf: the submodule if present,
    /// otherwise the last path segment of the package name.
    pub fn base_name(&self) -> String {
        match &self.submodule {
            Some(sub) => sub.clone(),
            None => self
                .name
                .rsplit('/')
                .next()
                .unwrap_or(&self.name)
                .to_string(),
        }
    }
}

impl fmt::Display for Pkg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        if let Some(sub) = &self.submodule {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

/// Parse a package specifier of the form `name[@version][/submodule]`,
/// including scoped names. A missing version becomes `latest`.
pub fn parse_pkg(specifier: &str) -> Result<Pkg> {
    let specifier = specifier.trim_start_matches('/');
    if specifier.is_empty() {
        return Err(EsmdError::PackageNotFound(specifier.to_string()));
    }

    // Split off the scope so the version separator search skips the
    // leading `@` of scoped names.
    let (scope, rest) = if let Some(rest) = specifier.strip_prefix('@') {
        match rest.split_once('/') {
            Some((scope, tail)) => (Some(scope), tail),
            None => return Err(EsmdError::PackageNotFound(specifier.to_string())),
        }
    } else {
        (None, specifier)
    };

    let (name_part, version_part) = match rest.split_once('@') {
        Some((n, v)) => (n, Some(v)),
        None => (rest, None),
    };

    let (base_name, submodule, version) = match version_part {
        Some(v) => {
            // version may itself be followed by a submodule path
            match v.split_once('/') {
                Some((ver, sub)) => (name_part, Some(sub.to_string()), ver.to_string()),
                None => (name_part, None, v.to_string()),
            }
        }
        None => match name_part.split_once('/') {
            Some((n, sub)) => (n, Some(sub.to_string()), "latest".to_string()),
            None => (name_part, None, "latest".to_string()),
        },
    };

    if base_name.is_empty() || version.is_empty() {
        return Err(EsmdError::PackageNotFound(specifier.to_string()));
    }

    let name = match scope {
        Some(scope) => format!("@{}/{}", scope, base_name),
        None => base_name.to_string(),
    };

    Ok(Pkg {
        name,
        version,
        submodule: submodule.filter(|s| !s.is_empty()),
    })
}

/// The subset of package.json the engine reads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NpmPackage {
    /// Package name
    #[serde(default)]
    pub name: String,

    /// Package version
    #[serde(default)]
    pub version: String,

    /// Package type (commonjs or module)
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub package_type: String,

    /// CommonJS entry point
    #[serde(default)]
    pub main: String,

    /// ES module entry point
    #[serde(default)]
    pub module: String,

    /// TypeScript types entry point
    #[serde(default)]
    pub types: String,

    /// Alternative types field
    #[serde(default)]
    pub typings: String,

    /// The conditional-exports map, kept raw; consulted by the entry
    /// resolver and the externalising resolver
    #[serde(rename = "exports", default, skip_serializing)]
    pub defined_exports: Option<serde_json::Value>,

    /// Production dependencies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,

    /// Peer dependencies
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peer_dependencies: BTreeMap<String, String>,
}

impl NpmPackage {
    /// Read package.json from a file path.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse package.json from a string.
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| EsmdError::InvalidPackageJson(e.to_string()))
    }
}

/// Normalise a parsed manifest: pick the ES module entry out of the
/// `type` field, an `.mjs` main, or the root key of the exports map.
pub fn fix_npm_package(mut p: NpmPackage) -> NpmPackage {
    if let Some(exports) = p.defined_exports.clone() {
        match &exports {
            serde_json::Value::String(s) => {
                if p.package_type == "module" || s.ends_with(".mjs") {
                    if p.module.is_empty() {
                        p.module = s.clone();
                    }
                } else if p.main.is_empty() {
                    p.main = s.clone();
                }
            }
            serde_json::Value::Object(m) => {
                if let Some(root) = m.get(".") {
                    resolve_defined_exports(&mut p, root);
                }
            }
            _ => {}
        }
    }

    if p.module.is_empty() && (p.package_type == "module" || p.main.ends_with(".mjs")) {
        p.module = std::mem::take(&mut p.main);
    }

    p
}

/// Apply one entry of the exports map onto the manifest fields: the
/// `import`/`module` conditions feed `module`, `require`/`default` feed
/// `main`, `types` feeds `types`. A bare string counts as `main` unless
/// the package is declared a module.
pub fn resolve_defined_exports(p: &mut NpmPackage, value: &serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if p.package_type == "module" || s.ends_with(".mjs") {
                p.module = s.clone();
            } else {
                p.main = s.clone();
            }
        }
        serde_json::Value::Object(m) => {
            for (condition, v) in m {
                let Some(s) = v.as_str() else { continue };
                match condition.as_str() {
                    "import" | "module" => p.module = s.to_string(),
                    "require" => p.main = s.to_string(),
                    "types" => p.types = s.to_string(),
                    "default" => {
                        if s.ends_with(".mjs") || p.package_type == "module" {
                            if p.module.is_empty() {
                                p.module = s.to_string();
                            }
                        } else if p.main.is_empty() {
                            p.main = s.to_string();
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
}
