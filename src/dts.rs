//! Type-declaration handling.
//!
//! Types-target requests skip bundling: the entry resolver locates the
//! `.d.ts` entry (falling back to the corresponding `@types/` package)
//! and a copier — an external collaborator behind a trait — mirrors the
//! declarations out of the materialised tree as a side effect. The
//! resulting URL path lands in the metadata record's `dts` field.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::build::{BuildTask, Engine};
use crate::error::{EsmdError, Result};
use crate::package::NpmPackage;
use crate::resolver::EsmMeta;

/// Copies a declaration bundle out of a working directory. Invoked as a
/// side effect; failures never fail the build.
#[async_trait]
pub trait DtsCopier: Send + Sync {
    async fn copy_dts(&self, wd: &Path, resolve_prefix: &str, dts: &str) -> Result<()>;
}

/// Copier that mirrors every `.d.ts` under the package into a types tree
/// rooted at `root`.
pub struct FsDtsCopier {
    root: PathBuf,
}

impl FsDtsCopier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DtsCopier for FsDtsCopier {
    async fn copy_dts(&self, wd: &Path, resolve_prefix: &str, dts: &str) -> Result<()> {
        // dts is `<name>@<version>/<path>.d.ts`
        let (versioned_name, _) = dts
            .split_once('/')
            .ok_or_else(|| EsmdError::Other(format!("invalid dts path: {}", dts)))?;
        let name = versioned_name
            .rsplit_once('@')
            .map(|(n, _)| n)
            .unwrap_or(versioned_name);

        let source_root = wd.join("node_modules").join(name);
        let dest_root = self.root.join(resolve_prefix).join(versioned_name);

        for entry in WalkDir::new(&source_root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ts") {
                continue;
            }
            if !path.to_string_lossy().ends_with(".d.ts") {
                continue;
            }
            let rel = path
                .strip_prefix(&source_root)
                .map_err(|e| EsmdError::Other(e.to_string()))?;
            let dest = dest_root.join(rel);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(path, &dest).await?;
        }

        Ok(())
    }
}

/// Copier that records nothing; used when the host serves declarations
/// elsewhere and in tests.
pub struct NoopDtsCopier;

#[async_trait]
impl DtsCopier for NoopDtsCopier {
    async fn copy_dts(&self, _wd: &Path, _resolve_prefix: &str, _dts: &str) -> Result<()> {
        Ok(())
    }
}

impl Engine {
    /// Locate the declaration entry for this build and hand it to the
    /// copier. Sets `esm.dts` on success; declaration problems never
    /// fail a JS build.
    pub(crate) async fn transform_dts(&self, task: &BuildTask, esm: &mut EsmMeta, wd: &Path) {
        let name = &task.pkg.name;
        let mut submodule = task.pkg.submodule.clone().unwrap_or_default();

        if task.target == crate::bundler::Target::Types {
            if let Some(stripped) = submodule.strip_suffix("~.d.ts") {
                submodule = stripped.to_string();
            }
        }

        let mut dts = String::new();
        if !esm.package.types.is_empty() || !esm.package.typings.is_empty() {
            dts = to_types_path(wd, &esm.package, &submodule);
        } else if !name.starts_with("@types/") && submodule.is_empty() {
            let types_pkg = to_types_package_name(name);
            if let Ok((p, _)) = self.registry.get_package_info(wd, &types_pkg, "latest").await {
                dts = to_types_path(wd, &p, &submodule);
            }
        }

        if dts.ends_with(".d.ts") && !dts.ends_with("~.d.ts") {
            if let Err(e) = self
                .dts_copier
                .copy_dts(wd, &task.resolve_prefix(), &dts)
                .await
            {
                error!("copy dts '{}': {}", dts, e);
                return;
            }
            debug!("copied dts '{}'", dts);
        }

        if !dts.is_empty() {
            esm.dts = format!("/v{}/{}", task.build_version, dts);
        }
    }
}

/// The `<name>@<version>/<path>.d.ts` form of a package's declaration
/// entry, probing `index.d.ts` for directory-shaped entries.
pub fn to_types_path(wd: &Path, p: &NpmPackage, submodule: &str) -> String {
    let types_field = if !p.types.is_empty() {
        p.types.clone()
    } else {
        p.typings.clone()
    };

    let mut candidate = if !submodule.is_empty() {
        submodule.to_string()
    } else if !types_field.is_empty() {
        types_field
    } else {
        "index.d.ts".to_string()
    };
    candidate = candidate.trim_start_matches("./").to_string();

    if !candidate.ends_with(".d.ts") {
        let on_disk = wd.join("node_modules").join(&p.name).join(&candidate);
        if on_disk.is_dir() {
            candidate = format!("{}/index.d.ts", candidate);
        } else {
            candidate = format!(
                "{}.d.ts",
                candidate.trim_end_matches(".js").trim_end_matches(".ts")
            );
        }
    }

    format!("{}@{}/{}", p.name, p.version, candidate)
}

/// `@types/<name>`, flattening a scope into the `scope__name` convention.
pub fn to_types_package_name(name: &str) -> String {
    if let Some(stripped) = name.strip_prefix('@') {
        format!("@types/{}", stripped.replace('/', "__"))
    } else {
        format!("@types/{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_copier_mirrors_declarations() {
        let base = std::env::temp_dir().join(format!("esmd-dts-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let wd = base.join("wd");
        let out = base.join("out");

        let pkg_dir = wd.join("node_modules/demo/lib");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("index.d.ts"), "export {};").unwrap();
        std::fs::write(pkg_dir.join("index.js"), "module.exports = {};").unwrap();

        let copier = FsDtsCopier::new(&out);
        copier
            .copy_dts(&wd, "", "demo@1.0.0/lib/index.d.ts")
            .await
            .unwrap();

        assert!(out.join("demo@1.0.0/lib/index.d.ts").exists());
        // only declarations are mirrored
        assert!(!out.join("demo@1.0.0/lib/index.js").exists());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn test_to_types_package_name() {
        assert_eq!(to_types_package_name("react"), "@types/react");
        assert_eq!(
            to_types_package_name("@babel/core"),
            "@types/babel__core"
        );
    }

    #[test]
    fn test_to_types_path_explicit_field() {
        let p = NpmPackage {
            name: "react".to_string(),
            version: "17.0.2".to_string(),
            types: "index.d.ts".to_string(),
            ..Default::default()
        };
        assert_eq!(
            to_types_path(Path::new("/tmp/none"), &p, ""),
            "react@17.0.2/index.d.ts"
        );
    }

    #[test]
    fn test_to_types_path_submodule() {
        let p = NpmPackage {
            name: "lodash".to_string(),
            version: "4.17.21".to_string(),
            types: "index.d.ts".to_string(),
            ..Default::default()
        };
        assert_eq!(
            to_types_path(Path::new("/tmp/none"), &p, "unescape"),
            "lodash@4.17.21/unescape.d.ts"
        );
    }

    #[test]
    fn test_to_types_path_extension_swap() {
        let p = NpmPackage {
            name: "demo".to_string(),
            version: "1.0.0".to_string(),
            typings: "./lib/main.d.ts".to_string(),
            ..Default::default()
        };
        assert_eq!(
            to_types_path(Path::new("/tmp/none"), &p, ""),
            "demo@1.0.0/lib/main.d.ts"
        );
    }
}
