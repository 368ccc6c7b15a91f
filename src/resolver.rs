//! Entry resolution.
//!
//! Given a materialised package and an optional submodule, decide where
//! bundling starts: the ES module entry if the package ships one, the
//! CommonJS entry otherwise (with its named exports enumerated by the
//! oracle), or a type-declaration file for types-only requests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EsmdError, Result};
use crate::module_lexer::{scan_module, ExportsKind};
use crate::oracle::NodeServices;
use crate::package::{fix_npm_package, resolve_defined_exports, NpmPackage, Pkg};
use crate::store::{build_key, ArtifactStore, MetaStore, StoreRecord};

/// The ES module metadata stored alongside each artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EsmMeta {
    #[serde(flatten)]
    pub package: NpmPackage,

    /// Whether the entry has a meaningful default export
    pub export_default: bool,

    /// Named exports discovered for a CommonJS entry
    pub exports: Vec<String>,

    /// URL path of the type-declaration bundle, if one was produced
    pub dts: String,

    /// Whether a CSS sidecar was emitted
    #[serde(rename = "packageCSS")]
    pub package_css: bool,
}

/// Seed the metadata record for a build and verify the chosen entry.
///
/// With `check_exports` set, an ES entry that fails to parse as a module
/// is demoted to the CommonJS path, and a CommonJS entry has its named
/// exports enumerated by the oracle.
pub async fn init_esm(
    wd: &Path,
    pkg: &Pkg,
    check_exports: bool,
    dev_mode: bool,
    oracle: Option<&Arc<NodeServices>>,
    oracle_timeout: Duration,
) -> Result<EsmMeta> {
    let package_file = wd.join("node_modules").join(&pkg.name).join("package.json");
    let p = NpmPackage::read(&package_file)?;

    let mut esm = EsmMeta {
        package: fix_npm_package(p),
        ..Default::default()
    };

    if let Some(submodule) = &pkg.submodule {
        if submodule.ends_with(".d.ts") {
            esm.package.typings = String::new();
            if let Some(base) = submodule.strip_suffix("~.d.ts") {
                let sub_dir = wd.join("node_modules").join(&esm.package.name).join(base);
                if sub_dir.join("index.d.ts").exists() {
                    esm.package.types = format!("{}/index.d.ts", base);
                } else if Path::new(&format!("{}.d.ts", sub_dir.display())).exists() {
                    esm.package.types = format!("{}.d.ts", base);
                }
            } else {
                esm.package.types = submodule.clone();
            }
        } else {
            let sub_dir = wd
                .join("node_modules")
                .join(&esm.package.name)
                .join(submodule);
            let sub_manifest = sub_dir.join("package.json");
            if sub_manifest.exists() {
                // the submodule ships its own manifest; its fields win,
                // rebased onto the outer package root
                let p2 = NpmPackage::read(&sub_manifest)?;
                let fixed = fix_npm_package(p2.clone());
                esm.package.module = if fixed.module.is_empty() {
                    String::new()
                } else {
                    format!("{}/{}", submodule, fixed.module.trim_start_matches("./"))
                };
                esm.package.main = if p2.main.is_empty() {
                    format!("{}/index.js", submodule)
                } else {
                    format!("{}/{}", submodule, p2.main.trim_start_matches("./"))
                };
                esm.package.types = String::new();
                esm.package.typings = String::new();
                if !p2.types.is_empty() {
                    esm.package.types = format!("{}/{}", submodule, p2.types.trim_start_matches("./"));
                } else if !p2.typings.is_empty() {
                    esm.package.typings =
                        format!("{}/{}", submodule, p2.typings.trim_start_matches("./"));
                } else if sub_dir.join("index.d.ts").exists() {
                    esm.package.types = format!("{}/index.d.ts", submodule);
                } else if Path::new(&format!("{}.d.ts", sub_dir.display())).exists() {
                    esm.package.types = format!("{}.d.ts", submodule);
                }
            } else {
                let mut defined = false;
                if let Some(serde_json::Value::Object(map)) = esm.package.defined_exports.clone() {
                    let want = format!("./{}", submodule);
                    for (name, value) in &map {
                        if *name == want {
                            resolve_defined_exports(&mut esm.package, value);
                            defined = true;
                            break;
                        }
                        if let Some(pattern_prefix) = name.strip_suffix("/*") {
                            let pattern_prefix = format!("{}/", pattern_prefix);
                            if let Some(suffix) = want.strip_prefix(&pattern_prefix) {
                                // substitute the captured suffix into every
                                // string condition value before applying
                                let substituted = match value {
                                    serde_json::Value::Object(conditions) => {
                                        let replaced = conditions
                                            .iter()
                                            .map(|(k, v)| {
                                                let v = match v.as_str() {
                                                    Some(s) => serde_json::Value::String(
                                                        s.replace('*', suffix),
                                                    ),
                                                    None => v.clone(),
                                                };
                                                (k.clone(), v)
                                            })
                                            .collect();
                                        serde_json::Value::Object(replaced)
                                    }
                                    other => other.clone(),
                                };
                                resolve_defined_exports(&mut esm.package, &substituted);
                                defined = true;
                            }
                        }
                    }
                }
                if !defined {
                    if esm.package.module.is_empty() {
                        esm.package.main = submodule.clone();
                    } else {
                        esm.package.module = submodule.clone();
                    }
                    esm.package.types = String::new();
                    esm.package.typings = String::new();
                    if sub_dir.join("index.d.ts").exists() {
                        esm.package.types = format!("{}/index.d.ts", submodule);
                    } else if Path::new(&format!("{}.d.ts", sub_dir.display())).exists() {
                        esm.package.types = format!("{}.d.ts", submodule);
                    }
                }
            }
        }
    }

    if !check_exports {
        return Ok(esm);
    }

    if !esm.package.module.is_empty() {
        match check_esm(wd, &esm.package.name, &esm.package.module) {
            Ok((resolved, export_default)) => {
                esm.package.module = resolved;
                esm.export_default = export_default;
            }
            Err(e) => {
                warn!(
                    "fake module from '{}' of '{}': {}",
                    esm.package.module, esm.package.name, e
                );
                esm.package.module = String::new();
            }
        }
    }

    if esm.package.module.is_empty() {
        let node_env = if dev_mode { "development" } else { "production" };
        let oracle = oracle.ok_or_else(|| {
            EsmdError::Oracle("node services not started".to_string())
        })?;
        let ret = oracle
            .parse_cjs_module_exports(wd, &pkg.import_path(), node_env, oracle_timeout)
            .await?;
        if let Some(error) = ret.error {
            return Err(EsmdError::Oracle(format!("parseCJSModuleExports: {}", error)));
        }
        esm.exports = ret.exports;
        esm.export_default = true;
    }

    Ok(esm)
}

/// Verify that a module entry really is ESM by lexing it; resolve
/// directory entries to their index file on the way.
pub fn check_esm(wd: &Path, package_name: &str, module_specifier: &str) -> Result<(String, bool)> {
    let pkg_dir = wd.join("node_modules").join(package_name);

    let mut specifier = module_specifier.trim_start_matches("./").to_string();
    if pkg_dir.join(&specifier).is_dir() {
        let index_mjs = format!("{}/index.mjs", specifier);
        specifier = if pkg_dir.join(&index_mjs).exists() {
            index_mjs
        } else {
            format!("{}/index.js", specifier)
        };
    }

    let mut filename = pkg_dir.join(&specifier);
    match filename.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("jsx") | Some("ts") | Some("tsx") | Some("mjs") => {}
        _ => filename = pkg_dir.join(format!("{}.js", specifier)),
    }

    let source = std::fs::read_to_string(&filename)
        .map_err(|e| EsmdError::Parse(format!("{}: {}", filename.display(), e)))?;
    let summary = scan_module(&source);
    if summary.kind != ExportsKind::Esm {
        return Err(EsmdError::Parse("not a module".to_string()));
    }

    Ok((specifier, summary.has_default))
}

/// Look up a previously built artifact, repairing orphans on the way: a
/// metadata record without a blob (or an unreadable record) is deleted and
/// treated as absent.
pub async fn find_esm(
    meta_store: &dyn MetaStore,
    artifact_store: &dyn ArtifactStore,
    id: &str,
) -> Result<Option<EsmMeta>> {
    let Some(record) = meta_store.get(id).await? else {
        return Ok(None);
    };

    let esm: EsmMeta = match record
        .get("esm")
        .and_then(|raw| serde_json::from_str(raw).ok())
    {
        Some(esm) => esm,
        None => {
            meta_store.delete(id).await?;
            return Ok(None);
        }
    };

    if !artifact_store.exists(&build_key(id)).await? {
        meta_store.delete(id).await?;
        return Ok(None);
    }

    Ok(Some(esm))
}

/// Serialize a metadata record for the metadata store.
pub fn esm_record(esm: &EsmMeta) -> Result<StoreRecord> {
    let mut record = StoreRecord::new();
    record.insert("esm".to_string(), serde_json::to_string(esm)?);
    Ok(record)
}
