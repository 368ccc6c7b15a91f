//! Registry client for upstream package metadata.
//!
//! The engine only needs enough of the registry surface to turn a package
//! name plus a version hint (concrete version, range, or dist-tag) into a
//! concrete manifest. Materialised packages in the working directory are
//! always preferred over a network round trip.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::{EsmdError, Result};
use crate::package::{fix_npm_package, NpmPackage};

/// Default NPM registry URL.
pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";

/// Registry metadata for one package: all versions plus dist-tags.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistryPackage {
    pub name: String,

    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,

    #[serde(default)]
    pub versions: BTreeMap<String, NpmPackage>,
}

/// Registry client with an in-process metadata cache.
#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    registry_url: String,
    cache: Arc<dashmap::DashMap<String, RegistryPackage>>,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(registry_url: Option<&str>) -> Result<Self> {
        let registry_url = registry_url
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .user_agent(format!("esmd/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            registry_url,
            cache: Arc::new(dashmap::DashMap::new()),
        })
    }

    /// Get the registry URL.
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Fetch package metadata from the registry.
    #[instrument(skip(self))]
    pub async fn get_package(&self, name: &str) -> Result<RegistryPackage> {
        if let Some(pkg) = self.cache.get(name) {
            debug!("cache hit for {}", name);
            return Ok(pkg.clone());
        }

        let url = format!("{}/{}", self.registry_url, encode_package_name(name));
        debug!("fetching package metadata from {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EsmdError::PackageNotFound(name.to_string()));
        }

        if !response.status().is_success() {
            return Err(EsmdError::Registry(format!(
                "Failed to fetch {}: HTTP {}",
                name,
                response.status()
            )));
        }

        let package: RegistryPackage = response.json().await?;
        self.cache.insert(name.to_string(), package.clone());

        Ok(package)
    }

    /// Resolve a version hint (concrete version, semver range, or dist-tag)
    /// against the registry and return the matching manifest.
    pub async fn resolve_version(&self, name: &str, hint: &str) -> Result<NpmPackage> {
        let package = self.get_package(name).await?;

        let hint = if hint.is_empty() { "latest" } else { hint };

        // dist-tag or exact version first
        if let Some(version) = package.dist_tags.get(hint) {
            if let Some(p) = package.versions.get(version) {
                return Ok(fix_npm_package(p.clone()));
            }
        }
        if let Some(p) = package.versions.get(hint) {
            return Ok(fix_npm_package(p.clone()));
        }

        // semver range: highest matching version wins
        if let Ok(req) = semver::VersionReq::parse(hint) {
            let mut best: Option<(semver::Version, &NpmPackage)> = None;
            for (version, p) in &package.versions {
                if let Ok(v) = semver::Version::parse(version) {
                    if req.matches(&v) && best.as_ref().map(|(b, _)| v > *b).unwrap_or(true) {
                        best = Some((v, p));
                    }
                }
            }
            if let Some((_, p)) = best {
                return Ok(fix_npm_package(p.clone()));
            }
        }

        Err(EsmdError::VersionNotFound {
            package: name.to_string(),
            version: hint.to_string(),
        })
    }

    /// Resolve a specifier (possibly `name/submodule`) to a concrete
    /// manifest, preferring the copy already materialised under
    /// `wd/node_modules` over the registry.
    pub async fn get_package_info(
        &self,
        wd: &Path,
        specifier: &str,
        version_hint: &str,
    ) -> Result<(NpmPackage, Option<String>)> {
        let (name, submodule) = split_specifier(specifier);

        let manifest = wd.join("node_modules").join(&name).join("package.json");
        if manifest.exists() {
            let p = fix_npm_package(NpmPackage::read(&manifest)?);
            return Ok((p, submodule));
        }

        let p = self.resolve_version(&name, version_hint).await?;
        Ok((p, submodule))
    }

    /// Clear the metadata cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Split a specifier into package name and submodule, scope-aware.
pub fn split_specifier(specifier: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = specifier.split('/').collect();
    if specifier.starts_with('@') {
        if parts.len() >= 2 {
            let name = format!("{}/{}", parts[0], parts[1]);
            let sub = parts[2..].join("/");
            (name, if sub.is_empty() { None } else { Some(sub) })
        } else {
            (specifier.to_string(), None)
        }
    } else {
        let name = parts[0].to_string();
        let sub = parts[1..].join("/");
        (name, if sub.is_empty() { None } else { Some(sub) })
    }
}

/// Encode a package name for use in URLs.
fn encode_package_name(name: &str) -> String {
    if name.starts_with('@') {
        // Scoped package: @scope/name -> @scope%2Fname
        name.replace('/', "%2F")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_package_name() {
        assert_eq!(encode_package_name("lodash"), "lodash");
        assert_eq!(encode_package_name("@types/node"), "@types%2Fnode");
    }

    #[test]
    fn test_split_specifier() {
        assert_eq!(split_specifier("react"), ("react".to_string(), None));
        assert_eq!(
            split_specifier("preact/compat"),
            ("preact".to_string(), Some("compat".to_string()))
        );
        assert_eq!(
            split_specifier("@babel/runtime/helpers/esm/extends"),
            (
                "@babel/runtime".to_string(),
                Some("helpers/esm/extends".to_string())
            )
        );
        assert_eq!(
            split_specifier("@types/node"),
            ("@types/node".to_string(), None)
        );
    }
}
