//! The bundler contract.
//!
//! The engine drives a third-party bundler through this seam: it hands over
//! fully-resolved options plus a per-import resolve hook, and gets back
//! in-memory output files or a diagnostic message. The engine owns writing;
//! the bundler never touches the artifact store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EsmdError;

/// Output language target of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Es2015,
    Es2016,
    Es2017,
    Es2018,
    Es2019,
    Es2020,
    Es2021,
    EsNext,
    Node,
    Deno,
    Types,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Es2015 => "es2015",
            Target::Es2016 => "es2016",
            Target::Es2017 => "es2017",
            Target::Es2018 => "es2018",
            Target::Es2019 => "es2019",
            Target::Es2020 => "es2020",
            Target::Es2021 => "es2021",
            Target::EsNext => "esnext",
            Target::Node => "node",
            Target::Deno => "deno",
            Target::Types => "types",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = EsmdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "es2015" => Ok(Target::Es2015),
            "es2016" => Ok(Target::Es2016),
            "es2017" => Ok(Target::Es2017),
            "es2018" => Ok(Target::Es2018),
            "es2019" => Ok(Target::Es2019),
            "es2020" => Ok(Target::Es2020),
            "es2021" => Ok(Target::Es2021),
            "esnext" => Ok(Target::EsNext),
            "node" => Ok(Target::Node),
            "deno" => Ok(Target::Deno),
            "types" => Ok(Target::Types),
            other => Err(EsmdError::InvalidTarget(other.to_string())),
        }
    }
}

/// Bundling platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Browser,
    Node,
}

/// How the bundler loads a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loader {
    Binary,
    DataUrl,
}

/// A synthetic entry fed to the bundler instead of a file on disk.
#[derive(Debug, Clone)]
pub struct StdinInput {
    pub contents: String,
    pub resolve_dir: PathBuf,
    pub sourcefile: String,
}

/// Fully-resolved bundler options.
#[derive(Debug, Clone)]
pub struct BundleOptions {
    /// Entry file, absolute. Exactly one of this and `stdin` is set.
    pub entry_point: Option<PathBuf>,
    pub stdin: Option<StdinInput>,
    pub target: Target,
    pub platform: Platform,
    /// Minify whitespace, identifiers, and syntax
    pub minify: bool,
    /// Global replacements applied before bundling
    pub define: BTreeMap<String, String>,
    /// Per-extension loader overrides
    pub loaders: BTreeMap<String, Loader>,
}

/// One emitted output file.
#[derive(Debug, Clone)]
pub struct OutputFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
}

/// Successful bundler run.
#[derive(Debug, Clone, Default)]
pub struct BundleResult {
    pub files: Vec<OutputFile>,
    pub warnings: Vec<String>,
}

/// First error diagnostic of a failed run.
#[derive(Debug, Clone)]
pub struct BundleFailure {
    pub message: String,
}

/// Per-import decision returned by the resolve hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Bundle the import inline
    Inline,
    /// Leave the import external, keeping the specifier as-is
    External,
    /// Leave the import external under a replacement specifier
    ExternalPath(String),
}

/// Arguments handed to the resolve hook for each import.
#[derive(Debug, Clone)]
pub struct ResolveArgs<'a> {
    /// The import specifier as written
    pub path: &'a str,
    /// Absolute path of the importing file
    pub importer: &'a std::path::Path,
}

/// The hook the bundler consults for every import in the closure of the
/// entry.
pub trait ImportResolver: Send + Sync {
    fn resolve(&self, args: ResolveArgs<'_>) -> Resolution;
}

/// The bundler itself, linked by the host.
pub trait Bundler: Send + Sync {
    fn bundle(
        &self,
        options: &BundleOptions,
        resolver: &dyn ImportResolver,
    ) -> std::result::Result<BundleResult, BundleFailure>;
}

/// Loaders the engine always registers: wasm as binary, fonts and images
/// as data URLs.
pub fn default_loaders() -> BTreeMap<String, Loader> {
    let mut loaders = BTreeMap::new();
    loaders.insert(".wasm".to_string(), Loader::Binary);
    for ext in [".svg", ".png", ".webp", ".ttf", ".eot", ".woff", ".woff2"] {
        loaders.insert(ext.to_string(), Loader::DataUrl);
    }
    loaders
}

/// The define table that keeps bare runtime-builtin references out of the
/// output. Applied for every target except `node`.
pub fn build_define(cdn_domain: &str, artifact_id: &str, node_env: &str) -> BTreeMap<String, String> {
    let dirname = match artifact_id.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => artifact_id,
    };
    let mut define = BTreeMap::new();
    define.insert(
        "__filename".to_string(),
        format!("\"https://{}/{}\"", cdn_domain, artifact_id),
    );
    define.insert(
        "__dirname".to_string(),
        format!("\"https://{}/{}\"", cdn_domain, dirname),
    );
    define.insert("Buffer".to_string(), "__Buffer$".to_string());
    define.insert("process".to_string(), "__Process$".to_string());
    define.insert("setImmediate".to_string(), "__setImmediate$".to_string());
    define.insert("clearImmediate".to_string(), "clearTimeout".to_string());
    define.insert("require.resolve".to_string(), "__rResolve$".to_string());
    define.insert(
        "process.env.NODE_ENV".to_string(),
        format!("\"{}\"", node_env),
    );
    define.insert("global".to_string(), "__global$".to_string());

    let pairs: Vec<(String, String)> = define
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "__filename" | "__dirname" | "global"))
        .map(|(k, v)| (format!("global.{}", k), v.clone()))
        .collect();
    for (k, v) in pairs {
        define.insert(k, v);
    }
    define
}
