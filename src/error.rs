//! Error types for esmd.

use thiserror::Error;

/// Result type for esmd operations.
pub type Result<T> = std::result::Result<T, EsmdError>;

/// Main error type for esmd.
#[derive(Error, Debug)]
pub enum EsmdError {
    /// Package not found in registry
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Version not found for package
    #[error("Version {version} not found for package {package}")]
    VersionNotFound { package: String, version: String },

    /// A specifier required by the output could not be resolved to any artifact
    #[error("{0}")]
    NotFound(String),

    /// The package materialiser exited non-zero
    #[error("install: {0}")]
    Install(String),

    /// The entry could not be parsed as a module
    #[error("parse: {0}")]
    Parse(String),

    /// The CJS export oracle returned an error
    #[error("node services: {0}")]
    Oracle(String),

    /// Unrecoverable bundler diagnostic
    #[error("esbuild: {0}")]
    Bundle(String),

    /// Artifact or metadata store failure
    #[error("storage: {0}")]
    Store(String),

    /// Invalid package.json
    #[error("Invalid package.json: {0}")]
    InvalidPackageJson(String),

    /// Invalid build target
    #[error("Invalid build target: {0}")]
    InvalidTarget(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Semver parsing error
    #[error("Invalid version: {0}")]
    Semver(#[from] semver::Error),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// General error with message
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for EsmdError {
    fn from(err: anyhow::Error) -> Self {
        EsmdError::Other(err.to_string())
    }
}

impl From<&str> for EsmdError {
    fn from(s: &str) -> Self {
        EsmdError::Other(s.to_string())
    }
}

impl From<String> for EsmdError {
    fn from(s: String) -> Self {
        EsmdError::Other(s)
    }
}
