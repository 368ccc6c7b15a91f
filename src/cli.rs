//! CLI argument parsing for esmd.

use clap::{Args, Parser, Subcommand};

/// esmd - build engine for an on-demand npm-to-ESM delivery CDN
#[derive(Parser, Debug)]
#[command(name = "esmd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Set the registry URL
    #[arg(long, global = true, env = "NPM_REGISTRY")]
    pub registry: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the artifact fingerprint for a build request
    Id(RequestArgs),

    /// Print the stored metadata record for a fingerprint
    Meta(KeyArgs),

    /// Delete an artifact and its metadata record
    Purge(KeyArgs),
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Package specifier: name@version[/submodule]
    pub spec: String,

    /// Build target
    #[arg(long, default_value = "es2021")]
    pub target: String,

    /// Engine build version
    #[arg(long, default_value_t = 57)]
    pub build_version: u32,

    /// Development build
    #[arg(long)]
    pub dev: bool,

    /// Inline all non-peer dependencies
    #[arg(long)]
    pub bundle: bool,

    /// Specifier alias, `from:to` (repeatable)
    #[arg(long)]
    pub alias: Vec<String>,

    /// Pinned dependency, `name@version` (repeatable)
    #[arg(long)]
    pub deps: Vec<String>,
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Artifact fingerprint, e.g. v57/react@17.0.2/es2020/react.js
    pub id: String,
}
