//! # esmd
//!
//! Build engine for an on-demand npm-to-ESM delivery CDN. Given a
//! fully-qualified build request, the engine materialises the package
//! from the upstream registry, resolves its module entry, bundles it
//! behind an externalising resolver, rewrites the output so every
//! external reference points at another artifact of the same engine,
//! patches runtime shims, and persists the result into a
//! content-addressed blob store indexed by a metadata record.
//!
//! The HTTP front-end, the bundler, the stores, and the declaration
//! copier are collaborators behind traits; the engine owns the build
//! semantics.

pub mod build;
pub mod bundler;
pub mod cli;
pub mod config;
pub mod dts;
pub mod error;
pub mod install;
pub mod module_lexer;
pub mod nodejs;
pub mod oracle;
pub mod package;
pub mod plugin;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod rewriter;
pub mod store;

pub use build::{parse_build_path, start_workers, BuildTask, Engine};
pub use bundler::{BundleOptions, BundleResult, Bundler, ImportResolver, Resolution, Target};
pub use error::{EsmdError, Result};
pub use package::{parse_pkg, Pkg};
pub use resolver::EsmMeta;
