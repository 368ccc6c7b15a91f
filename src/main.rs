//! esmd - build engine for an on-demand npm-to-ESM delivery CDN
//!
//! Operational entry point: fingerprint computation and store
//! maintenance. The build surface itself is a library embedded by the
//! serving host, which links the bundler.

use clap::Parser;
use owo_colors::OwoColorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use esmd::build::{parse_build_path, BuildTask};
use esmd::cli::{Cli, Commands, RequestArgs};
use esmd::config::Config;
use esmd::error::{EsmdError, Result};
use esmd::package::{parse_pkg, Pkg};
use esmd::store::{build_key, ArtifactStore, FsArtifactStore, FsMetaStore, MetaStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(registry) = &cli.registry {
        config.registry = registry.clone();
    }

    match &cli.command {
        Commands::Id(args) => {
            let task = task_from_args(args)?;
            println!("{}", task.id());
            Ok(())
        }
        Commands::Meta(args) => {
            let store = FsMetaStore::new(config.storage_dir().join("meta"));
            match store.get(&normalize_id(&args.id)?).await? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(())
                }
                None => Err(EsmdError::NotFound(format!("no record for {}", args.id))),
            }
        }
        Commands::Purge(args) => {
            let id = normalize_id(&args.id)?;
            let blobs = FsArtifactStore::new(config.storage_dir().join("builds-fs"));
            let metas = FsMetaStore::new(config.storage_dir().join("meta"));
            blobs.remove(&build_key(&id)).await?;
            blobs
                .remove(&build_key(&format!(
                    "{}.css",
                    id.strip_suffix(".js").unwrap_or(&id)
                )))
                .await?;
            metas.delete(&id).await?;
            println!("{} {}", "purged".green(), id);
            Ok(())
        }
    }
}

fn normalize_id(id: &str) -> Result<String> {
    // round-trip through the parser to reject malformed keys
    Ok(parse_build_path(id)?.id())
}

fn task_from_args(args: &RequestArgs) -> Result<BuildTask> {
    let pkg = parse_pkg(&args.spec)?;
    let mut task = BuildTask::new(args.build_version, pkg, args.target.parse()?);
    task.dev_mode = args.dev;
    task.bundle_mode = args.bundle;
    for entry in &args.alias {
        let (from, to) = entry
            .split_once(':')
            .ok_or_else(|| EsmdError::Config(format!("invalid alias: {}", entry)))?;
        task.alias.insert(from.to_string(), to.to_string());
    }
    for entry in &args.deps {
        let dep = parse_pkg(entry)?;
        task.deps.push(Pkg::new(dep.name, dep.version));
    }
    Ok(task)
}
