//! The build orchestrator.
//!
//! `Engine::build` turns a fully-qualified build request into a stored
//! artifact: look up the fingerprint, materialise the package on a miss,
//! resolve the entry, bundle with the externalising resolver, rewrite the
//! output, and persist blob plus metadata. Sibling submodules build
//! inline inside the same working directory; cross-package externals go
//! onto the background queue.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tracing::{debug, instrument, warn};

use crate::bundler::{
    build_define, default_loaders, BundleOptions, BundleResult, Bundler, Platform, StdinInput,
    Target,
};
use crate::config::Config;
use crate::dts::DtsCopier;
use crate::error::{EsmdError, Result};
use crate::install::PackageInstaller;
use crate::oracle::NodeServices;
use crate::package::Pkg;
use crate::plugin::ExternalResolver;
use crate::queue::BuildQueue;
use crate::registry::RegistryClient;
use crate::resolver::{esm_record, find_esm, init_esm, EsmMeta};
use crate::store::{build_key, ArtifactStore, MetaStore};

/// A fully-resolved build request. Uniquely determines one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    /// Advanced whenever the engine's output shape changes
    pub build_version: u32,
    pub pkg: Pkg,
    /// Specifier replacements applied inside the dependency closure
    pub alias: BTreeMap<String, String>,
    /// Pinned transitive-dependency versions
    pub deps: Vec<Pkg>,
    pub target: Target,
    /// Inline every non-peer dependency
    pub bundle_mode: bool,
    /// Development define values, no minification
    pub dev_mode: bool,
}

impl BuildTask {
    pub fn new(build_version: u32, pkg: Pkg, target: Target) -> Self {
        Self {
            build_version,
            pkg,
            alias: BTreeMap::new(),
            deps: Vec::new(),
            target,
            bundle_mode: false,
            dev_mode: false,
        }
    }

    /// The `X-<base64url>/` path segment encoding aliases and pinned
    /// deps, or empty when there are none. Key order never matters:
    /// both sections are sorted before encoding.
    pub fn resolve_prefix(&self) -> String {
        let mut sections = Vec::new();
        if !self.alias.is_empty() {
            let entries: Vec<String> = self
                .alias
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect();
            sections.push(format!("alias:{}", entries.join(",")));
        }
        if !self.deps.is_empty() {
            let mut entries: Vec<String> = self
                .deps
                .iter()
                .map(|p| format!("{}@{}", p.name, p.version))
                .collect();
            entries.sort();
            sections.push(format!("deps:{}", entries.join(",")));
        }
        if sections.is_empty() {
            return String::new();
        }
        format!("X-{}/", URL_SAFE_NO_PAD.encode(sections.join(",")))
    }

    /// The artifact fingerprint: storage key and public URL path.
    pub fn id(&self) -> String {
        let mut name = self.pkg.base_name();
        if let Some(stripped) = name.strip_suffix(".js") {
            name = stripped.to_string();
        }
        if self.dev_mode {
            name.push_str(".development");
        }
        if self.bundle_mode {
            name.push_str(".bundle");
        }

        let id = format!(
            "v{}/{}@{}/{}{}/{}.js",
            self.build_version,
            self.pkg.name,
            self.pkg.version,
            self.resolve_prefix(),
            self.target.as_str(),
            name
        );
        if self.target == Target::Types {
            id.strip_suffix(".js").unwrap_or(&id).to_string()
        } else {
            id
        }
    }

    /// The URL emitted into rewritten output for `pkg`, carrying this
    /// task's resolve prefix when the external extends the alias scope.
    pub fn import_path_for(&self, pkg: &Pkg, extends_alias: bool) -> String {
        let mut name = pkg.base_name();
        if let Some(stripped) = name.strip_suffix(".js") {
            name = stripped.to_string();
        }
        if self.dev_mode {
            name.push_str(".development");
        }

        let resolve_prefix = if extends_alias {
            self.resolve_prefix()
        } else {
            String::new()
        };

        format!(
            "/v{}/{}@{}/{}{}/{}.js",
            self.build_version,
            pkg.name,
            pkg.version,
            resolve_prefix,
            self.target.as_str(),
            name
        )
    }
}

/// Parse a fingerprint path back into the build request that produced it.
pub fn parse_build_path(path: &str) -> Result<BuildTask> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if parts.len() < 4 {
        return Err(EsmdError::Other(format!("invalid build path: {}", path)));
    }

    let build_version: u32 = parts[0]
        .strip_prefix('v')
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| EsmdError::Other(format!("invalid build path: {}", path)))?;

    // scoped names span two segments
    let name_end = if parts[1].starts_with('@') { 3 } else { 2 };
    if parts.len() < name_end + 2 {
        return Err(EsmdError::Other(format!("invalid build path: {}", path)));
    }
    let name_version = parts[1..name_end].join("/");
    let (name, version) = name_version
        .rsplit_once('@')
        .ok_or_else(|| EsmdError::Other(format!("invalid build path: {}", path)))?;

    let mut cursor = name_end;
    let (alias, deps) = if parts[cursor].starts_with("X-") {
        let decoded = decode_resolve_prefix(parts[cursor].trim_start_matches("X-"))?;
        cursor += 1;
        decoded
    } else {
        (BTreeMap::new(), Vec::new())
    };

    if parts.len() < cursor + 2 {
        return Err(EsmdError::Other(format!("invalid build path: {}", path)));
    }
    let target: Target = parts[cursor].parse()?;
    cursor += 1;

    let mut leaf = parts[cursor..].join("/");
    if target != Target::Types {
        leaf = leaf
            .strip_suffix(".js")
            .map(str::to_string)
            .unwrap_or(leaf);
    }
    let bundle_mode = if let Some(stripped) = leaf.strip_suffix(".bundle") {
        leaf = stripped.to_string();
        true
    } else {
        false
    };
    let dev_mode = if let Some(stripped) = leaf.strip_suffix(".development") {
        leaf = stripped.to_string();
        true
    } else {
        false
    };

    let base = name.rsplit('/').next().unwrap_or(name);
    let submodule = if leaf == base { None } else { Some(leaf) };

    Ok(BuildTask {
        build_version,
        pkg: Pkg {
            name: name.to_string(),
            version: version.to_string(),
            submodule,
        },
        alias,
        deps,
        target,
        bundle_mode,
        dev_mode,
    })
}

fn decode_resolve_prefix(encoded: &str) -> Result<(BTreeMap<String, String>, Vec<Pkg>)> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| EsmdError::Other(format!("invalid resolve prefix: {}", e)))?;
    let canon = String::from_utf8(raw)
        .map_err(|e| EsmdError::Other(format!("invalid resolve prefix: {}", e)))?;

    let mut alias = BTreeMap::new();
    let mut deps = Vec::new();
    let mut in_deps = false;
    for token in canon.split(',') {
        let token = if let Some(rest) = token.strip_prefix("alias:") {
            in_deps = false;
            rest
        } else if let Some(rest) = token.strip_prefix("deps:") {
            in_deps = true;
            rest
        } else {
            token
        };
        if token.is_empty() {
            continue;
        }
        if in_deps {
            if let Some((name, version)) = token.rsplit_once('@') {
                deps.push(Pkg::new(name, version));
            }
        } else if let Some((from, to)) = token.split_once(':') {
            alias.insert(from.to_string(), to.to_string());
        }
    }
    Ok((alias, deps))
}

/// How the bundler retry loop reacts to a diagnostic.
#[derive(Debug)]
pub(crate) enum RetryDecision {
    /// Mark the named specifier external and run again
    ExtraExternal(String),
    /// Swap in a synthetic default-only entry and run again
    StdinEntry,
    /// Give up with this error
    Fatal(EsmdError),
}

/// Classify a bundler diagnostic. Resolution failures for anything but
/// the package being built are recoverable once per name; a missing
/// default export is recoverable once per build.
pub(crate) fn classify_bundle_error(message: &str, entry_specifier: &str) -> RetryDecision {
    if message.starts_with("Could not resolve \"")
        && message.contains("mark it as external to exclude it from the bundle")
    {
        if message.contains(&format!("Could not resolve \"{}\"", entry_specifier)) {
            return RetryDecision::Fatal(EsmdError::NotFound(format!(
                "Could not resolve \"{}\"",
                entry_specifier
            )));
        }
        if let Some(name) = message.split('"').nth(1) {
            return RetryDecision::ExtraExternal(name.to_string());
        }
    }
    if message.starts_with("No matching export in \"") && message.contains("for import \"default\"")
    {
        return RetryDecision::StdinEntry;
    }
    RetryDecision::Fatal(EsmdError::Bundle(message.to_string()))
}

/// Hard cap on bundler runs per build; the per-signature rules make each
/// retry productive, this bounds them outright.
const MAX_BUNDLE_ATTEMPTS: usize = 10;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The engine handle: owns the stores, the registry client, the install
/// command, the bundler seam, the oracle, and the background queue.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) registry: RegistryClient,
    pub(crate) installer: PackageInstaller,
    pub(crate) bundler: Arc<dyn Bundler>,
    pub(crate) artifact_store: Arc<dyn ArtifactStore>,
    pub(crate) meta_store: Arc<dyn MetaStore>,
    pub(crate) dts_copier: Arc<dyn DtsCopier>,
    pub(crate) oracle: RwLock<Option<Arc<NodeServices>>>,
    pub(crate) queue: BuildQueue,
}

impl Engine {
    pub fn new(
        config: Config,
        bundler: Arc<dyn Bundler>,
        artifact_store: Arc<dyn ArtifactStore>,
        meta_store: Arc<dyn MetaStore>,
        dts_copier: Arc<dyn DtsCopier>,
    ) -> Result<Arc<Self>> {
        let registry = RegistryClient::new(Some(&config.registry))?;
        let installer = PackageInstaller::new(&config.install_command, &config.registry);
        let queue = BuildQueue::new(config.queue_capacity);
        Ok(Arc::new(Self {
            config,
            registry,
            installer,
            bundler,
            artifact_store,
            meta_store,
            dts_copier,
            oracle: RwLock::new(None),
            queue,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn oracle(&self) -> Option<Arc<NodeServices>> {
        self.oracle.read().clone()
    }

    /// Materialise the oracle's service packages, spawn the sidecar, and
    /// accept export queries from then on.
    pub async fn start_node_services(&self) -> Result<()> {
        let wd = self.config.work_dir().join("ns");
        let services = NodeServices::start(&wd, &self.config.node_services, &self.installer).await?;
        *self.oracle.write() = Some(services);
        Ok(())
    }

    /// Push a cross-package subtask onto the background queue. Submission
    /// never blocks; a full queue drops the task with a warning.
    pub fn enqueue(&self, task: BuildTask) {
        self.queue.submit(task);
    }

    /// Build one artifact, or return it from the stores when it already
    /// exists.
    #[instrument(skip(self, task), fields(id = %task.id()))]
    pub async fn build(&self, task: &BuildTask) -> Result<EsmMeta> {
        let id = task.id();
        if let Some(esm) = find_esm(self.meta_store.as_ref(), self.artifact_store.as_ref(), &id)
            .await?
        {
            debug!("hit {}", id);
            return Ok(esm);
        }

        let digest = hex_string(Sha1::digest(id.as_bytes()).as_slice());
        let suffix = format!(
            "{:x}{:x}",
            std::process::id(),
            SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let wd = self
            .config
            .work_dir()
            .join(format!("esm-build-{}-{}", digest, suffix));
        tokio::fs::create_dir_all(&wd).await?;

        let result = self.build_in_dir(task, &wd).await;

        if let Err(e) = tokio::fs::remove_dir_all(&wd).await {
            warn!("clean build({}) dir: {}", id, e);
        }

        result
    }

    async fn build_in_dir(&self, task: &BuildTask, wd: &Path) -> Result<EsmMeta> {
        self.installer
            .add(wd, &[format!("{}@{}", task.pkg.name, task.pkg.version)])
            .await?;

        let mut tracing = HashSet::new();
        self.build_inner(task, wd, &mut tracing)
            .await?
            .ok_or_else(|| EsmdError::Other(format!("build {} produced nothing", task.id())))
    }

    /// The recursive build routine. Returns `Ok(None)` when this
    /// fingerprint is already being built higher up the stack; the outer
    /// invocation owns persistence.
    pub(crate) fn build_inner<'a>(
        &'a self,
        task: &'a BuildTask,
        wd: &'a Path,
        tracing: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<Option<EsmMeta>>> {
        async move {
            let id = task.id();
            if tracing.contains(&id) {
                return Ok(None);
            }
            tracing.insert(id.clone());

            let mut esm = init_esm(
                wd,
                &task.pkg,
                task.target != Target::Types,
                task.dev_mode,
                self.oracle().as_ref(),
                self.config.oracle_timeout(),
            )
            .await?;

            if task.target == Target::Types {
                self.transform_dts(task, &mut esm, wd).await;
                return Ok(Some(esm));
            }

            let node_env = if task.dev_mode {
                "development"
            } else {
                "production"
            };
            let eol = if task.dev_mode { "\n" } else { "" };

            let mut entry_point: Option<PathBuf> = None;
            let mut stdin: Option<StdinInput> = None;
            if esm.package.module.is_empty() {
                // synthesise an ESM facade over the CommonJS entry
                let import_path = task.pkg.import_path();
                let mut contents = String::new();
                if !esm.exports.is_empty() {
                    contents.push_str(&format!(
                        "import * as __star from \"{}\";\n",
                        import_path
                    ));
                    contents.push_str(&format!(
                        "export const {{ {} }} = __star;\n",
                        esm.exports.join(",")
                    ));
                }
                contents.push_str(&format!("export {{ default }} from \"{}\";", import_path));
                stdin = Some(StdinInput {
                    contents,
                    resolve_dir: wd.to_path_buf(),
                    sourcefile: "mod.js".to_string(),
                });
            } else {
                entry_point = Some(
                    wd.join("node_modules")
                        .join(&esm.package.name)
                        .join(&esm.package.module),
                );
            }

            let external = Arc::new(Mutex::new(BTreeSet::new()));
            let extra_external = Arc::new(Mutex::new(HashSet::new()));
            let mut stdin_retried = false;
            let mut result: Option<BundleResult> = None;

            for _ in 0..MAX_BUNDLE_ATTEMPTS {
                let resolver = ExternalResolver::new(
                    wd,
                    &esm.package.name,
                    &task.pkg.import_path(),
                    task.alias.clone(),
                    task.bundle_mode,
                    esm.package.peer_dependencies.keys().cloned().collect(),
                    esm.package.defined_exports.clone(),
                    external.clone(),
                    extra_external.clone(),
                );
                let platform = if task.target == Target::Node {
                    Platform::Node
                } else {
                    Platform::Browser
                };
                let define = if platform == Platform::Node {
                    BTreeMap::new()
                } else {
                    build_define(&self.config.cdn_domain, &id, node_env)
                };
                let options = BundleOptions {
                    entry_point: entry_point.clone(),
                    stdin: stdin.clone(),
                    target: task.target,
                    platform,
                    minify: !task.dev_mode,
                    define,
                    loaders: default_loaders(),
                };

                match self.bundler.bundle(&options, &resolver) {
                    Ok(r) => {
                        for w in &r.warnings {
                            warn!("esbuild({}): {}", id, w);
                        }
                        result = Some(r);
                        break;
                    }
                    Err(failure) => {
                        match classify_bundle_error(&failure.message, &task.pkg.import_path()) {
                            RetryDecision::ExtraExternal(name) => {
                                let already = !extra_external.lock().insert(name.clone());
                                if already {
                                    return Err(EsmdError::Bundle(failure.message));
                                }
                                warn!("esbuild({}): {}", id, failure.message);
                                external.lock().insert(name);
                            }
                            RetryDecision::StdinEntry => {
                                if stdin_retried {
                                    return Err(EsmdError::Bundle(failure.message));
                                }
                                stdin_retried = true;
                                entry_point = None;
                                stdin = Some(StdinInput {
                                    contents: format!(
                                        "import \"{}\";export default null;",
                                        task.pkg.import_path()
                                    ),
                                    resolve_dir: wd.to_path_buf(),
                                    sourcefile: "mod.js".to_string(),
                                });
                            }
                            RetryDecision::Fatal(err) => return Err(err),
                        }
                    }
                }
            }

            let result =
                result.ok_or_else(|| EsmdError::Bundle("retry limit reached".to_string()))?;

            let externals: Vec<String> = external.lock().iter().cloned().collect();
            for file in &result.files {
                let ext = file.path.extension().and_then(|e| e.to_str());
                if ext == Some("js") {
                    let rewritten = self
                        .rewrite_js_output(
                            file.contents.clone(),
                            &externals,
                            task,
                            &esm,
                            wd,
                            tracing,
                            node_env,
                            eol,
                        )
                        .await?;
                    self.artifact_store
                        .write(&build_key(&id), &rewritten)
                        .await?;
                } else if ext == Some("css") {
                    let css_key = build_key(&format!(
                        "{}.css",
                        id.strip_suffix(".js").unwrap_or(&id)
                    ));
                    self.artifact_store.write(&css_key, &file.contents).await?;
                    esm.package_css = true;
                }
            }

            self.transform_dts(task, &mut esm, wd).await;

            self.meta_store
                .put(&id, "build", esm_record(&esm)?)
                .await?;

            debug!("built {} {} {}", task.pkg, task.target.as_str(), node_env);
            Ok(Some(esm))
        }
        .boxed()
    }
}

/// Spawn the worker pool that drains the background queue.
pub fn start_workers(engine: Arc<Engine>) {
    let count = engine.config.workers.max(1);
    crate::queue::start_workers(engine, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::{BundleFailure, ImportResolver, OutputFile, ResolveArgs};
    use crate::dts::NoopDtsCopier;
    use crate::store::{MemoryArtifactStore, MemoryMetaStore};
    use std::sync::atomic::AtomicUsize;

    fn pkg(name: &str, version: &str) -> Pkg {
        Pkg::new(name, version)
    }

    #[test]
    fn test_fingerprint_basic() {
        let task = BuildTask::new(57, pkg("react", "17.0.2"), Target::Es2020);
        assert_eq!(task.id(), "v57/react@17.0.2/es2020/react.js");
    }

    #[test]
    fn test_fingerprint_dev_and_bundle_suffixes() {
        let mut task = BuildTask::new(57, pkg("react", "17.0.2"), Target::Es2020);
        task.dev_mode = true;
        assert_eq!(task.id(), "v57/react@17.0.2/es2020/react.development.js");

        task.dev_mode = false;
        task.bundle_mode = true;
        assert_eq!(task.id(), "v57/react@17.0.2/es2020/react.bundle.js");
    }

    #[test]
    fn test_fingerprint_submodule_and_types() {
        let mut task = BuildTask::new(57, pkg("lodash", "4.17.21"), Target::Types);
        task.pkg.submodule = Some("unescape".to_string());
        assert_eq!(task.id(), "v57/lodash@4.17.21/types/unescape");

        task.target = Target::Es2020;
        assert_eq!(task.id(), "v57/lodash@4.17.21/es2020/unescape.js");
    }

    #[test]
    fn test_resolve_prefix_encoding() {
        let mut task = BuildTask::new(57, pkg("swr", "1.0.0"), Target::Es2020);
        task.alias
            .insert("react".to_string(), "preact/compat".to_string());
        task.deps.push(pkg("preact", "10.5.14"));

        let prefix = task.resolve_prefix();
        assert!(prefix.starts_with("X-"));
        assert!(prefix.ends_with('/'));
        let decoded = URL_SAFE_NO_PAD
            .decode(prefix.trim_start_matches("X-").trim_end_matches('/'))
            .unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "alias:react:preact/compat,deps:preact@10.5.14"
        );
    }

    #[test]
    fn test_resolve_prefix_order_invariant() {
        let mut a = BuildTask::new(57, pkg("swr", "1.0.0"), Target::Es2020);
        a.alias.insert("x".to_string(), "y".to_string());
        a.alias.insert("a".to_string(), "b".to_string());
        a.deps.push(pkg("zzz", "1.0.0"));
        a.deps.push(pkg("aaa", "2.0.0"));

        let mut b = BuildTask::new(57, pkg("swr", "1.0.0"), Target::Es2020);
        b.alias.insert("a".to_string(), "b".to_string());
        b.alias.insert("x".to_string(), "y".to_string());
        b.deps.push(pkg("aaa", "2.0.0"));
        b.deps.push(pkg("zzz", "1.0.0"));

        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_parse_build_path_round_trip() {
        let mut task = BuildTask::new(57, pkg("swr", "1.0.0"), Target::Es2020);
        task.alias
            .insert("react".to_string(), "preact/compat".to_string());
        task.deps.push(pkg("preact", "10.5.14"));
        let id = task.id();

        let parsed = parse_build_path(&id).unwrap();
        assert_eq!(parsed, task);
        assert_eq!(parsed.id(), id);
    }

    #[test]
    fn test_parse_build_path_scoped_submodule() {
        let mut task = BuildTask::new(57, pkg("@babel/runtime", "7.16.0"), Target::Es2021);
        task.pkg.submodule = Some("helpers/esm/extends".to_string());
        task.dev_mode = true;
        let id = task.id();
        assert_eq!(
            id,
            "v57/@babel/runtime@7.16.0/es2021/helpers/esm/extends.development.js"
        );

        let parsed = parse_build_path(&id).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn test_import_path_for() {
        let mut task = BuildTask::new(57, pkg("swr", "1.0.0"), Target::Es2020);
        task.alias
            .insert("react".to_string(), "preact/compat".to_string());

        let mut preact = pkg("preact", "10.5.14");
        preact.submodule = Some("compat".to_string());
        assert_eq!(
            task.import_path_for(&preact, false),
            "/v57/preact@10.5.14/es2020/compat.js"
        );
        assert!(task
            .import_path_for(&preact, true)
            .starts_with("/v57/preact@10.5.14/X-"));
    }

    #[test]
    fn test_classify_bundle_error() {
        let msg = "Could not resolve \"tslib\" (mark it as external to exclude it from the bundle)";
        match classify_bundle_error(msg, "swr") {
            RetryDecision::ExtraExternal(name) => assert_eq!(name, "tslib"),
            other => panic!("unexpected decision: {:?}", other),
        }

        let msg = "Could not resolve \"swr\" (mark it as external to exclude it from the bundle)";
        match classify_bundle_error(msg, "swr") {
            RetryDecision::Fatal(EsmdError::NotFound(m)) => {
                assert_eq!(m, "Could not resolve \"swr\"")
            }
            other => panic!("unexpected decision: {:?}", other),
        }

        let msg = "No matching export in \"node_modules/x/index.js\" for import \"default\"";
        assert!(matches!(
            classify_bundle_error(msg, "x"),
            RetryDecision::StdinEntry
        ));

        let msg = "Transforming const to the configured target environment is not supported yet";
        assert!(matches!(
            classify_bundle_error(msg, "x"),
            RetryDecision::Fatal(EsmdError::Bundle(_))
        ));
    }

    // -- engine end-to-end over a scripted install command and bundler ----

    /// A bundler double: feeds scripted specifiers through the resolver
    /// plugin and returns canned output.
    struct ScriptedBundler {
        imports: Vec<String>,
        output: String,
        calls: AtomicUsize,
        fail_first: Option<String>,
    }

    impl ScriptedBundler {
        fn new(imports: &[&str], output: &str) -> Self {
            Self {
                imports: imports.iter().map(|s| s.to_string()).collect(),
                output: output.to_string(),
                calls: AtomicUsize::new(0),
                fail_first: None,
            }
        }
    }

    impl Bundler for ScriptedBundler {
        fn bundle(
            &self,
            options: &BundleOptions,
            resolver: &dyn ImportResolver,
        ) -> std::result::Result<BundleResult, BundleFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                if let Some(message) = &self.fail_first {
                    return Err(BundleFailure {
                        message: message.clone(),
                    });
                }
            }
            let importer = options
                .entry_point
                .clone()
                .unwrap_or_else(|| PathBuf::from("/stdin/mod.js"));
            for specifier in &self.imports {
                let _ = resolver.resolve(ResolveArgs {
                    path: specifier,
                    importer: &importer,
                });
            }
            Ok(BundleResult {
                files: vec![OutputFile {
                    path: PathBuf::from("/esbuild/stdout.js"),
                    contents: self.output.clone().into_bytes(),
                }],
                warnings: vec![],
            })
        }
    }

    /// Install command double: materialises canned packages instead of
    /// talking to a registry.
    fn write_fake_installer(dir: &Path) -> PathBuf {
        let script = r#"#!/bin/sh
set -e
[ "$1" = "add" ] && shift
while [ $# -gt 0 ]; do
  case "$1" in
    --registry) shift 2 ;;
    *)
      spec="$1"
      name="${spec%@*}"
      dir="node_modules/$name"
      mkdir -p "$dir"
      if [ ! -f "$dir/package.json" ]; then
        version="${spec##*@}"
        printf '{"name":"%s","version":"%s","module":"index.js"}' "$name" "$version" > "$dir/package.json"
        case "$name" in
          react) printf 'export const Parser = 1;\n' > "$dir/index.js" ;;
          lodash)
            printf '{"name":"%s","version":"%s","main":"lodash.js"}' "$name" "$version" > "$dir/package.json"
            printf 'module.exports = {};\n' > "$dir/lodash.js"
            printf 'declare function unescape(s: string): string;\nexport default unescape;\n' > "$dir/unescape.d.ts"
            ;;
          *) printf 'const n = 1;\nexport default n;\n' > "$dir/index.js" ;;
        esac
      fi
      shift ;;
  esac
done
"#;
        let path = dir.join("fake-yarn.sh");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn test_engine(name: &str, bundler: ScriptedBundler) -> (Arc<Engine>, MemoryArtifactStore) {
        let root = std::env::temp_dir().join(format!(
            "esmd-engine-test-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&root).unwrap();
        let installer = write_fake_installer(&root);

        let config = Config {
            install_command: installer.to_string_lossy().to_string(),
            work_root: Some(root),
            // unroutable on purpose: lookups must degrade, never hang
            registry: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };
        let blobs = MemoryArtifactStore::new();
        let engine = Engine::new(
            config,
            Arc::new(bundler),
            Arc::new(blobs.clone()),
            Arc::new(MemoryMetaStore::new()),
            Arc::new(NoopDtsCopier),
        )
        .unwrap();
        (engine, blobs)
    }

    #[tokio::test]
    async fn test_build_simple_package() {
        let bundler = ScriptedBundler::new(&[], "var n=1;export default n;\n");
        let (engine, blobs) = test_engine("simple", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        let esm = engine.build(&task).await.unwrap();
        assert!(esm.export_default);

        let artifact = blobs
            .read("builds/v57/demo@1.0.0/es2020/demo.js")
            .await
            .unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.starts_with("/* esm.sh - esbuild bundle(demo@1.0.0) es2020 production */\n"));
        assert!(!text.contains("__ESM_SH_EXTERNAL:"));
    }

    #[tokio::test]
    async fn test_build_is_idempotent() {
        let bundler = ScriptedBundler::new(&[], "export default 1;\n");
        let (engine, blobs) = test_engine("idempotent", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        engine.build(&task).await.unwrap();
        let keys_before = blobs.keys();

        // the second call is served from the stores without bundling again
        engine.build(&task).await.unwrap();
        assert_eq!(blobs.keys(), keys_before);
    }

    #[tokio::test]
    async fn test_build_dev_mode_header_and_fingerprint() {
        let bundler = ScriptedBundler::new(&[], "export default 1;\n");
        let (engine, blobs) = test_engine("dev", bundler);

        let mut task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        task.dev_mode = true;
        engine.build(&task).await.unwrap();

        let artifact = blobs
            .read("builds/v57/demo@1.0.0/es2020/demo.development.js")
            .await
            .unwrap();
        let header = String::from_utf8(artifact)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .to_string();
        // the env token sits between the target and the closing marker
        let tokens: Vec<&str> = header.split_whitespace().collect();
        assert_eq!(tokens[tokens.len() - 2], "development");
    }

    #[tokio::test]
    async fn test_build_rewrites_external_to_pinned_dep() {
        let bundler = ScriptedBundler::new(
            &["react"],
            "import react from \"__ESM_SH_EXTERNAL:react\";export default react;\n",
        );
        let (engine, blobs) = test_engine("pinned", bundler);

        let mut task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        task.deps.push(pkg("react", "17.0.2"));
        engine.build(&task).await.unwrap();

        let id = task.id();
        let artifact = blobs.read(&build_key(&id)).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains("\"/v57/react@17.0.2/es2020/react.js\""));
        assert!(!text.contains("__ESM_SH_EXTERNAL:"));
    }

    #[tokio::test]
    async fn test_build_reconciles_cjs_callsite_to_namespace() {
        // the fake react entry is ESM without a default export, so a
        // synthetic require call-site collapses to a namespace import
        let bundler = ScriptedBundler::new(
            &["react"],
            "var P = __require(\"__ESM_SH_EXTERNAL:react\").Parser;export default P;\n",
        );
        let (engine, blobs) = test_engine("cjs-reconcile", bundler);

        let mut task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        task.deps.push(pkg("react", "17.0.2"));
        engine.build(&task).await.unwrap();

        let artifact = blobs.read(&build_key(&task.id())).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains("import * as __react$ from \"/v57/react@17.0.2/es2020/react.js\";"));
        assert!(text.contains("var P = __react$.Parser;"));
        assert!(!text.contains("__ESM_SH_EXTERNAL:"));
    }

    #[tokio::test]
    async fn test_build_deno_target_maps_builtins_to_std() {
        let bundler = ScriptedBundler::new(
            &["node:fs", "path"],
            "import fs from \"__ESM_SH_EXTERNAL:fs\";import path from \"__ESM_SH_EXTERNAL:path\";export default fs;\n",
        );
        let (engine, blobs) = test_engine("deno", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Deno);
        engine.build(&task).await.unwrap();

        let artifact = blobs.read(&build_key(&task.id())).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains("\"https://deno.land/std@0.128.0/node/fs.ts\""));
        assert!(text.contains("\"https://deno.land/std@0.128.0/node/path.ts\""));
    }

    #[tokio::test]
    async fn test_build_unsupported_builtin_becomes_error_url() {
        let bundler = ScriptedBundler::new(
            &["wasi"],
            "import wasi from \"__ESM_SH_EXTERNAL:wasi\";export default wasi;\n",
        );
        let (engine, blobs) = test_engine("unsupported-builtin", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        engine.build(&task).await.unwrap();

        let artifact = blobs.read(&build_key(&task.id())).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains(
            "\"/error.js?type=unsupported-nodejs-builtin-module&name=wasi&importer=demo\""
        ));
    }

    #[tokio::test]
    async fn test_build_retries_with_extra_external() {
        let mut bundler = ScriptedBundler::new(&[], "export default 1;\n");
        bundler.fail_first = Some(
            "Could not resolve \"tslib\" (mark it as external to exclude it from the bundle)"
                .to_string(),
        );
        let (engine, _) = test_engine("retry", bundler);

        let mut task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        task.deps.push(pkg("tslib", "2.3.0"));
        let esm = engine.build(&task).await.unwrap();
        assert!(esm.export_default);
    }

    #[tokio::test]
    async fn test_build_node_target_keeps_builtins() {
        let bundler = ScriptedBundler::new(
            &["fs"],
            "import fs from \"__ESM_SH_EXTERNAL:fs\";export default fs;\n",
        );
        let (engine, blobs) = test_engine("node-target", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Node);
        engine.build(&task).await.unwrap();

        let artifact = blobs.read(&build_key(&task.id())).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains("import fs from \"fs\";"));
    }

    #[tokio::test]
    async fn test_build_shims_prepended_for_browser_target() {
        let bundler = ScriptedBundler::new(
            &[],
            "var env = __Process$.env.NODE_ENV;var g = __global$;export default env;\n",
        );
        let (engine, blobs) = test_engine("shims", bundler);

        let task = BuildTask::new(57, pkg("demo", "1.0.0"), Target::Es2020);
        engine.build(&task).await.unwrap();

        let artifact = blobs.read(&build_key(&task.id())).await.unwrap();
        let text = String::from_utf8(artifact).unwrap();
        assert!(text.contains("import __Process$ from \"/v57/node_process.js\";"));
        assert!(text.contains("__Process$.env.NODE_ENV=\"production\";"));
        assert!(text.contains("var __global$ = globalThis"));
    }

    #[tokio::test]
    async fn test_build_types_target() {
        let bundler = ScriptedBundler::new(&[], "unused");
        let (engine, blobs) = test_engine("types", bundler);

        let mut task = BuildTask::new(57, pkg("lodash", "4.17.21"), Target::Types);
        task.pkg.submodule = Some("unescape".to_string());
        assert_eq!(task.id(), "v57/lodash@4.17.21/types/unescape");

        let esm = engine.build(&task).await.unwrap();
        assert_eq!(esm.dts, "/v57/lodash@4.17.21/unescape.d.ts");
        // types requests bundle nothing and store no blob
        assert!(blobs.keys().is_empty());
    }
}
