//! Planning and realizing derivations.
//!
//! Planning computes every selected node's build environment and identifier
//! without running anything. Realizing walks the planned levels in order and
//! builds the nodes of one level in parallel. Each node is looked up in the
//! in-process memo table, then in the store, and only built when both miss.
//! A failed node makes all of its dependents unbuildable while unrelated
//! subtrees keep going.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_config::SandboxMode;
use kiln_sandbox::{CancelToken, ExitKind, SandboxCommand, SandboxError};
use kiln_toolchain::env::env_name_segment;
use kiln_toolchain::{resolve_environment, BuildEnvironment, ToolchainError};
use rayon::prelude::{IntoParallelRefIterator, ParallelIterator};

use crate::derivation::{DerivationId, DerivationInputs};
use crate::graph::{DerivationGraph, Node, Selection};
use crate::project::Project;
use crate::source::{self, FilterPolicy, SourceError, SourceScan, Snapshotter};
use crate::store::{ContentStore, ObjectMeta, OutputMeta, StoreError};

/// Knobs for one graph evaluation.
#[derive(Debug, Clone)]
pub struct RealizeOptions {
    pub jobs: usize,
    /// Default per-build timeout; units may override it.
    pub timeout: Duration,
    pub fail_fast: bool,
    pub sandbox: SandboxMode,
    pub cancel: CancelToken,
}

/// One declared output of a realized derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub derivation: DerivationId,
    pub name: String,
    /// Location inside the store.
    pub path: PathBuf,
    pub digest: String,
}

/// A derivation whose outputs are in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realized {
    pub id: DerivationId,
    pub out: PathBuf,
    pub artifacts: Vec<Artifact>,
}

impl Realized {
    pub fn artifact(&self, output: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == output)
    }
}

/// An external package input with its content digest.
#[derive(Debug, Clone)]
pub struct PackageInput {
    pub name: String,
    pub path: PathBuf,
    pub digest: String,
}

/// A node whose identifier is known.
#[derive(Debug, Clone)]
pub struct Planned {
    pub id: DerivationId,
    pub env: BuildEnvironment,
    pub scan: Option<Arc<SourceScan>>,
    pub packages: Vec<PackageInput>,
}

#[derive(Debug, Clone)]
pub enum PlanEntry {
    Ready(Box<Planned>),
    /// No toolchain builds the node's platform on this host.
    Unsupported { host: String, target: String },
    /// A dependency cannot be planned; `cause` names the originating node.
    Blocked { cause: String },
}

/// Identifiers and environments for a selection of the graph.
#[derive(Debug, Clone)]
pub struct Plan {
    pub selection: Selection,
    entries: HashMap<usize, PlanEntry>,
}

impl Plan {
    pub fn entry(&self, index: usize) -> Option<&PlanEntry> {
        self.entries.get(&index)
    }

    pub fn id(&self, index: usize) -> Option<&DerivationId> {
        match self.entries.get(&index) {
            Some(PlanEntry::Ready(planned)) => Some(&planned.id),
            _ => None,
        }
    }
}

/// What happened to one node during an evaluation.
#[derive(Debug)]
pub enum NodeOutcome {
    Built(Realized),
    Cached(Realized),
    Failed(RealizeError),
    /// A dependency failed; `cause` is the node where the failure originated.
    Unbuildable { cause: String },
    Cancelled,
    /// Not scheduled because an earlier level failed under `fail_fast`.
    Skipped,
}

impl NodeOutcome {
    pub fn realized(&self) -> Option<&Realized> {
        match self {
            Self::Built(r) | Self::Cached(r) => Some(r),
            _ => None,
        }
    }
}

/// Per-node outcomes of one evaluation, keyed by node name.
#[derive(Debug, Default)]
pub struct RealizeReport {
    pub outcomes: BTreeMap<String, NodeOutcome>,
}

impl RealizeReport {
    fn count(&self, pred: impl Fn(&NodeOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }

    pub fn built(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Built(_)))
    }

    pub fn cached(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Cached(_)))
    }

    pub fn unbuildable(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Unbuildable { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Cancelled))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, NodeOutcome::Skipped))
    }

    pub fn failures(&self) -> Vec<(&str, &RealizeError)> {
        self.outcomes
            .iter()
            .filter_map(|(name, o)| match o {
                NodeOutcome::Failed(e) => Some((name.as_str(), e)),
                _ => None,
            })
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, NodeOutcome::Built(_) | NodeOutcome::Cached(_)))
    }

    pub fn realized(&self, name: &str) -> Option<&Realized> {
        self.outcomes.get(name).and_then(NodeOutcome::realized)
    }
}

/// Evaluates a derivation graph against a content store.
#[derive(Debug)]
pub struct Realizer<'a> {
    project: &'a Project,
    graph: DerivationGraph,
    store: ContentStore,
    snapshotter: Snapshotter,
    memo: Mutex<HashMap<DerivationId, Realized>>,
    package_digests: Mutex<HashMap<String, String>>,
    builds: AtomicUsize,
}

impl<'a> Realizer<'a> {
    /// # Errors
    /// Returns an error if the store cannot be opened.
    pub fn new(project: &'a Project, graph: DerivationGraph) -> Result<Self, RealizeError> {
        let store_dir = project.settings.store_dir(&project.root);
        let store = ContentStore::open(&store_dir)?;
        let snapshotter = Snapshotter::new(vec![
            store_dir,
            project.settings.dist_dir(&project.root),
        ]);
        Ok(Self {
            project,
            graph,
            store,
            snapshotter,
            memo: Mutex::new(HashMap::new()),
            package_digests: Mutex::new(HashMap::new()),
            builds: AtomicUsize::new(0),
        })
    }

    pub fn graph(&self) -> &DerivationGraph {
        &self.graph
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Number of builds this realizer actually executed.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Whether the store already holds the derivation.
    pub fn is_cached(&self, id: &DerivationId) -> bool {
        matches!(self.store.lookup(id.as_hex()), Ok(Some(_)))
    }

    /// Compute environments and identifiers for `selection`. Executes nothing.
    ///
    /// # Errors
    /// Returns an error if a source cannot be scanned or a package input is
    /// missing. Unsupported targets are recorded per node instead.
    pub fn plan(&self, selection: &Selection) -> Result<Plan, RealizeError> {
        let mut entries: HashMap<usize, PlanEntry> = HashMap::new();
        for &index in &selection.order {
            let Some(node) = self.graph.node(index) else {
                continue;
            };
            let entry = self.plan_node(node, &entries)?;
            entries.insert(index, entry);
        }
        Ok(Plan {
            selection: selection.clone(),
            entries,
        })
    }

    fn plan_node(
        &self,
        node: &Node,
        planned: &HashMap<usize, PlanEntry>,
    ) -> Result<PlanEntry, RealizeError> {
        let mut deps = Vec::with_capacity(node.deps.len());
        for edge in &node.deps {
            let dep_name = self.node_name(edge.index);
            match planned.get(&edge.index) {
                Some(PlanEntry::Ready(p)) => deps.push((edge.reference.clone(), p.id.clone())),
                Some(PlanEntry::Blocked { cause }) => {
                    return Ok(PlanEntry::Blocked {
                        cause: cause.clone(),
                    })
                }
                Some(PlanEntry::Unsupported { .. }) | None => {
                    return Ok(PlanEntry::Blocked { cause: dep_name })
                }
            }
        }

        let host = self.project.host;
        let env = match resolve_environment(
            &host,
            &node.platform,
            &self.project.registry,
            &self.project.settings.path,
        ) {
            Ok(env) => env,
            Err(ToolchainError::UnsupportedTarget { host, target }) => {
                return Ok(PlanEntry::Unsupported { host, target })
            }
            Err(e) => return Err(e.into()),
        };

        let scan = match &node.source {
            Some(name) => Some(self.scan_source(name)?),
            None => None,
        };
        let packages = node
            .packages
            .iter()
            .map(|name| self.package_input(name))
            .collect::<Result<Vec<_>, _>>()?;

        let Some(unit) = self.project.manifest.units.get(&node.unit) else {
            return Err(RealizeError::UnknownUnit {
                unit: node.unit.clone(),
            });
        };
        let id = DerivationId::compute(&DerivationInputs {
            unit: node.unit.clone(),
            command: unit.command.clone(),
            outputs: unit.outputs.clone(),
            env: unit.env.clone(),
            platform: node.platform.to_string(),
            env_fingerprint: env.fingerprint(),
            snapshot_id: scan.as_ref().map(|s| s.id.clone()),
            deps,
            packages: packages
                .iter()
                .map(|p| (p.name.clone(), p.digest.clone()))
                .collect(),
        });
        Ok(PlanEntry::Ready(Box::new(Planned {
            id,
            env,
            scan,
            packages,
        })))
    }

    fn scan_source(&self, name: &str) -> Result<Arc<SourceScan>, RealizeError> {
        let Some(decl) = self.project.manifest.sources.get(name) else {
            return Err(RealizeError::Source(SourceError::MissingRoot {
                path: format!("sources.{name}"),
            }));
        };
        let policy = FilterPolicy::from_decl(decl)?;
        Ok(self
            .snapshotter
            .scan(&self.project.root.join(&decl.path), &policy)?)
    }

    fn package_input(&self, name: &str) -> Result<PackageInput, RealizeError> {
        let path = self
            .project
            .manifest
            .packages
            .get(name)
            .map(|p| self.project.root.join(&p.path))
            .ok_or_else(|| RealizeError::MissingPackage {
                name: name.to_owned(),
                path: String::new(),
            })?;
        if !path.exists() {
            return Err(RealizeError::MissingPackage {
                name: name.to_owned(),
                path: path.display().to_string(),
            });
        }
        let cached = self
            .package_digests
            .lock()
            .ok()
            .and_then(|m| m.get(name).cloned());
        let digest = match cached {
            Some(d) => d,
            None => {
                let d = kiln_util::hash::sha256_path(&path)?;
                if let Ok(mut digests) = self.package_digests.lock() {
                    digests.insert(name.to_owned(), d.clone());
                }
                d
            }
        };
        Ok(PackageInput {
            name: name.to_owned(),
            path,
            digest,
        })
    }

    fn node_name(&self, index: usize) -> String {
        self.graph
            .node(index)
            .map(|n| n.name.clone())
            .unwrap_or_default()
    }

    /// Realize `selection`, level by level.
    ///
    /// Per-node failures are reported in the returned [`RealizeReport`];
    /// only problems that prevent evaluating the graph at all are errors.
    ///
    /// # Errors
    /// Returns an error if planning fails or the worker pool cannot start.
    pub fn realize(
        &self,
        selection: &Selection,
        options: &RealizeOptions,
    ) -> Result<RealizeReport, RealizeError> {
        let plan = self.plan(selection)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs.max(1))
            .build()
            .map_err(|e| RealizeError::ThreadPool {
                message: e.to_string(),
            })?;

        let mut outcomes: HashMap<usize, NodeOutcome> = HashMap::new();
        let mut halted = false;

        for level in &plan.selection.levels {
            if halted || options.cancel.is_cancelled() {
                let outcome = || {
                    if options.cancel.is_cancelled() {
                        NodeOutcome::Cancelled
                    } else {
                        NodeOutcome::Skipped
                    }
                };
                for &index in level {
                    outcomes.insert(index, outcome());
                }
                continue;
            }

            let mut runnable: Vec<(usize, &Planned)> = Vec::new();
            for &index in level {
                match self.ready_to_run(index, &plan, &outcomes) {
                    Ok(planned) => runnable.push((index, planned)),
                    Err(outcome) => {
                        outcomes.insert(index, outcome);
                    }
                }
            }

            let results: Vec<(usize, NodeOutcome)> = pool.install(|| {
                runnable
                    .par_iter()
                    .map(|(index, planned)| (*index, self.realize_node(*index, planned, &outcomes, options)))
                    .collect()
            });

            outcomes.extend(results);
            let level_failed = level
                .iter()
                .any(|i| matches!(outcomes.get(i), Some(NodeOutcome::Failed(_))));
            if level_failed && options.fail_fast {
                tracing::warn!("stopping after failed level (fail-fast)");
                halted = true;
            }
        }

        let mut report = RealizeReport::default();
        for (index, outcome) in outcomes {
            report.outcomes.insert(self.node_name(index), outcome);
        }
        Ok(report)
    }

    /// Decide whether a node can run given its dependencies' outcomes.
    fn ready_to_run<'p>(
        &self,
        index: usize,
        plan: &'p Plan,
        outcomes: &HashMap<usize, NodeOutcome>,
    ) -> Result<&'p Planned, NodeOutcome> {
        let planned = match plan.entry(index) {
            Some(PlanEntry::Ready(planned)) => planned,
            Some(PlanEntry::Unsupported { host, target }) => {
                return Err(NodeOutcome::Failed(RealizeError::UnsupportedTarget(
                    ToolchainError::UnsupportedTarget {
                        host: host.clone(),
                        target: target.clone(),
                    },
                )))
            }
            Some(PlanEntry::Blocked { cause }) => {
                return Err(NodeOutcome::Unbuildable {
                    cause: cause.clone(),
                })
            }
            None => return Err(NodeOutcome::Skipped),
        };
        let Some(node) = self.graph.node(index) else {
            return Err(NodeOutcome::Skipped);
        };
        for edge in &node.deps {
            match outcomes.get(&edge.index) {
                Some(NodeOutcome::Built(_) | NodeOutcome::Cached(_)) => {}
                Some(NodeOutcome::Unbuildable { cause }) => {
                    return Err(NodeOutcome::Unbuildable {
                        cause: cause.clone(),
                    })
                }
                Some(NodeOutcome::Failed(_)) => {
                    return Err(NodeOutcome::Unbuildable {
                        cause: self.node_name(edge.index),
                    })
                }
                Some(NodeOutcome::Cancelled) => return Err(NodeOutcome::Cancelled),
                Some(NodeOutcome::Skipped) | None => return Err(NodeOutcome::Skipped),
            }
        }
        Ok(planned)
    }

    fn realize_node(
        &self,
        index: usize,
        planned: &Planned,
        outcomes: &HashMap<usize, NodeOutcome>,
        options: &RealizeOptions,
    ) -> NodeOutcome {
        let name = self.node_name(index);
        match self.realize_one(index, planned, outcomes, options) {
            Ok((realized, true)) => NodeOutcome::Built(realized),
            Ok((realized, false)) => NodeOutcome::Cached(realized),
            Err(RealizeError::Cancelled) => {
                tracing::warn!(unit = %name, "cancelled");
                NodeOutcome::Cancelled
            }
            Err(e) => {
                tracing::error!(unit = %name, id = %planned.id.short(), error = %e, "build failed");
                NodeOutcome::Failed(e)
            }
        }
    }

    /// Returns the realized derivation and whether it was built just now.
    fn realize_one(
        &self,
        index: usize,
        planned: &Planned,
        outcomes: &HashMap<usize, NodeOutcome>,
        options: &RealizeOptions,
    ) -> Result<(Realized, bool), RealizeError> {
        let id = &planned.id;
        let Some(node) = self.graph.node(index) else {
            return Err(RealizeError::UnknownUnit {
                unit: index.to_string(),
            });
        };

        if let Some(hit) = self.memo.lock().ok().and_then(|m| m.get(id).cloned()) {
            return Ok((hit, false));
        }
        if let Some(hit) = self.lookup(id)? {
            tracing::info!(unit = %node.name, id = %id.short(), "cached");
            return Ok((hit, false));
        }

        let _lock = self.store.lock(id.as_hex())?;
        if let Some(hit) = self.lookup(id)? {
            tracing::info!(unit = %node.name, id = %id.short(), "cached");
            return Ok((hit, false));
        }
        if options.cancel.is_cancelled() {
            return Err(RealizeError::Cancelled);
        }

        let Some(unit) = self.project.manifest.units.get(&node.unit) else {
            return Err(RealizeError::UnknownUnit {
                unit: node.unit.clone(),
            });
        };
        tracing::info!(unit = %node.name, id = %id.short(), platform = %node.platform, "building");

        let snapshot = match &planned.scan {
            Some(scan) => Some(source::materialize(scan, &self.store)?),
            None => None,
        };

        let staging = self.store.staging(id.short())?;
        let entry = staging.path().join("entry");
        let out = entry.join("out");
        let work = staging.path().join("work");
        let home = staging.path().join("home");
        for dir in [&out, &home] {
            kiln_util::fs::ensure_dir(dir)?;
        }
        match &snapshot {
            Some(snapshot) => kiln_util::fs::copy_tree(&snapshot.root, &work)?,
            None => kiln_util::fs::ensure_dir(&work)?,
        }

        let mut vars = planned.env.vars.clone();
        vars.extend(unit.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.insert("KILN_SRC".to_owned(), work.display().to_string());
        vars.insert("KILN_OUT".to_owned(), out.display().to_string());
        vars.insert("KILN_UNIT".to_owned(), node.name.clone());
        vars.insert("KILN_DRV_ID".to_owned(), id.to_string());

        let timeout = unit
            .timeout_secs
            .map_or(options.timeout, Duration::from_secs);
        let mut cmd = SandboxCommand::new(&unit.command)
            .workdir(&work)
            .scratch(&home)
            .path_dirs(&planned.env.path_dirs)
            .rw_path(&work)
            .rw_path(&out)
            .timeout(timeout)
            .namespaced(options.sandbox == SandboxMode::Namespaced);

        for edge in &node.deps {
            let Some(dep) = outcomes.get(&edge.index).and_then(NodeOutcome::realized) else {
                return Err(RealizeError::UnknownUnit {
                    unit: edge.reference.clone(),
                });
            };
            let segment = env_name_segment(&edge.reference);
            let dep_copy = staging.path().join("deps").join(&segment);
            kiln_util::fs::copy_tree(&dep.out, &dep_copy)?;
            vars.insert(format!("KILN_DEP_{segment}"), dep_copy.display().to_string());
            cmd = cmd.ro_path(&dep_copy);
        }
        for package in &planned.packages {
            vars.insert(
                format!("KILN_PKG_{}", env_name_segment(&package.name)),
                package.path.display().to_string(),
            );
            cmd = cmd.ro_path(&package.path);
        }
        for dir in &planned.env.library_dirs {
            cmd = cmd.ro_path(dir);
        }
        for lib in planned.env.runtime_libs.values() {
            cmd = cmd.ro_path(lib);
        }
        let cmd = cmd.envs(&vars);

        let log = self.store.log_path(id.as_hex());
        let outcome = kiln_sandbox::run(&cmd, &log, &options.cancel)?;
        let failure = |reason: String| RealizeError::BuildFailure {
            id: id.to_string(),
            unit: node.name.clone(),
            reason,
            log: log.clone(),
        };
        match outcome.status {
            ExitKind::Exited(0) => {}
            ExitKind::Exited(code) => return Err(failure(format!("exited with status {code}"))),
            ExitKind::Signaled => return Err(failure("killed by a signal".to_owned())),
            ExitKind::TimedOut => {
                return Err(RealizeError::BuildTimeout {
                    id: id.to_string(),
                    unit: node.name.clone(),
                    timeout,
                    log,
                })
            }
            ExitKind::Cancelled => return Err(RealizeError::Cancelled),
        }

        let mut outputs = Vec::with_capacity(unit.outputs.len());
        for output in &unit.outputs {
            let path = out.join(output);
            if std::fs::symlink_metadata(&path).is_err() {
                return Err(failure(format!("declared output `{output}` was not produced")));
            }
            outputs.push(OutputMeta {
                name: output.clone(),
                digest: kiln_util::hash::sha256_path(&path)?,
            });
        }

        let meta = ObjectMeta {
            id: id.to_string(),
            name: node.name.clone(),
            platform: node.platform.to_string(),
            outputs,
            built_at: now_epoch_secs(),
            duration_ms: u64::try_from(outcome.duration.as_millis()).unwrap_or(u64::MAX),
        };
        self.store.register(&entry, &meta)?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        tracing::info!(unit = %node.name, id = %id.short(), duration_ms = meta.duration_ms, "built");

        let realized = self.realized_from(&meta, id);
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(id.clone(), realized.clone());
        }
        Ok((realized, true))
    }

    fn lookup(&self, id: &DerivationId) -> Result<Option<Realized>, RealizeError> {
        let Some(meta) = self.store.lookup(id.as_hex())? else {
            return Ok(None);
        };
        let realized = self.realized_from(&meta, id);
        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(id.clone(), realized.clone());
        }
        Ok(Some(realized))
    }

    fn realized_from(&self, meta: &ObjectMeta, id: &DerivationId) -> Realized {
        let out = self.store.object_out(id.as_hex());
        let artifacts = meta
            .outputs
            .iter()
            .map(|o| Artifact {
                derivation: id.clone(),
                name: o.name.clone(),
                path: out.join(&o.name),
                digest: o.digest.clone(),
            })
            .collect();
        Realized {
            id: id.clone(),
            out,
            artifacts,
        }
    }
}

/// Return the current UTC time as epoch seconds (e.g. "1708646400s-since-epoch").
fn now_epoch_secs() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}s-since-epoch", duration.as_secs())
}

#[derive(Debug, thiserror::Error)]
pub enum RealizeError {
    #[error("{0}")]
    UnsupportedTarget(#[from] ToolchainError),

    #[error("unit `{unit}` ({id}) failed: {reason} — see {}", log.display())]
    BuildFailure {
        id: String,
        unit: String,
        reason: String,
        log: PathBuf,
    },

    #[error("unit `{unit}` ({id}) timed out after {}s — see {}", timeout.as_secs(), log.display())]
    BuildTimeout {
        id: String,
        unit: String,
        timeout: Duration,
        log: PathBuf,
    },

    #[error("package `{name}` not found at {path}")]
    MissingPackage { name: String, path: String },

    #[error("unit `{unit}` is not declared")]
    UnknownUnit { unit: String },

    #[error("build cancelled")]
    Cancelled,

    #[error("cannot start build workers: {message}")]
    ThreadPool { message: String },

    #[error("{0}")]
    Source(#[from] SourceError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Util(#[from] kiln_util::error::UtilError),
}

impl RealizeError {
    /// Build log of a failed or timed-out build.
    pub fn log(&self) -> Option<&Path> {
        match self {
            Self::BuildFailure { log, .. } | Self::BuildTimeout { log, .. } => Some(log),
            _ => None,
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use kiln_config::{Manifest, PartialSettings};
    use kiln_targets::Platform;

    use super::*;

    const BASE: &str = "[project]\nname = \"t\"\n[sources.main]\npath = \".\"\n";

    struct Fixture {
        dir: tempfile::TempDir,
        project: Project,
    }

    fn fixture_on(host: &str, units: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{BASE}{units}");
        fs::write(dir.path().join("kiln.toml"), &content).unwrap();
        fs::write(dir.path().join("input.txt"), "hello\n").unwrap();
        let manifest = Manifest::from_toml(&content, "kiln.toml").unwrap();
        let settings = PartialSettings {
            jobs: Some(4),
            ..PartialSettings::default()
        }
        .resolve()
        .unwrap();
        let host: Platform = host.parse().unwrap();
        let project = Project::from_parts(dir.path(), manifest, settings, host).unwrap();
        Fixture { dir, project }
    }

    fn fixture(units: &str) -> Fixture {
        fixture_on("linux-x64", units)
    }

    fn options() -> RealizeOptions {
        RealizeOptions {
            jobs: 4,
            timeout: Duration::from_secs(60),
            fail_fast: false,
            sandbox: SandboxMode::Hermetic,
            cancel: CancelToken::new(),
        }
    }

    fn realize_all(f: &Fixture, opts: &RealizeOptions) -> (RealizeReport, usize) {
        let graph = f.project.graph(None).unwrap();
        let realizer = Realizer::new(&f.project, graph).unwrap();
        let report = realizer.realize(&realizer.graph().all(), opts).unwrap();
        (report, realizer.builds())
    }

    const CHAIN: &str = r#"
[units.a]
source = "main"
command = "cat input.txt > $KILN_OUT/a.txt"
outputs = ["a.txt"]

[units.b]
source = "main"
deps = ["a"]
command = "cat $KILN_DEP_A/a.txt > $KILN_OUT/b.txt && echo b >> $KILN_OUT/b.txt"
outputs = ["b.txt"]
"#;

    #[test]
    fn dependency_output_flows_into_dependent() {
        let f = fixture(CHAIN);
        let (report, builds) = realize_all(&f, &options());
        assert!(report.is_success(), "report: {report:?}");
        assert_eq!(builds, 2);
        let b = report.realized("b").unwrap();
        let content = fs::read_to_string(&b.artifact("b.txt").unwrap().path).unwrap();
        assert_eq!(content, "hello\nb\n");
    }

    #[test]
    fn dependents_cannot_alter_stored_outputs() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture(
            r#"
[units.a]
command = "echo a > $KILN_OUT/a.txt"
outputs = ["a.txt"]

[units.b]
deps = ["a"]
command = "echo TAMPERED > $KILN_DEP_A/a.txt; rm -f $KILN_DEP_A/a.txt; echo b > $KILN_OUT/b.txt"
outputs = ["b.txt"]
"#,
        );
        let (report, _) = realize_all(&f, &options());
        assert!(report.is_success(), "report: {report:?}");

        let a = report.realized("a").unwrap();
        let artifact = a.artifact("a.txt").unwrap();
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "a\n");
        assert_eq!(
            kiln_util::hash::sha256_path(&artifact.path).unwrap(),
            artifact.digest
        );
        let mode = fs::metadata(&artifact.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "stored output is writable");
    }

    #[test]
    fn concurrent_realizers_build_each_identifier_once() {
        let f = fixture(
            "[units.slow]\ncommand = \"sleep 1; echo done > $KILN_OUT/done\"\noutputs = [\"done\"]\n",
        );
        let barrier = std::sync::Barrier::new(2);
        let results: Vec<(RealizeReport, usize)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        realize_all(&f, &options())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let total: usize = results.iter().map(|(_, builds)| builds).sum();
        assert_eq!(total, 1);
        let ids: Vec<_> = results
            .iter()
            .map(|(report, _)| report.realized("slow").unwrap().id.clone())
            .collect();
        assert_eq!(ids.first(), ids.get(1));
        let objects = f.project.store_dir().join("objects");
        assert_eq!(fs::read_dir(objects).unwrap().count(), 1);
    }

    #[test]
    fn rerun_performs_zero_builds() {
        let f = fixture(CHAIN);
        let (first, _) = realize_all(&f, &options());
        let (second, builds) = realize_all(&f, &options());
        assert_eq!(builds, 0);
        assert_eq!(second.cached(), 2);
        assert_eq!(
            first.realized("b").unwrap().id,
            second.realized("b").unwrap().id
        );
    }

    #[test]
    fn plan_is_deterministic_and_builds_nothing() {
        let f = fixture(CHAIN);
        let graph = f.project.graph(None).unwrap();
        let realizer = Realizer::new(&f.project, graph).unwrap();
        let all = realizer.graph().all();
        let first = realizer.plan(&all).unwrap();
        let second = realizer.plan(&all).unwrap();
        for &index in &all.order {
            assert!(first.id(index).is_some());
            assert_eq!(first.id(index), second.id(index));
            assert!(!realizer.is_cached(first.id(index).unwrap()));
        }
        assert_eq!(realizer.builds(), 0);
    }

    #[test]
    fn source_change_changes_identifiers() {
        let f = fixture(CHAIN);
        let (first, _) = realize_all(&f, &options());
        fs::write(f.dir.path().join("input.txt"), "changed\n").unwrap();
        let (second, builds) = realize_all(&f, &options());
        assert_eq!(builds, 2);
        assert_ne!(
            first.realized("a").unwrap().id,
            second.realized("a").unwrap().id
        );
    }

    #[test]
    fn shared_dependency_is_built_once() {
        let f = fixture(
            r#"
[units.base]
command = "echo base > $KILN_OUT/base"
outputs = ["base"]
[units.left]
deps = ["base"]
command = "cp $KILN_DEP_BASE/base $KILN_OUT/left"
outputs = ["left"]
[units.right]
deps = ["base"]
command = "cp $KILN_DEP_BASE/base $KILN_OUT/right"
outputs = ["right"]
"#,
        );
        let (report, builds) = realize_all(&f, &options());
        assert!(report.is_success());
        assert_eq!(builds, 3);
    }

    #[test]
    fn failure_is_attributed_to_origin() {
        let f = fixture(
            r#"
[units.broken]
command = "echo boom >&2; exit 3"
outputs = ["x"]
[units.mid]
deps = ["broken"]
command = "true"
[units.top]
deps = ["mid"]
command = "true"
[units.sibling]
command = "echo ok > $KILN_OUT/ok"
outputs = ["ok"]
"#,
        );
        let (report, _) = realize_all(&f, &options());
        assert!(!report.is_success());
        match report.outcomes.get("broken").unwrap() {
            NodeOutcome::Failed(e) => {
                assert!(e.to_string().contains("exited with status 3"), "error: {e}");
                let log = fs::read_to_string(e.log().unwrap()).unwrap();
                assert!(log.contains("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        for name in ["mid", "top"] {
            assert!(
                matches!(report.outcomes.get(name), Some(NodeOutcome::Unbuildable { cause }) if cause == "broken"),
                "{name}: {:?}",
                report.outcomes.get(name)
            );
        }
        assert!(matches!(
            report.outcomes.get("sibling"),
            Some(NodeOutcome::Built(_))
        ));
    }

    #[test]
    fn fail_fast_skips_later_levels() {
        let f = fixture(
            r#"
[units.broken]
command = "exit 1"
[units.independent]
command = "true"
[units.later]
deps = ["independent"]
command = "true"
"#,
        );
        let opts = RealizeOptions {
            fail_fast: true,
            ..options()
        };
        let (report, _) = realize_all(&f, &opts);
        assert!(matches!(
            report.outcomes.get("later"),
            Some(NodeOutcome::Skipped)
        ));
        assert_eq!(report.skipped(), 1);
    }

    #[test]
    fn missing_output_registers_nothing() {
        let f = fixture("[units.a]\ncommand = \"true\"\noutputs = [\"never\"]\n");
        let graph = f.project.graph(None).unwrap();
        let realizer = Realizer::new(&f.project, graph).unwrap();
        let all = realizer.graph().all();
        let plan = realizer.plan(&all).unwrap();
        let report = realizer.realize(&all, &options()).unwrap();
        match report.outcomes.get("a").unwrap() {
            NodeOutcome::Failed(e) => assert!(e.to_string().contains("`never` was not produced")),
            other => panic!("expected failure, got {other:?}"),
        }
        let id = plan.id(*all.order.first().unwrap()).unwrap();
        assert!(!realizer.is_cached(id));
    }

    #[test]
    fn timeout_is_reported() {
        let f = fixture("[units.slow]\ncommand = \"sleep 30\"\ntimeout_secs = 1\n");
        let (report, _) = realize_all(&f, &options());
        assert!(matches!(
            report.outcomes.get("slow"),
            Some(NodeOutcome::Failed(RealizeError::BuildTimeout { .. }))
        ));
    }

    #[test]
    fn cancelled_evaluation_builds_nothing() {
        let f = fixture(CHAIN);
        let opts = options();
        opts.cancel.cancel();
        let (report, builds) = realize_all(&f, &opts);
        assert_eq!(builds, 0);
        assert_eq!(report.cancelled(), 2);
    }

    #[test]
    fn builds_see_a_closed_environment() {
        let f = fixture(
            r#"
[units.env]
command = "env | sort > $KILN_OUT/env"
outputs = ["env"]
env = { PROFILE = "release" }
"#,
        );
        let (report, _) = realize_all(&f, &options());
        let env = fs::read_to_string(&report.realized("env").unwrap().artifact("env").unwrap().path)
            .unwrap();
        assert!(env.contains("PROFILE=release"));
        assert!(env.contains("KILN_TARGET=linux-x64"));
        assert!(env.contains("SOURCE_DATE_EPOCH=0"));
        assert!(!env.contains("KILN_CROSS_TRIPLE"));
        assert!(!env.contains("USER="));
    }

    #[test]
    fn cross_target_gets_distinct_identifier_and_environment() {
        let f = fixture(
            r#"
[units.app]
command = "make"
targets = ["linux-x64", "windows-x64"]
"#,
        );
        let graph = f.project.graph(None).unwrap();
        let realizer = Realizer::new(&f.project, graph).unwrap();
        let plan = realizer.plan(&realizer.graph().all()).unwrap();
        let ready = |name: &str| match plan.entry(realizer.graph().index_of(name).unwrap()) {
            Some(PlanEntry::Ready(p)) => p.clone(),
            other => panic!("{name} not ready: {other:?}"),
        };
        let linux = ready("app@linux-x64");
        let windows = ready("app@windows-x64");
        assert!(!linux.env.is_cross());
        assert!(windows.env.is_cross());
        assert!(windows.env.vars.contains_key("KILN_CROSS_TRIPLE"));
        assert_ne!(linux.id, windows.id);
        assert_ne!(linux.env.fingerprint(), windows.env.fingerprint());
    }

    #[test]
    fn unsupported_target_fails_only_its_subtree() {
        let f = fixture(
            r#"
[units.mac]
command = "true"
target = "macos-arm64"
[units.after]
command = "true"
deps = ["mac"]
target = "macos-arm64"
"#,
        );
        let (report, builds) = realize_all(&f, &options());
        assert_eq!(builds, 0);
        assert!(matches!(
            report.outcomes.get("mac"),
            Some(NodeOutcome::Failed(RealizeError::UnsupportedTarget(_)))
        ));
        assert!(matches!(
            report.outcomes.get("after"),
            Some(NodeOutcome::Unbuildable { cause }) if cause == "mac"
        ));
    }

    #[test]
    fn packages_are_exposed_and_hashed() {
        let f = fixture(
            r#"
[packages.sdk]
path = "vendor/sdk"
[units.use]
packages = ["sdk"]
command = "cat $KILN_PKG_SDK/version > $KILN_OUT/v"
outputs = ["v"]
"#,
        );
        fs::create_dir_all(f.dir.path().join("vendor/sdk")).unwrap();
        fs::write(f.dir.path().join("vendor/sdk/version"), "1.0\n").unwrap();
        let (report, _) = realize_all(&f, &options());
        let v = report.realized("use").unwrap().artifact("v").unwrap();
        assert_eq!(fs::read_to_string(&v.path).unwrap(), "1.0\n");
    }

    #[test]
    fn missing_package_fails_planning() {
        let f = fixture(
            "[packages.sdk]\npath = \"nowhere\"\n[units.use]\npackages = [\"sdk\"]\ncommand = \"true\"\n",
        );
        let graph = f.project.graph(None).unwrap();
        let realizer = Realizer::new(&f.project, graph).unwrap();
        let err = realizer.plan(&realizer.graph().all()).unwrap_err();
        assert!(matches!(err, RealizeError::MissingPackage { .. }));
    }
}
