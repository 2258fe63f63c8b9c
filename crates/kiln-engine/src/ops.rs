//! Top-level operations behind the `kiln` commands.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::{Duration, Instant};

use kiln_sandbox::CancelToken;
use kiln_targets::resolve_platform;

use crate::bundle::{plan_bundle, write_bundle, Bundle};
use crate::error::EngineError;
use crate::graph::{DerivationGraph, Selection};
use crate::project::Project;
use crate::realize::{Plan, RealizeReport, Realizer};

/// Result of one `realize` or `bundle` evaluation.
#[derive(Debug)]
pub struct RealizeRun {
    pub report: RealizeReport,
    /// Commands actually executed (cache misses).
    pub builds: usize,
    pub duration: Duration,
}

/// Result of `plan`: identifiers plus which of them the store already holds.
#[derive(Debug)]
pub struct PlanRun {
    pub graph: DerivationGraph,
    pub plan: Plan,
    pub cached: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct BundleRun {
    pub run: RealizeRun,
    /// `None` when some required derivation did not realize.
    pub bundle: Option<Bundle>,
}

/// The named units and their dependencies, or the whole graph when `units`
/// is empty.
///
/// # Errors
/// Returns an error if a name is not in the graph.
pub fn select(graph: &DerivationGraph, units: &[String]) -> Result<Selection, EngineError> {
    if units.is_empty() {
        Ok(graph.all())
    } else {
        Ok(graph.closure(units)?)
    }
}

/// Evaluate the graph and compute identifiers without building anything.
///
/// # Errors
/// Returns an error if the graph is invalid or inputs cannot be read.
pub fn plan(
    project: &Project,
    units: &[String],
    target: Option<&str>,
) -> Result<PlanRun, EngineError> {
    let graph = project.graph(target)?;
    let selection = select(&graph, units)?;
    let realizer = Realizer::new(project, graph)?;
    let plan = realizer.plan(&selection)?;
    let cached = selection
        .order
        .iter()
        .copied()
        .filter(|&i| plan.id(i).is_some_and(|id| realizer.is_cached(id)))
        .collect();
    Ok(PlanRun {
        graph: realizer.graph().clone(),
        plan,
        cached,
    })
}

/// Realize the named units (or the whole graph).
///
/// Build failures are reported per node in the returned report; use
/// [`check_report`] to turn them into an error.
///
/// # Errors
/// Returns an error if the graph cannot be evaluated at all.
pub fn realize(
    project: &Project,
    units: &[String],
    target: Option<&str>,
    cancel: CancelToken,
) -> Result<RealizeRun, EngineError> {
    let start = Instant::now();
    let graph = project.graph(target)?;
    let selection = select(&graph, units)?;
    let realizer = Realizer::new(project, graph)?;
    let report = realizer.realize(&selection, &project.realize_options(cancel))?;
    Ok(RealizeRun {
        report,
        builds: realizer.builds(),
        duration: start.elapsed(),
    })
}

/// Realize what bundle `name` needs for `target` and write its archive to
/// `out` (default: the configured dist directory).
///
/// # Errors
/// Returns an error if the bundle cannot be planned or written.
pub fn bundle(
    project: &Project,
    name: &str,
    target: &str,
    out: Option<&Path>,
    cancel: CancelToken,
) -> Result<BundleRun, EngineError> {
    let start = Instant::now();
    let platform = resolve_platform(target, &project.host)?;
    let graph = project.graph(Some(target))?;
    let bundle_plan = plan_bundle(&project.manifest, &graph, name, &platform)?;
    let selection = graph.closure(&bundle_plan.nodes())?;

    let realizer = Realizer::new(project, graph)?;
    let report = realizer.realize(&selection, &project.realize_options(cancel))?;
    let bundle = if report.is_success() {
        let dist = out.map_or_else(|| project.dist_dir(), Path::to_path_buf);
        Some(write_bundle(&bundle_plan, &report, &dist)?)
    } else {
        None
    };
    Ok(BundleRun {
        run: RealizeRun {
            report,
            builds: realizer.builds(),
            duration: start.elapsed(),
        },
        bundle,
    })
}

/// Fail with a summary when any node of `report` did not realize.
///
/// # Errors
/// Returns `BuildsFailed` counting failed, unbuildable and cancelled nodes.
/// Nodes skipped under fail-fast count as cancelled.
pub fn check_report(report: &RealizeReport) -> Result<(), EngineError> {
    if report.is_success() {
        return Ok(());
    }
    Err(EngineError::BuildsFailed {
        failed: report.failures().len(),
        unbuildable: report.unbuildable(),
        cancelled: report.cancelled().saturating_add(report.skipped()),
    })
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use kiln_config::{Manifest, PartialSettings};
    use kiln_targets::Platform;

    use super::*;

    fn project(dir: &Path, units: &str) -> Project {
        let text = format!(
            "[project]\nname = \"t\"\n[sources.main]\npath = \".\"\nexclude = [\".kiln/**\", \"dist/**\"]\n{units}"
        );
        fs::write(dir.join("kiln.toml"), &text).unwrap();
        let manifest = Manifest::from_toml(&text, "kiln.toml").unwrap();
        let settings = PartialSettings {
            jobs: Some(2),
            ..PartialSettings::default()
        }
        .resolve()
        .unwrap();
        let host: Platform = "linux-x64".parse().unwrap();
        Project::from_parts(dir, manifest, settings, host).unwrap()
    }

    const TWO_UNITS: &str = r#"
[units.a]
source = "main"
command = "mkdir -p $KILN_OUT/lib && echo a > $KILN_OUT/lib/a.txt"
outputs = ["lib"]

[units.b]
deps = ["a"]
command = "mkdir -p $KILN_OUT/bin && cp $KILN_DEP_A/lib/a.txt $KILN_OUT/bin/b.txt"
outputs = ["bin"]

[bundles.app]
contents = [{ unit = "b", output = "bin" }]
"#;

    #[test]
    fn realize_then_rerun_builds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), TWO_UNITS);

        let first = realize(&project, &["b".to_owned()], None, CancelToken::new()).unwrap();
        assert!(first.report.is_success());
        assert_eq!(first.builds, 2);
        check_report(&first.report).unwrap();

        let second = realize(&project, &[], None, CancelToken::new()).unwrap();
        assert_eq!(second.builds, 0);
        assert_eq!(second.report.cached(), 2);
    }

    #[test]
    fn plan_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), TWO_UNITS);
        let run = plan(&project, &[], None).unwrap();
        let b = run.graph.index_of("b").unwrap();
        assert!(run.plan.id(b).is_some());
        assert!(run.cached.is_empty());
        assert!(fs::read_dir(project.store_dir().join("objects"))
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn unknown_unit_is_a_graph_error() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), TWO_UNITS);
        let err = realize(&project, &["nope".to_owned()], None, CancelToken::new()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn bundle_writes_archive_into_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let project = project(dir.path(), TWO_UNITS);
        let run = bundle(&project, "app", "host", Some(out.path()), CancelToken::new()).unwrap();
        let bundle = run.bundle.unwrap();
        assert_eq!(bundle.path, out.path().join("app-linux-x64.tar.gz"));
        assert!(bundle.path.exists());
    }

    #[test]
    fn cancel_during_build_stops_it_and_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(dir.path(), "[units.slow]\ncommand = \"sleep 30\"\n");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            trigger.cancel();
        });

        let run = realize(&project, &[], None, cancel).unwrap();
        handle.join().unwrap();

        assert_eq!(run.report.cancelled(), 1);
        assert_eq!(run.builds, 0);
        assert!(run.duration < Duration::from_secs(10), "took {:?}", run.duration);
        let store = project.store_dir();
        assert_eq!(fs::read_dir(store.join("tmp")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(store.join("objects")).unwrap().count(), 0);
        assert!(check_report(&run.report).is_err());
    }

    #[test]
    fn failed_build_yields_no_bundle_and_exit_code_3() {
        let dir = tempfile::tempdir().unwrap();
        let project = project(
            dir.path(),
            "[units.a]\ncommand = \"exit 7\"\noutputs = [\"bin\"]\n[bundles.app]\ncontents = [{ unit = \"a\", output = \"bin\" }]\n",
        );
        let run = bundle(&project, "app", "host", None, CancelToken::new()).unwrap();
        assert!(run.bundle.is_none());
        let err = check_report(&run.run.report).unwrap_err();
        assert!(matches!(err, EngineError::BuildsFailed { failed: 1, .. }));
        assert_eq!(err.exit_code(), 3);
    }
}
