#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use kiln_config::{PartialSettings, SandboxMode};
use kiln_engine::publish::{DirectoryBackend, HttpBackend, PublishAction, ReleaseBackend};
use kiln_engine::realize::{NodeOutcome, PlanEntry, RealizeReport};
use kiln_engine::{ops, EngineError, Project};
use kiln_sandbox::CancelToken;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn Error>>;

/// Lines of a failed build's log shown on the terminal.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "A content-addressed build orchestrator")]
#[command(version)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new kiln project
    Init {
        /// Project name; creates a directory of that name when given
        #[arg(long)]
        name: Option<String>,
    },
    /// Realize units and their dependencies (all units when none are named)
    Realize {
        /// Units to realize
        units: Vec<String>,
        /// Target platform for units without one (defaults to host)
        #[arg(long)]
        target: Option<String>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Print derivation identifiers and levels without building
    Plan {
        /// Units to plan
        units: Vec<String>,
        /// Target platform for units without one (defaults to host)
        #[arg(long)]
        target: Option<String>,
    },
    /// Realize a bundle's contents and write its archive
    Bundle {
        /// Bundle name from kiln.toml
        name: String,
        /// Platform to bundle for
        #[arg(long)]
        target: String,
        /// Output directory (defaults to the configured dist directory)
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Bundle for each target and publish the archives under a release label
    Publish {
        /// Release label (e.g. v1.2.0)
        label: String,
        /// Bundle name from kiln.toml
        bundle: String,
        /// Platforms to publish; repeat for a matrix
        #[arg(long, required = true)]
        target: Vec<String>,
        /// Replace assets whose content differs
        #[arg(long)]
        overwrite: bool,
        /// Publish into a local directory
        #[arg(long, conflicts_with = "url", required_unless_present = "url")]
        dest: Option<PathBuf>,
        /// Publish to an HTTP endpoint (token from KILN_RELEASE_TOKEN)
        #[arg(long)]
        url: Option<String>,
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Remove the store and dist directories
    Clean,
    /// Check host, toolchains and sandbox support
    Doctor,
}

/// Flags forming the command-line configuration layer.
#[derive(Debug, Args)]
struct BuildArgs {
    /// Maximum concurrent builds
    #[arg(long, short = 'j')]
    jobs: Option<usize>,
    /// Per-build timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Stop scheduling after the first failing level
    #[arg(long)]
    fail_fast: bool,
    /// Isolation mode: hermetic or namespaced
    #[arg(long)]
    sandbox: Option<SandboxMode>,
}

impl BuildArgs {
    fn settings(&self) -> PartialSettings {
        PartialSettings {
            jobs: self.jobs,
            timeout_secs: self.timeout,
            fail_fast: self.fail_fast.then_some(true),
            sandbox: self.sandbox,
            ..PartialSettings::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Init { name } => cmd_init(name),
        Command::Realize {
            units,
            target,
            build,
        } => cmd_realize(&units, target.as_deref(), &build),
        Command::Plan { units, target } => cmd_plan(&units, target.as_deref()),
        Command::Bundle {
            name,
            target,
            out,
            build,
        } => cmd_bundle(&name, &target, out, &build),
        Command::Publish {
            label,
            bundle,
            target,
            overwrite,
            dest,
            url,
            build,
        } => cmd_publish(&label, &bundle, &target, overwrite, dest, url, &build),
        Command::Clean => cmd_clean(),
        Command::Doctor => cmd_doctor(),
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(exit_code(err.as_ref()));
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn exit_code(err: &(dyn Error + 'static)) -> i32 {
    err.downcast_ref::<EngineError>()
        .map_or(1, EngineError::exit_code)
}

/// A token cancelled by Ctrl-C or SIGTERM. Must run before any worker
/// threads are started.
fn interrupt_token() -> Result<CancelToken, Box<dyn Error>> {
    let cancel = CancelToken::new();
    kiln_sandbox::cancel_on_interrupt(&cancel)?;
    Ok(cancel)
}

fn load_project(cli: PartialSettings) -> Result<Project, Box<dyn Error>> {
    let cwd = std::env::current_dir()?;
    Ok(Project::load(&cwd, cli)?)
}

fn cmd_init(name: Option<String>) -> CliResult {
    let cwd = std::env::current_dir()?;

    let (project_name, project_dir) = match name {
        Some(name) => {
            let dir = cwd.join(&name);
            (name, dir)
        }
        None => {
            let name = cwd
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("my-project")
                .to_owned();
            (name, cwd.clone())
        }
    };

    kiln_engine::init_project(&project_name, &project_dir)?;

    eprintln!(
        "    Created project `{project_name}` at {}",
        project_dir.display()
    );
    eprintln!();
    eprintln!("  To get started:");
    if project_dir != cwd {
        eprintln!("    cd {project_name}");
    }
    eprintln!("    kiln realize");
    Ok(())
}

fn cmd_realize(units: &[String], target: Option<&str>, build: &BuildArgs) -> CliResult {
    let cancel = interrupt_token()?;
    let project = load_project(build.settings())?;
    let run = ops::realize(&project, units, target, cancel)?;
    print_problems(&run.report);
    ops::check_report(&run.report)?;

    eprintln!(
        "    Finished {} derivation(s) in {:.2}s ({} built, {} cached)",
        run.report.outcomes.len(),
        run.duration.as_secs_f64(),
        run.report.built(),
        run.report.cached()
    );
    for (name, outcome) in &run.report.outcomes {
        if let Some(realized) = outcome.realized() {
            println!("{name}\t{}", realized.out.display());
        }
    }
    Ok(())
}

fn cmd_plan(units: &[String], target: Option<&str>) -> CliResult {
    let project = load_project(PartialSettings::default())?;
    let run = ops::plan(&project, units, target)?;

    for (depth, level) in run.plan.selection.levels.iter().enumerate() {
        println!("level {}", depth.saturating_add(1));
        for &index in level {
            let Some(node) = run.graph.node(index) else {
                continue;
            };
            let status = match run.plan.entry(index) {
                Some(PlanEntry::Ready(planned)) => {
                    let mode = if planned.env.is_cross() { "cross" } else { "native" };
                    let cached = if run.cached.contains(&index) {
                        " (cached)"
                    } else {
                        ""
                    };
                    format!("{} {mode}{cached}", planned.id)
                }
                Some(PlanEntry::Unsupported { host, target }) => {
                    format!("unsupported: no toolchain builds {target} on {host}")
                }
                Some(PlanEntry::Blocked { cause }) => format!("blocked by `{cause}`"),
                None => "not planned".to_owned(),
            };
            println!("  {}\t{}\t{status}", node.name, node.platform);
        }
    }
    Ok(())
}

fn cmd_bundle(name: &str, target: &str, out: Option<PathBuf>, build: &BuildArgs) -> CliResult {
    let cancel = interrupt_token()?;
    let project = load_project(build.settings())?;
    let run = ops::bundle(&project, name, target, out.as_deref(), cancel)?;
    print_problems(&run.run.report);
    ops::check_report(&run.run.report)?;

    let Some(bundle) = run.bundle else {
        return Err(format!("bundle `{name}` was not written").into());
    };
    eprintln!(
        "    Finished bundle `{}` for {} in {:.2}s",
        bundle.name,
        bundle.platform,
        run.run.duration.as_secs_f64()
    );
    println!("{}  {}", bundle.sha256, bundle.path.display());
    Ok(())
}

fn cmd_publish(
    label: &str,
    bundle_name: &str,
    targets: &[String],
    overwrite: bool,
    dest: Option<PathBuf>,
    url: Option<String>,
    build: &BuildArgs,
) -> CliResult {
    let backend: Box<dyn ReleaseBackend> = match (dest, url) {
        (Some(dir), _) => Box::new(DirectoryBackend::new(dir)),
        (None, Some(url)) => Box::new(HttpBackend::from_env(&url)),
        (None, None) => return Err("either --dest or --url is required".into()),
    };
    kiln_engine::publish::validate_label(label).map_err(EngineError::from)?;

    let cancel = interrupt_token()?;
    let project = load_project(build.settings())?;
    let mut bundles = Vec::with_capacity(targets.len());
    for target in targets {
        let run = ops::bundle(&project, bundle_name, target, None, cancel.clone())?;
        print_problems(&run.run.report);
        ops::check_report(&run.run.report)?;
        if let Some(bundle) = run.bundle {
            eprintln!("     Bundled {} ({})", bundle.asset_name(), bundle.platform);
            bundles.push(bundle);
        }
    }

    let report = kiln_engine::publish(backend.as_ref(), label, &bundles, overwrite)
        .map_err(EngineError::from)?;
    for asset in &report.assets {
        let verb = match asset.action {
            PublishAction::Published => "Published",
            PublishAction::Replaced => "Replaced",
            PublishAction::Unchanged => "Unchanged",
        };
        eprintln!("  {verb:>10} {} ({})", asset.asset, asset.platform);
    }
    eprintln!(
        "    Finished release `{}` at {}",
        report.label, report.location
    );
    Ok(())
}

fn print_problems(report: &RealizeReport) {
    for (name, outcome) in &report.outcomes {
        match outcome {
            NodeOutcome::Failed(err) => {
                eprintln!("error: {name}: {err}");
                if let Some(log) = err.log() {
                    let tail = kiln_sandbox::read_log_tail(log, LOG_TAIL_LINES);
                    if !tail.is_empty() {
                        eprintln!("  --- last {LOG_TAIL_LINES} lines of {} ---", log.display());
                        for line in tail.lines() {
                            eprintln!("  | {line}");
                        }
                    }
                }
            }
            NodeOutcome::Unbuildable { cause } => {
                eprintln!("  [--] {name}: not built, `{cause}` failed");
            }
            NodeOutcome::Cancelled => eprintln!("  [--] {name}: cancelled"),
            NodeOutcome::Skipped => eprintln!("  [--] {name}: skipped (fail-fast)"),
            NodeOutcome::Built(_) | NodeOutcome::Cached(_) => {}
        }
    }
}

fn cmd_clean() -> CliResult {
    let project = load_project(PartialSettings::default())?;

    kiln_util::fs::remove_dir_all_if_exists(&project.store_dir())?;
    kiln_util::fs::remove_dir_all_if_exists(&project.dist_dir())?;

    eprintln!("    Cleaned build artifacts");
    Ok(())
}

fn cmd_doctor() -> CliResult {
    eprintln!("Checking environment...");
    eprintln!();

    let mut issues = 0u32;

    let host = match kiln_targets::host_platform() {
        Ok(host) => {
            eprintln!("  [ok] Host platform: {host} ({})", host.triple());
            Some(host)
        }
        Err(e) => {
            eprintln!("  [!!] Host platform: {e}");
            issues = issues.saturating_add(1);
            None
        }
    };

    let cwd = std::env::current_dir()?;
    let project = if cwd.join(kiln_config::manifest::MANIFEST_FILE).exists() {
        match Project::load(&cwd, PartialSettings::default()) {
            Ok(project) => {
                eprintln!(
                    "  [ok] Project: {} ({} unit(s))",
                    project.manifest.project.name,
                    project.manifest.units.len()
                );
                Some(project)
            }
            Err(e) => {
                eprintln!("  [!!] kiln.toml: {e}");
                issues = issues.saturating_add(1);
                None
            }
        }
    } else {
        eprintln!("  [--] No kiln.toml in current directory");
        None
    };

    if let Some(host) = host {
        let (registry, path_dirs) = match &project {
            Some(project) => (project.registry.clone(), project.settings.path.clone()),
            None => (
                kiln_toolchain::ToolchainRegistry::builtin(),
                kiln_config::settings::DEFAULT_PATH
                    .iter()
                    .map(PathBuf::from)
                    .collect(),
            ),
        };
        for target in registry.targets_for(&host) {
            let env = match kiln_toolchain::resolve_environment(&host, &target, &registry, &path_dirs)
            {
                Ok(env) => env,
                Err(e) => {
                    eprintln!("  [!!] {target}: {e}");
                    issues = issues.saturating_add(1);
                    continue;
                }
            };
            let probes = kiln_toolchain::probe(&env);
            let missing: Vec<&str> = probes
                .iter()
                .filter(|p| !p.found())
                .map(|p| p.program.as_str())
                .collect();
            if missing.is_empty() {
                eprintln!("  [ok] {target}: {} toolchain", env.toolchain);
            } else if target == host {
                eprintln!("  [!!] {target}: missing {}", missing.join(", "));
                issues = issues.saturating_add(1);
            } else {
                eprintln!(
                    "  [--] {target}: cross toolchain not installed (missing {})",
                    missing.join(", ")
                );
            }
        }
    }

    match kiln_sandbox::bwrap_available() {
        Some(path) => eprintln!("  [ok] Namespaced sandbox: bwrap ({})", path.display()),
        None => {
            let needed = project
                .as_ref()
                .is_some_and(|p| p.settings.sandbox == SandboxMode::Namespaced);
            if needed {
                eprintln!("  [!!] Namespaced sandbox: bwrap not found on PATH");
                issues = issues.saturating_add(1);
            } else {
                eprintln!(
                    "  [--] Namespaced sandbox: bwrap not found (builds can reach the host filesystem and network)"
                );
            }
        }
    }

    eprintln!();
    if issues > 0 {
        eprintln!("{issues} issue(s) found — fix them before building");
        Err(format!("{issues} issue(s) found").into())
    } else {
        eprintln!("All checks passed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use clap::CommandFactory;

    // ── Subcommand parsing ─────────────────────────────────────────

    #[test]
    fn parse_init_defaults() {
        let cli = Cli::try_parse_from(["kiln", "init"]).unwrap();
        match cli.command {
            Command::Init { name } => assert!(name.is_none()),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn parse_init_with_name() {
        let cli = Cli::try_parse_from(["kiln", "init", "--name", "my-app"]).unwrap();
        match cli.command {
            Command::Init { name } => assert_eq!(name.as_deref(), Some("my-app")),
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn parse_realize_defaults() {
        let cli = Cli::try_parse_from(["kiln", "realize"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Command::Realize {
                units,
                target,
                build,
            } => {
                assert!(units.is_empty());
                assert!(target.is_none());
                assert_eq!(build.settings(), PartialSettings::default());
            }
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn parse_realize_all_flags() {
        let cli = Cli::try_parse_from([
            "kiln",
            "realize",
            "core",
            "cli@windows-x64",
            "--target",
            "linux-arm64",
            "--jobs",
            "8",
            "--timeout",
            "60",
            "--fail-fast",
            "--sandbox",
            "namespaced",
        ])
        .unwrap();
        match cli.command {
            Command::Realize {
                units,
                target,
                build,
            } => {
                assert_eq!(units, vec!["core", "cli@windows-x64"]);
                assert_eq!(target.as_deref(), Some("linux-arm64"));
                let settings = build.settings();
                assert_eq!(settings.jobs, Some(8));
                assert_eq!(settings.timeout_secs, Some(60));
                assert_eq!(settings.fail_fast, Some(true));
                assert_eq!(settings.sandbox, Some(SandboxMode::Namespaced));
            }
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn parse_realize_short_jobs() {
        let cli = Cli::try_parse_from(["kiln", "realize", "-j", "3"]).unwrap();
        match cli.command {
            Command::Realize { build, .. } => assert_eq!(build.jobs, Some(3)),
            other => panic!("expected Realize, got {other:?}"),
        }
    }

    #[test]
    fn parse_plan_with_units() {
        let cli = Cli::try_parse_from(["kiln", "plan", "a", "b"]).unwrap();
        match cli.command {
            Command::Plan { units, target } => {
                assert_eq!(units, vec!["a", "b"]);
                assert!(target.is_none());
            }
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn parse_bundle() {
        let cli = Cli::try_parse_from([
            "kiln", "bundle", "cgt", "--target", "windows-x64", "--out", "/tmp/out",
        ])
        .unwrap();
        match cli.command {
            Command::Bundle {
                name, target, out, ..
            } => {
                assert_eq!(name, "cgt");
                assert_eq!(target, "windows-x64");
                assert_eq!(out, Some(PathBuf::from("/tmp/out")));
            }
            other => panic!("expected Bundle, got {other:?}"),
        }
    }

    #[test]
    fn parse_publish_matrix_to_directory() {
        let cli = Cli::try_parse_from([
            "kiln",
            "publish",
            "v1.0.0",
            "cgt",
            "--target",
            "linux-x64",
            "--target",
            "windows-x64",
            "--dest",
            "releases",
            "--overwrite",
        ])
        .unwrap();
        match cli.command {
            Command::Publish {
                label,
                bundle,
                target,
                overwrite,
                dest,
                url,
                ..
            } => {
                assert_eq!(label, "v1.0.0");
                assert_eq!(bundle, "cgt");
                assert_eq!(target, vec!["linux-x64", "windows-x64"]);
                assert!(overwrite);
                assert_eq!(dest, Some(PathBuf::from("releases")));
                assert!(url.is_none());
            }
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn parse_publish_to_url() {
        let cli = Cli::try_parse_from([
            "kiln",
            "publish",
            "v1",
            "cgt",
            "--target",
            "linux-x64",
            "--url",
            "https://releases.example.com",
        ])
        .unwrap();
        match cli.command {
            Command::Publish { dest, url, overwrite, .. } => {
                assert!(dest.is_none());
                assert_eq!(url.as_deref(), Some("https://releases.example.com"));
                assert!(!overwrite);
            }
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn parse_clean() {
        let cli = Cli::try_parse_from(["kiln", "clean"]).unwrap();
        assert!(matches!(cli.command, Command::Clean));
    }

    #[test]
    fn parse_doctor() {
        let cli = Cli::try_parse_from(["kiln", "doctor"]).unwrap();
        assert!(matches!(cli.command, Command::Doctor));
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::try_parse_from(["kiln", "realize", "--verbose"]).unwrap();
        assert!(cli.verbose);
        let cli = Cli::try_parse_from(["kiln", "-v", "plan"]).unwrap();
        assert!(cli.verbose);
    }

    // ── Errors ─────────────────────────────────────────────────────

    #[test]
    fn error_no_subcommand() {
        let err = Cli::try_parse_from(["kiln"]).unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn error_unknown_subcommand() {
        let err = Cli::try_parse_from(["kiln", "build"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn error_bad_sandbox_mode() {
        let err = Cli::try_parse_from(["kiln", "realize", "--sandbox", "docker"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn error_bundle_requires_target() {
        let err = Cli::try_parse_from(["kiln", "bundle", "cgt"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn error_publish_requires_destination() {
        let err =
            Cli::try_parse_from(["kiln", "publish", "v1", "cgt", "--target", "linux-x64"])
                .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn error_publish_dest_and_url_conflict() {
        let err = Cli::try_parse_from([
            "kiln", "publish", "v1", "cgt", "--target", "linux-x64", "--dest", "d", "--url",
            "http://x",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn error_clean_takes_no_args() {
        let result = Cli::try_parse_from(["kiln", "clean", "extra"]);
        assert!(result.is_err());
    }

    #[test]
    fn error_jobs_not_a_number() {
        let err = Cli::try_parse_from(["kiln", "realize", "--jobs", "many"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    // ── Help and version ───────────────────────────────────────────

    #[test]
    fn help_flag_on_root() {
        let err = Cli::try_parse_from(["kiln", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn version_flag() {
        let err = Cli::try_parse_from(["kiln", "--version"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    }

    #[test]
    fn root_help_render_includes_all_subcommands() {
        let help = Cli::command().render_help().to_string();
        for sub in ["init", "realize", "plan", "bundle", "publish", "clean", "doctor"] {
            assert!(help.contains(sub), "help is missing `{sub}`");
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    // ── Exit codes ─────────────────────────────────────────────────

    #[test]
    fn engine_errors_keep_their_exit_codes() {
        let err: Box<dyn Error> = Box::new(EngineError::BuildsFailed {
            failed: 1,
            unbuildable: 0,
            cancelled: 0,
        });
        assert_eq!(exit_code(err.as_ref()), 3);

        let err: Box<dyn Error> = Box::new(EngineError::NoManifest {
            path: "/x".to_owned(),
        });
        assert_eq!(exit_code(err.as_ref()), 2);

        let err: Box<dyn Error> = "plain failure".into();
        assert_eq!(exit_code(err.as_ref()), 1);
    }
}
