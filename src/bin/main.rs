use std::{error::Error, process::ExitCode, sync::Arc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use stackctl::{
    cli::{Cli, Commands, parse_args},
    config::{Config, load_config},
    corpus,
    error::{LogsError, StackError},
    logs::collect_logs,
    orchestrator::{OrchestrationRun, Orchestrator},
    poller::CancelToken,
    probe::StackProbe,
    process::ShellLauncher,
    runtime::{ProjectLock, RuntimePaths},
    snapshot::SnapshotManager,
    status::{StatusReport, TestReport},
};

const EXIT_FAILURE: u8 = 1;
const EXIT_ABORTED: u8 = 130;

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            match err.downcast_ref::<StackError>() {
                Some(StackError::Aborted) => ExitCode::from(EXIT_ABORTED),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Everything a command needs to drive the stack.
struct Stack {
    config: Config,
    paths: RuntimePaths,
    launcher: Arc<ShellLauncher>,
    orchestrator: Orchestrator,
    cancel: CancelToken,
}

impl Stack {
    /// Reads persisted service state; mutating commands call this only once
    /// they hold the project lock.
    fn build(
        config: Config,
        paths: RuntimePaths,
        cancel: CancelToken,
    ) -> Result<Self, Box<dyn Error>> {
        let launcher = Arc::new(ShellLauncher::new(paths.clone())?);
        let probe = Arc::new(StackProbe::new(launcher.clone())?);
        let orchestrator =
            Orchestrator::new(config.graph()?, launcher.clone(), probe, cancel.clone());

        Ok(Self {
            config,
            paths,
            launcher,
            orchestrator,
            cancel,
        })
    }

    fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(self.config.snapshot_dir())
    }
}

fn acquire_lock(paths: &RuntimePaths) -> Result<ProjectLock, StackError> {
    let lock = ProjectLock::acquire(paths)?;
    debug!("Holding project lock {:?}", lock.path());
    Ok(lock)
}

fn register_cancel_handler(cancel: &CancelToken) -> Result<(), Box<dyn Error>> {
    let cancel = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("stackctl: interrupt received, aborting after the current step");
        cancel.cancel();
    })?;
    Ok(())
}

fn run(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    match &args.command {
        Commands::Logs {
            service,
            lines,
            kind,
        } => {
            let config = load_config(Some(&args.config))?;
            let paths = RuntimePaths::from_config(&config);
            let names = match service {
                Some(name) if config.services.get(name).is_none() => {
                    return Err(StackError::from(LogsError::ServiceNotFound(name.clone())).into());
                }
                Some(name) => vec![name.clone()],
                None => config.services.names(),
            };

            for (name, tail) in collect_logs(&paths.log_dir, &names, *lines, *kind)? {
                println!("==> {name} ({kind}) <==");
                for line in tail {
                    println!("{line}");
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Snapshots => {
            let config = load_config(Some(&args.config))?;
            let snapshots = SnapshotManager::new(config.snapshot_dir()).list()?;
            if snapshots.is_empty() {
                println!("No snapshots in {}", config.snapshot_dir().display());
            }
            for snapshot in snapshots {
                let sources: Vec<&str> = snapshot
                    .sources
                    .iter()
                    .map(|source| source.name.as_str())
                    .collect();
                println!(
                    "{:<22} {}  {}",
                    snapshot.id,
                    snapshot.created_at.to_rfc3339(),
                    sources.join(", ")
                );
            }
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let config = load_config(Some(&args.config))?;
    let paths = RuntimePaths::from_config(&config);
    let cancel = CancelToken::new();
    let _lock = if args.command.is_mutating() {
        let lock = acquire_lock(&paths)?;
        register_cancel_handler(&cancel)?;
        Some(lock)
    } else {
        None
    };
    let stack = Stack::build(config, paths, cancel)?;

    match args.command {
        Commands::Start => {
            info!("Starting stack from {:?}", stack.config.project_dir);
            let run = stack.orchestrator.start()?;
            Ok(report_run(&run))
        }
        Commands::Stop => {
            let run = stack.orchestrator.stop()?;
            Ok(report_run(&run))
        }
        Commands::Restart => {
            let (stop, start) = stack.orchestrator.restart()?;
            report_run(&stop);
            Ok(report_run(&start))
        }
        Commands::Status { json, no_color } => {
            let report = StatusReport::collect(&stack.orchestrator, stack.launcher.as_ref());
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render(!no_color));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Test => {
            let report = TestReport::run(&stack.orchestrator);
            print!("{}", report.render());
            let failed = report.failed();
            if failed.is_empty() {
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("Failing services: {}", failed.join(", "));
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        }
        Commands::Corpus => {
            corpus::ingest(&stack.config, &stack.paths, &stack.cancel)?;
            println!("Corpus ingestion complete");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backup { safe } => {
            let snapshots = stack.snapshots();
            let directories = stack.config.data_dirs();
            if safe {
                let backup = stack.orchestrator.safe_backup(&snapshots, &directories)?;
                if let Some(stop) = &backup.stop {
                    report_run(stop);
                }
                println!("Created snapshot {}", backup.snapshot.id);
                match &backup.restart {
                    Some(start) => Ok(report_run(start)),
                    None => Ok(ExitCode::SUCCESS),
                }
            } else {
                let running = stack.orchestrator.running_services();
                if !running.is_empty() {
                    warn!(
                        "Backing up while services are running ({}); use --safe for a consistent copy",
                        running.join(", ")
                    );
                }
                let snapshot = snapshots.backup(&directories)?;
                println!("Created snapshot {}", snapshot.id);
                Ok(ExitCode::SUCCESS)
            }
        }
        Commands::Restore { snapshot } => {
            let snapshots = stack.snapshots();
            let restored =
                stack
                    .orchestrator
                    .restore(&snapshots, &snapshot, &stack.config.data_dirs())?;
            println!("Restored snapshot {}", restored.id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { .. } | Commands::Snapshots => Ok(ExitCode::SUCCESS),
    }
}

/// Prints a run and maps it to the process exit code.
fn report_run(run: &OrchestrationRun) -> ExitCode {
    println!("{run}");
    if run.aborted {
        ExitCode::from(EXIT_ABORTED)
    } else if run.success() {
        ExitCode::SUCCESS
    } else {
        eprintln!("Failed services: {}", run.failed_services().join(", "));
        ExitCode::from(EXIT_FAILURE)
    }
}
