use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use semver::Version;
use serde::Serialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

use yarn_models::{
    core::{events::LogSink, settings::ManagerConfig},
    models::{
        CancellationToken, InstalledModel, IntegrityStatus, ModelLifecycleManager,
        ModelUpdateService,
    },
};

const LOG_ENV: &str = "YARN_MODELS_LOG";

#[derive(Parser)]
#[command(name = "yarn-models", about = "Manage local AI model artifacts", version)]
struct Cli {
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,
    /// Registry URL or path.
    #[arg(long, global = true)]
    registry: Option<String>,
    /// Host application version used for compatibility checks.
    #[arg(long, global = true, default_value = env!("CARGO_PKG_VERSION"))]
    host_version: Version,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    CheckUpdates,
    Install {
        model_id: String,
        version: Option<Version>,
    },
    Update {
        model_id: String,
        version: Option<Version>,
    },
    UpdateAll,
    Rollback {
        model_id: String,
        version: Option<Version>,
    },
    List,
    Cleanup {
        keep_count: Option<usize>,
    },
    Verify,
    Uninstall {
        model_id: String,
    },
    /// Download the installed version again.
    Reinstall {
        model_id: String,
    },
    /// Adopt a file already on disk.
    RegisterLocal {
        model_id: String,
        version: Version,
        path: PathBuf,
    },
    /// Move a corrupted local state file aside and start empty.
    ResetState,
    AutoUpdate {
        #[arg(value_enum)]
        toggle: Toggle,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn setup_logging(verbose: u8) {
    let default_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load_config(cli: &Cli) -> Result<ManagerConfig> {
    let mut config = ManagerConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.models_dir {
        config.models_dir = dir.clone();
    }
    if let Some(registry) = &cli.registry {
        config.registry_url = Some(registry.clone());
    }
    Ok(config)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(value).context("serialize output")?
        );
    } else {
        text(value);
    }
    Ok(())
}

fn print_installed(model: &InstalledModel) {
    println!(
        "{} {} {} ({} bytes)",
        model.model_id,
        model.version,
        model.file_path.display(),
        model.size_bytes
    );
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let manager = ModelLifecycleManager::new(config)
        .context("initialize model manager")?
        .with_event_sink(Arc::new(LogSink));
    let cancel = CancellationToken::new();
    let host = &cli.host_version;
    let json = cli.json;

    match cli.command {
        Command::CheckUpdates => {
            let report = manager.check_for_updates()?;
            emit(json, &report, |report| {
                for update in &report.updates {
                    println!(
                        "{}: {} -> {} ({:?})",
                        update.model_id, update.from, update.to, update.kind
                    );
                }
                for orphan in &report.orphaned {
                    println!(
                        "{}: {} orphaned ({:?})",
                        orphan.model_id, orphan.installed, orphan.reason
                    );
                }
                if report.updates.is_empty() {
                    println!("All installed models are up to date");
                }
            })
        }
        Command::Install { model_id, version } => {
            let installed = manager.install(&model_id, version.as_ref(), host, &cancel)?;
            emit(json, &installed, print_installed)
        }
        Command::Update { model_id, version } => {
            let installed = manager.update(&model_id, version.as_ref(), host, &cancel)?;
            emit(json, &installed, print_installed)
        }
        Command::UpdateAll => {
            let workers = manager.config().download_slots();
            let service = ModelUpdateService::new(Arc::new(manager), host.clone(), workers)?;
            let sweep = service.update_all()?;
            service.shutdown();
            emit(json, &sweep, |sweep| {
                sweep.updated.iter().for_each(print_installed);
                for failure in &sweep.failed {
                    println!("{}: failed: {}", failure.model_id, failure.error);
                }
            })
        }
        Command::Rollback { model_id, version } => {
            let installed = manager.rollback(&model_id, version.as_ref())?;
            emit(json, &installed, print_installed)
        }
        Command::List => {
            let installed = manager.list_installed()?;
            emit(json, &installed, |models| {
                models.iter().for_each(print_installed);
            })
        }
        Command::Cleanup { keep_count } => {
            let keep = keep_count.unwrap_or(manager.config().backup_retention);
            let report = manager.cleanup(keep)?;
            emit(json, &report, |report| {
                for record in &report.pruned {
                    println!("pruned backup {} {}", record.model_id, record.version);
                }
                for path in &report.removed_artifacts {
                    println!("removed {}", path.display());
                }
                for failure in &report.failures {
                    println!("{}: {}", failure.model_id, failure.reason);
                }
            })
        }
        Command::Verify => {
            let reports = manager.verify_installed()?;
            let healthy = reports
                .iter()
                .all(|report| report.status == IntegrityStatus::Ok);
            emit(json, &reports, |reports| {
                for report in reports {
                    println!("{} {}: {:?}", report.model_id, report.version, report.status);
                }
            })?;
            if !healthy {
                anyhow::bail!("one or more installed models failed verification");
            }
            Ok(())
        }
        Command::Uninstall { model_id } => {
            let removed = manager.uninstall(&model_id)?;
            emit(json, &removed, print_installed)
        }
        Command::Reinstall { model_id } => {
            let installed = manager.reinstall(&model_id, &cancel)?;
            emit(json, &installed, print_installed)
        }
        Command::RegisterLocal {
            model_id,
            version,
            path,
        } => {
            let installed = manager.register_local(&model_id, &version, &path)?;
            emit(json, &installed, print_installed)
        }
        Command::ResetState => {
            let moved = manager.reset_corrupted_state()?;
            emit(json, &moved, |moved| match moved {
                Some(path) => println!("Corrupted state moved to {}", path.display()),
                None => println!("Local state is healthy; nothing to reset"),
            })
        }
        Command::AutoUpdate { toggle } => {
            let enabled = matches!(toggle, Toggle::On);
            manager.set_auto_update(enabled)?;
            emit(json, &enabled, |enabled| {
                println!("auto-update {}", if *enabled { "on" } else { "off" })
            })
        }
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(error) = run(cli) {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}
