use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;

mod archive;
mod backup;
mod config;
mod console;
mod drive;
mod lifecycle;
mod logging;
mod minecraft;
mod orchestrator;
mod port_alloc;
mod relay;
mod signals;
mod tunnel;

use orchestrator::{Inputs, Orchestrator, RestorePolicy};

/// Supervises a game server, its tunnel and its chat bot.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Relaunch after a reset: skip the restore prompt and always pull the last save.
    #[arg(long)]
    reset: bool,

    /// Path to the TOML config; defaults are used when it does not exist.
    #[arg(long, default_value = "warden.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match config::AgentConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("warden: {}", orchestrator::format_error_chain(&err));
            return ExitCode::FAILURE;
        }
    };
    let log = logging::init(&cfg.logging.dir);
    if let Some(path) = &log.path {
        tracing::info!(path = %path.display(), "logging to file");
    }

    let store: Arc<dyn backup::ObjectStore> = match drive::DriveStore::from_config(&cfg.backup) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %orchestrator::format_error_chain(&err), "remote store unavailable");
            return ExitCode::FAILURE;
        }
    };

    let mut inputs = Inputs {
        operator: console::spawn_stdin_reader(),
        external_stop: signals::spawn_listener(),
    };
    let mut restore = if args.reset {
        RestorePolicy::Always
    } else {
        RestorePolicy::Prompt
    };

    loop {
        let report = Orchestrator::new(cfg.clone(), store.clone(), restore)
            .run(&mut inputs)
            .await;
        for milestone in report.journal.entries() {
            tracing::debug!("{milestone}");
        }
        if let Some(boot) = &report.boot_time {
            tracing::info!(boot_time = %boot, state = %report.state, "run finished");
        }

        if report.restart && !report.state.is_terminal() {
            tracing::info!("restarting from the last save");
            restore = RestorePolicy::Always;
            continue;
        }
        return match report.state {
            lifecycle::LifecycleState::Failed(reason) => {
                tracing::error!(%reason, "warden stopped after a failure");
                ExitCode::FAILURE
            }
            _ => ExitCode::SUCCESS,
        };
    }
}
