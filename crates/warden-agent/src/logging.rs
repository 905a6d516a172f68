//! Console plus per-run log file.
//!
//! Every run gets its own file under the configured logs directory, named
//! after the start time. `RUST_LOG` filters both outputs (default `info`).

use std::path::{Path, PathBuf};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    pub path: Option<PathBuf>,
}

pub fn log_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("warden_{}.log", now.format("%Y_%m_%d_%H_%M_%S"))
}

/// Call once from `main` and keep the guard alive until exit so buffered
/// lines reach the file.
pub fn init(dir: &Path) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(err) = std::fs::create_dir_all(dir) {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        tracing::warn!(dir = %dir.display(), error = %err, "cannot create logs dir; logging to console only");
        return LogGuard {
            _file_guard: None,
            path: None,
        };
    }

    let name = log_file_name(chrono::Local::now());
    let file_appender = tracing_appender::rolling::never(dir, &name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    LogGuard {
        _file_guard: Some(guard),
        path: Some(dir.join(name)),
    }
}
