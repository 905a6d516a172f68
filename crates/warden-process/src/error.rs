use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// Executable missing, working directory invalid, or an empty command.
    #[error("failed to launch {label}: {source}")]
    Launch {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing to stdin failed, typically because the child already exited.
    #[error("failed to write to {label}: {source}")]
    Write {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} did not print the expected line within {timeout:?}")]
    Timeout { label: String, timeout: Duration },

    /// Output reached end-of-stream before the expected line appeared.
    #[error("{label} exited before printing the expected line")]
    Exited { label: String },
}

impl ProcessError {
    pub fn label(&self) -> &str {
        match self {
            ProcessError::Launch { label, .. }
            | ProcessError::Write { label, .. }
            | ProcessError::Timeout { label, .. }
            | ProcessError::Exited { label } => label,
        }
    }
}
