//! Line-oriented supervision of child processes.
//!
//! A child is launched with its stdin/stdout redirected to pipes. The
//! [`ProcessHandle`] half writes lines and controls termination; the
//! [`OutputLines`] half is the single consumer of the child's stdout.

mod error;
mod readiness;
mod supervisor;

pub use error::ProcessError;
pub use readiness::{MATCHED, ReadinessRule};
pub use supervisor::{ManagedProcess, OutputLines, ProcessHandle, launch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopping,
    Exited { code: Option<i32> },
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        !matches!(self, ProcessState::Exited { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStatus {
    pub label: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
}
