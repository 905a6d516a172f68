use std::{fmt, time::Duration};

use thiserror::Error;

/// Why a run ended in [`LifecycleState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("no free port in the configured range")]
    NoFreePort,
    #[error("patching the server config failed: {0}")]
    ConfigPatch(String),
    #[error("restoring the last save failed: {0}")]
    Restore(String),
    #[error("server launch failed: {0}")]
    ServerLaunch(String),
    #[error("server did not report readiness in time")]
    ServerStartTimeout,
    #[error("server exited unexpectedly")]
    ServerExited,
    #[error("tunnel failed: {0}")]
    Tunnel(String),
    #[error("bot launch failed: {0}")]
    BotLaunch(String),
    #[error("bot did not report readiness in time")]
    BotStartTimeout,
    #[error("bot exited unexpectedly")]
    BotExited,
    #[error("server did not confirm the world was saved in time")]
    ServerStopTimeout,
    #[error("writing to a child failed: {0}")]
    Write(String),
    #[error("stopped by a termination signal before startup completed")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    PortAllocated,
    ConfigPatched,
    ServerStarting,
    ServerRunning,
    TunnelEstablishing,
    TunnelUp,
    BotStarting,
    Operational,
    ShuttingDown,
    ServerStopped,
    Terminated,
    Failed(FailureReason),
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Failed(_))
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Failed(reason) => write!(f, "Failed({reason})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// What a run did, in order. Tests assert on it; `main` only logs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    Entered(LifecycleState),
    ServerReady { reported: String, measured: Duration },
    ServerCommandSent(String),
    ServerStopObserved,
    BotMessageSent(String),
    AdminCommand(crate::relay::AdminCommand),
    BackupStarted,
    BackupFinished,
    BackupFailed(String),
    BackupSkipped,
    BotStopSent,
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::Entered(state) => write!(f, "entered {state}"),
            Milestone::ServerReady { reported, measured } => write!(
                f,
                "server ready (reported {reported}, measured {:.1}s)",
                measured.as_secs_f64()
            ),
            Milestone::ServerCommandSent(cmd) => write!(f, "server <- {cmd}"),
            Milestone::ServerStopObserved => f.write_str("server stop marker seen"),
            Milestone::BotMessageSent(text) => write!(f, "bot <- {text}"),
            Milestone::AdminCommand(cmd) => write!(f, "admin command {cmd:?}"),
            Milestone::BackupStarted => f.write_str("backup started"),
            Milestone::BackupFinished => f.write_str("backup finished"),
            Milestone::BackupFailed(err) => write!(f, "backup failed: {err}"),
            Milestone::BackupSkipped => f.write_str("backup skipped"),
            Milestone::BotStopSent => f.write_str("bot stop sentinel sent"),
        }
    }
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<Milestone>,
}

impl Journal {
    pub fn push(&mut self, m: Milestone) {
        self.entries.push(m);
    }

    pub fn entries(&self) -> &[Milestone] {
        &self.entries
    }
}

#[cfg(test)]
impl Journal {
    pub fn position(&self, pred: impl Fn(&Milestone) -> bool) -> Option<usize> {
        self.entries.iter().position(pred)
    }

    pub fn contains(&self, m: &Milestone) -> bool {
        self.entries.contains(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_state_displays_its_reason() {
        let s = LifecycleState::Failed(FailureReason::Tunnel("timed out".to_string()));
        assert_eq!(s.to_string(), "Failed(tunnel failed: timed out)");
        assert_eq!(LifecycleState::TunnelUp.to_string(), "TunnelUp");
        assert!(s.is_terminal());
        assert!(!LifecycleState::Operational.is_terminal());
    }
}
