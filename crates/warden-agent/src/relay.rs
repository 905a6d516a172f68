//! Line protocol spoken with the chat bot.
//!
//! Outbound: `<channel-name><body>\n` on the bot's stdin, no delimiter
//! between name and body. Inbound: plain lines on the bot's stdout, some of
//! which carry an admin command (`<prefix> save`, `<prefix> exit`).

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, info};
use warden_process::{ProcessError, ProcessHandle};

use crate::config::BotConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Admin,
    Users,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    pub channel: Channel,
    pub body: String,
}

impl RelayMessage {
    pub fn admin(body: impl Into<String>) -> Self {
        Self {
            channel: Channel::Admin,
            body: body.into(),
        }
    }

    pub fn users(body: impl Into<String>) -> Self {
        Self {
            channel: Channel::Users,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("bot is not ready to relay messages yet")]
    NotReady,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    Save,
    Exit,
}

/// Recognizes `<prefix> save` / `<prefix> exit` in a bot stdout line,
/// case-insensitively. A `:` after the prefix is tolerated.
pub fn parse_bot_line(line: &str, prefix: &str) -> Option<AdminCommand> {
    let lower = line.trim().to_lowercase();
    let rest = lower.strip_prefix(&prefix.to_lowercase())?;
    let rest = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    match rest.split_whitespace().next()? {
        "save" => Some(AdminCommand::Save),
        "exit" => Some(AdminCommand::Exit),
        _ => None,
    }
}

/// `[2024-01-01 12:00:00] [Server control/INFO]: <text>`
pub fn control_notice(now: chrono::DateTime<chrono::Local>, text: &str) -> String {
    format!(
        "[{}] [Server control/INFO]: {text}",
        now.format("%Y-%m-%d %H:%M:%S")
    )
}

pub struct RelayChannel {
    bot: ProcessHandle,
    admin_channel: String,
    users_channel: String,
    stop_sentinel: String,
    ready: AtomicBool,
}

impl RelayChannel {
    pub fn new(bot: ProcessHandle, cfg: &BotConfig) -> Self {
        Self {
            bot,
            admin_channel: cfg.admin_channel.clone(),
            users_channel: cfg.users_channel.clone(),
            stop_sentinel: cfg.stop_sentinel.clone(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn bot(&self) -> &ProcessHandle {
        &self.bot
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wire form of `msg`, without the trailing newline. Embedded line breaks
    /// would split the message into several protocol lines, so they become spaces.
    pub fn encode(&self, msg: &RelayMessage) -> String {
        let name = match msg.channel {
            Channel::Admin => &self.admin_channel,
            Channel::Users => &self.users_channel,
        };
        let body = msg.body.replace(['\r', '\n'], " ");
        format!("{name}{body}")
    }

    pub async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        if !self.is_ready() {
            return Err(RelayError::NotReady);
        }
        debug!(channel = ?msg.channel, body = %msg.body, "relaying to bot");
        self.bot.write_line(&self.encode(msg)).await?;
        Ok(())
    }

    pub async fn notify_admin(&self, text: &str) -> Result<(), RelayError> {
        self.send(&RelayMessage::admin(control_notice(chrono::Local::now(), text)))
            .await
    }

    /// Asks the bot to leave its input loop, then terminates it. Returns
    /// whether the stop sentinel reached the bot.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let mut sent = false;
        if self.is_ready() {
            let sentinel = RelayMessage::admin(self.stop_sentinel.clone());
            match self.bot.write_line(&self.encode(&sentinel)).await {
                Ok(()) => sent = true,
                Err(err) => debug!(error = %err, "stop sentinel not delivered"),
            }
        }
        let state = self.bot.terminate(grace).await;
        info!(state = ?state, sentinel = sent, "bot stopped");
        sent
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use warden_process::{ManagedProcess, launch};

    use super::*;

    #[test]
    fn admin_commands_are_case_insensitive() {
        assert_eq!(parse_bot_line("admin save", "admin"), Some(AdminCommand::Save));
        assert_eq!(parse_bot_line("ADMIN: Exit now", "admin"), Some(AdminCommand::Exit));
        assert_eq!(parse_bot_line("  admin   save  ", "admin"), Some(AdminCommand::Save));
    }

    #[test]
    fn ordinary_lines_are_not_commands() {
        assert_eq!(parse_bot_line("user says save", "admin"), None);
        assert_eq!(parse_bot_line("admin", "admin"), None);
        assert_eq!(parse_bot_line("admin restart", "admin"), None);
        assert_eq!(parse_bot_line("", "admin"), None);
    }

    #[test]
    fn control_notice_format() {
        let at = chrono::Local
            .with_ymd_and_hms(2024, 5, 6, 7, 8, 9)
            .single()
            .unwrap();
        assert_eq!(
            control_notice(at, "Server status stopped."),
            "[2024-05-06 07:08:09] [Server control/INFO]: Server status stopped."
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn messages_are_prefixed_and_gated_on_readiness() {
        let ManagedProcess { handle, mut output } = launch(
            "bot",
            &["cat".to_string()],
            &std::env::temp_dir(),
        )
        .unwrap();
        let relay = RelayChannel::new(handle, &BotConfig::default());

        let err = relay.send(&RelayMessage::users("hi")).await.unwrap_err();
        assert!(matches!(err, RelayError::NotReady));

        relay.mark_ready();
        relay.send(&RelayMessage::users("hello\nall")).await.unwrap();
        relay.send(&RelayMessage::admin("ping")).await.unwrap();
        assert_eq!(output.next_line().await.as_deref(), Some("bot_chattinghello all"));
        assert_eq!(output.next_line().await.as_deref(), Some("admin_controlping"));

        assert!(relay.shutdown(Duration::from_secs(2)).await);
        assert!(!relay.bot().is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_before_ready_skips_the_sentinel() {
        let ManagedProcess { handle, .. } =
            launch("bot", &["cat".to_string()], &std::env::temp_dir()).unwrap();
        let relay = RelayChannel::new(handle, &BotConfig::default());
        assert!(!relay.shutdown(Duration::from_secs(2)).await);
        assert!(!relay.bot().is_alive());
    }
}
