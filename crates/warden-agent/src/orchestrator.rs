//! The run state machine: port → config patch → server → tunnel → bot →
//! operator loop → shutdown.
//!
//! Reader tasks own the server and bot stdout cursors and report what they see
//! as [`Event`]s; only [`Orchestrator`] changes [`LifecycleState`].

use std::{io, sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};
use warden_process::{ManagedProcess, OutputLines, ProcessError, ProcessHandle, ReadinessRule, launch};

use crate::{
    backup::{BackupSynchronizer, ObjectStore, SyncError},
    config::{AgentConfig, substitute},
    console::{self, ConsoleCommand},
    lifecycle::{FailureReason, Journal, LifecycleState, Milestone},
    minecraft,
    port_alloc,
    relay::{AdminCommand, RelayChannel, RelayError, RelayMessage, parse_bot_line},
    tunnel::{Tunnel, TunnelManager},
};

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() || parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[derive(Debug)]
enum Event {
    ServerReady { reported: String },
    ServerStartFailed(ProcessError),
    ServerStopped,
    ServerExited,
    BotReady,
    BotStartFailed(ProcessError),
    BotAdmin(AdminCommand),
    BotExited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Exit,
    Save,
}

/// Whether to pull the last remote save before the server starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePolicy {
    Prompt,
    Always,
    Skip,
}

/// Long-lived inputs shared by consecutive runs.
pub struct Inputs {
    pub operator: mpsc::Receiver<String>,
    pub external_stop: mpsc::Receiver<()>,
}

#[derive(Debug)]
pub struct RunReport {
    pub state: LifecycleState,
    pub restart: bool,
    pub boot_time: Option<String>,
    pub journal: Journal,
}

pub struct Orchestrator {
    config: AgentConfig,
    sync: BackupSynchronizer,
    restore: RestorePolicy,

    state: LifecycleState,
    journal: Journal,
    restart: bool,
    save_uploaded: bool,
    boot_time: Option<String>,

    server: Option<ProcessHandle>,
    server_stopped: bool,
    tunnel: Option<Tunnel>,
    relay: Option<RelayChannel>,

    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
}

async fn interruptible<T>(
    stop: &mut mpsc::Receiver<()>,
    fut: impl Future<Output = T>,
) -> Result<T, FailureReason> {
    tokio::select! {
        out = fut => Ok(out),
        Some(()) = stop.recv() => Err(FailureReason::Interrupted),
    }
}

impl Orchestrator {
    pub fn new(config: AgentConfig, store: Arc<dyn ObjectStore>, restore: RestorePolicy) -> Self {
        let sync = BackupSynchronizer::new(
            store,
            config.backup.save_archive_name.clone(),
            config.backup.save_folder_name.clone(),
            config.server.working_dir.clone(),
        );
        let (events_tx, events) = mpsc::channel(64);
        Self {
            config,
            sync,
            restore,
            state: LifecycleState::Idle,
            journal: Journal::default(),
            restart: false,
            save_uploaded: false,
            boot_time: None,
            server: None,
            server_stopped: false,
            tunnel: None,
            relay: None,
            events_tx,
            events,
        }
    }

    pub async fn run(mut self, inputs: &mut Inputs) -> RunReport {
        if let Err(reason) = self.drive(inputs).await {
            error!(from = %self.state, %reason, "run failed");
            self.enter(LifecycleState::Failed(reason));
            self.cleanup().await;
        }
        RunReport {
            state: self.state,
            restart: self.restart,
            boot_time: self.boot_time,
            journal: self.journal,
        }
    }

    fn enter(&mut self, next: LifecycleState) {
        info!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next.clone();
        self.journal.push(Milestone::Entered(next));
    }

    async fn drive(&mut self, inputs: &mut Inputs) -> Result<(), FailureReason> {
        let port = port_alloc::find_free_port(self.config.port_range())
            .ok_or(FailureReason::NoFreePort)?;
        info!(port, "free port found");
        self.enter(LifecycleState::PortAllocated);

        self.restore_save(inputs).await?;

        minecraft::patch_server_port(
            &self.config.properties_path(),
            &self.config.server.port_key,
            port,
        )
        .map_err(|e| FailureReason::ConfigPatch(format_error_chain(&e)))?;
        self.enter(LifecycleState::ConfigPatched);

        self.start_server(&mut inputs.external_stop).await?;
        self.start_tunnel(port, &mut inputs.external_stop).await?;
        self.start_bot(&mut inputs.external_stop).await?;

        self.enter(LifecycleState::Operational);
        if let Some(tunnel) = &self.tunnel {
            info!(address = %tunnel.address, "server is open for players");
        }
        let kind = self.operate(inputs).await?;
        self.shutdown(kind).await
    }

    async fn restore_save(&mut self, inputs: &mut Inputs) -> Result<(), FailureReason> {
        let wanted = match self.restore {
            RestorePolicy::Skip => false,
            RestorePolicy::Always => true,
            RestorePolicy::Prompt => interruptible(
                &mut inputs.external_stop,
                console::confirm(
                    "Would you like to download the last save?",
                    &mut inputs.operator,
                ),
            )
            .await?
            .unwrap_or(false),
        };
        if !wanted {
            info!("last save will not be downloaded");
            return Ok(());
        }

        let stale = self.config.archive_sources();
        let restored = interruptible(
            &mut inputs.external_stop,
            self.sync.restore(&self.config.server.working_dir, &stale),
        )
        .await?
        .map_err(|e| FailureReason::Restore(format_error_chain(&anyhow::Error::from(e))))?;
        info!(id = %restored.id, modified = %restored.modified, "last save restored");
        Ok(())
    }

    async fn start_server(&mut self, stop: &mut mpsc::Receiver<()>) -> Result<(), FailureReason> {
        let cfg = &self.config.server;
        let start = ReadinessRule::new(&cfg.start_pattern, self.config.server_start_timeout())
            .map_err(|e| FailureReason::ServerLaunch(format!("invalid start_pattern: {e}")))?;
        let stopped = ReadinessRule::suffix(&cfg.stop_suffix, self.config.server_stop_timeout())
            .map_err(|e| FailureReason::ServerLaunch(format!("invalid stop_suffix: {e}")))?;

        let launched_at = Instant::now();
        let ManagedProcess { handle, output } = launch("server", &cfg.command, &cfg.working_dir)
            .map_err(|e| FailureReason::ServerLaunch(e.to_string()))?;
        self.server = Some(handle);
        self.enter(LifecycleState::ServerStarting);
        spawn_server_reader(output, start, stopped, self.events_tx.clone());

        loop {
            match self.next_event(stop).await? {
                Event::ServerReady { reported } => {
                    let measured = launched_at.elapsed();
                    info!(
                        reported = %reported,
                        measured_ms = measured.as_millis() as u64,
                        "server started"
                    );
                    self.journal.push(Milestone::ServerReady {
                        reported: reported.clone(),
                        measured,
                    });
                    self.boot_time = Some(reported);
                    self.enter(LifecycleState::ServerRunning);
                    return Ok(());
                }
                Event::ServerStartFailed(ProcessError::Timeout { .. }) => {
                    return Err(FailureReason::ServerStartTimeout);
                }
                Event::ServerStartFailed(_) | Event::ServerExited => {
                    return Err(FailureReason::ServerExited);
                }
                other => debug!(event = ?other, "event ignored while the server starts"),
            }
        }
    }

    async fn start_tunnel(
        &mut self,
        port: u16,
        stop: &mut mpsc::Receiver<()>,
    ) -> Result<(), FailureReason> {
        self.enter(LifecycleState::TunnelEstablishing);
        let manager = TunnelManager::new(&self.config.tunnel, self.config.tunnel_start_timeout())
            .map_err(|e| FailureReason::Tunnel(format_error_chain(&e)))?;
        let tunnel = interruptible(stop, manager.establish(port))
            .await?
            .map_err(|e| FailureReason::Tunnel(e.to_string()))?;
        self.tunnel = Some(tunnel);
        self.enter(LifecycleState::TunnelUp);
        Ok(())
    }

    async fn start_bot(&mut self, stop: &mut mpsc::Receiver<()>) -> Result<(), FailureReason> {
        let Some(address) = self.tunnel.as_ref().map(|t| t.address.clone()) else {
            return Err(FailureReason::Tunnel("no tunnel address".to_string()));
        };
        let cfg = &self.config.bot;
        let ready = cfg
            .ready_pattern
            .as_deref()
            .map(|p| ReadinessRule::new(p, self.config.bot_ready_timeout()))
            .transpose()
            .map_err(|e| FailureReason::BotLaunch(format!("invalid ready_pattern: {e}")))?;
        let waits_for_ready = ready.is_some();
        let admin_prefix = cfg.admin_prefix.clone();

        let command = substitute(&cfg.command, "{address}", &address);
        let ManagedProcess { handle, output } = launch("bot", &command, &cfg.working_dir)
            .map_err(|e| FailureReason::BotLaunch(e.to_string()))?;
        self.relay = Some(RelayChannel::new(handle, cfg));
        self.enter(LifecycleState::BotStarting);
        spawn_bot_reader(output, ready, admin_prefix, self.events_tx.clone());

        while waits_for_ready {
            match self.next_event(stop).await? {
                Event::BotReady => break,
                Event::BotStartFailed(ProcessError::Timeout { .. }) => {
                    return Err(FailureReason::BotStartTimeout);
                }
                Event::BotStartFailed(_) | Event::BotExited => {
                    return Err(FailureReason::BotExited);
                }
                Event::ServerExited => return Err(FailureReason::ServerExited),
                Event::ServerStopped => self.mark_server_stopped().await,
                other => debug!(event = ?other, "event ignored while the bot starts"),
            }
        }
        if let Some(relay) = &self.relay {
            relay.mark_ready();
        }
        Ok(())
    }

    async fn next_event(&mut self, stop: &mut mpsc::Receiver<()>) -> Result<Event, FailureReason> {
        tokio::select! {
            Some(event) = self.events.recv() => Ok(event),
            Some(()) = stop.recv() => Err(FailureReason::Interrupted),
            else => Err(FailureReason::Interrupted),
        }
    }

    /// Serves operator and bot commands until one of them asks for a shutdown.
    async fn operate(&mut self, inputs: &mut Inputs) -> Result<Shutdown, FailureReason> {
        let mut console_open = true;
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => match event {
                    Event::BotAdmin(cmd) => {
                        self.journal.push(Milestone::AdminCommand(cmd));
                        let (ack, kind) = match cmd {
                            AdminCommand::Save => ("Admin save command received.", Shutdown::Save),
                            AdminCommand::Exit => ("Admin stop command received.", Shutdown::Exit),
                        };
                        info!("{ack}");
                        self.notify_admin(ack).await;
                        return Ok(kind);
                    }
                    Event::ServerStopped => {
                        warn!("server saved and stopped on its own; shutting down");
                        self.mark_server_stopped().await;
                        return Ok(Shutdown::Exit);
                    }
                    Event::ServerExited => return Err(FailureReason::ServerExited),
                    Event::BotExited => return Err(FailureReason::BotExited),
                    other => debug!(event = ?other, "event ignored"),
                },
                line = inputs.operator.recv(), if console_open => match line {
                    Some(line) => {
                        if let Some(kind) = self.handle_console(&line).await {
                            return Ok(kind);
                        }
                    }
                    None => {
                        info!("operator console closed; bot commands and signals still work");
                        console_open = false;
                    }
                },
                Some(()) = inputs.external_stop.recv() => {
                    info!("external stop requested");
                    return Ok(Shutdown::Exit);
                }
            }
        }
    }

    async fn handle_console(&mut self, line: &str) -> Option<Shutdown> {
        match ConsoleCommand::parse(line) {
            ConsoleCommand::Exit => Some(Shutdown::Exit),
            ConsoleCommand::Save => Some(Shutdown::Save),
            ConsoleCommand::Reset => {
                self.restart = true;
                self.notify_admin("Server status reset.").await;
                Some(Shutdown::Save)
            }
            ConsoleCommand::Help => {
                info!("operator commands:\n{}", console::HELP);
                None
            }
            ConsoleCommand::Server(command) => match self.send_server(&command).await {
                Ok(()) => None,
                Err(err) => {
                    error!(error = %err, "server command not delivered; shutting down");
                    Some(Shutdown::Exit)
                }
            },
            ConsoleCommand::Broadcast(text) => {
                let relay = self.relay.as_ref()?;
                match relay.send(&RelayMessage::users(text.clone())).await {
                    Ok(()) => {
                        info!(message = %text, "bot message sent");
                        self.journal.push(Milestone::BotMessageSent(text));
                        None
                    }
                    Err(RelayError::NotReady) => {
                        warn!("bot is not ready yet; message dropped");
                        None
                    }
                    Err(err) => {
                        error!(error = %err, "bot message not delivered; shutting down");
                        Some(Shutdown::Exit)
                    }
                }
            }
            ConsoleCommand::Unknown(raw) => {
                warn!("command {raw:?} not recognized; type `help` for the list");
                None
            }
            ConsoleCommand::Empty => None,
        }
    }

    async fn send_server(&mut self, command: &str) -> Result<(), ProcessError> {
        let Some(server) = &self.server else {
            return Err(ProcessError::Write {
                label: "server".to_string(),
                source: io::Error::new(io::ErrorKind::NotConnected, "server not launched"),
            });
        };
        server.write_line(command).await?;
        info!(command, "server command sent");
        self.journal.push(Milestone::ServerCommandSent(command.to_string()));
        Ok(())
    }

    async fn notify_admin(&mut self, text: &str) {
        let Some(relay) = &self.relay else {
            return;
        };
        let sent = relay.notify_admin(text).await;
        match sent {
            Ok(()) => self.journal.push(Milestone::BotMessageSent(text.to_string())),
            Err(err) => warn!(error = %err, "admin notification not delivered"),
        }
    }

    /// Nothing is written to the server after this.
    async fn mark_server_stopped(&mut self) {
        if self.server_stopped {
            return;
        }
        self.server_stopped = true;
        self.journal.push(Milestone::ServerStopObserved);
        if let Some(server) = &self.server {
            server.close_input().await;
        }
    }

    /// Waits for the stop marker. `Ok(false)` when the server exited without it.
    async fn await_server_stop(&mut self) -> Result<bool, FailureReason> {
        let timeout = self.config.server_stop_timeout();
        let deadline = Instant::now() + timeout;
        info!(timeout_s = timeout.as_secs(), "waiting for the server to save and stop");
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(Event::ServerStopped)) => {
                    self.mark_server_stopped().await;
                    return Ok(true);
                }
                Ok(Some(Event::ServerExited)) | Ok(None) => {
                    warn!("server exited without confirming the world was saved");
                    return Ok(false);
                }
                Ok(Some(Event::BotAdmin(cmd))) => {
                    debug!(command = ?cmd, "admin command ignored; shutdown already running");
                }
                Ok(Some(_)) => {}
                Err(_) => return Err(FailureReason::ServerStopTimeout),
            }
        }
    }

    async fn shutdown(&mut self, kind: Shutdown) -> Result<(), FailureReason> {
        self.enter(LifecycleState::ShuttingDown);
        info!(kind = ?kind, "shutdown started");

        if let Some(tunnel) = self.tunnel.take() {
            tunnel
                .close(Duration::from_secs(self.config.tunnel.terminate_grace_sec))
                .await;
        }

        let saved = if self.server_stopped {
            true
        } else {
            let stop_command = self.config.server.stop_command.clone();
            if let Err(err) = self.send_server(&stop_command).await {
                if self.server.as_ref().is_some_and(ProcessHandle::is_alive) {
                    return Err(FailureReason::Write(err.to_string()));
                }
                warn!(error = %err, "stop command not delivered; server already gone");
            }
            self.await_server_stop().await?
        };
        self.notify_admin("Server status stopped.").await;

        if kind == Shutdown::Save {
            if saved {
                self.run_backup().await;
            } else {
                warn!("world was not confirmed saved; backup skipped");
                self.journal.push(Milestone::BackupSkipped);
            }
        }

        if self.restart && !self.save_uploaded {
            warn!("no new save was uploaded; reset will not restart from the remote store");
            self.restart = false;
            self.notify_admin("Reset cancelled: no new save was uploaded.").await;
        }

        self.stop_bot().await;

        if let Some(server) = &self.server {
            let grace = Duration::from_secs(self.config.server.terminate_grace_sec);
            if server.wait_exit(grace).await.is_none() {
                server.terminate(grace).await;
            }
        }
        self.enter(LifecycleState::ServerStopped);
        if !self.restart {
            self.enter(LifecycleState::Terminated);
        }
        Ok(())
    }

    async fn run_backup(&mut self) {
        self.notify_admin("Saving to Google Drive.").await;
        self.journal.push(Milestone::BackupStarted);
        match self.sync.backup(&self.config.archive_sources()).await {
            Ok(id) => {
                info!(id = %id, "backup uploaded");
                self.save_uploaded = true;
                self.journal.push(Milestone::BackupFinished);
                self.notify_admin("New save made on Google Drive.").await;
            }
            Err(err) => {
                // Only the rotation failed; the new save is on the store.
                if matches!(err, SyncError::Partial { .. }) {
                    self.save_uploaded = true;
                }
                let msg = format_error_chain(&anyhow::Error::from(err));
                error!(error = %msg, "backup failed");
                self.journal.push(Milestone::BackupFailed(msg.clone()));
                self.notify_admin(&format!("Backup failed: {msg}")).await;
            }
        }
    }

    async fn stop_bot(&mut self) {
        let Some(relay) = &self.relay else {
            return;
        };
        let sent = relay
            .shutdown(Duration::from_secs(self.config.bot.terminate_grace_sec))
            .await;
        if sent {
            self.journal.push(Milestone::BotStopSent);
        }
    }

    /// Best-effort teardown of whatever is still alive after a failure.
    async fn cleanup(&mut self) {
        if self.relay.as_ref().is_some_and(|r| r.bot().is_alive()) {
            self.stop_bot().await;
        }
        if let Some(tunnel) = self.tunnel.take() {
            tunnel
                .close(Duration::from_secs(self.config.tunnel.terminate_grace_sec))
                .await;
        }
        if let Some(server) = &self.server
            && server.is_alive()
        {
            server.close_input().await;
            server
                .terminate(Duration::from_secs(self.config.server.terminate_grace_sec))
                .await;
        }
    }
}

/// Single consumer of the server's stdout: readiness first, then the stop
/// marker on the same cursor, then drain to end-of-stream.
fn spawn_server_reader(
    mut output: OutputLines,
    start: ReadinessRule,
    stopped: ReadinessRule,
    tx: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        let ready = output
            .wait_for_pattern_with(&start, |line| info!(target: "server", "{line}"))
            .await;
        match ready {
            Ok(reported) => {
                if tx.send(Event::ServerReady { reported }).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Event::ServerStartFailed(err)).await;
                return;
            }
        }

        let mut stop_seen = false;
        while let Some(line) = output.next_line().await {
            info!(target: "server", "{line}");
            if !stop_seen && stopped.observe(&line).is_some() {
                stop_seen = true;
                if tx.send(Event::ServerStopped).await.is_err() {
                    return;
                }
            }
        }
        let _ = tx.send(Event::ServerExited).await;
    });
}

fn spawn_bot_reader(
    mut output: OutputLines,
    ready: Option<ReadinessRule>,
    admin_prefix: String,
    tx: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        if let Some(rule) = ready {
            match output
                .wait_for_pattern_with(&rule, |line| info!(target: "bot", "{line}"))
                .await
            {
                Ok(_) => {
                    if tx.send(Event::BotReady).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Event::BotStartFailed(err)).await;
                    return;
                }
            }
        }

        while let Some(line) = output.next_line().await {
            info!(target: "bot", "{line}");
            if let Some(cmd) = parse_bot_line(&line, &admin_prefix)
                && tx.send(Event::BotAdmin(cmd)).await.is_err()
            {
                return;
            }
        }
        let _ = tx.send(Event::BotExited).await;
    });
}
