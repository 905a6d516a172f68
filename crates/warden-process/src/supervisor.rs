use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{ProcessError, ProcessState, ProcessStatus, ReadinessRule};

// How long to wait for the OS to reap a child after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A freshly launched child, split into its control half and its stdout cursor.
pub struct ManagedProcess {
    pub handle: ProcessHandle,
    pub output: OutputLines,
}

struct Inner {
    label: String,
    command: Vec<String>,
    cwd: PathBuf,
    pid: Option<u32>,
    // Single writer lock: concurrent callers never interleave partial lines.
    stdin: Mutex<Option<ChildStdin>>,
    state: watch::Sender<ProcessState>,
    kill_tx: mpsc::Sender<()>,
}

/// Cloneable control handle: write lines, query liveness, terminate.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.inner.label)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    // If the orchestrator dies, the child gets SIGTERM instead of lingering.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> io::Result<()> {
    Ok(())
}

/// Spawns `command` in `cwd` with stdin/stdout/stderr piped.
///
/// Must be called from within a tokio runtime: a reaper task and a stderr
/// forwarder are spawned alongside the child.
pub fn launch(label: &str, command: &[String], cwd: &Path) -> Result<ManagedProcess, ProcessError> {
    let launch_err = |source: io::Error| ProcessError::Launch {
        label: label.to_string(),
        source,
    };

    let Some((program, args)) = command.split_first() else {
        return Err(launch_err(io::Error::new(
            ErrorKind::InvalidInput,
            "empty command",
        )));
    };
    if !cwd.is_dir() {
        return Err(launch_err(io::Error::new(
            ErrorKind::NotFound,
            format!("working directory {} does not exist", cwd.display()),
        )));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                // Own process group, so terminate() reaches wrapper scripts' children too.
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(launch_err)?;
    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (state, _) = watch::channel(ProcessState::Running);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
    let inner = Arc::new(Inner {
        label: label.to_string(),
        command: command.to_vec(),
        cwd: cwd.to_path_buf(),
        pid,
        stdin: Mutex::new(stdin),
        state,
        kill_tx,
    });

    info!(
        process = %label,
        pid = ?pid,
        command = %command.join(" "),
        cwd = %cwd.display(),
        "process launched"
    );

    if let Some(err) = stderr {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = OutputLines::new(label.clone(), err);
            while let Some(line) = lines.next_line().await {
                info!(process = %label, stream = "stderr", "{line}");
            }
        });
    }

    tokio::spawn({
        let inner = inner.clone();
        async move {
            let res = loop {
                tokio::select! {
                    res = child.wait() => break res,
                    Some(()) = kill_rx.recv() => {
                        if let Err(err) = child.start_kill() {
                            debug!(process = %inner.label, error = %err, "start_kill failed");
                        }
                    }
                }
            };

            let code = match res {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(process = %inner.label, error = %err, "wait failed");
                    None
                }
            };
            inner.stdin.lock().await.take();
            info!(process = %inner.label, exit_code = ?code, "process exited");
            inner.state.send_replace(ProcessState::Exited { code });
        }
    });

    let output = match stdout {
        Some(out) => OutputLines::new(label, out),
        None => OutputLines::new(label, tokio::io::empty()),
    };

    Ok(ManagedProcess {
        handle: ProcessHandle { inner },
        output,
    })
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn command(&self) -> &[String] {
        &self.inner.command
    }

    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state().is_alive()
    }

    pub fn status(&self) -> ProcessStatus {
        ProcessStatus {
            label: self.inner.label.clone(),
            pid: self.inner.pid,
            state: self.state(),
        }
    }

    /// Appends `\n` and flushes immediately.
    pub async fn write_line(&self, text: &str) -> Result<(), ProcessError> {
        let write_err = |source: io::Error| ProcessError::Write {
            label: self.inner.label.clone(),
            source,
        };

        let mut guard = self.inner.stdin.lock().await;
        if !self.is_alive() {
            return Err(write_err(io::Error::new(
                ErrorKind::BrokenPipe,
                "process has exited",
            )));
        }
        let Some(stdin) = guard.as_mut() else {
            return Err(write_err(io::Error::new(
                ErrorKind::BrokenPipe,
                "stdin is closed",
            )));
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(write_err)?;
        stdin.flush().await.map_err(write_err)?;
        Ok(())
    }

    /// Drops stdin; every later `write_line` fails.
    pub async fn close_input(&self) {
        self.inner.stdin.lock().await.take();
    }

    /// Waits up to `timeout` for the child to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ProcessState> {
        let mut rx = self.inner.state.subscribe();
        let exited = rx.wait_for(|s| !s.is_alive());
        match tokio::time::timeout(timeout, exited).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        }
    }

    pub async fn exited(&self) -> ProcessState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|s| !s.is_alive()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Asks the child to stop (SIGTERM to its process group), then waits up
    /// to `grace` before escalating to SIGKILL.
    pub async fn terminate(&self, grace: Duration) -> ProcessState {
        let current = self.state();
        if !current.is_alive() {
            return current;
        }

        self.inner.state.send_if_modified(|s| {
            if *s == ProcessState::Running {
                *s = ProcessState::Stopping;
                true
            } else {
                false
            }
        });
        debug!(process = %self.inner.label, grace_ms = grace.as_millis() as u64, "terminate requested");
        self.signal_terminate();

        if let Some(state) = self.wait_exit(grace).await {
            return state;
        }

        warn!(
            process = %self.inner.label,
            grace_ms = grace.as_millis() as u64,
            "process ignored termination request; killing"
        );
        self.kill();
        self.wait_exit(KILL_WAIT).await.unwrap_or_else(|| self.state())
    }

    fn signal_terminate(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.inner.pid {
                unsafe {
                    libc::kill(-(pid as libc::pid_t), libc::SIGTERM);
                }
                return;
            }
        }
        self.kill();
    }

    fn kill(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.inner.pid {
                unsafe {
                    libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
                }
            }
        }
        let _ = self.inner.kill_tx.try_send(());
    }
}

/// Sequential cursor over a child's output lines.
///
/// Finite: once end-of-stream is reached every call returns `None`. Not
/// `Clone`, so a stream always has exactly one consumer.
pub struct OutputLines {
    label: String,
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    // Bytes of a line still being assembled; survives a cancelled read.
    pending: Vec<u8>,
    finished: bool,
}

impl OutputLines {
    pub fn new(label: impl Into<String>, stream: impl AsyncRead + Unpin + Send + 'static) -> Self {
        Self {
            label: label.into(),
            reader: BufReader::new(Box::new(stream)),
            pending: Vec::with_capacity(1024),
            finished: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next line without its terminator, decoded lossily (servers do emit
    /// non-UTF-8 bytes now and then).
    pub async fn next_line(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.reader.read_until(b'\n', &mut self.pending).await {
            Ok(0) => {
                self.finished = true;
                if self.pending.is_empty() {
                    None
                } else {
                    Some(self.take_line())
                }
            }
            Ok(_) => {
                if self.pending.last() != Some(&b'\n') {
                    // EOF right after an unterminated line.
                    self.finished = true;
                }
                Some(self.take_line())
            }
            Err(err) => {
                debug!(process = %self.label, error = %err, "output reader stopped on read error");
                self.finished = true;
                None
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub async fn wait_for_pattern(&mut self, rule: &ReadinessRule) -> Result<String, ProcessError> {
        self.wait_for_pattern_with(rule, |_| {}).await
    }

    /// Consumes lines until `rule` matches or `rule.timeout()` elapses. The
    /// clock starts at this call. `inspect` sees every consumed line.
    pub async fn wait_for_pattern_with(
        &mut self,
        rule: &ReadinessRule,
        mut inspect: impl FnMut(&str),
    ) -> Result<String, ProcessError> {
        let deadline = tokio::time::Instant::now() + rule.timeout();
        loop {
            let line = match tokio::time::timeout_at(deadline, self.next_line()).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(ProcessError::Exited {
                        label: self.label.clone(),
                    });
                }
                Err(_) => {
                    return Err(ProcessError::Timeout {
                        label: self.label.clone(),
                        timeout: rule.timeout(),
                    });
                }
            };
            inspect(&line);
            if let Some(value) = rule.observe(&line) {
                debug!(process = %self.label, pattern = rule.pattern(), %value, "readiness pattern matched");
                return Ok(value);
            }
        }
    }
}
