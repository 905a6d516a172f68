use std::{net::IpAddr, time::Duration};

use anyhow::Context;
use thiserror::Error;
use tracing::info;
use warden_process::{ManagedProcess, ProcessError, ProcessHandle, ReadinessRule, launch};

use crate::config::{TunnelConfig, substitute};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Launch(ProcessError),
    #[error("tunnel did not report readiness within {0:?}")]
    Timeout(Duration),
    #[error("tunnel process exited before becoming ready")]
    ProcessExited,
    #[error("cannot resolve public host {host}: {reason}")]
    Resolve { host: String, reason: String },
}

/// A live tunnel plus the address players connect to.
#[derive(Debug)]
pub struct Tunnel {
    pub handle: ProcessHandle,
    pub address: String,
}

impl Tunnel {
    pub async fn close(&self, grace: Duration) {
        let state = self.handle.terminate(grace).await;
        info!(state = ?state, "tunnel closed");
    }
}

pub struct TunnelManager {
    cfg: TunnelConfig,
    ready: ReadinessRule,
}

impl TunnelManager {
    pub fn new(cfg: &TunnelConfig, timeout: Duration) -> anyhow::Result<Self> {
        let ready = ReadinessRule::new(&cfg.ready_pattern, timeout)
            .with_context(|| format!("invalid tunnel.ready_pattern {:?}", cfg.ready_pattern))?;
        Ok(Self {
            cfg: cfg.clone(),
            ready,
        })
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.cfg.terminate_grace_sec)
    }

    pub async fn establish(&self, local_port: u16) -> Result<Tunnel, TunnelError> {
        let command = substitute(&self.cfg.command, "{port}", &local_port.to_string());
        let ManagedProcess { handle, mut output } =
            launch("tunnel", &command, &self.cfg.working_dir).map_err(TunnelError::Launch)?;

        let waited = output
            .wait_for_pattern_with(&self.ready, |line| info!(target: "tunnel", "{line}"))
            .await;
        match waited {
            Ok(_) => {}
            Err(ProcessError::Timeout { timeout, .. }) => {
                handle.terminate(self.terminate_grace()).await;
                return Err(TunnelError::Timeout(timeout));
            }
            Err(_) => {
                handle.terminate(self.terminate_grace()).await;
                return Err(TunnelError::ProcessExited);
            }
        }

        // Keep the pipe drained so a chatty tunnel never blocks on a full buffer.
        tokio::spawn(async move {
            while let Some(line) = output.next_line().await {
                info!(target: "tunnel", "{line}");
            }
        });

        let ip = match resolve(&self.cfg.public_host).await {
            Ok(ip) => ip,
            Err(err) => {
                handle.terminate(self.terminate_grace()).await;
                return Err(err);
            }
        };
        let address = format_address(ip, local_port);
        info!(%address, "tunnel up");
        Ok(Tunnel { handle, address })
    }
}

async fn resolve(host: &str) -> Result<IpAddr, TunnelError> {
    let resolve_err = |reason: String| TunnelError::Resolve {
        host: host.to_string(),
        reason,
    };
    let addrs: Vec<_> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .map(|a| a.ip())
        .collect();
    addrs
        .iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
        .ok_or_else(|| resolve_err("no addresses".to_string()))
}

pub fn format_address(ip: IpAddr, port: u16) -> String {
    std::net::SocketAddr::new(ip, port).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(script: &str) -> TunnelConfig {
        TunnelConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            ready_pattern: "started".to_string(),
            public_host: "127.0.0.1".to_string(),
            start_timeout_sec: 5,
            terminate_grace_sec: 2,
        }
    }

    #[test]
    fn address_formatting() {
        let v4: IpAddr = "138.68.79.95".parse().unwrap();
        assert_eq!(format_address(v4, 50123), "138.68.79.95:50123");
        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(format_address(v6, 50123), "[::1]:50123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_tunnel_yields_public_address() {
        let manager = TunnelManager::new(
            &cfg("echo 'connecting {port}'; echo 'started tunnel'; exec sleep 30"),
            Duration::from_secs(5),
        )
        .unwrap();
        let tunnel = manager.establish(50123).await.unwrap();
        assert_eq!(tunnel.address, "127.0.0.1:50123");
        assert!(tunnel.handle.is_alive());
        tunnel.close(Duration::from_secs(2)).await;
        assert!(!tunnel.handle.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_tunnel_times_out_and_is_stopped() {
        let manager =
            TunnelManager::new(&cfg("exec sleep 30"), Duration::from_millis(300)).unwrap();
        let err = manager.establish(50124).await.unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dying_tunnel_is_reported() {
        let manager =
            TunnelManager::new(&cfg("echo 'connection refused'"), Duration::from_secs(5)).unwrap();
        let err = manager.establish(50125).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProcessExited));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tunnel_output_is_echoed_at_info() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let manager = TunnelManager::new(
            &cfg("echo 'connecting {port}'; echo 'started tunnel'; exec sleep 30"),
            Duration::from_secs(5),
        )
        .unwrap();
        let tunnel = manager.establish(50126).await.unwrap();
        tunnel.close(Duration::from_secs(2)).await;

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("connecting 50126"), "{logged}");
        assert!(logged.contains("started tunnel"), "{logged}");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut bad = cfg("true");
        bad.ready_pattern = "(".to_string();
        assert!(TunnelManager::new(&bad, Duration::from_secs(1)).is_err());
    }
}
