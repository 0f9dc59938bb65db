use crate::config::LinkCredentials;
use crate::error::LinkError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// The device's network uplink
#[async_trait]
pub trait NetworkLink: Send {
    async fn connect(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError>;
    fn status(&self) -> LinkStatus;
    async fn disconnect(&mut self);
}

/// Uplink of a host that is already on a network.
///
/// Connecting means the remote endpoint answers a TCP handshake within the
/// bounded wait, so the loop sees the link as down when the route is gone.
pub struct HostLink {
    probe_target: String,
    connect_timeout: Duration,
    status: LinkStatus,
}

impl HostLink {
    /// `probe_target` is a `host:port` pair
    pub fn new(probe_target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            probe_target: probe_target.into(),
            connect_timeout,
            status: LinkStatus::Disconnected,
        }
    }

    /// Derives the probe target from the database base URL
    pub fn for_url(base_url: &str, connect_timeout: Duration) -> Self {
        let (default_port, rest) = if let Some(rest) = base_url.strip_prefix("https://") {
            (443, rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            (80, rest)
        } else {
            (443, base_url)
        };
        let authority = rest.split('/').next().unwrap_or(rest);
        let target = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:{default_port}")
        };
        Self::new(target, connect_timeout)
    }

    pub fn probe_target(&self) -> &str {
        &self.probe_target
    }
}

#[async_trait]
impl NetworkLink for HostLink {
    async fn connect(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError> {
        info!(ssid = %credentials.ssid, target = %self.probe_target, "Connecting network link");

        let outcome = timeout(
            self.connect_timeout,
            TcpStream::connect(self.probe_target.as_str()),
        )
        .await;
        match outcome {
            Ok(Ok(stream)) => {
                if let Ok(local) = stream.local_addr() {
                    info!(ip = %local.ip(), "Network link connected");
                }
                self.status = LinkStatus::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                self.status = LinkStatus::Disconnected;
                warn!("Network link unavailable: {}", e);
                Err(LinkError::Disconnected(e.to_string()))
            }
            Err(_) => {
                self.status = LinkStatus::Disconnected;
                warn!("Network link timed out");
                Err(LinkError::Disconnected("connect timed out".to_string()))
            }
        }
    }

    fn status(&self) -> LinkStatus {
        self.status
    }

    async fn disconnect(&mut self) {
        info!("Network link disconnected");
        self.status = LinkStatus::Disconnected;
    }
}
