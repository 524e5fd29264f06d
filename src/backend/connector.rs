//! Dialing and probing of backend runtimes.

use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use super::client::unary;
use crate::cri::current::{VersionRequest, VersionResponse};
use crate::cri::{Revision, RUNTIME_SERVICE};
use crate::error::ConnectError;

/// Version string sent with the probe request.
pub const PROBE_VERSION: &str = "0.1.0";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// An established and probed channel to a runtime.
#[derive(Debug, Clone)]
pub struct Connected {
    pub channel: Channel,
    pub revision: Revision,
    /// `name version` as reported by the runtime.
    pub runtime: String,
}

/// Strategy used to reach a runtime socket
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &Path) -> Result<Connected, ConnectError>;
}

/// Connects over a unix domain socket, waiting for the socket to appear.
#[derive(Debug, Clone)]
pub struct UnixConnector {
    timeout: Duration,
    poll_interval: Duration,
    poll_attempts: Option<u32>,
}

impl UnixConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up after this many checks for the socket. `None` waits forever.
    pub fn poll_attempts(mut self, attempts: Option<u32>) -> Self {
        self.poll_attempts = attempts;
        self
    }

    async fn wait_for_socket(&self, address: &Path) -> Result<(), ConnectError> {
        let mut attempt: u32 = 0;
        loop {
            match tokio::fs::metadata(address).await {
                Ok(_) => return Ok(()),
                Err(err) => debug!("attempt {}: {:?} is not here yet: {}", attempt, address, err),
            }
            attempt += 1;
            if self.poll_attempts.is_some_and(|max| attempt >= max) {
                return Err(ConnectError::new(
                    address.display().to_string(),
                    format!("socket did not appear after {} attempts", attempt),
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Calls `Version` for each revision, newest first.
    async fn probe(&self, address: &Path, channel: &Channel) -> Result<Connected, ConnectError> {
        let mut last_error = String::from("no revisions to probe");
        for revision in Revision::PROBE_ORDER {
            let request = VersionRequest {
                version: PROBE_VERSION.to_string(),
            };
            let path = revision.method_path(RUNTIME_SERVICE, "Version");
            match unary::<_, VersionResponse>(channel.clone(), path, request, Some(self.timeout)).await {
                Ok(version) => {
                    return Ok(Connected {
                        channel: channel.clone(),
                        revision,
                        runtime: format!("{} {}", version.runtime_name, version.runtime_version),
                    });
                }
                Err(status) => {
                    debug!("{:?} does not speak CRI {}: {}", address, revision, status.message());
                    last_error = format!("CRI {}: {}", revision, status.message());
                }
            }
        }
        Err(ConnectError::new(
            address.display().to_string(),
            format!("no supported CRI revision ({})", last_error),
        ))
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self, address: &Path) -> Result<Connected, ConnectError> {
        self.wait_for_socket(address).await?;
        let channel = dial(address, self.timeout)
            .await
            .map_err(|err| ConnectError::new(address.display().to_string(), err.to_string()))?;
        let connected = self.probe(address, &channel).await?;
        info!(
            "Runtime at {:?} is {} (CRI {})",
            address, connected.runtime, connected.revision
        );
        Ok(connected)
    }
}

/// Opens a gRPC channel over the unix socket at `address`.
pub async fn dial(address: &Path, timeout: Duration) -> Result<Channel, tonic::transport::Error> {
    let path = address.to_path_buf();
    // The authority is never used; every connection goes to `path`.
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_socket_gives_up_after_attempts() {
        let dir = tempdir().unwrap();
        let connector = UnixConnector::new(Duration::from_millis(100))
            .poll_interval(Duration::from_millis(5))
            .poll_attempts(Some(3));
        let err = connector.connect(&dir.path().join("absent.sock")).await.unwrap_err();
        assert!(err.reason.contains("3 attempts"), "{}", err);
    }

    #[tokio::test]
    async fn test_probe_fails_on_non_grpc_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        // Accepts and immediately drops connections.
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let connector = UnixConnector::new(Duration::from_millis(200));
        let err = connector.connect(&path).await.unwrap_err();
        assert_eq!(err.address, path.display().to_string());
    }
}
