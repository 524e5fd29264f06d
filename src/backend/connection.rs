//! Connection state of a single backend runtime.
//!
//! A connection starts `Offline`. The first [`BackendConnection::connect`]
//! call moves it to `Connecting` and spawns one attempt; every caller that
//! asks for a connection while the attempt runs waits on the same outcome.
//! A call that fails with `Unavailable` on the current channel drops it and
//! starts a new attempt in the background. Later failures on the same
//! channel join that attempt.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::transport::Channel;
use tonic::Code;
use tracing::{debug, error, info, warn};

use super::connector::Connector;
use crate::cri::Revision;
use crate::error::{ConnectError, ProxyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// The channel in use, tagged with the generation it was made in.
#[derive(Debug, Clone)]
pub struct Link {
    pub channel: Channel,
    pub revision: Revision,
    pub generation: u64,
}

/// Resolves once the attempt a caller joined has finished.
pub type ConnectWaiter = oneshot::Receiver<std::result::Result<(), ConnectError>>;

struct Inner {
    state: ConnectionState,
    link: Option<Link>,
    waiters: Vec<oneshot::Sender<std::result::Result<(), ConnectError>>>,
    /// Bumped whenever the current channel or attempt is invalidated.
    generation: u64,
}

pub struct BackendConnection {
    address: PathBuf,
    timeout: Duration,
    connector: Arc<dyn Connector>,
    inner: Mutex<Inner>,
}

impl BackendConnection {
    pub fn new(address: impl Into<PathBuf>, timeout: Duration, connector: Arc<dyn Connector>) -> Self {
        Self {
            address: address.into(),
            timeout,
            connector,
            inner: Mutex::new(Inner {
                state: ConnectionState::Offline,
                link: None,
                waiters: Vec::new(),
                generation: 0,
            }),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// The current channel, if connected.
    pub fn link(&self) -> Option<Link> {
        let inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected => inner.link.clone(),
            _ => None,
        }
    }

    /// Returns a waiter for the connection, starting an attempt if none is
    /// running. Must be called from within a tokio runtime.
    pub fn connect(self: &Arc<Self>) -> ConnectWaiter {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Connected => {
                let _ = tx.send(Ok(()));
            }
            ConnectionState::Connecting => inner.waiters.push(tx),
            ConnectionState::Offline => {
                inner.waiters.push(tx);
                inner.state = ConnectionState::Connecting;
                inner.generation += 1;
                let generation = inner.generation;
                let this = Arc::clone(self);
                tokio::spawn(async move { this.attempt(generation).await });
            }
        }
        rx
    }

    async fn attempt(self: Arc<Self>, generation: u64) {
        info!("Connecting to runtime service {}", self.address.display());
        let outcome = self.connector.connect(&self.address).await;

        let (waiters, result) = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(
                    "Discarding superseded connection attempt to {}",
                    self.address.display()
                );
                return;
            }
            let result = match outcome {
                Ok(connected) => {
                    info!("Connected to runtime service {}", self.address.display());
                    inner.state = ConnectionState::Connected;
                    inner.link = Some(Link {
                        channel: connected.channel,
                        revision: connected.revision,
                        generation,
                    });
                    Ok(())
                }
                Err(err) => {
                    error!("Failed to connect to the socket: {}", err);
                    inner.state = ConnectionState::Offline;
                    Err(err)
                }
            };
            (std::mem::take(&mut inner.waiters), result)
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Drops the channel and goes offline. Waiters of an attempt in flight
    /// are failed and the attempt's outcome is discarded.
    pub fn stop(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Offline {
                debug!("Closing connection to {}", self.address.display());
            }
            inner.generation += 1;
            inner.link = None;
            inner.state = ConnectionState::Offline;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(self.connect_error("connection stopped")));
        }
    }

    /// Drops the channel made in `generation` if it is still the one in
    /// use. Returns whether it was dropped.
    fn drop_link(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let current = inner.state == ConnectionState::Connected
            && inner.link.as_ref().map(|link| link.generation) == Some(generation);
        if current {
            inner.generation += 1;
            inner.link = None;
            inner.state = ConnectionState::Offline;
        }
        current
    }

    /// Waits for the connection, bounded by the connection timeout.
    ///
    /// The attempt keeps running after a timeout.
    pub async fn wait_connected(self: &Arc<Self>) -> Result<()> {
        let waiter = self.connect();
        match tokio::time::timeout(self.timeout, waiter).await {
            Ok(Ok(outcome)) => outcome.map_err(ProxyError::from),
            Ok(Err(_)) => Err(self.connect_error("connection attempt abandoned").into()),
            Err(_) => Err(ProxyError::ConnectTimeout {
                address: self.address.display().to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Classifies a failed call.
    ///
    /// `Unavailable` drops the channel the call used, unless it was already
    /// replaced, and reconnects in the background; with
    /// `tolerate_disconnect` the failure is then swallowed. Other backend
    /// statuses are wrapped with the address, keeping their code.
    pub fn handle_error(self: &Arc<Self>, err: ProxyError, tolerate_disconnect: bool) -> Result<()> {
        match err {
            ProxyError::Rpc { status, generation } if status.code() == Code::Unavailable => {
                if self.drop_link(generation) {
                    warn!(
                        "Runtime {} is unavailable, reconnecting: {}",
                        self.address.display(),
                        status.message()
                    );
                }
                let _ = self.connect();
                if tolerate_disconnect {
                    Ok(())
                } else {
                    Err(self.backend_error(status))
                }
            }
            ProxyError::Rpc { status, .. } => Err(self.backend_error(status)),
            other => Err(other),
        }
    }

    fn backend_error(&self, status: tonic::Status) -> ProxyError {
        ProxyError::Backend {
            address: self.address.display().to_string(),
            status,
        }
    }

    fn connect_error(&self, reason: &str) -> ConnectError {
        ConnectError::new(self.address.display().to_string(), reason)
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
