//! The CRI proxy: one socket in front of several runtimes.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tracing::{info, warn};
use url::Url;

use crate::backend::{BackendSpec, Connector};
use crate::error::Result;

pub mod dispatch;
pub mod image_names;
pub mod router;
pub mod server;

pub use dispatch::{Dispatcher, LogLevel};
pub use image_names::ImageNameTable;
pub use router::{Route, Router};
pub use server::UnaryHandler;

pub struct RuntimeProxy {
    router: Arc<Router>,
    dispatcher: Arc<Dispatcher>,
}

impl RuntimeProxy {
    pub fn new(
        backends: Vec<BackendSpec>,
        connector: Arc<dyn Connector>,
        connection_timeout: Duration,
        stream_url: Url,
    ) -> Result<Self> {
        let router = Arc::new(Router::new(backends, connector, connection_timeout, stream_url)?);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&router)));
        Ok(Self { router, dispatcher })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn serve_on<F>(&self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.router.connect_all();
        let result = server::serve(Arc::clone(&self.dispatcher), listener, shutdown).await;
        self.stop();
        result
    }

    /// Binds `listen`, serves until `shutdown` resolves and removes the
    /// socket afterwards.
    pub async fn serve<F>(&self, listen: &Path, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = server::bind(listen)?;
        info!("Starting CRI proxy on socket {}", listen.display());
        let result = self.serve_on(listener, shutdown).await;
        match std::fs::remove_file(listen) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove socket {}: {}", listen.display(), e),
        }
        result
    }

    /// Drops every backend connection.
    pub fn stop(&self) {
        self.router.stop();
    }
}
