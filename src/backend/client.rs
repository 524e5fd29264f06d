//! Calls into one backend runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Status};

use super::connection::BackendConnection;
use crate::cri::{CriMessage, Prefixable, Revision, Translation};
use crate::error::{ProxyError, Result};
use crate::namespace::Namespace;

/// One forwarded method invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub service: &'static str,
    pub method: &'static str,
    /// Revision the caller spoke.
    pub revision: Revision,
    /// Deadline the caller set, forwarded to the backend.
    pub timeout: Option<Duration>,
}

impl Call {
    pub fn new(service: &'static str, method: &'static str, revision: Revision) -> Self {
        Self {
            service,
            method,
            revision,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path the caller used.
    pub fn path(&self) -> String {
        self.revision.method_path(self.service, self.method)
    }

    /// Path of the same method in a backend's revision.
    pub fn backend_path(&self, backend: Revision) -> String {
        backend.method_path(self.service, self.method)
    }
}

/// Performs a unary call with prost-encoded messages.
pub async fn unary<Req, Resp>(
    channel: Channel,
    path: String,
    message: Req,
    timeout: Option<Duration>,
) -> std::result::Result<Resp, Status>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| Status::unavailable(format!("service was not ready: {}", e)))?;
    let path = PathAndQuery::try_from(path)
        .map_err(|e| Status::internal(format!("invalid method path: {}", e)))?;

    let mut request = tonic::Request::new(message);
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    let call = grpc.unary(request, path, ProstCodec::<Req, Resp>::default());
    let response = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Status::deadline_exceeded("backend call timed out"))??,
        None => call.await?,
    };
    Ok(response.into_inner())
}

/// A backend runtime together with the namespace its objects live in.
#[derive(Debug)]
pub struct BackendClient {
    namespace: Namespace,
    connection: Arc<BackendConnection>,
}

impl BackendClient {
    pub fn new(namespace: Namespace, connection: Arc<BackendConnection>) -> Self {
        Self {
            namespace,
            connection,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }

    pub fn address(&self) -> &Path {
        self.connection.address()
    }

    pub fn is_primary(&self) -> bool {
        self.namespace.is_primary()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.link().is_some()
    }

    /// Starts connecting in the background unless already connected or
    /// connecting.
    pub fn kick(&self) {
        let _ = self.connection.connect();
    }

    pub async fn wait_connected(&self) -> Result<()> {
        self.connection.wait_connected().await
    }

    /// Rewrites an object read from this backend into the proxy's view.
    pub fn add_prefix<T: Prefixable>(&self, mut object: T) -> T {
        object.add_prefix(&self.namespace);
        object
    }

    /// Sends `request` on the current channel.
    ///
    /// A legacy request to a current-schema backend is upgraded and its
    /// response downgraded. Backend statuses come back as
    /// [`ProxyError::Rpc`] for the caller to classify.
    pub async fn invoke<Req, Resp>(&self, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let link = self.connection.link().ok_or_else(|| ProxyError::NotConnected {
            address: self.address().display().to_string(),
        })?;
        let path = call.backend_path(link.revision);

        let result = match call.revision.translation_to(link.revision) {
            Translation::Native => {
                unary::<Req, Resp>(link.channel, path, request, call.timeout).await
            }
            Translation::Upgrade => {
                unary::<Req::Upgraded, Resp::Upgraded>(link.channel, path, request.upgrade(), call.timeout)
                    .await
                    .map(Resp::downgrade)
            }
            Translation::Incompatible => {
                return Err(ProxyError::IncompatibleRevision {
                    frontend: call.revision,
                    backend: link.revision,
                })
            }
        };

        result.map_err(|status| {
            // A reconnect replaced the channel while this call was in flight.
            if status.code() == Code::Unavailable && self.connection.generation() != link.generation {
                ProxyError::StaleConnection {
                    address: self.address().display().to_string(),
                }
            } else {
                ProxyError::Rpc {
                    status,
                    generation: link.generation,
                }
            }
        })
    }

    /// [`invoke`](Self::invoke), with failures classified by the connection.
    pub async fn invoke_with_error_handling<Req, Resp>(&self, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        match self.invoke(call, request).await {
            Ok(response) => Ok(response),
            Err(err) => self.connection.handle_error(err, false).map(|()| Resp::default()),
        }
    }

    /// Tolerant classification used by fan-out calls.
    pub fn tolerate(&self, err: ProxyError) -> Result<()> {
        self.connection.handle_error(err, true)
    }

    /// Strict classification, always yielding the wrapped error.
    pub fn classify(&self, err: ProxyError) -> ProxyError {
        match self.connection.handle_error(err, false) {
            Err(err) => err,
            Ok(()) => ProxyError::NotConnected {
                address: self.address().display().to_string(),
            },
        }
    }
}
