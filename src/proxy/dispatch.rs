//! Method dispatch.
//!
//! Every forwarded method of every supported revision has an entry in a
//! process-wide table mapping its path to a handler and the verbosity its
//! requests are logged at. The table is built on first use and never
//! changes afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use lazy_static::lazy_static;
use prost::Message;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::{debug, trace};

use super::router::{Route, Router};
use super::server::UnaryHandler;
use crate::backend::Call;
use crate::cri::{current, legacy, CriMessage, ObjectList, Revision, Schema, IMAGE_SERVICE, RUNTIME_SERVICE};
use crate::error::{ProxyError, Result};

/// Verbosity of a method's request and response dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// State-changing calls, logged at DEBUG.
    Request,
    /// Status and version polling, logged at TRACE.
    Noisy,
    /// List calls, logged at TRACE under the `criproxy::list` target.
    List,
}

type Handler = Box<dyn Fn(Arc<Router>, Call, LogLevel, Bytes) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

pub struct DispatchEntry {
    pub service: &'static str,
    pub method: &'static str,
    pub revision: Revision,
    pub level: LogLevel,
    handler: Handler,
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Request => debug!($($arg)+),
            LogLevel::Noisy => trace!($($arg)+),
            LogLevel::List => trace!(target: "criproxy::list", $($arg)+),
        }
    };
}

fn decode<Req: CriMessage>(call: &Call, level: LogLevel, body: Bytes) -> Result<Req> {
    let request = Req::decode(body)?;
    log_at!(level, "ENTER: {}(): {:?}", call.path(), request);
    Ok(request)
}

fn encode<Resp: CriMessage>(call: &Call, level: LogLevel, response: Resp) -> Bytes {
    log_at!(level, "LEAVE: {}(): {:?}", call.path(), response);
    Bytes::from(response.encode_to_vec())
}

/// A method routed to one backend, or broadcast.
fn routed<Req, Resp>(route: Route) -> Handler
where
    Req: CriMessage,
    Resp: CriMessage,
{
    Box::new(move |router: Arc<Router>, call: Call, level: LogLevel, body: Bytes| {
        async move {
            let request = decode::<Req>(&call, level, body)?;
            let response: Resp = router.route(route, &call, request).await?;
            Ok::<_, ProxyError>(encode(&call, level, response))
        }
        .boxed()
    })
}

/// A method fanned out to every backend and merged.
fn listed<Req, Resp>() -> Handler
where
    Req: CriMessage,
    Resp: CriMessage + ObjectList,
{
    Box::new(|router: Arc<Router>, call: Call, level: LogLevel, body: Bytes| {
        async move {
            let request = decode::<Req>(&call, level, body)?;
            let response: Resp = router.list_objects(&call, request).await?;
            Ok::<_, ProxyError>(encode(&call, level, response))
        }
        .boxed()
    })
}

/// Registers methods of one schema module under one revision.
macro_rules! register {
    ($table:ident, $revision:expr, $schema:ident {
        $($service:ident $method:ident: $req:ident => $resp:ident, $builder:ident($($route:ident)?), $level:ident;)+
    }) => {
        $(
            $table.insert(
                $revision.method_path(service_name!($service), stringify!($method)),
                DispatchEntry {
                    service: service_name!($service),
                    method: stringify!($method),
                    revision: $revision,
                    level: LogLevel::$level,
                    handler: $builder::<$schema::$req, $schema::$resp>($(Route::$route)?),
                },
            );
        )+
    };
}

macro_rules! service_name {
    (RuntimeService) => {
        RUNTIME_SERVICE
    };
    (ImageService) => {
        IMAGE_SERVICE
    };
}

macro_rules! register_common {
    ($table:ident, $revision:expr, $schema:ident) => {
        register!($table, $revision, $schema {
            RuntimeService Version: VersionRequest => VersionResponse, routed(Primary), Noisy;
            RuntimeService Status: StatusRequest => StatusResponse, routed(Primary), Noisy;
            RuntimeService UpdateRuntimeConfig: UpdateRuntimeConfigRequest => UpdateRuntimeConfigResponse, routed(Broadcast), Request;
            RuntimeService RunPodSandbox: RunPodSandboxRequest => RunPodSandboxResponse, routed(Annotations), Request;
            RuntimeService StopPodSandbox: StopPodSandboxRequest => StopPodSandboxResponse, routed(PodSandbox), Request;
            RuntimeService RemovePodSandbox: RemovePodSandboxRequest => RemovePodSandboxResponse, routed(PodSandbox), Request;
            RuntimeService PodSandboxStatus: PodSandboxStatusRequest => PodSandboxStatusResponse, routed(PodSandbox), Noisy;
            RuntimeService ListPodSandbox: ListPodSandboxRequest => ListPodSandboxResponse, listed(), List;
            RuntimeService CreateContainer: CreateContainerRequest => CreateContainerResponse, routed(CreateContainer), Request;
            RuntimeService StartContainer: StartContainerRequest => StartContainerResponse, routed(Container), Request;
            RuntimeService StopContainer: StopContainerRequest => StopContainerResponse, routed(Container), Request;
            RuntimeService RemoveContainer: RemoveContainerRequest => RemoveContainerResponse, routed(Container), Request;
            RuntimeService ListContainers: ListContainersRequest => ListContainersResponse, listed(), List;
            RuntimeService ContainerStatus: ContainerStatusRequest => ContainerStatusResponse, routed(Container), Noisy;
            RuntimeService ContainerStats: ContainerStatsRequest => ContainerStatsResponse, routed(Container), Noisy;
            RuntimeService ListContainerStats: ListContainerStatsRequest => ListContainerStatsResponse, listed(), List;
            RuntimeService UpdateContainerResources: UpdateContainerResourcesRequest => UpdateContainerResourcesResponse, routed(Container), Request;
            RuntimeService ExecSync: ExecSyncRequest => ExecSyncResponse, routed(Container), Request;
            RuntimeService Exec: ExecRequest => ExecResponse, routed(Container), Request;
            RuntimeService Attach: AttachRequest => AttachResponse, routed(Container), Request;
            RuntimeService PortForward: PortForwardRequest => PortForwardResponse, routed(PodSandbox), Request;
            ImageService ListImages: ListImagesRequest => ListImagesResponse, listed(), List;
            ImageService ImageStatus: ImageStatusRequest => ImageStatusResponse, routed(ImageStatus), Noisy;
            ImageService PullImage: PullImageRequest => PullImageResponse, routed(PullImage), Request;
            ImageService RemoveImage: RemoveImageRequest => RemoveImageResponse, routed(RemoveImage), Request;
            ImageService ImageFsInfo: ImageFsInfoRequest => ImageFsInfoResponse, listed(), Request;
        });
    };
}

fn build_table() -> HashMap<String, DispatchEntry> {
    let mut table = HashMap::new();
    for revision in Revision::ALL {
        match revision.schema() {
            Schema::Legacy => {
                register_common!(table, revision, legacy);
            }
            Schema::Current => {
                register_common!(table, revision, current);
                register!(table, revision, current {
                    RuntimeService ReopenContainerLog: ReopenContainerLogRequest => ReopenContainerLogResponse, routed(Container), Request;
                });
            }
        }
    }
    table
}

lazy_static! {
    static ref DISPATCH_TABLE: HashMap<String, DispatchEntry> = build_table();
}

pub fn lookup(path: &str) -> Option<&'static DispatchEntry> {
    DISPATCH_TABLE.get(path)
}

/// Reads the caller's deadline from the `grpc-timeout` header.
pub fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    metadata
        .get("grpc-timeout")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
}

/// Parses a `grpc-timeout` value: up to eight digits and a unit.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let duration = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(duration)
}

/// Entry point of every unary call the proxy serves.
pub struct Dispatcher {
    router: Arc<Router>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn dispatch(&self, path: &str, body: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        let entry = lookup(path).ok_or_else(|| ProxyError::UnknownMethod(path.to_string()))?;
        let call = Call::new(entry.service, entry.method, entry.revision).with_timeout(timeout);
        (entry.handler)(Arc::clone(&self.router), call, entry.level, body).await
    }
}

impl UnaryHandler for Dispatcher {
    fn handle(self: Arc<Self>, path: String, request: tonic::Request<Bytes>) -> BoxFuture<'static, std::result::Result<Bytes, Status>> {
        let timeout = grpc_timeout(request.metadata());
        let body = request.into_inner();
        Box::pin(async move {
            self.dispatch(&path, body, timeout).await.map_err(|err| {
                debug!("FAIL: {}(): {}", path, err);
                Status::from(err)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_revision() {
        for revision in Revision::ALL {
            for (service, method) in [
                (RUNTIME_SERVICE, "Version"),
                (RUNTIME_SERVICE, "RunPodSandbox"),
                (RUNTIME_SERVICE, "ListContainerStats"),
                (IMAGE_SERVICE, "PullImage"),
                (IMAGE_SERVICE, "ImageFsInfo"),
            ] {
                let entry = lookup(&revision.method_path(service, method)).unwrap();
                assert_eq!(entry.revision, revision);
                assert_eq!(entry.method, method);
            }
        }
        assert_eq!(DISPATCH_TABLE.len(), 26 * 3 + 2);
    }

    #[test]
    fn test_legacy_methods_use_legacy_messages() {
        let entry = lookup("/runtime.RuntimeService/RunPodSandbox").unwrap();
        assert_eq!(entry.revision, Revision::V1Alpha1);
        assert_eq!(entry.service, RUNTIME_SERVICE);
        let legacy = DISPATCH_TABLE
            .values()
            .filter(|entry| entry.revision == Revision::V1Alpha1)
            .count();
        assert_eq!(legacy, 26);
    }

    #[test]
    fn test_reopen_container_log_needs_current_schema() {
        assert!(lookup("/runtime.RuntimeService/ReopenContainerLog").is_none());
        assert!(lookup("/runtime.v1alpha2.RuntimeService/ReopenContainerLog").is_some());
        assert!(lookup("/runtime.v1.RuntimeService/ReopenContainerLog").is_some());
    }

    #[test]
    fn test_log_levels() {
        let level = |path: &str| lookup(path).unwrap().level;
        assert_eq!(level("/runtime.v1.RuntimeService/Version"), LogLevel::Noisy);
        assert_eq!(level("/runtime.v1.RuntimeService/ContainerStats"), LogLevel::Noisy);
        assert_eq!(level("/runtime.v1.RuntimeService/ListPodSandbox"), LogLevel::List);
        assert_eq!(level("/runtime.v1.ImageService/ImageFsInfo"), LogLevel::Request);
        assert_eq!(level("/runtime.RuntimeService/CreateContainer"), LogLevel::Request);
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("100m"), Some(Duration::from_millis(100)));
        assert_eq!(parse_grpc_timeout("2S"), Some(Duration::from_secs(2)));
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("5n"), Some(Duration::from_nanos(5)));
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("10x"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        // Multi-byte input is rejected rather than split mid-character.
        assert_eq!(parse_grpc_timeout("10µ"), None);
        assert_eq!(parse_grpc_timeout("é"), None);
    }
}
