//! Common test utilities: an in-memory CRI runtime and a proxy wired to
//! instances of it over unix sockets.

#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criproxy_core::backend::client::unary;
use criproxy_core::backend::connector::dial;
use criproxy_core::backend::{BackendSpec, UnixConnector};
use criproxy_core::cri::current::*;
use criproxy_core::cri::{split_path, Revision};
use criproxy_core::namespace::Namespace;
use criproxy_core::proxy::server::{self, UnaryHandler};
use criproxy_core::RuntimeProxy;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use prost::Message;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tonic::transport::Channel;
use tonic::Status;
use url::Url;

pub const STREAM_URL: &str = "http://node.example:11250";
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Content digest of `name`, stable across runs.
pub fn digest_of(name: &str) -> String {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let word = hasher.finish().to_be_bytes();
    format!("sha256:{}", hex::encode(word.repeat(4)))
}

#[derive(Debug, Default)]
pub struct FakeState {
    /// Method names in the order they were called.
    pub journal: Vec<String>,
    pub sandboxes: Vec<PodSandbox>,
    pub containers: Vec<Container>,
    pub images: Vec<Image>,
    pub last_run_config: Option<PodSandboxConfig>,
    pub last_runtime_config: Option<RuntimeConfig>,
    /// Methods answered with a fixed error.
    pub failures: HashMap<String, Status>,
    /// Methods held back before they are answered.
    pub delays: HashMap<String, Duration>,
    next_sandbox: u32,
    next_container: u32,
}

/// A CRI runtime that speaks exactly one revision and keeps its objects in
/// memory. Calls to other revisions fail with `Unimplemented`.
pub struct FakeRuntime {
    pub name: String,
    pub revision: Revision,
    pub state: Mutex<FakeState>,
}

fn not_found(kind: &str, id: &str) -> Status {
    Status::not_found(format!("{} {:?} not found", kind, id))
}

fn image_of(spec: &Option<ImageSpec>) -> String {
    spec.as_ref().map(|spec| spec.image.clone()).unwrap_or_default()
}

fn handle<Req, Resp>(body: Bytes, f: impl FnOnce(Req) -> Result<Resp, Status>) -> Result<Bytes, Status>
where
    Req: Message + Default,
    Resp: Message,
{
    let request = Req::decode(body).map_err(|e| Status::invalid_argument(e.to_string()))?;
    f(request).map(|response| Bytes::from(response.encode_to_vec()))
}

impl FakeRuntime {
    pub fn new(name: &str, revision: Revision) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            revision,
            state: Mutex::new(FakeState::default()),
        })
    }

    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Journal without the `Version` calls made by the proxy's probe.
    pub fn calls(&self) -> Vec<String> {
        self.journal().into_iter().filter(|method| method != "Version").collect()
    }

    pub fn called(&self, method: &str) -> bool {
        self.journal().iter().any(|m| m == method)
    }

    /// Answers every later call of `method` with `status`.
    pub fn fail(&self, method: &str, status: Status) {
        self.state.lock().failures.insert(method.to_string(), status);
    }

    pub fn delay(&self, method: &str, delay: Duration) {
        self.state.lock().delays.insert(method.to_string(), delay);
    }

    /// Number of `Version` calls, one per connection the proxy made.
    pub fn version_calls(&self) -> usize {
        self.journal().iter().filter(|method| *method == "Version").count()
    }

    fn delay_for(&self, path: &str) -> Option<Duration> {
        let (_, _, method) = split_path(path)?;
        self.state.lock().delays.get(method).copied()
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        self.state.lock().containers.iter().find(|c| c.id == id).cloned()
    }

    fn dispatch(&self, path: &str, body: Bytes) -> Result<Bytes, Status> {
        let Some((revision, _, method)) = split_path(path) else {
            return Err(Status::unimplemented(format!("unknown method {}", path)));
        };
        if revision != self.revision {
            return Err(Status::unimplemented(format!("unknown service for {}", path)));
        }

        let mut state = self.state.lock();
        state.journal.push(method.to_string());
        if let Some(status) = state.failures.get(method) {
            return Err(status.clone());
        }
        match method {
            "Version" => handle(body, |_: VersionRequest| {
                Ok(VersionResponse {
                    version: "0.1.0".to_string(),
                    runtime_name: self.name.clone(),
                    runtime_version: "1.0".to_string(),
                    runtime_api_version: self.revision.package().to_string(),
                })
            }),
            "Status" => handle(body, |_: StatusRequest| Ok(StatusResponse::default())),
            "UpdateRuntimeConfig" => handle(body, |req: UpdateRuntimeConfigRequest| {
                state.last_runtime_config = req.runtime_config;
                Ok(UpdateRuntimeConfigResponse {})
            }),
            "RunPodSandbox" => handle(body, |req: RunPodSandboxRequest| {
                state.next_sandbox += 1;
                let id = format!("pod-{}", state.next_sandbox);
                let config = req.config.unwrap_or_default();
                state.sandboxes.push(PodSandbox {
                    id: id.clone(),
                    metadata: config.metadata.clone(),
                    labels: config.labels.clone(),
                    annotations: config.annotations.clone(),
                    ..Default::default()
                });
                state.last_run_config = Some(config);
                Ok(RunPodSandboxResponse { pod_sandbox_id: id })
            }),
            "StopPodSandbox" => handle(body, |req: StopPodSandboxRequest| {
                let sandbox = state
                    .sandboxes
                    .iter_mut()
                    .find(|s| s.id == req.pod_sandbox_id)
                    .ok_or_else(|| not_found("pod sandbox", &req.pod_sandbox_id))?;
                sandbox.set_state(PodSandboxState::SandboxNotready);
                Ok(StopPodSandboxResponse {})
            }),
            "RemovePodSandbox" => handle(body, |req: RemovePodSandboxRequest| {
                state.sandboxes.retain(|s| s.id != req.pod_sandbox_id);
                Ok(RemovePodSandboxResponse {})
            }),
            "PodSandboxStatus" => handle(body, |req: PodSandboxStatusRequest| {
                let sandbox = state
                    .sandboxes
                    .iter()
                    .find(|s| s.id == req.pod_sandbox_id)
                    .ok_or_else(|| not_found("pod sandbox", &req.pod_sandbox_id))?;
                Ok(PodSandboxStatusResponse {
                    status: Some(PodSandboxStatus {
                        id: sandbox.id.clone(),
                        metadata: sandbox.metadata.clone(),
                        state: sandbox.state,
                        annotations: sandbox.annotations.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
            }),
            "ListPodSandbox" => handle(body, |req: ListPodSandboxRequest| {
                let filter = req.filter.unwrap_or_default();
                let items = state
                    .sandboxes
                    .iter()
                    .filter(|s| filter.id.is_empty() || s.id == filter.id)
                    .cloned()
                    .collect();
                Ok(ListPodSandboxResponse { items })
            }),
            "CreateContainer" => handle(body, |req: CreateContainerRequest| {
                if !state.sandboxes.iter().any(|s| s.id == req.pod_sandbox_id) {
                    return Err(not_found("pod sandbox", &req.pod_sandbox_id));
                }
                let config = req.config.unwrap_or_default();
                state.next_container += 1;
                let id = format!("container-{}", state.next_container);
                let image = image_of(&config.image);
                state.containers.push(Container {
                    id: id.clone(),
                    pod_sandbox_id: req.pod_sandbox_id,
                    metadata: config.metadata,
                    image: config.image,
                    image_ref: digest_of(&image),
                    labels: config.labels,
                    annotations: config.annotations,
                    ..Default::default()
                });
                Ok(CreateContainerResponse { container_id: id })
            }),
            "StartContainer" => handle(body, |req: StartContainerRequest| {
                let container = state
                    .containers
                    .iter_mut()
                    .find(|c| c.id == req.container_id)
                    .ok_or_else(|| not_found("container", &req.container_id))?;
                container.set_state(ContainerState::ContainerRunning);
                Ok(StartContainerResponse {})
            }),
            "StopContainer" => handle(body, |req: StopContainerRequest| {
                let container = state
                    .containers
                    .iter_mut()
                    .find(|c| c.id == req.container_id)
                    .ok_or_else(|| not_found("container", &req.container_id))?;
                container.set_state(ContainerState::ContainerExited);
                Ok(StopContainerResponse {})
            }),
            "RemoveContainer" => handle(body, |req: RemoveContainerRequest| {
                state.containers.retain(|c| c.id != req.container_id);
                Ok(RemoveContainerResponse {})
            }),
            "ListContainers" => handle(body, |req: ListContainersRequest| {
                let filter = req.filter.unwrap_or_default();
                let containers = state
                    .containers
                    .iter()
                    .filter(|c| filter.id.is_empty() || c.id == filter.id)
                    .filter(|c| filter.pod_sandbox_id.is_empty() || c.pod_sandbox_id == filter.pod_sandbox_id)
                    .cloned()
                    .collect();
                Ok(ListContainersResponse { containers })
            }),
            "ContainerStatus" => handle(body, |req: ContainerStatusRequest| {
                let container = state
                    .containers
                    .iter()
                    .find(|c| c.id == req.container_id)
                    .ok_or_else(|| not_found("container", &req.container_id))?;
                Ok(ContainerStatusResponse {
                    status: Some(ContainerStatus {
                        id: container.id.clone(),
                        metadata: container.metadata.clone(),
                        state: container.state,
                        image: container.image.clone(),
                        image_ref: container.image_ref.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
            }),
            "ContainerStats" | "ListContainerStats" | "UpdateContainerResources" | "ReopenContainerLog" => {
                Err(Status::unimplemented(format!("{} is not supported by {}", method, self.name)))
            }
            "ExecSync" => handle(body, |req: ExecSyncRequest| {
                Ok(ExecSyncResponse {
                    stdout: req.cmd.join(" ").into_bytes(),
                    ..Default::default()
                })
            }),
            "Exec" => handle(body, |req: ExecRequest| {
                Ok(ExecResponse {
                    url: format!("/exec/{}", req.container_id),
                })
            }),
            "Attach" => handle(body, |req: AttachRequest| {
                Ok(AttachResponse {
                    url: format!("/attach/{}", req.container_id),
                })
            }),
            "PortForward" => handle(body, |req: PortForwardRequest| {
                Ok(PortForwardResponse {
                    url: format!("/portforward/{}", req.pod_sandbox_id),
                })
            }),
            "ListImages" => handle(body, |req: ListImagesRequest| {
                let wanted = req.filter.map(|f| image_of(&f.image)).unwrap_or_default();
                let images = state
                    .images
                    .iter()
                    .filter(|i| wanted.is_empty() || i.id == wanted || i.repo_tags.contains(&wanted))
                    .cloned()
                    .collect();
                Ok(ListImagesResponse { images })
            }),
            "ImageStatus" => handle(body, |req: ImageStatusRequest| {
                let wanted = image_of(&req.image);
                let image = state
                    .images
                    .iter()
                    .find(|i| i.id == wanted || i.repo_tags.contains(&wanted))
                    .cloned();
                Ok(ImageStatusResponse {
                    image,
                    ..Default::default()
                })
            }),
            "PullImage" => handle(body, |req: PullImageRequest| {
                let name = image_of(&req.image);
                let id = digest_of(&name);
                if !state.images.iter().any(|i| i.id == id) {
                    state.images.push(Image {
                        id: id.clone(),
                        repo_tags: vec![name],
                        size: 1024,
                        ..Default::default()
                    });
                }
                Ok(PullImageResponse { image_ref: id })
            }),
            "RemoveImage" => handle(body, |req: RemoveImageRequest| {
                let wanted = image_of(&req.image);
                state.images.retain(|i| i.id != wanted && !i.repo_tags.contains(&wanted));
                Ok(RemoveImageResponse {})
            }),
            "ImageFsInfo" => handle(body, |_: ImageFsInfoRequest| {
                Ok(ImageFsInfoResponse {
                    image_filesystems: vec![FilesystemUsage {
                        fs_id: Some(FilesystemIdentifier {
                            mountpoint: format!("/var/lib/{}", self.name),
                        }),
                        ..Default::default()
                    }],
                })
            }),
            _ => Err(Status::unimplemented(format!("unknown method {}", path))),
        }
    }
}

impl UnaryHandler for FakeRuntime {
    fn handle(self: Arc<Self>, path: String, request: tonic::Request<Bytes>) -> BoxFuture<'static, Result<Bytes, Status>> {
        Box::pin(async move {
            if let Some(delay) = self.delay_for(&path) {
                tokio::time::sleep(delay).await;
            }
            self.dispatch(&path, request.into_inner())
        })
    }
}

/// One backend of a test setup. `revision: None` leaves the socket absent.
pub struct Backend {
    pub id: &'static str,
    pub revision: Option<Revision>,
}

impl Backend {
    pub fn online(id: &'static str) -> Self {
        Self {
            id,
            revision: Some(Revision::V1),
        }
    }

    pub fn speaking(id: &'static str, revision: Revision) -> Self {
        Self {
            id,
            revision: Some(revision),
        }
    }

    pub fn offline(id: &'static str) -> Self {
        Self { id, revision: None }
    }
}

/// A running proxy in front of fake runtimes.
pub struct TestProxy {
    pub dir: TempDir,
    pub proxy: Arc<RuntimeProxy>,
    /// Fake runtime per backend, `None` for offline ones.
    pub runtimes: Vec<Option<Arc<FakeRuntime>>>,
    pub channel: Channel,
    shutdown: Vec<oneshot::Sender<()>>,
}

fn socket_path(dir: &Path, id: &str) -> PathBuf {
    let name = if id.is_empty() { "primary" } else { id };
    dir.join(format!("{}.sock", name))
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + CALL_TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl TestProxy {
    pub async fn start(backends: Vec<Backend>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut shutdown = Vec::new();
        let mut runtimes = Vec::new();
        let mut specs = Vec::new();

        for backend in &backends {
            let path = socket_path(dir.path(), backend.id);
            let namespace = if backend.id.is_empty() {
                Namespace::primary()
            } else {
                Namespace::named(backend.id).unwrap()
            };
            specs.push(BackendSpec::new(namespace, &path));

            let Some(revision) = backend.revision else {
                runtimes.push(None);
                continue;
            };
            let runtime = FakeRuntime::new(if backend.id.is_empty() { "primary" } else { backend.id }, revision);
            let listener = server::bind(&path).unwrap();
            let (tx, rx) = oneshot::channel::<()>();
            tokio::spawn(server::serve(Arc::clone(&runtime), listener, async {
                let _ = rx.await;
            }));
            shutdown.push(tx);
            runtimes.push(Some(runtime));
        }

        let connector = UnixConnector::new(CALL_TIMEOUT).poll_interval(Duration::from_millis(20));
        let proxy = Arc::new(
            RuntimeProxy::new(specs, Arc::new(connector), CALL_TIMEOUT, Url::parse(STREAM_URL).unwrap()).unwrap(),
        );

        let proxy_path = dir.path().join("criproxy.sock");
        let listener = server::bind(&proxy_path).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let serving = Arc::clone(&proxy);
        tokio::spawn(async move {
            let _ = serving
                .serve_on(listener, async {
                    let _ = rx.await;
                })
                .await;
        });
        shutdown.push(tx);

        for (client, runtime) in proxy.router().clients().iter().zip(&runtimes) {
            if runtime.is_some() {
                wait_until(|| client.is_connected()).await;
            }
        }

        let channel = dial(&proxy_path, CALL_TIMEOUT).await.unwrap();
        Self {
            dir,
            proxy,
            runtimes,
            channel,
            shutdown,
        }
    }

    pub fn runtime(&self, index: usize) -> &Arc<FakeRuntime> {
        self.runtimes[index].as_ref().expect("backend is offline")
    }

    pub async fn call_path<Req, Resp>(&self, path: String, request: Req) -> Result<Resp, Status>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        unary(self.channel.clone(), path, request, Some(CALL_TIMEOUT)).await
    }

    /// Calls `method` of the v1 runtime service.
    pub async fn runtime_call<Req, Resp>(&self, method: &str, request: Req) -> Result<Resp, Status>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        self.call_path(Revision::V1.method_path("RuntimeService", method), request)
            .await
    }

    /// Calls `method` of the v1 image service.
    pub async fn image_call<Req, Resp>(&self, method: &str, request: Req) -> Result<Resp, Status>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        self.call_path(Revision::V1.method_path("ImageService", method), request)
            .await
    }

    pub async fn run_pod_sandbox(&self, name: &str, target_runtime: Option<&str>) -> Result<String, Status> {
        let mut config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: name.to_string(),
                uid: format!("{}-uid", name),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            ..Default::default()
        };
        if let Some(target) = target_runtime {
            config.annotations.insert(
                criproxy_core::namespace::TARGET_RUNTIME_ANNOTATION.to_string(),
                target.to_string(),
            );
        }
        let response: RunPodSandboxResponse = self
            .runtime_call(
                "RunPodSandbox",
                RunPodSandboxRequest {
                    config: Some(config),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.pod_sandbox_id)
    }

    pub async fn pull_image(&self, image: &str) -> Result<String, Status> {
        let response: PullImageResponse = self
            .image_call(
                "PullImage",
                PullImageRequest {
                    image: Some(ImageSpec {
                        image: image.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.image_ref)
    }

    pub async fn create_container(&self, pod_sandbox_id: &str, image: &str) -> Result<String, Status> {
        let response: CreateContainerResponse = self
            .runtime_call(
                "CreateContainer",
                CreateContainerRequest {
                    pod_sandbox_id: pod_sandbox_id.to_string(),
                    config: Some(ContainerConfig {
                        metadata: Some(ContainerMetadata {
                            name: "app".to_string(),
                            attempt: 0,
                        }),
                        image: Some(ImageSpec {
                            image: image.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        Ok(response.container_id)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
    }
}
