//! Backend selection and the per-method routing strategies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use url::Url;

use super::image_names::ImageNameTable;
use crate::backend::{BackendClient, BackendConnection, BackendSpec, Call, Connector};
use crate::cri::capability::{set_field, value_of};
use crate::cri::{CriMessage, ObjectList};
use crate::error::{ProxyError, Result};
use crate::namespace::{is_digest, TARGET_RUNTIME_ANNOTATION};

/// How a method picks the backend(s) it is forwarded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Always the primary runtime.
    Primary,
    /// Every connected runtime, failures collected.
    Broadcast,
    /// By the target-runtime annotation of a new pod sandbox.
    Annotations,
    /// By the prefix of the pod sandbox id.
    PodSandbox,
    /// By the prefix of the container id.
    Container,
    /// By pod sandbox id, with the image checked against it.
    CreateContainer,
    /// By image prefix. An offline runtime yields an empty response.
    ImageStatus,
    PullImage,
    RemoveImage,
}

/// Backend an image reference resolves to.
#[derive(Debug)]
pub struct ImageMatch<'a> {
    pub client: &'a Arc<BackendClient>,
    /// Reference as the backend knows it.
    pub unprefixed: String,
}

/// Backends a list request is narrowed to by its filters.
#[derive(Debug)]
enum Narrowing {
    All,
    One(Arc<BackendClient>),
    /// The filters point at different runtimes, or at one that is offline.
    Nothing,
}

pub struct Router {
    clients: Vec<Arc<BackendClient>>,
    stream_url: Url,
    image_names: ImageNameTable,
}

impl Router {
    /// Builds one client per backend. The first backend must be the
    /// primary one and no other may be.
    pub fn new(
        backends: Vec<BackendSpec>,
        connector: Arc<dyn Connector>,
        connection_timeout: Duration,
        stream_url: Url,
    ) -> Result<Self> {
        validate(&backends)?;
        let clients = backends
            .into_iter()
            .map(|spec| {
                let connection = BackendConnection::new(spec.address, connection_timeout, connector.clone());
                Arc::new(BackendClient::new(spec.namespace, Arc::new(connection)))
            })
            .collect();
        Ok(Self {
            clients,
            stream_url,
            image_names: ImageNameTable::new(),
        })
    }

    pub fn clients(&self) -> &[Arc<BackendClient>] {
        &self.clients
    }

    pub fn primary(&self) -> &Arc<BackendClient> {
        &self.clients[0]
    }

    fn named(&self) -> &[Arc<BackendClient>] {
        &self.clients[1..]
    }

    pub fn image_names(&self) -> &ImageNameTable {
        &self.image_names
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    /// Starts connecting to every backend in the background.
    pub fn connect_all(&self) {
        for client in &self.clients {
            client.kick();
        }
    }

    pub fn stop(&self) {
        for client in &self.clients {
            client.connection().stop();
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Backend selection
    // ─────────────────────────────────────────────────────────────────

    /// Runtime owning `id`, and the id as that runtime knows it.
    pub fn match_id<'a>(&self, id: &'a str) -> (&Arc<BackendClient>, &'a str) {
        self.named()
            .iter()
            .find_map(|client| client.namespace().id_prefix_matches(id).map(|rest| (client, rest)))
            .unwrap_or((self.primary(), id))
    }

    /// Runtime owning `image`. Digests are looked up in the image table.
    pub fn match_image(&self, image: &str) -> ImageMatch<'_> {
        if is_digest(image) {
            let known = self.image_names.lookup(image);
            return ImageMatch {
                client: match &known {
                    Some(name) => self.match_name(name).0,
                    None => self.primary(),
                },
                unprefixed: image.to_string(),
            };
        }
        let (client, unprefixed) = self.match_name(image);
        ImageMatch {
            client,
            unprefixed: unprefixed.to_string(),
        }
    }

    fn match_name<'a>(&self, image: &'a str) -> (&Arc<BackendClient>, &'a str) {
        self.named()
            .iter()
            .find_map(|client| client.namespace().image_matches(image).map(|rest| (client, rest)))
            .unwrap_or((self.primary(), image))
    }

    /// Makes sure `client` can take a call.
    ///
    /// The primary runtime is waited for. A named runtime is never waited
    /// for: it gets a reconnect kick and must already be connected.
    async fn ready(&self, client: &Arc<BackendClient>) -> Result<()> {
        if client.is_primary() {
            return client.wait_connected().await;
        }
        client.kick();
        if client.is_connected() {
            Ok(())
        } else {
            Err(ProxyError::TargetUnavailable(client.namespace().id().to_string()))
        }
    }

    pub async fn client_for_id<'a>(&self, id: &'a str) -> Result<(Arc<BackendClient>, &'a str)> {
        let (client, unprefixed) = self.match_id(id);
        let client = Arc::clone(client);
        self.ready(&client).await?;
        Ok((client, unprefixed))
    }

    /// With `no_error_if_not_connected`, an offline named runtime yields
    /// `None` instead of an error.
    pub async fn client_for_image(
        &self,
        image: &str,
        no_error_if_not_connected: bool,
    ) -> Result<Option<(Arc<BackendClient>, String)>> {
        let matched = self.match_image(image);
        let client = Arc::clone(matched.client);
        match self.ready(&client).await {
            Ok(()) => Ok(Some((client, matched.unprefixed))),
            Err(ProxyError::TargetUnavailable(_)) if no_error_if_not_connected => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn client_for_annotations(&self, annotations: &HashMap<String, String>) -> Result<Arc<BackendClient>> {
        let client = self
            .clients
            .iter()
            .find(|client| client.namespace().annotations_match(annotations))
            .cloned()
            .ok_or_else(|| {
                ProxyError::UnknownRuntime(
                    annotations
                        .get(TARGET_RUNTIME_ANNOTATION)
                        .cloned()
                        .unwrap_or_default(),
                )
            })?;
        client.wait_connected().await?;
        Ok(client)
    }

    /// Points a relative streaming URL at the proxy's stream endpoint.
    pub fn fix_streaming_url(&self, url: &str) -> String {
        match Url::parse(url) {
            Err(url::ParseError::RelativeUrlWithoutBase) if !url.is_empty() => self
                .stream_url
                .join(url)
                .map(String::from)
                .unwrap_or_else(|_| url.to_string()),
            _ => url.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Routing strategies
    // ─────────────────────────────────────────────────────────────────

    pub async fn route<Req, Resp>(&self, route: Route, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        match route {
            Route::Primary => self.pass_to_primary(call, request).await,
            Route::Broadcast => self.update_runtime_config(call, request).await,
            Route::Annotations => self.run_pod_sandbox(call, request).await,
            Route::PodSandbox => self.by_id(call, request, Req::pod_sandbox_id).await,
            Route::Container => self.by_id(call, request, Req::container_id).await,
            Route::CreateContainer => self.create_container(call, request).await,
            Route::ImageStatus => self.image_status(call, request).await,
            Route::PullImage => self.pull_image(call, request).await,
            Route::RemoveImage => self.remove_image(call, request).await,
        }
    }

    pub async fn pass_to_primary<Req, Resp>(&self, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let client = self.primary();
        client.wait_connected().await?;
        client.invoke_with_error_handling(call, request).await
    }

    /// Sends the request to every connected runtime, without stopping at
    /// the first failure.
    pub async fn update_runtime_config<Req, Resp>(&self, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let mut errors = Vec::new();
        for client in &self.clients {
            if !client.is_connected() {
                client.kick();
                continue;
            }
            if let Err(err) = client.invoke::<Req, Resp>(call, request.clone()).await {
                errors.push(client.classify(err).to_string());
            }
        }
        if errors.is_empty() {
            Ok(Resp::default())
        } else {
            Err(ProxyError::Broadcast(errors))
        }
    }

    pub async fn run_pod_sandbox<Req, Resp>(&self, call: &Call, request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let annotations = request.annotations().cloned().unwrap_or_default();
        let client = self.client_for_annotations(&annotations).await?;
        debug!("Creating pod sandbox on runtime {}", client.namespace());
        let response = client.invoke_with_error_handling(call, request).await?;
        Ok(self.finish(&client, response))
    }

    /// Routes by the id in `field`, unprefixing it on the way.
    async fn by_id<Req, Resp>(
        &self,
        call: &Call,
        mut request: Req,
        field: fn(&mut Req) -> Option<&mut String>,
    ) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let id = value_of(field(&mut request));
        let (client, unprefixed) = self.client_for_id(&id).await?;
        set_field(field(&mut request), unprefixed);
        let response = client.invoke_with_error_handling(call, request).await?;
        Ok(self.finish(&client, response))
    }

    /// Routes by pod sandbox and refuses an image name that belongs to a
    /// different runtime before anything is sent. Digests are not checked.
    pub async fn create_container<Req, Resp>(&self, call: &Call, mut request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let sandbox_id = value_of(request.pod_sandbox_id());
        let (client, unprefixed) = self.client_for_id(&sandbox_id).await?;

        let image = value_of(request.image());
        if image.is_empty() {
            return Err(ProxyError::NoImage);
        }
        // The same digest may exist on several runtimes.
        if !is_digest(&image) {
            let (owner, unprefixed_image) = self.match_name(&image);
            if !Arc::ptr_eq(owner, &client) {
                return Err(ProxyError::WrongRuntime(image));
            }
            set_field(request.image(), unprefixed_image);
        }

        set_field(request.pod_sandbox_id(), unprefixed);
        let response = client.invoke_with_error_handling(call, request).await?;
        Ok(self.finish(&client, response))
    }

    /// Fans a list request out and merges the results in backend order.
    ///
    /// Offline runtimes are kicked and skipped; a runtime that fails is
    /// logged and skipped.
    pub async fn list_objects<Req, Resp>(&self, call: &Call, mut request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage + ObjectList,
    {
        let targets = match self.narrow(&mut request).await? {
            Narrowing::All => self.clients.clone(),
            Narrowing::One(client) => vec![client],
            Narrowing::Nothing => return Ok(Resp::default()),
        };

        let mut items = Vec::new();
        for client in targets {
            if !client.is_connected() {
                client.kick();
                continue;
            }
            match client.invoke::<Req, Resp>(call, request.clone()).await {
                Ok(mut response) => {
                    items.extend(response.take_items().into_iter().map(|item| client.add_prefix(item)));
                }
                Err(err) => {
                    if let Err(err) = client.tolerate(err) {
                        warn!("List request failed for runtime {}: {}", client.namespace(), err);
                    }
                }
            }
        }

        let mut response = Resp::default();
        response.set_items(items);
        Ok(response)
    }

    async fn narrow<Req: CriMessage>(&self, request: &mut Req) -> Result<Narrowing> {
        let mut single: Option<Arc<BackendClient>> = None;
        let mut narrowed = false;

        let id = value_of(request.id_filter());
        if !id.is_empty() {
            let (client, unprefixed) = self.client_for_id(&id).await?;
            set_field(request.id_filter(), unprefixed);
            single = Some(client);
            narrowed = true;
        }

        let sandbox_id = value_of(request.pod_sandbox_id_filter());
        if !sandbox_id.is_empty() {
            let (client, unprefixed) = self.client_for_id(&sandbox_id).await?;
            set_field(request.pod_sandbox_id_filter(), unprefixed);
            if !agrees(&single, &client) {
                return Ok(Narrowing::Nothing);
            }
            single = Some(client);
            narrowed = true;
        }

        let image = value_of(request.image_filter());
        if !image.is_empty() {
            if let Some((client, unprefixed)) = self.client_for_image(&image, true).await? {
                set_field(request.image_filter(), unprefixed);
                if !agrees(&single, &client) {
                    return Ok(Narrowing::Nothing);
                }
                single = Some(client);
            }
            narrowed = true;
        }

        Ok(match (narrowed, single) {
            (false, _) => Narrowing::All,
            (true, Some(client)) => Narrowing::One(client),
            (true, None) => Narrowing::Nothing,
        })
    }

    pub async fn image_status<Req, Resp>(&self, call: &Call, mut request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let image = value_of(request.image());
        let Some((client, unprefixed)) = self.client_for_image(&image, true).await? else {
            debug!("Runtime for image {:?} is offline", image);
            return Ok(Resp::default());
        };
        set_field(request.image(), unprefixed);
        let response: Resp = client.invoke_with_error_handling(call, request).await?;

        match response.described_image() {
            Some((id, tag)) => {
                let name = tag.map(|tag| client.namespace().image_name(tag)).unwrap_or_else(|| image.clone());
                self.image_names.record(id, &name);
            }
            None => self.forget_image(&image),
        }
        Ok(self.finish(&client, response))
    }

    pub async fn pull_image<Req, Resp>(&self, call: &Call, mut request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let image = value_of(request.image());
        let (client, unprefixed) = self.strict_image_client(&image).await?;
        set_field(request.image(), unprefixed);
        let response: Resp = client.invoke_with_error_handling(call, request).await?;

        if let Some((image_ref, _)) = response.described_image() {
            self.image_names.record(image_ref, &image);
        }
        Ok(self.finish(&client, response))
    }

    pub async fn remove_image<Req, Resp>(&self, call: &Call, mut request: Req) -> Result<Resp>
    where
        Req: CriMessage,
        Resp: CriMessage,
    {
        let image = value_of(request.image());
        let (client, unprefixed) = self.strict_image_client(&image).await?;
        set_field(request.image(), unprefixed);
        let response: Resp = client.invoke_with_error_handling(call, request).await?;
        self.forget_image(&image);
        Ok(self.finish(&client, response))
    }

    async fn strict_image_client(&self, image: &str) -> Result<(Arc<BackendClient>, String)> {
        self.client_for_image(image, false)
            .await?
            .ok_or_else(|| ProxyError::TargetUnavailable(image.to_string()))
    }

    fn forget_image(&self, image: &str) {
        if is_digest(image) {
            self.image_names.forget(image);
        }
        self.image_names.forget_name(image);
    }

    /// Rewrites a response read from `client` for the caller.
    fn finish<Resp: CriMessage>(&self, client: &BackendClient, response: Resp) -> Resp {
        let mut response = client.add_prefix(response);
        if let Some(url) = response.url() {
            *url = self.fix_streaming_url(url);
        }
        response
    }
}

fn agrees(single: &Option<Arc<BackendClient>>, client: &Arc<BackendClient>) -> bool {
    single.as_ref().map_or(true, |existing| Arc::ptr_eq(existing, client))
}

fn validate(backends: &[BackendSpec]) -> Result<()> {
    let Some((first, rest)) = backends.split_first() else {
        return Err(ProxyError::Config("no sockets specified to connect to".to_string()));
    };
    if !first.namespace.is_primary() {
        return Err(ProxyError::Config(
            "the first runtime should be primary (no namespace id)".to_string(),
        ));
    }
    let mut seen = Vec::with_capacity(rest.len());
    for spec in rest {
        if spec.namespace.is_primary() {
            return Err(ProxyError::Config(
                "only the first runtime should be primary (no namespace id)".to_string(),
            ));
        }
        if seen.contains(&spec.namespace.id()) {
            return Err(ProxyError::Config(format!(
                "duplicate runtime namespace id {:?}",
                spec.namespace.id()
            )));
        }
        seen.push(spec.namespace.id());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::connection::tests::CountingConnector;
    use crate::backend::ConnectionState;
    use crate::cri::current;
    use crate::cri::RUNTIME_SERVICE;
    use crate::namespace::Namespace;
    use crate::cri::Revision;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn router() -> Router {
        let backends = vec![
            BackendSpec::new(Namespace::primary(), "/run/primary.sock"),
            BackendSpec::new(Namespace::named("alt").unwrap(), "/run/alt.sock"),
            BackendSpec::new(Namespace::named("other").unwrap(), "/run/other.sock"),
        ];
        Router::new(
            backends,
            CountingConnector::new(Duration::from_millis(1)),
            Duration::from_secs(5),
            Url::parse("http://10.0.0.5:11250").unwrap(),
        )
        .unwrap()
    }

    async fn connect_all(router: &Router) {
        for client in router.clients() {
            client.wait_connected().await.unwrap();
        }
    }

    #[test]
    fn test_validation() {
        let primary = || BackendSpec::new(Namespace::primary(), "/run/a.sock");
        let named = |id: &str| BackendSpec::new(Namespace::named(id).unwrap(), "/run/b.sock");
        let build = |backends| {
            Router::new(
                backends,
                CountingConnector::new(Duration::ZERO),
                Duration::from_secs(1),
                Url::parse("http://127.0.0.1:11250").unwrap(),
            )
        };

        assert!(build(vec![]).is_err());
        assert!(build(vec![named("alt")]).is_err());
        assert!(build(vec![primary(), primary()]).is_err());
        assert!(build(vec![primary(), named("alt"), named("alt")]).is_err());
        assert!(build(vec![primary(), named("alt"), named("kata")]).is_ok());
    }

    #[test]
    fn test_match_id() {
        let router = router();
        let (client, id) = router.match_id("alt__c1");
        assert_eq!(client.namespace().id(), "alt");
        assert_eq!(id, "c1");

        let (client, id) = router.match_id("c1");
        assert!(client.is_primary());
        assert_eq!(id, "c1");

        // An unknown prefix belongs to the primary runtime verbatim.
        let (client, id) = router.match_id("kata__c1");
        assert!(client.is_primary());
        assert_eq!(id, "kata__c1");
    }

    #[test]
    fn test_match_image() {
        let router = router();
        let matched = router.match_image("other/busybox:1.36");
        assert_eq!(matched.client.namespace().id(), "other");
        assert_eq!(matched.unprefixed, "busybox:1.36");

        let matched = router.match_image("busybox:1.36");
        assert!(matched.client.is_primary());

        let matched = router.match_image(DIGEST);
        assert!(matched.client.is_primary());

        router.image_names().record(DIGEST, "alt/nginx");
        let matched = router.match_image(DIGEST);
        assert_eq!(matched.client.namespace().id(), "alt");
        assert_eq!(matched.unprefixed, DIGEST);
    }

    #[test]
    fn test_fix_streaming_url() {
        let router = router();
        assert_eq!(router.fix_streaming_url("/exec/abc"), "http://10.0.0.5:11250/exec/abc");
        assert_eq!(
            router.fix_streaming_url("http://192.168.1.2:10010/attach/xyz"),
            "http://192.168.1.2:10010/attach/xyz"
        );
        assert_eq!(router.fix_streaming_url(""), "");
    }

    #[tokio::test]
    async fn test_offline_named_runtime_is_not_waited_for() {
        let router = router();
        let err = router.client_for_id("alt__c1").await.unwrap_err();
        assert!(matches!(err, ProxyError::TargetUnavailable(_)));
        // The failed lookup kicked a reconnect.
        assert_ne!(router.clients()[1].connection().state(), ConnectionState::Offline);

        assert!(router.client_for_image("alt/nginx", true).await.unwrap().is_none());

        // The primary runtime is waited for.
        let (client, id) = router.client_for_id("c1").await.unwrap();
        assert!(client.is_primary());
        assert_eq!(id, "c1");
    }

    #[tokio::test]
    async fn test_unknown_runtime_annotation() {
        let router = router();
        let mut annotations = HashMap::new();
        annotations.insert(TARGET_RUNTIME_ANNOTATION.to_string(), "kata".to_string());
        let err = router.client_for_annotations(&annotations).await.unwrap_err();
        assert_eq!(err.to_string(), "criproxy: unknown runtime: \"kata\"");
    }

    #[tokio::test]
    async fn test_conflicting_filters_narrow_to_nothing() {
        let router = router();
        connect_all(&router).await;

        let mut request = current::ListContainersRequest {
            filter: Some(current::ContainerFilter {
                id: "alt__c1".to_string(),
                pod_sandbox_id: "other__p1".to_string(),
                ..Default::default()
            }),
        };
        assert!(matches!(router.narrow(&mut request).await.unwrap(), Narrowing::Nothing));

        let mut request = current::ListContainersRequest {
            filter: Some(current::ContainerFilter {
                pod_sandbox_id: "alt__p1".to_string(),
                ..Default::default()
            }),
        };
        match router.narrow(&mut request).await.unwrap() {
            Narrowing::One(client) => assert_eq!(client.namespace().id(), "alt"),
            other => panic!("unexpected narrowing {:?}", other),
        }
        assert_eq!(request.filter.unwrap().pod_sandbox_id, "p1");

        let mut request = current::ListContainersRequest::default();
        assert!(matches!(router.narrow(&mut request).await.unwrap(), Narrowing::All));
    }

    #[tokio::test]
    async fn test_create_container_checks_image_runtime() {
        let router = router();
        connect_all(&router).await;
        let call = Call::new(RUNTIME_SERVICE, "CreateContainer", Revision::V1);

        let request = |sandbox: &str, image: &str| current::CreateContainerRequest {
            pod_sandbox_id: sandbox.to_string(),
            config: Some(current::ContainerConfig {
                image: Some(current::ImageSpec { image: image.to_string() }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let err = router
            .create_container::<_, current::CreateContainerResponse>(&call, request("alt__p1", "busybox"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "criproxy: image \"busybox\" is for a wrong runtime");

        let err = router
            .create_container::<_, current::CreateContainerResponse>(&call, request("p1", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoImage));

        let err = router
            .create_container::<_, current::CreateContainerResponse>(&call, request("alt__p1", "other/nginx"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::WrongRuntime(_)));
    }

    #[tokio::test]
    async fn test_create_container_by_digest_skips_image_check() {
        let router = router();
        connect_all(&router).await;
        router.image_names().record(DIGEST, "other/nginx");
        let call = Call::new(RUNTIME_SERVICE, "CreateContainer", Revision::V1);

        let request = current::CreateContainerRequest {
            pod_sandbox_id: "alt__p1".to_string(),
            config: Some(current::ContainerConfig {
                image: Some(current::ImageSpec { image: DIGEST.to_string() }),
                ..Default::default()
            }),
            ..Default::default()
        };
        // The check passes and the call reaches the lazy channel, which
        // has nothing listening behind it.
        let err = router
            .create_container::<_, current::CreateContainerResponse>(&call, request)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Backend { .. }), "{:?}", err);
    }
}
