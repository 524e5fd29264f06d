//! gRPC server plumbing for the proxy socket.
//!
//! Requests are not decoded here. Each CRI service of each revision is
//! mounted as a tonic service that hands the raw message bytes and the
//! method path to a [`UnaryHandler`].

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, Bytes};
use futures::future::BoxFuture;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::{http, Body, StdError};
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::transport::Server;
use tonic::Status;
use tracing::debug;

use crate::error::Result;

/// Serves unary calls given their full method path.
pub trait UnaryHandler: Send + Sync + 'static {
    fn handle(self: Arc<Self>, path: String, request: tonic::Request<Bytes>) -> BoxFuture<'static, std::result::Result<Bytes, Status>>;
}

/// Passes message bodies through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoder;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> std::result::Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Fully qualified name of a mounted gRPC service.
pub trait ServiceName: Send + Sync + 'static {
    const NAME: &'static str;
}

macro_rules! service_names {
    ($($marker:ident => $name:literal,)+) => {
        $(
            #[derive(Debug)]
            pub enum $marker {}

            impl ServiceName for $marker {
                const NAME: &'static str = $name;
            }
        )+
    };
}

service_names! {
    V1Alpha1Runtime => "runtime.RuntimeService",
    V1Alpha1Image => "runtime.ImageService",
    V1Alpha2Runtime => "runtime.v1alpha2.RuntimeService",
    V1Alpha2Image => "runtime.v1alpha2.ImageService",
    V1Runtime => "runtime.v1.RuntimeService",
    V1Image => "runtime.v1.ImageService",
}

struct RawUnary<H> {
    path: String,
    handler: Arc<H>,
}

impl<H: UnaryHandler> UnaryService<Bytes> for RawUnary<H> {
    type Response = Bytes;
    type Future = BoxFuture<'static, std::result::Result<tonic::Response<Bytes>, Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let response = Arc::clone(&self.handler).handle(self.path.clone(), request);
        Box::pin(async move { response.await.map(tonic::Response::new) })
    }
}

/// One CRI service of one revision, mounted under `N::NAME`.
pub struct CriServer<N, H> {
    handler: Arc<H>,
    _name: PhantomData<fn() -> N>,
}

impl<N, H> CriServer<N, H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            _name: PhantomData,
        }
    }
}

impl<N, H> Clone for CriServer<N, H> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.handler))
    }
}

impl<N: ServiceName, H> NamedService for CriServer<N, H> {
    const NAME: &'static str = N::NAME;
}

impl<N, H, B> tonic::codegen::Service<http::Request<B>> for CriServer<N, H>
where
    N: ServiceName,
    H: UnaryHandler,
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Infallible;
    type Future = tonic::codegen::BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let method = RawUnary {
            path: req.uri().path().to_string(),
            handler: Arc::clone(&self.handler),
        };
        Box::pin(async move {
            let mut grpc = Grpc::new(RawCodec);
            Ok(grpc.unary(method, req).await)
        })
    }
}

/// Binds a unix socket, replacing a stale socket file left at `path`.
pub fn bind(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}

/// Serves every CRI service of every revision on `listener` until
/// `shutdown` resolves.
pub async fn serve<H, F>(handler: Arc<H>, listener: UnixListener, shutdown: F) -> Result<()>
where
    H: UnaryHandler,
    F: Future<Output = ()> + Send,
{
    Server::builder()
        .add_service(CriServer::<V1Alpha1Runtime, H>::new(Arc::clone(&handler)))
        .add_service(CriServer::<V1Alpha1Image, H>::new(Arc::clone(&handler)))
        .add_service(CriServer::<V1Alpha2Runtime, H>::new(Arc::clone(&handler)))
        .add_service(CriServer::<V1Alpha2Image, H>::new(Arc::clone(&handler)))
        .add_service(CriServer::<V1Runtime, H>::new(Arc::clone(&handler)))
        .add_service(CriServer::<V1Image, H>::new(handler))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;
    Ok(())
}
