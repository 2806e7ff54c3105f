//! Request handler seam and the endpoint-dispatch convenience handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::{IncomingRequest, Responder};

/// Boxed future type for object-safe endpoint closures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handles inbound calls on a channel.
///
/// The handler runs on a fresh task per call, after the caller's
/// frame-decode stack has unwound. It answers through the [`Responder`];
/// dropping the responder without answering leaves the call to the server
/// timeout sweep.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(&self, request: IncomingRequest, responder: Responder);
}

/// The default handler: refuses every call.
pub struct NoHandler;

#[async_trait]
impl RequestHandler for NoHandler {
    async fn handle_request(&self, request: IncomingRequest, responder: Responder) {
        tracing::debug!(id = request.id, endpoint = %request.endpoint(), "no handler installed");
        if let Err(err) = responder
            .send_not_ok(Bytes::new(), Bytes::from_static(b"no handler defined"))
            .await
        {
            tracing::debug!(id = request.id, error = %err, "default reply failed");
        }
    }
}

type Endpoint = dyn Fn(IncomingRequest, Responder) -> BoxFuture<'static, ()> + Send + Sync;

/// Dispatches calls by `arg1` to registered endpoint functions.
///
/// Installed implicitly by [`Channel::register`](crate::Channel::register);
/// unregistered endpoint names get a not-ok reply.
#[derive(Default)]
pub struct EndpointRouter {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an endpoint function under `name`, replacing any previous one.
    pub fn register<F, Fut>(&self, name: impl Into<String>, endpoint: F)
    where
        F: Fn(IncomingRequest, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Arc<Endpoint> =
            Arc::new(move |request, responder| Box::pin(endpoint(request, responder)));
        self.endpoints.write().insert(name.into(), boxed);
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.endpoints.read().keys().cloned().collect()
    }
}

#[async_trait]
impl RequestHandler for EndpointRouter {
    async fn handle_request(&self, request: IncomingRequest, responder: Responder) {
        let name = request.endpoint();
        let endpoint = { self.endpoints.read().get(&name).cloned() };
        match endpoint {
            Some(endpoint) => endpoint(request, responder).await,
            None => {
                tracing::debug!(id = request.id, endpoint = %name, "no such endpoint");
                let message = format!("no such endpoint: {name}");
                if let Err(err) = responder.send_not_ok(Bytes::new(), message.into_bytes()).await {
                    tracing::debug!(id = request.id, error = %err, "endpoint refusal failed");
                }
            }
        }
    }
}
