//! Service Call Dispatcher
//!
//! Orchestrates a single invocation:
//! 1. **Resolve**: ask the local registry, then (only if absent locally) the remote
//!    registry, then let the router pick. Done synchronously on every call; targets are
//!    never cached because membership can change between two calls.
//! 2. **Invoke**: run the local handler directly, or connect to the target address through
//!    the transport client provider (bounded by the connect timeout) and forward the message.
//! 3. **Deliver**: hand back the reply (or stream of replies), optionally wrapped as a message.

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt, future, stream};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use super::router::{Router, Target};
use crate::error::{MeshError, MeshResult};
use crate::registry::local::LocalRegistry;
use crate::registry::remote::RemoteRegistry;
use crate::registry::types::{AsyncModel, Endpoint, Message};
use crate::transport::TransportClientProvider;

/// Lazy sequence of replies; the first `Err` is also the last item.
pub type ResponseStream = BoxStream<'static, MeshResult<Value>>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ServiceCall {
    local: Arc<LocalRegistry>,
    remote: Arc<RemoteRegistry>,
    router: Arc<dyn Router>,
    transport: Option<Arc<dyn TransportClientProvider>>,
    connect_timeout: Duration,
}

impl ServiceCall {
    pub fn new(
        local: Arc<LocalRegistry>,
        remote: Arc<RemoteRegistry>,
        router: Arc<dyn Router>,
        transport: Option<Arc<dyn TransportClientProvider>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            local,
            remote,
            router,
            transport,
            connect_timeout,
        }
    }

    /// Resolves the target of `qualifier` against the current registry state.
    pub fn resolve(&self, qualifier: &str) -> MeshResult<Target> {
        let local_available = self.local.has(qualifier);
        let candidates = if local_available {
            Vec::new()
        } else {
            self.remote.candidates_for(qualifier)
        };

        self.router
            .select(qualifier, local_available, &candidates)
            .ok_or_else(|| {
                tracing::debug!("No route for '{}'", qualifier);
                MeshError::no_route(qualifier)
            })
    }

    /// Whether some local handler or remote endpoint currently serves `qualifier`.
    pub fn is_resolvable(&self, qualifier: &str) -> bool {
        self.local.has(qualifier) || !self.remote.candidates_for(qualifier).is_empty()
    }

    pub(crate) fn remote_registry(&self) -> &Arc<RemoteRegistry> {
        &self.remote
    }

    pub async fn request_response(
        &self,
        message: Message,
        message_format: bool,
    ) -> MeshResult<Value> {
        let qualifier = message.qualifier.clone();

        let data = match self.resolve(&qualifier)? {
            Target::Local => self.local.invoke_response(message).await?,
            Target::Remote(endpoint) => {
                check_model(&endpoint, AsyncModel::RequestResponse)?;
                let transport = self.transport()?;

                tracing::debug!("Forwarding '{}' to {}", qualifier, endpoint.address);
                let client = transport
                    .connect(&endpoint.address, self.connect_timeout)
                    .await?;
                client.request_response(message).await?
            }
        };

        Ok(format_response(&qualifier, data, message_format))
    }

    pub fn request_stream(&self, message: Message, message_format: bool) -> ResponseStream {
        let qualifier = message.qualifier.clone();

        let replies = match self.resolve(&qualifier) {
            Ok(Target::Local) => match self.local.invoke_stream(message) {
                Ok(replies) => replies,
                Err(e) => failed(e),
            },
            Ok(Target::Remote(endpoint)) => match self.remote_stream(endpoint, message) {
                Ok(replies) => replies,
                Err(e) => failed(e),
            },
            Err(e) => failed(e),
        };

        terminate_on_error(replies)
            .map(move |item| item.map(|data| format_response(&qualifier, data, message_format)))
            .boxed()
    }

    fn remote_stream(&self, endpoint: Endpoint, message: Message) -> MeshResult<ResponseStream> {
        check_model(&endpoint, AsyncModel::RequestStream)?;
        let transport = self.transport()?;
        let connect_timeout = self.connect_timeout;

        tracing::debug!(
            "Forwarding stream '{}' to {}",
            message.qualifier,
            endpoint.address
        );

        // Nothing is connected until the caller polls the stream.
        Ok(stream::once(async move {
            let client = transport.connect(&endpoint.address, connect_timeout).await?;
            client.request_stream(message).await
        })
        .try_flatten()
        .boxed())
    }

    fn transport(&self) -> MeshResult<Arc<dyn TransportClientProvider>> {
        self.transport
            .clone()
            .ok_or_else(|| MeshError::Transport("no transport configured".to_string()))
    }
}

fn check_model(endpoint: &Endpoint, expected: AsyncModel) -> MeshResult<()> {
    if endpoint.async_model != expected {
        return Err(MeshError::AsyncModelMismatch {
            qualifier: endpoint.qualifier.clone(),
            expected,
            actual: endpoint.async_model,
        });
    }
    Ok(())
}

fn failed(error: MeshError) -> ResponseStream {
    stream::once(future::ready(Err(error))).boxed()
}

/// Ends the stream right after its first error.
pub(crate) fn terminate_on_error(replies: ResponseStream) -> ResponseStream {
    replies
        .scan(false, |errored, item| {
            if *errored {
                return future::ready(None);
            }
            *errored = item.is_err();
            future::ready(Some(item))
        })
        .boxed()
}

fn format_response(qualifier: &str, data: Value, message_format: bool) -> Value {
    if message_format {
        json!({ "qualifier": qualifier, "data": data })
    } else {
        data
    }
}

/// Inbound path used by transport servers: serves from the local registry only and
/// never forwards a call to another node.
#[derive(Clone)]
pub struct LocalDispatcher {
    local: Arc<LocalRegistry>,
}

impl LocalDispatcher {
    pub fn new(local: Arc<LocalRegistry>) -> Self {
        Self { local }
    }

    pub fn has(&self, qualifier: &str) -> bool {
        self.local.has(qualifier)
    }

    pub async fn request_response(&self, message: Message) -> MeshResult<Value> {
        if !self.local.has(&message.qualifier) {
            return Err(MeshError::no_route(&message.qualifier));
        }
        self.local.invoke_response(message).await
    }

    pub fn request_stream(&self, message: Message) -> ResponseStream {
        match self.local.invoke_stream(message) {
            Ok(replies) => terminate_on_error(replies),
            Err(e) => failed(e),
        }
    }
}
