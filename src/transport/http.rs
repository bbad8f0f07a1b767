//! HTTP transport.
//!
//! Every node serves its local registry over axum; peers call it with reqwest.
//! Request-response is a plain JSON POST. Request-stream replies are newline-delimited
//! JSON frames ([`StreamFrame`]) written as the handler produces them.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::stream::BoxStream;
use futures::{StreamExt, future, stream};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::protocol::*;
use super::{ServerHandle, Transport, TransportClient, TransportClientProvider, TransportServerProvider};
use crate::error::{MeshError, MeshResult};
use crate::membership::types::Address;
use crate::registry::types::Message;
use crate::routing::dispatcher::{LocalDispatcher, ResponseStream};

/// Both halves of the HTTP transport.
pub fn http_transport() -> Transport {
    Transport {
        client_provider: Arc::new(HttpClientProvider::new()),
        server_provider: Arc::new(HttpServerProvider),
    }
}

// --- Server ---

/// Routes served by every node. Exposed so callers can serve it on a listener of their own.
pub fn router(address: &Address, dispatcher: LocalDispatcher) -> Router {
    Router::new()
        .route(ENDPOINT_PING, get(handle_ping))
        .route(ENDPOINT_REQUEST_RESPONSE, post(handle_request_response))
        .route(ENDPOINT_REQUEST_STREAM, post(handle_request_stream))
        .layer(Extension(dispatcher))
        .layer(Extension(address.clone()))
}

pub async fn handle_ping(Extension(address): Extension<Address>) -> Json<PingResponse> {
    Json(PingResponse {
        address: address.to_string(),
    })
}

pub async fn handle_request_response(
    Extension(dispatcher): Extension<LocalDispatcher>,
    Json(message): Json<Message>,
) -> (StatusCode, Json<CallResponse>) {
    let qualifier = message.qualifier.clone();

    match dispatcher.request_response(message).await {
        Ok(data) => (StatusCode::OK, Json(CallResponse::ok(data))),
        Err(MeshError::NoRoute { .. }) => {
            tracing::debug!("Inbound call for unknown qualifier '{}'", qualifier);
            (
                StatusCode::NOT_FOUND,
                Json(CallResponse::failed(format!("no handler for '{}'", qualifier))),
            )
        }
        Err(e) => {
            tracing::debug!("Inbound call '{}' failed: {}", qualifier, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CallResponse::failed(error_text(e))),
            )
        }
    }
}

pub async fn handle_request_stream(
    Extension(dispatcher): Extension<LocalDispatcher>,
    Json(message): Json<Message>,
) -> Response {
    tracing::debug!("Inbound stream '{}'", message.qualifier);

    if !dispatcher.has(&message.qualifier) {
        return (
            StatusCode::NOT_FOUND,
            Json(CallResponse::failed(format!("no handler for '{}'", message.qualifier))),
        )
            .into_response();
    }

    let frames = dispatcher
        .request_stream(message)
        .map(|item| match item {
            Ok(data) => StreamFrame::Next { data },
            Err(e) => StreamFrame::Error {
                message: error_text(e),
            },
        })
        .chain(stream::once(future::ready(StreamFrame::Complete)))
        .scan(false, |ended, frame| {
            if *ended {
                return future::ready(None);
            }
            *ended = !matches!(frame, StreamFrame::Next { .. });
            future::ready(Some(frame))
        })
        .map(|frame| Ok::<_, Infallible>(frame.to_line()));

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(frames),
    )
        .into_response()
}

/// The handler's own message travels as-is; the caller re-wraps it with its qualifier.
fn error_text(error: MeshError) -> String {
    match error {
        MeshError::RemoteInvocation { message, .. } => message,
        other => other.to_string(),
    }
}

pub struct HttpServerProvider;

#[async_trait]
impl TransportServerProvider for HttpServerProvider {
    async fn start(
        &self,
        address: &Address,
        dispatcher: LocalDispatcher,
    ) -> MeshResult<ServerHandle> {
        let listener = tokio::net::TcpListener::bind(address.to_string())
            .await
            .map_err(|e| MeshError::Transport(format!("failed to bind {}: {}", address, e)))?;

        let app = router(address, dispatcher);
        let (shutdown, stopped) = oneshot::channel::<()>();
        let server_address = address.clone();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!("HTTP server on {} failed: {}", server_address, e);
            }
        });

        tracing::info!("HTTP server listening on {}", address);
        Ok(ServerHandle::new(address.clone(), shutdown, task))
    }
}

// --- Client ---

pub struct HttpClientProvider {
    http_client: reqwest::Client,
}

impl HttpClientProvider {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpClientProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportClientProvider for HttpClientProvider {
    /// Calls the peer's ping endpoint with exponential backoff until it answers
    /// or the deadline passes.
    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> MeshResult<Arc<dyn TransportClient>> {
        let deadline = Instant::now() + timeout;
        let url = format!("http://{}{}", address, ENDPOINT_PING);
        let mut delay_ms = 150u64;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("Connection to {} timed out after {:?}", address, timeout);
                return Err(MeshError::ConnectionTimeout {
                    address: address.clone(),
                    timeout,
                });
            }

            match self.http_client.get(&url).timeout(remaining).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("Connected to {}", address);
                    return Ok(Arc::new(HttpClient {
                        address: address.clone(),
                        http_client: self.http_client.clone(),
                    }));
                }
                Ok(resp) => tracing::debug!("Ping to {} answered {}", address, resp.status()),
                Err(e) => tracing::debug!("Ping to {} failed: {}", address, e),
            }

            let jitter = rand::random::<u64>() % 50;
            let pause = Duration::from_millis(delay_ms + jitter)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(pause).await;
            delay_ms = (delay_ms * 2).min(1200);
        }
    }
}

struct HttpClient {
    address: Address,
    http_client: reqwest::Client,
}

impl HttpClient {
    fn url(&self, endpoint: &str) -> String {
        format!("http://{}{}", self.address, endpoint)
    }

    fn transport_error(&self, error: impl std::fmt::Display) -> MeshError {
        MeshError::Transport(format!("request to {} failed: {}", self.address, error))
    }

    async fn post(&self, endpoint: &str, message: &Message) -> MeshResult<reqwest::Response> {
        self.http_client
            .post(self.url(endpoint))
            .json(message)
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    async fn failure(&self, qualifier: String, response: reqwest::Response) -> MeshError {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return MeshError::NoRoute { qualifier };
        }
        match response.json::<CallResponse>().await {
            Ok(CallResponse {
                error: Some(message),
                ..
            }) => MeshError::RemoteInvocation { qualifier, message },
            _ => self.transport_error(status),
        }
    }
}

#[async_trait]
impl TransportClient for HttpClient {
    async fn request_response(&self, message: Message) -> MeshResult<Value> {
        let qualifier = message.qualifier.clone();
        let response = self.post(ENDPOINT_REQUEST_RESPONSE, &message).await?;

        if !response.status().is_success() {
            return Err(self.failure(qualifier, response).await);
        }

        let body: CallResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        match body {
            CallResponse {
                error: Some(message),
                ..
            } => Err(MeshError::RemoteInvocation { qualifier, message }),
            CallResponse { data, .. } => Ok(data.unwrap_or(Value::Null)),
        }
    }

    async fn request_stream(&self, message: Message) -> MeshResult<ResponseStream> {
        let qualifier = message.qualifier.clone();
        let response = self.post(ENDPOINT_REQUEST_STREAM, &message).await?;

        if !response.status().is_success() {
            return Err(self.failure(qualifier, response).await);
        }

        let reader = FrameReader {
            chunks: response.bytes_stream().boxed(),
            buffer: Vec::new(),
            qualifier,
            address: self.address.clone(),
            done: false,
        };

        Ok(stream::unfold(reader, |mut reader| async move {
            let item = reader.next_item().await?;
            Some((item, reader))
        })
        .boxed())
    }
}

/// Splits a chunked NDJSON body back into frames.
struct FrameReader {
    chunks: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: Vec<u8>,
    qualifier: String,
    address: Address,
    done: bool,
}

impl FrameReader {
    async fn next_item(&mut self) -> Option<MeshResult<Value>> {
        if self.done {
            return None;
        }

        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                return self.decode(&line);
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return self.fail(MeshError::Transport(e.to_string())),
                None => {
                    return self.fail(MeshError::Transport(format!(
                        "stream from {} ended without completion",
                        self.address
                    )));
                }
            }
        }
    }

    fn decode(&mut self, line: &[u8]) -> Option<MeshResult<Value>> {
        match serde_json::from_slice::<StreamFrame>(line) {
            Ok(StreamFrame::Next { data }) => Some(Ok(data)),
            Ok(StreamFrame::Error { message }) => self.fail(MeshError::RemoteInvocation {
                qualifier: self.qualifier.clone(),
                message,
            }),
            Ok(StreamFrame::Complete) => {
                self.done = true;
                None
            }
            Err(e) => self.fail(MeshError::Transport(format!("malformed frame: {}", e))),
        }
    }

    fn fail(&mut self, error: MeshError) -> Option<MeshResult<Value>> {
        self.done = true;
        Some(Err(error))
    }
}
