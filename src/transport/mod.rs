//! Transport Seams
//!
//! The dispatcher only needs two capabilities from the network: a client bound to one
//! remote address, and a server that feeds inbound calls into the local registry.
//!
//! ## Implementations
//! - **`local`**: in-process channels; every node on the same [`LocalNetwork`](local::LocalNetwork) can reach the others.
//! - **`http`**: axum server + reqwest client, streams as newline-delimited JSON frames.
//! - **`protocol`**: endpoint paths and DTOs shared by the HTTP server and client.

pub mod http;
pub mod local;
pub mod protocol;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::MeshResult;
use crate::membership::types::Address;
use crate::registry::types::Message;
use crate::routing::dispatcher::{LocalDispatcher, ResponseStream};

/// A connection to one remote node.
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn request_response(&self, message: Message) -> MeshResult<Value>;

    async fn request_stream(&self, message: Message) -> MeshResult<ResponseStream>;
}

#[async_trait]
pub trait TransportClientProvider: Send + Sync {
    /// Connects to `address`, giving up after `timeout`.
    ///
    /// On timeout every channel opened during the attempt is released before
    /// `ConnectionTimeout` is returned.
    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> MeshResult<Arc<dyn TransportClient>>;
}

#[async_trait]
pub trait TransportServerProvider: Send + Sync {
    /// Starts accepting calls for `address`, serving them through `dispatcher`.
    async fn start(&self, address: &Address, dispatcher: LocalDispatcher)
    -> MeshResult<ServerHandle>;
}

/// Client and server halves of one transport.
#[derive(Clone)]
pub struct Transport {
    pub client_provider: Arc<dyn TransportClientProvider>,
    pub server_provider: Arc<dyn TransportServerProvider>,
}

/// A running transport server.
pub struct ServerHandle {
    address: Address,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn new(address: Address, shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            address,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Signals the server loop to stop and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!("Server task for {} ended abnormally: {}", self.address, e);
        }
        tracing::info!("Server on {} stopped", self.address);
    }
}
