//! In-process transport.
//!
//! Servers register an inbound channel on a shared [`LocalNetwork`] under their address.
//! A client connects by sending an `Open` handshake and waiting for the acknowledgement;
//! the handshake is retried until the connect deadline so a server that is still starting
//! can be reached.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::{ServerHandle, Transport, TransportClient, TransportClientProvider, TransportServerProvider};
use crate::error::{MeshError, MeshResult};
use crate::membership::types::Address;
use crate::registry::types::Message;
use crate::routing::dispatcher::{LocalDispatcher, ResponseStream};

const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) enum Inbound {
    Open {
        connection_id: Uuid,
        ack: oneshot::Sender<()>,
    },
    RequestResponse {
        message: Message,
        reply: oneshot::Sender<MeshResult<Value>>,
    },
    RequestStream {
        message: Message,
        sink: mpsc::UnboundedSender<MeshResult<Value>>,
    },
}

/// The shared medium local servers listen on.
#[derive(Default)]
pub struct LocalNetwork {
    listeners: DashMap<Address, mpsc::UnboundedSender<Inbound>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_listening(&self, address: &Address) -> bool {
        self.listeners.contains_key(address)
    }

    pub(crate) fn listen(
        &self,
        address: &Address,
    ) -> MeshResult<mpsc::UnboundedReceiver<Inbound>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.listeners.entry(address.clone()) {
            Entry::Occupied(_) => Err(MeshError::Transport(format!(
                "address {} is already in use",
                address
            ))),
            Entry::Vacant(slot) => {
                slot.insert(sender);
                Ok(receiver)
            }
        }
    }

    fn unlisten(&self, address: &Address) {
        self.listeners.remove(address);
    }

    fn listener(&self, address: &Address) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.listeners.get(address).map(|sender| sender.clone())
    }
}

/// Both halves of the in-process transport, bound to one network.
pub fn local_transport(network: &Arc<LocalNetwork>) -> Transport {
    Transport {
        client_provider: Arc::new(LocalClientProvider {
            network: network.clone(),
        }),
        server_provider: Arc::new(LocalServerProvider {
            network: network.clone(),
        }),
    }
}

pub struct LocalClientProvider {
    network: Arc<LocalNetwork>,
}

impl LocalClientProvider {
    pub fn new(network: Arc<LocalNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl TransportClientProvider for LocalClientProvider {
    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> MeshResult<Arc<dyn TransportClient>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(sender) = self.network.listener(address) {
                let connection_id = Uuid::new_v4();
                let (ack, acked) = oneshot::channel();

                if sender.send(Inbound::Open { connection_id, ack }).is_ok() {
                    let wait = deadline
                        .saturating_duration_since(Instant::now())
                        .min(HANDSHAKE_RETRY_INTERVAL);

                    // An unanswered handshake drops `acked` here, closing its channel.
                    if let Ok(Ok(())) = tokio::time::timeout(wait, acked).await {
                        tracing::debug!("Connected to {} ({})", address, connection_id);
                        return Ok(Arc::new(LocalClient {
                            address: address.clone(),
                            sender,
                        }));
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("Connection to {} timed out after {:?}", address, timeout);
                return Err(MeshError::ConnectionTimeout {
                    address: address.clone(),
                    timeout,
                });
            }

            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(remaining.min(HANDSHAKE_RETRY_INTERVAL)).await;
        }
    }
}

struct LocalClient {
    address: Address,
    sender: mpsc::UnboundedSender<Inbound>,
}

impl LocalClient {
    fn closed(&self) -> MeshError {
        MeshError::Transport(format!("connection to {} closed", self.address))
    }
}

#[async_trait]
impl TransportClient for LocalClient {
    async fn request_response(&self, message: Message) -> MeshResult<Value> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Inbound::RequestResponse { message, reply })
            .map_err(|_| self.closed())?;

        response.await.map_err(|_| self.closed())?
    }

    async fn request_stream(&self, message: Message) -> MeshResult<ResponseStream> {
        let (sink, receiver) = mpsc::unbounded_channel();
        self.sender
            .send(Inbound::RequestStream { message, sink })
            .map_err(|_| self.closed())?;

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }
}

pub struct LocalServerProvider {
    network: Arc<LocalNetwork>,
}

impl LocalServerProvider {
    pub fn new(network: Arc<LocalNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl TransportServerProvider for LocalServerProvider {
    async fn start(
        &self,
        address: &Address,
        dispatcher: LocalDispatcher,
    ) -> MeshResult<ServerHandle> {
        let mut inbound = self.network.listen(address)?;
        let (shutdown, mut stopped) = oneshot::channel::<()>();
        let network = self.network.clone();
        let server_address = address.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    next = inbound.recv() => match next {
                        Some(request) => serve(&dispatcher, request),
                        None => break,
                    },
                }
            }
            network.unlisten(&server_address);
        });

        tracing::info!("Local server listening on {}", address);
        Ok(ServerHandle::new(address.clone(), shutdown, task))
    }
}

fn serve(dispatcher: &LocalDispatcher, request: Inbound) {
    match request {
        Inbound::Open { connection_id, ack } => {
            tracing::debug!("Accepted connection {}", connection_id);
            let _ = ack.send(());
        }
        Inbound::RequestResponse { message, reply } => {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _ = reply.send(dispatcher.request_response(message).await);
            });
        }
        Inbound::RequestStream { message, sink } => {
            let mut replies = dispatcher.request_stream(message);
            tokio::spawn(async move {
                while let Some(item) = replies.next().await {
                    if sink.send(item).is_err() {
                        tracing::debug!("Stream consumer went away");
                        break;
                    }
                }
            });
        }
    }
}
