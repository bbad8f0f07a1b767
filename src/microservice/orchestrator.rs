use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::options::MicroserviceOptions;
use super::proxy::ServiceProxy;
use crate::discovery::engine::default_discovery;
use crate::discovery::types::{Discovery, DiscoveryEvents, DiscoveryOptions};
use crate::error::{MeshError, MeshResult};
use crate::membership::types::Address;
use crate::registry::local::LocalRegistry;
use crate::registry::remote::RemoteRegistry;
use crate::registry::types::{Member, ServiceDefinition};
use crate::routing::dispatcher::{LocalDispatcher, ServiceCall};
use crate::routing::router::{DefaultRouter, Router};
use crate::transport::{ServerHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroserviceState {
    Running,
    Destroyed,
}

/// Everything a running node owns. Dropped as a whole on `destroy()`.
struct MicroserviceContext {
    local: Arc<LocalRegistry>,
    remote: Arc<RemoteRegistry>,
    transport: Option<Transport>,
    connect_timeout: Duration,
    discovery: Option<Arc<dyn Discovery>>,
    server: Option<ServerHandle>,
    link: Option<JoinHandle<()>>,
}

/// One node of the mesh.
pub struct Microservice {
    address: Option<Address>,
    context: Mutex<Option<MicroserviceContext>>,
}

impl Microservice {
    /// Validates `options` and brings the node up.
    ///
    /// Order: registries, transport server, discovery, then the task feeding discovery
    /// events into the remote registry. A node without an address is client-only: it
    /// starts no server and publishes nothing, but still joins discovery under a
    /// generated identity so it can reach the services of others.
    pub async fn create(options: MicroserviceOptions) -> MeshResult<Self> {
        let (address, seeds) = options.validate()?;
        let identity = address.clone().unwrap_or_else(client_identity);

        let local = LocalRegistry::new();
        local.add(&options.services, address.as_ref());
        let remote = Arc::new(RemoteRegistry::new(Some(identity.clone())));

        let mut server = None;
        let mut items_to_publish = Vec::new();

        if let Some(address) = &address {
            if let Some(transport) = &options.transport {
                let dispatcher = LocalDispatcher::new(local.clone());
                server = Some(transport.server_provider.start(address, dispatcher).await?);
            } else {
                tracing::warn!("{}: no transport configured, remote calls are disabled", address);
            }

            items_to_publish = RemoteRegistry::create_endpoints(&options.services, address);
        }

        let create_discovery = options.discovery.clone().unwrap_or_else(default_discovery);
        let instance = match create_discovery(DiscoveryOptions {
            address: identity.clone(),
            items_to_publish,
            seed_address: seeds,
            cluster: options.cluster.clone(),
        })
        .await
        {
            Ok(instance) => instance,
            Err(e) => {
                tracing::error!("{}: discovery failed to start: {}", identity, e);
                if let Some(server) = server.take() {
                    server.stop().await;
                }
                return Err(e);
            }
        };

        let link = Some(spawn_link(instance.events(), remote.clone(), identity));
        let discovery = Some(instance);

        match &address {
            Some(address) => tracing::info!(
                "Microservice {} running with {} local method(s)",
                address,
                local.len()
            ),
            None => tracing::info!(
                "Microservice running without address ({} local method(s))",
                local.len()
            ),
        }

        Ok(Self {
            address,
            context: Mutex::new(Some(MicroserviceContext {
                local,
                remote,
                transport: options.transport,
                connect_timeout: options.connect_timeout,
                discovery,
                server,
                link,
            })),
        })
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn state(&self) -> MicroserviceState {
        if self.lock().is_some() {
            MicroserviceState::Running
        } else {
            MicroserviceState::Destroyed
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<MicroserviceContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A call handle resolving targets with `router` (the random default when `None`).
    pub fn create_service_call(&self, router: Option<Arc<dyn Router>>) -> MeshResult<ServiceCall> {
        let context = self.lock();
        let context = context.as_ref().ok_or(MeshError::MicroserviceNotExists)?;

        Ok(ServiceCall::new(
            context.local.clone(),
            context.remote.clone(),
            router.unwrap_or_else(|| Arc::new(DefaultRouter)),
            context
                .transport
                .as_ref()
                .map(|transport| transport.client_provider.clone()),
            context.connect_timeout,
        ))
    }

    pub fn create_proxy(
        &self,
        definition: ServiceDefinition,
        router: Option<Arc<dyn Router>>,
    ) -> MeshResult<ServiceProxy> {
        definition.validate()?;
        let service_call = self.create_service_call(router)?;
        Ok(ServiceProxy::new(definition, service_call))
    }

    pub fn create_proxies(
        &self,
        definitions: Vec<ServiceDefinition>,
    ) -> MeshResult<Vec<ServiceProxy>> {
        definitions
            .into_iter()
            .map(|definition| self.create_proxy(definition, None))
            .collect()
    }

    /// Remote members this node currently knows about.
    pub fn members(&self) -> MeshResult<Vec<Member>> {
        let context = self.lock();
        let context = context.as_ref().ok_or(MeshError::MicroserviceNotExists)?;
        Ok(context.remote.members())
    }

    /// Tears the node down: stops feeding the remote registry, leaves the cluster and
    /// stops the server. Calls already dispatched keep their resolved target.
    pub async fn destroy(&self) -> MeshResult<()> {
        let context = self
            .lock()
            .take()
            .ok_or(MeshError::MicroserviceNotExists)?;

        if let Some(link) = context.link {
            link.abort();
        }

        let left = match &context.discovery {
            Some(discovery) => discovery.destroy().await.map(|message| {
                tracing::info!("{}", message);
            }),
            None => Ok(()),
        };

        if let Some(server) = context.server {
            server.stop().await;
        }

        match &self.address {
            Some(address) => tracing::info!("Microservice {} destroyed", address),
            None => tracing::info!("Microservice destroyed"),
        }
        left
    }
}

/// Cluster identity of a node without an address. Unique, never dialed.
fn client_identity() -> Address {
    Address::new(format!("client-{}", Uuid::new_v4().simple()), 1)
}

/// Applies discovery events to the remote registry in the order they arrive.
fn spawn_link(
    mut events: DiscoveryEvents,
    remote: Arc<RemoteRegistry>,
    address: Address,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = events.next().await {
            match next {
                Ok(event) => remote.update(&event),
                Err(e) => {
                    tracing::error!("{}: discovery stream failed: {}", address, e);
                    return;
                }
            }
        }
        tracing::debug!("{}: discovery stream completed", address);
    })
}
