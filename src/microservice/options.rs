use std::time::Duration;

use crate::discovery::types::DiscoveryFactory;
use crate::error::{MeshResult, ValidationError};
use crate::membership::source::ClusterFactory;
use crate::membership::types::Address;
use crate::registry::types::Service;
use crate::routing::dispatcher::DEFAULT_CONNECT_TIMEOUT;
use crate::transport::Transport;

/// Everything a node is built from.
///
/// Addresses are accepted as `"host:port"` strings or as [`Address`] values and parsed
/// when the node is created, so a malformed one surfaces as a [`ValidationError`] there.
#[derive(Clone)]
pub struct MicroserviceOptions {
    pub(crate) address: Option<String>,
    pub(crate) seed_address: Vec<String>,
    pub(crate) services: Vec<Service>,
    pub(crate) cluster: Option<ClusterFactory>,
    pub(crate) discovery: Option<DiscoveryFactory>,
    pub(crate) transport: Option<Transport>,
    pub(crate) connect_timeout: Duration,
}

impl Default for MicroserviceOptions {
    fn default() -> Self {
        Self {
            address: None,
            seed_address: Vec::new(),
            services: Vec::new(),
            cluster: None,
            discovery: None,
            transport: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl MicroserviceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl ToString) -> Self {
        self.address = Some(address.to_string());
        self
    }

    /// Adds one seed; call repeatedly for several.
    pub fn seed_address(mut self, seed: impl ToString) -> Self {
        self.seed_address.push(seed.to_string());
        self
    }

    pub fn service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn services(mut self, services: impl IntoIterator<Item = Service>) -> Self {
        self.services.extend(services);
        self
    }

    pub fn cluster(mut self, cluster: ClusterFactory) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replaces the built-in discovery engine.
    pub fn discovery(mut self, discovery: DiscoveryFactory) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Parses and checks the addresses and service definitions.
    ///
    /// Returns the node's own address (if any) and its seeds.
    pub(crate) fn validate(&self) -> MeshResult<(Option<Address>, Vec<Address>)> {
        let address = self
            .address
            .as_deref()
            .map(str::parse::<Address>)
            .transpose()?;

        let mut seeds = Vec::with_capacity(self.seed_address.len());
        for seed in &self.seed_address {
            let seed: Address = seed.parse()?;
            if let Some(address) = &address
                && &seed == address
            {
                return Err(ValidationError::AddressCollision {
                    address: address.clone(),
                    seed,
                }
                .into());
            }
            seeds.push(seed);
        }

        for service in &self.services {
            service.definition().validate()?;
        }

        Ok((address, seeds))
    }
}
