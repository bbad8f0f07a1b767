//! Local Service Registry
//!
//! Maps qualifiers ("greet/hello") of the services hosted by this node to the closures
//! implementing them. Calls resolved here never leave the process and are never serialized.

use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;

use super::types::{AsyncModel, Endpoint, Message, MethodHandler, Service};
use crate::error::{MeshError, MeshResult};
use crate::membership::types::Address;
use crate::routing::dispatcher::ResponseStream;

struct LocalMethod {
    handler: MethodHandler,
    endpoint: Option<Endpoint>,
}

/// Registry holding the handlers of every locally hosted method.
#[derive(Default)]
pub struct LocalRegistry {
    methods: DashMap<String, LocalMethod>,
}

impl LocalRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers every method of every service.
    ///
    /// A qualifier that is already registered is overwritten (last writer wins).
    /// Endpoints are only derived when the node has an address to publish them under.
    pub fn add(&self, services: &[Service], address: Option<&Address>) {
        for service in services {
            let definition = service.definition();

            for (method_name, handler) in service.handlers() {
                let qualifier = definition.qualifier(method_name);
                let endpoint = address.map(|address| Endpoint {
                    qualifier: qualifier.clone(),
                    service_name: definition.service_name.clone(),
                    method_name: method_name.clone(),
                    async_model: handler.async_model(),
                    address: address.clone(),
                });

                let previous = self.methods.insert(
                    qualifier.clone(),
                    LocalMethod {
                        handler: handler.clone(),
                        endpoint,
                    },
                );

                if previous.is_some() {
                    tracing::warn!("Local handler for '{}' overwritten", qualifier);
                } else {
                    tracing::info!("Registered local handler: {}", qualifier);
                }
            }
        }
    }

    pub fn has(&self, qualifier: &str) -> bool {
        self.methods.contains_key(qualifier)
    }

    pub fn async_model(&self, qualifier: &str) -> Option<AsyncModel> {
        self.methods
            .get(qualifier)
            .map(|method| method.handler.async_model())
    }

    pub fn endpoint(&self, qualifier: &str) -> Option<Endpoint> {
        self.methods
            .get(qualifier)
            .and_then(|method| method.endpoint.clone())
    }

    pub fn qualifiers(&self) -> Vec<String> {
        let mut qualifiers: Vec<String> = self
            .methods
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        qualifiers.sort();
        qualifiers
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn handler(&self, qualifier: &str) -> MeshResult<MethodHandler> {
        // Clone the handler out so no map guard is held while it runs.
        self.methods
            .get(qualifier)
            .map(|method| method.handler.clone())
            .ok_or_else(|| MeshError::no_route(qualifier))
    }

    /// Runs a request-response handler in-process.
    pub async fn invoke_response(&self, message: Message) -> MeshResult<serde_json::Value> {
        match self.handler(&message.qualifier)? {
            MethodHandler::RequestResponse(handler) => {
                tracing::debug!("Invoking local handler '{}'", message.qualifier);
                let qualifier = message.qualifier;
                handler(message.data)
                    .await
                    .map_err(|e| MeshError::invocation(&qualifier, e))
            }
            MethodHandler::RequestStream(_) => Err(MeshError::AsyncModelMismatch {
                qualifier: message.qualifier,
                expected: AsyncModel::RequestResponse,
                actual: AsyncModel::RequestStream,
            }),
        }
    }

    /// Starts a request-stream handler in-process.
    pub fn invoke_stream(&self, message: Message) -> MeshResult<ResponseStream> {
        match self.handler(&message.qualifier)? {
            MethodHandler::RequestStream(handler) => {
                tracing::debug!("Invoking local stream handler '{}'", message.qualifier);
                let qualifier = message.qualifier;
                Ok(handler(message.data)
                    .map(move |item| item.map_err(|e| MeshError::invocation(&qualifier, e)))
                    .boxed())
            }
            MethodHandler::RequestResponse(_) => Err(MeshError::AsyncModelMismatch {
                qualifier: message.qualifier,
                expected: AsyncModel::RequestStream,
                actual: AsyncModel::RequestResponse,
            }),
        }
    }
}
