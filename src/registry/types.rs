use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ValidationError;
use crate::membership::types::Address;

/// How a method answers a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncModel {
    /// Exactly one reply.
    RequestResponse,
    /// An ordered sequence of replies followed by completion.
    RequestStream,
}

impl fmt::Display for AsyncModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncModel::RequestResponse => f.write_str("REQUEST_RESPONSE"),
            AsyncModel::RequestStream => f.write_str("REQUEST_STREAM"),
        }
    }
}

pub fn qualifier(service_name: &str, method_name: &str) -> String {
    format!("{}/{}", service_name, method_name)
}

/// One remotely callable method, owned by the node at `address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub qualifier: String,
    pub service_name: String,
    pub method_name: String,
    pub async_model: AsyncModel,
    pub address: Address,
}

/// The call surface of a service: its name and the async model of every method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub service_name: String,
    pub methods: BTreeMap<String, AsyncModel>,
}

impl ServiceDefinition {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method(mut self, method_name: impl Into<String>, async_model: AsyncModel) -> Self {
        self.methods.insert(method_name.into(), async_model);
        self
    }

    pub fn qualifier(&self, method_name: &str) -> String {
        qualifier(&self.service_name, method_name)
    }

    pub fn qualifiers(&self) -> Vec<String> {
        self.methods
            .keys()
            .map(|method| self.qualifier(method))
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidServiceDefinition(reason);

        if self.service_name.trim().is_empty() {
            return Err(invalid("service name is empty".to_string()));
        }
        if self.service_name.contains('/') {
            return Err(invalid(format!(
                "service name '{}' must not contain '/'",
                self.service_name
            )));
        }
        if self.methods.is_empty() {
            return Err(invalid(format!(
                "service '{}' does not define any method",
                self.service_name
            )));
        }
        if let Some(method) = self
            .methods
            .keys()
            .find(|method| method.trim().is_empty() || method.contains('/'))
        {
            return Err(invalid(format!(
                "service '{}' has an invalid method name '{}'",
                self.service_name, method
            )));
        }

        Ok(())
    }

    /// Derives the endpoints this definition publishes when hosted at `address`.
    pub fn endpoints(&self, address: &Address) -> Vec<Endpoint> {
        self.methods
            .iter()
            .map(|(method, async_model)| Endpoint {
                qualifier: self.qualifier(method),
                service_name: self.service_name.clone(),
                method_name: method.clone(),
                async_model: *async_model,
                address: address.clone(),
            })
            .collect()
    }
}

/// A call addressed to a qualifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub qualifier: String,
    pub data: Value,
}

impl Message {
    pub fn new(qualifier: impl Into<String>, data: Value) -> Self {
        Self {
            qualifier: qualifier.into(),
            data,
        }
    }
}

/// A member as reconstructed from the remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub address: Address,
    pub endpoints: Vec<Endpoint>,
}

pub type ResponseFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Type alias for a thread-safe, asynchronous request-response handler.
pub type ResponseHandlerFn = Arc<dyn Fn(Value) -> ResponseFuture + Send + Sync>;

/// Type alias for a handler producing an ordered stream of replies.
pub type StreamHandlerFn =
    Arc<dyn Fn(Value) -> BoxStream<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub enum MethodHandler {
    RequestResponse(ResponseHandlerFn),
    RequestStream(StreamHandlerFn),
}

impl MethodHandler {
    pub fn async_model(&self) -> AsyncModel {
        match self {
            MethodHandler::RequestResponse(_) => AsyncModel::RequestResponse,
            MethodHandler::RequestStream(_) => AsyncModel::RequestStream,
        }
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandler({})", self.async_model())
    }
}

/// A hosted service: its definition plus the code behind each method.
#[derive(Debug, Clone)]
pub struct Service {
    definition: ServiceDefinition,
    handlers: BTreeMap<String, MethodHandler>,
}

impl Service {
    pub fn builder(service_name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            definition: ServiceDefinition::new(service_name),
            handlers: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn handlers(&self) -> impl Iterator<Item = (&String, &MethodHandler)> {
        self.handlers.iter()
    }
}

pub struct ServiceBuilder {
    definition: ServiceDefinition,
    handlers: BTreeMap<String, MethodHandler>,
}

impl ServiceBuilder {
    pub fn request_response<F, Fut>(mut self, method_name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        // Box::pin type-erases the concrete future so every method fits one map.
        let handler_fn: ResponseHandlerFn =
            Arc::new(move |data: Value| Box::pin(handler(data)) as ResponseFuture);

        self.definition
            .methods
            .insert(method_name.to_string(), AsyncModel::RequestResponse);
        self.handlers.insert(
            method_name.to_string(),
            MethodHandler::RequestResponse(handler_fn),
        );
        self
    }

    pub fn request_stream<F, S>(mut self, method_name: &str, handler: F) -> Self
    where
        F: Fn(Value) -> S + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        let handler_fn: StreamHandlerFn = Arc::new(move |data: Value| handler(data).boxed());

        self.definition
            .methods
            .insert(method_name.to_string(), AsyncModel::RequestStream);
        self.handlers.insert(
            method_name.to_string(),
            MethodHandler::RequestStream(handler_fn),
        );
        self
    }

    pub fn build(self) -> Service {
        Service {
            definition: self.definition,
            handlers: self.handlers,
        }
    }
}
