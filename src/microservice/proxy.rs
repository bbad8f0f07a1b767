//! Typed call surface over one [`ServiceDefinition`].

use serde_json::Value;
use std::time::Duration;

use crate::error::{MeshError, MeshResult, ValidationError};
use crate::registry::types::{AsyncModel, Message, ServiceDefinition};
use crate::routing::dispatcher::{ResponseStream, ServiceCall};

/// Calls the methods of one service by name.
///
/// Every call checks the method against the definition before anything is dispatched.
#[derive(Clone)]
pub struct ServiceProxy {
    definition: ServiceDefinition,
    service_call: ServiceCall,
}

impl ServiceProxy {
    pub(crate) fn new(definition: ServiceDefinition, service_call: ServiceCall) -> Self {
        Self {
            definition,
            service_call,
        }
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    fn qualifier_for(&self, method: &str, expected: AsyncModel) -> MeshResult<String> {
        let actual = self.definition.methods.get(method).copied().ok_or_else(|| {
            ValidationError::UnknownMethod {
                service: self.definition.service_name.clone(),
                method: method.to_string(),
            }
        })?;

        let qualifier = self.definition.qualifier(method);
        if actual != expected {
            return Err(MeshError::AsyncModelMismatch {
                qualifier,
                expected,
                actual,
            });
        }
        Ok(qualifier)
    }

    pub async fn request_response(&self, method: &str, data: Value) -> MeshResult<Value> {
        let qualifier = self.qualifier_for(method, AsyncModel::RequestResponse)?;
        self.service_call
            .request_response(Message::new(qualifier, data), false)
            .await
    }

    pub fn request_stream(&self, method: &str, data: Value) -> ResponseStream {
        match self.qualifier_for(method, AsyncModel::RequestStream) {
            Ok(qualifier) => self
                .service_call
                .request_stream(Message::new(qualifier, data), false),
            Err(e) => Box::pin(futures::stream::once(futures::future::ready(Err(e)))),
        }
    }

    /// Waits until every method of the service can be routed, locally or remotely.
    ///
    /// Fails with `NoRoute` for the first unresolvable method if `timeout` elapses first.
    pub async fn ready(&self, timeout: Duration) -> MeshResult<()> {
        let qualifiers = self.definition.qualifiers();
        let mut changes = self.service_call.remote_registry().watch();

        let wait = async {
            loop {
                if qualifiers
                    .iter()
                    .all(|qualifier| self.service_call.is_resolvable(qualifier))
                {
                    return;
                }
                if changes.changed().await.is_err() {
                    // The registry is gone; nothing will ever change again.
                    std::future::pending::<()>().await;
                }
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_ok() {
            return Ok(());
        }

        let Some(missing) = qualifiers
            .iter()
            .find(|qualifier| !self.service_call.is_resolvable(qualifier))
            .cloned()
        else {
            return Ok(());
        };
        tracing::warn!(
            "Service '{}' not ready after {:?}",
            self.definition.service_name,
            timeout
        );
        Err(MeshError::NoRoute { qualifier: missing })
    }
}
