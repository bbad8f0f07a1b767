//! Microservice Orchestrator
//!
//! Wires the pieces of one node together and owns their lifetime.
//!
//! ## Lifecycle
//! 1. **Create**: options are validated before anything starts. Registries are built,
//!    the transport server is started and discovery is joined (both only when the node
//!    has an address), then a link task feeds discovery events into the remote registry.
//! 2. **Running**: callers obtain [`ServiceCall`](crate::routing::dispatcher::ServiceCall)
//!    handles and [`ServiceProxy`](proxy::ServiceProxy) objects.
//! 3. **Destroyed**: the context is dropped. Every later API call, including a second
//!    `destroy()`, fails with `MicroserviceNotExists`.

pub mod options;
pub mod orchestrator;
pub mod proxy;

pub use options::MicroserviceOptions;
pub use orchestrator::{Microservice, MicroserviceState};
pub use proxy::ServiceProxy;
