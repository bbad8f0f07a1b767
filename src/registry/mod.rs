//! Service Registries
//!
//! Two catalogs answer the question "who can serve qualifier Q?":
//!
//! - **`local`**: handlers of the services this node hosts, created once at startup.
//! - **`remote`**: endpoints advertised by other nodes, kept in sync by discovery events.
//! - **`types`**: endpoints, service definitions, messages and the handler types services are built from.

pub mod local;
pub mod remote;
pub mod types;
