//! Microservice Mesh Library
//!
//! Nodes discover each other, advertise the services they host and route calls across
//! the resulting topology without a central broker. The binary (`main.rs`) runs one node.
//!
//! ## Architecture Modules
//! The control plane is composed of loosely coupled layers, leaves first:
//!
//! - **`membership`**: Cluster membership sources. An in-process hub and a UDP gossip
//!   protocol (SWIM-like) reporting who is in the cluster and what each member advertises.
//! - **`discovery`**: Reconciles raw membership changes into a clean stream of
//!   `Registered` / `Unregistered` / `Idle` events and multicasts it.
//! - **`registry`**: The local registry (handlers hosted here) and the remote registry
//!   (endpoints advertised by others, fed by discovery).
//! - **`routing`**: Pluggable routers and the dispatcher that turns a qualified call into
//!   a local invocation or a forwarded one.
//! - **`transport`**: Client/server seams with in-process and HTTP implementations.
//! - **`microservice`**: The orchestrator that wires everything for one node.
//! - **`config`** / **`error`**: CLI configuration and the shared error taxonomy.

pub mod config;
pub mod discovery;
pub mod error;
pub mod membership;
pub mod microservice;
pub mod registry;
pub mod routing;
pub mod transport;
