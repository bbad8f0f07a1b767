//! Membership & Discovery Sources
//!
//! Supplies the raw cluster view the discovery engine reconciles. Nothing in here knows
//! about registries or routing; a source only reports who is in the cluster and which
//! endpoints each member advertises.
//!
//! ## Implementations
//! - **`local`**: An in-process hub. Every member sees every other member immediately.
//! - **`service`**: A UDP gossip protocol (inspired by SWIM) with "Suspect" -> "Dead"
//!   failure detection and incarnation numbers to resolve disputed node states.
//!
//! ## Contract
//! - **`source`**: The [`MembershipSource`](source::MembershipSource) trait and the factory
//!   type the discovery engine uses to join a cluster.

pub mod local;
pub mod service;
pub mod source;
pub mod types;

#[cfg(test)]
mod tests;
