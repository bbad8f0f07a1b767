//! Error Taxonomy
//!
//! Every public operation of the mesh reports failures through [`MeshError`].
//! Startup problems are grouped under [`ValidationError`] and abort node construction;
//! every other variant is scoped to the single call or stream that produced it.

use std::time::Duration;

use thiserror::Error;

use crate::membership::types::Address;
use crate::registry::types::AsyncModel;

pub type MeshResult<T> = Result<T, MeshError>;

/// Malformed configuration detected before any component starts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    #[error("address collision: seed address {seed} is the same as the local address {address}")]
    AddressCollision { address: Address, seed: Address },

    #[error("invalid service definition: {0}")]
    InvalidServiceDefinition(String),

    #[error("service '{service}' has no method '{method}'")]
    UnknownMethod { service: String, method: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("can not find a route for qualifier '{qualifier}'")]
    NoRoute { qualifier: String },

    #[error("invocation of '{qualifier}' failed: {message}")]
    RemoteInvocation { qualifier: String, message: String },

    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectionTimeout { address: Address, timeout: Duration },

    #[error("microservice does not exist (it has been destroyed)")]
    MicroserviceNotExists,

    #[error("'{qualifier}' is a {actual} method but was called as {expected}")]
    AsyncModelMismatch {
        qualifier: String,
        expected: AsyncModel,
        actual: AsyncModel,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl MeshError {
    pub fn no_route(qualifier: &str) -> Self {
        MeshError::NoRoute {
            qualifier: qualifier.to_string(),
        }
    }

    pub fn invocation(qualifier: &str, error: impl std::fmt::Display) -> Self {
        MeshError::RemoteInvocation {
            qualifier: qualifier.to_string(),
            message: error.to_string(),
        }
    }
}
