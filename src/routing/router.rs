//! Target selection strategies.
//!
//! A router only decides; it never performs I/O and never sees the registries themselves.

use dashmap::DashMap;
use rand::Rng;

use crate::registry::types::Endpoint;

/// Where a call will be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(Endpoint),
}

pub trait Router: Send + Sync {
    /// Picks a target for `qualifier`, or `None` if nothing can serve it.
    fn select(
        &self,
        qualifier: &str,
        local_available: bool,
        candidates: &[Endpoint],
    ) -> Option<Target>;
}

/// Local first, otherwise a uniformly random remote candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRouter;

impl Router for DefaultRouter {
    fn select(
        &self,
        _qualifier: &str,
        local_available: bool,
        candidates: &[Endpoint],
    ) -> Option<Target> {
        if local_available {
            return Some(Target::Local);
        }
        if candidates.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..candidates.len());
        Some(Target::Remote(candidates[idx].clone()))
    }
}

/// Local first, otherwise rotates through the remote candidates of each qualifier.
#[derive(Debug, Default)]
pub struct RoundRobinRouter {
    cursors: DashMap<String, usize>,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Router for RoundRobinRouter {
    fn select(
        &self,
        qualifier: &str,
        local_available: bool,
        candidates: &[Endpoint],
    ) -> Option<Target> {
        if local_available {
            return Some(Target::Local);
        }
        if candidates.is_empty() {
            return None;
        }

        let mut cursor = self.cursors.entry(qualifier.to_string()).or_insert(0);
        let idx = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);

        Some(Target::Remote(candidates[idx].clone()))
    }
}
