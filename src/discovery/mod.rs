//! Discovery Engine
//!
//! Turns the raw, possibly duplicated stream of membership changes into a clean sequence
//! of `Registered` / `Unregistered` / `Idle` events about service endpoints.
//!
//! ## Core Mechanisms
//! - **Reconciliation**: A single task owns the `members state` map (address -> present).
//!   It runs once against a full snapshot, then continuously against live changes, so a
//!   member is never registered twice.
//! - **Multicast**: Every subscriber gets an independent queue. Late subscribers are
//!   replayed the last known event per member and the terminal signal, if any.
//! - **Degraded mode**: Without a membership source the engine completes immediately
//!   instead of failing.

mod broadcast;
pub mod engine;
pub mod types;

#[cfg(test)]
mod tests;
