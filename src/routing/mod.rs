//! Routing & Dispatch
//!
//! - **`router`**: pluggable target selection (random and round-robin policies, both local-first).
//! - **`dispatcher`**: the per-call pipeline resolve -> select -> invoke locally or forward.

pub mod dispatcher;
pub mod router;
