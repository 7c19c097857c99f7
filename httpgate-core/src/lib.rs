//! Shared low-level building blocks used by the gateway binary and by
//! `httpgate-lb`: a prelude of common imports, a generic object pool for
//! per-request scratch state, and the metrics recorder traits the rest of
//! the workspace builds on.

pub mod metrics;
pub mod pool;
pub mod prelude;

pub use pool::Pool;
