//! Proxy pool state: binding table, LRU scheduling, rotation.
//!
//! ```text
//! acquire ─▶ reserve_ready_port ─▶ InUse ─▶ claim_connection
//!                                              │
//!                                           tunnel
//!                                              │
//!            rebinder ◀── complete(outcome) ◀──┘
//!                │
//!             rebind ─▶ Ready (next generation)
//! ```

mod binding;
mod manager;
mod rebinder;

pub use binding::{BindingState, Lease, PoolError, TunnelOutcome};
pub use manager::{PoolManager, PoolStats, StatsSnapshot};
pub use rebinder::{spawn_workers, RebindRequest, MAX_WORKERS};
