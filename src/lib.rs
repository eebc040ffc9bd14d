pub mod config;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod web;

pub use config::Config;
pub use pool::{
    spawn_workers, Lease, PoolError, PoolManager, PoolStats, RebindRequest, StatsSnapshot,
    TunnelOutcome,
};
pub use proxy::{ProxyListener, Target, TargetHost, LISTEN_ADDR};
pub use registry::{ProxyKind, Registry, RemoteProxy};
