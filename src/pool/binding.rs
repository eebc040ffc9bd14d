//! Binding state machine types.
//!
//! A binding ties one local port to one remote proxy for exactly one
//! use-cycle. The generation counter makes stale references detectable:
//! every handler carries the (port, generation) pair it was issued and the
//! table ignores reports that no longer match.

use thiserror::Error;

use crate::registry::RemoteProxy;

/// Lifecycle state of a port binding.
///
/// `Preparing` and `Draining` are transient; at most one binding per port is
/// ever in `Ready` or `InUse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// A remote has been selected for the port but the binding is not yet
    /// eligible for hand-out. Remote reachability is not required.
    Preparing,
    /// Eligible to be handed out exactly once.
    Ready,
    /// Handed out or claimed by a client connection; no further hand-out on
    /// this generation.
    InUse,
    /// The use-cycle finished; the generation is about to advance.
    Draining,
}

/// How a tunnel ended, reported back to the pool on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// The client finished normally (or the remote closed mid-stream, which
    /// does not incriminate the remote).
    ClientDone,
    /// The remote-side dial or handshake failed; the remote is retired.
    RemoteFailed,
    /// The client socket errored before the remote reached EOF.
    ClientFailed,
}

/// Errors surfaced by the binding table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Every port is consumed or draining; callers should back off and
    /// retry.
    #[error("no ready port available")]
    NoReady,
    /// The pool is shutting down.
    #[error("pool is shutting down")]
    Shutdown,
}

/// A claim on one (port, generation) use-cycle.
///
/// Issued by [`reserve_ready_port`](super::PoolManager::reserve_ready_port)
/// and [`claim_connection`](super::PoolManager::claim_connection). The
/// holder must eventually report the cycle's outcome via
/// [`complete`](super::PoolManager::complete).
#[derive(Debug, Clone)]
pub struct Lease {
    pub port: u16,
    pub generation: u64,
    pub remote: RemoteProxy,
}

/// One entry of the binding table.
#[derive(Debug)]
pub(crate) struct Binding {
    /// Remote registry index backing this port.
    pub remote: usize,
    pub state: BindingState,
    pub generation: u64,
    /// Whether a client connection has attached to this generation. An
    /// InUse binding accepts exactly one attachment.
    pub attached: bool,
}
