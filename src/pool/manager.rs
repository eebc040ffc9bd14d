//! Binding table and LRU scheduler.
//!
//! The pool manager owns all mutable pool state behind a single mutex:
//! the per-port bindings, the LRU queue of remote indices, and the
//! known-bad set. Every state transition happens inside the lock; no
//! socket I/O ever does. Rebind work is queued to the rebinder workers
//! so the critical sections stay short.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::binding::{Binding, BindingState, Lease, PoolError, TunnelOutcome};
use super::rebinder::RebindRequest;
use crate::registry::{Registry, RemoteProxy};

/// Process-lifetime counters, updated lock-free by handlers and tunnels.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Acquire calls received, successful or not.
    pub total_requests: AtomicU64,
    /// Acquire calls that returned an endpoint.
    pub handed_out: AtomicU64,
    /// Remote handshakes completed.
    pub tunnels_opened: AtomicU64,
    /// Tunnels that failed at the remote dial/handshake stage.
    pub tunnels_failed_remote: AtomicU64,
    /// Tunnels where the client side failed first.
    pub tunnels_failed_client: AtomicU64,
    /// Bytes copied client -> remote.
    pub bytes_up: AtomicU64,
    /// Bytes copied remote -> client.
    pub bytes_down: AtomicU64,
}

/// Point-in-time view of the pool, served by the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub handed_out: u64,
    pub tunnels_opened: u64,
    pub tunnels_failed_remote: u64,
    pub tunnels_failed_client: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_ready_ports: usize,
    pub known_bad_remotes: usize,
    pub total_remotes: usize,
}

struct PoolState {
    /// Fixed, ordered set of local ports.
    ports: Vec<u16>,
    /// Port -> binding. Absent entry means the port has never been bound.
    bindings: HashMap<u16, Binding>,
    /// Remote indices eligible for the next binding, least-recently-used
    /// first.
    lru: VecDeque<usize>,
    /// Membership set for `lru`.
    queued: HashSet<usize>,
    /// Known-bad remotes, indexed by remote id.
    bad: Vec<bool>,
    bad_count: usize,
    ready_count: usize,
    /// Round-robin cursor for `reserve_ready_port`.
    cursor: usize,
}

/// Owner of the binding table (C3) and LRU scheduler (C4).
pub struct PoolManager {
    registry: Arc<Registry>,
    state: Mutex<PoolState>,
    stats: PoolStats,
    rebind_tx: mpsc::UnboundedSender<RebindRequest>,
    shutting_down: AtomicBool,
}

impl PoolManager {
    pub fn new(
        registry: Arc<Registry>,
        ports: Vec<u16>,
        rebind_tx: mpsc::UnboundedSender<RebindRequest>,
    ) -> Self {
        let lru: VecDeque<usize> = (0..registry.count()).collect();
        let queued: HashSet<usize> = lru.iter().copied().collect();
        let bad = vec![false; registry.count()];

        Self {
            registry,
            state: Mutex::new(PoolState {
                ports,
                bindings: HashMap::new(),
                lru,
                queued,
                bad,
                bad_count: 0,
                ready_count: 0,
                cursor: 0,
            }),
            stats: PoolStats::default(),
            rebind_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Queue initial bindings for up to `min(ports, max_active, remotes)`
    /// ports. The rest stay unbound until remotes free up.
    pub fn warmup(&self, max_active: usize) {
        let ports: Vec<u16> = {
            let state = self.state.lock().unwrap();
            let n = state
                .ports
                .len()
                .min(max_active)
                .min(self.registry.count());
            state.ports[..n].to_vec()
        };

        info!(ports = ports.len(), "warming up pool bindings");
        for port in ports {
            let _ = self.rebind_tx.send(RebindRequest::initial(port));
        }
    }

    /// Hand out a Ready port, atomically consuming its one-shot eligibility.
    pub fn reserve_ready_port(&self) -> Result<Lease, PoolError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(PoolError::Shutdown);
        }

        let mut state = self.state.lock().unwrap();
        let n = state.ports.len();
        for i in 0..n {
            let idx = (state.cursor + i) % n;
            let port = state.ports[idx];
            let hit = match state.bindings.get_mut(&port) {
                Some(b) if b.state == BindingState::Ready => {
                    b.state = BindingState::InUse;
                    Some((b.generation, b.remote))
                }
                _ => None,
            };
            if let Some((generation, remote_idx)) = hit {
                state.ready_count -= 1;
                state.cursor = (idx + 1) % n;
                let remote = self.remote(remote_idx);
                debug!(port, generation, remote = %remote, "reserved port");
                return Ok(Lease {
                    port,
                    generation,
                    remote,
                });
            }
        }
        Err(PoolError::NoReady)
    }

    /// Attach an accepted client connection to the port's current binding.
    ///
    /// A Ready binding is consumed on the spot (direct connection without a
    /// prior reserve); an InUse binding accepts exactly one attachment.
    /// Anything else means the connection must be rejected.
    pub fn claim_connection(&self, port: u16) -> Option<Lease> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        let hit = match state.bindings.get_mut(&port) {
            Some(b) if b.state == BindingState::Ready => {
                b.state = BindingState::InUse;
                b.attached = true;
                Some((b.generation, b.remote, true))
            }
            Some(b) if b.state == BindingState::InUse && !b.attached => {
                b.attached = true;
                Some((b.generation, b.remote, false))
            }
            _ => None,
        };

        let (generation, remote_idx, consumed_ready) = hit?;
        if consumed_ready {
            state.ready_count -= 1;
        }
        drop(state);

        Some(Lease {
            port,
            generation,
            remote: self.remote(remote_idx),
        })
    }

    /// Report the end of a use-cycle and schedule the next binding.
    ///
    /// Stale generations are ignored: a handler that lost the race against
    /// a rebind has nothing left to report.
    pub fn complete(&self, port: u16, generation: u64, outcome: TunnelOutcome) {
        let mut state = self.state.lock().unwrap();

        let remote_idx = match state.bindings.get_mut(&port) {
            Some(b) if b.generation == generation => {
                let eligible = b.state == BindingState::InUse
                    || (b.state == BindingState::Preparing
                        && outcome == TunnelOutcome::RemoteFailed);
                if !eligible {
                    return;
                }
                b.state = BindingState::Draining;
                b.attached = false;
                b.remote
            }
            _ => return,
        };

        match outcome {
            TunnelOutcome::RemoteFailed => {
                self.stats
                    .tunnels_failed_remote
                    .fetch_add(1, Ordering::Relaxed);
                if !state.bad[remote_idx] {
                    state.bad[remote_idx] = true;
                    state.bad_count += 1;
                    warn!(remote = remote_idx, "remote retired after handshake failure");
                }
                if state.queued.remove(&remote_idx) {
                    state.lru.retain(|&i| i != remote_idx);
                }
            }
            TunnelOutcome::ClientFailed => {
                self.stats
                    .tunnels_failed_client
                    .fetch_add(1, Ordering::Relaxed);
                Self::requeue(&mut state, remote_idx);
            }
            TunnelOutcome::ClientDone => {
                Self::requeue(&mut state, remote_idx);
            }
        }
        drop(state);

        debug!(port, generation, ?outcome, "use-cycle complete");
        let _ = self.rebind_tx.send(RebindRequest::initial(port));
    }

    /// Install a fresh binding on the port from the LRU queue head.
    ///
    /// Returns false when no eligible remote exists; the caller retries on a
    /// backoff. Called only from rebinder workers, outside any lock of ours.
    pub fn rebind(&self, port: u16) -> bool {
        if self.shutting_down.load(Ordering::Relaxed) {
            return true;
        }

        // Phase 1: select a remote and install the binding as Preparing.
        let generation = {
            let mut state = self.state.lock().unwrap();

            if let Some(b) = state.bindings.get(&port) {
                if matches!(
                    b.state,
                    BindingState::Preparing | BindingState::Ready | BindingState::InUse
                ) {
                    return true;
                }
            }

            let remote_idx = loop {
                let Some(idx) = state.lru.pop_front() else {
                    return false;
                };
                state.queued.remove(&idx);
                if !state.bad[idx] {
                    break idx;
                }
            };

            let generation = state
                .bindings
                .get(&port)
                .map(|b| b.generation + 1)
                .unwrap_or(1);
            state.bindings.insert(
                port,
                Binding {
                    remote: remote_idx,
                    state: BindingState::Preparing,
                    generation,
                    attached: false,
                },
            );
            generation
        };

        // Phase 2: publish the binding. Nothing to dial here (remote
        // reachability is proven on use, not on bind), so this follows
        // immediately.
        let mut state = self.state.lock().unwrap();
        if let Some(b) = state.bindings.get_mut(&port) {
            if b.generation == generation && b.state == BindingState::Preparing {
                b.state = BindingState::Ready;
                state.ready_count += 1;
                debug!(port, generation, "port rebound");
            }
        }
        true
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (active_ready_ports, known_bad_remotes) = {
            let state = self.state.lock().unwrap();
            (state.ready_count, state.bad_count)
        };

        StatsSnapshot {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            handed_out: self.stats.handed_out.load(Ordering::Relaxed),
            tunnels_opened: self.stats.tunnels_opened.load(Ordering::Relaxed),
            tunnels_failed_remote: self.stats.tunnels_failed_remote.load(Ordering::Relaxed),
            tunnels_failed_client: self.stats.tunnels_failed_client.load(Ordering::Relaxed),
            bytes_up: self.stats.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.stats.bytes_down.load(Ordering::Relaxed),
            active_ready_ports,
            known_bad_remotes,
            total_remotes: self.registry.count(),
        }
    }

    /// Refuse new reservations and claims. In-flight tunnels drain on their
    /// own schedule.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    fn requeue(state: &mut PoolState, remote_idx: usize) {
        if !state.bad[remote_idx] && state.queued.insert(remote_idx) {
            state.lru.push_back(remote_idx);
        }
    }

    fn remote(&self, index: usize) -> RemoteProxy {
        self.registry
            .get(index)
            .expect("binding refers to a remote index outside the registry")
            .clone()
    }
}
