//! Rotation orchestrator: the background rebind worker pool.
//!
//! Rebind requests are queued by the pool manager and drained here so that
//! no binding-table caller ever waits on rebind work. When the LRU queue is
//! empty the request is retried on an exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::manager::PoolManager;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Upper bound on concurrent rebind workers.
pub const MAX_WORKERS: usize = 32;

/// A request to install a fresh binding on a port.
#[derive(Debug, Clone, Copy)]
pub struct RebindRequest {
    pub port: u16,
    /// Delay before attempting; zero for first attempts.
    pub backoff: Duration,
}

impl RebindRequest {
    pub fn initial(port: u16) -> Self {
        Self {
            port,
            backoff: Duration::ZERO,
        }
    }

    fn retry(self) -> Self {
        let backoff = if self.backoff.is_zero() {
            INITIAL_BACKOFF
        } else {
            (self.backoff * 2).min(MAX_BACKOFF)
        };
        Self {
            port: self.port,
            backoff,
        }
    }
}

/// Spawn `min(MAX_WORKERS, port_count)` workers draining the rebind queue.
pub fn spawn_workers(
    pool: Arc<PoolManager>,
    rx: mpsc::UnboundedReceiver<RebindRequest>,
    tx: mpsc::UnboundedSender<RebindRequest>,
    port_count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let workers = MAX_WORKERS.min(port_count.max(1));

    (0..workers)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            request = rx.recv() => match request {
                                Some(request) => request,
                                None => return,
                            },
                        }
                    };

                    if !request.backoff.is_zero() {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(request.backoff) => {}
                        }
                    }

                    if !pool.rebind(request.port) {
                        let retry = request.retry();
                        debug!(
                            port = request.port,
                            backoff_ms = retry.backoff.as_millis() as u64,
                            "no remote available, retrying rebind"
                        );
                        let _ = tx.send(retry);
                    }
                }
            })
        })
        .collect()
}
