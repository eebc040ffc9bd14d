//! Dual-protocol listener: one accept loop per local port.
//!
//! Every accepted connection is first attached to the port's current
//! binding (or rejected outright), then classified by peeking at its first
//! bytes and dispatched to the SOCKS5 or HTTP handler. The peeked bytes are
//! left in the socket for the handler to consume.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, Instrument};

use super::{http, socks5};
use crate::pool::{PoolManager, TunnelOutcome};

/// Local address every proxy port binds to.
pub const LISTEN_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// How long a fresh connection gets to reveal its protocol.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// First-byte classification of an incoming client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientProtocol {
    Socks5,
    Http,
    /// SOCKS4 is recognized only to be rejected.
    Socks4,
    Unknown,
}

/// A bound proxy port with its accept loop not yet running.
pub struct ProxyListener {
    listener: TcpListener,
    port: u16,
    pool: Arc<PoolManager>,
    shutdown: watch::Receiver<bool>,
}

impl ProxyListener {
    /// Bind the whole contiguous port range. Any single failure aborts
    /// startup: a partially-bound pool would silently shrink capacity.
    pub async fn bind_range(
        port_base: u16,
        port_count: u16,
        pool: Arc<PoolManager>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Vec<ProxyListener>> {
        let mut listeners = Vec::with_capacity(port_count as usize);
        for offset in 0..port_count {
            let port = port_base + offset;
            let addr = SocketAddr::new(LISTEN_ADDR, port);
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                io::Error::new(e.kind(), format!("failed to bind {addr}: {e}"))
            })?;
            listeners.push(ProxyListener {
                listener,
                port,
                pool: Arc::clone(&pool),
                shutdown: shutdown.clone(),
            });
        }
        info!(
            port_base,
            port_count, "proxy listeners bound"
        );
        Ok(listeners)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!(port = self.port, "listener stopping");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let port = self.port;
                            tokio::spawn(
                                async move {
                                    handle_connection(stream, port, pool).await;
                                }
                                .instrument(tracing::debug_span!("client", port, peer = %peer_addr)),
                            );
                        }
                        Err(e) => {
                            error!(port = self.port, error = %e, "accept error");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, port: u16, pool: Arc<PoolManager>) {
    // One-shot gate: without a live claim the connection is dropped before
    // any bytes are read.
    let Some(lease) = pool.claim_connection(port) else {
        trace!("no claimable binding, rejecting connection");
        return;
    };

    let outcome = match sniff(&stream).await {
        Ok(ClientProtocol::Socks5) => socks5::handle(stream, &lease, &pool).await,
        Ok(ClientProtocol::Http) => http::handle(stream, &lease, &pool).await,
        Ok(ClientProtocol::Socks4) => {
            debug!("rejecting SOCKS4 client");
            TunnelOutcome::ClientFailed
        }
        Ok(ClientProtocol::Unknown) => {
            debug!("unrecognized client protocol");
            TunnelOutcome::ClientFailed
        }
        Err(e) => {
            debug!(error = %e, "sniff failed");
            TunnelOutcome::ClientFailed
        }
    };

    pool.complete(lease.port, lease.generation, outcome);
}

/// Peek up to 3 bytes without consuming them and classify the protocol.
async fn sniff(stream: &TcpStream) -> io::Result<ClientProtocol> {
    let mut buf = [0u8; 3];
    let deadline = tokio::time::Instant::now() + SNIFF_TIMEOUT;
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Ok(ClientProtocol::Unknown),
        };
        if n == 0 {
            return Ok(ClientProtocol::Unknown);
        }
        match classify(&buf[..n]) {
            Some(protocol) => return Ok(protocol),
            // Partial HTTP method prefix; give the client a moment to send
            // the rest instead of spinning on peek.
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

const METHOD_PREFIXES: [&[u8; 3]; 8] = [
    b"CON", b"GET", b"POS", b"PUT", b"DEL", b"HEA", b"OPT", b"PAT",
];

/// Classify from the first bytes; `None` means undecidable yet.
pub(crate) fn classify(prefix: &[u8]) -> Option<ClientProtocol> {
    match prefix.first()? {
        0x05 => return Some(ClientProtocol::Socks5),
        0x04 => return Some(ClientProtocol::Socks4),
        b if !b.is_ascii_uppercase() => return Some(ClientProtocol::Unknown),
        _ => {}
    }
    if prefix.len() < 3 {
        return METHOD_PREFIXES
            .iter()
            .all(|m| !m.starts_with(prefix))
            .then_some(ClientProtocol::Unknown);
    }
    if METHOD_PREFIXES.iter().any(|m| prefix[..3] == m[..]) {
        Some(ClientProtocol::Http)
    } else {
        Some(ClientProtocol::Unknown)
    }
}
