//! Client-facing HTTP proxy handling.
//!
//! Two shapes are accepted: `CONNECT host:port` for opaque tunneling, and
//! absolute-form requests (`GET http://host/path`) which are rewritten to
//! origin-form and forwarded through the remote. Origin-form requests fall
//! back to the Host header for the target.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::tunnel::{self, Target};
use crate::pool::{Lease, PoolManager, TunnelOutcome};

const MAX_REQUEST_HEAD: usize = 32 * 1024;

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Drive one HTTP proxy client connection through the bound remote.
pub(crate) async fn handle(
    mut client: TcpStream,
    lease: &Lease,
    pool: &PoolManager,
) -> TunnelOutcome {
    let (head, leftover) = match read_request_head(&mut client).await {
        Ok(Some(parts)) => parts,
        _ => return TunnelOutcome::ClientFailed,
    };

    let Some(request) = plan_request(&head) else {
        let _ = client.write_all(RESPONSE_BAD_REQUEST).await;
        return TunnelOutcome::ClientFailed;
    };

    debug!(target = %request.target, remote = %lease.remote, connect = request.is_connect, "http request");

    let mut remote_stream = match tunnel::open(&lease.remote, &request.target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target = %request.target, error = %e, "remote leg failed");
            let _ = client.write_all(RESPONSE_BAD_GATEWAY).await;
            return TunnelOutcome::RemoteFailed;
        }
    };

    // Forward whatever belongs on the wire before splicing: for CONNECT
    // that is only pipelined client bytes, for plain requests the rewritten
    // head as well.
    let pre_splice = async {
        if let Some(forward) = &request.forward {
            remote_stream.write_all(forward).await?;
        }
        if !leftover.is_empty() {
            remote_stream.write_all(&leftover).await?;
        }
        if request.is_connect {
            client.write_all(RESPONSE_ESTABLISHED).await?;
        }
        std::io::Result::Ok(())
    };
    if pre_splice.await.is_err() {
        return TunnelOutcome::ClientFailed;
    }

    pool.stats()
        .tunnels_opened
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    tunnel::splice(client, remote_stream, pool.stats()).await
}

struct PlannedRequest {
    target: Target,
    /// Bytes to send to the remote before splicing (None for CONNECT).
    forward: Option<Vec<u8>>,
    is_connect: bool,
}

/// Decide where the request goes and what to forward.
fn plan_request(head: &[u8]) -> Option<PlannedRequest> {
    let head_str = std::str::from_utf8(head).ok()?;
    let (request_line, rest) = head_str.split_once("\r\n")?;

    let mut parts = request_line.splitn(3, ' ');
    let method = parts.next()?;
    let uri = parts.next()?;
    let version = parts.next()?;

    if method == "CONNECT" {
        let (host, port) = split_host_port(uri, 443)?;
        return Some(PlannedRequest {
            target: Target::new(&host, port),
            forward: None,
            is_connect: true,
        });
    }

    if let Some(stripped) = uri.strip_prefix("http://") {
        // Absolute form: rewrite the request line to origin-form.
        let (authority, path) = match stripped.find('/') {
            Some(idx) => (&stripped[..idx], &stripped[idx..]),
            None => (stripped, "/"),
        };
        let (host, port) = split_host_port(authority, 80)?;
        let mut forward = format!("{method} {path} {version}\r\n").into_bytes();
        forward.extend_from_slice(rest.as_bytes());
        return Some(PlannedRequest {
            target: Target::new(&host, port),
            forward: Some(forward),
            is_connect: false,
        });
    }

    // Origin form: the Host header names the target, bytes pass unchanged.
    let (host, port) = split_host_port(host_header(rest)?, 80)?;
    Some(PlannedRequest {
        target: Target::new(&host, port),
        forward: Some(head.to_vec()),
        is_connect: false,
    })
}

fn host_header(headers: &str) -> Option<&str> {
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("host").then(|| value.trim())
    })
}

/// Split `host[:port]` / `[v6][:port]`, applying the scheme default.
fn split_host_port(s: &str, default_port: u16) -> Option<(String, u16)> {
    if s.is_empty() {
        return None;
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        return match after.strip_prefix(':') {
            Some(port) => Some((host.to_string(), port.parse().ok()?)),
            None if after.is_empty() => Some((host.to_string(), default_port)),
            _ => None,
        };
    }
    match s.rsplit_once(':') {
        // More than one colon means a bare IPv6 literal, no port attached.
        Some((host, _)) if host.contains(':') => Some((s.to_string(), default_port)),
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((s.to_string(), default_port)),
    }
}

/// Read until the end of the request head. Returns the head (terminator
/// included) and any body bytes already received.
async fn read_request_head(
    client: &mut TcpStream,
) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = buf
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        {
            let leftover = buf.split_off(pos + 4);
            return Ok(Some((buf, leftover)));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Ok(None);
        }
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
