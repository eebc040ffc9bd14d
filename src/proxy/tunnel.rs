//! Tunnel engine: remote-side handshake translation and the splice loop.
//!
//! The local side accepts unauthenticated clients; this module speaks the
//! authenticated dialect of the bound remote (SOCKS5 with user/pass
//! sub-negotiation, or HTTP CONNECT with basic auth) and then moves bytes
//! until one side is done.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::pool::{PoolStats, TunnelOutcome};
use crate::registry::{ProxyKind, RemoteProxy};

/// Total budget for remote dial plus handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A tunnel with no bytes in either direction for this long is aborted.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const SPLICE_BUF: usize = 32 * 1024;
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Where the client wants to go. Domain names pass through to the remote
/// untouched; no local resolution happens here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: TargetHost,
    pub port: u16,
}

impl Target {
    /// Classify a textual host. IPv4/IPv6 literals keep their type so the
    /// remote-side SOCKS5 request can use the native ATYP; anything else is
    /// a domain.
    pub fn new(host: &str, port: u16) -> Self {
        let host = if let Ok(v4) = host.parse::<Ipv4Addr>() {
            TargetHost::Ipv4(v4)
        } else if let Ok(v6) = host.parse::<Ipv6Addr>() {
            TargetHost::Ipv6(v6)
        } else {
            TargetHost::Domain(host.to_string())
        };
        Self { host, port }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            TargetHost::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Failure to establish the remote leg. Every variant retires the remote.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("remote dial failed: {0}")]
    Dial(#[from] std::io::Error),
    #[error("remote handshake failed: {0}")]
    Handshake(String),
    #[error("remote handshake timed out")]
    Timeout,
}

/// Dial the remote proxy and ask it to connect to `target`.
pub async fn open(remote: &RemoteProxy, target: &Target) -> Result<TcpStream, TunnelError> {
    timeout(HANDSHAKE_TIMEOUT, open_inner(remote, target))
        .await
        .map_err(|_| TunnelError::Timeout)?
}

async fn open_inner(remote: &RemoteProxy, target: &Target) -> Result<TcpStream, TunnelError> {
    let mut stream = TcpStream::connect((remote.host.as_str(), remote.port)).await?;
    match remote.kind {
        ProxyKind::Socks5 => socks5_handshake(&mut stream, remote, target).await?,
        ProxyKind::Http => http_connect_handshake(&mut stream, remote, target).await?,
    }
    Ok(stream)
}

async fn socks5_handshake(
    stream: &mut TcpStream,
    remote: &RemoteProxy,
    target: &Target,
) -> Result<(), TunnelError> {
    // Always offer no-auth plus user/pass and let the remote pick.
    let has_creds = remote.user.is_some() && remote.pass.is_some();
    stream.write_all(&[0x05, 0x02, 0x00, 0x02]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        return Err(TunnelError::Handshake(format!(
            "remote is not SOCKS5 (version {:#04x})",
            reply[0]
        )));
    }

    match reply[1] {
        0x00 => {}
        0x02 if has_creds => {
            let user = remote.user.as_deref().unwrap_or_default().as_bytes();
            let pass = remote.pass.as_deref().unwrap_or_default().as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(TunnelError::Handshake("credentials too long".into()));
            }
            let mut auth = Vec::with_capacity(3 + user.len() + pass.len());
            auth.push(0x01);
            auth.push(user.len() as u8);
            auth.extend_from_slice(user);
            auth.push(pass.len() as u8);
            auth.extend_from_slice(pass);
            stream.write_all(&auth).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(TunnelError::Handshake(format!(
                    "auth rejected (status {:#04x})",
                    status[1]
                )));
            }
        }
        method => {
            return Err(TunnelError::Handshake(format!(
                "unsupported auth method {method:#04x}"
            )));
        }
    }

    let mut request = vec![0x05, 0x01, 0x00];
    encode_socks5_target(&mut request, target)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(TunnelError::Handshake(format!(
            "connect refused (reply {:#04x})",
            header[1]
        )));
    }

    // Consume the bound address the remote reports; nobody downstream
    // cares about it.
    let addr_len = match header[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        atyp => {
            return Err(TunnelError::Handshake(format!(
                "unknown bind address type {atyp:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

pub(crate) fn encode_socks5_target(buf: &mut Vec<u8>, target: &Target) -> Result<(), TunnelError> {
    match &target.host {
        TargetHost::Ipv4(ip) => {
            buf.push(0x01);
            buf.extend_from_slice(&ip.octets());
        }
        TargetHost::Ipv6(ip) => {
            buf.push(0x04);
            buf.extend_from_slice(&ip.octets());
        }
        TargetHost::Domain(name) => {
            if name.len() > 255 {
                return Err(TunnelError::Handshake("target hostname too long".into()));
            }
            buf.push(0x03);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name.as_bytes());
        }
    }
    buf.extend_from_slice(&target.port.to_be_bytes());
    Ok(())
}

async fn http_connect_handshake(
    stream: &mut TcpStream,
    remote: &RemoteProxy,
    target: &Target,
) -> Result<(), TunnelError> {
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let (Some(user), Some(pass)) = (&remote.user, &remote.pass) {
        let token = BASE64.encode(format!("{user}:{pass}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Byte-wise read so nothing past the response head is consumed; the
    // stream belongs to the tunnel from there on.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TunnelError::Handshake("oversized CONNECT response".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelError::Handshake(
                "remote closed during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let status_line = head
        .split(|&b| b == b'\r')
        .next()
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .unwrap_or_default();
    if !connect_status_is_success(&status_line) {
        return Err(TunnelError::Handshake(format!(
            "CONNECT rejected: {status_line}"
        )));
    }
    Ok(())
}

pub(crate) fn connect_status_is_success(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    let Some(version) = parts.next() else {
        return false;
    };
    if !version.starts_with("HTTP/") {
        return false;
    }
    matches!(parts.next().and_then(|s| s.parse::<u16>().ok()), Some(code) if (200..300).contains(&code))
}

enum HalfEnd {
    /// Clean EOF; the opposite write half was shut down.
    Eof,
    ReadErr,
    WriteErr,
}

/// Bidirectional copy with half-close propagation.
///
/// Returns how the cycle ended for the pool's completion report. Byte
/// counters are updated as data moves, so a snapshot taken mid-tunnel is
/// already accurate.
pub async fn splice(
    mut client: TcpStream,
    mut remote: TcpStream,
    stats: &PoolStats,
) -> TunnelOutcome {
    let started = Instant::now();
    let last_activity = AtomicU64::new(0);

    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let up = copy_half(
        &mut client_read,
        &mut remote_write,
        &stats.bytes_up,
        &last_activity,
        started,
    );
    let down = copy_half(
        &mut remote_read,
        &mut client_write,
        &stats.bytes_down,
        &last_activity,
        started,
    );

    let copied = async { tokio::join!(up, down) };
    tokio::pin!(copied);

    tokio::select! {
        (up_end, down_end) = &mut copied => {
            // A client-side failure before the remote finished incriminates
            // the client; a remote mid-stream failure does not incriminate
            // the remote.
            let client_read_err = matches!(up_end, HalfEnd::ReadErr);
            let client_write_err = matches!(down_end, HalfEnd::WriteErr);
            let remote_finished = matches!(down_end, HalfEnd::Eof);
            if (client_read_err && !remote_finished) || client_write_err {
                TunnelOutcome::ClientFailed
            } else {
                TunnelOutcome::ClientDone
            }
        }
        _ = idle_watchdog(&last_activity, started) => TunnelOutcome::ClientDone,
    }
}

async fn copy_half<R, W>(
    read: &mut R,
    write: &mut W,
    counter: &AtomicU64,
    last_activity: &AtomicU64,
    started: Instant,
) -> HalfEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUF];
    loop {
        match read.read(&mut buf).await {
            Ok(0) => {
                let _ = write.shutdown().await;
                return HalfEnd::Eof;
            }
            Ok(n) => {
                last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if write.write_all(&buf[..n]).await.is_err() {
                    return HalfEnd::WriteErr;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(_) => return HalfEnd::ReadErr,
        }
    }
}

async fn idle_watchdog(last_activity: &AtomicU64, started: Instant) {
    loop {
        let idle = started
            .elapsed()
            .saturating_sub(Duration::from_millis(last_activity.load(Ordering::Relaxed)));
        if idle >= IDLE_TIMEOUT {
            return;
        }
        tokio::time::sleep(IDLE_TIMEOUT - idle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_classifies_literals() {
        assert!(matches!(
            Target::new("192.0.2.7", 80).host,
            TargetHost::Ipv4(_)
        ));
        assert!(matches!(
            Target::new("2001:db8::1", 443).host,
            TargetHost::Ipv6(_)
        ));
        assert!(matches!(
            Target::new("example.com", 80).host,
            TargetHost::Domain(_)
        ));
    }

    #[test]
    fn encodes_domain_target() {
        let mut buf = Vec::new();
        encode_socks5_target(&mut buf, &Target::new("example.com", 80)).unwrap();
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[2..13], b"example.com");
        assert_eq!(&buf[13..], &[0x00, 0x50]);
    }

    #[test]
    fn encodes_ipv4_target() {
        let mut buf = Vec::new();
        encode_socks5_target(&mut buf, &Target::new("10.1.2.3", 443)).unwrap();
        assert_eq!(buf, vec![0x01, 10, 1, 2, 3, 0x01, 0xBB]);
    }

    #[test]
    fn rejects_oversized_hostname() {
        let mut buf = Vec::new();
        let long = "a".repeat(256);
        assert!(encode_socks5_target(&mut buf, &Target::new(&long, 80)).is_err());
    }

    #[test]
    fn connect_status_parsing() {
        assert!(connect_status_is_success("HTTP/1.1 200 Connection Established"));
        assert!(connect_status_is_success("HTTP/1.0 200 OK"));
        assert!(!connect_status_is_success("HTTP/1.1 407 Proxy Authentication Required"));
        assert!(!connect_status_is_success("garbage"));
    }

    #[test]
    fn ipv6_target_formats_bracketed() {
        let target = Target::new("2001:db8::1", 443);
        assert_eq!(target.to_string(), "[2001:db8::1]:443");
    }
}
