//! Client-facing SOCKS5 handling.
//!
//! Local clients connect without authentication; the only supported command
//! is CONNECT. Target addresses pass through to the remote as-is, including
//! domain names (no local DNS).

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::tunnel::{self, Target, TargetHost};
use crate::pool::{Lease, PoolManager, TunnelOutcome};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Drive one SOCKS5 client connection through the bound remote.
pub(crate) async fn handle(
    mut client: TcpStream,
    lease: &Lease,
    pool: &PoolManager,
) -> TunnelOutcome {
    let target = match negotiate(&mut client).await {
        Ok(Some(target)) => target,
        Ok(None) => return TunnelOutcome::ClientFailed,
        Err(_) => return TunnelOutcome::ClientFailed,
    };

    debug!(%target, remote = %lease.remote, "socks5 connect");

    let remote_stream = match tunnel::open(&lease.remote, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%target, error = %e, "remote leg failed");
            let _ = write_reply(&mut client, REPLY_HOST_UNREACHABLE).await;
            return TunnelOutcome::RemoteFailed;
        }
    };

    if write_reply(&mut client, REPLY_SUCCESS).await.is_err() {
        return TunnelOutcome::ClientFailed;
    }

    pool.stats()
        .tunnels_opened
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    tunnel::splice(client, remote_stream, pool.stats()).await
}

/// Method selection plus request parsing. `Ok(None)` means the client was
/// answered with a SOCKS error reply and there is nothing to tunnel.
async fn negotiate(client: &mut TcpStream) -> std::io::Result<Option<Target>> {
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Ok(None);
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;

    // No authentication locally, always.
    client.write_all(&[SOCKS_VERSION, 0x00]).await?;

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Ok(None);
    }
    if header[1] != CMD_CONNECT {
        trace!(cmd = header[1], "unsupported socks5 command");
        write_reply(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            TargetHost::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            TargetHost::Ipv6(Ipv6Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => TargetHost::Domain(name),
                Err(_) => {
                    write_reply(client, REPLY_ATYP_NOT_SUPPORTED).await?;
                    return Ok(None);
                }
            }
        }
        atyp => {
            trace!(atyp, "unsupported socks5 address type");
            write_reply(client, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;

    Ok(Some(Target {
        host,
        port: u16::from_be_bytes(port),
    }))
}

/// Reply with a zeroed IPv4 bind address; clients ignore it for CONNECT.
async fn write_reply(client: &mut TcpStream, code: u8) -> std::io::Result<()> {
    client
        .write_all(&[
            SOCKS_VERSION,
            code,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await
}
