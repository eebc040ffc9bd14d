//! SOCKS5 client path: handshake translation, rotation after use, and
//! protocol sniffing rejections.


use std::time::Duration;

use harness::{socks5_client_connect, socks5_remote, wait_for, MockSocks5Remote, PoolHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn socks5_domain_tunnel_end_to_end() {
    let remote = MockSocks5Remote::spawn(true).await.unwrap();
    let pool = PoolHandle::spawn(
        vec![socks5_remote(remote.addr, "alice", "secret")],
        41000,
        1,
    )
    .await;
    pool.wait_ready(1).await;

    let mut client = socks5_client_connect(pool.endpoint(0), "example.com", 80).await;

    // The remote saw our credentials and the untouched domain target.
    let session = remote.sessions.lock().await[0].clone();
    assert_eq!(session.auth, Some(("alice".into(), "secret".into())));
    assert_eq!(session.target, "example.com:80");

    // Tunnel transparency: echoed bytes come back bit-for-bit.
    client.write_all(b"ping through the pool").await.unwrap();
    let mut buf = [0u8; 21];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping through the pool");

    drop(client);

    // One remote only: after the cycle completes the port is rebound to the
    // same remote, on a fresh generation.
    pool.wait_ready(1).await;
    let lease = pool.pool.reserve_ready_port().unwrap();
    assert_eq!(lease.port, 41000);
    assert_eq!(lease.generation, 2);
    assert_eq!(lease.remote.id, 0);
}

#[tokio::test]
async fn credential_less_record_uses_stock_auth_on_the_wire() {
    use std::io::Write;

    let remote = MockSocks5Remote::spawn(true).await.unwrap();

    // A two-field record straight through the file loader.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "127.0.0.1 {}", remote.addr.port()).unwrap();
    let registry = portpool::registry::Registry::load(file.path()).unwrap();
    let loaded = registry.get(0).unwrap().clone();
    assert_eq!(loaded.user.as_deref(), Some("1"));
    assert_eq!(loaded.pass.as_deref(), Some("1"));

    let pool = PoolHandle::spawn(vec![loaded], 41060, 1).await;
    pool.wait_ready(1).await;

    let mut client = socks5_client_connect(pool.endpoint(0), "example.com", 80).await;

    let session = remote.sessions.lock().await[0].clone();
    // Greeting always offers no-auth plus user/pass.
    assert_eq!(session.greeting, vec![0x05, 0x02, 0x00, 0x02]);
    assert_eq!(session.auth, Some(("1".into(), "1".into())));
    assert_eq!(session.target, "example.com:80");

    client.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn byte_counters_match_tunneled_payload() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 41010, 1).await;
    pool.wait_ready(1).await;

    let mut client = socks5_client_connect(pool.endpoint(0), "example.com", 80).await;
    client.write_all(&[0xAB; 1000]).await.unwrap();
    let mut buf = vec![0u8; 1000];
    client.read_exact(&mut buf).await.unwrap();
    drop(client);

    wait_for(
        || {
            let snapshot = pool.pool.snapshot();
            snapshot.bytes_up == 1000 && snapshot.bytes_down == 1000
        },
        "byte counters",
    )
    .await;

    let snapshot = pool.pool.snapshot();
    assert_eq!(snapshot.tunnels_opened, 1);
    assert_eq!(snapshot.tunnels_failed_remote, 0);
}

#[tokio::test]
async fn socks4_clients_are_closed_immediately() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 41020, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client
        .write_all(&[0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4, 0x00])
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "SOCKS4 must get a bare close");
    assert_eq!(remote.session_count().await, 0);
}

#[tokio::test]
async fn unsupported_command_gets_command_not_supported() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 41030, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    // CMD=0x02 (BIND) is not supported.
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50])
        .await
        .unwrap();
    let mut response = [0u8; 10];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(response[1], 0x07);
}

#[tokio::test]
async fn unclassifiable_first_bytes_are_closed() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 41040, 1).await;
    pool.wait_ready(1).await;

    // A TLS ClientHello is neither SOCKS nor a known HTTP method.
    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client.write_all(&[0x16, 0x03, 0x01, 0x00]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn connection_without_ready_binding_is_rejected() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 41050, 2).await;
    pool.wait_ready(1).await;

    // Only one remote exists, so the second port has no binding.
    let unbound = pool.pool.snapshot().active_ready_ports;
    assert_eq!(unbound, 1);

    let mut rejected = TcpStream::connect(pool.endpoint(1)).await.unwrap();
    let mut buf = [0u8; 4];
    let n = timeout(Duration::from_secs(2), rejected.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "unbound port must close immediately");
}
