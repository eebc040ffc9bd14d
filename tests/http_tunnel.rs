//! HTTP client path: CONNECT through an HTTP remote with basic auth,
//! absolute-form rewriting, and gateway failures.


use std::time::Duration;

use harness::{
    dead_remote_addr, http_remote, socks5_remote, wait_for, MockHttpRemote, MockSocks5Remote,
    PoolHandle,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn read_until_blank_line(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = timeout(Duration::from_secs(2), stream.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(n, 0, "connection closed before response head ended");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn connect_via_http_remote_carries_basic_auth() {
    let remote = MockHttpRemote::spawn().await.unwrap();
    let pool = PoolHandle::spawn(vec![http_remote(remote.addr, "u", "p")], 42000, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let response = read_until_blank_line(&mut client).await;
    assert!(
        response.starts_with("HTTP/1.1 200 Connection Established"),
        "got: {response}"
    );

    let request = remote.requests.lock().await[0].clone();
    assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
    // b64("u:p")
    assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));

    // Opaque bytes after the 200 go straight through.
    client.write_all(b"\x01\x02\x03\x04").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, &[0x01, 0x02, 0x03, 0x04]);
}

#[tokio::test]
async fn absolute_form_request_is_rewritten_to_origin_form() {
    let remote = MockSocks5Remote::spawn(false).await.unwrap();
    let pool = PoolHandle::spawn(vec![socks5_remote(remote.addr, "u", "p")], 42010, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client
        .write_all(b"GET http://example.com/api/v1?x=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    // The remote was asked to reach example.com:80 and received the
    // origin-form request.
    wait_for(
        || remote.payload.try_lock().map(|p| !p.is_empty()).unwrap_or(false),
        "forwarded request",
    )
    .await;

    let session = remote.sessions.lock().await[0].clone();
    assert_eq!(session.target, "example.com:80");

    let forwarded = remote.payload.lock().await.clone();
    let forwarded = String::from_utf8(forwarded).unwrap();
    assert!(
        forwarded.starts_with("GET /api/v1?x=2 HTTP/1.1\r\n"),
        "got: {forwarded}"
    );
    assert!(forwarded.contains("Host: example.com\r\n"));
}

#[tokio::test]
async fn unreachable_remote_yields_bad_gateway_and_retires_remote() {
    let dead = dead_remote_addr().await;
    let pool = PoolHandle::spawn(vec![http_remote(dead, "u", "p")], 42020, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "got: {response}");

    wait_for(
        || pool.pool.snapshot().known_bad_remotes == 1,
        "remote retired",
    )
    .await;
    assert_eq!(pool.pool.snapshot().tunnels_failed_remote, 1);
}

#[tokio::test]
async fn request_without_target_is_bad_request() {
    let remote = MockHttpRemote::spawn().await.unwrap();
    let pool = PoolHandle::spawn(vec![http_remote(remote.addr, "u", "p")], 42030, 1).await;
    pool.wait_ready(1).await;

    let mut client = TcpStream::connect(pool.endpoint(0)).await.unwrap();
    client
        .write_all(b"GET /nohost HTTP/1.1\r\nAccept: */*\r\n\r\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 400 Bad Request"), "got: {response}");
}
