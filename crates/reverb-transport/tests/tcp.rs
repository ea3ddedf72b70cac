//! Integration tests for the TCP transport.
//!
//! These spin up a real listener on `127.0.0.1:0` and talk to it with
//! both the crate's own `connect` and a raw `TcpStream`, so bytes really
//! cross a socket.

use std::time::Duration;

use reverb_transport::{ConnectionLimits, Role, TcpTransport, TransportError, connect};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn bound() -> (TcpTransport, String) {
    bound_with(ConnectionLimits::default()).await
}

async fn bound_with(limits: ConnectionLimits) -> (TcpTransport, String) {
    let transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind")
        .with_limits(limits);
    let addr = transport.local_addr().expect("local addr").to_string();
    (transport, addr)
}

/// A frame big enough that a few of them overflow the socket buffers of
/// a peer that never reads.
fn big_frame() -> Vec<u8> {
    vec![7u8; 1 << 20]
}

#[tokio::test]
async fn test_accept_and_exchange_bytes_both_ways() {
    let (transport, addr) = bound().await;

    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let (client, mut client_reader) = connect(&addr).await.expect("connect");
    let (server, mut server_reader) = accept.await.unwrap();

    assert_eq!(server.role(), Role::Accepted);
    assert_eq!(client.role(), Role::Outbound);
    assert_ne!(server.id(), client.id());

    server.send(b"hello from server".to_vec()).unwrap();
    let mut buf = vec![0u8; 64];
    let mut got = Vec::new();
    while got.len() < 17 {
        let n = client_reader.read(&mut buf).await.unwrap();
        assert!(n > 0, "unexpected EOF");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"hello from server");

    client.send(b"hi".to_vec()).unwrap();
    let mut got = Vec::new();
    while got.len() < 2 {
        let n = server_reader.read(&mut buf).await.unwrap();
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"hi");
}

#[tokio::test]
async fn test_frames_are_written_in_queue_order() {
    let (transport, addr) = bound().await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let mut raw = TcpStream::connect(&addr).await.unwrap();
    let (server, _reader) = accept.await.unwrap();

    for i in 0..100u8 {
        server.send(vec![i; 3]).unwrap();
    }
    server.close_and_flush().await;

    let mut received = Vec::new();
    raw.read_to_end(&mut received).await.unwrap();
    let expected: Vec<u8> = (0..100u8).flat_map(|i| [i, i, i]).collect();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_read_returns_zero_when_peer_closes() {
    let (transport, addr) = bound().await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let raw = TcpStream::connect(&addr).await.unwrap();
    let (_server, mut reader) = accept.await.unwrap();

    drop(raw);

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), reader.read(&mut buf))
        .await
        .expect("read should not hang")
        .expect("clean close is not an error");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_local_close_unblocks_reader() {
    let (transport, addr) = bound().await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    // Keep the raw client open: the reader must return because of the
    // local close, not because of an EOF.
    let _raw = TcpStream::connect(&addr).await.unwrap();
    let (server, mut reader) = accept.await.unwrap();

    let read = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        reader.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.close());

    let n = timeout(Duration::from_secs(2), read)
        .await
        .expect("reader should be released")
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_rejects_sends() {
    let (transport, addr) = bound().await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let _raw = TcpStream::connect(&addr).await.unwrap();
    let (server, _reader) = accept.await.unwrap();

    assert!(server.is_alive());
    assert!(server.close());
    assert!(!server.close());
    assert!(!server.close_and_flush().await);
    assert!(!server.is_alive());

    let err = server.send(b"late".to_vec()).unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_closed_resolves_after_peer_reset_and_failed_write() {
    let (transport, addr) = bound().await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let mut raw = TcpStream::connect(&addr).await.unwrap();
    let (server, _reader) = accept.await.unwrap();

    raw.shutdown().await.unwrap();
    drop(raw);

    // Keep writing until the writer task notices the dead peer.
    let watcher = server.clone();
    let closed = tokio::spawn(async move { watcher.closed().await });
    for _ in 0..200 {
        if server.send(vec![0u8; 1024]).is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    timeout(Duration::from_secs(5), closed)
        .await
        .expect("connection should be judged dead")
        .unwrap();
    assert!(!server.is_alive());
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let (transport, addr) = bound().await;
    drop(transport);

    let err = connect(&addr).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed { .. }));
}

// =========================================================================
// Slow peers
// =========================================================================

#[tokio::test]
async fn test_send_with_full_queue_fails_connection() {
    let limits = ConnectionLimits {
        max_queued_frames: 2,
        write_timeout: Duration::from_secs(60),
        ..ConnectionLimits::default()
    };
    let (transport, addr) = bound_with(limits).await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    // Never reads.
    let _raw = TcpStream::connect(&addr).await.unwrap();
    let (server, _reader) = accept.await.unwrap();

    let mut result = Ok(());
    for _ in 0..256 {
        result = server.send(big_frame());
        if result.is_err() {
            break;
        }
    }

    let err = result.expect_err("queue should overflow");
    assert!(matches!(err, TransportError::SendFailed(_)), "got {err:?}");
    assert!(!server.is_alive());
    assert!(server.failure().unwrap().contains("queue full"));

    let err = server.send(b"late".to_vec()).unwrap_err();
    assert!(matches!(err, TransportError::SendFailed(_)));
    assert!(!server.close(), "a failed connection is already down");
}

#[tokio::test]
async fn test_write_timeout_fails_connection() {
    let limits = ConnectionLimits {
        write_timeout: Duration::from_millis(200),
        ..ConnectionLimits::default()
    };
    let (transport, addr) = bound_with(limits).await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let _raw = TcpStream::connect(&addr).await.unwrap();
    let (server, mut reader) = accept.await.unwrap();

    for _ in 0..64 {
        if server.send(big_frame()).is_err() {
            break;
        }
    }

    timeout(Duration::from_secs(5), server.closed())
        .await
        .expect("stalled writer should be detected");
    assert!(server.failure().unwrap().contains("timed out"));

    // The read side is released too.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), reader.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_close_and_flush_gives_up_on_peer_that_never_reads() {
    let limits = ConnectionLimits {
        write_timeout: Duration::from_secs(60),
        flush_timeout: Duration::from_millis(200),
        ..ConnectionLimits::default()
    };
    let (transport, addr) = bound_with(limits).await;
    let accept = tokio::spawn(async move { transport.accept().await.expect("accept") });
    let _raw = TcpStream::connect(&addr).await.unwrap();
    let (server, _reader) = accept.await.unwrap();

    for _ in 0..64 {
        server.send(big_frame()).unwrap();
    }

    let closed = timeout(Duration::from_secs(5), server.close_and_flush())
        .await
        .expect("flush should be bounded");
    assert!(closed);
    assert!(!server.is_alive());
    assert!(server.failure().is_none(), "an explicit close is not a failure");
}
