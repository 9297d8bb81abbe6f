//! Session behavior over live sockets: reply routing and the close sentinel.

use applog::{Command, StrategyKind};
use kv_node::config::StoreConfig;
use kv_node::server::{self, Server};
use kv_node::store::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

fn encoded_set(key: &str, value: &str, udp_port: &str) -> Vec<u8> {
    let mut cmd = Command::set(key, value.as_bytes().to_vec());
    cmd.ip = udp_port.to_string();
    let mut line = applog::codec::encode_command(&cmd);
    line.push(b'\n');
    line
}

/// A bootstrapped single-node leader serving clients on an ephemeral port.
async fn boot_node(id: &str) -> (Arc<Store>, Arc<Server>, SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let config = StoreConfig {
        node_id: id.to_string(),
        strategy: StrategyKind::InmemTrad,
        ..Default::default()
    };
    let store = Store::new(config, cancel.clone()).await.unwrap();
    store.start_consensus(true, "127.0.0.1:0").await.unwrap();
    store
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();

    let server = Server::new(store.clone(), cancel.clone()).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve_clients(
        listener,
        server.clone(),
        cancel.clone(),
    ));

    (store, server, addr, cancel)
}

/// Send a SET and await its acknowledgement datagram on `udp`.
async fn set_and_await_ack(addr: SocketAddr, udp: &UdpSocket, key: &str, value: &str) -> String {
    let port = udp.local_addr().unwrap().port().to_string();
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&encoded_set(key, value, &port)).await.unwrap();

    let mut buf = [0u8; 128];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
        .await
        .expect("no reply datagram arrived")
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[tokio::test(flavor = "multi_thread")]
async fn set_reply_routes_to_the_declared_udp_port() {
    let (store, _server, addr, cancel) = boot_node("udp-node0").await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = set_and_await_ack(addr, &udp, "k", "v").await;

    assert_eq!(reply, "OK: ack\n");
    assert_eq!(store.test_get("k"), Some(b"v".to_vec()));

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn close_sentinel_ends_only_the_sending_session() {
    let (_store, _server, addr, cancel) = boot_node("close-node0").await;

    let mut closing = TcpStream::connect(addr).await.unwrap();
    let survivor_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    closing.write_all(b"-CLOSE\n").await.unwrap();

    // The sending session's socket is released promptly.
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), closing.read(&mut buf))
        .await
        .expect("closing session was not released")
        .unwrap();
    assert_eq!(n, 0);

    // Other sessions keep working end to end.
    let reply = set_and_await_ack(addr, &survivor_udp, "still", "alive").await;
    assert_eq!(reply, "OK: ack\n");

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn get_through_consensus_reads_the_map() {
    let (_store, _server, addr, cancel) = boot_node("get-node0").await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply = set_and_await_ack(addr, &udp, "answer", "42").await;
    assert_eq!(reply, "OK: ack\n");

    // A GET proposed through the same path observes the committed write.
    let port = udp.local_addr().unwrap().port().to_string();
    let mut cmd = Command::get("answer");
    cmd.ip = port;
    let mut line = applog::codec::encode_command(&cmd);
    line.push(b'\n');

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(&line).await.unwrap();

    let mut buf = [0u8; 128];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), udp.recv_from(&mut buf))
        .await
        .expect("no reply datagram arrived")
        .unwrap();
    assert_eq!(&buf[..n], b"OK: 42\n");

    cancel.cancel();
}
