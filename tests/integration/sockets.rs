//! Two nodes over the real transport.
//!
//! 127.0.0.1 and 127.0.0.2 both live on the loopback interface, so each
//! node binds its own address on shared ports and "broadcasts" to the
//! other one.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use peerfs_core::config::NetworkConfig;
use peerfs_core::wire::MAX_PAYLOAD;
use peerfs_node::{DiskStore, FileStore, Node, NodeEvent, NodeSettings, Transport};
use tempfile::TempDir;

use crate::*;

const HOST_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const HOST_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

struct SocketNode {
    node: Node,
    downloads: DiskStore,
    _dirs: (TempDir, TempDir),
}

fn config(bind: Ipv4Addr, peer: Ipv4Addr, tcp_port: u16, udp_port: u16) -> NetworkConfig {
    NetworkConfig {
        bind_addr: bind,
        broadcast_addr: peer,
        tcp_port,
        udp_port,
        connect_timeout_ms: 1_000,
        recv_timeout_ms: 1_000,
        ..NetworkConfig::default()
    }
}

fn socket_node(transport: Transport) -> SocketNode {
    let blob_dir = tempfile::tempdir().unwrap();
    let download_dir = tempfile::tempdir().unwrap();
    let blobs = DiskStore::open(blob_dir.path()).unwrap();
    let downloads = DiskStore::open(download_dir.path()).unwrap();
    let node = Node::with_network(
        Arc::new(transport),
        Arc::new(blobs),
        Arc::new(downloads.clone()),
        NodeSettings {
            grace_period: Duration::from_secs(2),
            discard_propagation: Duration::from_millis(50),
            delete_fence: Duration::from_millis(50),
            max_payload: MAX_PAYLOAD,
        },
    );
    SocketNode {
        node,
        downloads,
        _dirs: (blob_dir, download_dir),
    }
}

#[tokio::test]
async fn test_two_nodes_over_loopback() {
    let transport_a = Transport::bind(&config(HOST_A, HOST_B, 0, 0)).unwrap();
    let (tcp_port, udp_port) = (transport_a.tcp_port(), transport_a.udp_port());
    let transport_b = Transport::bind(&config(HOST_B, HOST_A, tcp_port, udp_port)).unwrap();

    let a = socket_node(transport_a);
    let b = socket_node(transport_b);
    assert_eq!(a.node.local_addr(), HOST_A);
    assert_eq!(b.node.local_addr(), HOST_B);

    a.node.start_session().await.unwrap();
    b.node.start_session().await.unwrap();
    eventually("join", || {
        a.node.peers() == vec![HOST_B] && b.node.peers() == vec![HOST_A]
    })
    .await;

    let d = a.node.upload_bytes("wire.txt", b"over real sockets").unwrap();
    assert_eq!(d.holder, HOST_A);
    eventually("announcement", || b.node.network_descriptors() == vec![d.clone()]).await;

    let mut events = b.node.subscribe();
    b.node.get_file("wire.txt").unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("file transfer")
        .unwrap();
    assert_eq!(
        received,
        NodeEvent::FileReceived {
            descriptor: d.clone(),
            verified: true
        }
    );
    assert_eq!(b.downloads.load("wire.txt").unwrap(), b"over real sockets".to_vec());

    a.node.end_session().await.unwrap();
    eventually("hand-over", || {
        let local = b.node.local_descriptors();
        local.len() == 1 && local[0].holder == HOST_B && local[0].valid
    })
    .await;
    eventually("departure", || b.node.peers().is_empty()).await;

    b.node.end_session().await.unwrap();
}
