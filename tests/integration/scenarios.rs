use peerfs_core::MessageKind;
use peerfs_node::{MemoryHub, RequestError};

use crate::*;

/// A node alone on the network keeps its upload and announces it.
#[tokio::test]
async fn test_upload_while_alone() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    hub.clear_log();

    let d = x.node.upload_bytes("a.txt", b"0123456789").unwrap();

    assert_eq!(d.size, 10);
    assert_eq!(d.owner, A);
    assert_eq!(d.holder, A);
    assert!(d.valid);
    assert_eq!(x.node.local_descriptors(), vec![d.clone()]);
    assert_eq!(x.node.network_descriptors(), vec![d.clone()]);
    assert!(x.blobs.contains(&d.content_hash.to_hex()));
    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::NewFile]);

    x.node.end_session().await.unwrap();
}

/// A joining node learns existing files from HELLO_REPLY.
#[tokio::test]
async fn test_join_receives_directory() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let d = x.node.upload_bytes("a.txt", b"0123456789").unwrap();
    hub.clear_log();

    let y = joined(&hub, B).await;

    assert_eq!(hub.kinds_sent_by(B), vec![MessageKind::Hello]);
    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::HelloReply]);
    assert_eq!(y.node.network_descriptors(), vec![d]);
    assert_eq!(y.node.peers(), vec![A]);
    assert_eq!(x.node.peers(), vec![B]);
    assert!(y.node.local_descriptors().is_empty());

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// Only the owner may delete; a refused delete sends nothing.
#[tokio::test]
async fn test_delete_by_non_owner_is_rejected_locally() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = y.node.upload_bytes("a.txt", b"0123456789").unwrap();
    assert_eq!(d.holder, B);
    hub.clear_log();

    let result = x
        .node
        .delete_file_with_hash("a.txt", &d.content_hash.to_hex())
        .await;

    assert!(matches!(result, Err(RequestError::NotOwner { owner, .. }) if owner == B));
    assert!(hub.sent().is_empty());
    assert_eq!(x.node.network_descriptors(), vec![d]);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// Owner deletes a file held elsewhere: discard fence, DELETE_FILE to the
/// holder, REVOKE_FILE from the holder, gone everywhere.
#[tokio::test]
async fn test_owner_deletes_file_held_by_peer() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;

    // The first upload stays on X, which makes Y the lighter node.
    let first = x.node.upload_bytes("first.bin", b"0123456789abcdef").unwrap();
    assert_eq!(first.holder, A);
    let d = x.node.upload_bytes("a.txt", b"0123456789").unwrap();
    assert_eq!(d.holder, B);
    assert_eq!(y.node.local_descriptors(), vec![d.clone()]);
    assert!(x.node.network_descriptors().contains(&d));
    hub.clear_log();

    x.node.delete_file("a.txt").await.unwrap();

    assert_eq!(
        hub.kinds_sent_by(A),
        vec![MessageKind::DiscardDescriptor, MessageKind::DeleteFile]
    );
    assert_eq!(hub.kinds_sent_by(B), vec![MessageKind::RevokeFile]);
    for node in [&x.node, &y.node] {
        assert!(node.network_descriptors().iter().all(|n| n.name != "a.txt"));
    }
    assert!(y.node.local_descriptors().is_empty());
    assert!(!y.blobs.contains(&d.content_hash.to_hex()));
    assert_eq!(x.node.local_descriptors(), vec![first]);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// Owner and holder are the same node: DELETE_FILE goes to itself.
#[tokio::test]
async fn test_owner_deletes_own_held_file() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = x.node.upload_bytes("a.txt", b"0123456789").unwrap();
    assert_eq!(d.holder, A);
    assert_eq!(y.node.network_descriptors(), vec![d.clone()]);
    hub.clear_log();

    x.node
        .delete_file_with_hash("a.txt", &d.content_hash.to_hex())
        .await
        .unwrap();

    assert_eq!(
        hub.kinds_sent_by(A),
        vec![
            MessageKind::DiscardDescriptor,
            MessageKind::DeleteFile,
            MessageKind::RevokeFile
        ]
    );
    assert!(x.node.network_descriptors().is_empty());
    assert!(y.node.network_descriptors().is_empty());
    assert!(x.node.local_descriptors().is_empty());
    assert!(x.blobs.is_empty());

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// A sole node leaving drops its files and still says SHUTDOWN.
#[tokio::test]
async fn test_sole_node_departure_drops_files() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let d = x.node.upload_bytes("a.txt", b"0123456789").unwrap();
    hub.clear_log();

    x.node.end_session().await.unwrap();

    assert_eq!(
        hub.kinds_sent_by(A),
        vec![
            MessageKind::Disconnecting,
            MessageKind::DiscardDescriptor,
            MessageKind::Shutdown
        ]
    );
    assert_eq!(hub.count(MessageKind::HolderChange), 0);
    assert!(x.node.local_descriptors().is_empty());
    assert!(!x.blobs.contains(&d.content_hash.to_hex()));
    assert!(!hub.is_listening(A));
}
