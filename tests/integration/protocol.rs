//! Directory rules and request handling driven by hand-built frames.

use std::time::Duration;

use bytes::Bytes;
use peerfs_core::{FileDescriptor, Message, MessageKind};
use peerfs_node::{Destination, FileStore, MemoryHub, NodeEvent, NodeSettings, Phase};

use crate::*;

fn descriptor(name: &str, content: &[u8], time: i64, owner: std::net::Ipv4Addr) -> FileDescriptor {
    FileDescriptor::for_content(name, content, time, owner, owner).unwrap()
}

fn to_a(hub: &MemoryHub, message: Message, from: std::net::Ipv4Addr) {
    assert!(hub.inject(message.encode().unwrap(), from, Destination::Unicast(A)));
}

#[tokio::test]
async fn test_update_for_unknown_file_is_inserted() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let d = descriptor("moved.txt", b"moved", 10, B);

    to_a(&hub, Message::UpdateDescriptor(d.clone()), B);

    assert_eq!(x.node.network_descriptors(), vec![d]);
    assert!(x.node.local_descriptors().is_empty());
    x.node.end_session().await.unwrap();
}

/// A discard that overtakes its update still converges on the update.
#[tokio::test]
async fn test_discard_then_update_converges() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let d = descriptor("moving.txt", b"moving", 10, B);

    to_a(&hub, Message::DiscardDescriptor(d.clone()), B);
    let placeholder = x.node.network_descriptors();
    assert_eq!(placeholder.len(), 1);
    assert!(!placeholder[0].valid);

    let moved = FileDescriptor { holder: C, ..d };
    to_a(&hub, Message::UpdateDescriptor(moved.clone()), C);

    assert_eq!(x.node.network_descriptors(), vec![moved]);
    x.node.end_session().await.unwrap();
}

/// Two nodes see the same colliding announcements in opposite orders and
/// keep the same winner.
#[tokio::test]
async fn test_new_file_collision_resolves_identically() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;

    let first = descriptor("zeta.txt", b"shared bytes", 100, C);
    let second = descriptor("alpha.txt", b"shared bytes", 200, C);

    to_a(&hub, Message::NewFile(first.clone()), C);
    to_a(&hub, Message::NewFile(second.clone()), C);
    hub.inject(Message::NewFile(second).encode().unwrap(), C, Destination::Unicast(B));
    hub.inject(Message::NewFile(first.clone()).encode().unwrap(), C, Destination::Unicast(B));

    assert_eq!(x.node.network_descriptors(), vec![first.clone()]);
    assert_eq!(y.node.network_descriptors(), vec![first]);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let keep = descriptor("keep.txt", b"keep", 1, B);
    let gone = descriptor("gone.txt", b"gone", 2, B);
    to_a(&hub, Message::NewFile(keep.clone()), B);
    to_a(&hub, Message::NewFile(gone.clone()), B);

    to_a(&hub, Message::RevokeFile(gone.clone()), B);
    to_a(&hub, Message::RevokeFile(gone), B);

    assert_eq!(x.node.network_descriptors(), vec![keep]);
    x.node.end_session().await.unwrap();
}

/// A GET_FILE for something not held here is refused and the requester
/// hears about it.
#[tokio::test]
async fn test_get_file_not_held_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let mut events = y.node.subscribe();
    hub.clear_log();

    let stray = descriptor("stray.txt", b"nowhere", 1, A);
    hub.inject(Message::GetFile(stray).encode().unwrap(), B, Destination::Unicast(A));

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: A,
            kind: MessageKind::GetFile,
            reason: "file is not held here".to_string(),
        }]
    );

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_upload_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let mut events = y.node.subscribe();
    hub.clear_log();

    let d = FileDescriptor {
        holder: A,
        ..descriptor("bad.bin", b"expected content", 5, B)
    };
    hub.inject(
        Message::UploadFile {
            descriptor: d,
            content: Bytes::from_static(b"tampered content"),
        }
        .encode().unwrap(),
        B,
        Destination::Unicast(A),
    );

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(hub.count(MessageKind::NewFile), 0);
    assert!(x.blobs.is_empty());
    assert!(x.node.local_descriptors().is_empty());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [NodeEvent::Refused {
            kind: MessageKind::UploadFile,
            ..
        }]
    ));

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// A valid UPLOAD_FILE makes the receiver the holder and announces it.
#[tokio::test]
async fn test_upload_file_is_stored_and_announced() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    hub.clear_log();

    let d = descriptor("pushed.bin", b"pushed", 5, B);
    hub.inject(
        Message::UploadFile {
            descriptor: d.clone(),
            content: Bytes::from_static(b"pushed"),
        }
        .encode().unwrap(),
        B,
        Destination::Unicast(A),
    );

    let held = FileDescriptor { holder: A, ..d };
    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::NewFile]);
    assert_eq!(x.node.local_descriptors(), vec![held.clone()]);
    assert_eq!(x.node.network_descriptors(), vec![held.clone()]);
    assert_eq!(
        x.blobs.load(&held.content_hash.to_hex()).unwrap(),
        b"pushed".to_vec()
    );
    x.node.end_session().await.unwrap();
}

#[tokio::test]
async fn test_delete_from_non_owner_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = x.node.upload_bytes("mine.txt", b"mine").unwrap();
    assert_eq!(d.holder, A);
    let mut events = y.node.subscribe();
    hub.clear_log();

    hub.inject(Message::DeleteFile(d.clone()).encode().unwrap(), B, Destination::Unicast(A));

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(hub.count(MessageKind::RevokeFile), 0);
    assert!(x.blobs.contains(&d.content_hash.to_hex()));
    assert_eq!(x.node.local_descriptors(), vec![d]);
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: A,
            kind: MessageKind::DeleteFile,
            reason: "only the owner may delete".to_string(),
        }]
    );

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// A transfer whose bytes do not hash to the descriptor is kept but flagged.
#[tokio::test]
async fn test_file_transfer_mismatch_is_flagged() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let mut events = x.node.subscribe();
    let d = descriptor("flaky.bin", b"what was promised", 1, B);

    to_a(
        &hub,
        Message::FileTransfer {
            descriptor: d.clone(),
            content: Bytes::from_static(b"what arrived"),
        },
        B,
    );

    assert_eq!(x.downloads.load("flaky.bin").unwrap(), b"what arrived".to_vec());
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::FileReceived {
            descriptor: d,
            verified: false
        }]
    );
    x.node.end_session().await.unwrap();
}

/// Garbage and truncated frames are dropped without touching state.
#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let d = x.node.upload_bytes("steady.txt", b"steady").unwrap();
    hub.clear_log();

    let mut truncated = Message::NewFile(descriptor("x.txt", b"x", 1, B)).encode().unwrap().to_vec();
    truncated.truncate(20);
    for frame in [
        Bytes::from_static(b"\x01\x02"),
        Bytes::from_static(&[0xff, 0, 0, 0, 0, 0, 0, 0]),
        Bytes::from(truncated),
    ] {
        hub.inject(frame, B, Destination::Unicast(A));
    }

    assert!(hub.sent().is_empty());
    assert_eq!(x.node.network_descriptors(), vec![d]);
    assert!(x.node.peers().is_empty());
    x.node.end_session().await.unwrap();
}

/// A peer reporting this node lost is ignored; a report about another
/// peer drops that peer's files.
#[tokio::test]
async fn test_connection_lost_reports() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = y.node.upload_bytes("on-b.txt", b"on b").unwrap();
    let mut events = x.node.subscribe();

    hub.inject(Message::ConnectionLost(A).encode().unwrap(), C, Destination::Unicast(A));
    assert_eq!(x.node.network_descriptors(), vec![d]);
    assert!(drain(&mut events).is_empty());

    hub.inject(Message::ConnectionLost(B).encode().unwrap(), C, Destination::Unicast(A));
    assert!(x.node.network_descriptors().is_empty());
    assert!(x.node.peers().is_empty());
    assert_eq!(drain(&mut events), vec![NodeEvent::PeerLost(B)]);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// A holder whose copy is fenced refuses to serve it.
#[tokio::test]
async fn test_get_file_on_fenced_copy_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = x.node.upload_bytes("fenced.txt", b"fenced").unwrap();
    to_a(&hub, Message::DiscardDescriptor(d.invalidated()), B);
    let mut events = y.node.subscribe();
    hub.clear_log();

    hub.inject(Message::GetFile(d.clone()).encode().unwrap(), B, Destination::Unicast(A));

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: A,
            kind: MessageKind::GetFile,
            reason: "file is being moved or deleted".to_string(),
        }]
    );
    assert_eq!(x.node.local_descriptors(), vec![d.invalidated()]);
    assert!(x.blobs.contains(&d.content_hash.to_hex()));

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// A fenced copy may only be deleted by its owner.
#[tokio::test]
async fn test_delete_of_fenced_copy_by_non_owner_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = x.node.upload_bytes("fenced.txt", b"fenced").unwrap();
    to_a(&hub, Message::DiscardDescriptor(d.invalidated()), B);
    let mut events = y.node.subscribe();
    hub.clear_log();

    hub.inject(Message::DeleteFile(d.invalidated()).encode().unwrap(), B, Destination::Unicast(A));

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: A,
            kind: MessageKind::DeleteFile,
            reason: "file is being moved or deleted".to_string(),
        }]
    );
    assert!(x.blobs.contains(&d.content_hash.to_hex()));
    assert_eq!(x.node.local_descriptors().len(), 1);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// Deleting a file whose bytes are already gone is refused and nothing is
/// revoked.
#[tokio::test]
async fn test_delete_with_missing_blob_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let d = x.node.upload_bytes("vanished.txt", b"vanished").unwrap();
    assert!(x.blobs.delete(&d.content_hash.to_hex()));
    let mut events = x.node.subscribe();
    hub.clear_log();

    x.node.delete_file("vanished.txt").await.unwrap();

    assert_eq!(
        hub.kinds_sent_by(A),
        vec![
            MessageKind::DiscardDescriptor,
            MessageKind::DeleteFile,
            MessageKind::CmdRefused
        ]
    );
    assert_eq!(hub.count(MessageKind::RevokeFile), 0);
    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: A,
            kind: MessageKind::DeleteFile,
            reason: "file is missing from storage".to_string(),
        }]
    );
    assert_eq!(x.node.local_descriptors(), vec![d.invalidated()]);
    assert_eq!(y.node.network_descriptors(), vec![d.invalidated()]);

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_holder_change_is_refused() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let y = joined(&hub, B).await;
    let mut events = y.node.subscribe();
    hub.clear_log();

    let d = FileDescriptor {
        holder: A,
        valid: false,
        ..descriptor("moving.bin", b"original bytes", 5, B)
    };
    hub.inject(
        Message::HolderChange {
            descriptor: d,
            content: Bytes::from_static(b"damaged bytes!"),
        }
        .encode()
        .unwrap(),
        B,
        Destination::Unicast(A),
    );

    assert_eq!(hub.kinds_sent_by(A), vec![MessageKind::CmdRefused]);
    assert_eq!(hub.count(MessageKind::UpdateDescriptor), 0);
    assert!(x.blobs.is_empty());
    assert!(x.node.local_descriptors().is_empty());
    assert!(matches!(
        drain(&mut events).as_slice(),
        [NodeEvent::Refused {
            kind: MessageKind::HolderChange,
            ..
        }]
    ));

    y.node.end_session().await.unwrap();
    x.node.end_session().await.unwrap();
}

/// While a node is leaving it serves, accepts and takes over nothing.
#[tokio::test]
async fn test_departing_node_refuses_requests() {
    let hub = MemoryHub::new();
    let slow = NodeSettings {
        discard_propagation: Duration::from_millis(400),
        ..fast_settings()
    };
    let x = test_node_with(&hub, A, slow);
    x.node.start_session().await.unwrap();
    let y = joined(&hub, B).await;
    let held = x.node.upload_bytes("held.txt", b"held").unwrap();
    assert_eq!(held.holder, A);
    let mut events = y.node.subscribe();

    let leaving = {
        let node = x.node.clone();
        tokio::spawn(async move { node.end_session().await })
    };
    eventually("departure to start", || x.node.phase() == Phase::Departing).await;

    let pushed = FileDescriptor {
        holder: A,
        ..descriptor("pushed.bin", b"pushed", 5, B)
    };
    let moved = FileDescriptor {
        holder: A,
        valid: false,
        ..descriptor("moved.bin", b"moved", 6, B)
    };
    for message in [
        Message::GetFile(held),
        Message::UploadFile {
            descriptor: pushed.clone(),
            content: Bytes::from_static(b"pushed"),
        },
        Message::HolderChange {
            descriptor: moved.clone(),
            content: Bytes::from_static(b"moved"),
        },
    ] {
        hub.inject(message.encode().unwrap(), B, Destination::Unicast(A));
    }

    let refused: Vec<(MessageKind, String)> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            NodeEvent::Refused { from, kind, reason } if from == A => Some((kind, reason)),
            _ => None,
        })
        .collect();
    let leaving_reason = "node is leaving the network".to_string();
    assert_eq!(
        refused,
        vec![
            (MessageKind::GetFile, leaving_reason.clone()),
            (MessageKind::UploadFile, leaving_reason.clone()),
            (MessageKind::HolderChange, leaving_reason),
        ]
    );
    assert_eq!(hub.count(MessageKind::FileTransfer), 0);
    assert!(!x.blobs.contains(&pushed.content_hash.to_hex()));
    assert!(!x.blobs.contains(&moved.content_hash.to_hex()));

    leaving.await.unwrap().unwrap();
    y.node.end_session().await.unwrap();
}

/// A refused hand-over reaches the departing node as an event.
#[tokio::test]
async fn test_refused_hand_over_is_reported() {
    let hub = MemoryHub::new();
    let x = joined(&hub, A).await;
    let mut events = x.node.subscribe();

    to_a(
        &hub,
        Message::CmdRefused {
            refused: MessageKind::HolderChange,
            reason: "node is leaving the network".to_string(),
        },
        B,
    );

    assert_eq!(
        drain(&mut events),
        vec![NodeEvent::Refused {
            from: B,
            kind: MessageKind::HolderChange,
            reason: "node is leaving the network".to_string(),
        }]
    );
    x.node.end_session().await.unwrap();
}
