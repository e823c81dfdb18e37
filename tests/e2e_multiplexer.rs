//! End-to-end multiplexer tests.
//!
//! These tests run two multiplexers over an in-memory duplex pipe (or one
//! multiplexer against a hand-driven raw peer) and verify channel
//! lifecycle, flow control, datagram groups and failure cascades.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use plexus::config::MultiplexerConfig;
use plexus::mux::{read_frame, Frame, FrameType};
use plexus::{
    Ability, Connector, ExtensionLayer, Multiplexer, MultiplexerOwner, Packet, PacketConnector,
    PlexusError, PluginKey, StreamConnector,
};
use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

/// Owner that forwards accepted stream connectors and keeps packet members.
struct RecordingOwner {
    streams: mpsc::UnboundedSender<StreamConnector>,
    packets: mpsc::UnboundedSender<Packet>,
    members: Mutex<Vec<PacketConnector>>,
    closed: AtomicUsize,
}

impl MultiplexerOwner for RecordingOwner {
    fn plugin_key(&self) -> PluginKey {
        PluginKey {
            extension: ExtensionLayer::Transport,
            ability: Ability::new(0x01, 0x01),
        }
    }

    fn accept_connector(&self, _multiplexer: &Multiplexer, connector: Connector) {
        match connector {
            Connector::Stream(stream) => {
                let _ = self.streams.send(stream);
            },
            Connector::Packet(member) => {
                let packets = self.packets.clone();
                member.add_packet_listener(move |packet: &Packet| {
                    let _ = packets.send(packet.clone());
                });
                self.members.lock().unwrap().push(member);
            },
        }
    }

    fn close_multiplexer(&self, _multiplexer: &Multiplexer) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct End {
    mux: Multiplexer,
    owner: Arc<RecordingOwner>,
    streams: mpsc::UnboundedReceiver<StreamConnector>,
    packets: mpsc::UnboundedReceiver<Packet>,
}

impl End {
    async fn next_stream(&mut self) -> StreamConnector {
        tokio::time::timeout(Duration::from_secs(5), self.streams.recv())
            .await
            .expect("timed out waiting for channel")
            .expect("owner channel closed")
    }

    async fn wait_closed(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.owner.closed.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("multiplexer did not close");
    }
}

fn end(stream: DuplexStream, incoming: bool, config: MultiplexerConfig) -> End {
    let (streams_tx, streams) = mpsc::unbounded_channel();
    let (packets_tx, packets) = mpsc::unbounded_channel();
    let owner = Arc::new(RecordingOwner {
        streams: streams_tx,
        packets: packets_tx,
        members: Mutex::new(Vec::new()),
        closed: AtomicUsize::new(0),
    });
    let dyn_owner: Arc<dyn MultiplexerOwner> = owner.clone();
    End {
        mux: Multiplexer::spawn(stream, incoming, &dyn_owner, config),
        owner,
        streams,
        packets,
    }
}

fn link(config: MultiplexerConfig) -> (End, End) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (end(a, false, config.clone()), end(b, true, config))
}

/// Test bytes written on one end arrive in order on the accepted connector
#[tokio::test]
async fn test_stream_round_trip() {
    let (a, mut b) = link(MultiplexerConfig::default());

    let mut outgoing = a.mux.open_connector().await.unwrap();
    let mut incoming = b.next_stream().await;

    let message: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    outgoing.write_all(&message).await.unwrap();
    let mut received = vec![0u8; message.len()];
    incoming.read_exact(&mut received).await.unwrap();
    assert_eq!(received, message);

    incoming.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    outgoing.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"reply");
    assert_eq!(outgoing.owner(), a.owner.plugin_key());
}

/// Test transfers far larger than the window complete under flow control
#[tokio::test]
async fn test_flow_control_large_transfer() {
    let config = MultiplexerConfig {
        window_size: 4096,
        max_frame_payload: 1024,
        ..Default::default()
    };
    let (a, mut b) = link(config);

    let mut outgoing = a.mux.open_connector().await.unwrap();
    let mut incoming = b.next_stream().await;

    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        outgoing.write_all(&payload).await.unwrap();
        outgoing
    });

    let mut received = vec![0u8; expected.len()];
    incoming.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
    writer.await.unwrap();
}

/// Test many channels interleave without mixing their bytes
#[tokio::test]
async fn test_channels_are_independent() {
    let (a, mut b) = link(MultiplexerConfig::default());

    let mut outgoing = Vec::new();
    for _ in 0..8 {
        outgoing.push(a.mux.open_connector().await.unwrap());
    }
    let mut incoming = Vec::new();
    for _ in 0..8 {
        incoming.push(b.next_stream().await);
    }

    for (i, connector) in outgoing.iter_mut().enumerate().rev() {
        connector.write_all(&[i as u8; 300]).await.unwrap();
    }
    for (i, connector) in incoming.iter_mut().enumerate() {
        let mut buf = [0u8; 300];
        connector.read_exact(&mut buf).await.unwrap();
        assert!(buf.iter().all(|&byte| byte == i as u8), "channel {i} mixed bytes");
    }
}

/// Test closing with open channels ends every channel and notifies once
#[tokio::test]
async fn test_close_cascades_to_open_channels() {
    let (a, mut b) = link(MultiplexerConfig::default());

    let mut local = Vec::new();
    let mut remote = Vec::new();
    for _ in 0..4 {
        local.push(a.mux.open_connector().await.unwrap());
        remote.push(b.next_stream().await);
    }

    a.mux.close();
    a.mux.close();

    for connector in &mut local {
        let mut buf = [0u8; 16];
        assert_eq!(connector.read(&mut buf).await.unwrap(), 0);
        assert!(connector.write_all(b"after close").await.is_err());
    }

    b.wait_closed().await;
    for connector in &mut remote {
        let mut buf = [0u8; 16];
        let ended = matches!(connector.read(&mut buf).await, Ok(0) | Err(_));
        assert!(ended);
        assert!(connector.write_all(b"after close").await.is_err());
    }

    assert_eq!(a.owner.closed.load(Ordering::SeqCst), 1);
    assert_eq!(b.owner.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        b.mux.open_connector().await,
        Err(PlexusError::MultiplexerClosed(_))
    ));
}

/// Test a corrupt physical stream fails every channel with an error
#[tokio::test]
async fn test_corrupt_link_fails_channels() {
    let (near, mut raw) = tokio::io::duplex(64 * 1024);
    let mut a = end(near, false, MultiplexerConfig::default());

    raw.write_all(&Frame::open(2, 4096).encode()).await.unwrap();
    let mut accepted = a.next_stream().await;

    raw.write_all(&[0xEE; 32]).await.unwrap();
    a.wait_closed().await;

    let mut buf = [0u8; 8];
    let err = accepted.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(a.mux.is_closed());
}

/// Test the acceptor answers opens with its window and refuses wrong-range ids
#[tokio::test]
async fn test_open_handshake_on_the_wire() {
    let config = MultiplexerConfig {
        window_size: 2048,
        max_frame_payload: 1024,
        ..Default::default()
    };
    let (near, mut raw) = tokio::io::duplex(64 * 1024);
    let mut a = end(near, false, config);

    raw.write_all(&Frame::open(2, 4096).encode()).await.unwrap();
    let ack = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(ack.kind, FrameType::OpenAck);
    assert_eq!(ack.channel, 2);
    assert_eq!(ack.u32_payload().unwrap(), 2048);
    let _accepted = a.next_stream().await;

    // Odd ids belong to the non-incoming end.
    raw.write_all(&Frame::open(3, 4096).encode()).await.unwrap();
    let reject = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(reject.kind, FrameType::OpenReject);
    assert_eq!(reject.channel, 3);

    // Duplicate of a live channel.
    raw.write_all(&Frame::open(2, 4096).encode()).await.unwrap();
    let reject = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(reject.kind, FrameType::OpenReject);
    assert!(!a.mux.is_closed());
}

/// Test exceeding the flow-control window fails only that channel
#[tokio::test]
async fn test_window_violation_fails_channel_only() {
    let config = MultiplexerConfig {
        window_size: 1024,
        max_frame_payload: 1024,
        ..Default::default()
    };
    let (near, mut raw) = tokio::io::duplex(64 * 1024);
    let mut a = end(near, false, config);

    raw.write_all(&Frame::open(2, 4096).encode()).await.unwrap();
    let ack = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(ack.kind, FrameType::OpenAck);
    let mut accepted = a.next_stream().await;

    let chunk = Bytes::from(vec![7u8; 1024]);
    raw.write_all(&Frame::data(2, chunk.clone()).encode()).await.unwrap();
    raw.write_all(&Frame::data(2, chunk).encode()).await.unwrap();

    let close = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(close.kind, FrameType::Close);
    assert_eq!(close.channel, 2);

    let mut buf = vec![0u8; 1024];
    accepted.read_exact(&mut buf).await.unwrap();
    let err = accepted.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(!a.mux.is_closed());
}

/// Test an unanswered open times out and leaves the link usable
#[tokio::test]
async fn test_open_timeout() {
    let config = MultiplexerConfig {
        open_timeout_secs: 1,
        ..Default::default()
    };
    let (near, mut raw) = tokio::io::duplex(64 * 1024);
    let a = end(near, false, config);

    let err = a.mux.open_connector().await.unwrap_err();
    assert!(matches!(err, PlexusError::OpenTimeout(_)));
    assert!(err.is_retryable());

    let open = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!(open.kind, FrameType::Open);
    let close = read_frame(&mut raw, 4096).await.unwrap().unwrap();
    assert_eq!((close.kind, close.channel), (FrameType::Close, open.channel));
    assert!(!a.mux.is_closed());
}

/// Test group datagrams reach the peer's group members
#[tokio::test]
async fn test_packet_groups() {
    let (a, mut b) = link(MultiplexerConfig::default());

    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    let member = b.mux.open_packet_connector(9).unwrap();
    member.add_packet_listener(move |packet: &Packet| {
        let _ = local_tx.send(packet.clone());
    });

    let sender = a.mux.open_packet_connector(9).unwrap();
    let packet = sender.create_packet(Bytes::from_static(b"discover")).unwrap();
    sender.send_packet(&packet).unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), local_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, packet);

    // First packet for a group nobody joined creates a member via the owner.
    let other = a.mux.open_packet_connector(11).unwrap();
    other
        .send_packet(&other.create_packet(Bytes::from_static(b"hello")).unwrap())
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(5), b.packets.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.group, 11);
    assert_eq!(&received.payload[..], b"hello");
    assert_eq!(b.owner.members.lock().unwrap().len(), 1);

    assert!(sender.send_packet(&other.create_packet(Bytes::new()).unwrap()).is_err());
}

/// Test releasing a connector closes the channel on both ends
#[tokio::test]
async fn test_release_removes_channel() {
    let (a, mut b) = link(MultiplexerConfig::default());
    let outgoing = a.mux.open_connector().await.unwrap();
    let mut incoming = b.next_stream().await;
    assert_eq!(a.mux.channel_ids(), vec![1]);

    outgoing.release();
    let mut buf = [0u8; 4];
    assert_eq!(incoming.read(&mut buf).await.unwrap(), 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !a.mux.channel_ids().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(b.mux.channel_ids().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn concurrent_opens_never_collide(from_a in 1usize..12, from_b in 1usize..12, yields in 0usize..4) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (a, b) = link(MultiplexerConfig::default());
            let a_mux = a.mux.clone();
            let b_mux = b.mux.clone();

            let mut tasks = Vec::new();
            for i in 0..from_a.max(from_b) {
                for (mux, count) in [(a_mux.clone(), from_a), (b_mux.clone(), from_b)] {
                    if i < count {
                        tasks.push(tokio::spawn(async move {
                            for _ in 0..(i % (yields + 1)) {
                                tokio::task::yield_now().await;
                            }
                            mux.open_connector().await
                        }));
                    }
                }
            }

            let mut connectors = Vec::new();
            for task in tasks {
                connectors.push(task.await.unwrap().expect("open failed"));
            }

            let a_ids: BTreeSet<u32> = a_mux.channel_ids().into_iter().collect();
            let b_ids: BTreeSet<u32> = b_mux.channel_ids().into_iter().collect();
            assert_eq!(a_ids.len(), from_a + from_b);
            assert_eq!(a_ids, b_ids);
            assert_eq!(a_ids.iter().filter(|id| *id % 2 == 1).count(), from_a);
            assert_eq!(a_ids.iter().filter(|id| *id % 2 == 0).count(), from_b);

            drop(connectors);
            drop((a, b));
        });
    }
}
