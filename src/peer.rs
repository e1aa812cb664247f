//! Per-peer plumbing.
//!
//! Each connected peer gets a record on the event loop, a writer task that
//! drains a bounded send queue onto a self-opened stream, and one reader
//! task per inbound stream feeding decoded frames back to the loop. Sending
//! never blocks the loop: a full queue drops the frame, emits a trace event
//! and, for message-bearing frames, bumps an overflow counter that feeds the
//! behaviour penalty.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::host::{Host, ProtocolId, BoxedReader, FLOOD_PROTOCOL, MESH_PROTOCOL};
use crate::identity::PeerId;
use crate::trace::{TraceEvent, Tracer};
use crate::wire::{read_frame, write_frame, RpcFrame, WireError};

/// Capability class negotiated from the stream protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    /// Full protocol: may hold mesh membership and exchange control.
    Mesh,
    /// Broadcast-only: receives messages, never grafted, control ignored.
    Flood,
}

impl PeerKind {
    pub(crate) fn from_protocol(protocol: ProtocolId) -> Self {
        match protocol {
            MESH_PROTOCOL => Self::Mesh,
            FLOOD_PROTOCOL => Self::Flood,
            _ => Self::Flood,
        }
    }
}

/// Peer liveness as tracked on the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PeerState {
    /// Record exists, writer still opening its stream.
    Connecting,
    Connected,
    /// Disconnect observed; record about to be dropped.
    Disconnecting,
}

/// Events produced by reader tasks.
pub(crate) enum StreamEvent {
    Frame { peer: PeerId, frame: RpcFrame },
    /// Malformed or oversize frame: a protocol error chargeable to the peer.
    ProtocolViolation { peer: PeerId, error: WireError },
    StreamClosed { peer: PeerId },
}

pub(crate) struct PeerRecord {
    /// Unknown peers default to flood-only until a mesh-protocol stream
    /// proves otherwise.
    pub kind: PeerKind,
    pub outbound: bool,
    pub addr: Option<IpAddr>,
    pub state: PeerState,
    /// Topics the peer has announced subscribing to.
    pub topics: HashSet<String>,
    /// Message frames dropped on queue overflow since the last heartbeat.
    pub overflow: u32,
    sender: mpsc::Sender<RpcFrame>,
    writer: JoinHandle<()>,
}

impl PeerRecord {
    pub fn new(
        sender: mpsc::Sender<RpcFrame>,
        writer: JoinHandle<()>,
        outbound: bool,
        addr: Option<IpAddr>,
    ) -> Self {
        Self {
            kind: PeerKind::Flood,
            outbound,
            addr,
            state: PeerState::Connecting,
            topics: HashSet::new(),
            overflow: 0,
            sender,
            writer,
        }
    }

    /// Queue a frame without blocking. Returns false when the frame was
    /// dropped because the queue is full.
    pub fn send(&mut self, peer: &PeerId, frame: RpcFrame, tracer: &Tracer) -> bool {
        let control_only = frame.is_control_only();
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !control_only {
                    self.overflow = self.overflow.saturating_add(1);
                }
                tracer.emit(TraceEvent::DropRpc { peer: *peer });
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(peer = %peer, "send queue closed");
                false
            }
        }
    }

    /// Drain and reset the overflow counter; folded into the behaviour
    /// penalty each heartbeat.
    pub fn take_overflow(&mut self) -> u32 {
        std::mem::take(&mut self.overflow)
    }

    pub fn shutdown(&self) {
        self.writer.abort();
    }
}

/// Spawn the writer task for a peer: open the outbound stream (gated by the
/// pending-connection semaphore) and drain the queue onto it.
pub(crate) fn spawn_writer(
    host: Arc<dyn Host>,
    peer: PeerId,
    protocol: ProtocolId,
    mut queue: mpsc::Receiver<RpcFrame>,
    max_transmission: usize,
    conn_sem: Arc<Semaphore>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = {
            let _permit = match conn_sem.acquire().await {
                Ok(p) => p,
                Err(_) => return,
            };
            match host.open_stream(peer, protocol).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "outbound stream open failed");
                    return;
                }
            }
        };
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut stream, &frame, max_transmission).await {
                debug!(peer = %peer, error = %e, "peer stream write failed");
                break;
            }
        }
        trace!(peer = %peer, "writer task finished");
    })
}

/// Spawn a reader task for an inbound stream. Frames are handed to the loop
/// in arrival order; decode failures are reported as protocol violations and
/// end the stream.
pub(crate) fn spawn_reader(
    peer: PeerId,
    mut stream: BoxedReader,
    events: mpsc::Sender<StreamEvent>,
    max_transmission: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut stream, max_transmission).await {
                Ok(frame) => {
                    if events.send(StreamEvent::Frame { peer, frame }).await.is_err() {
                        return;
                    }
                }
                Err(WireError::Io(e)) => {
                    trace!(peer = %peer, error = %e, "peer stream closed");
                    let _ = events.send(StreamEvent::StreamClosed { peer }).await;
                    return;
                }
                Err(error) => {
                    let _ = events
                        .send(StreamEvent::ProtocolViolation { peer, error })
                        .await;
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemNetwork, HostEvent};
    use crate::identity::Keypair;

    fn peer(seed: u8) -> PeerId {
        Keypair::from_seed([seed; 32]).peer_id()
    }

    const MAX: usize = 64 * 1024;

    #[tokio::test]
    async fn frames_flow_writer_to_reader() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.host(peer(1));
        let (_b, mut b_rx) = net.host(peer(2));

        let (tx, rx) = mpsc::channel(8);
        let sem = Arc::new(Semaphore::new(4));
        let _writer = spawn_writer(a, peer(2), MESH_PROTOCOL, rx, MAX, sem);

        tx.send(RpcFrame::subscription("news", true)).await.unwrap();

        let stream = match b_rx.recv().await.unwrap() {
            HostEvent::InboundStream { stream, protocol, .. } => {
                assert_eq!(protocol, MESH_PROTOCOL);
                stream
            }
            other => panic!("unexpected event {other:?}"),
        };

        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let _reader = spawn_reader(peer(1), stream, ev_tx, MAX);

        match ev_rx.recv().await.unwrap() {
            StreamEvent::Frame { peer: p, frame } => {
                assert_eq!(p, peer(1));
                assert_eq!(frame, RpcFrame::subscription("news", true));
            }
            _ => panic!("expected frame"),
        }
    }

    #[tokio::test]
    async fn reader_reports_stream_end() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.host(peer(1));
        let (_b, mut b_rx) = net.host(peer(2));

        let writer = a.open_stream(peer(2), MESH_PROTOCOL).await.unwrap();
        let stream = match b_rx.recv().await.unwrap() {
            HostEvent::InboundStream { stream, .. } => stream,
            other => panic!("unexpected event {other:?}"),
        };

        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        let _reader = spawn_reader(peer(1), stream, ev_tx, MAX);
        drop(writer);

        match ev_rx.recv().await.unwrap() {
            StreamEvent::StreamClosed { peer: p } => assert_eq!(p, peer(1)),
            StreamEvent::Frame { .. } => panic!("expected closure"),
            StreamEvent::ProtocolViolation { .. } => panic!("expected clean closure"),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts_message_frames() {
        let (sender, _keep_rx) = mpsc::channel(1);
        let writer = tokio::spawn(async {});
        let mut record = PeerRecord::new(sender, writer, true, None);
        let tracer = Tracer::default();
        let target = peer(3);

        let msg_frame = RpcFrame::publish(crate::wire::Message {
            from: peer(4),
            seqno: 1,
            topic: "t".into(),
            data: vec![1],
            signature: None,
            key: None,
        });

        assert!(record.send(&target, msg_frame.clone(), &tracer));
        // Queue capacity 1 and nothing draining: both classes drop, only the
        // message frame counts toward overflow.
        assert!(!record.send(&target, RpcFrame::subscription("t", true), &tracer));
        assert_eq!(record.take_overflow(), 0);
        assert!(!record.send(&target, msg_frame, &tracer));
        assert_eq!(record.take_overflow(), 1);
        assert_eq!(record.take_overflow(), 0);
    }

    #[test]
    fn unknown_protocols_are_flood_class() {
        assert_eq!(PeerKind::from_protocol(MESH_PROTOCOL), PeerKind::Mesh);
        assert_eq!(PeerKind::from_protocol(FLOOD_PROTOCOL), PeerKind::Flood);
        assert_eq!(PeerKind::from_protocol("meshcast/other/9.9"), PeerKind::Flood);
    }
}
