//! The host collaborator.
//!
//! Dialing, stream opening and peer identity live outside this crate. The
//! node consumes a [`Host`] implementation for outbound operations and a
//! stream of [`HostEvent`]s for connection notifications and inbound
//! streams. Each side of a connection writes frames on a stream it opened
//! itself and reads from the streams the remote opened.
//!
//! [`MemNetwork`] is a process-local host used by the integration tests:
//! peers are wired together with in-memory pipes, and the advertised address
//! feeds the IP-colocation scoring exactly like a real transport would.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// Stream protocol spoken by mesh-capable peers.
pub const MESH_PROTOCOL: ProtocolId = "meshcast/mesh/1.0";

/// Stream protocol spoken by flood-only peers: they receive and publish
/// messages but cannot hold mesh state or control messages.
pub const FLOOD_PROTOCOL: ProtocolId = "meshcast/flood/1.0";

pub type ProtocolId = &'static str;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection notifications and inbound streams pushed by the host.
pub enum HostEvent {
    PeerConnected {
        peer: PeerId,
        /// True when the local node dialed.
        outbound: bool,
        /// Remote address, for colocation accounting.
        addr: Option<IpAddr>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    InboundStream {
        peer: PeerId,
        protocol: ProtocolId,
        stream: BoxedReader,
    },
}

impl std::fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerConnected { peer, outbound, addr } => f
                .debug_struct("PeerConnected")
                .field("peer", peer)
                .field("outbound", outbound)
                .field("addr", addr)
                .finish(),
            Self::PeerDisconnected { peer } => {
                f.debug_struct("PeerDisconnected").field("peer", peer).finish()
            }
            Self::InboundStream { peer, protocol, .. } => f
                .debug_struct("InboundStream")
                .field("peer", peer)
                .field("protocol", protocol)
                .finish(),
        }
    }
}

/// Outbound operations the node needs from its transport.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    /// Establish a connection; both sides observe `PeerConnected`.
    async fn connect(&self, peer: PeerId) -> Result<()>;

    /// Open a unidirectional stream to a connected peer. The remote observes
    /// an `InboundStream` with the read side.
    async fn open_stream(&self, peer: PeerId, protocol: ProtocolId) -> Result<BoxedWriter>;
}

const MEM_STREAM_BUFFER: usize = 256 * 1024;

struct MemEndpoint {
    addr: IpAddr,
    events: mpsc::Sender<HostEvent>,
}

/// Registry of in-memory hosts wired together with duplex pipes.
#[derive(Clone, Default)]
pub struct MemNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, MemEndpoint>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host on the network. Addresses default to distinct
    /// loopback-style addresses so colocation scoring stays neutral.
    pub fn host(&self, peer: PeerId) -> (Arc<MemHost>, mpsc::Receiver<HostEvent>) {
        let n = self.endpoints.lock().expect("network poisoned").len() as u32 + 1;
        let octets = n.to_be_bytes();
        let addr = IpAddr::V4(Ipv4Addr::new(10, octets[1], octets[2], octets[3]));
        self.host_with_addr(peer, addr)
    }

    pub fn host_with_addr(
        &self,
        peer: PeerId,
        addr: IpAddr,
    ) -> (Arc<MemHost>, mpsc::Receiver<HostEvent>) {
        let (events, rx) = mpsc::channel(1024);
        self.endpoints
            .lock()
            .expect("network poisoned")
            .insert(peer, MemEndpoint { addr, events });
        (
            Arc::new(MemHost {
                id: peer,
                net: self.clone(),
            }),
            rx,
        )
    }

    /// Tear down a connection from the outside, as a transport would on
    /// stream failure. Both sides observe `PeerDisconnected`.
    pub async fn disconnect(&self, a: PeerId, b: PeerId) {
        let (to_a, to_b) = {
            let endpoints = self.endpoints.lock().expect("network poisoned");
            (
                endpoints.get(&a).map(|e| e.events.clone()),
                endpoints.get(&b).map(|e| e.events.clone()),
            )
        };
        if let Some(tx) = to_a {
            let _ = tx.send(HostEvent::PeerDisconnected { peer: b }).await;
        }
        if let Some(tx) = to_b {
            let _ = tx.send(HostEvent::PeerDisconnected { peer: a }).await;
        }
    }

    fn endpoint(&self, peer: &PeerId) -> Option<(IpAddr, mpsc::Sender<HostEvent>)> {
        self.endpoints
            .lock()
            .expect("network poisoned")
            .get(peer)
            .map(|e| (e.addr, e.events.clone()))
    }
}

pub struct MemHost {
    id: PeerId,
    net: MemNetwork,
}

#[async_trait]
impl Host for MemHost {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    async fn connect(&self, peer: PeerId) -> Result<()> {
        let Some((remote_addr, remote_tx)) = self.net.endpoint(&peer) else {
            bail!("unknown peer {peer}");
        };
        let Some((local_addr, local_tx)) = self.net.endpoint(&self.id) else {
            bail!("local host deregistered");
        };
        local_tx
            .send(HostEvent::PeerConnected {
                peer,
                outbound: true,
                addr: Some(remote_addr),
            })
            .await
            .map_err(|_| anyhow::anyhow!("local event channel closed"))?;
        remote_tx
            .send(HostEvent::PeerConnected {
                peer: self.id,
                outbound: false,
                addr: Some(local_addr),
            })
            .await
            .map_err(|_| anyhow::anyhow!("remote event channel closed"))?;
        Ok(())
    }

    async fn open_stream(&self, peer: PeerId, protocol: ProtocolId) -> Result<BoxedWriter> {
        let Some((_, remote_tx)) = self.net.endpoint(&peer) else {
            bail!("unknown peer {peer}");
        };
        let (local, remote) = tokio::io::duplex(MEM_STREAM_BUFFER);
        remote_tx
            .send(HostEvent::InboundStream {
                peer: self.id,
                protocol,
                stream: Box::new(remote),
            })
            .await
            .map_err(|_| anyhow::anyhow!("remote event channel closed"))?;
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer(seed: u8) -> PeerId {
        Keypair::from_seed([seed; 32]).peer_id()
    }

    #[tokio::test]
    async fn connect_notifies_both_sides() {
        let net = MemNetwork::new();
        let (a, mut a_rx) = net.host(peer(1));
        let (_b, mut b_rx) = net.host(peer(2));

        a.connect(peer(2)).await.unwrap();

        match a_rx.recv().await.unwrap() {
            HostEvent::PeerConnected { peer: p, outbound, addr } => {
                assert_eq!(p, peer(2));
                assert!(outbound);
                assert!(addr.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
        match b_rx.recv().await.unwrap() {
            HostEvent::PeerConnected { peer: p, outbound, .. } => {
                assert_eq!(p, peer(1));
                assert!(!outbound);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_bytes_reach_remote_reader() {
        let net = MemNetwork::new();
        let (a, _a_rx) = net.host(peer(1));
        let (_b, mut b_rx) = net.host(peer(2));

        let mut writer = a.open_stream(peer(2), MESH_PROTOCOL).await.unwrap();
        writer.write_all(b"ping").await.unwrap();
        writer.flush().await.unwrap();

        match b_rx.recv().await.unwrap() {
            HostEvent::InboundStream { peer: p, protocol, mut stream } => {
                assert_eq!(p, peer(1));
                assert_eq!(protocol, MESH_PROTOCOL);
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"ping");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connecting_to_unknown_peer_fails() {
        let net = MemNetwork::new();
        let (a, _rx) = net.host(peer(1));
        assert!(a.connect(peer(9)).await.is_err());
    }
}
