//! # meshcast — publish/subscribe over a bounded gossip mesh
//!
//! meshcast is a peer-to-peer pub/sub substrate layered over a secure,
//! stream-oriented transport provided by the embedding application. Nodes
//! join named topics, publish messages on them, and receive every
//! well-formed, authorized message published to topics they joined.
//! Delivery is best-effort but built to stay reliable under churn: eager
//! forwarding along a bounded per-topic mesh, with periodic IHAVE/IWANT
//! gossip along the wider membership to repair losses.
//!
//! ## Architecture
//!
//! All invariant-bearing state lives on a single event-loop actor; the
//! public [`PubSub`] handle is cheap to clone and talks to it over bounded
//! channels. Network I/O, validation and subscriber delivery run on their
//! own tasks and never block the loop.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | event loop and the `PubSub` handle |
//! | `router` | routing variants: gossip mesh, flood, random fanout |
//! | `score` | per-peer behaviour scoring and thresholds |
//! | `cache` | seen-ID deduplication and the gossip message cache |
//! | `validation` | topic validators on a bounded worker pool |
//! | `registry` | local subscriptions and delivery queues |
//! | `peer` | per-peer reader/writer tasks and send queues |
//! | `wire` | frame schema and length-delimited codec |
//! | `host` | transport trait and the in-memory test host |
//! | `identity` | Ed25519 peer identities and message signatures |
//! | `config` | tunables, validated at construction |
//! | `trace` | structured event stream for observability |
//!
//! ## Example
//!
//! ```no_run
//! use meshcast::{Config, Keypair, MemNetwork, PubSub};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let net = MemNetwork::new();
//! let keypair = Keypair::generate();
//! let (host, events) = net.host(keypair.peer_id());
//! let node = PubSub::spawn(host, events, keypair, Config::default())?;
//!
//! let mut sub = node.subscribe("news").await?;
//! node.publish("news", b"hello mesh".to_vec()).await?;
//! let msg = sub.recv().await.expect("subscription closed");
//! assert_eq!(msg.data, b"hello mesh");
//! # Ok(()) }
//! ```

mod cache;
mod config;
mod host;
mod identity;
mod node;
mod peer;
mod registry;
mod router;
mod score;
mod trace;
mod validation;
mod wire;

pub use config::{Config, ConfigError, RoutingVariant};
pub use host::{
    BoxedReader, BoxedWriter, Host, HostEvent, MemHost, MemNetwork, ProtocolId, FLOOD_PROTOCOL,
    MESH_PROTOCOL,
};
pub use identity::{Keypair, PeerId, SignatureError};
pub use node::{content_message_ids, MessageIdFn, PublishError, PubSub, PubSubBuilder};
pub use peer::PeerKind;
pub use registry::Subscription;
pub use router::PeerExchange;
pub use score::{
    score_parameter_decay, score_parameter_decay_with_base, PeerScoreParams, PeerScoreSnapshot,
    PeerScoreThresholds, Subnet, TopicScoreParams,
};
pub use trace::{MemorySink, TraceEvent, TraceSink};
pub use validation::{RejectReason, Validator, Verdict};
pub use wire::{read_frame, write_frame, ControlBlock, ControlGraft, ControlIHave, ControlIWant,
    ControlPrune, Message, MessageId, RpcFrame, SubOpts, WireError};
