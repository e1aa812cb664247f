//! The event loop and its public handle.
//!
//! All router, registry, score and peer-record mutations happen on one
//! cooperative task. The [`PubSub`] handle is cheap to clone and talks to
//! the loop through a bounded command channel with oneshot replies; peer
//! reader tasks, the validator pool and the host feed the same multiplexer.
//! The loop never blocks on network I/O: every outward effect goes through
//! a bounded queue owned by a dedicated task.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, trace, warn};

use crate::cache::SeenCache;
use crate::config::{Config, RoutingVariant};
use crate::host::{Host, HostEvent, ProtocolId, FLOOD_PROTOCOL, MESH_PROTOCOL};
use crate::identity::{Keypair, PeerId};
use crate::peer::{spawn_reader, spawn_writer, PeerKind, PeerRecord, PeerState, StreamEvent};
use crate::registry::{Subscription, TopicRegistry};
use crate::router::{PeerExchange, Router, RouterCtx};
use crate::score::{PeerScoreSnapshot, ScoreKeeper};
use crate::trace::{TraceEvent, TraceSink, Tracer};
use crate::validation::{
    RejectReason, ValidationOutcome, ValidationRequest, Validator, ValidatorPool, Verdict,
};
use crate::wire::{Message, MessageId, RpcFrame, SubOpts};

/// Topic-configurable message-ID derivation over the message bytes.
pub type MessageIdFn = Arc<dyn Fn(&Message) -> MessageId + Send + Sync>;

/// Ready-made content-addressed ID function for [`PubSub::set_message_id_fn`]:
/// a blake3 digest over the canonical message bytes instead of the default
/// `from || seqno` concatenation.
pub fn content_message_ids() -> MessageIdFn {
    Arc::new(MessageId::from_content)
}

/// Errors surfaced synchronously from [`PubSub::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The topic has no live members and the node is configured to refuse
    /// publishing into the void.
    NoPeers,
    /// Payload exceeds the configured maximum message size.
    TooLarge { size: usize, limit: usize },
    /// The derived message ID is already in the seen cache.
    Duplicate,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPeers => write!(f, "no peers for topic"),
            Self::TooLarge { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit}")
            }
            Self::Duplicate => write!(f, "message already published"),
        }
    }
}

impl std::error::Error for PublishError {}

enum Command {
    Join {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    Leave {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        topic: String,
        reply: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<MessageId, PublishError>>,
    },
    SetValidator {
        topic: String,
        validator: Validator,
        reply: oneshot::Sender<()>,
    },
    SetMessageIdFn {
        topic: String,
        id_fn: MessageIdFn,
        reply: oneshot::Sender<()>,
    },
    BlacklistPeer {
        peer: PeerId,
        reply: oneshot::Sender<()>,
    },
    EnoughPeers {
        topic: String,
        suggested: usize,
        reply: oneshot::Sender<bool>,
    },
    MeshPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    TopicPeers {
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    PeerScore {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerScoreSnapshot>>,
    },
    #[cfg(test)]
    #[allow(clippy::type_complexity)]
    Eval {
        f: Box<dyn FnOnce(&mut EventLoop) + Send>,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a running node. Clones share the same event loop.
#[derive(Clone)]
pub struct PubSub {
    cmd_tx: mpsc::Sender<Command>,
    local: PeerId,
}

/// Construction options beyond the config: trace sink and discovery sink.
pub struct PubSubBuilder {
    host: Arc<dyn Host>,
    events: mpsc::Receiver<HostEvent>,
    keypair: Keypair,
    config: Config,
    trace_sink: Option<Arc<dyn TraceSink>>,
    px_tx: Option<mpsc::Sender<PeerExchange>>,
}

impl PubSubBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    /// Register a discovery sink for peer-exchange records carried on PRUNE.
    pub fn peer_exchange(mut self, tx: mpsc::Sender<PeerExchange>) -> Self {
        self.px_tx = Some(tx);
        self
    }

    pub fn spawn(self) -> Result<PubSub> {
        self.config.validate().map_err(|e| anyhow!(e))?;
        let local = self.keypair.peer_id();

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (stream_tx, stream_rx) = mpsc::channel(1024);
        let (outcome_tx, outcome_rx) = mpsc::channel(64);

        let pool = ValidatorPool::spawn(
            self.config.validator_workers,
            self.config.validate_queue_len,
            self.config.validate_timeout,
            outcome_tx,
        );

        let event_loop = EventLoop {
            conn_sem: Arc::new(Semaphore::new(self.config.max_pending_conns)),
            registry: TopicRegistry::new(self.config.subscription_queue_len),
            seen: SeenCache::new(self.config.seen_ttl),
            score: ScoreKeeper::new(self.config.score_params.clone()),
            router: Router::new(&self.config),
            tracer: Tracer::new(self.trace_sink),
            local,
            keypair: self.keypair,
            host: self.host,
            peers: HashMap::new(),
            topics: HashMap::new(),
            joined: HashSet::new(),
            validators: HashMap::new(),
            id_fns: HashMap::new(),
            inflight: HashMap::new(),
            pool,
            blacklist: HashSet::new(),
            px_tx: self.px_tx,
            seqno: rand::random(),
            stream_tx,
            config: self.config,
        };
        tokio::spawn(event_loop.run(cmd_rx, self.events, stream_rx, outcome_rx));

        Ok(PubSub { cmd_tx, local })
    }
}

impl PubSub {
    pub fn builder(
        host: Arc<dyn Host>,
        events: mpsc::Receiver<HostEvent>,
        keypair: Keypair,
    ) -> PubSubBuilder {
        PubSubBuilder {
            host,
            events,
            keypair,
            config: Config::default(),
            trace_sink: None,
            px_tx: None,
        }
    }

    /// Spawn with the given config and no sinks.
    pub fn spawn(
        host: Arc<dyn Host>,
        events: mpsc::Receiver<HostEvent>,
        keypair: Keypair,
        config: Config,
    ) -> Result<Self> {
        Self::builder(host, events, keypair).config(config).spawn()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| anyhow!("node event loop closed"))?;
        rx.await.map_err(|_| anyhow!("node event loop closed"))
    }

    /// Join the topic mesh without receiving messages locally.
    pub async fn join(&self, topic: &str) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Join { topic, reply }).await
    }

    pub async fn leave(&self, topic: &str) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Leave { topic, reply }).await
    }

    /// Join the topic and open a delivery queue for it.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let topic = topic.to_string();
        self.request(|reply| Command::Subscribe { topic, reply }).await
    }

    /// Cancel local delivery and leave the topic.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::Unsubscribe { topic, reply }).await
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        let topic = topic.to_string();
        let result = self
            .request(|reply| Command::Publish { topic, data, reply })
            .await?;
        result.map_err(Into::into)
    }

    /// Install a validator for the topic; it runs on the validation pool for
    /// every inbound message when validation is enabled.
    pub async fn set_validator(&self, topic: &str, validator: Validator) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::SetValidator {
            topic,
            validator,
            reply,
        })
        .await
    }

    /// Install a message-ID function for the topic.
    pub async fn set_message_id_fn(&self, topic: &str, id_fn: MessageIdFn) -> Result<()> {
        let topic = topic.to_string();
        self.request(|reply| Command::SetMessageIdFn { topic, id_fn, reply })
            .await
    }

    /// Drop all traffic from and about this peer.
    pub async fn blacklist_peer(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| Command::BlacklistPeer { peer, reply })
            .await
    }

    /// Whether topic membership satisfies the routing variant's target.
    pub async fn enough_peers(&self, topic: &str, suggested: usize) -> Result<bool> {
        let topic = topic.to_string();
        self.request(|reply| Command::EnoughPeers {
            topic,
            suggested,
            reply,
        })
        .await
    }

    pub async fn mesh_peers(&self, topic: &str) -> Result<Vec<PeerId>> {
        let topic = topic.to_string();
        self.request(|reply| Command::MeshPeers { topic, reply }).await
    }

    pub async fn topic_peers(&self, topic: &str) -> Result<Vec<PeerId>> {
        let topic = topic.to_string();
        self.request(|reply| Command::TopicPeers { topic, reply }).await
    }

    pub async fn peer_score(&self, peer: PeerId) -> Result<Option<PeerScoreSnapshot>> {
        self.request(|reply| Command::PeerScore { peer, reply }).await
    }

    #[cfg(test)]
    pub(crate) async fn eval(&self, f: Box<dyn FnOnce(&mut EventLoop) + Send>) -> Result<()> {
        self.request(|reply| Command::Eval { f, reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }
}

pub(crate) struct EventLoop {
    config: Config,
    keypair: Keypair,
    local: PeerId,
    host: Arc<dyn Host>,
    conn_sem: Arc<Semaphore>,
    pub(crate) peers: HashMap<PeerId, PeerRecord>,
    /// Remote membership: which connected peers announced each topic.
    pub(crate) topics: HashMap<String, HashSet<PeerId>>,
    /// Topics the local node has joined.
    joined: HashSet<String>,
    registry: TopicRegistry,
    validators: HashMap<String, Validator>,
    id_fns: HashMap<String, MessageIdFn>,
    /// In-flight validations per topic, for the saturation gate.
    inflight: HashMap<String, usize>,
    pool: ValidatorPool,
    seen: SeenCache,
    pub(crate) score: ScoreKeeper,
    pub(crate) router: Router,
    tracer: Tracer,
    blacklist: HashSet<PeerId>,
    px_tx: Option<mpsc::Sender<PeerExchange>>,
    seqno: u64,
    stream_tx: mpsc::Sender<StreamEvent>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut host_events: mpsc::Receiver<HostEvent>,
        mut stream_rx: mpsc::Receiver<StreamEvent>,
        mut outcome_rx: mpsc::Receiver<ValidationOutcome>,
    ) {
        let heartbeat_start =
            tokio::time::Instant::now() + self.config.heartbeat_initial_delay;
        let mut heartbeat =
            tokio::time::interval_at(heartbeat_start, self.config.heartbeat_interval);
        let mut decay = tokio::time::interval(self.config.score_params.decay_interval);
        let mut host_open = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                event = host_events.recv(), if host_open => {
                    match event {
                        Some(event) => self.handle_host_event(event),
                        None => host_open = false,
                    }
                }
                Some(event) = stream_rx.recv() => {
                    self.handle_stream_event(event);
                }
                Some(outcome) = outcome_rx.recv() => {
                    self.handle_validation_outcome(outcome);
                }
                _ = heartbeat.tick() => {
                    self.heartbeat();
                }
                _ = decay.tick() => {
                    self.score.refresh(Instant::now());
                }
            }
        }

        self.registry.close_all();
        for record in self.peers.values() {
            record.shutdown();
        }
        debug!(local = %self.local, "event loop stopped");
    }

    /// Split the loop into the router and the shared state it operates on.
    fn split(&mut self) -> (&mut Router, RouterCtx<'_>) {
        let Self {
            router,
            config,
            local,
            peers,
            topics,
            score,
            seen,
            tracer,
            px_tx,
            ..
        } = self;
        (
            router,
            RouterCtx {
                config,
                local: *local,
                peers,
                topics,
                score,
                seen,
                tracer,
                px_tx: px_tx.as_ref(),
            },
        )
    }

    fn local_protocol(&self) -> ProtocolId {
        match self.config.routing {
            RoutingVariant::Gossip => MESH_PROTOCOL,
            RoutingVariant::Flood | RoutingVariant::RandomFanout { .. } => FLOOD_PROTOCOL,
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Join { topic, reply } => {
                self.join(&topic);
                let _ = reply.send(());
            }
            Command::Leave { topic, reply } => {
                self.leave(&topic);
                let _ = reply.send(());
            }
            Command::Subscribe { topic, reply } => {
                self.join(&topic);
                let _ = reply.send(self.registry.subscribe(&topic));
            }
            Command::Unsubscribe { topic, reply } => {
                self.registry.unsubscribe(&topic);
                self.leave(&topic);
                let _ = reply.send(());
            }
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(&topic, data));
            }
            Command::SetValidator {
                topic,
                validator,
                reply,
            } => {
                self.validators.insert(topic, validator);
                let _ = reply.send(());
            }
            Command::SetMessageIdFn { topic, id_fn, reply } => {
                self.id_fns.insert(topic, id_fn);
                let _ = reply.send(());
            }
            Command::BlacklistPeer { peer, reply } => {
                self.blacklist.insert(peer);
                let _ = reply.send(());
            }
            Command::EnoughPeers {
                topic,
                suggested,
                reply,
            } => {
                let (router, ctx) = self.split();
                let _ = reply.send(router.enough_peers(&ctx, &topic, suggested));
            }
            Command::MeshPeers { topic, reply } => {
                let _ = reply.send(self.router.mesh_snapshot(&topic));
            }
            Command::TopicPeers { topic, reply } => {
                let peers = self
                    .topics
                    .get(&topic)
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(peers);
            }
            Command::PeerScore { peer, reply } => {
                let _ = reply.send(self.score.snapshot(&peer));
            }
            #[cfg(test)]
            Command::Eval { f, reply } => {
                f(self);
                let _ = reply.send(());
            }
            Command::Shutdown => unreachable!("handled by the select loop"),
        }
    }

    fn join(&mut self, topic: &str) {
        if !self.joined.insert(topic.to_string()) {
            return;
        }
        self.announce(topic, true);
        let (router, mut ctx) = self.split();
        router.join(&mut ctx, topic);
    }

    fn leave(&mut self, topic: &str) {
        if !self.joined.remove(topic) {
            return;
        }
        let (router, mut ctx) = self.split();
        router.leave(&mut ctx, topic);
        self.announce(topic, false);
    }

    /// Tell every connected peer about a local (un)subscription.
    fn announce(&mut self, topic: &str, subscribe: bool) {
        let frame = RpcFrame::subscription(topic, subscribe);
        let peers: Vec<PeerId> = self.peers.keys().copied().collect();
        for peer in peers {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.send(&peer, frame.clone(), &self.tracer);
            }
        }
    }

    fn message_id(&self, msg: &Message) -> MessageId {
        match self.id_fns.get(&msg.topic) {
            Some(id_fn) => id_fn(msg),
            None => MessageId::from_origin(&msg.from, msg.seqno),
        }
    }

    fn publish(&mut self, topic: &str, data: Vec<u8>) -> Result<MessageId, PublishError> {
        if data.len() > self.config.max_message_size {
            return Err(PublishError::TooLarge {
                size: data.len(),
                limit: self.config.max_message_size,
            });
        }
        if !self.config.publish_if_no_peers
            && self.topics.get(topic).map(|m| m.len()).unwrap_or(0) == 0
        {
            return Err(PublishError::NoPeers);
        }

        self.seqno = self.seqno.wrapping_add(1);
        let seqno = self.seqno;
        let signature = self
            .config
            .sign_messages
            .then(|| self.keypair.sign_message(topic, seqno, &data));
        let msg = Message {
            from: self.local,
            seqno,
            topic: topic.to_string(),
            data,
            signature,
            key: None,
        };
        let id = self.message_id(&msg);
        if !self.seen.insert(id.clone()) {
            return Err(PublishError::Duplicate);
        }

        self.router.message_accepted(&id, &msg);
        if !self.config.discard_own {
            self.registry.deliver(&msg, &self.tracer);
        }

        let joined = self.joined.contains(topic);
        let targets = {
            let (router, mut ctx) = self.split();
            router.publish_targets(&mut ctx, topic, joined)
        };
        let frame = RpcFrame::publish(msg);
        for peer in targets {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.send(&peer, frame.clone(), &self.tracer);
            }
        }
        self.tracer.emit(TraceEvent::PublishMessage {
            id: id.clone(),
            topic: topic.to_string(),
        });
        Ok(id)
    }

    fn handle_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::PeerConnected { peer, outbound, addr } => {
                if peer == self.local || self.peers.contains_key(&peer) {
                    return;
                }
                let direct = self.config.direct_peers.contains(&peer);
                let capacity = if direct {
                    self.config.peer_queue_len * 4
                } else {
                    self.config.peer_queue_len
                };
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let writer = spawn_writer(
                    self.host.clone(),
                    peer,
                    self.local_protocol(),
                    rx,
                    self.config.max_transmission_size,
                    self.conn_sem.clone(),
                );
                let mut record = PeerRecord::new(tx, writer, outbound, addr);

                // Catch the peer up on our subscriptions.
                if !self.joined.is_empty() {
                    let frame = RpcFrame {
                        subscriptions: self
                            .joined
                            .iter()
                            .map(|topic| SubOpts {
                                subscribe: true,
                                topic: topic.clone(),
                            })
                            .collect(),
                        ..Default::default()
                    };
                    record.send(&peer, frame, &self.tracer);
                }

                self.peers.insert(peer, record);
                self.score.add_peer(peer, addr);
                self.tracer.emit(TraceEvent::AddPeer { peer });
                trace!(peer = %peer, outbound, "peer connected");
            }
            HostEvent::PeerDisconnected { peer } => {
                self.remove_peer(&peer);
            }
            HostEvent::InboundStream {
                peer,
                protocol,
                stream,
            } => {
                let Some(record) = self.peers.get_mut(&peer) else {
                    trace!(peer = %peer, "inbound stream from unknown peer dropped");
                    return;
                };
                if PeerKind::from_protocol(protocol) == PeerKind::Mesh {
                    record.kind = PeerKind::Mesh;
                }
                record.state = PeerState::Connected;
                spawn_reader(
                    peer,
                    stream,
                    self.stream_tx.clone(),
                    self.config.max_transmission_size,
                );
            }
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        let Some(mut record) = self.peers.remove(peer) else {
            return;
        };
        record.state = PeerState::Disconnecting;
        record.shutdown();
        for topic in &record.topics {
            if let Some(members) = self.topics.get_mut(topic) {
                members.remove(peer);
            }
        }
        self.router.remove_peer(peer);
        self.score.remove_peer(peer);
        self.tracer.emit(TraceEvent::RemovePeer { peer: *peer });
        trace!(peer = %peer, state = ?record.state, addr = ?record.addr, "peer removed");
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Frame { peer, frame } => self.handle_rpc(peer, frame),
            StreamEvent::ProtocolViolation { peer, error } => {
                warn!(peer = %peer, error = %error, "protocol violation");
                self.score.add_penalty(&peer, 1.0);
            }
            StreamEvent::StreamClosed { peer } => {
                trace!(peer = %peer, "peer stream ended");
            }
        }
    }

    fn handle_rpc(&mut self, from: PeerId, frame: RpcFrame) {
        let Some(record) = self.peers.get_mut(&from) else {
            return;
        };
        record.state = PeerState::Connected;

        if self.blacklist.contains(&from) {
            for msg in &frame.messages {
                self.tracer.emit(TraceEvent::RejectMessage {
                    id: self.message_id(msg),
                    from,
                    reason: RejectReason::BlacklistedPeer,
                });
            }
            return;
        }
        if self.score.score(&from) < self.config.score_thresholds.graylist_threshold {
            self.tracer.emit(TraceEvent::GraylistPeer { peer: from });
            return;
        }

        for sub in frame.subscriptions {
            let record = self.peers.get_mut(&from);
            if sub.subscribe {
                self.topics
                    .entry(sub.topic.clone())
                    .or_default()
                    .insert(from);
                if let Some(record) = record {
                    record.topics.insert(sub.topic);
                }
            } else {
                if let Some(members) = self.topics.get_mut(&sub.topic) {
                    members.remove(&from);
                }
                if let Some(record) = record {
                    record.topics.remove(&sub.topic);
                }
                // Mesh repair, if needed, happens on the next heartbeat.
            }
        }

        for msg in frame.messages {
            self.handle_inbound_message(from, msg);
        }

        if let Some(control) = frame.control {
            let (router, mut ctx) = self.split();
            router.handle_control(&mut ctx, &from, control);
        }
    }

    fn handle_inbound_message(&mut self, from: PeerId, msg: Message) {
        let id = self.message_id(&msg);
        let topic = msg.topic.clone();

        if !self.joined.contains(&topic) {
            trace!(topic = %topic, from = %from, "message for unjoined topic dropped");
            return;
        }
        if msg.data.len() > self.config.max_message_size {
            self.score.reject(&from, &topic);
            self.tracer.emit(TraceEvent::RejectMessage {
                id,
                from,
                reason: RejectReason::ValidationError,
            });
            return;
        }
        if msg.from == self.local {
            self.tracer.emit(TraceEvent::RejectMessage {
                id,
                from,
                reason: RejectReason::SelfOrigin,
            });
            return;
        }
        if self.blacklist.contains(&msg.from) {
            self.score.reject(&from, &topic);
            self.tracer.emit(TraceEvent::RejectMessage {
                id,
                from,
                reason: RejectReason::BlacklistedSource,
            });
            return;
        }
        if self.seen.contains(&id) {
            self.score.duplicate_delivery(&from, &topic);
            self.tracer.emit(TraceEvent::DuplicateMessage { id, from });
            return;
        }

        // Strict-none: signed messages on an unsigned network are malformed.
        if !self.config.sign_messages && self.config.strict_signature_verification {
            if msg.signature.is_some() || msg.key.is_some() {
                self.score.reject(&from, &topic);
                self.tracer.emit(TraceEvent::RejectMessage {
                    id,
                    from,
                    reason: RejectReason::ValidationError,
                });
                return;
            }
        }

        let verify_signature = self.config.sign_messages;
        let validator = self
            .config
            .validate_messages
            .then(|| self.validators.get(&topic).cloned())
            .flatten();

        if verify_signature || validator.is_some() {
            let inflight = self.inflight.entry(topic.clone()).or_insert(0);
            if *inflight >= self.config.validate_throttle {
                self.tracer.emit(TraceEvent::RejectMessage {
                    id,
                    from,
                    reason: RejectReason::ValidationQueueFull,
                });
                return;
            }
            let request = ValidationRequest {
                from,
                msg,
                validator,
                verify_signature,
            };
            match self.pool.try_submit(request) {
                Ok(()) => {
                    *inflight += 1;
                }
                Err(_) => {
                    self.tracer.emit(TraceEvent::RejectMessage {
                        id,
                        from,
                        reason: RejectReason::ValidationQueueFull,
                    });
                }
            }
            return;
        }

        self.accept_message(from, msg, id);
    }

    fn handle_validation_outcome(&mut self, outcome: ValidationOutcome) {
        let ValidationOutcome { from, msg, verdict } = outcome;
        if let Some(inflight) = self.inflight.get_mut(&msg.topic) {
            *inflight = inflight.saturating_sub(1);
        }
        let id = self.message_id(&msg);
        match verdict {
            Verdict::Accept => self.accept_message(from, msg, id),
            Verdict::Reject(reason) => {
                if reason.penalizes() {
                    self.score.reject(&from, &msg.topic);
                }
                self.tracer.emit(TraceEvent::RejectMessage { id, from, reason });
            }
            Verdict::Ignore => {
                self.tracer.emit(TraceEvent::RejectMessage {
                    id,
                    from,
                    reason: RejectReason::ValidationIgnored,
                });
            }
        }
    }

    /// A message that passed dedup and validation: remember it, deliver it,
    /// forward it.
    fn accept_message(&mut self, from: PeerId, msg: Message, id: MessageId) {
        if !self.seen.insert(id.clone()) {
            // A twin beat us through validation.
            self.score.duplicate_delivery(&from, &msg.topic);
            self.tracer.emit(TraceEvent::DuplicateMessage { id, from });
            return;
        }
        self.score.first_delivery(&from, &msg.topic);
        self.router.message_accepted(&id, &msg);

        if self.registry.deliver(&msg, &self.tracer) > 0 {
            self.tracer.emit(TraceEvent::DeliverMessage {
                id: id.clone(),
                topic: msg.topic.clone(),
            });
        }

        let targets = {
            let (router, mut ctx) = self.split();
            router.forward_targets(&mut ctx, &msg.topic, &from, &msg.from)
        };
        if targets.is_empty() {
            return;
        }
        let frame = RpcFrame::publish(msg);
        for peer in targets {
            if let Some(record) = self.peers.get_mut(&peer) {
                record.send(&peer, frame.clone(), &self.tracer);
            }
        }
    }

    fn heartbeat(&mut self) {
        // Fold writer-queue overflow into the behaviour penalty.
        let overflows: Vec<(PeerId, u32)> = self
            .peers
            .iter_mut()
            .map(|(peer, record)| (*peer, record.take_overflow()))
            .filter(|(_, n)| *n > 0)
            .collect();
        for (peer, n) in overflows {
            self.score.add_penalty(&peer, f64::from(n) * 0.1);
        }

        let (router, mut ctx) = self.split();
        router.heartbeat(&mut ctx);

        self.seen.sweep(Instant::now());
    }
}
