//! Routing variants.
//!
//! The routing decision surface is a tagged variant: the gossip router keeps
//! a bounded per-topic mesh repaired by the heartbeat and backed by lazy
//! IHAVE/IWANT gossip; the flood router broadcasts to every subscribed peer;
//! the random-fanout router samples a uniform subset per message and keeps
//! no protocol state at all. All variants share the same pipeline and see
//! the same membership, score and peer tables through [`RouterCtx`].

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::cache::{MessageCache, SeenCache};
use crate::config::{Config, RoutingVariant};
use crate::identity::PeerId;
use crate::peer::{PeerKind, PeerRecord};
use crate::score::ScoreKeeper;
use crate::trace::{TraceEvent, Tracer};
use crate::wire::{
    ControlBlock, ControlGraft, ControlIHave, ControlIWant, ControlPrune, Message, MessageId,
    RpcFrame,
};

/// Candidate peers carried by a PRUNE, surfaced to the discovery sink.
#[derive(Clone, Debug)]
pub struct PeerExchange {
    pub topic: String,
    pub from: PeerId,
    pub peers: Vec<PeerId>,
}

/// Borrowed view of the event loop's shared state, rebuilt per call.
pub(crate) struct RouterCtx<'a> {
    pub config: &'a Config,
    pub local: PeerId,
    pub peers: &'a mut HashMap<PeerId, PeerRecord>,
    /// Remote membership: which connected peers announced each topic.
    pub topics: &'a HashMap<String, HashSet<PeerId>>,
    pub score: &'a mut ScoreKeeper,
    pub seen: &'a SeenCache,
    pub tracer: &'a Tracer,
    pub px_tx: Option<&'a mpsc::Sender<PeerExchange>>,
}

impl RouterCtx<'_> {
    fn send(&mut self, peer: &PeerId, frame: RpcFrame) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.send(peer, frame, self.tracer);
        }
    }

    fn members(&self, topic: &str) -> Vec<PeerId> {
        self.topics
            .get(topic)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn kind(&self, peer: &PeerId) -> Option<PeerKind> {
        self.peers.get(peer).map(|r| r.kind)
    }

    fn is_direct(&self, peer: &PeerId) -> bool {
        self.config.direct_peers.contains(peer)
    }
}

pub(crate) enum Router {
    Gossip(GossipRouter),
    Flood(FloodRouter),
    Random(RandomRouter),
}

impl Router {
    pub fn new(config: &Config) -> Self {
        match config.routing {
            RoutingVariant::Gossip => Self::Gossip(GossipRouter::new(config)),
            RoutingVariant::Flood => Self::Flood(FloodRouter),
            RoutingVariant::RandomFanout { network_size } => Self::Random(RandomRouter {
                degree: crate::config::DEFAULT_RANDOM_FANOUT_DEGREE,
                network_size,
            }),
        }
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Self::Gossip(g) = self {
            g.remove_peer(peer);
        }
    }

    pub fn join(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) {
        if let Self::Gossip(g) = self {
            g.join(ctx, topic);
        }
        ctx.tracer.emit(TraceEvent::Join {
            topic: topic.to_string(),
        });
    }

    pub fn leave(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) {
        if let Self::Gossip(g) = self {
            g.leave(ctx, topic);
        }
        ctx.tracer.emit(TraceEvent::Leave {
            topic: topic.to_string(),
        });
    }

    pub fn handle_control(&mut self, ctx: &mut RouterCtx<'_>, from: &PeerId, control: ControlBlock) {
        if let Self::Gossip(g) = self {
            g.handle_control(ctx, from, control);
        }
    }

    /// Record an accepted message for gossip and promise bookkeeping.
    pub fn message_accepted(&mut self, id: &MessageId, msg: &Message) {
        if let Self::Gossip(g) = self {
            g.mcache.put(id.clone(), msg.clone());
            g.fulfil_promises(id);
        }
    }

    /// Targets for a locally published message on `topic`.
    pub fn publish_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        joined: bool,
    ) -> HashSet<PeerId> {
        match self {
            Self::Gossip(g) => g.publish_targets(ctx, topic, joined),
            Self::Flood(f) => f.targets(ctx, topic, &[]),
            Self::Random(r) => r.targets(ctx, topic, &[]),
        }
    }

    /// Targets for forwarding a message received from `propagator`.
    pub fn forward_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        propagator: &PeerId,
        origin: &PeerId,
    ) -> HashSet<PeerId> {
        let exclude = [*propagator, *origin];
        match self {
            Self::Gossip(g) => g.forward_targets(ctx, topic, &exclude),
            Self::Flood(f) => f.targets(ctx, topic, &exclude),
            Self::Random(r) => r.targets(ctx, topic, &exclude),
        }
    }

    pub fn heartbeat(&mut self, ctx: &mut RouterCtx<'_>) {
        if let Self::Gossip(g) = self {
            g.heartbeat(ctx);
        }
    }

    /// Whether topic membership satisfies the variant's target. On the
    /// random-fanout variant this mirrors the original semantics exactly:
    /// `suggested == 0` falls back to the configured degree, and reaching
    /// the configured network size always satisfies.
    pub fn enough_peers(&self, ctx: &RouterCtx<'_>, topic: &str, suggested: usize) -> bool {
        let members = ctx.members(topic).len();
        match self {
            Self::Random(r) => {
                if members == 0 {
                    return false;
                }
                let want = if suggested == 0 { r.degree } else { suggested };
                members >= want || members >= r.network_size
            }
            _ => members >= suggested.max(1),
        }
    }

    #[cfg(test)]
    pub fn mesh(&self, topic: &str) -> Option<&HashSet<PeerId>> {
        match self {
            Self::Gossip(g) => g.mesh.get(topic),
            _ => None,
        }
    }

    pub fn mesh_snapshot(&self, topic: &str) -> Vec<PeerId> {
        match self {
            Self::Gossip(g) => g
                .mesh
                .get(topic)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

pub(crate) struct GossipRouter {
    mesh: HashMap<String, HashSet<PeerId>>,
    fanout: HashMap<String, HashSet<PeerId>>,
    fanout_last_pub: HashMap<String, Instant>,
    /// (topic, peer) → instant before which no GRAFT may be sent or accepted.
    backoff: HashMap<String, HashMap<PeerId, Instant>>,
    mcache: MessageCache,
    /// IWANTed message IDs per peer with their fulfilment deadlines.
    promises: HashMap<PeerId, HashMap<MessageId, Instant>>,
    // Per-heartbeat spam accounting, cleared on every tick.
    ihave_counts: HashMap<PeerId, usize>,
    iasked: HashMap<PeerId, usize>,
    iwant_sent: HashSet<PeerId>,
}

impl GossipRouter {
    fn new(config: &Config) -> Self {
        Self {
            mesh: HashMap::new(),
            fanout: HashMap::new(),
            fanout_last_pub: HashMap::new(),
            backoff: HashMap::new(),
            mcache: MessageCache::new(config.history_length, config.gossip_window),
            promises: HashMap::new(),
            ihave_counts: HashMap::new(),
            iasked: HashMap::new(),
            iwant_sent: HashSet::new(),
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        for members in self.mesh.values_mut() {
            members.remove(peer);
        }
        for members in self.fanout.values_mut() {
            members.remove(peer);
        }
        self.promises.remove(peer);
        self.ihave_counts.remove(peer);
        self.iasked.remove(peer);
        self.iwant_sent.remove(peer);
    }

    fn in_backoff(&self, topic: &str, peer: &PeerId) -> bool {
        self.backoff
            .get(topic)
            .and_then(|m| m.get(peer))
            .is_some_and(|until| Instant::now() < *until)
    }

    fn add_backoff(&mut self, topic: &str, peer: &PeerId, duration: std::time::Duration) {
        let until = Instant::now() + duration;
        let entry = self
            .backoff
            .entry(topic.to_string())
            .or_default()
            .entry(*peer)
            .or_insert(until);
        if *entry < until {
            *entry = until;
        }
    }

    /// Mesh candidates: subscribed, mesh-capable, connected, not direct, not
    /// backed off, not already members, score at least zero.
    fn graft_candidates(
        &self,
        ctx: &RouterCtx<'_>,
        topic: &str,
        exclude: &HashSet<PeerId>,
    ) -> Vec<PeerId> {
        ctx.members(topic)
            .into_iter()
            .filter(|p| {
                !exclude.contains(p)
                    && ctx.kind(p) == Some(PeerKind::Mesh)
                    && !ctx.is_direct(p)
                    && !self.in_backoff(topic, p)
                    && ctx.score.score(p) >= 0.0
            })
            .collect()
    }

    fn join(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) {
        if self.mesh.contains_key(topic) {
            return;
        }
        // Seed the mesh from the fanout set where one exists; the peers
        // there already passed the publish gate.
        let mut members: HashSet<PeerId> = self
            .fanout
            .remove(topic)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| !self.in_backoff(topic, p) && ctx.score.score(p) >= 0.0)
            .collect();
        self.fanout_last_pub.remove(topic);

        let d = ctx.config.mesh_degree;
        if members.len() < d {
            let mut candidates = self.graft_candidates(ctx, topic, &members);
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(d - members.len());
            members.extend(candidates);
        }

        for peer in &members {
            ctx.score.graft(peer, topic);
            ctx.tracer.emit(TraceEvent::Graft {
                peer: *peer,
                topic: topic.to_string(),
            });
            ctx.send(
                peer,
                RpcFrame::control(ControlBlock {
                    graft: vec![ControlGraft {
                        topic: topic.to_string(),
                    }],
                    ..Default::default()
                }),
            );
        }
        debug!(topic = %topic, mesh = members.len(), "joined topic");
        self.mesh.insert(topic.to_string(), members);
    }

    fn leave(&mut self, ctx: &mut RouterCtx<'_>, topic: &str) {
        let Some(members) = self.mesh.remove(topic) else {
            return;
        };
        for peer in members {
            self.send_prune(ctx, topic, &peer, true);
            ctx.score.prune(&peer, topic);
        }
        debug!(topic = %topic, "left topic");
    }

    fn send_prune(&mut self, ctx: &mut RouterCtx<'_>, topic: &str, peer: &PeerId, do_px: bool) {
        let px = if do_px && ctx.score.score(peer) >= 0.0 {
            let mut candidates: Vec<PeerId> = ctx
                .members(topic)
                .into_iter()
                .filter(|p| p != peer && ctx.score.score(p) >= 0.0)
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(ctx.config.prune_peers);
            candidates
        } else {
            Vec::new()
        };
        self.add_backoff(topic, peer, ctx.config.prune_backoff);
        ctx.tracer.emit(TraceEvent::Prune {
            peer: *peer,
            topic: topic.to_string(),
        });
        ctx.send(
            peer,
            RpcFrame::control(ControlBlock {
                prune: vec![ControlPrune {
                    topic: topic.to_string(),
                    peers: px,
                    backoff_secs: Some(ctx.config.prune_backoff.as_secs()),
                }],
                ..Default::default()
            }),
        );
    }

    fn handle_control(&mut self, ctx: &mut RouterCtx<'_>, from: &PeerId, control: ControlBlock) {
        // Flood-class peers have no business sending control.
        if ctx.kind(from) != Some(PeerKind::Mesh) {
            return;
        }
        for graft in control.graft {
            self.handle_graft(ctx, from, &graft.topic);
        }
        for prune in control.prune {
            self.handle_prune(ctx, from, prune);
        }
        if !control.ihave.is_empty() {
            self.handle_ihave(ctx, from, control.ihave);
        }
        for iwant in control.iwant {
            self.handle_iwant(ctx, from, iwant.message_ids);
        }
    }

    fn handle_graft(&mut self, ctx: &mut RouterCtx<'_>, from: &PeerId, topic: &str) {
        let joined = self.mesh.contains_key(topic);
        if joined {
            if self.mesh.get(topic).is_some_and(|m| m.contains(from)) {
                return;
            }
            if self.in_backoff(topic, from) {
                // Grafting through an active backoff is a protocol
                // violation; the repeat offender earns a longer one.
                trace!(peer = %from, topic = %topic, "graft during backoff");
                ctx.score.add_penalty(from, 1.0);
                self.add_backoff(topic, from, ctx.config.prune_backoff * 2);
                self.send_prune(ctx, topic, from, false);
                return;
            }
            let mesh_full = self
                .mesh
                .get(topic)
                .is_some_and(|m| m.len() >= ctx.config.mesh_degree_high);
            let score = ctx.score.score(from);
            if score < 0.0 || mesh_full {
                self.send_prune(ctx, topic, from, score >= 0.0);
                return;
            }
            if let Some(members) = self.mesh.get_mut(topic) {
                members.insert(*from);
            }
            ctx.score.graft(from, topic);
            ctx.tracer.emit(TraceEvent::Graft {
                peer: *from,
                topic: topic.to_string(),
            });
        } else {
            // Not joined: refuse with a prune, no penalty.
            self.send_prune(ctx, topic, from, false);
        }
    }

    fn handle_prune(&mut self, ctx: &mut RouterCtx<'_>, from: &PeerId, prune: ControlPrune) {
        let topic = prune.topic;
        if let Some(members) = self.mesh.get_mut(&topic) {
            if members.remove(from) {
                ctx.score.prune(from, &topic);
                ctx.tracer.emit(TraceEvent::Prune {
                    peer: *from,
                    topic: topic.clone(),
                });
            }
        }
        let declared = prune
            .backoff_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or_default();
        self.add_backoff(&topic, from, declared.max(ctx.config.prune_backoff));

        if !prune.peers.is_empty() {
            let score = ctx.score.score(from);
            if score >= ctx.config.score_thresholds.accept_px_threshold {
                ctx.tracer.emit(TraceEvent::PeerExchange {
                    from: *from,
                    topic: topic.clone(),
                    peers: prune.peers.clone(),
                });
                if let Some(px_tx) = ctx.px_tx {
                    let _ = px_tx.try_send(PeerExchange {
                        topic,
                        from: *from,
                        peers: prune.peers,
                    });
                }
            } else {
                trace!(peer = %from, score, "peer exchange refused below threshold");
            }
        }
    }

    fn handle_ihave(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        from: &PeerId,
        ihaves: Vec<ControlIHave>,
    ) {
        if ctx.score.score(from) < ctx.config.score_thresholds.gossip_threshold {
            return;
        }
        let count = self.ihave_counts.entry(*from).or_insert(0);
        *count += ihaves.len();
        if *count > ctx.config.max_ihave_messages {
            trace!(peer = %from, advertisements = *count, "too many IHAVEs this heartbeat");
            ctx.score.add_penalty(from, 1.0);
            return;
        }
        // One IWANT per peer per heartbeat.
        if self.iwant_sent.contains(from) {
            return;
        }

        let asked = self.iasked.entry(*from).or_insert(0);
        let mut budget = ctx.config.max_ihave_length.saturating_sub(*asked);
        let mut wanted: Vec<MessageId> = Vec::new();
        let mut truncated = false;
        for ihave in ihaves {
            if !self.mesh.contains_key(&ihave.topic) {
                continue;
            }
            for id in ihave.message_ids {
                if ctx.seen.contains(&id) || self.mcache.contains(&id) {
                    continue;
                }
                if budget == 0 {
                    truncated = true;
                    break;
                }
                budget -= 1;
                wanted.push(id);
            }
        }
        if truncated {
            // An advertisement big enough to blow the per-heartbeat budget
            // is spam.
            ctx.score.add_penalty(from, 1.0);
        }
        if wanted.is_empty() {
            return;
        }
        *self.iasked.entry(*from).or_insert(0) += wanted.len();
        self.iwant_sent.insert(*from);

        let deadline = Instant::now() + ctx.config.followup_time;
        let promises = self.promises.entry(*from).or_default();
        for id in &wanted {
            promises.entry(id.clone()).or_insert(deadline);
        }

        trace!(peer = %from, wanted = wanted.len(), "requesting gossiped messages");
        ctx.send(
            from,
            RpcFrame::control(ControlBlock {
                iwant: vec![ControlIWant {
                    message_ids: wanted,
                }],
                ..Default::default()
            }),
        );
    }

    fn handle_iwant(&mut self, ctx: &mut RouterCtx<'_>, from: &PeerId, ids: Vec<MessageId>) {
        if ctx.score.score(from) < ctx.config.score_thresholds.gossip_threshold {
            return;
        }
        let mut out = Vec::new();
        for id in ids.into_iter().take(ctx.config.max_ihave_length) {
            if let Some(msg) =
                self.mcache
                    .get_for_peer(&id, from, ctx.config.gossip_retransmission)
            {
                out.push(msg);
            }
        }
        if out.is_empty() {
            return;
        }
        trace!(peer = %from, count = out.len(), "serving IWANT from message cache");
        ctx.send(
            from,
            RpcFrame {
                messages: out,
                ..Default::default()
            },
        );
    }

    fn fulfil_promises(&mut self, id: &MessageId) {
        for promises in self.promises.values_mut() {
            promises.remove(id);
        }
    }

    fn publish_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        joined: bool,
    ) -> HashSet<PeerId> {
        let publish_threshold = ctx.config.score_thresholds.publish_threshold;
        let mut targets: HashSet<PeerId> = HashSet::new();

        if joined {
            if let Some(members) = self.mesh.get(topic) {
                targets.extend(members.iter().copied());
            }
            // Flood publishing: every other member above the publish gate
            // also gets the message, which keeps delivery robust while the
            // mesh is still forming.
            for peer in ctx.members(topic) {
                if targets.contains(&peer) {
                    continue;
                }
                if ctx.is_direct(&peer) || ctx.score.score(&peer) >= publish_threshold {
                    targets.insert(peer);
                }
            }
        } else {
            let now = Instant::now();
            let expired = self
                .fanout_last_pub
                .get(topic)
                .is_some_and(|last| now.saturating_duration_since(*last) > ctx.config.fanout_ttl);
            if expired {
                self.fanout.remove(topic);
            }
            let existing = self.fanout.get(topic).map(|f| f.len()).unwrap_or(0);
            if existing < ctx.config.mesh_degree {
                let current = self.fanout.entry(topic.to_string()).or_default();
                let mut candidates: Vec<PeerId> = ctx
                    .members(topic)
                    .into_iter()
                    .filter(|p| !current.contains(p))
                    .filter(|p| ctx.score.score(p) >= publish_threshold)
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(ctx.config.mesh_degree - current.len());
                current.extend(candidates);
            }
            self.fanout_last_pub.insert(topic.to_string(), now);
            if let Some(fanout) = self.fanout.get(topic) {
                targets.extend(fanout.iter().copied());
            }
        }

        // Direct peers always receive own publishes.
        for peer in &ctx.config.direct_peers {
            if ctx.peers.contains_key(peer) {
                targets.insert(*peer);
            }
        }
        targets.remove(&ctx.local);
        targets
    }

    fn forward_targets(
        &mut self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        exclude: &[PeerId],
    ) -> HashSet<PeerId> {
        let mut targets: HashSet<PeerId> = HashSet::new();
        if let Some(members) = self.mesh.get(topic) {
            targets.extend(members.iter().copied());
        }
        // Flood-only peers cannot hold mesh membership but still receive
        // every message for topics they subscribed to.
        for peer in ctx.members(topic) {
            if ctx.kind(&peer) == Some(PeerKind::Flood) || ctx.is_direct(&peer) {
                targets.insert(peer);
            }
        }
        for peer in exclude {
            targets.remove(peer);
        }
        targets.remove(&ctx.local);
        targets
    }

    fn heartbeat(&mut self, ctx: &mut RouterCtx<'_>) {
        let config = ctx.config;
        let d = config.mesh_degree;
        let d_lo = config.mesh_degree_low;
        let d_hi = config.mesh_degree_high;
        let d_score = config.mesh_degree_score;
        let d_out = config.mesh_degree_out;
        let now = Instant::now();

        let topics: Vec<String> = self.mesh.keys().cloned().collect();
        for topic in topics {
            let mut to_prune: Vec<PeerId> = Vec::new();
            let mut to_graft: Vec<PeerId> = Vec::new();

            // Drop members that vanished, unsubscribed or fell below zero.
            let members_now: Vec<PeerId> = self
                .mesh
                .get(&topic)
                .map(|m| m.iter().copied().collect())
                .unwrap_or_default();
            for peer in members_now {
                let gone = !ctx.peers.contains_key(&peer)
                    || !ctx
                        .topics
                        .get(&topic)
                        .is_some_and(|members| members.contains(&peer));
                let bad = !ctx.is_direct(&peer) && ctx.score.score(&peer) < 0.0;
                if gone {
                    if let Some(m) = self.mesh.get_mut(&topic) {
                        m.remove(&peer);
                    }
                    ctx.score.prune(&peer, &topic);
                } else if bad {
                    to_prune.push(peer);
                }
            }
            for peer in to_prune.drain(..) {
                if let Some(m) = self.mesh.get_mut(&topic) {
                    m.remove(&peer);
                }
                ctx.score.prune(&peer, &topic);
                self.send_prune(ctx, &topic, &peer, false);
            }

            let size = self.mesh.get(&topic).map(|m| m.len()).unwrap_or(0);

            // Under-populated: graft towards D.
            if size < d_lo {
                let current = self.mesh.get(&topic).cloned().unwrap_or_default();
                let mut candidates = self.graft_candidates(ctx, &topic, &current);
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(d.saturating_sub(size));
                to_graft.extend(candidates);
            }

            // Over-populated: keep the Dscore best, shed the rest down to D
            // while protecting outbound slots.
            if size > d_hi {
                let mut scored: Vec<(PeerId, f64)> = self
                    .mesh
                    .get(&topic)
                    .map(|m| {
                        m.iter()
                            .map(|p| (*p, ctx.score.score(p)))
                            .collect()
                    })
                    .unwrap_or_default();
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                let protected: HashSet<PeerId> =
                    scored.iter().take(d_score).map(|(p, _)| *p).collect();
                let mut shedable: Vec<PeerId> = scored
                    .iter()
                    .skip(d_score)
                    .map(|(p, _)| *p)
                    .filter(|p| !ctx.is_direct(p))
                    .collect();
                shedable.shuffle(&mut rand::thread_rng());

                let mut outbound_kept = self
                    .mesh
                    .get(&topic)
                    .map(|m| {
                        m.iter()
                            .filter(|p| ctx.peers.get(p).is_some_and(|r| r.outbound))
                            .count()
                    })
                    .unwrap_or(0);
                let mut size_now = size;
                for peer in shedable {
                    if size_now <= d {
                        break;
                    }
                    if protected.contains(&peer) {
                        continue;
                    }
                    let outbound = ctx.peers.get(&peer).is_some_and(|r| r.outbound);
                    if outbound && outbound_kept <= d_out {
                        continue;
                    }
                    if outbound {
                        outbound_kept -= 1;
                    }
                    if let Some(m) = self.mesh.get_mut(&topic) {
                        m.remove(&peer);
                    }
                    ctx.score.prune(&peer, &topic);
                    self.send_prune(ctx, &topic, &peer, true);
                    size_now -= 1;
                }
            }

            // Opportunistic grafting: when the mesh median sags, pull in a
            // couple of demonstrably better peers.
            let mesh_scores: Vec<f64> = self
                .mesh
                .get(&topic)
                .map(|m| m.iter().map(|p| ctx.score.score(p)).collect())
                .unwrap_or_default();
            if mesh_scores.len() >= 2 {
                let mut sorted = mesh_scores.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let median = sorted[sorted.len() / 2];
                if median < config.score_thresholds.opportunistic_graft_threshold {
                    let current = self.mesh.get(&topic).cloned().unwrap_or_default();
                    let mut candidates: Vec<PeerId> = self
                        .graft_candidates(ctx, &topic, &current)
                        .into_iter()
                        .filter(|p| ctx.score.score(p) > median)
                        .collect();
                    candidates.shuffle(&mut rand::thread_rng());
                    candidates.truncate(config.opportunistic_graft_peers);
                    if !candidates.is_empty() {
                        debug!(topic = %topic, median, grafting = candidates.len(),
                            "opportunistic graft");
                        to_graft.extend(candidates);
                    }
                }
            }

            for peer in to_graft {
                if let Some(m) = self.mesh.get_mut(&topic) {
                    if !m.insert(peer) {
                        continue;
                    }
                }
                ctx.score.graft(&peer, &topic);
                ctx.tracer.emit(TraceEvent::Graft {
                    peer,
                    topic: topic.clone(),
                });
                ctx.send(
                    &peer,
                    RpcFrame::control(ControlBlock {
                        graft: vec![ControlGraft {
                            topic: topic.clone(),
                        }],
                        ..Default::default()
                    }),
                );
            }
        }

        // Fanout upkeep: expire idle sets, refill live ones to D.
        let expired: Vec<String> = self
            .fanout_last_pub
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > config.fanout_ttl)
            .map(|(t, _)| t.clone())
            .collect();
        for topic in expired {
            self.fanout.remove(&topic);
            self.fanout_last_pub.remove(&topic);
        }
        let fanout_topics: Vec<String> = self.fanout.keys().cloned().collect();
        for topic in fanout_topics {
            let current = self.fanout.get(&topic).cloned().unwrap_or_default();
            // Shed members that unsubscribed or fell below the publish gate.
            let keep: HashSet<PeerId> = current
                .into_iter()
                .filter(|p| {
                    ctx.topics
                        .get(&topic)
                        .is_some_and(|members| members.contains(p))
                        && ctx.score.score(p) >= config.score_thresholds.publish_threshold
                })
                .collect();
            let missing = d.saturating_sub(keep.len());
            let mut refilled = keep;
            if missing > 0 {
                let mut candidates: Vec<PeerId> = ctx
                    .members(&topic)
                    .into_iter()
                    .filter(|p| !refilled.contains(p))
                    .filter(|p| ctx.score.score(p) >= config.score_thresholds.publish_threshold)
                    .collect();
                candidates.shuffle(&mut rand::thread_rng());
                candidates.truncate(missing);
                refilled.extend(candidates);
            }
            self.fanout.insert(topic, refilled);
        }

        self.emit_gossip(ctx);
        self.settle_promises(ctx, now);

        // Shift the message-cache ring and expire stale backoff.
        self.mcache.shift();
        for per_topic in self.backoff.values_mut() {
            per_topic.retain(|_, until| *until > now);
        }
        self.backoff.retain(|_, m| !m.is_empty());
        self.ihave_counts.clear();
        self.iasked.clear();
        self.iwant_sent.clear();
    }

    /// IHAVE emission: for every topic with recent traffic, tell a random
    /// slice of the non-mesh membership what we have.
    fn emit_gossip(&mut self, ctx: &mut RouterCtx<'_>) {
        let gossip_threshold = ctx.config.score_thresholds.gossip_threshold;
        let topics: Vec<String> = self
            .mesh
            .keys()
            .chain(self.fanout.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for topic in topics {
            let mut ids = self.mcache.gossip_ids(&topic);
            if ids.is_empty() {
                continue;
            }
            let exclude = self.mesh.get(&topic).cloned().unwrap_or_default();
            let mut candidates: Vec<PeerId> = ctx
                .members(&topic)
                .into_iter()
                .filter(|p| {
                    !exclude.contains(p)
                        && ctx.kind(p) == Some(PeerKind::Mesh)
                        && ctx.score.score(p) >= gossip_threshold
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let mut target =
                (ctx.config.gossip_factor * candidates.len() as f64).ceil() as usize;
            if target < ctx.config.gossip_degree {
                target = ctx.config.gossip_degree;
            }
            candidates.shuffle(&mut rand::thread_rng());
            candidates.truncate(target);

            ids.shuffle(&mut rand::thread_rng());
            ids.truncate(ctx.config.max_ihave_length);

            for peer in candidates {
                ctx.send(
                    &peer,
                    RpcFrame::control(ControlBlock {
                        ihave: vec![ControlIHave {
                            topic: topic.clone(),
                            message_ids: ids.clone(),
                        }],
                        ..Default::default()
                    }),
                );
            }
        }
    }

    /// Broken-promise accounting: an IWANT the peer never answered within
    /// the follow-up window costs behaviour penalty.
    fn settle_promises(&mut self, ctx: &mut RouterCtx<'_>, now: Instant) {
        let mut broken: Vec<(PeerId, usize)> = Vec::new();
        for (peer, promises) in self.promises.iter_mut() {
            let before = promises.len();
            promises.retain(|_, deadline| *deadline > now);
            let expired = before - promises.len();
            if expired > 0 {
                broken.push((*peer, expired));
            }
        }
        self.promises.retain(|_, p| !p.is_empty());
        for (peer, count) in broken {
            trace!(peer = %peer, count, "gossip promises broken");
            ctx.tracer.emit(TraceEvent::BrokenPromise { peer });
            ctx.score.add_penalty(&peer, count as f64);
        }
    }
}

pub(crate) struct FloodRouter;

impl FloodRouter {
    fn targets(
        &self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        exclude: &[PeerId],
    ) -> HashSet<PeerId> {
        let mut targets: HashSet<PeerId> = ctx
            .members(topic)
            .into_iter()
            .filter(|p| {
                ctx.is_direct(p)
                    || ctx.score.score(p) >= ctx.config.score_thresholds.publish_threshold
            })
            .collect();
        for peer in exclude {
            targets.remove(peer);
        }
        targets.remove(&ctx.local);
        targets
    }
}

pub(crate) struct RandomRouter {
    degree: usize,
    network_size: usize,
}

impl RandomRouter {
    /// All members when small; otherwise degree + ceil(sqrt(size − degree))
    /// uniformly sampled members.
    fn targets(
        &self,
        ctx: &mut RouterCtx<'_>,
        topic: &str,
        exclude: &[PeerId],
    ) -> HashSet<PeerId> {
        let mut members: Vec<PeerId> = ctx
            .members(topic)
            .into_iter()
            .filter(|p| {
                !exclude.contains(p)
                    && *p != ctx.local
                    && ctx.score.score(p) >= ctx.config.score_thresholds.publish_threshold
            })
            .collect();
        if members.len() > self.degree {
            let extra = ((self.network_size.saturating_sub(self.degree)) as f64)
                .sqrt()
                .ceil() as usize;
            let target = (self.degree + extra).min(members.len());
            members.shuffle(&mut rand::thread_rng());
            members.truncate(target);
        }
        members.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::identity::Keypair;
    use crate::peer::PeerRecord;
    use std::time::Duration;
    use tokio::sync::mpsc as tokio_mpsc;

    fn peer(seed: u8) -> PeerId {
        Keypair::from_seed([seed; 32]).peer_id()
    }

    struct Fixture {
        config: Config,
        local: PeerId,
        peers: HashMap<PeerId, PeerRecord>,
        topics: HashMap<String, HashSet<PeerId>>,
        score: ScoreKeeper,
        seen: SeenCache,
        tracer: Tracer,
        queues: HashMap<PeerId, tokio_mpsc::Receiver<RpcFrame>>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = Config::default();
            Self {
                score: ScoreKeeper::new(config.score_params.clone()),
                seen: SeenCache::new(config.seen_ttl),
                config,
                local: peer(0),
                peers: HashMap::new(),
                topics: HashMap::new(),
                tracer: Tracer::default(),
                queues: HashMap::new(),
            }
        }

        fn add_mesh_peer(&mut self, seed: u8, topic: &str) -> PeerId {
            let id = peer(seed);
            let (tx, rx) = tokio_mpsc::channel(64);
            let writer = tokio::spawn(async {});
            let mut record = PeerRecord::new(tx, writer, seed % 2 == 0, None);
            record.kind = PeerKind::Mesh;
            record.topics.insert(topic.to_string());
            self.peers.insert(id, record);
            self.queues.insert(id, rx);
            self.topics.entry(topic.to_string()).or_default().insert(id);
            self.score.add_peer(id, None);
            id
        }

        fn ctx(&mut self) -> RouterCtx<'_> {
            RouterCtx {
                config: &self.config,
                local: self.local,
                peers: &mut self.peers,
                topics: &self.topics,
                score: &mut self.score,
                seen: &self.seen,
                tracer: &self.tracer,
                px_tx: None,
            }
        }

        fn drain(&mut self, peer: &PeerId) -> Vec<RpcFrame> {
            let mut frames = Vec::new();
            if let Some(rx) = self.queues.get_mut(peer) {
                while let Ok(frame) = rx.try_recv() {
                    frames.push(frame);
                }
            }
            frames
        }
    }

    #[tokio::test]
    async fn join_grafts_up_to_degree() {
        let mut fx = Fixture::new();
        for seed in 1..=10 {
            fx.add_mesh_peer(seed, "t");
        }
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");

        let mesh = router.mesh("t").unwrap();
        assert_eq!(mesh.len(), fx.config.mesh_degree);
        for member in mesh.clone() {
            let frames = fx.drain(&member);
            assert!(frames.iter().any(|f| f
                .control
                .as_ref()
                .is_some_and(|c| c.graft.iter().any(|g| g.topic == "t"))));
        }
    }

    #[tokio::test]
    async fn graft_respects_capacity_and_backoff() {
        let mut fx = Fixture::new();
        let candidate = fx.add_mesh_peer(1, "t");
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        fx.drain(&candidate);

        // Re-grafting an existing member is a no-op.
        router.handle_control(
            &mut fx.ctx(),
            &candidate,
            ControlBlock {
                graft: vec![ControlGraft { topic: "t".into() }],
                ..Default::default()
            },
        );
        assert!(fx.drain(&candidate).is_empty());

        // A pruned peer grafting before backoff expiry gets pruned again and
        // earns a behaviour penalty.
        if let Router::Gossip(g) = &mut router {
            g.mesh.get_mut("t").unwrap().remove(&candidate);
            g.add_backoff("t", &candidate, Duration::from_secs(60));
        }
        router.handle_control(
            &mut fx.ctx(),
            &candidate,
            ControlBlock {
                graft: vec![ControlGraft { topic: "t".into() }],
                ..Default::default()
            },
        );
        assert!(!router.mesh("t").unwrap().contains(&candidate));
        let frames = fx.drain(&candidate);
        assert!(frames.iter().any(|f| f
            .control
            .as_ref()
            .is_some_and(|c| !c.prune.is_empty())));
        let snap = fx.score.snapshot(&candidate).unwrap();
        assert!(snap.behaviour_penalty >= 1.0);
    }

    #[tokio::test]
    async fn graft_for_unjoined_topic_is_pruned() {
        let mut fx = Fixture::new();
        let p = fx.add_mesh_peer(1, "other");
        let mut router = Router::new(&fx.config);
        router.handle_control(
            &mut fx.ctx(),
            &p,
            ControlBlock {
                graft: vec![ControlGraft { topic: "t".into() }],
                ..Default::default()
            },
        );
        let frames = fx.drain(&p);
        assert!(frames.iter().any(|f| f
            .control
            .as_ref()
            .is_some_and(|c| c.prune.iter().any(|pr| pr.topic == "t"))));
    }

    #[tokio::test]
    async fn prune_installs_backoff_and_forwards_px() {
        let mut fx = Fixture::new();
        let p = fx.add_mesh_peer(1, "t");
        let suggested = peer(40);
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        assert!(router.mesh("t").unwrap().contains(&p));

        // Sender with zero score is below the accept-px default threshold:
        // mesh membership drops, px is discarded.
        let (px_tx, mut px_rx) = tokio_mpsc::channel(4);
        {
            let mut ctx = fx.ctx();
            ctx.px_tx = Some(&px_tx);
            router.handle_control(
                &mut ctx,
                &p,
                ControlBlock {
                    prune: vec![ControlPrune {
                        topic: "t".into(),
                        peers: vec![suggested],
                        backoff_secs: Some(1),
                    }],
                    ..Default::default()
                },
            );
        }
        assert!(!router.mesh("t").unwrap().contains(&p));
        assert!(px_rx.try_recv().is_err());

        if let Router::Gossip(g) = &router {
            assert!(g.in_backoff("t", &p));
        }
    }

    #[tokio::test]
    async fn ihave_triggers_single_iwant_with_promise() {
        let mut fx = Fixture::new();
        let p = fx.add_mesh_peer(1, "t");
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        fx.drain(&p);

        let ids = vec![MessageId(vec![1; 40]), MessageId(vec![2; 40])];
        router.handle_control(
            &mut fx.ctx(),
            &p,
            ControlBlock {
                ihave: vec![ControlIHave {
                    topic: "t".into(),
                    message_ids: ids.clone(),
                }],
                ..Default::default()
            },
        );
        let frames = fx.drain(&p);
        let iwants: Vec<_> = frames
            .iter()
            .filter_map(|f| f.control.as_ref())
            .flat_map(|c| c.iwant.iter())
            .collect();
        assert_eq!(iwants.len(), 1);
        assert_eq!(iwants[0].message_ids.len(), 2);

        // Second IHAVE in the same heartbeat window is not answered.
        router.handle_control(
            &mut fx.ctx(),
            &p,
            ControlBlock {
                ihave: vec![ControlIHave {
                    topic: "t".into(),
                    message_ids: vec![MessageId(vec![3; 40])],
                }],
                ..Default::default()
            },
        );
        assert!(fx.drain(&p).is_empty());
    }

    #[tokio::test]
    async fn iwant_served_from_cache_with_retransmission_cap() {
        let mut fx = Fixture::new();
        let p = fx.add_mesh_peer(1, "t");
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        fx.drain(&p);

        let origin = peer(9);
        let msg = Message {
            from: origin,
            seqno: 5,
            topic: "t".into(),
            data: vec![7],
            signature: None,
            key: None,
        };
        let id = MessageId::from_origin(&origin, 5);
        router.message_accepted(&id, &msg);

        for round in 0..fx.config.gossip_retransmission + 2 {
            router.handle_control(
                &mut fx.ctx(),
                &p,
                ControlBlock {
                    iwant: vec![ControlIWant {
                        message_ids: vec![id.clone()],
                    }],
                    ..Default::default()
                },
            );
            let frames = fx.drain(&p);
            let served = frames.iter().any(|f| f.messages.iter().any(|m| m.seqno == 5));
            if round < fx.config.gossip_retransmission {
                assert!(served, "round {round} should be served");
            } else {
                assert!(!served, "round {round} should be capped");
            }
        }
    }

    #[tokio::test]
    async fn heartbeat_prunes_negative_and_repairs_mesh() {
        let mut fx = Fixture::new();
        let bad = fx.add_mesh_peer(1, "t");
        for seed in 2..=9 {
            fx.add_mesh_peer(seed, "t");
        }
        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        // Make one mesh member deeply negative.
        if !router.mesh("t").unwrap().contains(&bad) {
            if let Router::Gossip(g) = &mut router {
                g.mesh.get_mut("t").unwrap().insert(bad);
            }
        }
        for _ in 0..5 {
            fx.score.reject(&bad, "t");
        }
        assert!(fx.score.score(&bad) < 0.0);

        router.heartbeat(&mut fx.ctx());
        assert!(!router.mesh("t").unwrap().contains(&bad));
        // Mesh repaired back towards D from the remaining candidates.
        assert!(router.mesh("t").unwrap().len() >= fx.config.mesh_degree_low.min(7));
    }

    #[tokio::test]
    async fn flood_only_peers_never_grafted_but_receive_forwards() {
        let mut fx = Fixture::new();
        let flooder = fx.add_mesh_peer(1, "t");
        fx.peers.get_mut(&flooder).unwrap().kind = PeerKind::Flood;
        let meshy = fx.add_mesh_peer(2, "t");

        let mut router = Router::new(&fx.config);
        router.join(&mut fx.ctx(), "t");
        assert!(!router.mesh("t").unwrap().contains(&flooder));
        assert!(router.mesh("t").unwrap().contains(&meshy));

        let origin = peer(9);
        let targets = router.forward_targets(&mut fx.ctx(), "t", &origin, &origin);
        assert!(targets.contains(&flooder));
    }

    #[tokio::test]
    async fn random_router_samples_and_reports_enough_peers() {
        let mut fx = Fixture::new();
        fx.config.routing = RoutingVariant::RandomFanout { network_size: 30 };
        for seed in 1..=40 {
            fx.add_mesh_peer(seed, "t");
        }
        let mut router = Router::new(&fx.config);

        let targets = router.publish_targets(&mut fx.ctx(), "t", true);
        let expected = 8 + ((30f64 - 8.0).sqrt().ceil() as usize);
        assert_eq!(targets.len(), expected);

        let ctx = fx.ctx();
        assert!(router.enough_peers(&ctx, "t", 0));
        assert!(router.enough_peers(&ctx, "t", 100)); // membership >= network size
        assert!(!router.enough_peers(&ctx, "missing", 0));
    }

    #[tokio::test]
    async fn fanout_publish_then_join_promotes_fanout() {
        let mut fx = Fixture::new();
        for seed in 1..=8 {
            fx.add_mesh_peer(seed, "t");
        }
        let mut router = Router::new(&fx.config);

        // Publishing without joining builds a fanout of D peers.
        let targets = router.publish_targets(&mut fx.ctx(), "t", false);
        assert_eq!(targets.len(), fx.config.mesh_degree);
        // Stable across publishes.
        let again = router.publish_targets(&mut fx.ctx(), "t", false);
        assert_eq!(targets, again);

        // Join seeds the mesh from the fanout.
        router.join(&mut fx.ctx(), "t");
        let mesh = router.mesh("t").unwrap();
        for p in &targets {
            assert!(mesh.contains(p));
        }
    }
}
