//! Per-peer behaviour scoring.
//!
//! Score is a pure function of decaying counters and a configured parameter
//! vector. Per-topic components: time in mesh (P1), first message deliveries
//! (P2), mesh delivery deficit (P3), mesh failure penalty (P3b), invalid
//! deliveries (P4). Peer-global components: application score (P5), IP
//! colocation (P6), behaviour penalty (P7). Counters for a disconnected peer
//! are retained for a grace period so a quick reconnect cannot shed a bad
//! record.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identity::PeerId;

/// Default decay interval assumed by [`score_parameter_decay`].
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(1);

/// Counter values below this snap to exactly zero after decay.
pub const DEFAULT_DECAY_TO_ZERO: f64 = 0.01;

/// How long a disconnected peer's counters are kept.
pub const DEFAULT_RETAIN_SCORE: Duration = Duration::from_secs(120);

/// Upper bound on tracked peers; the least recently touched record is
/// evicted first when an adversary churns identities.
const MAX_SCORED_PEERS: usize = 10_000;

/// Application-provided score hook (P5).
pub type AppScoreFn = Arc<dyn Fn(&PeerId) -> f64 + Send + Sync>;

/// Compute the per-tick decay factor for a counter with the given half-life
/// style target: after `decay` has elapsed at the default tick interval the
/// counter has fallen to [`DEFAULT_DECAY_TO_ZERO`].
pub fn score_parameter_decay(decay: Duration) -> f64 {
    score_parameter_decay_with_base(decay, DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_TO_ZERO)
}

pub fn score_parameter_decay_with_base(
    decay: Duration,
    base: Duration,
    decay_to_zero: f64,
) -> f64 {
    let ticks = decay.as_secs_f64() / base.as_secs_f64();
    decay_to_zero.powf(1.0 / ticks)
}

fn invalid_number(v: f64) -> bool {
    v.is_nan() || v.is_infinite()
}

/// A subnet in prefix notation, used for the colocation whitelist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl Subnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix_len.min(32));
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix_len.min(128));
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }
}

/// Score thresholds consulted by the router. The negative thresholds gate
/// progressively more interaction as a peer's score falls.
#[derive(Clone, Copy, Debug)]
pub struct PeerScoreThresholds {
    /// Below this, the peer receives no IHAVE gossip.
    pub gossip_threshold: f64,
    /// Below this, own publishes are not sent to the peer.
    pub publish_threshold: f64,
    /// Below this, every frame from the peer is dropped.
    pub graylist_threshold: f64,
    /// Peer-exchange records are only accepted from peers at or above this.
    pub accept_px_threshold: f64,
    /// Median mesh score below this triggers opportunistic grafting.
    pub opportunistic_graft_threshold: f64,
}

impl Default for PeerScoreThresholds {
    fn default() -> Self {
        Self {
            gossip_threshold: -25.0,
            publish_threshold: -50.0,
            graylist_threshold: -100.0,
            accept_px_threshold: 10.0,
            opportunistic_graft_threshold: 1.0,
        }
    }
}

impl PeerScoreThresholds {
    pub fn validate(&self) -> Result<(), String> {
        if self.gossip_threshold > 0.0 || invalid_number(self.gossip_threshold) {
            return Err(format!("invalid gossip threshold {}", self.gossip_threshold));
        }
        if self.publish_threshold > self.gossip_threshold || invalid_number(self.publish_threshold)
        {
            return Err(format!(
                "invalid publish threshold {} (gossip is {})",
                self.publish_threshold, self.gossip_threshold
            ));
        }
        if self.graylist_threshold > self.publish_threshold
            || invalid_number(self.graylist_threshold)
        {
            return Err(format!(
                "invalid graylist threshold {} (publish is {})",
                self.graylist_threshold, self.publish_threshold
            ));
        }
        if self.accept_px_threshold < 0.0 || invalid_number(self.accept_px_threshold) {
            return Err(format!(
                "invalid accept-px threshold {}",
                self.accept_px_threshold
            ));
        }
        if self.opportunistic_graft_threshold < 0.0
            || invalid_number(self.opportunistic_graft_threshold)
        {
            return Err(format!(
                "invalid opportunistic graft threshold {}",
                self.opportunistic_graft_threshold
            ));
        }
        Ok(())
    }
}

/// Per-topic score parameters.
#[derive(Clone, Debug)]
pub struct TopicScoreParams {
    pub topic_weight: f64,

    // P1.
    pub time_in_mesh_weight: f64,
    pub time_in_mesh_quantum: Duration,
    pub time_in_mesh_cap: f64,

    // P2.
    pub first_message_deliveries_weight: f64,
    pub first_message_deliveries_decay: f64,
    pub first_message_deliveries_cap: f64,

    // P3. Active only after a peer has been in the mesh for the activation
    // window; penalizes the squared deficit below the threshold.
    pub mesh_message_deliveries_weight: f64,
    pub mesh_message_deliveries_decay: f64,
    pub mesh_message_deliveries_cap: f64,
    pub mesh_message_deliveries_threshold: f64,
    pub mesh_message_deliveries_activation: Duration,

    // P3b.
    pub mesh_failure_penalty_weight: f64,
    pub mesh_failure_penalty_decay: f64,

    // P4.
    pub invalid_message_deliveries_weight: f64,
    pub invalid_message_deliveries_decay: f64,
}

impl Default for TopicScoreParams {
    fn default() -> Self {
        Self {
            topic_weight: 1.0,

            time_in_mesh_weight: 0.01,
            time_in_mesh_quantum: Duration::from_secs(1),
            time_in_mesh_cap: 3600.0,

            first_message_deliveries_weight: 1.0,
            first_message_deliveries_decay: score_parameter_decay(Duration::from_secs(10 * 60)),
            first_message_deliveries_cap: 100.0,

            // Disabled out of the box; topics opt in with a threshold that
            // matches their expected traffic.
            mesh_message_deliveries_weight: 0.0,
            mesh_message_deliveries_decay: score_parameter_decay(Duration::from_secs(60)),
            mesh_message_deliveries_cap: 100.0,
            mesh_message_deliveries_threshold: 1.0,
            mesh_message_deliveries_activation: Duration::from_secs(60),

            mesh_failure_penalty_weight: 0.0,
            mesh_failure_penalty_decay: score_parameter_decay(Duration::from_secs(60)),

            invalid_message_deliveries_weight: -10.0,
            invalid_message_deliveries_decay: score_parameter_decay(Duration::from_secs(10 * 60)),
        }
    }
}

impl TopicScoreParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.topic_weight < 0.0 || invalid_number(self.topic_weight) {
            return Err(format!("invalid topic weight {}", self.topic_weight));
        }
        if self.time_in_mesh_weight != 0.0 {
            if self.time_in_mesh_weight < 0.0 || invalid_number(self.time_in_mesh_weight) {
                return Err("invalid time-in-mesh weight".into());
            }
            if self.time_in_mesh_quantum.is_zero() {
                return Err("invalid time-in-mesh quantum".into());
            }
            if self.time_in_mesh_cap <= 0.0 || invalid_number(self.time_in_mesh_cap) {
                return Err("invalid time-in-mesh cap".into());
            }
        }
        if self.first_message_deliveries_weight != 0.0 {
            if self.first_message_deliveries_weight < 0.0
                || invalid_number(self.first_message_deliveries_weight)
            {
                return Err("invalid first-message-deliveries weight".into());
            }
            Self::check_decay(
                self.first_message_deliveries_decay,
                "first-message-deliveries",
            )?;
            if self.first_message_deliveries_cap <= 0.0
                || invalid_number(self.first_message_deliveries_cap)
            {
                return Err("invalid first-message-deliveries cap".into());
            }
        }
        if self.mesh_message_deliveries_weight != 0.0 {
            if self.mesh_message_deliveries_weight > 0.0
                || invalid_number(self.mesh_message_deliveries_weight)
            {
                return Err("invalid mesh-message-deliveries weight".into());
            }
            Self::check_decay(self.mesh_message_deliveries_decay, "mesh-message-deliveries")?;
            if self.mesh_message_deliveries_cap <= 0.0
                || invalid_number(self.mesh_message_deliveries_cap)
            {
                return Err("invalid mesh-message-deliveries cap".into());
            }
            if self.mesh_message_deliveries_threshold <= 0.0
                || invalid_number(self.mesh_message_deliveries_threshold)
            {
                return Err("invalid mesh-message-deliveries threshold".into());
            }
            if self.mesh_message_deliveries_activation < Duration::from_secs(1) {
                return Err("invalid mesh-message-deliveries activation".into());
            }
        }
        if self.mesh_failure_penalty_weight != 0.0 {
            if self.mesh_failure_penalty_weight > 0.0
                || invalid_number(self.mesh_failure_penalty_weight)
            {
                return Err("invalid mesh failure penalty weight".into());
            }
            Self::check_decay(self.mesh_failure_penalty_decay, "mesh-failure-penalty")?;
        }
        if self.invalid_message_deliveries_weight > 0.0
            || invalid_number(self.invalid_message_deliveries_weight)
        {
            return Err("invalid invalid-message-deliveries weight".into());
        }
        Self::check_decay(
            self.invalid_message_deliveries_decay,
            "invalid-message-deliveries",
        )?;
        Ok(())
    }

    fn check_decay(decay: f64, what: &str) -> Result<(), String> {
        if decay <= 0.0 || decay >= 1.0 || invalid_number(decay) {
            return Err(format!("invalid {what} decay {decay}"));
        }
        Ok(())
    }
}

/// Peer-global score parameters.
#[derive(Clone)]
pub struct PeerScoreParams {
    /// Per-topic parameters; topics not listed fall back to
    /// [`TopicScoreParams::default`].
    pub topics: HashMap<String, TopicScoreParams>,
    /// Cap on the summed topic contributions when positive; 0 disables.
    pub topic_score_cap: f64,

    pub app_specific: Option<AppScoreFn>,
    pub app_specific_weight: f64,

    pub ip_colocation_factor_weight: f64,
    pub ip_colocation_factor_threshold: usize,
    pub ip_colocation_whitelist: Vec<Subnet>,

    pub behaviour_penalty_weight: f64,
    pub behaviour_penalty_threshold: f64,
    pub behaviour_penalty_decay: f64,

    pub decay_interval: Duration,
    pub decay_to_zero: f64,
    /// Counter retention after disconnect.
    pub retain_score: Duration,
}

impl Default for PeerScoreParams {
    fn default() -> Self {
        Self {
            topics: HashMap::new(),
            topic_score_cap: 0.0,
            app_specific: None,
            app_specific_weight: 1.0,
            ip_colocation_factor_weight: -10.0,
            ip_colocation_factor_threshold: 1,
            ip_colocation_whitelist: Vec::new(),
            behaviour_penalty_weight: -10.0,
            behaviour_penalty_threshold: 0.0,
            behaviour_penalty_decay: score_parameter_decay(Duration::from_secs(10)),
            decay_interval: DEFAULT_DECAY_INTERVAL,
            decay_to_zero: DEFAULT_DECAY_TO_ZERO,
            retain_score: DEFAULT_RETAIN_SCORE,
        }
    }
}

impl PeerScoreParams {
    pub fn validate(&self) -> Result<(), String> {
        for (topic, params) in &self.topics {
            params
                .validate()
                .map_err(|e| format!("topic {topic}: {e}"))?;
        }
        if self.topic_score_cap < 0.0 || invalid_number(self.topic_score_cap) {
            return Err(format!("invalid topic score cap {}", self.topic_score_cap));
        }
        if self.ip_colocation_factor_weight > 0.0
            || invalid_number(self.ip_colocation_factor_weight)
        {
            return Err("invalid IP colocation weight".into());
        }
        if self.ip_colocation_factor_weight != 0.0 && self.ip_colocation_factor_threshold < 1 {
            return Err("invalid IP colocation threshold".into());
        }
        if self.behaviour_penalty_weight > 0.0 || invalid_number(self.behaviour_penalty_weight) {
            return Err("invalid behaviour penalty weight".into());
        }
        if self.behaviour_penalty_weight != 0.0 {
            TopicScoreParams::check_decay(self.behaviour_penalty_decay, "behaviour-penalty")?;
            if self.behaviour_penalty_threshold < 0.0
                || invalid_number(self.behaviour_penalty_threshold)
            {
                return Err("invalid behaviour penalty threshold".into());
            }
        }
        if self.decay_interval < Duration::from_millis(10) {
            return Err("decay interval too short".into());
        }
        if self.decay_to_zero <= 0.0 || self.decay_to_zero >= 1.0 {
            return Err(format!("invalid decay-to-zero {}", self.decay_to_zero));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
struct TopicStats {
    in_mesh: bool,
    graft_time: Option<Instant>,
    mesh_time: Duration,
    mesh_message_deliveries_active: bool,
    first_message_deliveries: f64,
    mesh_message_deliveries: f64,
    mesh_failure_penalty: f64,
    invalid_message_deliveries: f64,
}

#[derive(Clone, Debug)]
struct PeerStats {
    connected: bool,
    /// Purge deadline once disconnected.
    expire: Instant,
    topics: HashMap<String, TopicStats>,
    ips: Vec<IpAddr>,
    behaviour_penalty: f64,
}

impl PeerStats {
    fn new() -> Self {
        Self {
            connected: true,
            expire: Instant::now(),
            topics: HashMap::new(),
            ips: Vec::new(),
            behaviour_penalty: 0.0,
        }
    }
}

/// Read-only view of a peer's score state, for diagnostics and tests.
#[derive(Clone, Debug, Default)]
pub struct PeerScoreSnapshot {
    pub score: f64,
    pub behaviour_penalty: f64,
    /// invalid-message-deliveries counter per topic.
    pub invalid_deliveries: HashMap<String, f64>,
    pub first_deliveries: HashMap<String, f64>,
}

/// Owner of all score state; lives on the event loop.
pub(crate) struct ScoreKeeper {
    params: PeerScoreParams,
    default_topic_params: TopicScoreParams,
    peers: LruCache<PeerId, PeerStats>,
    ips: HashMap<IpAddr, HashSet<PeerId>>,
}

impl ScoreKeeper {
    pub fn new(params: PeerScoreParams) -> Self {
        let capacity = NonZeroUsize::new(MAX_SCORED_PEERS).expect("non-zero capacity");
        Self {
            params,
            default_topic_params: TopicScoreParams::default(),
            peers: LruCache::new(capacity),
            ips: HashMap::new(),
        }
    }

    fn topic_params(&self, topic: &str) -> &TopicScoreParams {
        self.params
            .topics
            .get(topic)
            .unwrap_or(&self.default_topic_params)
    }

    pub fn add_peer(&mut self, peer: PeerId, ip: Option<IpAddr>) {
        let stats = self.peers.get_or_insert_mut(peer, PeerStats::new);
        stats.connected = true;
        if let Some(ip) = ip {
            if !stats.ips.contains(&ip) {
                stats.ips.push(ip);
            }
            self.ips.entry(ip).or_default().insert(peer);
        }
    }

    /// Mark a peer disconnected; counters survive for `retain_score`.
    /// Leaving a mesh by disconnect counts as a mesh failure where a
    /// delivery deficit exists.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        let params_topics: Vec<(String, f64, bool)> = match self.peers.peek(peer) {
            Some(stats) => stats
                .topics
                .iter()
                .filter(|(_, t)| t.in_mesh)
                .map(|(name, t)| {
                    let p = self.topic_params(name);
                    let deficit =
                        (p.mesh_message_deliveries_threshold - t.mesh_message_deliveries).max(0.0);
                    (
                        name.clone(),
                        deficit,
                        t.mesh_message_deliveries_active,
                    )
                })
                .collect(),
            None => return,
        };
        if let Some(stats) = self.peers.get_mut(peer) {
            for (name, deficit, active) in params_topics {
                let t = stats.topics.entry(name).or_default();
                if active && deficit > 0.0 {
                    t.mesh_failure_penalty += deficit * deficit;
                }
                t.in_mesh = false;
                t.graft_time = None;
                t.mesh_time = Duration::ZERO;
                t.mesh_message_deliveries_active = false;
            }
            stats.connected = false;
            stats.expire = Instant::now() + self.params.retain_score;
        }
    }

    pub fn graft(&mut self, peer: &PeerId, topic: &str) {
        if let Some(stats) = self.peers.get_mut(peer) {
            let t = stats.topics.entry(topic.to_string()).or_default();
            t.in_mesh = true;
            t.graft_time = Some(Instant::now());
            t.mesh_time = Duration::ZERO;
            t.mesh_message_deliveries_active = false;
        }
    }

    /// Remove a peer from mesh accounting; a delivery deficit at prune time
    /// becomes a sticky mesh-failure penalty.
    pub fn prune(&mut self, peer: &PeerId, topic: &str) {
        let threshold = self.topic_params(topic).mesh_message_deliveries_threshold;
        if let Some(stats) = self.peers.get_mut(peer) {
            let t = stats.topics.entry(topic.to_string()).or_default();
            if t.mesh_message_deliveries_active {
                let deficit = (threshold - t.mesh_message_deliveries).max(0.0);
                if deficit > 0.0 {
                    t.mesh_failure_penalty += deficit * deficit;
                }
            }
            t.in_mesh = false;
            t.graft_time = None;
            t.mesh_time = Duration::ZERO;
            t.mesh_message_deliveries_active = false;
        }
    }

    pub fn first_delivery(&mut self, peer: &PeerId, topic: &str) {
        let (fmd_cap, mmd_cap) = {
            let p = self.topic_params(topic);
            (
                p.first_message_deliveries_cap,
                p.mesh_message_deliveries_cap,
            )
        };
        if let Some(stats) = self.peers.get_mut(peer) {
            let t = stats.topics.entry(topic.to_string()).or_default();
            t.first_message_deliveries = (t.first_message_deliveries + 1.0).min(fmd_cap);
            if t.in_mesh {
                t.mesh_message_deliveries = (t.mesh_message_deliveries + 1.0).min(mmd_cap);
            }
        }
    }

    /// Duplicates still credit mesh delivery for mesh members.
    pub fn duplicate_delivery(&mut self, peer: &PeerId, topic: &str) {
        let mmd_cap = self.topic_params(topic).mesh_message_deliveries_cap;
        if let Some(stats) = self.peers.get_mut(peer) {
            let t = stats.topics.entry(topic.to_string()).or_default();
            if t.in_mesh {
                t.mesh_message_deliveries = (t.mesh_message_deliveries + 1.0).min(mmd_cap);
            }
        }
    }

    pub fn reject(&mut self, peer: &PeerId, topic: &str) {
        if let Some(stats) = self.peers.get_mut(peer) {
            let t = stats.topics.entry(topic.to_string()).or_default();
            t.invalid_message_deliveries += 1.0;
        }
    }

    pub fn add_penalty(&mut self, peer: &PeerId, count: f64) {
        if let Some(stats) = self.peers.get_mut(peer) {
            stats.behaviour_penalty += count;
        }
    }

    /// Decay every counter and purge expired disconnected peers. Called on
    /// the decay timer.
    pub fn refresh(&mut self, now: Instant) {
        let decay_to_zero = self.params.decay_to_zero;
        let behaviour_decay = self.params.behaviour_penalty_decay;
        let topic_factors: HashMap<String, (f64, f64, f64, f64, Duration)> = self
            .peers
            .iter()
            .flat_map(|(_, s)| s.topics.keys())
            .map(|name| {
                let p = self.topic_params(name);
                (
                    name.clone(),
                    (
                        p.first_message_deliveries_decay,
                        p.mesh_message_deliveries_decay,
                        p.mesh_failure_penalty_decay,
                        p.invalid_message_deliveries_decay,
                        p.mesh_message_deliveries_activation,
                    ),
                )
            })
            .collect();

        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, s)| !s.connected && s.expire <= now)
            .map(|(p, _)| *p)
            .collect();
        for peer in expired {
            if let Some(stats) = self.peers.pop(&peer) {
                for ip in stats.ips {
                    if let Some(set) = self.ips.get_mut(&ip) {
                        set.remove(&peer);
                        if set.is_empty() {
                            self.ips.remove(&ip);
                        }
                    }
                }
            }
        }

        for (_, stats) in self.peers.iter_mut() {
            for (name, t) in stats.topics.iter_mut() {
                let Some((fmd, mmd, mfp, imd, activation)) = topic_factors.get(name) else {
                    continue;
                };
                t.first_message_deliveries *= fmd;
                if t.first_message_deliveries < decay_to_zero {
                    t.first_message_deliveries = 0.0;
                }
                t.mesh_message_deliveries *= mmd;
                if t.mesh_message_deliveries < decay_to_zero {
                    t.mesh_message_deliveries = 0.0;
                }
                t.mesh_failure_penalty *= mfp;
                if t.mesh_failure_penalty < decay_to_zero {
                    t.mesh_failure_penalty = 0.0;
                }
                t.invalid_message_deliveries *= imd;
                if t.invalid_message_deliveries < decay_to_zero {
                    t.invalid_message_deliveries = 0.0;
                }
                if t.in_mesh {
                    if let Some(graft_time) = t.graft_time {
                        t.mesh_time = now.saturating_duration_since(graft_time);
                        if t.mesh_time > *activation {
                            t.mesh_message_deliveries_active = true;
                        }
                    }
                }
            }
            stats.behaviour_penalty *= behaviour_decay;
            if stats.behaviour_penalty < decay_to_zero {
                stats.behaviour_penalty = 0.0;
            }
        }
    }

    /// The score function proper. Pure over retained state and parameters.
    pub fn score(&self, peer: &PeerId) -> f64 {
        let Some(stats) = self.peers.peek(peer) else {
            return 0.0;
        };

        let mut topic_sum = 0.0;
        for (name, t) in &stats.topics {
            let p = self.topic_params(name);
            let mut contribution = 0.0;

            if t.in_mesh {
                let quanta =
                    t.mesh_time.as_secs_f64() / p.time_in_mesh_quantum.as_secs_f64();
                contribution += quanta.min(p.time_in_mesh_cap) * p.time_in_mesh_weight;
            }

            contribution += t
                .first_message_deliveries
                .min(p.first_message_deliveries_cap)
                * p.first_message_deliveries_weight;

            if t.in_mesh && t.mesh_message_deliveries_active {
                let deficit = (p.mesh_message_deliveries_threshold - t.mesh_message_deliveries)
                    .max(0.0);
                contribution += deficit * deficit * p.mesh_message_deliveries_weight;
            }

            contribution += t.mesh_failure_penalty
                * t.mesh_failure_penalty
                * p.mesh_failure_penalty_weight;

            contribution += t.invalid_message_deliveries
                * t.invalid_message_deliveries
                * p.invalid_message_deliveries_weight;

            topic_sum += contribution * p.topic_weight;
        }
        if self.params.topic_score_cap > 0.0 && topic_sum > self.params.topic_score_cap {
            topic_sum = self.params.topic_score_cap;
        }

        let mut score = topic_sum;

        if let Some(app) = &self.params.app_specific {
            score += app(peer) * self.params.app_specific_weight;
        }

        score += self.colocation_factor(stats) * self.params.ip_colocation_factor_weight;

        let surplus = (stats.behaviour_penalty - self.params.behaviour_penalty_threshold).max(0.0);
        score += surplus * surplus * self.params.behaviour_penalty_weight;

        score
    }

    fn colocation_factor(&self, stats: &PeerStats) -> f64 {
        let mut factor = 0.0;
        'ips: for ip in &stats.ips {
            for subnet in &self.params.ip_colocation_whitelist {
                if subnet.contains(ip) {
                    continue 'ips;
                }
            }
            let count = self.ips.get(ip).map(|s| s.len()).unwrap_or(0);
            if count > self.params.ip_colocation_factor_threshold {
                let surplus = (count - self.params.ip_colocation_factor_threshold) as f64;
                factor += surplus * surplus;
            }
        }
        factor
    }

    pub fn snapshot(&self, peer: &PeerId) -> Option<PeerScoreSnapshot> {
        let stats = self.peers.peek(peer)?;
        Some(PeerScoreSnapshot {
            score: self.score(peer),
            behaviour_penalty: stats.behaviour_penalty,
            invalid_deliveries: stats
                .topics
                .iter()
                .map(|(k, t)| (k.clone(), t.invalid_message_deliveries))
                .collect(),
            first_deliveries: stats
                .topics
                .iter()
                .map(|(k, t)| (k.clone(), t.first_message_deliveries))
                .collect(),
        })
    }

    /// Whether counters are still retained for the peer.
    #[cfg(test)]
    pub fn retains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn keeper_with(topic: &str, params: TopicScoreParams) -> ScoreKeeper {
        let mut p = PeerScoreParams::default();
        p.topics.insert(topic.to_string(), params);
        ScoreKeeper::new(p)
    }

    #[test]
    fn decay_factor_matches_closed_form() {
        // decay to 0.01 over 10 ticks of 1s each
        let f = score_parameter_decay(Duration::from_secs(10));
        assert!((f.powi(10) - 0.01).abs() < 1e-9);
    }

    #[test]
    fn counters_decay_multiplicatively_and_snap_to_zero() {
        let mut params = TopicScoreParams::default();
        params.first_message_deliveries_decay = 0.5;
        let mut keeper = keeper_with("t", params);
        let p = peer(1);
        keeper.add_peer(p, None);
        for _ in 0..4 {
            keeper.first_delivery(&p, "t");
        }
        let now = Instant::now();
        keeper.refresh(now);
        let snap = keeper.snapshot(&p).unwrap();
        assert!((snap.first_deliveries["t"] - 2.0).abs() < 1e-9);

        // 2.0 * 0.5^8 = 0.0078 < decay_to_zero, snaps to zero
        for _ in 0..8 {
            keeper.refresh(now);
        }
        let snap = keeper.snapshot(&p).unwrap();
        assert_eq!(snap.first_deliveries["t"], 0.0);
    }

    #[test]
    fn invalid_deliveries_penalize_quadratically() {
        let keeper_params = TopicScoreParams {
            invalid_message_deliveries_weight: -1.0,
            time_in_mesh_weight: 0.0,
            first_message_deliveries_weight: 0.0,
            ..Default::default()
        };
        let mut keeper = keeper_with("t", keeper_params);
        let p = peer(2);
        keeper.add_peer(p, None);
        keeper.reject(&p, "t");
        keeper.reject(&p, "t");
        keeper.reject(&p, "t");
        assert!((keeper.score(&p) + 9.0).abs() < 1e-9);
    }

    #[test]
    fn first_deliveries_capped() {
        let params = TopicScoreParams {
            first_message_deliveries_weight: 1.0,
            first_message_deliveries_cap: 2.0,
            time_in_mesh_weight: 0.0,
            ..Default::default()
        };
        let mut keeper = keeper_with("t", params);
        let p = peer(3);
        keeper.add_peer(p, None);
        for _ in 0..10 {
            keeper.first_delivery(&p, "t");
        }
        assert!((keeper.score(&p) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn behaviour_penalty_applies_above_threshold() {
        let mut params = PeerScoreParams::default();
        params.behaviour_penalty_weight = -1.0;
        params.behaviour_penalty_threshold = 2.0;
        let mut keeper = ScoreKeeper::new(params);
        let p = peer(4);
        keeper.add_peer(p, None);
        keeper.add_penalty(&p, 2.0);
        assert_eq!(keeper.score(&p), 0.0);
        keeper.add_penalty(&p, 3.0);
        assert!((keeper.score(&p) + 9.0).abs() < 1e-9);
    }

    #[test]
    fn colocated_peers_penalized_beyond_threshold() {
        let mut params = PeerScoreParams::default();
        params.ip_colocation_factor_weight = -1.0;
        params.ip_colocation_factor_threshold = 1;
        let mut keeper = ScoreKeeper::new(params);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        for seed in 0..3 {
            keeper.add_peer(peer(seed), Some(ip));
        }
        // 3 peers on one address, threshold 1: surplus 2, squared
        assert!((keeper.score(&peer(0)) + 4.0).abs() < 1e-9);
    }

    #[test]
    fn whitelisted_subnet_exempt_from_colocation() {
        let mut params = PeerScoreParams::default();
        params.ip_colocation_factor_weight = -1.0;
        params.ip_colocation_whitelist =
            vec![Subnet::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8)];
        let mut keeper = ScoreKeeper::new(params);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3));
        for seed in 0..5 {
            keeper.add_peer(peer(seed), Some(ip));
        }
        assert_eq!(keeper.score(&peer(0)), 0.0);
    }

    #[test]
    fn score_retained_across_reconnect_and_purged_after() {
        let mut params = PeerScoreParams::default();
        params.retain_score = Duration::from_millis(50);
        let mut keeper = ScoreKeeper::new(params);
        let p = peer(5);
        keeper.add_peer(p, None);
        keeper.reject(&p, "t");
        keeper.remove_peer(&p);

        assert!(keeper.retains(&p));
        let before = keeper.snapshot(&p).unwrap();
        assert_eq!(before.invalid_deliveries["t"], 1.0);

        // Reconnect within the retention window keeps the record.
        keeper.add_peer(p, None);
        assert_eq!(keeper.snapshot(&p).unwrap().invalid_deliveries["t"], 1.0);

        keeper.remove_peer(&p);
        keeper.refresh(Instant::now() + Duration::from_millis(100));
        assert!(!keeper.retains(&p));
    }

    #[test]
    fn mesh_failure_penalty_on_prune_with_deficit() {
        let params = TopicScoreParams {
            mesh_message_deliveries_weight: -1.0,
            mesh_message_deliveries_threshold: 4.0,
            mesh_message_deliveries_activation: Duration::from_secs(1),
            mesh_failure_penalty_weight: -1.0,
            time_in_mesh_weight: 0.0,
            first_message_deliveries_weight: 0.0,
            ..Default::default()
        };
        let mut keeper = keeper_with("t", params);
        let p = peer(6);
        keeper.add_peer(p, None);
        keeper.graft(&p, "t");

        // Activate the deficit window, then prune with zero deliveries.
        keeper.refresh(Instant::now() + Duration::from_secs(2));
        keeper.prune(&p, "t");

        // deficit 4 -> sticky penalty 16, squared with weight -1
        assert!(keeper.score(&p) <= -(16.0 * 16.0) + 1e-9);
    }

    #[test]
    fn threshold_ordering_validated() {
        let mut t = PeerScoreThresholds::default();
        t.publish_threshold = -10.0; // above gossip (-25)
        assert!(t.validate().is_err());

        let mut t = PeerScoreThresholds::default();
        t.gossip_threshold = 5.0;
        assert!(t.validate().is_err());

        let mut t = PeerScoreThresholds::default();
        t.accept_px_threshold = -1.0;
        assert!(t.validate().is_err());

        assert!(PeerScoreThresholds::default().validate().is_ok());
    }

    #[test]
    fn subnet_matching() {
        let net = Subnet::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16);
        assert!(net.contains(&IpAddr::V4(Ipv4Addr::new(192, 168, 40, 1))));
        assert!(!net.contains(&IpAddr::V4(Ipv4Addr::new(192, 169, 0, 1))));
    }
}
