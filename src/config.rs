//! Node configuration.
//!
//! All knobs live in [`Config`]; the event loop validates the whole struct
//! once at construction and never re-reads external state. Defaults follow
//! the values the protocol was tuned with in production meshes.

use std::fmt;
use std::time::Duration;

use crate::identity::PeerId;
use crate::score::{PeerScoreParams, PeerScoreThresholds};

/// D - target mesh degree per topic.
pub const DEFAULT_MESH_DEGREE: usize = 6;

/// Dlo - lower bound before the heartbeat grafts new members.
pub const DEFAULT_MESH_DEGREE_LOW: usize = 5;

/// Dhi - upper bound before the heartbeat prunes excess members.
pub const DEFAULT_MESH_DEGREE_HIGH: usize = 12;

/// Dscore - mesh slots reserved for the highest-scoring peers when pruning.
pub const DEFAULT_MESH_DEGREE_SCORE: usize = 4;

/// Dlazy - minimum breadth of IHAVE gossip per heartbeat.
pub const DEFAULT_GOSSIP_DEGREE: usize = 6;

/// Dout - outbound connections kept in the mesh to resist eclipse.
pub const DEFAULT_MESH_DEGREE_OUT: usize = 2;

/// Fraction of eligible non-mesh peers that receive IHAVE each heartbeat.
pub const DEFAULT_GOSSIP_FACTOR: f64 = 0.25;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Fanout sets for unjoined topics expire after this idle period.
pub const DEFAULT_FANOUT_TTL: Duration = Duration::from_secs(60);

/// Message-cache ring length, in heartbeats.
pub const DEFAULT_HISTORY_LENGTH: usize = 5;

/// Number of most recent ring windows advertised in IHAVE gossip.
pub const DEFAULT_GOSSIP_WINDOW: usize = 3;

/// Times a cached message may be re-sent to the same peer via IWANT.
pub const DEFAULT_GOSSIP_RETRANSMISSION: usize = 3;

/// Message IDs accepted per IHAVE advertisement and per peer per heartbeat.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 5000;

/// IHAVE advertisements processed per peer per heartbeat window.
pub const DEFAULT_MAX_IHAVE_MESSAGES: usize = 10;

/// Backoff installed on a pruned peer before it may re-graft.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

/// High-scoring non-mesh peers grafted when the mesh median score sags.
pub const DEFAULT_OPPORTUNISTIC_GRAFT_PEERS: usize = 2;

/// Peers listed for peer exchange in an outgoing PRUNE.
pub const DEFAULT_PRUNE_PEERS: usize = 16;

/// Deadline for a peer to fulfil an IWANT before the promise counts broken.
pub const DEFAULT_FOLLOWUP_TIME: Duration = Duration::from_millis(500);

/// Retention of seen message IDs for deduplication.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(120);

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_TRANSMISSION_SIZE: usize = 4 * 1024 * 1024;

/// Concurrent outbound stream opens.
pub const DEFAULT_MAX_PENDING_CONNS: usize = 64;

/// Capacity of each local subscription's delivery queue.
pub const DEFAULT_SUBSCRIPTION_QUEUE_LEN: usize = 32;

/// Capacity of a remote peer's send queue; direct peers get four times this.
pub const DEFAULT_PEER_QUEUE_LEN: usize = 32;

pub const DEFAULT_VALIDATOR_WORKERS: usize = 8;
pub const DEFAULT_VALIDATE_QUEUE_LEN: usize = 32;
pub const DEFAULT_VALIDATE_THROTTLE: usize = 16;
pub const DEFAULT_VALIDATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Degree of the random-fanout routing variant.
pub const DEFAULT_RANDOM_FANOUT_DEGREE: usize = 8;

/// How the node routes published messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingVariant {
    /// Bounded per-topic mesh with lazy IHAVE/IWANT gossip. The default.
    Gossip,
    /// Broadcast to every subscribed peer; no mesh, no control messages.
    Flood,
    /// Uniform random subset per message, sized for the given network size.
    /// Reuses the pipeline but keeps no mesh or control state.
    RandomFanout { network_size: usize },
}

#[derive(Clone)]
pub struct Config {
    pub routing: RoutingVariant,

    // Mesh sizing.
    pub mesh_degree: usize,
    pub mesh_degree_low: usize,
    pub mesh_degree_high: usize,
    pub mesh_degree_score: usize,
    pub mesh_degree_out: usize,
    pub gossip_degree: usize,
    pub gossip_factor: f64,

    // Cadence.
    pub heartbeat_interval: Duration,
    pub heartbeat_initial_delay: Duration,
    pub fanout_ttl: Duration,

    // Gossip state.
    pub history_length: usize,
    pub gossip_window: usize,
    pub gossip_retransmission: usize,
    pub max_ihave_length: usize,
    pub max_ihave_messages: usize,
    pub prune_backoff: Duration,
    pub prune_peers: usize,
    pub opportunistic_graft_peers: usize,
    pub followup_time: Duration,
    pub seen_ttl: Duration,

    // Resource caps.
    pub max_message_size: usize,
    pub max_transmission_size: usize,
    pub max_pending_conns: usize,
    pub subscription_queue_len: usize,
    pub peer_queue_len: usize,

    // Security policy.
    pub sign_messages: bool,
    pub validate_messages: bool,
    pub strict_signature_verification: bool,

    // Delivery policy.
    pub discard_own: bool,
    pub publish_if_no_peers: bool,

    /// Peers kept in every joined mesh unconditionally, exempt from score
    /// gating, with enlarged send queues.
    pub direct_peers: Vec<PeerId>,

    // Validation pool.
    pub validator_workers: usize,
    pub validate_queue_len: usize,
    pub validate_throttle: usize,
    pub validate_timeout: Duration,

    pub score_params: PeerScoreParams,
    pub score_thresholds: PeerScoreThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing: RoutingVariant::Gossip,

            mesh_degree: DEFAULT_MESH_DEGREE,
            mesh_degree_low: DEFAULT_MESH_DEGREE_LOW,
            mesh_degree_high: DEFAULT_MESH_DEGREE_HIGH,
            mesh_degree_score: DEFAULT_MESH_DEGREE_SCORE,
            mesh_degree_out: DEFAULT_MESH_DEGREE_OUT,
            gossip_degree: DEFAULT_GOSSIP_DEGREE,
            gossip_factor: DEFAULT_GOSSIP_FACTOR,

            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_initial_delay: DEFAULT_HEARTBEAT_INITIAL_DELAY,
            fanout_ttl: DEFAULT_FANOUT_TTL,

            history_length: DEFAULT_HISTORY_LENGTH,
            gossip_window: DEFAULT_GOSSIP_WINDOW,
            gossip_retransmission: DEFAULT_GOSSIP_RETRANSMISSION,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_ihave_messages: DEFAULT_MAX_IHAVE_MESSAGES,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            prune_peers: DEFAULT_PRUNE_PEERS,
            opportunistic_graft_peers: DEFAULT_OPPORTUNISTIC_GRAFT_PEERS,
            followup_time: DEFAULT_FOLLOWUP_TIME,
            seen_ttl: DEFAULT_SEEN_TTL,

            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_transmission_size: DEFAULT_MAX_TRANSMISSION_SIZE,
            max_pending_conns: DEFAULT_MAX_PENDING_CONNS,
            subscription_queue_len: DEFAULT_SUBSCRIPTION_QUEUE_LEN,
            peer_queue_len: DEFAULT_PEER_QUEUE_LEN,

            // Tuned for closed deployments; harden per-deployment.
            sign_messages: false,
            validate_messages: false,
            strict_signature_verification: false,

            discard_own: false,
            publish_if_no_peers: true,

            direct_peers: Vec::new(),

            validator_workers: DEFAULT_VALIDATOR_WORKERS,
            validate_queue_len: DEFAULT_VALIDATE_QUEUE_LEN,
            validate_throttle: DEFAULT_VALIDATE_THROTTLE,
            validate_timeout: DEFAULT_VALIDATE_TIMEOUT,

            score_params: PeerScoreParams::default(),
            score_thresholds: PeerScoreThresholds::default(),
        }
    }
}

impl Config {
    /// Shorthand used throughout the tests: default parameters with a faster
    /// heartbeat so clusters converge quickly.
    pub fn with_heartbeat(interval: Duration) -> Self {
        Self {
            heartbeat_interval: interval,
            heartbeat_initial_delay: interval / 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_degree_low > self.mesh_degree || self.mesh_degree > self.mesh_degree_high {
            return Err(ConfigError::MeshBounds {
                lo: self.mesh_degree_low,
                d: self.mesh_degree,
                hi: self.mesh_degree_high,
            });
        }
        if self.mesh_degree_out >= self.mesh_degree_low
            || self.mesh_degree_out > self.mesh_degree / 2
        {
            return Err(ConfigError::OutboundDegree {
                dout: self.mesh_degree_out,
            });
        }
        if !(self.gossip_factor > 0.0 && self.gossip_factor <= 1.0) {
            return Err(ConfigError::GossipFactor(self.gossip_factor));
        }
        if self.history_length == 0 || self.gossip_window > self.history_length {
            return Err(ConfigError::HistoryWindows {
                history: self.history_length,
                gossip: self.gossip_window,
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.max_message_size == 0 || self.max_message_size > self.max_transmission_size {
            return Err(ConfigError::SizeCaps {
                message: self.max_message_size,
                transmission: self.max_transmission_size,
            });
        }
        if let RoutingVariant::RandomFanout { network_size } = self.routing {
            if network_size == 0 {
                return Err(ConfigError::ZeroNetworkSize);
            }
        }
        self.score_params
            .validate()
            .map_err(ConfigError::ScoreParams)?;
        self.score_thresholds
            .validate()
            .map_err(ConfigError::ScoreThresholds)?;
        Ok(())
    }
}

/// Construction-time configuration rejections.
#[derive(Debug)]
pub enum ConfigError {
    MeshBounds { lo: usize, d: usize, hi: usize },
    OutboundDegree { dout: usize },
    GossipFactor(f64),
    HistoryWindows { history: usize, gossip: usize },
    ZeroHeartbeat,
    SizeCaps { message: usize, transmission: usize },
    ZeroNetworkSize,
    ScoreParams(String),
    ScoreThresholds(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MeshBounds { lo, d, hi } => {
                write!(f, "mesh bounds must satisfy lo <= d <= hi, got {lo}/{d}/{hi}")
            }
            Self::OutboundDegree { dout } => {
                write!(f, "outbound degree {dout} must be < lo and <= d/2")
            }
            Self::GossipFactor(v) => write!(f, "gossip factor {v} outside (0, 1]"),
            Self::HistoryWindows { history, gossip } => {
                write!(f, "gossip window {gossip} exceeds history length {history}")
            }
            Self::ZeroHeartbeat => write!(f, "heartbeat interval must be non-zero"),
            Self::SizeCaps { message, transmission } => write!(
                f,
                "max message size {message} must be non-zero and <= transmission size {transmission}"
            ),
            Self::ZeroNetworkSize => write!(f, "random fanout network size must be non-zero"),
            Self::ScoreParams(e) => write!(f, "score parameters: {e}"),
            Self::ScoreThresholds(e) => write!(f, "score thresholds: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn mesh_bounds_enforced() {
        let mut cfg = Config::default();
        cfg.mesh_degree_low = 10;
        assert!(matches!(cfg.validate(), Err(ConfigError::MeshBounds { .. })));

        let mut cfg = Config::default();
        cfg.mesh_degree_high = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn outbound_degree_enforced() {
        let mut cfg = Config::default();
        cfg.mesh_degree_out = cfg.mesh_degree_low;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutboundDegree { .. })
        ));

        let mut cfg = Config::default();
        cfg.mesh_degree_out = cfg.mesh_degree / 2 + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn gossip_window_bounded_by_history() {
        let mut cfg = Config::default();
        cfg.gossip_window = cfg.history_length + 1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HistoryWindows { .. })
        ));
    }

    #[test]
    fn random_fanout_needs_network_size() {
        let mut cfg = Config::default();
        cfg.routing = RoutingVariant::RandomFanout { network_size: 0 };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroNetworkSize)));
    }

    #[test]
    fn message_size_must_fit_transmission() {
        let mut cfg = Config::default();
        cfg.max_message_size = cfg.max_transmission_size + 1;
        assert!(matches!(cfg.validate(), Err(ConfigError::SizeCaps { .. })));
    }
}
