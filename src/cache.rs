//! Message caches.
//!
//! Two distinct caches with different jobs: [`SeenCache`] remembers message
//! *IDs* for deduplication over a TTL, while [`MessageCache`] keeps recent
//! full messages in a ring of per-heartbeat windows so IHAVE can advertise
//! them and IWANT can be answered. The first arrival of an ID wins; later
//! copies are duplicates regardless of path.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::PeerId;
use crate::wire::{Message, MessageId};

/// Bounded time-indexed set of seen message IDs.
pub(crate) struct SeenCache {
    ttl: Duration,
    entries: HashMap<MessageId, Instant>,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Record an ID; returns false when it was already present. The original
    /// first-seen timestamp is kept, so re-arrivals do not extend the TTL.
    pub fn insert(&mut self, id: MessageId) -> bool {
        match self.entries.entry(id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop entries past the TTL. Runs on the heartbeat GC pass.
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < ttl);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

struct CacheEntry {
    msg: Message,
    /// How many times each peer has been sent this message via IWANT.
    transmissions: HashMap<PeerId, usize>,
}

/// Recently forwarded messages, organized as a ring of history windows that
/// shifts once per heartbeat. Gossip advertises the newest `gossip_window`
/// windows; IWANT is answered from the whole ring.
pub(crate) struct MessageCache {
    msgs: HashMap<MessageId, CacheEntry>,
    /// Front window is the current heartbeat.
    history: VecDeque<Vec<(MessageId, String)>>,
    gossip_window: usize,
}

impl MessageCache {
    pub fn new(history_length: usize, gossip_window: usize) -> Self {
        let mut history = VecDeque::with_capacity(history_length);
        for _ in 0..history_length {
            history.push_back(Vec::new());
        }
        Self {
            msgs: HashMap::new(),
            history,
            gossip_window,
        }
    }

    pub fn put(&mut self, id: MessageId, msg: Message) {
        let topic = msg.topic.clone();
        if self
            .msgs
            .insert(
                id.clone(),
                CacheEntry {
                    msg,
                    transmissions: HashMap::new(),
                },
            )
            .is_none()
        {
            if let Some(window) = self.history.front_mut() {
                window.push((id, topic));
            }
        }
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.msgs.contains_key(id)
    }

    /// Fetch a message to answer an IWANT from `peer`. Returns None once the
    /// peer has been sent this message more than `retransmission_cap` times;
    /// each successful fetch counts as one transmission.
    pub fn get_for_peer(
        &mut self,
        id: &MessageId,
        peer: &PeerId,
        retransmission_cap: usize,
    ) -> Option<Message> {
        let entry = self.msgs.get_mut(id)?;
        let count = entry.transmissions.entry(*peer).or_insert(0);
        if *count >= retransmission_cap {
            return None;
        }
        *count += 1;
        Some(entry.msg.clone())
    }

    /// IDs for IHAVE gossip: everything in the newest `gossip_window`
    /// windows for the topic.
    pub fn gossip_ids(&self, topic: &str) -> Vec<MessageId> {
        self.history
            .iter()
            .take(self.gossip_window)
            .flat_map(|window| {
                window
                    .iter()
                    .filter(|(_, t)| t == topic)
                    .map(|(id, _)| id.clone())
            })
            .collect()
    }

    /// Rotate the ring: the oldest window's messages are evicted and a fresh
    /// window becomes current.
    pub fn shift(&mut self) {
        if let Some(expired) = self.history.pop_back() {
            for (id, _) in expired {
                self.msgs.remove(&id);
            }
        }
        self.history.push_front(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn msg(topic: &str, seqno: u64) -> (MessageId, Message) {
        let from = Keypair::from_seed([7u8; 32]).peer_id();
        let m = Message {
            from,
            seqno,
            topic: topic.to_string(),
            data: vec![seqno as u8],
            signature: None,
            key: None,
        };
        (MessageId::from_origin(&from, seqno), m)
    }

    #[test]
    fn seen_cache_first_arrival_wins() {
        let mut seen = SeenCache::new(Duration::from_secs(60));
        let (id, _) = msg("t", 1);
        assert!(seen.insert(id.clone()));
        assert!(!seen.insert(id.clone()));
        assert!(seen.contains(&id));
    }

    #[test]
    fn seen_cache_sweeps_expired() {
        let mut seen = SeenCache::new(Duration::from_millis(10));
        let (id, _) = msg("t", 1);
        seen.insert(id.clone());
        seen.sweep(Instant::now() + Duration::from_millis(50));
        assert!(!seen.contains(&id));
        assert_eq!(seen.len(), 0);
    }

    #[test]
    fn message_cache_expires_after_history_length_shifts() {
        let mut cache = MessageCache::new(3, 2);
        let (id, m) = msg("t", 1);
        cache.put(id.clone(), m);
        assert!(cache.contains(&id));

        cache.shift();
        cache.shift();
        assert!(cache.contains(&id));
        cache.shift();
        assert!(!cache.contains(&id));
    }

    #[test]
    fn gossip_covers_only_recent_windows() {
        let mut cache = MessageCache::new(4, 2);
        let (old_id, old_m) = msg("t", 1);
        cache.put(old_id.clone(), old_m);
        cache.shift();
        cache.shift();
        let (new_id, new_m) = msg("t", 2);
        cache.put(new_id.clone(), new_m);

        let ids = cache.gossip_ids("t");
        assert!(ids.contains(&new_id));
        assert!(!ids.contains(&old_id));

        // Old message is still fetchable for IWANT even when not gossiped.
        let peer = Keypair::from_seed([8u8; 32]).peer_id();
        assert!(cache.get_for_peer(&old_id, &peer, 3).is_some());
    }

    #[test]
    fn gossip_ids_filtered_by_topic() {
        let mut cache = MessageCache::new(3, 3);
        let (id_a, m_a) = msg("alpha", 1);
        let (id_b, m_b) = msg("beta", 2);
        cache.put(id_a.clone(), m_a);
        cache.put(id_b, m_b);
        assert_eq!(cache.gossip_ids("alpha"), vec![id_a]);
    }

    #[test]
    fn retransmissions_capped_per_peer() {
        let mut cache = MessageCache::new(3, 2);
        let (id, m) = msg("t", 1);
        cache.put(id.clone(), m);
        let peer = Keypair::from_seed([9u8; 32]).peer_id();
        let other = Keypair::from_seed([10u8; 32]).peer_id();

        assert!(cache.get_for_peer(&id, &peer, 2).is_some());
        assert!(cache.get_for_peer(&id, &peer, 2).is_some());
        assert!(cache.get_for_peer(&id, &peer, 2).is_none());
        // Cap is per peer, not global.
        assert!(cache.get_for_peer(&id, &other, 2).is_some());
    }
}
