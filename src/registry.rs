//! Local subscriptions.
//!
//! Each subscription owns a bounded delivery queue drained by the
//! application. Delivery never blocks the event loop and never kills a slow
//! subscriber: when a queue is full the oldest message is discarded and a
//! trace event emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::trace::{TraceEvent, Tracer};
use crate::wire::Message;

struct SubShared {
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubShared {
    /// Returns true when the oldest queued message had to be discarded.
    fn push(&self, msg: Message) -> bool {
        let mut queue = self.queue.lock().expect("subscription queue poisoned");
        let mut dropped = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Message> {
        self.queue
            .lock()
            .expect("subscription queue poisoned")
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// A handle to one topic subscription. Receiving is cancel-safe: a cancelled
/// `recv` consumes no message.
pub struct Subscription {
    topic: String,
    shared: Arc<SubShared>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or None once the subscription is cancelled and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(msg) = self.shared.pop() {
                return Some(msg);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.shared.pop()
    }
}

/// Per-topic fan-out to local subscribers. Owned by the event loop; holds
/// only weak references so a dropped [`Subscription`] disappears on the next
/// delivery.
pub(crate) struct TopicRegistry {
    queue_capacity: usize,
    topics: HashMap<String, Vec<Weak<SubShared>>>,
}

impl TopicRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            topics: HashMap::new(),
        }
    }

    pub fn subscribe(&mut self, topic: &str) -> Subscription {
        let shared = Arc::new(SubShared {
            capacity: self.queue_capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(Arc::downgrade(&shared));
        Subscription {
            topic: topic.to_string(),
            shared,
        }
    }

    /// Cancel every subscription on the topic.
    pub fn unsubscribe(&mut self, topic: &str) {
        if let Some(subs) = self.topics.remove(topic) {
            for weak in subs {
                if let Some(shared) = weak.upgrade() {
                    shared.close();
                }
            }
        }
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|w| w.strong_count() > 0))
    }

    /// Fan a message out to live subscribers; prunes dead ones.
    pub fn deliver(&mut self, msg: &Message, tracer: &Tracer) -> usize {
        let Some(subs) = self.topics.get_mut(&msg.topic) else {
            return 0;
        };
        let mut delivered = 0;
        subs.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                if shared.push(msg.clone()) {
                    tracer.emit(TraceEvent::UndeliverableMessage {
                        topic: msg.topic.clone(),
                    });
                }
                delivered += 1;
                true
            }
            None => false,
        });
        delivered
    }

    pub fn close_all(&mut self) {
        for (_, subs) in self.topics.drain() {
            for weak in subs {
                if let Some(shared) = weak.upgrade() {
                    shared.close();
                }
            }
        }
    }
}
