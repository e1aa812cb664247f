//! Structured trace events.
//!
//! Mesh degradation, graylisting, queue overflow and peer exchange are only
//! observable through this stream. A sink is registered at construction and
//! receives every event; independently, each event is logged at trace level.

use std::sync::{Arc, Mutex};

use crate::identity::PeerId;
use crate::validation::RejectReason;
use crate::wire::MessageId;

#[derive(Clone, Debug)]
pub enum TraceEvent {
    AddPeer { peer: PeerId },
    RemovePeer { peer: PeerId },
    Join { topic: String },
    Leave { topic: String },
    Graft { peer: PeerId, topic: String },
    Prune { peer: PeerId, topic: String },
    PublishMessage { id: MessageId, topic: String },
    DeliverMessage { id: MessageId, topic: String },
    DuplicateMessage { id: MessageId, from: PeerId },
    RejectMessage { id: MessageId, from: PeerId, reason: RejectReason },
    /// A frame was dropped because the peer's send queue was full.
    DropRpc { peer: PeerId },
    /// A frame was dropped because the sender is graylisted.
    GraylistPeer { peer: PeerId },
    /// A subscriber fell behind and lost its oldest queued message.
    UndeliverableMessage { topic: String },
    /// An IWANT went unanswered past the follow-up deadline.
    BrokenPromise { peer: PeerId },
    /// Peer-exchange records accepted from a PRUNE.
    PeerExchange { from: PeerId, topic: String, peers: Vec<PeerId> },
}

/// Event consumer registered at construction.
pub trait TraceSink: Send + Sync {
    fn on_event(&self, event: &TraceEvent);
}

/// Sink that retains every event; handy in tests and diagnostics.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TraceEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }
}

impl TraceSink for MemorySink {
    fn on_event(&self, event: &TraceEvent) {
        self.events.lock().expect("sink poisoned").push(event.clone());
    }
}

#[derive(Clone, Default)]
pub(crate) struct Tracer {
    sink: Option<Arc<dyn TraceSink>>,
}

impl Tracer {
    pub fn new(sink: Option<Arc<dyn TraceSink>>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: TraceEvent) {
        tracing::trace!(?event, "trace");
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_retains_events() {
        let sink = Arc::new(MemorySink::default());
        let tracer = Tracer::new(Some(sink.clone()));
        tracer.emit(TraceEvent::Join { topic: "t".into() });
        tracer.emit(TraceEvent::Leave { topic: "t".into() });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], TraceEvent::Join { topic } if topic == "t"));
    }

    #[test]
    fn tracer_without_sink_is_silent() {
        let tracer = Tracer::new(None);
        tracer.emit(TraceEvent::Leave { topic: "t".into() });
    }
}
