//! Early flushing of finished subsegments
//!
//! Large traces would otherwise be held in memory until the segment ends and
//! then sent as one oversized datagram. Once a trace holds `threshold`
//! unstreamed subsegments, every finished subtree is sent on its own and
//! detached from its parent.

use crate::emitter::Emitter;
use crate::entity::Entity;

/// Default number of unstreamed subsegments that triggers streaming
pub const DEFAULT_STREAMING_THRESHOLD: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct StreamingStrategy {
    threshold: usize,
}

impl Default for StreamingStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_STREAMING_THRESHOLD)
    }
}

impl StreamingStrategy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether the trace `entity` belongs to has grown large enough
    pub fn should_stream(&self, entity: &Entity) -> bool {
        entity.sampled().is_sampled() && entity.arena().size() >= self.threshold
    }

    /// Stream every finished subtree below and including `entity`.
    ///
    /// Children are handled first; streamed children are then detached. The
    /// entity itself goes out only if it is a subsegment that has ended, has
    /// no references left and has no children remaining. Already streamed
    /// nodes are never sent again. Returns the number of entities sent.
    pub fn stream(&self, entity: &Entity, emitter: &dyn Emitter) -> usize {
        let mut streamed = 0;
        for child in entity.children() {
            streamed += self.stream(&child, emitter);
        }
        entity.remove_streamed_children();

        if !Self::is_streamable(entity) {
            return streamed;
        }

        // Outcome is best effort; a dropped datagram still counts as flushed
        // so the subtree is not retried.
        let _ = emitter.send(entity);
        entity.mark_streamed();
        tracing::trace!(entity_id = %entity.id(), "Streamed subsegment");
        streamed + 1
    }

    fn is_streamable(entity: &Entity) -> bool {
        entity.sampled().is_sampled()
            && !entity.is_segment()
            && !entity.has_streamed()
            && !entity.is_in_progress()
            && entity.reference_count() == 0
            && entity.child_count() == 0
    }
}
