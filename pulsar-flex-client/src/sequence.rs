//! Sequence id cursor for one producer

use crate::protocol::SequenceId;

/// Monotonic sequence id cursor.
///
/// Not synchronized; the owning session state is behind a lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceAllocator {
    next: SequenceId,
}

impl SequenceAllocator {
    /// Hand out the current id and advance the cursor
    pub fn next(&mut self) -> SequenceId {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn current(&self) -> SequenceId {
        self.next
    }

    pub fn reset(&mut self, start: SequenceId) {
        self.next = start;
    }

    /// Move the cursor forward to `start` without ever moving it back
    pub fn advance_to(&mut self, start: SequenceId) {
        self.next = self.next.max(start);
    }
}

/// First usable sequence id after a broker-reported last sequence id; `-1`
/// means nothing has been published yet
pub fn start_after(last_sequence_id: i64) -> SequenceId {
    if last_sequence_id < 0 {
        0
    } else {
        last_sequence_id as SequenceId + 1
    }
}
