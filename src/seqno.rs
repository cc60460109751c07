// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

/// A monotonically increasing checkpoint/sequence number.
pub type SeqNo = u64;

/// Thread-safe sequence number generator.
///
/// Used by the block range index to tag each checkpoint with a monotonically
/// increasing number, not to version individual values (there is no MVCC here).
///
/// # Examples
///
/// ```
/// # use herddb_index_core::SequenceNumberCounter;
/// let seqno = SequenceNumberCounter::default();
/// assert_eq!(0, seqno.next());
/// assert_eq!(1, seqno.next());
/// ```
#[derive(Clone, Default, Debug)]
pub struct SequenceNumberCounter(Arc<AtomicU64>);

impl SequenceNumberCounter {
    /// Creates a new counter, setting it to some previous value.
    #[must_use]
    pub fn new(prev: SeqNo) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the would-be-next sequence number, without incrementing the counter.
    #[must_use]
    pub fn get(&self) -> SeqNo {
        self.0.load(Acquire)
    }

    /// Gets the next sequence number, incrementing the counter.
    #[must_use]
    #[allow(clippy::missing_panics_doc, reason = "we should never run out of u64s")]
    pub fn next(&self) -> SeqNo {
        let seqno = self.0.fetch_add(1, Release);
        assert!(seqno < u64::MAX, "ran out of sequence numbers");
        seqno
    }

    /// Sets the sequence number.
    pub fn set(&self, seqno: SeqNo) {
        self.0.store(seqno, Release);
    }

    /// Maximizes the sequence number.
    pub fn fetch_max(&self, seqno: SeqNo) {
        self.0.fetch_max(seqno, AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    #[test]
    fn counter_increments() {
        let counter = super::SequenceNumberCounter::default();
        assert_eq!(0, counter.next());
        assert_eq!(1, counter.next());
        assert_eq!(2, counter.get());
    }

    #[test]
    #[should_panic = "ran out of sequence numbers"]
    fn max_seqno_panics() {
        let counter = super::SequenceNumberCounter::default();
        counter.set(u64::MAX);
        let _ = counter.next();
    }
}
