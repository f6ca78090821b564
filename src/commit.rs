//! Commit pipeline: sequence number allocation and visibility.
//!
//! The pipeline serializes committers through a single lock and hands each
//! one a contiguous run of sequence numbers via a two-phase protocol:
//! `prepare` runs first (the caller may take the database lock inside it),
//! then `apply`; the allocated run becomes visible to readers only after
//! `apply` returns. Work that needs both phases keeps its state in a
//! `SeqNumAssignment` implementation rather than in captured mutable slots.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::internal_key::SEQNO_MAX;

/// A unit of work receiving a contiguous sequence number run. `prepare` and
/// `apply` both receive the first sequence number of the run.
pub trait SeqNumAssignment {
    fn prepare(&mut self, seqno: u64);
    fn apply(&mut self, seqno: u64);
}

pub struct CommitPipeline {
    mu: Mutex<()>,
    next_seqno: AtomicU64,
    visible_seqno: AtomicU64,
}

impl CommitPipeline {
    pub fn new(last_seqno: u64) -> Self {
        Self {
            mu: Mutex::new(()),
            next_seqno: AtomicU64::new(last_seqno + 1),
            visible_seqno: AtomicU64::new(last_seqno),
        }
    }

    /// Newest sequence number visible to readers.
    pub fn visible_seqno(&self) -> u64 {
        self.visible_seqno.load(Ordering::Acquire)
    }

    /// Allocates `count` contiguous sequence numbers and drives `op`
    /// through prepare and apply under the commit lock. The run is
    /// published to readers after apply, so a failed committer still
    /// advances visibility; its sequence numbers simply hold no data.
    pub fn allocate_seq_num(&self, count: u64, op: &mut dyn SeqNumAssignment) {
        debug_assert!(count > 0);
        let _guard = self.mu.lock();
        let base = self.next_seqno.fetch_add(count, Ordering::SeqCst);
        assert!(
            base + count < SEQNO_MAX,
            "sequence number space exhausted"
        );
        op.prepare(base);
        op.apply(base);
        self.visible_seqno
            .store(base + count - 1, Ordering::Release);
    }

    /// Raises the allocator above sequence numbers observed during
    /// recovery.
    pub fn ratchet_seqno(&self, last_seqno: u64) {
        self.next_seqno.fetch_max(last_seqno + 1, Ordering::SeqCst);
        self.visible_seqno.fetch_max(last_seqno, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        prepared: Option<u64>,
        applied: Option<u64>,
    }

    impl SeqNumAssignment for Recorder {
        fn prepare(&mut self, seqno: u64) {
            self.prepared = Some(seqno);
        }

        fn apply(&mut self, seqno: u64) {
            self.applied = Some(seqno);
        }
    }

    #[test]
    fn runs_are_contiguous_and_visible_after_apply() {
        let pipeline = CommitPipeline::new(0);
        assert_eq!(pipeline.visible_seqno(), 0);

        let mut a = Recorder {
            prepared: None,
            applied: None,
        };
        pipeline.allocate_seq_num(3, &mut a);
        assert_eq!(a.prepared, Some(1));
        assert_eq!(a.applied, Some(1));
        assert_eq!(pipeline.visible_seqno(), 3);

        let mut b = Recorder {
            prepared: None,
            applied: None,
        };
        pipeline.allocate_seq_num(1, &mut b);
        assert_eq!(b.prepared, Some(4));
        assert_eq!(pipeline.visible_seqno(), 4);
    }

    #[test]
    fn ratchet_only_raises() {
        let pipeline = CommitPipeline::new(10);
        pipeline.ratchet_seqno(5);
        assert_eq!(pipeline.visible_seqno(), 10);
        pipeline.ratchet_seqno(20);
        assert_eq!(pipeline.visible_seqno(), 20);
        let mut op = Recorder {
            prepared: None,
            applied: None,
        };
        pipeline.allocate_seq_num(1, &mut op);
        assert_eq!(op.prepared, Some(21));
    }
}
