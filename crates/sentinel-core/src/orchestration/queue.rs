use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::models::{JobId, JobPriority};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct QueueEntry {
    pub(crate) priority: JobPriority,
    pub(crate) sequence: u64,
    pub(crate) job_id: JobId,
}

impl Ord for QueueEntry {
    // Max-heap: higher priority first, then lower sequence (earlier submission).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending jobs ordered by priority, FIFO within a priority band.
///
/// Deferred entries keep their original sequence number when pushed back, so a
/// job blocked on its domain does not lose its place to later submissions.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

impl JobQueue {
    pub(crate) fn push(&mut self, job_id: JobId, priority: JobPriority) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        self.heap.push(QueueEntry {
            priority,
            sequence,
            job_id,
        });
    }

    pub(crate) fn requeue(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    pub(crate) fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    pub(crate) fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.job_id != job_id);
        self.heap.len() != before
    }

    pub(crate) fn drain(&mut self) -> Vec<QueueEntry> {
        self.heap.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
