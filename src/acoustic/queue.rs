use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::framing::RawFrame;

/// Priority assigned to session data frames.
pub const DATA_PRIORITY: u8 = 128;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub priority: u8,
    order: u64,
    pub frame: RawFrame,
}

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for QueuedFrame {}

impl Ord for QueuedFrame {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of offering a frame to a full queue.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Queued after evicting a lower-priority frame.
    Preempted(u8),
    /// Nothing queued holds a lower priority.
    Rejected,
}

/// Transmit queue: highest priority first, FIFO inside a priority.
#[derive(Debug)]
pub struct TransmitQueue {
    heap: BinaryHeap<QueuedFrame>,
    next_order: u64,
    capacity: usize,
}

impl TransmitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, priority: u8, frame: RawFrame) -> Admission {
        let entry = QueuedFrame {
            priority,
            order: self.next_order,
            frame,
        };
        self.next_order += 1;
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return Admission::Queued;
        }
        let mut entries = std::mem::take(&mut self.heap).into_vec();
        let lowest = entries
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(idx, queued)| (idx, queued.priority));
        let admission = match lowest {
            Some((idx, lowest_priority)) if lowest_priority < priority => {
                entries.swap_remove(idx);
                entries.push(entry);
                Admission::Preempted(lowest_priority)
            }
            _ => Admission::Rejected,
        };
        self.heap = BinaryHeap::from(entries);
        admission
    }

    pub fn pop(&mut self) -> Option<QueuedFrame> {
        self.heap.pop()
    }

    /// Returns a popped frame to its original position.
    pub fn restore(&mut self, frame: QueuedFrame) {
        self.heap.push(frame);
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameKind;

    fn frame(tag: u8) -> RawFrame {
        RawFrame::new(FrameKind::Control, 0, vec![tag])
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let mut q = TransmitQueue::new(8);
        q.push(10, frame(1));
        q.push(200, frame(2));
        q.push(10, frame(3));
        q.push(200, frame(4));
        let order: Vec<u8> = std::iter::from_fn(|| q.pop()).map(|f| f.frame.payload[0]).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn full_queue_evicts_lowest_priority() {
        let mut q = TransmitQueue::new(2);
        q.push(5, frame(1));
        q.push(7, frame(2));
        assert_eq!(q.push(3, frame(3)), Admission::Rejected);
        assert_eq!(q.push(9, frame(4)), Admission::Preempted(5));
        assert_eq!(q.pop().unwrap().frame.payload, vec![4]);
        assert_eq!(q.pop().unwrap().frame.payload, vec![2]);
        assert!(q.is_empty());
    }

    #[test]
    fn restored_frame_keeps_its_turn() {
        let mut q = TransmitQueue::new(4);
        q.push(50, frame(1));
        q.push(50, frame(2));
        let first = q.pop().unwrap();
        q.restore(first);
        assert_eq!(q.pop().unwrap().frame.payload, vec![1]);
    }
}
