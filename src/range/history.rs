use std::collections::VecDeque;

use super::Measurement;

/// Fixed-capacity measurement ring; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct MeasurementHistory {
    samples: VecDeque<Measurement>,
    capacity: usize,
}

impl MeasurementHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Measurement) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index 0 is the oldest retained sample.
    pub fn get(&self, index: usize) -> Option<&Measurement> {
        self.samples.get(index)
    }

    pub fn latest(&self) -> Option<&Measurement> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.samples.iter()
    }
}
