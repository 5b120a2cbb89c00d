//! Frame-level link metrics for the physical channels.
//!
//! Each engine keeps one `LinkConditions` tracker and feeds it every decoded
//! frame plus every corrupt frame the decoder discarded. The snapshot exposes
//! `loss_ratio`, `frame_error_rate` and `jitter_ms`, all derived only from
//! the recorded inputs. Neither channel schedules delivery, so there is no
//! lateness measure.
use serde::Serialize;

/// Snapshot of the observed metrics for a single channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LinkMetrics {
    /// Fraction of expected frames that never arrived, in `[0, 1]`.
    pub loss_ratio: f64,
    /// Corrupt frames over all frame starts seen.
    pub frame_error_rate: f64,
    /// Average jitter in milliseconds between consecutive arrivals.
    pub jitter_ms: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    last_sequence: Option<u64>,
    total_expected: u64,
    observed_frames: u64,
    lost_frames: u64,
    corrupt_frames: u64,
    last_arrival: Option<u64>,
    last_interval: Option<u64>,
    total_jitter_us: u128,
    jitter_samples: u64,
    max_loss_gap: u64,
}

impl LinkConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a decoded frame.
    ///
    /// `sequence` must already be unwrapped to a monotonic 64-bit value (see
    /// [`SequenceUnwrapper`]); duplicates and reordered frames are ignored.
    pub fn record_frame(&mut self, sequence: u64, arrival_us: u64) {
        if let Some(last_seq) = self.last_sequence {
            if sequence <= last_seq {
                return;
            }
            let delta = sequence - last_seq;
            self.total_expected = self.total_expected.saturating_add(delta);
            if delta > 1 {
                self.lost_frames = self.lost_frames.saturating_add(delta - 1);
                self.max_loss_gap = self.max_loss_gap.max(delta - 1);
            }
        } else {
            self.total_expected = self.total_expected.saturating_add(1);
        }

        self.last_sequence = Some(sequence);
        self.observed_frames = self.observed_frames.saturating_add(1);

        if let Some(last) = self.last_arrival {
            let interval = arrival_us.saturating_sub(last);
            if let Some(prev_interval) = self.last_interval {
                let jitter = interval.abs_diff(prev_interval);
                self.total_jitter_us = self.total_jitter_us.saturating_add(jitter as u128);
                self.jitter_samples = self.jitter_samples.saturating_add(1);
            }
            self.last_interval = Some(interval);
        }
        self.last_arrival = Some(arrival_us);
    }

    /// Records frame starts the decoder had to discard.
    pub fn record_corrupt(&mut self, count: u64) {
        self.corrupt_frames = self.corrupt_frames.saturating_add(count);
    }

    pub fn metrics(&self) -> LinkMetrics {
        let total_expected = self.total_expected.max(self.observed_frames);
        let loss_ratio = if total_expected == 0 {
            0.0
        } else {
            self.lost_frames as f64 / total_expected as f64
        };

        let starts = self.observed_frames + self.corrupt_frames;
        let frame_error_rate = if starts == 0 {
            0.0
        } else {
            self.corrupt_frames as f64 / starts as f64
        };

        let jitter_ms = if self.jitter_samples == 0 {
            None
        } else {
            Some(self.total_jitter_us as f64 / self.jitter_samples as f64 / 1000.0)
        };

        LinkMetrics {
            loss_ratio,
            frame_error_rate,
            jitter_ms,
        }
    }

    pub fn max_loss_gap(&self) -> u64 {
        self.max_loss_gap
    }

    pub fn observed_frames(&self) -> u64 {
        self.observed_frames
    }

    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }
}

/// Extends wrapping 16-bit frame sequence numbers to 64 bits.
#[derive(Debug, Clone, Default)]
pub struct SequenceUnwrapper {
    last: Option<u64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the 64-bit value closest to the highest one seen so far.
    pub fn extend(&mut self, seq: u16) -> u64 {
        let extended = match self.last {
            None => seq as u64,
            Some(last) => {
                let delta = seq.wrapping_sub(last as u16) as i16;
                (last as i64 + delta as i64).max(0) as u64
            }
        };
        self.last = Some(self.last.map_or(extended, |last| last.max(extended)));
        extended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_ratio_accounts_for_missing_sequences() {
        let mut link = LinkConditions::new();
        link.record_frame(1, 0);
        link.record_frame(2, 1_000);
        link.record_frame(4, 3_000);
        let metrics = link.metrics();
        assert!((metrics.loss_ratio - (1.0 / 4.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_reports_only_measured_quantities() {
        let mut link = LinkConditions::new();
        link.record_frame(1, 0);
        link.record_frame(2, 5_000);
        let json = serde_json::to_value(link.metrics()).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["frame_error_rate", "jitter_ms", "loss_ratio"]);
    }

    #[test]
    fn jitter_ms_average() {
        let mut link = LinkConditions::new();
        link.record_frame(1, 0);
        link.record_frame(2, 1_000);
        link.record_frame(3, 2_500);
        link.record_frame(4, 3_900);
        // intervals 1000, 1500, 1400 us -> diffs 500, 100 -> 0.3 ms
        assert_eq!(link.metrics().jitter_ms, Some(0.3));
    }

    #[test]
    fn frame_error_rate_uses_all_starts() {
        let mut link = LinkConditions::new();
        link.record_frame(1, 0);
        link.record_frame(2, 0);
        link.record_frame(3, 0);
        link.record_corrupt(1);
        assert!((link.metrics().frame_error_rate - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn sequence_wraps_forward() {
        let mut seq = SequenceUnwrapper::new();
        assert_eq!(seq.extend(65_534), 65_534);
        assert_eq!(seq.extend(65_535), 65_535);
        assert_eq!(seq.extend(0), 65_536);
        assert_eq!(seq.extend(2), 65_538);
    }
}
