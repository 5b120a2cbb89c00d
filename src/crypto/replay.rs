//! Sliding-window replay defense for receive counters.

/// Number of counters tracked behind the high-water mark.
pub const REPLAY_WINDOW: u64 = 64;

/// Tracks which counters were accepted.
///
/// `check` is side-effect free; only `commit` after a successful AEAD open
/// moves the window, so forged frames cannot advance it.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, counter: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if counter > highest {
            return true;
        }
        let offset = highest - counter;
        if offset >= REPLAY_WINDOW {
            return false;
        }
        self.bitmap & (1u64 << offset) == 0
    }

    pub fn commit(&mut self, counter: u64) {
        match self.highest {
            None => {
                self.highest = Some(counter);
                self.bitmap = 1;
            }
            Some(highest) if counter > highest => {
                let shift = counter - highest;
                self.bitmap = if shift >= REPLAY_WINDOW {
                    1
                } else {
                    (self.bitmap << shift) | 1
                };
                self.highest = Some(counter);
            }
            Some(highest) => {
                let offset = highest - counter;
                if offset < REPLAY_WINDOW {
                    self.bitmap |= 1u64 << offset;
                }
            }
        }
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}
