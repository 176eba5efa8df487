//! Sliding-window byte-rate estimator, used by `ThrottleNode` (quota accounting) and by the
//! choke engine's upload-unchoke weight function (`rate < 1000 B/s` test).

const WINDOW_SECS: u64 = 20;

/// Bucketed byte counter over a trailing window, advanced by an externally supplied tick clock
/// rather than a wall-clock read, so the whole core stays deterministically testable.
#[derive(Clone, Debug)]
pub struct Rate {
    buckets: Vec<u32>,
    current_bucket_secs: u64,
    total: u64,
}

impl Rate {
    pub fn new() -> Rate {
        Rate {
            buckets: vec![0; WINDOW_SECS as usize],
            current_bucket_secs: 0,
            total: 0,
        }
    }

    /// Advance the window to `now_secs`, evicting buckets that fell out of the window.
    pub fn update(&mut self, now_secs: u64) {
        if now_secs <= self.current_bucket_secs {
            return;
        }
        let elapsed = now_secs - self.current_bucket_secs;
        let to_clear = elapsed.min(WINDOW_SECS) as usize;
        let len = self.buckets.len();
        for i in 0..to_clear {
            let idx = (self.current_bucket_secs as usize + 1 + i) % len;
            self.total -= self.buckets[idx] as u64;
            self.buckets[idx] = 0;
        }
        self.current_bucket_secs = now_secs;
    }

    /// Record `bytes` transferred at `now_secs`.
    pub fn add(&mut self, now_secs: u64, bytes: u32) {
        self.update(now_secs);
        let len = self.buckets.len();
        let idx = (now_secs as usize) % len;
        self.buckets[idx] += bytes;
        self.total += bytes as u64;
    }

    /// Bytes/sec averaged over the trailing window.
    pub fn rate(&self) -> u32 {
        (self.total / WINDOW_SECS) as u32
    }
}

impl Default for Rate {
    fn default() -> Rate {
        Rate::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_averages_over_window() {
        let mut rate = Rate::new();
        for sec in 0..WINDOW_SECS {
            rate.add(sec, 1000);
        }
        assert_eq!(rate.rate(), 1000);
    }

    #[test]
    fn old_buckets_expire() {
        let mut rate = Rate::new();
        rate.add(0, 20_000);
        rate.update(WINDOW_SECS + 5);
        assert_eq!(rate.rate(), 0);
    }
}
