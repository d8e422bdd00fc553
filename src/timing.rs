//! Frame-clock timing helpers: trailing debounce and minimum-spacing throttle.
//!
//! Both work on caller-supplied millisecond timestamps rather than reading a
//! clock, so the owner decides what "now" is (frame time on device, a fake
//! clock in tests). Dropping the owner drops the timer; nothing is scheduled
//! behind its back.

/// Trailing-edge debounce: fires once `window_ms` after the last trigger.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: u64,
    deadline_ms: Option<u64>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            deadline_ms: None,
        }
    }

    /// (Re)arm the window from `now_ms`.
    pub fn trigger(&mut self, now_ms: u64) {
        self.deadline_ms = Some(now_ms.saturating_add(self.window_ms));
    }

    /// True exactly once when the window has elapsed.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline_ms = None;
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Minimum spacing between accepted events.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval_ms: u64,
    last_ms: Option<u64>,
}

impl Throttle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_ms: None,
        }
    }

    /// Accept the event at `now_ms` if enough time has passed since the last one.
    ///
    /// A timestamp earlier than the last accepted one re-anchors the throttle,
    /// so a single skewed future timestamp cannot block later events.
    pub fn allow(&mut self, now_ms: u64) -> bool {
        match self.last_ms {
            Some(last) if now_ms >= last && now_ms - last < self.min_interval_ms => false,
            _ => {
                self.last_ms = Some(now_ms);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_coalesces_burst() {
        let mut d = Debouncer::new(150);
        d.trigger(0);
        d.trigger(100);
        d.trigger(200);
        assert!(!d.poll(300));
        assert!(d.is_pending());
        assert!(d.poll(350));
        // Fires only once
        assert!(!d.poll(400));
        assert!(!d.is_pending());
    }

    #[test]
    fn test_debounce_cancel() {
        let mut d = Debouncer::new(250);
        d.trigger(0);
        d.cancel();
        assert!(!d.poll(1_000));
    }

    #[test]
    fn test_throttle_spacing() {
        let mut t = Throttle::new(1_000);
        assert!(t.allow(0));
        assert!(!t.allow(500));
        assert!(!t.allow(999));
        assert!(t.allow(1_000));
        t.reset();
        assert!(t.allow(1_001));
    }

    #[test]
    fn test_throttle_recovers_from_future_timestamp() {
        let mut t = Throttle::new(1_000);
        assert!(t.allow(10_000_000_000_000));
        // Clock went backwards: accept and re-anchor
        assert!(t.allow(2_000));
        assert!(!t.allow(2_500));
        assert!(t.allow(3_000));
    }
}
