// =============================================================================
// Render Throttle — bounds how often state is pushed to renderers
// =============================================================================
//
// Values may be offered at any rate. At most one value is forwarded per
// `min_interval`; while the gate is shut only the newest offered value is
// kept, and it is released as soon as the gate reopens. The throttle has no
// clock of its own: callers pass `now` and sleep until `deadline()`.
// =============================================================================

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RenderThrottle<T> {
    min_interval: Duration,
    last_forward: Option<Instant>,
    pending: Option<T>,
}

impl<T> RenderThrottle<T> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_forward: None,
            pending: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn gate_open(&self, now: Instant) -> bool {
        self.last_forward
            .map_or(true, |last| now.saturating_duration_since(last) >= self.min_interval)
    }

    /// Offer a fresh value. Returns it straight back if the gate is open,
    /// otherwise parks it (replacing any older parked value).
    pub fn offer(&mut self, value: T, now: Instant) -> Option<T> {
        if self.gate_open(now) {
            self.pending = None;
            self.last_forward = Some(now);
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Release the parked value once the gate has reopened.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_none() || !self.gate_open(now) {
            return None;
        }
        self.last_forward = Some(now);
        self.pending.take()
    }

    /// When the parked value becomes releasable, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(self.last_forward.map_or_else(Instant::now, |last| last + self.min_interval))
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Forward `value` regardless of the gate. Anything parked is older than
    /// `value` and is dropped.
    pub fn force(&mut self, value: T, now: Instant) -> T {
        self.pending = None;
        self.last_forward = Some(now);
        value
    }

    /// Forget the parked value and reopen the gate.
    pub fn clear(&mut self) {
        self.pending = None;
        self.last_forward = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GATE: Duration = Duration::from_millis(100);

    #[test]
    fn first_offer_passes_through() {
        let mut t = RenderThrottle::new(GATE);
        assert_eq!(t.offer(1.0, Instant::now()), Some(1.0));
        assert!(!t.has_pending());
    }

    #[test]
    fn burst_keeps_only_newest_value() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(GATE);
        assert_eq!(t.offer(1.0, start), Some(1.0));

        for (i, price) in [2.0, 3.0, 4.0].into_iter().enumerate() {
            let at = start + Duration::from_millis(10 * (i as u64 + 1));
            assert_eq!(t.offer(price, at), None);
        }
        assert_eq!(t.deadline(), Some(start + GATE));

        assert_eq!(t.poll(start + Duration::from_millis(50)), None);
        assert_eq!(t.poll(start + GATE), Some(4.0));
        assert_eq!(t.poll(start + GATE * 3), None);
        assert_eq!(t.deadline(), None);
    }

    #[test]
    fn offer_after_gate_reopens_forwards_immediately() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(GATE);
        t.offer(1.0, start);
        t.offer(2.0, start + Duration::from_millis(20));
        // Newer value arrives after the gate reopened but before anyone
        // polled: the stale parked one must not win.
        assert_eq!(t.offer(3.0, start + GATE + Duration::from_millis(1)), Some(3.0));
        assert_eq!(t.poll(start + GATE * 5), None);
    }

    #[test]
    fn force_drops_older_parked_value() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(GATE);
        t.offer(1.0, start);
        t.offer(2.0, start + Duration::from_millis(10));
        assert_eq!(t.force(9.0, start + Duration::from_millis(20)), 9.0);
        assert_eq!(t.poll(start + GATE * 5), None);
        // Forced forward also restarts the gate.
        assert_eq!(t.offer(10.0, start + Duration::from_millis(30)), None);
    }

    #[test]
    fn clear_reopens_gate() {
        let start = Instant::now();
        let mut t = RenderThrottle::new(GATE);
        t.offer(1.0, start);
        t.offer(2.0, start + Duration::from_millis(1));
        t.clear();
        assert!(!t.has_pending());
        assert_eq!(t.offer(3.0, start + Duration::from_millis(2)), Some(3.0));
    }
}
