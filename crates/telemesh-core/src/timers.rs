//! Deadline Bookkeeping
//!
//! Each exchange timer is a plain `{armed deadline, action}` pair: the
//! deadline lives here, the action fires in the exchange driver when
//! the deadline is due. Cancellation clears the deadline instead of
//! removing anything from a heap.

use tokio::time::Instant;

/// An armable deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    armed: Option<Instant>,
}

impl Deadline {
    /// An unarmed deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) at the given instant
    pub fn arm(&mut self, at: Instant) {
        self.armed = Some(at);
    }

    /// Disarm
    pub fn cancel(&mut self) {
        self.armed = None;
    }

    /// Is the deadline armed?
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Has the deadline passed? Disarms when it has.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.armed {
            Some(at) if at <= now => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    /// The armed instant, if any
    pub fn at(&self) -> Option<Instant> {
        self.armed
    }
}

/// Earliest of several optional deadlines
pub fn earliest(deadlines: &[Option<Instant>]) -> Option<Instant> {
    deadlines.iter().flatten().min().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fire_only_when_due() {
        let now = Instant::now();
        let mut deadline = Deadline::new();

        assert!(!deadline.fire_if_due(now));

        deadline.arm(now + Duration::from_secs(1));
        assert!(!deadline.fire_if_due(now));
        assert!(deadline.is_armed());

        assert!(deadline.fire_if_due(now + Duration::from_secs(2)));
        assert!(!deadline.is_armed());
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut deadline = Deadline::new();

        deadline.arm(now);
        deadline.cancel();
        assert!(!deadline.fire_if_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(5);

        assert_eq!(earliest(&[None, None]), None);
        assert_eq!(earliest(&[Some(later), Some(now), None]), Some(now));
    }
}
