//! Time-boxed authorization for live order placement.
//!
//! Live mode alone is not enough to send real orders. An operator must arm
//! the system, which opens a window of `arm_window_secs`; once the deadline
//! passes the system is disarmed again without any background task. Arming
//! survives restarts because the deadline is persisted to system state and
//! restored on startup.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Shared arm state. The deadline is epoch milliseconds; zero means
/// disarmed. All checks take `now` as an argument so expiry is testable.
#[derive(Debug, Default)]
pub struct ArmController {
    armed_until_ms: AtomicI64,
}

impl ArmController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an arm window ending `window_secs` from `now`. Re-arming while
    /// already armed replaces the deadline rather than extending it.
    pub fn arm(&self, now: DateTime<Utc>, window_secs: i64) -> DateTime<Utc> {
        let deadline = now + chrono::Duration::seconds(window_secs);
        self.armed_until_ms
            .store(deadline.timestamp_millis(), Ordering::SeqCst);
        deadline
    }

    /// Close the window immediately.
    pub fn disarm(&self) {
        self.armed_until_ms.store(0, Ordering::SeqCst);
    }

    /// Restore a persisted deadline after restart. Deadlines already in the
    /// past are ignored.
    pub fn restore(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) {
        if deadline > now {
            self.armed_until_ms
                .store(deadline.timestamp_millis(), Ordering::SeqCst);
        }
    }

    /// Whether the arm window is open at `now`.
    pub fn is_armed(&self, now: DateTime<Utc>) -> bool {
        let deadline = self.armed_until_ms.load(Ordering::SeqCst);
        deadline != 0 && now.timestamp_millis() < deadline
    }

    /// Current deadline, if one is set (possibly already expired).
    pub fn armed_until(&self) -> Option<DateTime<Utc>> {
        match self.armed_until_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Seconds remaining in the window, zero when disarmed or expired.
    /// Rounds up, so a freshly opened window reports its full length even
    /// though the stored deadline is truncated to milliseconds.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.armed_until() {
            Some(deadline) if deadline > now => {
                let ms = (deadline - now).num_milliseconds();
                (ms + 999) / 1000
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_arm_opens_window() {
        let arm = ArmController::new();
        let now = Utc::now();

        assert!(!arm.is_armed(now));
        let deadline = arm.arm(now, 300);
        assert!(arm.is_armed(now));
        assert_eq!((deadline - now).num_seconds(), 300);
        assert_eq!(arm.seconds_remaining(now), 300);
    }

    #[test]
    fn test_remaining_rounds_up_submillisecond_now() {
        let arm = ArmController::new();
        // 123 microseconds past the millisecond boundary
        let now = Utc.timestamp_micros(1_700_000_000_000_123).unwrap();

        arm.arm(now, 300);
        assert_eq!(arm.seconds_remaining(now), 300);
    }

    #[test]
    fn test_window_expires_without_disarm() {
        let arm = ArmController::new();
        let now = Utc::now();

        arm.arm(now, 60);
        assert!(arm.is_armed(now + Duration::seconds(59)));
        assert!(!arm.is_armed(now + Duration::seconds(60)));
        assert_eq!(arm.seconds_remaining(now + Duration::seconds(61)), 0);
    }

    #[test]
    fn test_disarm_closes_immediately() {
        let arm = ArmController::new();
        let now = Utc::now();

        arm.arm(now, 300);
        arm.disarm();
        assert!(!arm.is_armed(now));
        assert!(arm.armed_until().is_none());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let arm = ArmController::new();
        let now = Utc::now();

        arm.arm(now, 300);
        arm.arm(now, 30);
        assert_eq!(arm.seconds_remaining(now), 30);
    }

    #[test]
    fn test_restore_ignores_past_deadlines() {
        let arm = ArmController::new();
        let now = Utc::now();

        arm.restore(now - Duration::seconds(5), now);
        assert!(!arm.is_armed(now));

        arm.restore(now + Duration::seconds(120), now);
        assert!(arm.is_armed(now));
    }
}
