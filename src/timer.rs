use std::time::{Duration, Instant};

/// Retransmission schedule for handshake probes.
///
/// Attempt `n` (1-based, counting from the first resend) fires at
/// `start + 0.75 * n * (n + 1)` seconds: 1.5 s, 4.5 s, 9 s, 15 s and so
/// on, widening the gap by 1.5 s each round. Once `max_attempts` sends
/// have gone out and the next slot is reached, the schedule is exhausted.
pub struct AttemptSchedule {
    start: Option<Instant>,
    attempts: u32,
    max_attempts: u32,
}

impl AttemptSchedule {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            start: None,
            attempts: 0,
            max_attempts,
        }
    }

    /// Record the initial send.
    pub fn begin(&mut self, now: Instant) {
        self.start = Some(now);
        self.attempts = 1;
    }

    /// Restart the schedule, e.g. after a redirection changed the target.
    pub fn reset(&mut self, now: Instant) {
        self.begin(now);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The instant the next resend is due, if any attempts remain.
    pub fn next_deadline(&self) -> Option<Instant> {
        let start = self.start?;
        let n = self.attempts; // resend n follows send n
        let millis = 750 * u64::from(n) * u64::from(n + 1);
        Some(start + Duration::from_millis(millis))
    }

    /// True once the deadline for the next attempt has passed.
    pub fn due(&self, now: Instant) -> bool {
        match self.next_deadline() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Count one more send.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// All attempts used up.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn quadratic_deadlines() {
        let now = Instant::now();
        let mut sched = AttemptSchedule::new(9);
        sched.begin(now);

        assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(1500)));
        sched.record_attempt();
        assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(4500)));
        sched.record_attempt();
        assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(9000)));
        sched.record_attempt();
        assert_eq!(sched.next_deadline(), Some(now + Duration::from_millis(15000)));
    }

    #[test]
    fn due_and_exhausted() {
        let now = Instant::now();
        let mut sched = AttemptSchedule::new(3);
        sched.begin(now);

        assert!(!sched.due(now));
        assert!(sched.due(now + Duration::from_millis(1500)));

        sched.record_attempt();
        assert!(!sched.exhausted());
        sched.record_attempt();
        assert!(sched.exhausted());
    }

    #[test]
    fn not_due_before_begin() {
        let sched = AttemptSchedule::new(9);
        assert!(!sched.due(Instant::now()));
        assert_eq!(sched.next_deadline(), None);
    }
}
