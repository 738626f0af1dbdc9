//! Per-call cancellation and deadlines for store operations.

use crate::error::{StoreError, StoreOp, StoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag a caller flips to abandon in-flight store calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds one detector or store call.
///
/// Every store operation checks its context before starting work and
/// again while waiting on a contended lock or a network round trip.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel:   Option<CancelToken>,
}

impl OpContext {
    /// No deadline, no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline: Some(deadline), cancel: None }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp `ceiling` to the time left, never below one millisecond
    /// (zero means "no timeout" to socket APIs).
    pub fn bound(&self, ceiling: Duration) -> Duration {
        let bounded = match self.remaining() {
            Some(left) => left.min(ceiling),
            None => ceiling,
        };
        bounded.max(Duration::from_millis(1))
    }

    /// Fail fast if the caller cancelled or the deadline passed.
    pub fn check(&self, op: StoreOp) -> StoreResult<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(StoreError::Cancelled { op });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(StoreError::TimedOut { op });
        }
        Ok(())
    }
}

/// Wait strategy for contended locks: yield a few times, then sleep
/// with a doubling delay capped at `MAX_SLEEP`.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const YIELD_LIMIT: u32 = 8;
    const BASE_SLEEP: Duration = Duration::from_micros(50);
    const MAX_SLEEP: Duration = Duration::from_millis(1);

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.step < Self::YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let shift = (self.step - Self::YIELD_LIMIT).min(10);
            std::thread::sleep((Self::BASE_SLEEP * (1u32 << shift)).min(Self::MAX_SLEEP));
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sleeps_once_yields_run_out() {
        let mut backoff = Backoff::new();
        for _ in 0..Backoff::YIELD_LIMIT {
            backoff.snooze();
        }

        // 50 + 100 + 200 + 400 + 800 µs, then 1 ms each.
        let started = Instant::now();
        for _ in 0..8 {
            backoff.snooze();
        }
        assert!(started.elapsed() >= Duration::from_micros(1_550 + 3_000));
    }

    #[test]
    fn background_never_expires() {
        let ctx = OpContext::background();
        assert!(ctx.check(StoreOp::Store).is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn elapsed_deadline_reports_timeout() {
        let ctx = OpContext::with_deadline(Instant::now());
        let err = ctx.check(StoreOp::GetSimilar).unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");
        assert_eq!(err.op(), Some(StoreOp::GetSimilar));
    }

    #[test]
    fn cancellation_wins_over_deadline() {
        let token = CancelToken::new();
        let ctx = OpContext::with_timeout(Duration::from_secs(60)).with_cancel(token.clone());
        assert!(ctx.check(StoreOp::Cleanup).is_ok());

        token.cancel();
        let err = ctx.check(StoreOp::Cleanup).unwrap_err();
        assert!(err.is_cancelled(), "expected cancellation, got {err}");
    }

    #[test]
    fn bound_clamps_to_remaining_time() {
        let ctx = OpContext::with_timeout(Duration::from_millis(50));
        assert!(ctx.bound(Duration::from_secs(5)) <= Duration::from_millis(50));
        assert_eq!(
            OpContext::background().bound(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }
}
