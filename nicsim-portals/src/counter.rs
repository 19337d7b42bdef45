//! Counting events.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{PtlError, Result};
use crate::polling::{PollTimeout, wait_any};
use crate::types::Size;

/// Success/failure counter pair, sec 3.14.1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtValue {
    pub success: Size,
    pub failure: Size,
}

/// A counting event. Waiters are released when their success threshold is
/// met or any failure is recorded.
#[derive(Debug, Default)]
pub struct CountingEvent {
    value: Mutex<CtValue>,
    notify: Notify,
}

impl CountingEvent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self) -> CtValue {
        *self.value.lock().unwrap()
    }

    pub fn increment_success(&self, amount: Size) {
        {
            let mut value = self.value.lock().unwrap();
            value.success += amount;
        }
        self.notify.notify_waiters();
    }

    pub fn increment(&self, delta: CtValue) {
        {
            let mut value = self.value.lock().unwrap();
            value.success += delta.success;
            value.failure += delta.failure;
        }
        self.notify.notify_waiters();
    }

    pub fn set(&self, new_value: CtValue) {
        *self.value.lock().unwrap() = new_value;
        self.notify.notify_waiters();
    }

    fn satisfied(&self, test: Size) -> Option<CtValue> {
        let value = *self.value.lock().unwrap();
        (value.success >= test || value.failure != 0).then_some(value)
    }

    /// Block until success reaches `test` or a failure is recorded.
    pub async fn wait(&self, test: Size) -> CtValue {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.satisfied(test) {
                return value;
            }
            notified.await;
        }
    }

    /// Wait on several counters with per-counter thresholds. Returns the
    /// index of the first counter whose condition holds, or
    /// `CtNoneReached` on timeout / empty probe.
    pub async fn poll(
        counters: &[Arc<CountingEvent>],
        tests: &[Size],
        timeout_ms: i64,
    ) -> Result<(usize, CtValue)> {
        if counters.is_empty() || counters.len() != tests.len() {
            return Err(PtlError::ArgInvalid);
        }
        let timeout = PollTimeout::parse(timeout_ms)?;
        loop {
            let mut futs = Vec::with_capacity(counters.len());
            for ct in counters {
                let mut fut = Box::pin(ct.notify.notified());
                fut.as_mut().enable();
                futs.push(fut);
            }

            for (i, (ct, test)) in counters.iter().zip(tests).enumerate() {
                if let Some(value) = ct.satisfied(*test) {
                    return Ok((i, value));
                }
            }

            if !wait_any(futs, timeout).await {
                return Err(PtlError::CtNoneReached);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_releases_at_threshold() {
        let ct = CountingEvent::new();
        let waiter = {
            let ct = ct.clone();
            tokio::spawn(async move { ct.wait(3).await })
        };
        ct.increment_success(1);
        ct.increment_success(1);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ct.increment_success(1);
        let value = waiter.await.unwrap();
        assert_eq!(value.success, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_releases_any_waiter() {
        let ct = CountingEvent::new();
        let waiter = {
            let ct = ct.clone();
            tokio::spawn(async move { ct.wait(1000).await })
        };
        ct.increment(CtValue {
            success: 0,
            failure: 1,
        });
        let value = waiter.await.unwrap();
        assert_eq!(value.failure, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_rewinds_and_wakes() {
        let ct = CountingEvent::new();
        ct.increment_success(7);
        ct.set(CtValue::default());
        assert_eq!(ct.get(), CtValue::default());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_matches_per_counter_thresholds() {
        let a = CountingEvent::new();
        let b = CountingEvent::new();
        b.increment_success(2);

        let (which, value) = CountingEvent::poll(&[a.clone(), b.clone()], &[5, 2], 10)
            .await
            .unwrap();
        assert_eq!(which, 1);
        assert_eq!(value.success, 2);

        let err = CountingEvent::poll(&[a, b], &[5, 3], 10).await.unwrap_err();
        assert_eq!(err, PtlError::CtNoneReached);
    }
}
