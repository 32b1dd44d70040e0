// protocol/expiration.rs - Expiration Timer

//! Deadline scheduling for protocol instances. A fired timer does not act
//! on the instance directly: it delivers an expiration event into the
//! instance's inbox, where the dispatch state-match rule applies. A timer
//! firing after the instance moved on is therefore a no-op.
//!
//! At most one call is armed per timer; arming again cancels the previous
//! call first.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{self, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("deadline is already in the past")]
    InvalidDeadline,
    #[error("timer is not armed")]
    NotArmed,
}

struct ArmedCall<E> {
    deadline: Timestamp,
    event: E,
    handle: JoinHandle<()>,
}

pub struct ExpirationTimer<E: Clone + Send + 'static> {
    tx: UnboundedSender<E>,
    armed: Option<ArmedCall<E>>,
}

impl<E: Clone + Send + 'static> ExpirationTimer<E> {
    pub fn new(tx: UnboundedSender<E>) -> Self {
        Self { tx, armed: None }
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.armed.as_ref().map(|call| call.deadline)
    }

    /// Schedule `event` for delivery at `deadline`.
    pub fn arm(&mut self, deadline: Timestamp, event: E) -> Result<(), TimerError> {
        self.cancel();
        if clock::left(deadline) < 0 {
            return Err(TimerError::InvalidDeadline);
        }

        let tx = self.tx.clone();
        let fired = event.clone();
        let handle = tokio::spawn(async move {
            clock::sleep_until(deadline).await;
            let _ = tx.send(fired);
        });
        self.armed = Some(ArmedCall {
            deadline,
            event,
            handle,
        });
        Ok(())
    }

    /// Reschedule an armed call to `delay` from now.
    pub fn reset(&mut self, delay: Duration) -> Result<(), TimerError> {
        let call = self.armed.take().ok_or(TimerError::NotArmed)?;
        call.handle.abort();
        self.arm(clock::future(delay), call.event)
    }

    /// Force the armed call to fire on the next tick.
    pub fn expire_now(&mut self) -> Result<(), TimerError> {
        self.reset(Duration::ZERO)
    }

    /// Idempotent: canceling an unarmed or already-fired timer is a no-op.
    pub fn cancel(&mut self) {
        if let Some(call) = self.armed.take() {
            debug!(deadline = ?call.deadline, "canceling expiration call");
            call.handle.abort();
        }
    }
}

impl<E: Clone + Send + 'static> Drop for ExpirationTimer<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_armed_call_fires_at_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ExpirationTimer::new(tx);

        timer
            .arm(clock::future(Duration::from_secs(3)), "expired")
            .unwrap();
        assert!(timer.deadline().is_some());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(rx.recv().await, Some("expired"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel::<&str>();
        let mut timer = ExpirationTimer::new(tx);

        let deadline = clock::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(timer.arm(deadline, "late"), Err(TimerError::InvalidDeadline));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_suppresses_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ExpirationTimer::new(tx);

        timer
            .arm(clock::future(Duration::from_secs(1)), "expired")
            .unwrap();
        timer.cancel();
        timer.cancel();

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ExpirationTimer::new(tx);

        timer
            .arm(clock::future(Duration::from_secs(1)), "first")
            .unwrap();
        timer
            .arm(clock::future(Duration::from_secs(2)), "second")
            .unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(rx.recv().await, Some("second"));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reschedules() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = ExpirationTimer::new(tx);

        assert_eq!(
            timer.reset(Duration::from_secs(1)),
            Err(TimerError::NotArmed)
        );

        timer
            .arm(clock::future(Duration::from_secs(60)), "expired")
            .unwrap();
        timer.expire_now().unwrap();

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(rx.recv().await, Some("expired"));
    }
}
