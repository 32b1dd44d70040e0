// clock.rs - Monotonic Platform Time

//! Monotonic time for the protocol engine.
//!
//! Deadlines travel inside message envelopes, so they are expressed as
//! [`Timestamp`] values: milliseconds since a process-wide origin captured
//! on first use. The origin is a `tokio::time::Instant`, which means every
//! time query and every sleep in the engine respects tokio's paused clock
//! in tests.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Milliseconds since the platform origin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Current platform time.
pub fn now() -> Timestamp {
    Timestamp(Instant::now().duration_since(origin()).as_millis() as i64)
}

/// A point `delta` in the future.
pub fn future(delta: Duration) -> Timestamp {
    Timestamp(now().0 + delta.as_millis() as i64)
}

/// Milliseconds left until `deadline`; negative once the deadline passed.
pub fn left(deadline: Timestamp) -> i64 {
    deadline.0 - now().0
}

fn instant_at(deadline: Timestamp) -> Instant {
    origin() + Duration::from_millis(deadline.0.max(0) as u64)
}

/// Sleep until `deadline`; returns immediately for past deadlines.
pub async fn sleep_until(deadline: Timestamp) {
    tokio::time::sleep_until(instant_at(deadline)).await;
}
