// protocol/machine.rs - Generic Protocol State Machine

//! The state register and guarded event dispatch shared by every protocol
//! role. The machine is a small component embedded by value in each role;
//! roles stay unrelated types and only share this engine.
//!
//! Dispatch policy: an event whose kind is unknown, or that does not match
//! exactly one table entry for the current state, is logged and dropped.
//! This tolerates reordered, duplicate, and racy delivery; it is the
//! designed behavior, not an error.

use std::fmt::Debug;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::message::Payload;

/// Marker for protocol lifecycle state enums.
pub trait ProtocolState: Copy + Eq + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Debug + Send + Sync + 'static> ProtocolState for T {}

/// Internal guard failure: a bug or a benign race. Logged and the event
/// dropped, never raised to the exchange's caller.
#[derive(Debug, Clone, thiserror::Error)]
#[error("expected state in {expected}, was {actual} instead")]
pub struct StateAssertionError {
    pub expected: String,
    pub actual: String,
}

/// Cooperative-cancellation sentinel.
///
/// Returned by [`StateMachine::ensure_state`] when a continuation finds
/// its exchange no longer in the expected state. Callers branch on it (or
/// propagate it with `?`); the dispatch boundary swallows it. It never
/// reaches the exchange's own error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("exchange is no longer in the expected state")]
pub struct Stale;

/// Terminal failure reasons delivered through the termination notifier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolFailure {
    #[error("protocol deadline passed before completion")]
    Expired,
    #[error("announcement refused: {reason}")]
    Refused { reason: String },
    #[error("bid rejected")]
    Rejected,
    #[error("exchange cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("protocol handler failed: {0}")]
    Failed(String),
}

/// What a terminated exchange resolves to.
pub type ProtocolResult = Result<Payload, ProtocolFailure>;

/// Outcome of a dispatched handler.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The handler hit a stale-state guard; swallowed at the boundary.
    Stale(Stale),
    /// A genuine failure; routed to the role's error path.
    Failed(anyhow::Error),
}

impl From<Stale> for HandlerFailure {
    fn from(stale: Stale) -> Self {
        HandlerFailure::Stale(stale)
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(err: anyhow::Error) -> Self {
        HandlerFailure::Failed(err)
    }
}

impl From<crate::transport::TransportError> for HandlerFailure {
    fn from(err: crate::transport::TransportError) -> Self {
        HandlerFailure::Failed(err.into())
    }
}

impl From<super::expiration::TimerError> for HandlerFailure {
    fn from(err: super::expiration::TimerError) -> Self {
        HandlerFailure::Failed(err.into())
    }
}

pub type HandlerResult = Result<(), HandlerFailure>;

/// The `state` register. Transitions notify `wait_for_state` callers;
/// a same-state transition is a no-op that still notifies.
pub struct StateMachine<S: ProtocolState> {
    tx: watch::Sender<S>,
}

impl<S: ProtocolState> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> S {
        *self.tx.borrow()
    }

    pub fn transition(&self, to: S) {
        let from = self.state();
        if from != to {
            debug!(?from, ?to, "state transition");
        }
        self.tx.send_replace(to);
    }

    pub fn in_state(&self, states: &[S]) -> bool {
        states.contains(&self.state())
    }

    pub fn assert_state(&self, states: &[S]) -> Result<(), StateAssertionError> {
        if self.in_state(states) {
            Ok(())
        } else {
            Err(StateAssertionError {
                expected: format!("{states:?}"),
                actual: format!("{:?}", self.state()),
            })
        }
    }

    /// Guard for long-running continuations: marks a point where the
    /// continuation should unwind if the exchange moved on without it.
    pub fn ensure_state(&self, states: &[S]) -> Result<(), Stale> {
        match self.assert_state(states) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(%err, "stale continuation, unwinding");
                Err(Stale)
            }
        }
    }

    /// Suspend until the state enters `states`; immediate if already there.
    pub async fn wait_for_state(&self, states: &[S]) -> S {
        let mut rx = self.tx.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if states.contains(&current) {
                return current;
            }
            if rx.changed().await.is_err() {
                return current;
            }
        }
    }
}

/// One row of a dispatch table: when `on` arrives in one of `before`,
/// transition to `after` and run `handler`.
pub struct Transition<R, S: ProtocolState, K, E> {
    pub on: K,
    pub before: &'static [S],
    pub after: S,
    pub handler: fn(&mut R, E) -> HandlerResult,
}

/// Guarded event dispatch.
///
/// Returns `None` when the event was dropped by the state-match rule; the
/// handler outcome otherwise. The caller routes `HandlerFailure::Failed`
/// into the role's error path and swallows `HandlerFailure::Stale`.
pub fn dispatch<R, S, K, E>(
    role: &mut R,
    machine: &StateMachine<S>,
    table: &[Transition<R, S, K, E>],
    on: K,
    event: E,
) -> Option<HandlerResult>
where
    S: ProtocolState,
    K: Copy + Eq + Debug,
{
    if !table.iter().any(|t| t.on == on) {
        warn!(event = ?on, "unknown event received, ignoring");
        return None;
    }

    let current = machine.state();
    let mut matching = table
        .iter()
        .filter(|t| t.on == on && t.before.contains(&current));
    let entry = matching.next();
    let ambiguous = matching.next().is_some();

    let Some(entry) = entry else {
        warn!(event = ?on, state = ?current, "event does not match current state, dropping");
        return None;
    };
    if ambiguous {
        warn!(event = ?on, state = ?current, "more than one dispatch entry matches, dropping");
        return None;
    }

    machine.transition(entry.after);
    Some((entry.handler)(role, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Open,
        Busy,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum On {
        Begin,
        Finish,
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<&'static str>,
    }

    fn on_begin(role: &mut Recorder, _ev: ()) -> HandlerResult {
        role.seen.push("begin");
        Ok(())
    }

    fn on_finish(role: &mut Recorder, _ev: ()) -> HandlerResult {
        role.seen.push("finish");
        Ok(())
    }

    const TABLE: &[Transition<Recorder, Phase, On, ()>] = &[
        Transition {
            on: On::Begin,
            before: &[Phase::Open],
            after: Phase::Busy,
            handler: on_begin,
        },
        Transition {
            on: On::Finish,
            before: &[Phase::Busy],
            after: Phase::Done,
            handler: on_finish,
        },
    ];

    #[tokio::test]
    async fn test_dispatch_follows_table() {
        let machine = StateMachine::new(Phase::Open);
        let mut role = Recorder::default();

        assert!(dispatch(&mut role, &machine, TABLE, On::Begin, ()).is_some());
        assert_eq!(machine.state(), Phase::Busy);
        assert!(dispatch(&mut role, &machine, TABLE, On::Finish, ()).is_some());
        assert_eq!(machine.state(), Phase::Done);
        assert_eq!(role.seen, vec!["begin", "finish"]);
    }

    #[tokio::test]
    async fn test_dispatch_drops_state_mismatch() {
        let machine = StateMachine::new(Phase::Open);
        let mut role = Recorder::default();

        // Finish is only valid in Busy: dropped, no transition, no handler.
        assert!(dispatch(&mut role, &machine, TABLE, On::Finish, ()).is_none());
        assert_eq!(machine.state(), Phase::Open);
        assert!(role.seen.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_state_ignores_further_events() {
        let machine = StateMachine::new(Phase::Open);
        let mut role = Recorder::default();

        dispatch(&mut role, &machine, TABLE, On::Begin, ());
        dispatch(&mut role, &machine, TABLE, On::Finish, ());

        // Duplicate delivery after the terminal state: no-op.
        assert!(dispatch(&mut role, &machine, TABLE, On::Finish, ()).is_none());
        assert_eq!(machine.state(), Phase::Done);
        assert_eq!(role.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_state_resolves_on_transition() {
        let machine = Arc::new(StateMachine::new(Phase::Open));

        let waiter = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.wait_for_state(&[Phase::Done]).await })
        };
        tokio::task::yield_now().await;

        machine.transition(Phase::Done);
        let reached = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reached, Phase::Done);
    }

    #[tokio::test]
    async fn test_wait_for_state_immediate_when_already_there() {
        let machine = StateMachine::new(Phase::Busy);
        assert_eq!(machine.wait_for_state(&[Phase::Busy]).await, Phase::Busy);
    }

    #[test]
    fn test_ensure_state_returns_stale_sentinel() {
        let machine = StateMachine::new(Phase::Open);
        assert!(machine.ensure_state(&[Phase::Open]).is_ok());
        assert_eq!(machine.ensure_state(&[Phase::Done]), Err(Stale));
        assert!(machine.assert_state(&[Phase::Done]).is_err());
    }
}
