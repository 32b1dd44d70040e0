// protocol/notifier.rs - Termination Notifier

//! One-shot completion signal for a protocol instance. Fires exactly
//! once; every waiter is notified, and a waiter arriving after the firing
//! gets the stored result immediately. Waiter wake-up order is not
//! specified.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use super::machine::{ProtocolFailure, ProtocolResult};

#[derive(Clone)]
pub struct FinishNotifier {
    tx: Arc<watch::Sender<Option<ProtocolResult>>>,
}

impl Default for FinishNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FinishNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the notifier. A second fire is a programming error (the
    /// state machine makes termination unreachable twice), so it is loudly
    /// logged and the first result kept.
    pub fn fire(&self, result: ProtocolResult) {
        if self.tx.borrow().is_some() {
            error!("termination notifier fired twice; the first result is kept");
            debug_assert!(false, "double termination must be blocked by the state machine");
            return;
        }
        self.tx.send_replace(Some(result));
    }

    /// The stored result, if the notifier already fired.
    pub fn peek(&self) -> Option<ProtocolResult> {
        self.tx.borrow().clone()
    }

    /// Suspend until the notifier fires; immediate once fired.
    pub async fn wait(&self) -> ProtocolResult {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                debug_assert!(false, "notifier dropped before firing");
                return Err(ProtocolFailure::Failed(
                    "termination notifier dropped before firing".into(),
                ));
            }
        }
    }
}
