// protocol/medium.rs - Protocol Role Base

//! Per-instance plumbing shared by initiator and interested roles:
//! envelope stamping, outgoing sends, peer handover, the error path, and
//! idempotent termination.
//!
//! Termination order matters: the armed timer is canceled, the notifier
//! fires, and only then is the instance unregistered, so a caller never
//! observes an unregistered instance whose notifier has not fired.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use crate::agency::Agency;
use crate::clock;
use crate::message::Message;
use crate::observability::metrics as obs;
use crate::transport::{Recipient, TransportError};

use super::expiration::ExpirationTimer;
use super::machine::{
    HandlerFailure, HandlerResult, ProtocolFailure, ProtocolResult, ProtocolState, StateMachine,
};
use super::notifier::FinishNotifier;

/// Deadline applied when neither the caller nor the message carries one.
pub(crate) const DEFAULT_EXPIRATION: Duration = Duration::from_secs(10);

pub(crate) struct Medium<S: ProtocolState, E: Clone + Send + 'static> {
    pub guid: Uuid,
    pub kind: &'static str,
    pub agency: Agency,
    pub protocol_id: String,
    pub remote_id: Option<Uuid>,
    pub recipients: Vec<Recipient>,
    pub machine: Arc<StateMachine<S>>,
    pub notifier: FinishNotifier,
    pub timer: ExpirationTimer<E>,
    error_state: S,
}

impl<S: ProtocolState, E: Clone + Send + 'static> Medium<S, E> {
    /// Create the instance plumbing and register it with the agency.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agency: &Agency,
        kind: &'static str,
        protocol_id: String,
        recipients: Vec<Recipient>,
        initial: S,
        error_state: S,
        ev_tx: UnboundedSender<E>,
        msg_tx: UnboundedSender<Message>,
    ) -> Self {
        let guid = Uuid::new_v4();
        agency.register_instance(guid, &protocol_id, msg_tx);
        obs::record_instance_started(kind);
        debug!(%guid, kind, %protocol_id, "protocol instance registered");

        Self {
            guid,
            kind,
            agency: agency.clone(),
            protocol_id,
            remote_id: None,
            recipients,
            machine: Arc::new(StateMachine::new(initial)),
            notifier: FinishNotifier::new(),
            timer: ExpirationTimer::new(ev_tx),
            error_state,
        }
    }

    /// Track the current message-exchange peer. A changed peer means the
    /// message has been handed over; logged, not rejected.
    pub fn set_remote(&mut self, remote_id: Uuid) {
        if let Some(old) = self.remote_id {
            if old != remote_id {
                debug!(%old, new = %remote_id, "remote peer changed, message was handed over");
            }
        }
        self.remote_id = remote_id.into();
    }

    /// Stamp and send through the transport to the default recipients.
    pub fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.send_to(msg, None, None)
    }

    /// Stamp and send, overriding recipients and/or the addressed peer.
    pub fn send_to(
        &self,
        mut msg: Message,
        recipients: Option<&[Recipient]>,
        remote_id: Option<Uuid>,
    ) -> Result<(), TransportError> {
        msg.sender_id = Some(self.guid);
        msg.receiver_id = remote_id.or(self.remote_id);
        msg.protocol_id = self.protocol_id.clone();
        if msg.reply_to.is_none() {
            msg.reply_to = Some(self.agency.self_recipient());
        }
        if msg.expiration_time.is_none() {
            msg.expiration_time = Some(clock::future(DEFAULT_EXPIRATION));
        }

        let recipients = recipients.unwrap_or(&self.recipients);
        obs::record_message_sent(msg.body.kind_name());
        self.agency.send_out(recipients, msg, false)
    }

    /// Re-address a message to the current peer without a state change.
    pub fn handover(&self, mut msg: Message) -> Result<(), TransportError> {
        debug!(remote = ?self.remote_id, "handing message over");
        msg.receiver_id = self.remote_id;
        self.agency.send_out(&self.recipients, msg, true)
    }

    /// True once the notifier fired.
    pub fn finished(&self) -> bool {
        self.notifier.peek().is_some()
    }

    /// Cancel the timer, fire the notifier, unregister. A terminal state
    /// must already be set; repeated termination attempts are blocked at
    /// the dispatch layer, not here.
    pub fn terminate(&mut self, result: ProtocolResult) {
        debug!(guid = %self.guid, kind = self.kind, ok = result.is_ok(), "terminating instance");
        self.timer.cancel();
        self.notifier.fire(result);
        self.agency.unregister_instance(self.guid);
        obs::record_instance_terminated(self.kind);
    }

    /// The recoverable-error path: report once, force the error terminal
    /// state, terminate with the failure as the result.
    pub fn recover(&mut self, err: anyhow::Error) {
        self.agency.report_error(self.guid, &err);
        self.machine.transition(self.error_state);
        self.terminate(Err(ProtocolFailure::Failed(format!("{err:#}"))));
    }

    /// Route a dispatched handler's outcome: stale-state cancellations are
    /// swallowed here, genuine failures take the error path.
    pub fn handle_outcome(&mut self, outcome: Option<HandlerResult>) {
        match outcome {
            None | Some(Ok(())) => {}
            Some(Err(HandlerFailure::Stale(_))) => {
                debug!("swallowing stale-state cancellation at the dispatch boundary");
            }
            Some(Err(HandlerFailure::Failed(err))) => self.recover(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::AgencyConfig;
    use crate::message::{Body, Message};
    use crate::transport::LocalBus;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Open,
        Error,
    }

    fn test_medium(bus: &LocalBus) -> (Medium<Phase, ()>, Agency) {
        let rx = bus.bind("shard-a", "alice");
        let agency = Agency::open(
            AgencyConfig {
                key: "alice".into(),
                shard: "shard-a".into(),
            },
            Arc::new(bus.clone()),
            rx,
        );
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (msg_tx, _msg_rx) = mpsc::unbounded_channel();
        let medium = Medium::new(
            &agency,
            "test",
            "ping".into(),
            vec![Recipient::agent("bob", "shard-a")],
            Phase::Open,
            Phase::Error,
            ev_tx,
            msg_tx,
        );
        (medium, agency)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_stamps_the_envelope() {
        let bus = LocalBus::new();
        let mut bob_rx = bus.bind("shard-a", "bob");
        let (medium, agency) = test_medium(&bus);

        medium.send(Message::new(Body::Request)).unwrap();
        let sent = bob_rx.recv().await.unwrap();

        assert_eq!(sent.sender_id, Some(medium.guid));
        assert_eq!(sent.protocol_id, "ping");
        assert_eq!(sent.reply_to, Some(agency.self_recipient()));
        // No deadline given and none on the message: the default applies.
        let expiration = sent.expiration_time.unwrap();
        assert!(crate::clock::left(expiration) > 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handover_readdresses_to_the_current_peer() {
        let bus = LocalBus::new();
        let mut bob_rx = bus.bind("shard-a", "bob");
        let (mut medium, _agency) = test_medium(&bus);

        let old_peer = Uuid::new_v4();
        let new_peer = Uuid::new_v4();
        medium.set_remote(old_peer);
        // A changed peer is logged, never rejected.
        medium.set_remote(new_peer);

        let mut msg = Message::new(Body::Response);
        msg.receiver_id = Some(old_peer);
        medium.handover(msg).unwrap();

        let sent = bob_rx.recv().await.unwrap();
        assert_eq!(sent.receiver_id, Some(new_peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_fires_before_unregistering() {
        let bus = LocalBus::new();
        let (mut medium, agency) = test_medium(&bus);
        assert_eq!(agency.instance_count(), 1);

        medium.machine.transition(Phase::Error);
        medium.terminate(Ok(crate::message::Payload::new()));

        assert!(medium.notifier.peek().is_some());
        assert!(agency.is_idle());
    }
}
