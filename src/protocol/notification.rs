// protocol/notification.rs - One-Way Notifications

//! Fire-and-forget first messages. A poster stamps a fresh traversal id
//! and sends; receiving agencies run the handler registered for the
//! protocol id once per novel traversal; redelivered notifications are
//! dropped by the shard traversal log without a reply, since they carry
//! no dialog fields. No protocol instance is created on either side.

use async_trait::async_trait;
use uuid::Uuid;

use crate::agency::Agency;
use crate::clock;
use crate::message::{Body, Message, Payload};
use crate::observability::metrics as obs;
use crate::transport::{Recipient, TransportError};

use super::medium::DEFAULT_EXPIRATION;

/// Agent-supplied handler for inbound notifications.
#[async_trait]
pub trait Notified: Send + Sync + 'static {
    async fn notified(&self, notification: &Message);
}

pub(crate) fn post(
    agency: &Agency,
    protocol_id: String,
    recipients: Vec<Recipient>,
    payload: Payload,
) -> Result<(), TransportError> {
    let mut msg = Message::new(Body::Notification).with_payload(payload);
    msg.protocol_id = protocol_id;
    msg.traversal_id = Some(Uuid::new_v4());
    msg.expiration_time = Some(clock::future(DEFAULT_EXPIRATION));
    obs::record_message_sent("notification");
    agency.send_out(&recipients, msg, false)
}
