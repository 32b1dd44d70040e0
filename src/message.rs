// message.rs - Message Envelope and Dialog Kinds

//! The message model exchanged between agents.
//!
//! A single [`Message`] envelope carries the routing and lifetime fields
//! shared by every exchange, plus a closed [`Body`] variant set for the
//! per-kind fields. Protocol dispatch is keyed by body kind, so the set is
//! deliberately closed rather than extensible.

use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::transport::Recipient;

/// Opaque key-value message body.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// The kind of exchange a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ProtocolType {
    #[display("task")]
    Task,
    #[display("contract")]
    Contract,
    #[display("request")]
    Request,
    #[display("notification")]
    Notification,
}

/// Closed set of dialog message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Manager call for bids. `level` grows and `max_distance` shrinks as
    /// the contract is nested into neighboring shards; `None` means the
    /// nesting depth is unbounded.
    Announcement {
        level: u32,
        max_distance: Option<u32>,
    },
    /// Contractor offer; ranked by `cost`, lowest wins.
    Bid { cost: f64 },
    /// Contractor declines to bid.
    Refusal { reason: String },
    /// Manager awards the contract. `update_report` asks for progress
    /// reports at the given interval.
    Grant { update_report: Option<Duration> },
    /// Manager turns a bid down.
    Rejection,
    /// Either side aborts the exchange.
    Cancellation { reason: String },
    /// Manager confirms receipt of the final report.
    Acknowledgement,
    /// Contractor progress report.
    UpdateReport,
    /// Contractor terminal report; its payload is the contract outcome.
    FinalReport,
    /// Reply sent instead of a normal response when the `traversal_id`
    /// shows the exchange was already served in this shard.
    Duplicate,
    Request,
    Response,
    Notification,
}

impl Body {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            Body::Request | Body::Response => ProtocolType::Request,
            Body::Notification => ProtocolType::Notification,
            _ => ProtocolType::Contract,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Body::Announcement { .. } => "announcement",
            Body::Bid { .. } => "bid",
            Body::Refusal { .. } => "refusal",
            Body::Grant { .. } => "grant",
            Body::Rejection => "rejection",
            Body::Cancellation { .. } => "cancellation",
            Body::Acknowledgement => "acknowledgement",
            Body::UpdateReport => "update-report",
            Body::FinalReport => "final-report",
            Body::Duplicate => "duplicate",
            Body::Request => "request",
            Body::Response => "response",
            Body::Notification => "notification",
        }
    }

    /// First messages open an exchange and carry a `traversal_id`.
    pub fn is_first_message(&self) -> bool {
        matches!(
            self,
            Body::Announcement { .. } | Body::Request | Body::Notification
        )
    }
}

/// Envelope exchanged between agents.
///
/// `sender_id` / `receiver_id` address protocol instances (their guids),
/// not agents; `reply_to` is the transport endpoint a duplicate or reply
/// should be sent back to. `traversal_id` is assigned once per top-level
/// exchange and preserved unchanged through shard nesting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub protocol_id: String,
    pub sender_id: Option<Uuid>,
    pub receiver_id: Option<Uuid>,
    pub reply_to: Option<Recipient>,
    pub expiration_time: Option<Timestamp>,
    pub traversal_id: Option<Uuid>,
    pub payload: Payload,
    pub body: Body,
}

impl Message {
    pub fn new(body: Body) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            protocol_id: String::new(),
            sender_id: None,
            receiver_id: None,
            reply_to: None,
            expiration_time: None,
            traversal_id: None,
            payload: Payload::new(),
            body,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.body.protocol_type()
    }

    pub fn bid_cost(&self) -> Option<f64> {
        match self.body {
            Body::Bid { cost } => Some(cost),
            _ => None,
        }
    }

    /// Endpoint a [`Body::Duplicate`] reply should be sent to, if any.
    pub fn duplication_recipient(&self) -> Option<&Recipient> {
        match self.body {
            Body::Notification => None,
            _ => self.reply_to.as_ref(),
        }
    }

    /// Reply sent instead of a normal response when this message's
    /// `traversal_id` was already served by the shard. Notifications carry
    /// no dialog fields and are dropped without a reply.
    pub fn duplication_message(&self) -> Option<Message> {
        match self.body {
            Body::Notification => None,
            _ => {
                let mut msg = Message::new(Body::Duplicate);
                msg.protocol_id = self.protocol_id.clone();
                msg.expiration_time = self.expiration_time;
                msg.receiver_id = self.sender_id;
                Some(msg)
            }
        }
    }
}

/// Picks the cheapest bids from the list provided.
///
/// Stable ascending sort by cost: ties keep their input order. Returns all
/// bids when fewer than `number` exist.
pub fn pick_best(bids: &[Message], number: usize) -> Vec<Message> {
    debug_assert!(bids.iter().all(|b| matches!(b.body, Body::Bid { .. })));

    let mut costs: Vec<(f64, &Message)> = bids
        .iter()
        .filter_map(|msg| msg.bid_cost().map(|cost| (cost, msg)))
        .collect();
    costs.sort_by(|a, b| a.0.total_cmp(&b.0));

    costs
        .into_iter()
        .take(number)
        .map(|(_, msg)| msg.clone())
        .collect()
}
