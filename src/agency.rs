// agency.rs - Owning Agency

//! The agency hosts protocol instances: it holds the lookup table from
//! instance guid to inbox, routes inbound messages, suppresses duplicate
//! first messages by `traversal_id`, and collects reported failures. It
//! never holds a back-pointer into an instance: all instance state lives
//! with the instance's own dispatch loop, and the registration is removed
//! at termination.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::{self, Timestamp};
use crate::message::{Body, Message, Payload};
use crate::observability::metrics as obs;
use crate::protocol::contract_net::{self, ContractTerms, Contractor, ManagerHandle};
use crate::protocol::medium::DEFAULT_EXPIRATION;
use crate::protocol::notification::{self, Notified};
use crate::protocol::request::{self, Replier, RequestHandle, RequestTerms};
use crate::protocol::task::{self, AgentTask, TaskHandle};
use crate::transport::{Recipient, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct AgencyConfig {
    /// Endpoint key of this agency inside its shard.
    pub key: String,
    /// Shard this agency is bound to.
    pub shard: String,
}

/// A failure reported by a protocol instance's error path.
#[derive(Debug, Clone)]
pub struct ReportedFailure {
    pub guid: Uuid,
    pub error: String,
}

struct Registration {
    protocol_id: String,
    tx: UnboundedSender<Message>,
}

/// Recently-seen `traversal_id`s of first messages served by this shard
/// endpoint. Entries are retained until the originating message's
/// expiration time and pruned lazily.
#[derive(Default)]
struct TraversalLog {
    seen: HashMap<Uuid, Timestamp>,
}

impl TraversalLog {
    /// Records the traversal if fresh; returns false when already seen.
    fn check_and_record(&mut self, traversal_id: Uuid, keep_until: Timestamp) -> bool {
        let now = clock::now();
        self.seen.retain(|_, expires| *expires >= now);

        match self.seen.get(&traversal_id) {
            Some(_) => false,
            None => {
                self.seen.insert(traversal_id, keep_until);
                true
            }
        }
    }
}

struct AgencyInner {
    key: String,
    shard: String,
    transport: Arc<dyn Transport>,
    instances: DashMap<Uuid, Registration>,
    contractors: DashMap<String, Arc<dyn Contractor>>,
    repliers: DashMap<String, Arc<dyn Replier>>,
    notified: DashMap<String, Arc<dyn Notified>>,
    traversals: Mutex<TraversalLog>,
    failures: Mutex<Vec<ReportedFailure>>,
}

#[derive(Clone)]
pub struct Agency {
    inner: Arc<AgencyInner>,
}

impl Agency {
    /// Open an agency on a transport endpoint and start pumping its
    /// inbound queue.
    pub fn open(
        config: AgencyConfig,
        transport: Arc<dyn Transport>,
        mut inbound: UnboundedReceiver<Message>,
    ) -> Agency {
        let agency = Agency {
            inner: Arc::new(AgencyInner {
                key: config.key,
                shard: config.shard,
                transport,
                instances: DashMap::new(),
                contractors: DashMap::new(),
                repliers: DashMap::new(),
                notified: DashMap::new(),
                traversals: Mutex::new(TraversalLog::default()),
                failures: Mutex::new(Vec::new()),
            }),
        };

        let pump = agency.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                pump.deliver(msg);
            }
        });

        agency
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn shard(&self) -> &str {
        &self.inner.shard
    }

    /// The endpoint replies and duplicates should be addressed to.
    pub fn self_recipient(&self) -> Recipient {
        Recipient::agent(self.inner.key.clone(), self.inner.shard.clone())
    }

    // ### Initiator entry points ###

    pub fn initiate_task(&self, body: Arc<dyn AgentTask>) -> TaskHandle {
        task::begin_task(self, body)
    }

    pub fn initiate_contract(&self, terms: ContractTerms) -> ManagerHandle {
        contract_net::begin_manager(self, terms, None)
    }

    pub fn initiate_request(&self, terms: RequestTerms) -> RequestHandle {
        request::begin_requester(self, terms)
    }

    /// One-way notification to a shard; no instance is created.
    pub fn post_notification(
        &self,
        protocol_id: impl Into<String>,
        recipients: Vec<Recipient>,
        payload: Payload,
    ) -> Result<(), TransportError> {
        notification::post(self, protocol_id.into(), recipients, payload)
    }

    // ### Interest registration ###

    pub fn register_contractor(
        &self,
        protocol_id: impl Into<String>,
        contractor: Arc<dyn Contractor>,
    ) {
        self.inner.contractors.insert(protocol_id.into(), contractor);
    }

    pub fn register_replier(&self, protocol_id: impl Into<String>, replier: Arc<dyn Replier>) {
        self.inner.repliers.insert(protocol_id.into(), replier);
    }

    pub fn register_notified(&self, protocol_id: impl Into<String>, notified: Arc<dyn Notified>) {
        self.inner.notified.insert(protocol_id.into(), notified);
    }

    // ### Instance registry ###

    pub(crate) fn register_instance(
        &self,
        guid: Uuid,
        protocol_id: &str,
        tx: UnboundedSender<Message>,
    ) {
        self.inner.instances.insert(
            guid,
            Registration {
                protocol_id: protocol_id.to_string(),
                tx,
            },
        );
    }

    pub(crate) fn unregister_instance(&self, guid: Uuid) {
        if self.inner.instances.remove(&guid).is_none() {
            debug!(%guid, "unregister of unknown instance");
        }
    }

    /// True when no protocol instance is live.
    pub fn is_idle(&self) -> bool {
        self.inner.instances.is_empty()
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    // ### Collaborator plumbing ###

    pub(crate) fn send_out(
        &self,
        recipients: &[Recipient],
        msg: Message,
        handover: bool,
    ) -> Result<(), TransportError> {
        self.inner.transport.send(recipients, msg, handover)
    }

    pub(crate) fn report_error(&self, guid: Uuid, err: &anyhow::Error) {
        error!(%guid, error = %format!("{err:#}"), "protocol instance failed");
        obs::record_error_reported();
        self.inner.failures.lock().push(ReportedFailure {
            guid,
            error: format!("{err:#}"),
        });
    }

    /// Failures reported by instances, oldest first.
    pub fn reported_failures(&self) -> Vec<ReportedFailure> {
        self.inner.failures.lock().clone()
    }

    // ### Inbound routing ###

    /// Route one inbound message: expired messages are dropped, dialog
    /// messages go to their instance by `receiver_id`, and first messages
    /// pass the traversal check before instantiating a registered
    /// interest.
    pub fn deliver(&self, msg: Message) {
        if let Some(expiration) = msg.expiration_time {
            if clock::left(expiration) < 0 {
                debug!(kind = msg.body.kind_name(), "dropping expired message");
                obs::record_message_dropped("expired");
                return;
            }
        }

        if let Some(receiver) = msg.receiver_id {
            match self.inner.instances.get(&receiver) {
                Some(registration) => {
                    let _ = registration.tx.send(msg);
                }
                None => {
                    debug!(%receiver, kind = msg.body.kind_name(),
                        "message for unknown or terminated instance, dropping");
                    obs::record_message_dropped("unknown-receiver");
                }
            }
            return;
        }

        if !msg.body.is_first_message() {
            warn!(kind = msg.body.kind_name(), "unaddressed dialog message, dropping");
            obs::record_message_dropped("unaddressed");
            return;
        }

        if !self.record_traversal(&msg) {
            debug!(traversal_id = ?msg.traversal_id, protocol_id = %msg.protocol_id,
                "first message already served by this shard");
            obs::record_duplicate_suppressed();
            if let (Some(recipient), Some(reply)) =
                (msg.duplication_recipient(), msg.duplication_message())
            {
                let _ = self.send_out(std::slice::from_ref(recipient), reply, false);
            }
            return;
        }

        match msg.body {
            Body::Announcement { .. } => {
                let interest = self
                    .inner
                    .contractors
                    .get(&msg.protocol_id)
                    .map(|contractor| contractor.clone());
                match interest {
                    Some(contractor) => contract_net::begin_contractor(self, contractor, msg),
                    None => {
                        debug!(protocol_id = %msg.protocol_id, "no contractor interest registered");
                        obs::record_message_dropped("no-interest");
                    }
                }
            }
            Body::Request => {
                let interest = self
                    .inner
                    .repliers
                    .get(&msg.protocol_id)
                    .map(|replier| replier.clone());
                match interest {
                    Some(replier) => request::begin_replier(self, replier, msg),
                    None => {
                        debug!(protocol_id = %msg.protocol_id, "no replier interest registered");
                        obs::record_message_dropped("no-interest");
                    }
                }
            }
            Body::Notification => {
                let interest = self
                    .inner
                    .notified
                    .get(&msg.protocol_id)
                    .map(|notified| notified.clone());
                match interest {
                    Some(handler) => {
                        tokio::spawn(async move { handler.notified(&msg).await });
                    }
                    None => {
                        debug!(protocol_id = %msg.protocol_id, "no notification interest registered");
                        obs::record_message_dropped("no-interest");
                    }
                }
            }
            _ => unreachable!("is_first_message covers the kinds above"),
        }
    }

    /// Records the message's traversal id; false when the exchange was
    /// already served here. Messages without a traversal id always pass.
    fn record_traversal(&self, msg: &Message) -> bool {
        let Some(traversal_id) = msg.traversal_id else {
            return true;
        };
        let keep_until = msg
            .expiration_time
            .unwrap_or_else(|| clock::future(DEFAULT_EXPIRATION));
        self.inner
            .traversals
            .lock()
            .check_and_record(traversal_id, keep_until)
    }

    /// Look up the protocol id an instance was registered under.
    pub fn instance_protocol(&self, guid: Uuid) -> Option<String> {
        self.inner
            .instances
            .get(&guid)
            .map(|registration| registration.protocol_id.clone())
    }
}
