// protocol/request.rs - Request/Response Exchange

//! The simplest two-sided exchange: an initiator sends a `Request` first
//! message and waits for a single `Response` under a deadline; an
//! interested replier computes the response payload. Duplicate `Request`
//! delivery within a shard is suppressed by the agency traversal log, the
//! same contract announcements use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agency::Agency;
use crate::clock;
use crate::message::{Body, Message, Payload};
use crate::transport::Recipient;

use super::machine::{
    HandlerResult, ProtocolFailure, ProtocolResult, Stale, StateMachine, Transition, dispatch,
};
use super::medium::Medium;
use super::notifier::FinishNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    Requested,
    Completed,
    Error,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplierState {
    Requested,
    Closed,
    Error,
    Expired,
}

/// Parameters for initiating a request.
#[derive(Debug, Clone)]
pub struct RequestTerms {
    pub protocol_id: String,
    pub recipients: Vec<Recipient>,
    pub payload: Payload,
    /// Reply deadline; also the request's expiration on the wire.
    pub window: Duration,
}

/// Agent-supplied responder for inbound requests.
#[async_trait]
pub trait Replier: Send + Sync + 'static {
    async fn requested(
        &self,
        ctx: &ReplierContext,
        request: &Message,
    ) -> Result<Payload, anyhow::Error>;
}

/// Guard surface handed to a replier.
pub struct ReplierContext {
    machine: Arc<StateMachine<ReplierState>>,
}

impl ReplierContext {
    /// Safe-point guard for long-running reply computations.
    pub fn ensure_pending(&self) -> Result<(), Stale> {
        self.machine.ensure_state(&[ReplierState::Requested])
    }
}

// ### Requester ###

#[derive(Clone)]
enum RequesterEv {
    Msg(Message),
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequesterOn {
    Response,
    Duplicate,
    Deadline,
}

fn classify_requester(ev: &RequesterEv) -> Option<RequesterOn> {
    match ev {
        RequesterEv::Msg(msg) => match msg.body {
            Body::Response => Some(RequesterOn::Response),
            Body::Duplicate => Some(RequesterOn::Duplicate),
            _ => None,
        },
        RequesterEv::Deadline => Some(RequesterOn::Deadline),
    }
}

struct RequesterMedium {
    medium: Medium<RequesterState, RequesterEv>,
}

impl RequesterMedium {
    fn on_response(&mut self, ev: RequesterEv) -> HandlerResult {
        let RequesterEv::Msg(msg) = ev else {
            return Ok(());
        };
        if let Some(sender) = msg.sender_id {
            self.medium.set_remote(sender);
        }
        self.medium.terminate(Ok(msg.payload));
        Ok(())
    }

    fn on_duplicate(&mut self, _ev: RequesterEv) -> HandlerResult {
        debug!("request was already served in the target shard");
        Ok(())
    }

    fn on_deadline(&mut self, _ev: RequesterEv) -> HandlerResult {
        self.medium.terminate(Err(ProtocolFailure::Expired));
        Ok(())
    }
}

const REQUESTER_TABLE: &[Transition<RequesterMedium, RequesterState, RequesterOn, RequesterEv>] = &[
    Transition {
        on: RequesterOn::Response,
        before: &[RequesterState::Requested],
        after: RequesterState::Completed,
        handler: RequesterMedium::on_response,
    },
    Transition {
        on: RequesterOn::Duplicate,
        before: &[RequesterState::Requested],
        after: RequesterState::Requested,
        handler: RequesterMedium::on_duplicate,
    },
    Transition {
        on: RequesterOn::Deadline,
        before: &[RequesterState::Requested],
        after: RequesterState::Expired,
        handler: RequesterMedium::on_deadline,
    },
];

/// Initiator-side handle to an in-flight request.
pub struct RequestHandle {
    guid: Uuid,
    machine: Arc<StateMachine<RequesterState>>,
    notifier: FinishNotifier,
}

impl RequestHandle {
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn state(&self) -> RequesterState {
        self.machine.state()
    }

    pub fn is_idle(&self) -> bool {
        !self.machine.in_state(&[RequesterState::Requested])
    }

    pub async fn notify_finish(&self) -> ProtocolResult {
        self.notifier.wait().await
    }

    pub async fn wait_for_state(&self, states: &[RequesterState]) -> RequesterState {
        self.machine.wait_for_state(states).await
    }

    pub fn ensure_state(&self, states: &[RequesterState]) -> Result<(), Stale> {
        self.machine.ensure_state(states)
    }
}

pub(crate) fn begin_requester(agency: &Agency, terms: RequestTerms) -> RequestHandle {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

    let mut medium = Medium::new(
        agency,
        "requester",
        terms.protocol_id.clone(),
        terms.recipients.clone(),
        RequesterState::Requested,
        RequesterState::Error,
        ev_tx.clone(),
        msg_tx,
    );

    let deadline = clock::future(terms.window);
    let mut request = Message::new(Body::Request).with_payload(terms.payload);
    request.traversal_id = Some(Uuid::new_v4());
    request.expiration_time = Some(deadline);

    let handle = RequestHandle {
        guid: medium.guid,
        machine: medium.machine.clone(),
        notifier: medium.notifier.clone(),
    };

    if let Err(err) = medium.send(request) {
        medium.recover(err.into());
        return handle;
    }
    if let Err(err) = medium.timer.arm(deadline, RequesterEv::Deadline) {
        medium.recover(err.into());
        return handle;
    }

    let mut role = RequesterMedium { medium };
    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                msg = msg_rx.recv() => msg.map(RequesterEv::Msg),
                ev = ev_rx.recv() => ev,
            };
            let Some(ev) = ev else { break };
            let Some(on) = classify_requester(&ev) else {
                warn!("requester received unexpected message kind, ignoring");
                continue;
            };
            let machine = role.medium.machine.clone();
            let outcome = dispatch(&mut role, &machine, REQUESTER_TABLE, on, ev);
            role.medium.handle_outcome(outcome);
            if role.medium.finished() {
                break;
            }
        }
    });

    handle
}

// ### Replier ###

#[derive(Clone)]
enum ReplierEv {
    ReplyReady(Payload),
    ReplyFailed(String),
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplierOn {
    ReplyReady,
    ReplyFailed,
    Deadline,
}

fn classify_replier(ev: &ReplierEv) -> ReplierOn {
    match ev {
        ReplierEv::ReplyReady(_) => ReplierOn::ReplyReady,
        ReplierEv::ReplyFailed(_) => ReplierOn::ReplyFailed,
        ReplierEv::Deadline => ReplierOn::Deadline,
    }
}

struct ReplierMedium {
    medium: Medium<ReplierState, ReplierEv>,
}

impl ReplierMedium {
    fn on_reply_ready(&mut self, ev: ReplierEv) -> HandlerResult {
        let ReplierEv::ReplyReady(payload) = ev else {
            return Ok(());
        };
        self.medium
            .send(Message::new(Body::Response).with_payload(payload.clone()))?;
        self.medium.terminate(Ok(payload));
        Ok(())
    }

    fn on_reply_failed(&mut self, ev: ReplierEv) -> HandlerResult {
        let ReplierEv::ReplyFailed(reason) = ev else {
            return Ok(());
        };
        Err(anyhow::anyhow!(reason).into())
    }

    fn on_deadline(&mut self, _ev: ReplierEv) -> HandlerResult {
        self.medium.terminate(Err(ProtocolFailure::Expired));
        Ok(())
    }
}

const REPLIER_TABLE: &[Transition<ReplierMedium, ReplierState, ReplierOn, ReplierEv>] = &[
    Transition {
        on: ReplierOn::ReplyReady,
        before: &[ReplierState::Requested],
        after: ReplierState::Closed,
        handler: ReplierMedium::on_reply_ready,
    },
    Transition {
        on: ReplierOn::ReplyFailed,
        before: &[ReplierState::Requested],
        after: ReplierState::Requested,
        handler: ReplierMedium::on_reply_failed,
    },
    Transition {
        on: ReplierOn::Deadline,
        before: &[ReplierState::Requested],
        after: ReplierState::Expired,
        handler: ReplierMedium::on_deadline,
    },
];

pub(crate) fn begin_replier(agency: &Agency, replier: Arc<dyn Replier>, request: Message) {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (msg_tx, _msg_rx) = mpsc::unbounded_channel();

    let recipients: Vec<Recipient> = request.reply_to.clone().into_iter().collect();
    let mut medium = Medium::new(
        agency,
        "replier",
        request.protocol_id.clone(),
        recipients,
        ReplierState::Requested,
        ReplierState::Error,
        ev_tx.clone(),
        msg_tx,
    );
    if let Some(sender) = request.sender_id {
        medium.set_remote(sender);
    }

    let deadline = request
        .expiration_time
        .unwrap_or_else(|| clock::future(super::medium::DEFAULT_EXPIRATION));
    if let Err(err) = medium.timer.arm(deadline, ReplierEv::Deadline) {
        medium.recover(err.into());
        return;
    }

    let ctx = ReplierContext {
        machine: medium.machine.clone(),
    };
    let worker_tx = ev_tx;
    tokio::spawn(async move {
        match replier.requested(&ctx, &request).await {
            Ok(payload) => {
                let _ = worker_tx.send(ReplierEv::ReplyReady(payload));
            }
            Err(err) if err.is::<Stale>() => {
                debug!("reply computation unwound by stale-state guard");
            }
            Err(err) => {
                let _ = worker_tx.send(ReplierEv::ReplyFailed(format!("{err:#}")));
            }
        }
    });

    let mut role = ReplierMedium { medium };
    tokio::spawn(async move {
        while let Some(ev) = ev_rx.recv().await {
            let machine = role.medium.machine.clone();
            let outcome = dispatch(&mut role, &machine, REPLIER_TABLE, classify_replier(&ev), ev);
            role.medium.handle_outcome(outcome);
            if role.medium.finished() {
                break;
            }
        }
    });
}
