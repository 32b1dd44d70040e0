// protocol/contract_net.rs - Contract-Net Negotiation

//! The bidding algorithm: a manager announces a contract into a shard,
//! collects bids under a deadline, grants the cheapest and rejects the
//! rest, then waits for the winner's final report. A contractor that
//! cannot serve locally may re-announce into a neighboring shard with the
//! nesting level incremented and the remaining distance decremented; the
//! `traversal_id` rides along unchanged so a shard that already served
//! the exchange answers `Duplicate` instead of bidding twice.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agency::Agency;
use crate::clock;
use crate::message::{Body, Message, Payload, pick_best};
use crate::transport::Recipient;

use super::machine::{
    HandlerResult, ProtocolFailure, ProtocolResult, Stale, StateMachine, Transition, dispatch,
};
use super::medium::{DEFAULT_EXPIRATION, Medium};
use super::notifier::FinishNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Initiated,
    Announced,
    Closed,
    Granted,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractorState {
    Idle,
    Bid,
    Waiting,
    Working,
    Reported,
    Rejected,
    Refused,
    Expired,
    Cancelled,
    Failed,
}

/// Parameters of a contract announcement.
#[derive(Debug, Clone)]
pub struct ContractTerms {
    pub protocol_id: String,
    pub recipients: Vec<Recipient>,
    pub payload: Payload,
    /// How long bids are collected after the announcement.
    pub bid_window: Duration,
    /// How long the manager waits for the final report after granting.
    pub report_window: Duration,
    /// Number of winners granted; the rest are rejected.
    pub grants: usize,
    /// Ask winners for progress reports at this interval.
    pub update_report: Option<Duration>,
    /// Remaining shard-nesting hops; `None` is unbounded.
    pub max_distance: Option<u32>,
}

impl ContractTerms {
    pub fn new(protocol_id: impl Into<String>, recipients: Vec<Recipient>) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            recipients,
            payload: Payload::new(),
            bid_window: DEFAULT_EXPIRATION,
            report_window: DEFAULT_EXPIRATION,
            grants: 1,
            update_report: None,
            max_distance: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_bid_window(mut self, window: Duration) -> Self {
        self.bid_window = window;
        self
    }

    pub fn with_report_window(mut self, window: Duration) -> Self {
        self.report_window = window;
        self
    }

    pub fn with_grants(mut self, grants: usize) -> Self {
        self.grants = grants;
        self
    }

    pub fn with_update_report(mut self, interval: Duration) -> Self {
        self.update_report = Some(interval);
        self
    }

    pub fn with_max_distance(mut self, hops: u32) -> Self {
        self.max_distance = Some(hops);
        self
    }
}

/// Carried through `re_announce` so a nested announcement keeps the
/// top-level traversal id and the adjusted nesting bounds.
pub(crate) struct NestedParams {
    pub level: u32,
    pub max_distance: Option<u32>,
    pub traversal_id: Uuid,
}

// ### Manager ###

#[derive(Clone)]
enum ManagerEv {
    Msg(Message),
    Deadline,
    Close,
    Cancel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerOn {
    Bid,
    Refusal,
    Duplicate,
    UpdateReport,
    FinalReport,
    Deadline,
    Close,
    Cancel,
}

fn classify_manager(ev: &ManagerEv) -> Option<ManagerOn> {
    match ev {
        ManagerEv::Msg(msg) => match msg.body {
            Body::Bid { .. } => Some(ManagerOn::Bid),
            Body::Refusal { .. } => Some(ManagerOn::Refusal),
            Body::Duplicate => Some(ManagerOn::Duplicate),
            Body::UpdateReport => Some(ManagerOn::UpdateReport),
            Body::FinalReport => Some(ManagerOn::FinalReport),
            _ => None,
        },
        ManagerEv::Deadline => Some(ManagerOn::Deadline),
        ManagerEv::Close => Some(ManagerOn::Close),
        ManagerEv::Cancel(_) => Some(ManagerOn::Cancel),
    }
}

struct ManagerMedium {
    medium: Medium<ManagerState, ManagerEv>,
    terms: ContractTerms,
    bids: Vec<Message>,
    refusals: usize,
    duplicates: usize,
    updates: usize,
}

impl ManagerMedium {
    fn on_bid(&mut self, ev: ManagerEv) -> HandlerResult {
        let ManagerEv::Msg(bid) = ev else {
            return Ok(());
        };
        debug!(cost = ?bid.bid_cost(), "bid collected");
        self.bids.push(bid);
        Ok(())
    }

    fn on_refusal(&mut self, _ev: ManagerEv) -> HandlerResult {
        self.refusals += 1;
        Ok(())
    }

    fn on_duplicate(&mut self, _ev: ManagerEv) -> HandlerResult {
        debug!("announcement hit a shard that already served this exchange");
        self.duplicates += 1;
        Ok(())
    }

    /// Close of the bid-collection period: deadline or explicit close.
    fn on_close(&mut self, _ev: ManagerEv) -> HandlerResult {
        if self.bids.is_empty() {
            debug!(
                refusals = self.refusals,
                duplicates = self.duplicates,
                "announcement closed without bids"
            );
            self.medium.machine.transition(ManagerState::Expired);
            self.medium.terminate(Err(ProtocolFailure::Expired));
            return Ok(());
        }

        let winners = pick_best(&self.bids, self.terms.grants);
        let winner_ids: Vec<Uuid> = winners.iter().map(|bid| bid.message_id).collect();
        let report_deadline = clock::future(self.terms.report_window);

        for bid in &self.bids {
            let recipients: Vec<Recipient> = bid.reply_to.clone().into_iter().collect();
            let reply = if winner_ids.contains(&bid.message_id) {
                let mut grant = Message::new(Body::Grant {
                    update_report: self.terms.update_report,
                });
                grant.expiration_time = Some(report_deadline);
                grant
            } else {
                Message::new(Body::Rejection)
            };
            self.medium.send_to(reply, Some(&recipients), bid.sender_id)?;
        }

        self.medium.machine.transition(ManagerState::Granted);
        self.medium.timer.arm(report_deadline, ManagerEv::Deadline)?;
        Ok(())
    }

    fn on_update(&mut self, _ev: ManagerEv) -> HandlerResult {
        self.updates += 1;
        Ok(())
    }

    fn on_final_report(&mut self, ev: ManagerEv) -> HandlerResult {
        let ManagerEv::Msg(report) = ev else {
            return Ok(());
        };
        debug!(updates = self.updates, "final report received");
        let recipients: Vec<Recipient> = report.reply_to.clone().into_iter().collect();
        self.medium.send_to(
            Message::new(Body::Acknowledgement),
            Some(&recipients),
            report.sender_id,
        )?;
        self.medium.terminate(Ok(report.payload));
        Ok(())
    }

    fn on_report_timeout(&mut self, _ev: ManagerEv) -> HandlerResult {
        self.medium.terminate(Err(ProtocolFailure::Expired));
        Ok(())
    }

    fn on_cancel(&mut self, ev: ManagerEv) -> HandlerResult {
        let ManagerEv::Cancel(reason) = ev else {
            return Ok(());
        };
        for bid in &self.bids {
            let recipients: Vec<Recipient> = bid.reply_to.clone().into_iter().collect();
            self.medium.send_to(
                Message::new(Body::Cancellation {
                    reason: reason.clone(),
                }),
                Some(&recipients),
                bid.sender_id,
            )?;
        }
        self.medium
            .terminate(Err(ProtocolFailure::Cancelled { reason }));
        Ok(())
    }
}

const MANAGER_TABLE: &[Transition<ManagerMedium, ManagerState, ManagerOn, ManagerEv>] = &[
    Transition {
        on: ManagerOn::Bid,
        before: &[ManagerState::Announced],
        after: ManagerState::Announced,
        handler: ManagerMedium::on_bid,
    },
    Transition {
        on: ManagerOn::Refusal,
        before: &[ManagerState::Announced],
        after: ManagerState::Announced,
        handler: ManagerMedium::on_refusal,
    },
    Transition {
        on: ManagerOn::Duplicate,
        before: &[ManagerState::Announced],
        after: ManagerState::Announced,
        handler: ManagerMedium::on_duplicate,
    },
    Transition {
        on: ManagerOn::Deadline,
        before: &[ManagerState::Announced],
        after: ManagerState::Closed,
        handler: ManagerMedium::on_close,
    },
    Transition {
        on: ManagerOn::Close,
        before: &[ManagerState::Announced],
        after: ManagerState::Closed,
        handler: ManagerMedium::on_close,
    },
    Transition {
        on: ManagerOn::Deadline,
        before: &[ManagerState::Granted],
        after: ManagerState::Expired,
        handler: ManagerMedium::on_report_timeout,
    },
    Transition {
        on: ManagerOn::UpdateReport,
        before: &[ManagerState::Granted],
        after: ManagerState::Granted,
        handler: ManagerMedium::on_update,
    },
    Transition {
        on: ManagerOn::FinalReport,
        before: &[ManagerState::Granted],
        after: ManagerState::Completed,
        handler: ManagerMedium::on_final_report,
    },
    Transition {
        on: ManagerOn::Cancel,
        before: &[ManagerState::Announced, ManagerState::Closed],
        after: ManagerState::Cancelled,
        handler: ManagerMedium::on_cancel,
    },
];

/// Initiator-side handle to a running negotiation.
pub struct ManagerHandle {
    guid: Uuid,
    machine: Arc<StateMachine<ManagerState>>,
    notifier: FinishNotifier,
    tx: UnboundedSender<ManagerEv>,
}

impl ManagerHandle {
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn state(&self) -> ManagerState {
        self.machine.state()
    }

    pub fn is_idle(&self) -> bool {
        self.notifier.peek().is_some()
    }

    pub async fn notify_finish(&self) -> ProtocolResult {
        self.notifier.wait().await
    }

    pub async fn wait_for_state(&self, states: &[ManagerState]) -> ManagerState {
        self.machine.wait_for_state(states).await
    }

    pub fn ensure_state(&self, states: &[ManagerState]) -> Result<(), Stale> {
        self.machine.ensure_state(states)
    }

    /// End bid collection now instead of waiting for the deadline.
    pub fn close_now(&self) {
        let _ = self.tx.send(ManagerEv::Close);
    }

    /// Cancel the negotiation; every known bidder is sent a
    /// `Cancellation` carrying `reason`.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ManagerEv::Cancel(reason.into()));
    }
}

pub(crate) fn begin_manager(
    agency: &Agency,
    terms: ContractTerms,
    nested: Option<NestedParams>,
) -> ManagerHandle {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

    let mut medium = Medium::new(
        agency,
        "contract-manager",
        terms.protocol_id.clone(),
        terms.recipients.clone(),
        ManagerState::Initiated,
        ManagerState::Failed,
        ev_tx.clone(),
        msg_tx,
    );

    let (level, max_distance, traversal_id) = match &nested {
        Some(params) => (params.level, params.max_distance, params.traversal_id),
        None => (0, terms.max_distance, Uuid::new_v4()),
    };

    let bid_deadline = clock::future(terms.bid_window);
    let mut announcement = Message::new(Body::Announcement {
        level,
        max_distance,
    })
    .with_payload(terms.payload.clone());
    announcement.traversal_id = Some(traversal_id);
    announcement.expiration_time = Some(bid_deadline);

    let handle = ManagerHandle {
        guid: medium.guid,
        machine: medium.machine.clone(),
        notifier: medium.notifier.clone(),
        tx: ev_tx,
    };

    if let Err(err) = medium.send(announcement) {
        medium.recover(err.into());
        return handle;
    }
    medium.machine.transition(ManagerState::Announced);
    if let Err(err) = medium.timer.arm(bid_deadline, ManagerEv::Deadline) {
        medium.recover(err.into());
        return handle;
    }

    let mut role = ManagerMedium {
        medium,
        terms,
        bids: Vec::new(),
        refusals: 0,
        duplicates: 0,
        updates: 0,
    };
    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                msg = msg_rx.recv() => msg.map(ManagerEv::Msg),
                ev = ev_rx.recv() => ev,
            };
            let Some(ev) = ev else { break };
            let Some(on) = classify_manager(&ev) else {
                warn!("manager received unexpected message kind, ignoring");
                continue;
            };
            let machine = role.medium.machine.clone();
            let outcome = dispatch(&mut role, &machine, MANAGER_TABLE, on, ev);
            role.medium.handle_outcome(outcome);
            if role.medium.finished() {
                break;
            }
        }
    });

    handle
}

// ### Contractor ###

/// What a contractor decides about an announcement.
pub enum BidDecision {
    Bid { cost: f64, payload: Payload },
    Refuse { reason: String },
}

/// Refused re-announcement: the announcement already used up its nesting
/// distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("announcement reached its maximum nesting distance")]
pub struct NestingRefused;

/// Agent-supplied contractor logic for one protocol id.
#[async_trait]
pub trait Contractor: Send + Sync + 'static {
    /// Evaluate feasibility of an announcement.
    async fn announced(
        &self,
        ctx: &ContractorContext,
        announcement: &Message,
    ) -> Result<BidDecision, anyhow::Error>;

    /// Perform the granted work; the returned payload becomes the final
    /// report.
    async fn granted(
        &self,
        ctx: &ContractorContext,
        grant: &Message,
    ) -> Result<Payload, anyhow::Error>;

    /// The manager turned the bid down.
    async fn rejected(&self, _rejection: &Message) {}

    /// The exchange was cancelled; any side effects should be rolled
    /// back.
    async fn cancelled(&self, _reason: &str) {}
}

/// Guard checks and nesting support handed to contractor logic.
pub struct ContractorContext {
    agency: Agency,
    machine: Arc<StateMachine<ContractorState>>,
    announcement: Message,
    level: u32,
    max_distance: Option<u32>,
    traversal_id: Uuid,
}

impl ContractorContext {
    pub fn announcement(&self) -> &Message {
        &self.announcement
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn max_distance(&self) -> Option<u32> {
        self.max_distance
    }

    pub fn ensure_state(&self, states: &[ContractorState]) -> Result<(), Stale> {
        self.machine.ensure_state(states)
    }

    /// Safe-point guard for announcement evaluation.
    pub fn ensure_evaluating(&self) -> Result<(), Stale> {
        self.machine.ensure_state(&[ContractorState::Idle])
    }

    /// Safe-point guard for granted work.
    pub fn ensure_working(&self) -> Result<(), Stale> {
        self.machine
            .ensure_state(&[ContractorState::Waiting, ContractorState::Working])
    }

    /// Re-announce this contract into a neighboring shard: the nesting
    /// level grows, the remaining distance shrinks, and the traversal id
    /// rides along unchanged. Refused when the distance is used up,
    /// regardless of feasibility.
    pub fn re_announce(
        &self,
        recipients: Vec<Recipient>,
        bid_window: Duration,
    ) -> Result<ManagerHandle, NestingRefused> {
        let max_distance = match self.max_distance {
            Some(0) => return Err(NestingRefused),
            Some(hops) => Some(hops - 1),
            None => None,
        };

        let terms = ContractTerms::new(self.announcement.protocol_id.clone(), recipients)
            .with_payload(self.announcement.payload.clone())
            .with_bid_window(bid_window);
        Ok(begin_manager(
            &self.agency,
            terms,
            Some(NestedParams {
                level: self.level + 1,
                max_distance,
                traversal_id: self.traversal_id,
            }),
        ))
    }
}

#[derive(Clone)]
enum ContractorEv {
    Msg(Message),
    BidReady { cost: f64, payload: Payload },
    RefuseReady { reason: String },
    EvalFailed(String),
    WorkBegun,
    WorkDone(Payload),
    WorkFailed(String),
    Tick,
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContractorOn {
    Grant,
    Rejection,
    Cancellation,
    BidReady,
    RefuseReady,
    EvalFailed,
    WorkBegun,
    WorkDone,
    WorkFailed,
    Tick,
    Deadline,
}

fn classify_contractor(ev: &ContractorEv) -> Option<ContractorOn> {
    match ev {
        ContractorEv::Msg(msg) => match msg.body {
            Body::Grant { .. } => Some(ContractorOn::Grant),
            Body::Rejection => Some(ContractorOn::Rejection),
            Body::Cancellation { .. } => Some(ContractorOn::Cancellation),
            _ => None,
        },
        ContractorEv::BidReady { .. } => Some(ContractorOn::BidReady),
        ContractorEv::RefuseReady { .. } => Some(ContractorOn::RefuseReady),
        ContractorEv::EvalFailed(_) => Some(ContractorOn::EvalFailed),
        ContractorEv::WorkBegun => Some(ContractorOn::WorkBegun),
        ContractorEv::WorkDone(_) => Some(ContractorOn::WorkDone),
        ContractorEv::WorkFailed(_) => Some(ContractorOn::WorkFailed),
        ContractorEv::Tick => Some(ContractorOn::Tick),
        ContractorEv::Deadline => Some(ContractorOn::Deadline),
    }
}

struct ContractorMedium {
    medium: Medium<ContractorState, ContractorEv>,
    behavior: Arc<dyn Contractor>,
    ctx: Arc<ContractorContext>,
    ev_tx: UnboundedSender<ContractorEv>,
    update_interval: Option<Duration>,
    work: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ContractorMedium {
    fn on_bid_ready(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::BidReady { cost, payload } = ev else {
            return Ok(());
        };
        // The bid opens a fresh window: the announcement deadline is the
        // manager's close time, and the grant or rejection can only
        // arrive after it.
        let bid_deadline = clock::future(DEFAULT_EXPIRATION);
        let mut bid = Message::new(Body::Bid { cost }).with_payload(payload);
        bid.expiration_time = Some(bid_deadline);
        self.medium.send(bid)?;
        self.medium.timer.arm(bid_deadline, ContractorEv::Deadline)?;
        Ok(())
    }

    fn on_refuse_ready(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::RefuseReady { reason } = ev else {
            return Ok(());
        };
        self.medium.send(Message::new(Body::Refusal {
            reason: reason.clone(),
        }))?;
        self.medium
            .terminate(Err(ProtocolFailure::Refused { reason }));
        Ok(())
    }

    fn on_eval_failed(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::EvalFailed(reason) = ev else {
            return Ok(());
        };
        Err(anyhow::anyhow!(reason).into())
    }

    fn on_grant(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::Msg(grant) = ev else {
            return Ok(());
        };
        // The bid-collection deadline no longer applies; the manager's
        // report window takes over on its side.
        self.medium.timer.cancel();
        if let Body::Grant { update_report } = grant.body {
            self.update_interval = update_report;
        }

        let behavior = self.behavior.clone();
        let ctx = self.ctx.clone();
        let tx = self.ev_tx.clone();
        self.work = Some(tokio::spawn(async move {
            let _ = tx.send(ContractorEv::WorkBegun);
            match behavior.granted(&ctx, &grant).await {
                Ok(payload) => {
                    let _ = tx.send(ContractorEv::WorkDone(payload));
                }
                Err(err) if err.is::<Stale>() => {
                    debug!("granted work unwound by stale-state guard");
                }
                Err(err) => {
                    let _ = tx.send(ContractorEv::WorkFailed(format!("{err:#}")));
                }
            }
        }));
        Ok(())
    }

    fn on_work_begun(&mut self, _ev: ContractorEv) -> HandlerResult {
        if let Some(interval) = self.update_interval {
            let tx = self.ev_tx.clone();
            self.ticker = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if tx.send(ContractorEv::Tick).is_err() {
                        break;
                    }
                }
            }));
        }
        Ok(())
    }

    fn on_tick(&mut self, _ev: ContractorEv) -> HandlerResult {
        self.medium.send(Message::new(Body::UpdateReport))?;
        Ok(())
    }

    fn on_work_done(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::WorkDone(payload) = ev else {
            return Ok(());
        };
        self.medium
            .send(Message::new(Body::FinalReport).with_payload(payload.clone()))?;
        self.medium.terminate(Ok(payload));
        Ok(())
    }

    fn on_work_failed(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::WorkFailed(reason) = ev else {
            return Ok(());
        };
        Err(anyhow::anyhow!(reason).into())
    }

    fn on_rejection(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::Msg(rejection) = ev else {
            return Ok(());
        };
        let behavior = self.behavior.clone();
        tokio::spawn(async move { behavior.rejected(&rejection).await });
        self.medium.terminate(Err(ProtocolFailure::Rejected));
        Ok(())
    }

    fn on_cancellation(&mut self, ev: ContractorEv) -> HandlerResult {
        let ContractorEv::Msg(cancellation) = ev else {
            return Ok(());
        };
        let reason = match &cancellation.body {
            Body::Cancellation { reason } => reason.clone(),
            _ => String::new(),
        };
        if let Some(work) = self.work.take() {
            work.abort();
        }
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        let behavior = self.behavior.clone();
        let hook_reason = reason.clone();
        tokio::spawn(async move { behavior.cancelled(&hook_reason).await });
        self.medium
            .terminate(Err(ProtocolFailure::Cancelled { reason }));
        Ok(())
    }

    fn on_deadline(&mut self, _ev: ContractorEv) -> HandlerResult {
        self.medium.terminate(Err(ProtocolFailure::Expired));
        Ok(())
    }
}

const CONTRACTOR_TABLE: &[Transition<ContractorMedium, ContractorState, ContractorOn, ContractorEv>] = &[
    Transition {
        on: ContractorOn::BidReady,
        before: &[ContractorState::Idle],
        after: ContractorState::Bid,
        handler: ContractorMedium::on_bid_ready,
    },
    Transition {
        on: ContractorOn::RefuseReady,
        before: &[ContractorState::Idle],
        after: ContractorState::Refused,
        handler: ContractorMedium::on_refuse_ready,
    },
    Transition {
        on: ContractorOn::EvalFailed,
        before: &[ContractorState::Idle],
        after: ContractorState::Idle,
        handler: ContractorMedium::on_eval_failed,
    },
    Transition {
        on: ContractorOn::Grant,
        before: &[ContractorState::Bid],
        after: ContractorState::Waiting,
        handler: ContractorMedium::on_grant,
    },
    Transition {
        on: ContractorOn::Rejection,
        before: &[ContractorState::Bid],
        after: ContractorState::Rejected,
        handler: ContractorMedium::on_rejection,
    },
    Transition {
        on: ContractorOn::WorkBegun,
        before: &[ContractorState::Waiting],
        after: ContractorState::Working,
        handler: ContractorMedium::on_work_begun,
    },
    Transition {
        on: ContractorOn::WorkDone,
        before: &[ContractorState::Working],
        after: ContractorState::Reported,
        handler: ContractorMedium::on_work_done,
    },
    Transition {
        on: ContractorOn::WorkFailed,
        before: &[ContractorState::Working],
        after: ContractorState::Working,
        handler: ContractorMedium::on_work_failed,
    },
    Transition {
        on: ContractorOn::Tick,
        before: &[ContractorState::Working],
        after: ContractorState::Working,
        handler: ContractorMedium::on_tick,
    },
    // A cancellation may arrive while the bid is still pending or after
    // the grant; granted contractors must abort their work either way.
    Transition {
        on: ContractorOn::Cancellation,
        before: &[
            ContractorState::Bid,
            ContractorState::Waiting,
            ContractorState::Working,
        ],
        after: ContractorState::Cancelled,
        handler: ContractorMedium::on_cancellation,
    },
    Transition {
        on: ContractorOn::Deadline,
        before: &[ContractorState::Idle, ContractorState::Bid],
        after: ContractorState::Expired,
        handler: ContractorMedium::on_deadline,
    },
];

pub(crate) fn begin_contractor(
    agency: &Agency,
    behavior: Arc<dyn Contractor>,
    announcement: Message,
) {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

    let recipients: Vec<Recipient> = announcement.reply_to.clone().into_iter().collect();
    let mut medium = Medium::new(
        agency,
        "contractor",
        announcement.protocol_id.clone(),
        recipients,
        ContractorState::Idle,
        ContractorState::Failed,
        ev_tx.clone(),
        msg_tx,
    );
    if let Some(sender) = announcement.sender_id {
        medium.set_remote(sender);
    }

    let deadline = announcement
        .expiration_time
        .unwrap_or_else(|| clock::future(DEFAULT_EXPIRATION));
    if let Err(err) = medium.timer.arm(deadline, ContractorEv::Deadline) {
        medium.recover(err.into());
        return;
    }

    let (level, max_distance) = match announcement.body {
        Body::Announcement {
            level,
            max_distance,
        } => (level, max_distance),
        _ => (0, None),
    };
    let ctx = Arc::new(ContractorContext {
        agency: agency.clone(),
        machine: medium.machine.clone(),
        traversal_id: announcement.traversal_id.unwrap_or_else(Uuid::new_v4),
        announcement: announcement.clone(),
        level,
        max_distance,
    });

    let eval_behavior = behavior.clone();
    let eval_ctx = ctx.clone();
    let eval_tx = ev_tx.clone();
    tokio::spawn(async move {
        match eval_behavior.announced(&eval_ctx, &announcement).await {
            Ok(BidDecision::Bid { cost, payload }) => {
                let _ = eval_tx.send(ContractorEv::BidReady { cost, payload });
            }
            Ok(BidDecision::Refuse { reason }) => {
                let _ = eval_tx.send(ContractorEv::RefuseReady { reason });
            }
            Err(err) if err.is::<Stale>() => {
                debug!("announcement evaluation unwound by stale-state guard");
            }
            Err(err) => {
                let _ = eval_tx.send(ContractorEv::EvalFailed(format!("{err:#}")));
            }
        }
    });

    let mut role = ContractorMedium {
        medium,
        behavior,
        ctx,
        ev_tx,
        update_interval: None,
        work: None,
        ticker: None,
    };
    tokio::spawn(async move {
        loop {
            let ev = tokio::select! {
                msg = msg_rx.recv() => msg.map(ContractorEv::Msg),
                ev = ev_rx.recv() => ev,
            };
            let Some(ev) = ev else { break };
            let Some(on) = classify_contractor(&ev) else {
                warn!("contractor received unexpected message kind, ignoring");
                continue;
            };
            let machine = role.medium.machine.clone();
            let outcome = dispatch(&mut role, &machine, CONTRACTOR_TABLE, on, ev);
            role.medium.handle_outcome(outcome);
            if role.medium.finished() {
                break;
            }
        }
        if let Some(work) = role.work.take() {
            work.abort();
        }
        if let Some(ticker) = role.ticker.take() {
            ticker.abort();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agency::AgencyConfig;
    use crate::transport::{LocalBus, Transport};
    use parking_lot::Mutex;

    fn open_agency(bus: &LocalBus, shard: &str, key: &str) -> Agency {
        let rx = bus.bind(shard, key);
        Agency::open(
            AgencyConfig {
                key: key.into(),
                shard: shard.into(),
            },
            Arc::new(bus.clone()),
            rx,
        )
    }

    fn payload(key: &str, value: &str) -> Payload {
        let mut p = Payload::new();
        p.insert(key.into(), serde_json::Value::String(value.into()));
        p
    }

    /// Bids a fixed cost; the granted work reports which worker served.
    struct StaticBidder {
        name: &'static str,
        cost: f64,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Contractor for StaticBidder {
        async fn announced(
            &self,
            ctx: &ContractorContext,
            _announcement: &Message,
        ) -> Result<BidDecision, anyhow::Error> {
            ctx.ensure_evaluating()?;
            Ok(BidDecision::Bid {
                cost: self.cost,
                payload: Payload::new(),
            })
        }

        async fn granted(
            &self,
            _ctx: &ContractorContext,
            _grant: &Message,
        ) -> Result<Payload, anyhow::Error> {
            self.log.lock().push(format!("{} granted", self.name));
            Ok(payload("served_by", self.name))
        }

        async fn rejected(&self, _rejection: &Message) {
            self.log.lock().push(format!("{} rejected", self.name));
        }

        async fn cancelled(&self, reason: &str) {
            self.log
                .lock()
                .push(format!("{} cancelled: {reason}", self.name));
        }
    }

    /// Cannot serve locally: re-announces into a neighboring shard and
    /// forwards the nested outcome as its own bid.
    struct Relay {
        target: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Contractor for Relay {
        async fn announced(
            &self,
            ctx: &ContractorContext,
            _announcement: &Message,
        ) -> Result<BidDecision, anyhow::Error> {
            self.log.lock().push(format!(
                "announced level={} max={:?}",
                ctx.level(),
                ctx.max_distance()
            ));
            match ctx.re_announce(
                vec![Recipient::broadcast(self.target.clone())],
                Duration::from_secs(1),
            ) {
                Ok(nested) => match nested.notify_finish().await {
                    Ok(_) => Ok(BidDecision::Bid {
                        cost: 100.0,
                        payload: Payload::new(),
                    }),
                    Err(_) => Ok(BidDecision::Refuse {
                        reason: "no downstream bids".into(),
                    }),
                },
                Err(NestingRefused) => {
                    self.log.lock().push("nesting refused".into());
                    Ok(BidDecision::Refuse {
                        reason: "nesting distance exhausted".into(),
                    })
                }
            }
        }

        async fn granted(
            &self,
            _ctx: &ContractorContext,
            _grant: &Message,
        ) -> Result<Payload, anyhow::Error> {
            Ok(Payload::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_bidder_wins_and_reports() {
        let bus = LocalBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let managers = open_agency(&bus, "shard-a", "mgr");
        let workers = open_agency(&bus, "shard-a", "worker-1");
        workers.register_contractor(
            "allocate",
            Arc::new(StaticBidder {
                name: "worker-1",
                cost: 5.0,
                log: log.clone(),
            }),
        );

        let handle = managers.initiate_contract(
            ContractTerms::new("allocate", vec![Recipient::broadcast("shard-a")])
                .with_bid_window(Duration::from_secs(1)),
        );

        let result = handle.notify_finish().await.unwrap();
        assert_eq!(result["served_by"], "worker-1");
        assert_eq!(handle.state(), ManagerState::Completed);
        assert_eq!(log.lock().as_slice(), ["worker-1 granted"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cheapest_bid_wins_and_loser_is_rejected() {
        let bus = LocalBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let managers = open_agency(&bus, "shard-a", "mgr");
        for (name, cost) in [("pricey", 10.0), ("cheap", 3.0)] {
            let workers = open_agency(&bus, "shard-a", name);
            workers.register_contractor(
                "allocate",
                Arc::new(StaticBidder {
                    name,
                    cost,
                    log: log.clone(),
                }),
            );
        }

        let handle = managers.initiate_contract(
            ContractTerms::new("allocate", vec![Recipient::broadcast("shard-a")])
                .with_bid_window(Duration::from_secs(1)),
        );

        let result = handle.notify_finish().await.unwrap();
        assert_eq!(result["served_by"], "cheap");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let entries = log.lock().clone();
        assert!(entries.contains(&"cheap granted".to_string()));
        assert!(entries.contains(&"pricey rejected".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announcement_with_no_bids_expires() {
        let bus = LocalBus::new();
        let managers = open_agency(&bus, "shard-a", "mgr");

        let handle = managers.initiate_contract(
            ContractTerms::new("allocate", vec![Recipient::broadcast("shard-a")])
                .with_bid_window(Duration::from_secs(1)),
        );

        assert_eq!(handle.notify_finish().await, Err(ProtocolFailure::Expired));
        assert_eq!(handle.state(), ManagerState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nesting_stops_when_distance_is_exhausted() {
        let bus = LocalBus::new();
        let b_log = Arc::new(Mutex::new(Vec::new()));
        let c_log = Arc::new(Mutex::new(Vec::new()));

        let managers = open_agency(&bus, "shard-a", "mgr");
        let shard_b = open_agency(&bus, "shard-b", "relay-b");
        shard_b.register_contractor(
            "allocate",
            Arc::new(Relay {
                target: "shard-c".into(),
                log: b_log.clone(),
            }),
        );
        let shard_c = open_agency(&bus, "shard-c", "relay-c");
        shard_c.register_contractor(
            "allocate",
            Arc::new(Relay {
                target: "shard-d".into(),
                log: c_log.clone(),
            }),
        );

        let handle = managers.initiate_contract(
            ContractTerms::new("allocate", vec![Recipient::broadcast("shard-b")])
                .with_bid_window(Duration::from_secs(5))
                .with_max_distance(1),
        );

        assert_eq!(handle.notify_finish().await, Err(ProtocolFailure::Expired));

        let b_entries = b_log.lock().clone();
        assert_eq!(b_entries[0], "announced level=0 max=Some(1)");

        // The nested announcement reached shard-c one level deeper with
        // the distance used up; its relay had to refuse re-announcing.
        let c_entries = c_log.lock().clone();
        assert_eq!(c_entries[0], "announced level=1 max=Some(0)");
        assert!(c_entries.contains(&"nesting refused".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivered_announcement_yields_duplicate_not_second_bid() {
        let bus = LocalBus::new();
        let mut mgr_rx = bus.bind("shard-a", "mgr");
        let log = Arc::new(Mutex::new(Vec::new()));
        let workers = open_agency(&bus, "shard-b", "worker-1");
        workers.register_contractor(
            "allocate",
            Arc::new(StaticBidder {
                name: "worker-1",
                cost: 5.0,
                log,
            }),
        );

        let mut announcement = Message::new(Body::Announcement {
            level: 0,
            max_distance: None,
        });
        announcement.protocol_id = "allocate".into();
        announcement.traversal_id = Some(Uuid::new_v4());
        announcement.sender_id = Some(Uuid::new_v4());
        announcement.reply_to = Some(Recipient::agent("mgr", "shard-a"));
        announcement.expiration_time = Some(clock::future(Duration::from_secs(10)));

        workers.deliver(announcement.clone());
        workers.deliver(announcement);

        let first = mgr_rx.recv().await.unwrap();
        let second = mgr_rx.recv().await.unwrap();
        let kinds = [first.body.kind_name(), second.body.kind_name()];
        assert!(kinds.contains(&"bid"));
        assert!(kinds.contains(&"duplicate"));
        assert!(mgr_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reaches_known_bidders() {
        let bus = LocalBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let managers = open_agency(&bus, "shard-a", "mgr");
        let workers = open_agency(&bus, "shard-a", "worker-1");
        workers.register_contractor(
            "allocate",
            Arc::new(StaticBidder {
                name: "worker-1",
                cost: 5.0,
                log: log.clone(),
            }),
        );

        let handle = managers.initiate_contract(
            ContractTerms::new("allocate", vec![Recipient::broadcast("shard-a")])
                .with_bid_window(Duration::from_secs(30)),
        );

        // Let the bid arrive, then call the whole thing off.
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel("resources freed elsewhere");

        let result = handle.notify_finish().await;
        assert_eq!(
            result,
            Err(ProtocolFailure::Cancelled {
                reason: "resources freed elsewhere".into()
            })
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            log.lock().as_slice(),
            ["worker-1 cancelled: resources freed elsewhere"]
        );
    }

    /// Slow worker driven from a hand-rolled manager endpoint: exercises
    /// grant, periodic update reports, and post-grant cancellation from
    /// the wire side.
    struct SlowWorker {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Contractor for SlowWorker {
        async fn announced(
            &self,
            _ctx: &ContractorContext,
            _announcement: &Message,
        ) -> Result<BidDecision, anyhow::Error> {
            Ok(BidDecision::Bid {
                cost: 1.0,
                payload: Payload::new(),
            })
        }

        async fn granted(
            &self,
            ctx: &ContractorContext,
            _grant: &Message,
        ) -> Result<Payload, anyhow::Error> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ctx.ensure_working()?;
            Ok(payload("done", "late"))
        }

        async fn cancelled(&self, reason: &str) {
            self.log.lock().push(format!("cancelled: {reason}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_contractor_reports_updates_and_honors_cancellation() {
        let bus = LocalBus::new();
        let mut mgr_rx = bus.bind("shard-a", "mgr");
        let log = Arc::new(Mutex::new(Vec::new()));
        let workers = open_agency(&bus, "shard-b", "worker-1");
        workers.register_contractor("allocate", Arc::new(SlowWorker { log: log.clone() }));

        let mut announcement = Message::new(Body::Announcement {
            level: 0,
            max_distance: None,
        });
        announcement.protocol_id = "allocate".into();
        announcement.traversal_id = Some(Uuid::new_v4());
        announcement.sender_id = Some(Uuid::new_v4());
        announcement.reply_to = Some(Recipient::agent("mgr", "shard-a"));
        announcement.expiration_time = Some(clock::future(Duration::from_secs(10)));
        workers.deliver(announcement);

        let bid = mgr_rx.recv().await.unwrap();
        assert_eq!(bid.bid_cost(), Some(1.0));

        let mut grant = Message::new(Body::Grant {
            update_report: Some(Duration::from_secs(1)),
        });
        grant.protocol_id = "allocate".into();
        grant.receiver_id = bid.sender_id;
        grant.reply_to = Some(Recipient::agent("mgr", "shard-a"));
        grant.expiration_time = Some(clock::future(Duration::from_secs(60)));
        bus.send(&[Recipient::agent("worker-1", "shard-b")], grant, false)
            .unwrap();

        // Three update-report ticks while the work is still running.
        for _ in 0..3 {
            let update = mgr_rx.recv().await.unwrap();
            assert_eq!(update.body.kind_name(), "update-report");
        }

        let mut cancellation = Message::new(Body::Cancellation {
            reason: "contract superseded".into(),
        });
        cancellation.protocol_id = "allocate".into();
        cancellation.receiver_id = bid.sender_id;
        cancellation.reply_to = Some(Recipient::agent("mgr", "shard-a"));
        cancellation.expiration_time = Some(clock::future(Duration::from_secs(60)));
        bus.send(
            &[Recipient::agent("worker-1", "shard-b")],
            cancellation,
            false,
        )
        .unwrap();

        // The aborted work never produces a final report.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(log.lock().as_slice(), ["cancelled: contract superseded"]);
        while let Ok(msg) = mgr_rx.try_recv() {
            assert_ne!(msg.body.kind_name(), "final-report");
        }
        assert!(workers.is_idle());
    }
}
