// protocol/mod.rs - Per-Exchange Protocol Engine

//! The protocol engine: one state-machine-driven instance per in-flight
//! exchange.
//!
//! - `machine` - generic state register and guarded event dispatch
//! - `notifier` - exactly-once termination notification
//! - `expiration` - deadline scheduling, fed back through dispatch
//! - `task` - initiator-only task lifecycle
//! - `request` - request/response exchange
//! - `contract_net` - announce/bid/grant/report negotiation with shard
//!   nesting and duplicate suppression
//! - `notification` - one-way first messages
//!
//! Every instance owns its mutable state exclusively: events (inbound
//! messages, timer firings, control calls) are serialized through the
//! instance's inbox and dispatched one at a time. Events that do not
//! match the current state are logged and dropped by design.

pub mod contract_net;
pub mod expiration;
pub mod machine;
pub(crate) mod medium;
pub mod notification;
pub mod notifier;
pub mod request;
pub mod task;

pub use contract_net::{
    BidDecision, ContractTerms, Contractor, ContractorContext, ContractorState, ManagerHandle,
    ManagerState, NestingRefused,
};
pub use expiration::{ExpirationTimer, TimerError};
pub use machine::{
    HandlerFailure, HandlerResult, ProtocolFailure, ProtocolResult, ProtocolState, Stale,
    StateAssertionError, StateMachine, Transition, dispatch,
};
pub use notification::Notified;
pub use notifier::FinishNotifier;
pub use request::{Replier, ReplierContext, ReplierState, RequestHandle, RequestTerms, RequesterState};
pub use task::{AgentTask, TaskContext, TaskHandle, TaskOutcome, TaskState};
