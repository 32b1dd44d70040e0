// lib.rs - shardnet Distributed Agent Negotiation Engine
//
// A per-exchange protocol engine for distributed agent platforms:
// state-machine-driven exchange lifecycles, contract-net bidding with
// shard nesting and duplicate suppression, deadline expiration, and
// exactly-once termination notification.

#![doc = include_str!("../README.md")]

pub mod agency;
pub mod clock;
pub mod message;
pub mod observability;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use agency::{Agency, AgencyConfig, ReportedFailure};

pub use message::{Body, Message, Payload, ProtocolType, pick_best};

pub use protocol::{
    AgentTask, BidDecision, ContractTerms, Contractor, ContractorContext, ContractorState,
    FinishNotifier, ManagerHandle, ManagerState, NestingRefused, Notified, ProtocolFailure,
    ProtocolResult, Replier, ReplierContext, RequestHandle, RequestTerms, RequesterState, Stale,
    StateAssertionError, StateMachine, TaskContext, TaskHandle, TaskOutcome, TaskState,
    TimerError,
};

pub use transport::{LocalBus, Recipient, Transport, TransportError};

pub use observability::{TracingConfig, TracingFormat, init_tracing};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agency::{Agency, AgencyConfig};
    pub use crate::message::{Body, Message, Payload, ProtocolType, pick_best};
    pub use crate::protocol::{
        AgentTask, BidDecision, ContractTerms, Contractor, ContractorContext, ManagerHandle,
        Notified, ProtocolFailure, ProtocolResult, Replier, RequestTerms, Stale, TaskContext,
        TaskOutcome,
    };
    pub use crate::transport::{LocalBus, Recipient, Transport};
}
