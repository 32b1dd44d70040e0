// protocol/task.rs - Task Exchange

//! Initiator-only exchange wrapping a single agent-supplied body:
//! `performing -> {completed, error, expired}`. The body's eventual result
//! completes the exchange; an armed timeout expires it and runs the
//! body's expiration hook; explicit `terminate`/`fail` calls go through
//! the `ensure_state` guard so a call racing the timeout unwinds quietly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::agency::Agency;
use crate::clock;
use crate::message::Payload;

use super::machine::{
    HandlerResult, ProtocolFailure, ProtocolResult, Stale, StateMachine, Transition, dispatch,
};
use super::medium::Medium;
use super::notifier::FinishNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Performing,
    Completed,
    Error,
    Expired,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Performing => "performing",
            TaskState::Completed => "completed",
            TaskState::Error => "error",
            TaskState::Expired => "expired",
        }
    }
}

/// What a task body resolves to.
pub enum TaskOutcome {
    /// The task is done with this result.
    Complete(Payload),
    /// The body returned but the task keeps running until an explicit
    /// `terminate`/`fail` through the context.
    NotDoneYet,
}

/// Agent-supplied task body.
#[async_trait]
pub trait AgentTask: Send + Sync + 'static {
    /// Deadline for the whole task; `None` runs unbounded.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: TaskContext) -> Result<TaskOutcome, anyhow::Error>;

    /// Invoked when the timeout fires before completion.
    async fn expired(&self) {}
}

#[derive(Clone)]
enum TaskEv {
    Completed(Payload),
    Failed(String),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum On {
    Completed,
    Failed,
    Expired,
}

fn classify(ev: &TaskEv) -> On {
    match ev {
        TaskEv::Completed(_) => On::Completed,
        TaskEv::Failed(_) => On::Failed,
        TaskEv::Expired => On::Expired,
    }
}

struct TaskMedium {
    medium: Medium<TaskState, TaskEv>,
    body: Arc<dyn AgentTask>,
}

impl TaskMedium {
    fn on_completed(&mut self, ev: TaskEv) -> HandlerResult {
        let TaskEv::Completed(payload) = ev else {
            return Ok(());
        };
        self.medium.terminate(Ok(payload));
        Ok(())
    }

    fn on_failed(&mut self, ev: TaskEv) -> HandlerResult {
        let TaskEv::Failed(reason) = ev else {
            return Ok(());
        };
        Err(anyhow::anyhow!(reason).into())
    }

    fn on_expired(&mut self, _ev: TaskEv) -> HandlerResult {
        let body = self.body.clone();
        tokio::spawn(async move { body.expired().await });
        self.medium.terminate(Err(ProtocolFailure::Expired));
        Ok(())
    }
}

const TABLE: &[Transition<TaskMedium, TaskState, On, TaskEv>] = &[
    Transition {
        on: On::Completed,
        before: &[TaskState::Performing],
        after: TaskState::Completed,
        handler: TaskMedium::on_completed,
    },
    // The error state is entered through the error path, not the table.
    Transition {
        on: On::Failed,
        before: &[TaskState::Performing],
        after: TaskState::Performing,
        handler: TaskMedium::on_failed,
    },
    Transition {
        on: On::Expired,
        before: &[TaskState::Performing],
        after: TaskState::Expired,
        handler: TaskMedium::on_expired,
    },
];

/// Handed to the task body: guard checks and explicit completion.
#[derive(Clone)]
pub struct TaskContext {
    machine: Arc<StateMachine<TaskState>>,
    tx: UnboundedSender<TaskEv>,
}

impl TaskContext {
    /// Safe-point guard: unwinds the continuation when the task already
    /// finished.
    pub fn ensure_performing(&self) -> Result<(), Stale> {
        self.machine.ensure_state(&[TaskState::Performing])
    }

    /// Equivalent to the body completing successfully with `value`.
    pub fn terminate(&self, value: Payload) -> Result<(), Stale> {
        self.ensure_performing()?;
        let _ = self.tx.send(TaskEv::Completed(value));
        Ok(())
    }

    /// Equivalent to the body failing with `reason`.
    pub fn fail(&self, reason: impl Into<String>) -> Result<(), Stale> {
        self.ensure_performing()?;
        let _ = self.tx.send(TaskEv::Failed(reason.into()));
        Ok(())
    }

    /// True iff the task left `performing`.
    pub fn finished(&self) -> bool {
        !self.machine.in_state(&[TaskState::Performing])
    }
}

/// Initiator-side handle to a running task.
pub struct TaskHandle {
    guid: Uuid,
    machine: Arc<StateMachine<TaskState>>,
    notifier: FinishNotifier,
    tx: UnboundedSender<TaskEv>,
}

impl TaskHandle {
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn finished(&self) -> bool {
        !self.machine.in_state(&[TaskState::Performing])
    }

    pub fn is_idle(&self) -> bool {
        self.finished()
    }

    pub async fn notify_finish(&self) -> ProtocolResult {
        self.notifier.wait().await
    }

    pub async fn wait_for_state(&self, states: &[TaskState]) -> TaskState {
        self.machine.wait_for_state(states).await
    }

    pub fn ensure_state(&self, states: &[TaskState]) -> Result<(), Stale> {
        self.machine.ensure_state(states)
    }

    pub fn terminate(&self, value: Payload) -> Result<(), Stale> {
        self.machine.ensure_state(&[TaskState::Performing])?;
        let _ = self.tx.send(TaskEv::Completed(value));
        Ok(())
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<(), Stale> {
        self.machine.ensure_state(&[TaskState::Performing])?;
        let _ = self.tx.send(TaskEv::Failed(reason.into()));
        Ok(())
    }
}

pub(crate) fn begin_task(agency: &Agency, body: Arc<dyn AgentTask>) -> TaskHandle {
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();

    let mut medium = Medium::new(
        agency,
        "task",
        "task".to_string(),
        Vec::new(),
        TaskState::Performing,
        TaskState::Error,
        ev_tx.clone(),
        msg_tx,
    );

    if let Some(timeout) = body.timeout() {
        if let Err(err) = medium.timer.arm(clock::future(timeout), TaskEv::Expired) {
            medium.recover(err.into());
        }
    }

    let handle = TaskHandle {
        guid: medium.guid,
        machine: medium.machine.clone(),
        notifier: medium.notifier.clone(),
        tx: ev_tx.clone(),
    };
    if medium.finished() {
        return handle;
    }

    let ctx = TaskContext {
        machine: medium.machine.clone(),
        tx: ev_tx,
    };
    let runner = body.clone();
    let body_tx = ctx.tx.clone();
    tokio::spawn(async move {
        match runner.run(ctx).await {
            Ok(TaskOutcome::Complete(payload)) => {
                let _ = body_tx.send(TaskEv::Completed(payload));
            }
            Ok(TaskOutcome::NotDoneYet) => {}
            Err(err) if err.is::<Stale>() => {
                debug!("task body unwound by stale-state guard");
            }
            Err(err) => {
                let _ = body_tx.send(TaskEv::Failed(format!("{err:#}")));
            }
        }
    });

    let mut role = TaskMedium { medium, body };
    tokio::spawn(async move {
        // Tasks exchange no messages; the registration keeps routing sane.
        let _msg_rx = msg_rx;
        while let Some(ev) = ev_rx.recv().await {
            let machine = role.medium.machine.clone();
            let outcome = dispatch(&mut role, &machine, TABLE, classify(&ev), ev);
            role.medium.handle_outcome(outcome);
            if role.medium.finished() {
                break;
            }
        }
    });

    handle
}
