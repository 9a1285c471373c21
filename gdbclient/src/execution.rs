/// Execution state tracking
///
/// Drives continue/step against the stub and classifies why the target
/// stopped. Only one continue or step may be outstanding at a time.

use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::commands::GdbCommands;
use crate::types::{StopCause, StopKind, StopReply, SIGTRAP};
use crate::{GdbError, Result};

/// Current state of the debugging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    /// Connected (or detached), no stop observed yet
    Idle,
    /// A continue or step is outstanding
    Running,
    /// The target reported a stop
    Stopped(StopCause),
}

/// What was asked of the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Continue,
    Step,
}

/// Turn a stop reply into a cause, given the request that produced it
pub fn classify(action: Resume, reply: &StopReply) -> StopCause {
    match reply.kind {
        StopKind::Exited(code) => StopCause::ProcessExit { code },
        StopKind::Terminated(signal) => StopCause::Signal { signal },
        StopKind::Signal(SIGTRAP) => match action {
            Resume::Continue => StopCause::BreakpointHit { pc: reply.pc() },
            Resume::Step => StopCause::StepComplete { pc: reply.pc() },
        },
        StopKind::Signal(signal) => StopCause::Signal { signal },
    }
}

/// Idle/Running/Stopped state machine
#[derive(Debug)]
pub struct ExecutionController {
    state: ExecutionState,
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionController {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Idle,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ExecutionState::Running
    }

    pub async fn continue_execution<S>(
        &mut self,
        commands: &mut GdbCommands<S>,
        timeout: Option<Duration>,
    ) -> Result<StopCause>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.resume(commands, Resume::Continue, timeout).await
    }

    pub async fn step<S>(
        &mut self,
        commands: &mut GdbCommands<S>,
        timeout: Option<Duration>,
    ) -> Result<StopCause>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.resume(commands, Resume::Step, timeout).await
    }

    /// Issue a continue or step and wait for the stop.
    ///
    /// On a timeout or transport failure the controller stays `Running`
    /// until [`interrupt`](Self::interrupt) or [`reset`](Self::reset).
    pub async fn resume<S>(
        &mut self,
        commands: &mut GdbCommands<S>,
        action: Resume,
        timeout: Option<Duration>,
    ) -> Result<StopCause>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.is_running() {
            return Err(GdbError::InvalidState(
                "a continue or step is already outstanding".into(),
            ));
        }

        let previous = self.state;
        self.state = ExecutionState::Running;
        log::debug!("Execution: {:?} -> Running ({:?})", previous, action);

        let reply = match action {
            Resume::Continue => commands.continue_execution(timeout).await,
            Resume::Step => commands.single_step(timeout).await,
        };
        self.finish(previous, action, reply)
    }

    /// Break into a running target
    pub async fn interrupt<S>(
        &mut self,
        commands: &mut GdbCommands<S>,
        timeout: Option<Duration>,
    ) -> Result<StopCause>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if !self.is_running() {
            return Err(GdbError::InvalidState("target is not running".into()));
        }

        let reply = commands.interrupt(timeout).await;
        self.finish(ExecutionState::Running, Resume::Continue, reply)
    }

    fn finish(
        &mut self,
        previous: ExecutionState,
        action: Resume,
        reply: Result<StopReply>,
    ) -> Result<StopCause> {
        match reply {
            Ok(reply) => {
                let cause = classify(action, &reply);
                self.state = ExecutionState::Stopped(cause);
                log::debug!("Execution: Running -> Stopped({})", cause);
                Ok(cause)
            }
            Err(e) if e.needs_recovery() => {
                log::warn!("Execution state indeterminate after: {}", e);
                Err(e)
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    /// Record a stop learned some other way, e.g. from `?`
    pub fn observe(&mut self, reply: &StopReply) -> StopCause {
        let cause = classify(Resume::Continue, reply);
        self.state = ExecutionState::Stopped(cause);
        cause
    }

    /// Back to `Idle`, after a detach or reconnect
    pub fn reset(&mut self) {
        log::debug!("Execution: {:?} -> Idle", self.state);
        self.state = ExecutionState::Idle;
    }
}
