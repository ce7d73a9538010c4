//! Worker session state machine.
//!
//! Validates and executes status transitions for a [`crate::session::WorkerSession`],
//! enforcing the allowed transition graph and the terminal-state guarantees
//! the rest of the runtime relies on.

pub mod dispatch;

use thiserror::Error;

use crate::error::{ErrorKind, TaxonomyError};

/// Lifecycle status of a worker session.
///
/// ```text
/// any non-terminal      -> running           (start)
/// running                -> paused            (pause)
/// paused                  -> running           (resume)
/// running                -> waiting_approval  (tool requests approval)
/// waiting_approval        -> running           (last pending approval resolved)
/// running/waiting_approval -> idle             (interrupt)
/// running                -> idle              (turn done, session kept alive)
/// idle/paused/waiting_approval -> completed    (complete)
/// any                     -> error             (error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    WaitingApproval,
    Paused,
    Error,
    Completed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Completed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::WaitingApproval => "waiting_approval",
            SessionStatus::Paused => "paused",
            SessionStatus::Error => "error",
            SessionStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("session is already in a terminal state ({0})")]
    AlreadyTerminal(SessionStatus),
}

impl TaxonomyError for SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidTransition { .. } => ErrorKind::Fatal,
            SessionError::AlreadyTerminal(_) => ErrorKind::Fatal,
        }
    }
}

/// The worker session state machine.
///
/// A pure validator over the transition graph; it does not own the status
/// itself; callers hold the current `SessionStatus` (inside
/// [`crate::session::WorkerSession`]) and apply transitions through
/// [`Self::transition`].
pub struct SessionStateMachine;

impl SessionStateMachine {
    pub fn is_valid_transition(from: SessionStatus, to: SessionStatus, event: Event) -> bool {
        use Event::*;
        use SessionStatus::*;
        match event {
            Start => !from.is_terminal() && to == Running,
            Pause => from == Running && to == Paused,
            Resume => from == Paused && to == Running,
            RequestApproval => from == Running && to == WaitingApproval,
            LastApprovalResolved => from == WaitingApproval && to == Running,
            Interrupt => matches!(from, Running | WaitingApproval) && to == Idle,
            TurnDone => from == Running && to == Idle,
            Complete => matches!(from, Idle | Paused | WaitingApproval) && to == Completed,
            Error => !from.is_terminal() && to == SessionStatus::Error,
        }
    }

    /// Apply `event`, mutating `current` in place. `interrupt` is defined as
    /// a no-op (not an error) when the session is already terminal or idle.
    pub fn transition(
        current: &mut SessionStatus,
        event: Event,
    ) -> Result<(), SessionError> {
        let to = event.target(*current);

        if event == Event::Interrupt && (current.is_terminal() || *current == SessionStatus::Idle)
        {
            return Ok(());
        }

        let Some(to) = to else {
            return Err(SessionError::InvalidTransition {
                from: *current,
                to: event.fallback_target(),
            });
        };

        if !Self::is_valid_transition(*current, to, event) {
            if current.is_terminal() {
                return Err(SessionError::AlreadyTerminal(*current));
            }
            return Err(SessionError::InvalidTransition { from: *current, to });
        }

        *current = to;
        Ok(())
    }
}

/// Events that drive the session state machine. Each event maps to at most
/// one destination status given a legal origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Pause,
    Resume,
    RequestApproval,
    LastApprovalResolved,
    Interrupt,
    TurnDone,
    Complete,
    Error,
}

impl Event {
    fn target(self, _from: SessionStatus) -> Option<SessionStatus> {
        use SessionStatus::*;
        Some(match self {
            Event::Start => Running,
            Event::Pause => Paused,
            Event::Resume => Running,
            Event::RequestApproval => WaitingApproval,
            Event::LastApprovalResolved => Running,
            Event::Interrupt => Idle,
            Event::TurnDone => Idle,
            Event::Complete => Completed,
            Event::Error => SessionStatus::Error,
        })
    }

    fn fallback_target(self) -> SessionStatus {
        self.target(SessionStatus::Idle).expect("every event has a target")
    }
}
