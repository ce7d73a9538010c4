//! Semantic wrappers over [`super::SessionStateMachine`] transitions.
//!
//! Mirrors the public vocabulary of the worker session contract so
//! call sites read `dispatch::start(&mut status)` rather than spelling out
//! the underlying event.

use super::{Event, SessionError, SessionStateMachine, SessionStatus};

pub fn start(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Start)
}

pub fn pause(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Pause)
}

pub fn resume(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Resume)
}

pub fn request_approval(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::RequestApproval)
}

/// Called after the last pending approval for a session resolves.
pub fn last_approval_resolved(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::LastApprovalResolved)
}

/// No-op when the session is already terminal or idle, per the contract.
pub fn interrupt(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Interrupt)
}

pub fn turn_done(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::TurnDone)
}

pub fn complete(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Complete)
}

pub fn error(status: &mut SessionStatus) -> Result<(), SessionError> {
    SessionStateMachine::transition(status, Event::Error)
}
