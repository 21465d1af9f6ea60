//! Reconnect lifecycle of one live pipeline as an explicit state machine.
//!
//! The pipeline loop feeds [`SessionEvent`]s in; the session decides whether
//! the move is legal and owns the backoff attempt counter.

use std::fmt;

use tokio::time::Duration;

use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
    Backoff,
    ShuttingDown,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Subscribing => "subscribing",
            SessionState::Streaming => "streaming",
            SessionState::Backoff => "backoff",
            SessionState::ShuttingDown => "shutting_down",
            SessionState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::ShuttingDown | SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connect,
    Connected,
    Subscribed,
    ConnectionLost,
    BackoffElapsed,
    Shutdown,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TransitionError {
    pub msg: String,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for TransitionError {}

#[derive(Debug, Clone)]
pub struct StreamSession {
    state: SessionState,
    attempt: u32,
    reconnects: u64,
    policy: RetryConfig,
}

impl StreamSession {
    pub fn new(policy: RetryConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            attempt: 0,
            reconnects: 0,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consecutive failed attempts since the last time Streaming was reached
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Total connection losses over the session lifetime
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Delay to wait in Backoff before the next connect.
    pub fn backoff_delay(&self) -> Duration {
        self.policy.delay_for_attempt(self.attempt.saturating_sub(1))
    }

    /// Apply an event, returning the previous state on success.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, TransitionError> {
        let prev = self.state;
        let next = match (prev, event) {
            (SessionState::Disconnected, SessionEvent::Connect) => SessionState::Connecting,
            (SessionState::Connecting, SessionEvent::Connected) => SessionState::Subscribing,
            (SessionState::Subscribing, SessionEvent::Subscribed) => {
                self.attempt = 0;
                SessionState::Streaming
            }
            (SessionState::Connecting, SessionEvent::ConnectionLost)
            | (SessionState::Subscribing, SessionEvent::ConnectionLost)
            | (SessionState::Streaming, SessionEvent::ConnectionLost) => {
                self.attempt = self.attempt.saturating_add(1);
                self.reconnects += 1;
                SessionState::Backoff
            }
            (SessionState::Backoff, SessionEvent::BackoffElapsed) => SessionState::Connecting,
            (s, SessionEvent::Shutdown) if !s.is_terminal() => SessionState::ShuttingDown,
            (SessionState::ShuttingDown, SessionEvent::Stopped) => SessionState::Stopped,
            (s, e) => {
                return Err(TransitionError {
                    msg: format!("invalid transition {:?} from {}", e, s),
                })
            }
        };
        self.state = next;
        Ok(prev)
    }
}
