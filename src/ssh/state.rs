// ABOUTME: Session lifecycle state machine, published over a watch channel.
// ABOUTME: Transitions are one-way; nothing leaves Closed.

use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticated)
                | (Connecting, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closed)
                | (Active, Closing)
                | (Active, Closed)
                | (Closing, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared, observable holder of a session's state.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("session state {} -> {}", current, next);
                *current = next;
                moved = true;
            }
            moved
        });
        moved
    }
}
