// ABOUTME: Diagnostics accumulator for non-fatal warnings during a tunnel's lifetime.
// ABOUTME: Collects per-connection failures that must not bring the session down.

use std::collections::VecDeque;

/// Upper bound on retained warnings; older ones are dropped first.
const MAX_WARNINGS: usize = 256;

/// Bounded log of non-fatal warnings raised while a listener runs.
#[derive(Default)]
pub struct Diagnostics {
    warnings: VecDeque<Warning>,
    dropped: usize,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!(kind = ?warning.kind, "{}", warning.message);
        if self.warnings.len() == MAX_WARNINGS {
            self.warnings.pop_front();
            self.dropped += 1;
        }
        self.warnings.push_back(warning);
    }

    /// Retained warnings, oldest first.
    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.warnings.iter()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Retained warnings of one kind.
    pub fn count(&self, kind: WarningKind) -> usize {
        self.warnings.iter().filter(|w| w.kind == kind).count()
    }

    /// Warnings discarded because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// A non-fatal warning collected while tunnelling.
#[derive(Debug, Clone)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    /// A local client sent a malformed or unsupported proxy handshake.
    pub fn connection_rejected(message: impl Into<String>) -> Self {
        Self::new(WarningKind::ConnectionRejected, message)
    }

    /// The gateway refused to dial a requested destination.
    pub fn dial_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::DialFailed, message)
    }

    pub fn accept_failed(message: impl Into<String>) -> Self {
        Self::new(WarningKind::AcceptFailed, message)
    }

    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What went wrong on a single local connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    ConnectionRejected,
    DialFailed,
    /// The listener's accept call failed; the loop keeps going.
    AcceptFailed,
}
