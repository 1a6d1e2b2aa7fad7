//! Crate-internal error taxonomy.
//!
//! Terminal errors cannot succeed on retry (e.g. a missing template) and are
//! surfaced in status but excluded from the error returned to the work
//! queue, so the queue doesn't back off on them. Transient errors (API
//! throttling, optimistic-concurrency conflicts, a vanished adoption
//! target) are returned so kube-runtime retries with backoff.
//!
//! This split is carried as its own module rather than folded into `anyhow`
//! at the CLI boundary, since the multi-controller ownership handoffs across
//! `Sandbox`/`SandboxClaim`/`SandboxWarmPool` need the distinction.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminalError {
    #[error("SandboxTemplate \"{0}\" not found")]
    TemplateNotFound(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransientError {
    #[error("adoption target pod \"{0}\" not found")]
    AdoptionTargetMissing(String),
    #[error("sandbox \"{sandbox}\" is not controlled by claim \"{claim}\"")]
    SandboxOwnershipConflict { sandbox: String, claim: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error("{0}")]
    Joined(String),
}

/// Accumulates sub-errors across one reconcile pass and classifies them so
/// the reconciler can surface terminal reasons in status while only
/// returning transient ones to the work queue.
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    terminal: Vec<TerminalError>,
    transient: Vec<Error>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_terminal(&mut self, e: TerminalError) {
        self.terminal.push(e);
    }

    pub fn push_transient(&mut self, e: TransientError) {
        self.transient.push(Error::Transient(e));
    }

    pub fn push_kube(&mut self, e: kube::Error) {
        self.transient.push(Error::Kube(e));
    }

    pub fn is_empty(&self) -> bool {
        self.terminal.is_empty() && self.transient.is_empty()
    }

    /// The first terminal error, if any — used to set the status reason.
    pub fn first_terminal(&self) -> Option<&TerminalError> {
        self.terminal.first()
    }

    pub fn has_errors(&self) -> bool {
        !self.is_empty()
    }

    /// Join the transient (retryable) errors into a single `Error`,
    /// dropping terminal ones — they're surfaced via status, not backoff.
    /// Returns `None` when there is nothing retryable to report.
    pub fn into_requeue_error(self) -> Option<Error> {
        if self.transient.is_empty() {
            return None;
        }
        if self.transient.len() == 1 {
            return self.transient.into_iter().next();
        }
        let joined = self
            .transient
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::Joined(joined))
    }
}
