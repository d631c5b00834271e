use thiserror::Error;

use crate::core::InvalidId;
use crate::data::SyncError;
use crate::session::PushError;
use crate::task::ExecutorError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; components exchange their
/// own closed result sets and only the outermost callers see this.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Id(#[from] InvalidId),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Id(_) => Transience::Permanent,
            Error::Sync(e) => e.transience(),
            Error::Push(e) => e.transience(),
            Error::Executor(e) => e.transience(),
        }
    }
}
