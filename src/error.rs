//! Contract-level error kinds.
//!
//! Public APIs return `eyre::Result`; the kinds below are raised with
//! `bail!(Error::…)` wherever the caller contract needs a distinguishable
//! condition, so they can be recovered with
//! `report.downcast_ref::<Error>()`. Internal invariant failures use plain
//! `ensure!`/`bail!` messages instead.

use thiserror::Error;

/// Errors with contract meaning for callers of the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("mutation attempted on read-only instance")]
    ReadOnly,

    #[error("operation on closed tree")]
    Closed,

    #[error("page {id} not found")]
    PageNotFound { id: u32 },

    #[error("corrupt data: {reason}")]
    Corrupt { reason: String },

    #[error("computed degree too small (leaf={leaf}, internal={internal}); reduce key size or increase page size")]
    DegreeTooSmall { leaf: usize, internal: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::Corrupt {
            reason: reason.into(),
        }
    }
}
