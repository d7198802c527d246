//! # Persistence Module
//!
//! Durable state owned by the panel: the current alarm mode and the audit
//! trail of state-topic messages.
//!
//! ## Key Abstractions
//! - **Mode store**: narrow `get`/`set`/`subscribe` interface injected into the
//!   panel controller. The mode has to survive restarts because a retained
//!   state message may be missed on reconnect.
//! - **Audit recorder**: fire-and-forget appends, cancellable through a token,
//!   failures reported on a channel instead of to the caller.
//!
//! ## Error Handling Strategy
//! Store errors are typed (`StoreError`) so the controller can log and carry on;
//! a mode that cannot be written is still applied in memory.

pub mod audit;
pub mod mode_store;

pub use audit::{AuditError, AuditRecord, AuditRecorder, AuditTicket, SharedAuditError};
pub use mode_store::{FileModeStore, MemoryModeStore, ModeStore};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode mode file: {0}")]
    Encode(#[from] toml::ser::Error),
}
