//! Engine error taxonomy
//!
//! Four failure classes with distinct recovery policy:
//! - Transport: join/send failure, surfaced to the caller, no auto-retry
//! - AssetIo: local blob store failure, degrades to "asset unavailable"
//! - UnsafeState: safety guard rejection, fatal for the session connection
//! - Protocol: malformed inbound message, dropped and logged

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Room join or channel send failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Local asset store read/write failed.
    #[error("asset io failure: {0}")]
    AssetIo(String),

    /// An inbound document was rejected by the safety guard. Never
    /// recovered automatically; the receiving peer must leave the room.
    #[error("unsafe state rejected: {0}")]
    UnsafeState(String),

    /// Malformed or unparseable inbound message.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Durable session store failure.
    #[error("session store failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The engine task has shut down and can no longer accept commands.
    #[error("engine closed")]
    Closed,
}
