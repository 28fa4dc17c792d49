//! Error types for the logical replication client.
//! Structured error handling using thiserror, in the same shape the source
//! checker used for its own PostgreSQL connection errors.

use thiserror::Error;

/// Main error type for the replication client.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or authentication failure at session startup. Fatal.
    #[error("connection failed: {message}")]
    ConnectionFailed {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Socket failure mid-stream. Fatal to the session; caller may reconnect.
    #[error("disconnected after last_received={last_received}: {message}")]
    Disconnected { last_received: u64, message: String },

    /// Server rejected START_REPLICATION for a missing or busy slot. Fatal.
    #[error("replication slot not found: {slot}")]
    SlotNotFound { slot: String },

    /// Configuration related errors.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Buffer shorter than a declared field. Recoverable.
    #[error("truncated frame: {message}")]
    Truncated { message: String },

    /// Tag or kind byte outside its documented set. Recoverable.
    #[error("malformed message: {message}")]
    Malformed { message: String },

    /// Insert/Update/Delete referencing a relation-id not yet announced. Recoverable.
    #[error("unknown relation id {relation_id}")]
    UnknownRelation { relation_id: u32 },

    /// A column converter could not parse its payload. Recoverable.
    #[error("conversion failed for oid {oid}: {reason}")]
    ConversionFailed { oid: u32, reason: String },

    /// `acknowledge()` called with no pending LSN (auto mode, or nothing
    /// delivered since the last acknowledgement).
    #[error("no pending LSN to acknowledge")]
    NoPendingLsn,

    /// Iteration resumed after `stop()` — normal end-of-stream signal, not a
    /// failure.
    #[error("read after stop()")]
    StoppedRead,

    /// Protocol errors not covered by a more specific variant above.
    #[error("protocol error: {message}")]
    Protocol {
        message: String,
        context: Option<String>,
    },

    /// Network/IO related errors.
    #[error("network IO error")]
    NetworkIO(#[from] std::io::Error),

    /// String conversion errors.
    #[error("string conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// C string conversion errors (libpq FFI boundary).
    #[error("c string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    /// Task execution errors for the blocking session task.
    #[error("task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),

    /// Generic error for compatibility with `anyhow`-based glue code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias used throughout the crate.
pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn truncated<S: Into<String>>(message: S) -> Self {
        Self::Truncated {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn unknown_relation(relation_id: u32) -> Self {
        Self::UnknownRelation { relation_id }
    }

    pub fn conversion_failed<S: Into<String>>(oid: u32, reason: S) -> Self {
        Self::ConversionFailed {
            oid,
            reason: reason.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            context: None,
        }
    }

    pub fn protocol_with_context<S: Into<String>, C: Into<String>>(
        message: S,
        context: C,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    pub fn disconnected<S: Into<String>>(last_received: u64, message: S) -> Self {
        Self::Disconnected {
            last_received,
            message: message.into(),
        }
    }

    pub fn slot_not_found<S: Into<String>>(slot: S) -> Self {
        Self::SlotNotFound { slot: slot.into() }
    }

    /// `true` for the per-event decode failures the decoder is expected to
    /// recover from (log, drop the event, keep the session alive).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::Malformed { .. }
                | Self::UnknownRelation { .. }
                | Self::ConversionFailed { .. }
        )
    }
}
