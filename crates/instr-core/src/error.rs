//! Error types for the instrument descriptor engine.
//!
//! All engine entry points return [`InstrError`]. The taxonomy separates the
//! failures a caller can recover from without touching the device
//! ([`InstrError::Precondition`], [`InstrError::OutOfRange`]) from failures
//! where device state is uncertain ([`InstrError::Device`]) and from
//! transport-level problems ([`InstrError::Communication`],
//! [`InstrError::Timeout`]).
//!
//! The engine never retries on its own; the one exception is the bounded
//! wait/poll loop (see `Session::wait_until`) which swallows read timeouts
//! while its caller-supplied deadline has not elapsed.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type Result<T> = std::result::Result<T, InstrError>;

/// Primary error type for the instrument engine and the drivers built on it.
#[derive(Error, Debug)]
pub enum InstrError {
    /// Transport-level failure: the command could not be written or the
    /// response could not be read.
    ///
    /// Not retried by the engine. Wraps the underlying I/O message.
    #[error("Communication error: {0}")]
    Communication(String),

    /// No response arrived within the backend's read deadline.
    ///
    /// A distinguishable subtype of communication failure: wait/poll
    /// operations treat it as "still in progress" while their own deadline
    /// has not elapsed; every other caller sees it propagate.
    #[error("Timed out after {after_ms} ms waiting for a response")]
    Timeout { after_ms: u64 },

    /// The response text could not be decoded as declared.
    ///
    /// Indicates a declaration/firmware mismatch; never retried.
    #[error("Protocol error on '{feature}': cannot decode response {raw:?}")]
    Protocol { feature: String, raw: String },

    /// A pre-condition check failed before any I/O took place.
    ///
    /// Device state is unchanged; the caller may fix the condition and retry.
    #[error("Precondition failed on '{target}': {check}")]
    Precondition { target: String, check: String },

    /// A value was rejected by a limits validator. No I/O was performed.
    #[error("Value {value} out of range for '{feature}': expected {limits}")]
    OutOfRange {
        feature: String,
        value: String,
        limits: String,
    },

    /// The instrument's own post-operation check reported a fault.
    ///
    /// Carries the device message verbatim. The attempted write's cache
    /// entry is dropped since the actual device state is unknown.
    #[error("Device reported an error after '{target}': {message}")]
    Device { target: String, message: String },

    /// A channel was indexed with an id outside the discovered/declared set.
    #[error("Unknown id {id:?} for channel '{channel}'")]
    UnknownChannel { channel: String, id: String },

    /// The declaration has no getter/setter/body for the requested operation.
    #[error("'{target}' does not support {operation}")]
    UnsupportedOperation {
        target: String,
        operation: &'static str,
    },

    /// A quantity carried a unit that cannot be converted to the declared one.
    #[error("Cannot convert unit '{from}' to '{to}'")]
    UnitMismatch { from: String, to: String },

    /// Invalid declaration: bad template, unknown resolver, duplicate names,
    /// cyclic discard edges, malformed limits.
    ///
    /// Raised once at schema build time (or on first use for templates),
    /// never at steady state.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl InstrError {
    /// Shorthand for a [`InstrError::Config`] from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        InstrError::Config(msg.into())
    }

    /// True for [`InstrError::Timeout`], the only kind the wait/poll loop
    /// absorbs.
    pub fn is_timeout(&self) -> bool {
        matches!(self, InstrError::Timeout { .. })
    }
}

impl From<std::io::Error> for InstrError {
    fn from(err: std::io::Error) -> Self {
        InstrError::Communication(err.to_string())
    }
}
