//! Error taxonomy for the RINA control-plane core.
//!
//! Every fallible operation in this crate returns one of the variants below
//! instead of panicking or propagating a transport-specific error. The
//! variants mirror the numeric result codes a kernel implementation would
//! return from a syscall: the caller is expected to match on the kind, not
//! the message text.

use thiserror::Error;

/// The result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy returned to callers of the control-plane core.
///
/// These are not exceptions: a handler that decides a request is invalid
/// returns one of these variants to its caller, which is responsible for
/// turning it into a response message or a failed `write`.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed arguments or a state mismatch (e.g. flow not in the
    /// expected state, duplicate name within a DM).
    #[error("invalid: {0}")]
    Invalid(String),

    /// The requested IPCP/flow/port does not exist, or exists but has no
    /// uipcp to forward through.
    #[error("no such device: {0}")]
    NoDevice(String),

    /// The resource is already owned by a different party (duplicate DIF
    /// type, duplicate app registration from another control device).
    #[error("busy: {0}")]
    Busy(String),

    /// An id bitmap is exhausted, or an upstream queue is full and the
    /// producer asked not to wait.
    #[error("no space: {0}")]
    NoSpace(String),

    /// Allocation failed.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// The operation is not implemented by this IPCP, or a config
    /// parameter is unrecognized by both the core and the factory.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A blocking wait was aborted by a cancellation signal.
    #[error("interrupted")]
    Interrupted,

    /// A non-blocking read found nothing queued.
    #[error("would block")]
    WouldBlock,
}

impl Error {
    /// Returns the stable short name of this error kind, as used in test
    /// assertions and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Invalid(_) => "invalid",
            Error::NoDevice(_) => "no-device",
            Error::Busy(_) => "busy",
            Error::NoSpace(_) => "no-space",
            Error::NoMemory(_) => "no-memory",
            Error::Unsupported(_) => "unsupported",
            Error::Interrupted => "interrupted",
            Error::WouldBlock => "would-block",
        }
    }
}
