//! Error types for mpcomm

use crate::datatype::DatatypeTag;
use thiserror::Error;

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for communication operations.
///
/// Every variant carries enough context to name the offending rank or
/// operation. Nothing in this crate retries on error; recovery policy belongs
/// to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// The native runtime has already been initialized in this process
    #[error("MPI has already been initialized")]
    AlreadyInitialized,

    /// Rank outside `[0, size)` passed to a point-to-point or exchange operation
    #[error("{op}: invalid rank {rank} (communicator size {size})")]
    InvalidRank {
        /// The offending rank
        rank: i32,
        /// Size of the context the rank was checked against
        size: i32,
        /// Name of the operation that rejected it
        op: &'static str,
    },

    /// Negative tag on a send, or a tag in the reserved range
    #[error("{op}: invalid tag {tag}")]
    InvalidTag {
        /// The offending tag
        tag: i32,
        /// Name of the operation that rejected it
        op: &'static str,
    },

    /// Send and receive buffers disagree locally (length or element kind)
    #[error("{op}: invalid buffer ({reason})")]
    InvalidBuffer {
        /// Name of the operation that rejected it
        op: &'static str,
        /// What was wrong with it
        reason: String,
    },

    /// Declared item count differs from the slice handed to a typed helper
    #[error("{op}: declared {declared} items but buffer holds {actual}")]
    CountMismatch {
        /// Name of the operation that rejected it
        op: &'static str,
        /// Count the caller declared
        declared: usize,
        /// Length of the buffer actually supplied
        actual: usize,
    },

    /// Incoming message is larger than the posted receive buffer
    #[error("message from rank {source_rank} (tag {tag}) truncated: {incoming} items into buffer of {capacity}")]
    Truncated {
        /// Sender of the message
        source_rank: i32,
        /// Tag of the message
        tag: i32,
        /// Items in the message
        incoming: usize,
        /// Items the receive buffer can hold
        capacity: usize,
    },

    /// Matched send and receive were posted with different element kinds
    #[error("message from rank {source_rank} (tag {tag}) carries {sent:?} but receive expects {expected:?}")]
    DatatypeMismatch {
        /// Sender of the message
        source_rank: i32,
        /// Tag of the message
        tag: i32,
        /// Element kind of the send
        sent: DatatypeTag,
        /// Element kind of the receive
        expected: DatatypeTag,
    },

    /// `wait()` called on a request that was never started
    #[error("request was never started")]
    NotStarted,

    /// Request driven through an invalid state transition
    #[error("request cannot {action} while {state}")]
    RequestState {
        /// Attempted transition
        action: &'static str,
        /// State the request was in
        state: &'static str,
    },

    /// Native transport call failed
    #[error("transport error in {op} (code {code})")]
    Transport {
        /// Name of the operation that failed
        op: &'static str,
        /// Return code from the native layer
        code: i32,
    },

    /// A rank thread of the emulated backend panicked
    #[error("rank {rank} panicked: {message}")]
    RankPanicked {
        /// Rank whose thread panicked
        rank: i32,
        /// Panic payload, if it was a string
        message: String,
    },

    /// A rank thread could not be spawned
    #[error("failed to spawn rank {rank}: {source}")]
    Spawn {
        /// Rank that failed to start
        rank: i32,
        /// OS error
        #[source]
        source: std::io::Error,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check a native return code, returning Ok(()) for success.
    pub fn check(code: i32, op: &'static str) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::Transport { op, code })
        }
    }

    /// Validate a destination rank against `[0, size)`.
    pub(crate) fn check_rank(rank: i32, size: i32, op: &'static str) -> Result<()> {
        if (0..size).contains(&rank) {
            Ok(())
        } else {
            Err(Error::InvalidRank { rank, size, op })
        }
    }

    /// Validate a receive source: a rank in `[0, size)` or [`ANY_SOURCE`](crate::ANY_SOURCE).
    pub(crate) fn check_source(rank: i32, size: i32, op: &'static str) -> Result<()> {
        if rank == crate::ANY_SOURCE {
            Ok(())
        } else {
            Self::check_rank(rank, size, op)
        }
    }

    /// Validate a user send tag: non-negative and below `reserved_base`, the
    /// first tag the context keeps for itself.
    pub(crate) fn check_tag(tag: i32, reserved_base: i32, op: &'static str) -> Result<()> {
        if (0..reserved_base).contains(&tag) {
            Ok(())
        } else {
            Err(Error::InvalidTag { tag, op })
        }
    }

    /// Validate a user receive tag: like [`check_tag`](Self::check_tag) but
    /// also accepts [`ANY_TAG`](crate::ANY_TAG).
    pub(crate) fn check_recv_tag(tag: i32, reserved_base: i32, op: &'static str) -> Result<()> {
        if tag == crate::ANY_TAG {
            Ok(())
        } else {
            Self::check_tag(tag, reserved_base, op)
        }
    }
}
