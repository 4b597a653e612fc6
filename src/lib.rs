//! # mpcomm
//!
//! Message-passing core: point-to-point and collective communication between
//! a fixed set of ranks `[0, size)`, behind one [`Context`] type with two
//! interchangeable backends:
//! - **thread**: ranks are OS threads of one process, spawned by a
//!   [`ThreadRuntime`]; messages are copied once, directly between the two
//!   caller buffers, through a spin-then-block rendezvous
//! - **native** (with the `native` feature): ranks are MPI processes, reached
//!   through a thin C layer
//!
//! On top of both sits [`exchange`], an irregular all-to-all over
//! [`XPacket`]s built only from the public primitives.
//!
//! ## Supported Types
//!
//! All buffers and typed helpers are generic over [`Datatype`]:
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`
//!
//! ## Quick Start
//!
//! ```
//! use mpcomm::{RuntimeConfig, ThreadRuntime};
//!
//! fn main() -> Result<(), mpcomm::Error> {
//!     let runtime = ThreadRuntime::new(RuntimeConfig::default());
//!     let per_rank = runtime.run(4, |ctx| -> mpcomm::Result<i32> {
//!         let rank = ctx.rank();
//!         let right = (rank + 1) % ctx.size();
//!         let left = (rank + ctx.size() - 1) % ctx.size();
//!
//!         // Ring shift with tag 7
//!         let mut got = [0i32];
//!         let mut recv = ctx.irecv(&mut got, left, 7)?;
//!         ctx.send(&[rank], right, 7)?;
//!         recv.wait()?;
//!         drop(recv);
//!         assert_eq!(got[0], left);
//!
//!         // Generic all-reduce
//!         ctx.allsum(rank)
//!     })?;
//!     let sums = per_rank.into_iter().collect::<mpcomm::Result<Vec<_>>>()?;
//!     assert_eq!(sums, vec![6; 4]);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Description | Dependencies |
//! |----------|-------------|--------------|
//! | `native` | MPI backend through `csrc/mpcomm.c` | an MPI installation |
//!
//! ## Capabilities
//!
//! - **Blocking point-to-point**: [`Context::send`], [`Context::recv`] with
//!   [`ANY_SOURCE`] / [`ANY_TAG`] wildcards
//! - **Nonblocking requests**: [`Request`] (start, test, wait, cancel) and
//!   ordered [`RequestList`] batches
//! - **Collectives**: allreduce (sum, min, max, prod), barrier, broadcast
//! - **Irregular all-to-all**: [`exchange`]
//! - **Errors** name the offending rank and operation: see [`Error`]

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod buffer;
mod config;
mod context;
mod datatype;
mod error;
mod exchange;
mod request;
mod request_list;
mod status;
mod thread;

#[cfg(feature = "native")]
mod native;

pub use buffer::{Buffer, RecvBuffer, SendBuffer};
pub use config::{RuntimeConfig, DEFAULT_SPIN_COUNT};
pub use context::Context;
pub use datatype::{Datatype, DatatypeTag};
pub use error::{Error, Result};
pub use exchange::{exchange, exchange_tags, recv_packet_count, XPacket};
pub use request::{CancelHandle, Request, RequestState};
pub use request_list::RequestList;
pub use status::Status;
pub use thread::{GroupId, RankGroup, ThreadContext, ThreadRuntime};

#[cfg(feature = "native")]
pub use native::{Mpi, NativeContext, ThreadLevel};

/// Receive from any rank.
pub const ANY_SOURCE: i32 = -1;

/// Receive with any tag.
pub const ANY_TAG: i32 = -1;

/// First tag of the range the thread backend reserves for [`exchange`].
///
/// Native contexts derive their own bound from the MPI library; query
/// [`Context::reserved_tag_base`] for the one that applies.
pub const RESERVED_TAG_BASE: i32 = 1 << 30;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}
