//! Native backend: ranks are processes of an MPI job.
//!
//! Every call goes through the C layer in `csrc/mpcomm.c`, which owns the
//! MPI handles and hands out integer indices for communicators and requests.
//! The world communicator is switched to `MPI_ERRORS_RETURN`, so transport
//! failures surface as [`Error::Transport`] instead of aborting the job.

mod ffi;

use crate::buffer::{check_reduce_buffers, Buffer, RecvBuffer, SendBuffer};
use crate::error::{Error, Result};
use crate::status::Status;
use crate::{Context, ReduceOp};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Global flag tracking whether MPI has been initialized
static MPI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// MPI thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but MPI calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but MPI calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

/// MPI environment handle.
///
/// There can only be one instance of this type at a time. When dropped, it
/// finalizes MPI.
///
/// # Example
///
/// ```no_run
/// use mpcomm::Mpi;
///
/// let mpi = Mpi::init().expect("Failed to initialize MPI");
/// let world = mpi.world();
/// println!("Running on {} processes", world.size());
/// // MPI is finalized when `mpi` goes out of scope
/// ```
pub struct Mpi {
    /// The thread level that was provided
    thread_level: ThreadLevel,
    /// Marker to make Mpi !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI with single-threaded support.
    ///
    /// # Errors
    ///
    /// Returns an error if MPI is already initialized or if initialization fails.
    pub fn init() -> Result<Self> {
        Self::init_thread(ThreadLevel::Single)
    }

    /// Initialize MPI with the specified thread support level.
    ///
    /// The level actually provided can be queried with
    /// [`thread_level()`](Self::thread_level).
    ///
    /// # Errors
    ///
    /// Returns an error if MPI is already initialized or if initialization fails.
    pub fn init_thread(required: ThreadLevel) -> Result<Self> {
        if MPI_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut provided: i32 = 0;
        let ret = unsafe { ffi::mpcomm_init_thread(required as i32, &mut provided) };
        if ret != 0 {
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::Transport { op: "init", code: ret });
        }

        let thread_level = match provided {
            0 => ThreadLevel::Single,
            1 => ThreadLevel::Funneled,
            2 => ThreadLevel::Serialized,
            _ => ThreadLevel::Multiple,
        };
        info!(?required, provided = ?thread_level, "MPI initialized");

        Ok(Mpi {
            thread_level,
            _marker: PhantomData,
        })
    }

    /// Get the thread support level that was provided.
    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    /// Context over `MPI_COMM_WORLD`.
    pub fn world(&self) -> Context {
        Context::Native(NativeContext::world())
    }

    /// Get the current wall-clock time.
    ///
    /// This is a high-resolution timer suitable for benchmarking.
    pub fn wtime() -> f64 {
        unsafe { ffi::mpcomm_wtime() }
    }

    /// Get the MPI library version string.
    pub fn version() -> Result<String> {
        let mut buf = vec![0u8; 8192];
        let mut len: i32 = 0;
        let ret = unsafe { ffi::mpcomm_get_version(buf.as_mut_ptr().cast(), &mut len) };
        Error::check(ret, "version")?;

        let len = (len.max(0) as usize).min(buf.len());
        let s = std::str::from_utf8(&buf[..len])
            .map_err(|_| Error::Internal("Invalid UTF-8 in version string".into()))?;
        Ok(s.to_string())
    }

    /// Check if MPI has been initialized.
    pub fn is_initialized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::mpcomm_initialized(&mut flag) };
        flag != 0
    }

    /// Check if MPI has been finalized.
    pub fn is_finalized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::mpcomm_finalized(&mut flag) };
        flag != 0
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if MPI_INITIALIZED.load(Ordering::SeqCst) {
            debug!("finalizing MPI");
            unsafe {
                ffi::mpcomm_finalize();
            }
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

/// One process's view of an MPI communicator.
///
/// Rank and size are queried once at creation. Not `Send`: MPI handles stay
/// on the thread that owns the [`Mpi`] environment.
pub struct NativeContext {
    comm: i32,
    rank: i32,
    size: i32,
    tag_ub: i32,
    _marker: PhantomData<*const ()>,
}

/// Outcome of a finished native request.
pub(crate) struct Completion {
    pub(crate) status: Status,
    pub(crate) cancelled: bool,
}

impl NativeContext {
    fn world() -> Self {
        let comm = unsafe { ffi::mpcomm_comm_world() };
        let mut rank: i32 = 0;
        let mut size: i32 = 0;
        let mut tag_ub: i32 = 0;
        unsafe {
            ffi::mpcomm_comm_rank(comm, &mut rank);
            ffi::mpcomm_comm_size(comm, &mut size);
            ffi::mpcomm_tag_ub(comm, &mut tag_ub);
        }
        debug!(rank, size, tag_ub, "native context ready");
        NativeContext {
            comm,
            rank,
            size,
            tag_ub,
            _marker: PhantomData,
        }
    }

    /// Get the raw communicator handle (for advanced use).
    pub fn raw_handle(&self) -> i32 {
        self.comm
    }

    /// Number of processes.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Rank of the calling process.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Largest tag the MPI library accepts (`MPI_TAG_UB`).
    pub fn tag_ub(&self) -> i32 {
        self.tag_ub
    }

    /// First of the two tags kept for exchange traffic.
    pub fn reserved_tag_base(&self) -> i32 {
        reserved_base_below(self.tag_ub)
    }

    /// Blocking send.
    pub fn send(&self, buf: SendBuffer<'_>, dest: i32, tag: i32) -> Result<()> {
        let ret = unsafe {
            ffi::mpcomm_send(
                buf.as_ptr().cast(),
                buf.len() as i64,
                buf.kind() as i32,
                dest,
                tag,
                self.comm,
            )
        };
        Error::check(ret, "send")
    }

    /// Blocking receive.
    pub fn recv(&self, mut buf: RecvBuffer<'_>, source: i32, tag: i32) -> Result<Status> {
        let mut status = Status {
            source: 0,
            tag: 0,
            count: 0,
        };
        let ret = unsafe {
            ffi::mpcomm_recv(
                buf.as_mut_ptr().cast(),
                buf.len() as i64,
                buf.kind() as i32,
                source,
                tag,
                self.comm,
                &mut status.source,
                &mut status.tag,
                &mut status.count,
            )
        };
        Error::check(ret, "recv")?;
        Ok(status)
    }

    /// Element-wise reduction over all processes.
    ///
    /// Before reducing, one small collective checks that every process passed
    /// the same count, kind and operation; a disagreement panics on every rank.
    pub fn allreduce(&self, mut recv: RecvBuffer<'_>, send: SendBuffer<'_>, op: ReduceOp) -> Result<()> {
        check_reduce_buffers(&recv, &send)?;
        self.verify_agreement([send.len() as i64, send.kind() as i64, op as i64])?;
        let ret = unsafe {
            ffi::mpcomm_allreduce(
                send.as_ptr().cast(),
                recv.as_mut_ptr().cast(),
                send.len() as i64,
                send.kind() as i32,
                op as i32,
                self.comm,
            )
        };
        Error::check(ret, "allreduce")
    }

    /// Max-reduce `v` and `-v` together: all ranks agree iff both come back
    /// unchanged.
    fn verify_agreement(&self, header: [i64; 3]) -> Result<()> {
        let mut bounds = [0i64; 6];
        for (i, v) in header.iter().enumerate() {
            bounds[i] = *v;
            bounds[i + 3] = -*v;
        }
        let mut out = [0i64; 6];
        let ret = unsafe {
            ffi::mpcomm_allreduce(
                bounds.as_ptr().cast(),
                out.as_mut_ptr().cast(),
                6,
                crate::DatatypeTag::I64 as i32,
                ReduceOp::Max as i32,
                self.comm,
            )
        };
        Error::check(ret, "allreduce")?;
        if out != bounds {
            panic!(
                "allreduce protocol violation: rank {} has (count {}, kind {}, op {}) but the group spans ({}..={}, {}..={}, {}..={})",
                self.rank, header[0], header[1], header[2], -out[3], out[0], -out[4], out[1], -out[5], out[2]
            );
        }
        Ok(())
    }

    /// Barrier synchronization.
    pub fn barrier(&self) -> Result<()> {
        let ret = unsafe { ffi::mpcomm_barrier(self.comm) };
        Error::check(ret, "barrier")
    }

    /// Broadcast `buf` from `root`.
    pub fn broadcast(&self, mut buf: RecvBuffer<'_>, root: i32) -> Result<()> {
        let ret = unsafe {
            ffi::mpcomm_bcast(
                buf.as_mut_ptr().cast(),
                buf.len() as i64,
                buf.kind() as i32,
                root,
                self.comm,
            )
        };
        Error::check(ret, "broadcast")
    }

    /// Post a nonblocking send or receive; returns the request handle.
    pub(crate) fn post(&self, buf: &mut Buffer<'_>, peer: i32, tag: i32) -> Result<i64> {
        let mut handle: i64 = 0;
        let ret = match buf {
            Buffer::Send(b) => unsafe {
                ffi::mpcomm_isend(
                    b.as_ptr().cast(),
                    b.len() as i64,
                    b.kind() as i32,
                    peer,
                    tag,
                    self.comm,
                    &mut handle,
                )
            },
            Buffer::Recv(b) => unsafe {
                ffi::mpcomm_irecv(
                    b.as_mut_ptr().cast(),
                    b.len() as i64,
                    b.kind() as i32,
                    peer,
                    tag,
                    self.comm,
                    &mut handle,
                )
            },
        };
        Error::check(ret, if buf.is_send() { "isend" } else { "irecv" })?;
        Ok(handle)
    }
}

/// The top two valid tags, `tag_ub - 1` and `tag_ub`, are reserved.
fn reserved_base_below(tag_ub: i32) -> i32 {
    tag_ub.max(1) - 1
}

impl fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeContext")
            .field("comm", &self.comm)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("tag_ub", &self.tag_ub)
            .finish()
    }
}

/// Block on `handle` and release it.
pub(crate) fn wait(handle: i64) -> Result<Completion> {
    let mut status = Status {
        source: 0,
        tag: 0,
        count: 0,
    };
    let mut cancelled: i32 = 0;
    let ret = unsafe {
        ffi::mpcomm_wait(
            handle,
            &mut status.source,
            &mut status.tag,
            &mut status.count,
            &mut cancelled,
        )
    };
    Error::check(ret, "wait")?;
    Ok(Completion {
        status,
        cancelled: cancelled != 0,
    })
}

/// Poll `handle`; releases it once complete.
pub(crate) fn test(handle: i64) -> Result<Option<Completion>> {
    let mut flag: i32 = 0;
    let mut status = Status {
        source: 0,
        tag: 0,
        count: 0,
    };
    let mut cancelled: i32 = 0;
    let ret = unsafe {
        ffi::mpcomm_test(
            handle,
            &mut flag,
            &mut status.source,
            &mut status.tag,
            &mut status.count,
            &mut cancelled,
        )
    };
    Error::check(ret, "test")?;
    Ok((flag != 0).then_some(Completion {
        status,
        cancelled: cancelled != 0,
    }))
}

/// Ask MPI to withdraw `handle`. The request still has to be waited on.
pub(crate) fn cancel(handle: i64) -> Result<()> {
    let ret = unsafe { ffi::mpcomm_cancel(handle) };
    Error::check(ret, "cancel")
}
