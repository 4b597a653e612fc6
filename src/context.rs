//! The communication context: one rank's view of a group of ranks.

use crate::buffer::{Buffer, RecvBuffer, SendBuffer};
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::request_list::RequestList;
use crate::status::Status;
use crate::thread::ThreadContext;
use crate::{ReduceOp, RESERVED_TAG_BASE};
use std::fmt;

#[cfg(feature = "native")]
use crate::native::NativeContext;

/// One rank's handle onto a fixed group of ranks `[0, size)`.
///
/// Both backends expose the same operations; callers never need to know which
/// one they run on.
///
/// # Example
///
/// ```
/// use mpcomm::{ReduceOp, RuntimeConfig, ThreadRuntime};
///
/// let runtime = ThreadRuntime::new(RuntimeConfig::default());
/// runtime
///     .run(3, |ctx| {
///         let right = (ctx.rank() + 1) % ctx.size();
///         let left = (ctx.rank() + ctx.size() - 1) % ctx.size();
///         let mut got = [0i32];
///         let mut recv = ctx.irecv(&mut got, left, 0).unwrap();
///         ctx.send(&[ctx.rank()], right, 0).unwrap();
///         recv.wait().unwrap();
///         drop(recv);
///         assert_eq!(got[0], left);
///
///         let mut max = [0.0f64];
///         ctx.allreduce(&[ctx.rank() as f64], &mut max, ReduceOp::Max).unwrap();
///         assert_eq!(max[0], 2.0);
///     })
///     .unwrap();
/// ```
pub enum Context {
    /// Rank thread of a [`ThreadRuntime`](crate::ThreadRuntime) group.
    Thread(ThreadContext),
    /// Process of a native MPI job.
    #[cfg(feature = "native")]
    Native(NativeContext),
}

impl Context {
    /// Number of ranks.
    pub fn size(&self) -> i32 {
        match self {
            Context::Thread(ctx) => ctx.size(),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.size(),
        }
    }

    /// Rank of the caller.
    pub fn rank(&self) -> i32 {
        match self {
            Context::Thread(ctx) => ctx.rank(),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.rank(),
        }
    }

    /// First tag of the range this context keeps for [`exchange`](crate::exchange).
    ///
    /// User tags must lie in `[0, reserved_tag_base())`. The thread backend
    /// uses [`RESERVED_TAG_BASE`]; a native context reserves the top two tags
    /// below its library's `MPI_TAG_UB`.
    pub fn reserved_tag_base(&self) -> i32 {
        match self {
            Context::Thread(_) => RESERVED_TAG_BASE,
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.reserved_tag_base(),
        }
    }

    /// The thread-backend context, if this is one.
    pub fn as_thread(&self) -> Option<&ThreadContext> {
        match self {
            Context::Thread(ctx) => Some(ctx),
            #[cfg(feature = "native")]
            Context::Native(_) => None,
        }
    }

    // ========================================================================
    // Buffer-level operations
    // ========================================================================

    /// Blocking send of a buffer to `dest`.
    pub fn send_buffer(&self, buf: SendBuffer<'_>, dest: i32, tag: i32) -> Result<()> {
        Error::check_rank(dest, self.size(), "send")?;
        Error::check_tag(tag, self.reserved_tag_base(), "send")?;
        self.send_unchecked(buf, dest, tag)
    }

    /// Blocking send on a tag the caller vetted, reserved range included.
    pub(crate) fn send_unchecked(&self, buf: SendBuffer<'_>, dest: i32, tag: i32) -> Result<()> {
        match self {
            Context::Thread(ctx) => ctx.send(buf, dest, tag),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.send(buf, dest, tag),
        }
    }

    /// Blocking receive into a buffer from `source` or [`ANY_SOURCE`](crate::ANY_SOURCE).
    pub fn recv_buffer(&self, buf: RecvBuffer<'_>, source: i32, tag: i32) -> Result<Status> {
        Error::check_source(source, self.size(), "recv")?;
        Error::check_recv_tag(tag, self.reserved_tag_base(), "recv")?;
        match self {
            Context::Thread(ctx) => ctx.recv(buf, source, tag),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.recv(buf, source, tag),
        }
    }

    /// Element-wise reduction of `send` over all ranks into `recv`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBuffer`] when `send` and `recv` differ in length or
    /// element kind. Ranks that disagree with each other on count, kind or
    /// operation break the collective contract; every rank panics.
    pub fn allreduce_buffer(&self, recv: RecvBuffer<'_>, send: SendBuffer<'_>, op: ReduceOp) -> Result<()> {
        match self {
            Context::Thread(ctx) => ctx.allreduce(recv, send, op),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.allreduce(recv, send, op),
        }
    }

    /// Block until every rank has entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        match self {
            Context::Thread(ctx) => ctx.barrier(),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.barrier(),
        }
    }

    /// Copy `data` from `root` to every other rank.
    pub fn broadcast<T: Datatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        Error::check_rank(root, self.size(), "broadcast")?;
        let buf = RecvBuffer::new(data);
        match self {
            Context::Thread(ctx) => ctx.broadcast(buf, root),
            #[cfg(feature = "native")]
            Context::Native(ctx) => ctx.broadcast(buf, root),
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// An empty request list bound to this context.
    pub fn new_request_list(&self) -> RequestList<'_> {
        RequestList::new(self)
    }

    /// Build a request in the [`Created`](crate::RequestState::Created) state.
    ///
    /// A send buffer makes a send to `rank`; a receive buffer makes a receive
    /// from `rank`, which may be [`ANY_SOURCE`](crate::ANY_SOURCE), with `tag`
    /// possibly [`ANY_TAG`](crate::ANY_TAG).
    pub fn request<'a>(&'a self, buf: impl Into<Buffer<'a>>, rank: i32, tag: i32) -> Result<Request<'a>> {
        let buf = buf.into();
        if buf.is_send() {
            Error::check_rank(rank, self.size(), "isend")?;
            Error::check_tag(tag, self.reserved_tag_base(), "isend")?;
        } else {
            Error::check_source(rank, self.size(), "irecv")?;
            Error::check_recv_tag(tag, self.reserved_tag_base(), "irecv")?;
        }
        Ok(Request::new(self, buf, rank, tag))
    }

    /// Like [`request`](Self::request) for tags the caller vetted, reserved
    /// range included. Ranks are still checked.
    pub(crate) fn request_unchecked<'a>(&'a self, buf: Buffer<'a>, rank: i32, tag: i32) -> Result<Request<'a>> {
        if buf.is_send() {
            Error::check_rank(rank, self.size(), "isend")?;
        } else {
            Error::check_source(rank, self.size(), "irecv")?;
        }
        Ok(Request::new(self, buf, rank, tag))
    }

    /// Start a nonblocking send of `data` to `dest`.
    pub fn isend<'a, T: Datatype>(&'a self, data: &'a [T], dest: i32, tag: i32) -> Result<Request<'a>> {
        let mut request = self.request(data, dest, tag)?;
        request.start()?;
        Ok(request)
    }

    /// Start a nonblocking receive into `data`.
    pub fn irecv<'a, T: Datatype>(&'a self, data: &'a mut [T], source: i32, tag: i32) -> Result<Request<'a>> {
        let mut request = self.request(data, source, tag)?;
        request.start()?;
        Ok(request)
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    /// Blocking send of a slice.
    pub fn send<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        self.send_buffer(SendBuffer::new(data), dest, tag)
    }

    /// Blocking receive into a slice.
    pub fn recv<T: Datatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        self.recv_buffer(RecvBuffer::new(data), source, tag)
    }

    /// Blocking send of exactly `count` items.
    ///
    /// # Errors
    ///
    /// [`Error::CountMismatch`] when `data.len() != count`; nothing is sent.
    pub fn send_n<T: Datatype>(&self, data: &[T], count: usize, dest: i32, tag: i32) -> Result<()> {
        check_count("send", count, data.len())?;
        self.send(data, dest, tag)
    }

    /// Blocking receive of exactly `count` items' worth of buffer.
    ///
    /// # Errors
    ///
    /// [`Error::CountMismatch`] when `data.len() != count`; nothing is posted.
    pub fn recv_n<T: Datatype>(&self, data: &mut [T], count: usize, source: i32, tag: i32) -> Result<Status> {
        check_count("recv", count, data.len())?;
        self.recv(data, source, tag)
    }

    /// Element-wise reduction of slices.
    pub fn allreduce<T: Datatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp) -> Result<()> {
        self.allreduce_buffer(RecvBuffer::new(recv), SendBuffer::new(send), op)
    }

    /// Reduction of one value per rank.
    pub fn allreduce_scalar<T: Datatype>(&self, value: T, op: ReduceOp) -> Result<T> {
        let mut out = [value];
        self.allreduce(&[value], &mut out, op)?;
        Ok(out[0])
    }

    /// Sum of one value per rank.
    pub fn allsum<T: Datatype>(&self, value: T) -> Result<T> {
        self.allreduce_scalar(value, ReduceOp::Sum)
    }

    /// Minimum of one value per rank.
    pub fn allmin<T: Datatype>(&self, value: T) -> Result<T> {
        self.allreduce_scalar(value, ReduceOp::Min)
    }

    /// Maximum of one value per rank.
    pub fn allmax<T: Datatype>(&self, value: T) -> Result<T> {
        self.allreduce_scalar(value, ReduceOp::Max)
    }

    /// Element-wise sum of slices.
    pub fn allsum_slice<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        self.allreduce(send, recv, ReduceOp::Sum)
    }

    /// Element-wise minimum of slices.
    pub fn allmin_slice<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        self.allreduce(send, recv, ReduceOp::Min)
    }

    /// Element-wise maximum of slices.
    pub fn allmax_slice<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        self.allreduce(send, recv, ReduceOp::Max)
    }
}

fn check_count(op: &'static str, declared: usize, actual: usize) -> Result<()> {
    if declared == actual {
        Ok(())
    } else {
        Err(Error::CountMismatch { op, declared, actual })
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Thread(ctx) => f.debug_tuple("Context::Thread").field(ctx).finish(),
            #[cfg(feature = "native")]
            Context::Native(ctx) => f.debug_tuple("Context::Native").field(ctx).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeConfig, ThreadRuntime, ANY_TAG};

    fn run<R: Send + 'static>(size: usize, f: impl Fn(Context) -> R + Send + Sync + 'static) -> Vec<R> {
        ThreadRuntime::new(RuntimeConfig::default()).run(size, f).unwrap()
    }

    #[test]
    fn rank_and_tag_are_validated_before_any_transfer() {
        run(2, |ctx| {
            let data = [1i32];
            assert!(matches!(
                ctx.send(&data, 2, 0),
                Err(Error::InvalidRank { rank: 2, size: 2, op: "send" })
            ));
            assert!(matches!(ctx.send(&data, 0, -3), Err(Error::InvalidTag { .. })));
            assert!(matches!(ctx.send(&data, 0, ANY_TAG), Err(Error::InvalidTag { .. })));
            let reserved = ctx.reserved_tag_base();
            assert_eq!(reserved, RESERVED_TAG_BASE);
            assert!(matches!(
                ctx.isend(&data, 1, reserved),
                Err(Error::InvalidTag { op: "isend", .. })
            ));
            let mut spare = [0i32];
            assert!(matches!(
                ctx.irecv(&mut spare, 0, reserved + 1),
                Err(Error::InvalidTag { op: "irecv", .. })
            ));
            let mut out = [0i32];
            assert!(matches!(
                ctx.recv(&mut out, -7, 0),
                Err(Error::InvalidRank { op: "recv", .. })
            ));
            assert!(matches!(
                ctx.broadcast(&mut out, 5),
                Err(Error::InvalidRank { op: "broadcast", .. })
            ));
            assert_eq!(ctx.as_thread().unwrap().backlog(), (0, 0));
        });
    }

    #[test]
    fn declared_counts_must_match() {
        run(1, |ctx| {
            let data = [1u8, 2, 3];
            assert!(matches!(
                ctx.send_n(&data, 4, 0, 0),
                Err(Error::CountMismatch { op: "send", declared: 4, actual: 3 })
            ));
            let mut out = [0u8; 2];
            assert!(matches!(
                ctx.recv_n(&mut out, 3, 0, 0),
                Err(Error::CountMismatch { op: "recv", .. })
            ));
        });
    }

    #[test]
    fn local_allreduce_mismatch_is_an_error() {
        run(2, |ctx| {
            let send = [1.0f32, 2.0];
            let mut short = [0.0f32; 1];
            assert!(matches!(
                ctx.allreduce(&send, &mut short, ReduceOp::Sum),
                Err(Error::InvalidBuffer { op: "allreduce", .. })
            ));
            let mut wrong_kind = [0i32; 2];
            assert!(matches!(
                ctx.allreduce_buffer(RecvBuffer::new(&mut wrong_kind[..]), SendBuffer::new(&send[..]), ReduceOp::Sum),
                Err(Error::InvalidBuffer { .. })
            ));
            ctx.barrier().unwrap();
        });
    }

    #[test]
    fn reductions_and_broadcast() {
        let results = run(4, |ctx| {
            let r = ctx.rank();
            let sum = ctx.allsum(r as i64).unwrap();
            let min = ctx.allmin(r as f64 - 1.0).unwrap();
            let max = ctx.allmax(r as u32).unwrap();
            let mut prod = [0u64; 2];
            ctx.allreduce(&[2u64, r as u64 + 1], &mut prod, ReduceOp::Prod).unwrap();
            let mut slice_max = [0i32; 3];
            ctx.allmax_slice(&[r, -r, 7], &mut slice_max).unwrap();
            let mut table = if r == 2 { [9u8, 8, 7] } else { [0u8; 3] };
            ctx.broadcast(&mut table, 2).unwrap();
            (sum, min, max, prod, slice_max, table)
        });
        for (sum, min, max, prod, slice_max, table) in results {
            assert_eq!(sum, 6);
            assert_eq!(min, -1.0);
            assert_eq!(max, 3);
            assert_eq!(prod, [16, 24]);
            assert_eq!(slice_max, [3, 0, 7]);
            assert_eq!(table, [9, 8, 7]);
        }
    }
}
