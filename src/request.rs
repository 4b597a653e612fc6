//! Request handles for nonblocking point-to-point operations.
//!
//! A [`Request`] is created against a [`Context`] with a buffer, a peer and a
//! tag, and walks one of two paths:
//!
//! ```text
//!   Created ──start──▶ Started ──wait/test──▶ Completed
//!                         │
//!                         └──────cancel─────▶ Cancelled
//! ```
//!
//! Terminal states are final. A started request that is dropped without being
//! resolved is cancelled if nothing has matched it yet, and waited on
//! otherwise, so the borrowed buffer is never released while a peer may still
//! touch it.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::thread::mailbox::Posted;
use crate::thread::rendezvous::{Phase, Rendezvous, WaitOutcome};
use crate::thread::{Group, ThreadContext};
use crate::Context;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Lifecycle state of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Built, not yet posted.
    Created,
    /// Posted and not yet resolved.
    Started,
    /// Transfer finished (successfully or with an error reported once).
    Completed,
    /// Withdrawn before any peer matched it.
    Cancelled,
}

impl RequestState {
    fn name(self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::Started => "started",
            RequestState::Completed => "completed",
            RequestState::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

/// Backend half of a started operation.
enum Pending {
    Thread(Arc<Rendezvous>),
    #[cfg(feature = "native")]
    Native(i64),
}

/// A handle to one nonblocking send or receive.
///
/// # Example
///
/// ```no_run
/// # fn demo(ctx: &mpcomm::Context) -> mpcomm::Result<()> {
/// let peer = (ctx.rank() + 1) % ctx.size();
/// let outgoing = [ctx.rank() as f64; 16];
/// let mut incoming = [0.0f64; 16];
///
/// let mut recv = ctx.irecv(&mut incoming, mpcomm::ANY_SOURCE, 3)?;
/// let mut send = ctx.isend(&outgoing, peer, 3)?;
///
/// // Do other work while communication proceeds...
///
/// send.wait()?;
/// let status = recv.wait()?.expect("receives report a status");
/// println!("got {} values from rank {}", status.count, status.source);
/// # Ok(())
/// # }
/// ```
pub struct Request<'a> {
    ctx: &'a Context,
    buf: Buffer<'a>,
    peer: i32,
    tag: i32,
    state: RequestState,
    pending: Option<Pending>,
    status: Option<Status>,
    fault: Option<Error>,
}

impl<'a> Request<'a> {
    /// Build a request with arguments the caller has already validated.
    pub(crate) fn new(ctx: &'a Context, buf: Buffer<'a>, peer: i32, tag: i32) -> Self {
        Request {
            ctx,
            buf,
            peer,
            tag,
            state: RequestState::Created,
            pending: None,
            status: None,
            fault: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Peer rank: the destination of a send, the source filter of a receive.
    pub fn peer(&self) -> i32 {
        self.peer
    }

    /// Tag the request was created with.
    pub fn tag(&self) -> i32 {
        self.tag
    }

    /// Whether this request sends.
    pub fn is_send(&self) -> bool {
        self.buf.is_send()
    }

    /// Status of a completed receive. `None` for sends, for cancelled
    /// requests and for anything not yet completed.
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Whether the request ended cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state == RequestState::Cancelled
    }

    /// Post the operation.
    ///
    /// On the thread backend a counterpart that is already posted is matched
    /// and copied on the spot; the request is then complete as soon as it is
    /// tested or waited on.
    ///
    /// # Errors
    ///
    /// [`Error::RequestState`] unless the request is [`RequestState::Created`].
    pub fn start(&mut self) -> Result<()> {
        if self.state != RequestState::Created {
            return Err(Error::RequestState {
                action: "start",
                state: self.state.name(),
            });
        }
        self.state = RequestState::Started;

        let ctx: &'a Context = self.ctx;
        match ctx {
            Context::Thread(ctx) => {
                let posted = match &mut self.buf {
                    Buffer::Send(buf) => ctx.post_send(*buf, self.peer, self.tag),
                    Buffer::Recv(buf) => ctx.post_recv(buf, self.peer, self.tag),
                };
                match posted {
                    Posted::Done(result) => self.settle(result),
                    Posted::Pending(rdv) => self.pending = Some(Pending::Thread(rdv)),
                }
            }
            #[cfg(feature = "native")]
            Context::Native(ctx) => match ctx.post(&mut self.buf, self.peer, self.tag) {
                Ok(handle) => self.pending = Some(Pending::Native(handle)),
                Err(err) => {
                    self.state = RequestState::Created;
                    return Err(err);
                }
            },
        }
        trace!(peer = self.peer, tag = self.tag, send = self.is_send(), "request started");
        Ok(())
    }

    /// Record a completion; a fault is kept for the next `wait`/`test`.
    fn settle(&mut self, result: Result<Option<Status>>) {
        self.state = RequestState::Completed;
        self.pending = None;
        match result {
            Ok(status) => self.status = if self.is_send() { None } else { status },
            Err(fault) => self.fault = Some(fault),
        }
    }

    fn settle_thread(&mut self, rdv: &Rendezvous, outcome: WaitOutcome) {
        match outcome {
            WaitOutcome::Completed => {
                let (status, fault) = rdv.take_result();
                self.settle(match fault {
                    Some(fault) => Err(fault),
                    None => Ok(status),
                });
            }
            WaitOutcome::Cancelled => {
                self.state = RequestState::Cancelled;
                self.pending = None;
            }
        }
    }

    #[cfg(feature = "native")]
    fn settle_native(&mut self, completion: crate::native::Completion) {
        if completion.cancelled {
            self.state = RequestState::Cancelled;
            self.pending = None;
        } else {
            self.settle(Ok(Some(completion.status)));
        }
    }

    /// Hand back a deferred fault once, then report the terminal status.
    fn report(&mut self) -> Result<Option<Status>> {
        match self.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(self.status),
        }
    }

    /// Block until the request is completed or cancelled.
    ///
    /// Returns the receive status, or `None` for sends and cancelled requests.
    /// Waiting on an already-terminal request returns immediately.
    ///
    /// # Errors
    ///
    /// [`Error::NotStarted`] on a request that was never started; transfer
    /// errors such as [`Error::Truncated`] are reported by the first `wait`
    /// or `test` after completion.
    pub fn wait(&mut self) -> Result<Option<Status>> {
        match self.state {
            RequestState::Created => return Err(Error::NotStarted),
            RequestState::Completed | RequestState::Cancelled => return self.report(),
            RequestState::Started => {}
        }

        match self.pending.take() {
            Some(Pending::Thread(rdv)) => {
                let spin = self.spin_count();
                let outcome = match rdv.phase() {
                    Phase::Matched | Phase::Completed => rdv.wait_no_cancel(spin),
                    Phase::Posted | Phase::Cancelled => rdv.wait(spin),
                };
                self.settle_thread(&rdv, outcome);
            }
            #[cfg(feature = "native")]
            Some(Pending::Native(handle)) => match crate::native::wait(handle) {
                Ok(completion) => self.settle_native(completion),
                Err(fault) => self.settle(Err(fault)),
            },
            None => return Err(Error::Internal("started request has no pending operation".into())),
        }
        self.report()
    }

    /// Check for completion without blocking.
    ///
    /// Returns `true` once the request is terminal; repeated calls keep
    /// returning `true` and never change the recorded status. A request that
    /// was never started is not terminal and yields `false`.
    pub fn test(&mut self) -> Result<bool> {
        match self.state {
            RequestState::Created => return Ok(false),
            RequestState::Completed | RequestState::Cancelled => return self.report().map(|_| true),
            RequestState::Started => {}
        }

        match &self.pending {
            Some(Pending::Thread(rdv)) => {
                let outcome = match rdv.phase() {
                    Phase::Completed => WaitOutcome::Completed,
                    Phase::Cancelled => WaitOutcome::Cancelled,
                    Phase::Posted | Phase::Matched => return Ok(false),
                };
                let rdv = Arc::clone(rdv);
                self.settle_thread(&rdv, outcome);
            }
            #[cfg(feature = "native")]
            Some(Pending::Native(handle)) => match crate::native::test(*handle) {
                Ok(Some(completion)) => self.settle_native(completion),
                Ok(None) => return Ok(false),
                Err(fault) => self.settle(Err(fault)),
            },
            None => return Err(Error::Internal("started request has no pending operation".into())),
        }
        self.report().map(|_| true)
    }

    /// Withdraw the operation if no peer has matched it yet.
    ///
    /// A no-op on a request that was never started and on one that is already
    /// matched or terminal; the latter completes normally through `wait`.
    pub fn cancel(&mut self) {
        if self.state != RequestState::Started {
            return;
        }
        match &self.pending {
            Some(Pending::Thread(rdv)) => {
                if rdv.cancel() {
                    match self.ctx {
                        Context::Thread(ctx) => ctx.withdraw(self.mailbox_rank(ctx), rdv),
                        #[cfg(feature = "native")]
                        _ => {}
                    }
                    self.state = RequestState::Cancelled;
                    self.pending = None;
                    trace!(peer = self.peer, tag = self.tag, "request cancelled");
                }
            }
            #[cfg(feature = "native")]
            Some(Pending::Native(handle)) => {
                let handle = *handle;
                if crate::native::cancel(handle).is_ok() {
                    match crate::native::wait(handle) {
                        Ok(completion) => self.settle_native(completion),
                        Err(fault) => self.settle(Err(fault)),
                    }
                }
            }
            None => {}
        }
    }

    /// A token that can cancel this request from another thread.
    ///
    /// Only pending thread-backend requests have one. Cancelling through the
    /// token wakes a thread blocked in [`wait`](Self::wait), which then
    /// observes [`RequestState::Cancelled`].
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        match (&self.pending, self.ctx) {
            (Some(Pending::Thread(rdv)), Context::Thread(ctx)) => Some(CancelHandle {
                rdv: Arc::clone(rdv),
                group: Arc::clone(ctx.group()),
                mailbox: self.mailbox_rank(ctx),
            }),
            _ => None,
        }
    }

    /// Sends are queued at the destination, receives at the owner.
    fn mailbox_rank(&self, ctx: &ThreadContext) -> i32 {
        if self.is_send() {
            self.peer
        } else {
            ctx.rank()
        }
    }

    fn spin_count(&self) -> u32 {
        match self.ctx {
            Context::Thread(ctx) => ctx.spin_count(),
            #[cfg(feature = "native")]
            Context::Native(_) => 0,
        }
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if self.state == RequestState::Started {
            self.cancel();
            if self.state == RequestState::Started {
                let _ = self.wait();
            }
        }
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("state", &self.state)
            .field("send", &self.is_send())
            .field("peer", &self.peer)
            .field("tag", &self.tag)
            .field("status", &self.status)
            .finish()
    }
}

/// Cancellation token for a pending thread-backend [`Request`].
#[derive(Clone)]
pub struct CancelHandle {
    rdv: Arc<Rendezvous>,
    group: Arc<Group>,
    mailbox: i32,
}

impl CancelHandle {
    /// Withdraw the request if nothing has matched it yet. Returns whether
    /// this call cancelled it.
    pub fn cancel(&self) -> bool {
        if self.rdv.cancel() {
            self.group.mailbox(self.mailbox).withdraw(&self.rdv);
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("group", &self.group.id())
            .field("mailbox", &self.mailbox)
            .field("phase", &self.rdv.phase())
            .field("arrivals", &self.rdv.arrivals())
            .field("parked", &self.rdv.parked())
            .finish()
    }
}
