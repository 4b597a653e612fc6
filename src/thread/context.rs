//! Per-rank handle of the thread-emulated backend.

use super::mailbox::{Channel, Posted};
use super::rendezvous::{Rendezvous, WaitOutcome};
use super::Group;
use crate::buffer::{check_reduce_buffers, RecvBuffer, SendBuffer};
use crate::datatype::{reduce_bytes, DatatypeTag};
use crate::error::{Error, Result};
use crate::status::Status;
use crate::ReduceOp;
use std::sync::Arc;

const COLL_HEADER: i32 = 1;
const COLL_DATA: i32 = 2;
const COLL_VERDICT: i32 = 3;
const COLL_RESULT: i32 = 4;
const COLL_BCAST: i32 = 5;

const COLLECTIVE_ROOT: i32 = 0;

/// One rank of a group of threads spawned by a
/// [`ThreadRuntime`](crate::ThreadRuntime).
///
/// All cross-rank traffic goes through the destination's mailbox; the copy
/// itself happens once, directly between the two caller buffers.
pub struct ThreadContext {
    group: Arc<Group>,
    rank: i32,
    spin_count: u32,
}

impl ThreadContext {
    pub(crate) fn new(group: Arc<Group>, rank: i32, spin_count: u32) -> Self {
        ThreadContext {
            group,
            rank,
            spin_count,
        }
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> i32 {
        self.group.size()
    }

    /// Rank of the calling thread.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Identity of the rank group this context belongs to.
    pub fn group_id(&self) -> super::GroupId {
        self.group.id()
    }

    /// Spin budget used by this rank's waits.
    pub fn spin_count(&self) -> u32 {
        self.spin_count
    }

    /// Unmatched (sends, receives) queued at this rank's mailbox.
    pub fn backlog(&self) -> (usize, usize) {
        self.group.mailbox(self.rank).backlog()
    }

    pub(crate) fn post_send(&self, buf: SendBuffer<'_>, dest: i32, tag: i32) -> Posted {
        self.group
            .mailbox(dest)
            .post_send(buf, self.rank, tag, Channel::PointToPoint)
    }

    pub(crate) fn post_recv(&self, buf: &mut RecvBuffer<'_>, source: i32, tag: i32) -> Posted {
        self.group
            .mailbox(self.rank)
            .post_recv(buf, source, tag, Channel::PointToPoint)
    }

    /// Remove a cancelled entry from whichever mailbox holds it.
    pub(crate) fn withdraw(&self, mailbox_rank: i32, rdv: &Arc<Rendezvous>) {
        self.group.mailbox(mailbox_rank).withdraw(rdv);
    }

    pub(crate) fn group(&self) -> &Arc<Group> {
        &self.group
    }

    /// Block on a queued transfer until its partner has copied it.
    fn finish(&self, rdv: &Rendezvous) -> Result<Option<Status>> {
        match rdv.wait_no_cancel(self.spin_count) {
            WaitOutcome::Completed => {}
            WaitOutcome::Cancelled => {
                return Err(Error::Internal("blocking transfer was cancelled".into()))
            }
        }
        let (status, fault) = rdv.take_result();
        match fault {
            Some(fault) => Err(fault),
            None => Ok(status),
        }
    }

    fn send_on(&self, buf: SendBuffer<'_>, dest: i32, tag: i32, channel: Channel) -> Result<()> {
        match self.group.mailbox(dest).post_send(buf, self.rank, tag, channel) {
            Posted::Done(result) => result.map(|_| ()),
            Posted::Pending(rdv) => self.finish(&rdv).map(|_| ()),
        }
    }

    fn recv_on(&self, buf: &mut RecvBuffer<'_>, source: i32, tag: i32, channel: Channel) -> Result<Status> {
        let status = match self.group.mailbox(self.rank).post_recv(buf, source, tag, channel) {
            Posted::Done(result) => result?,
            Posted::Pending(rdv) => self.finish(&rdv)?,
        };
        status.ok_or_else(|| Error::Internal("receive completed without a status".into()))
    }

    /// Blocking send. Returns once a matching receive has taken the data.
    pub fn send(&self, buf: SendBuffer<'_>, dest: i32, tag: i32) -> Result<()> {
        self.send_on(buf, dest, tag, Channel::PointToPoint)
    }

    /// Blocking receive.
    pub fn recv(&self, mut buf: RecvBuffer<'_>, source: i32, tag: i32) -> Result<Status> {
        self.recv_on(&mut buf, source, tag, Channel::PointToPoint)
    }

    /// Element-wise reduction across the group, result delivered to every rank.
    ///
    /// Rank 0 gathers every contribution, checks that all ranks agree on
    /// element count, kind and operation, folds them, then sends back either
    /// the result or a violation verdict. A disagreement is a broken program,
    /// not a recoverable condition: every rank panics.
    pub fn allreduce(&self, mut recv: RecvBuffer<'_>, send: SendBuffer<'_>, op: ReduceOp) -> Result<()> {
        check_reduce_buffers(&recv, &send)?;
        let header = [
            send.len() as u64,
            send.kind() as u64,
            op as u64,
            send.byte_len() as u64,
        ];

        if self.size() == 1 {
            recv.as_bytes_mut().copy_from_slice(send.as_bytes());
            return Ok(());
        }

        if self.rank == COLLECTIVE_ROOT {
            let mut acc = send.as_bytes().to_vec();
            let mut violation = None;
            for source in 1..self.size() {
                let mut theirs = [0u64; 4];
                self.recv_on(&mut RecvBuffer::new(&mut theirs[..]), source, COLL_HEADER, Channel::Collective)?;
                let mut scratch = vec![0u8; theirs[3] as usize];
                self.recv_on(&mut RecvBuffer::new(&mut scratch[..]), source, COLL_DATA, Channel::Collective)?;
                if theirs != header {
                    violation.get_or_insert_with(|| {
                        format!(
                            "allreduce protocol violation: rank {source} sent (count {}, kind {:?}, op {}) but rank 0 has (count {}, kind {:?}, op {})",
                            theirs[0],
                            DatatypeTag::from_raw(theirs[1] as i32),
                            theirs[2],
                            header[0],
                            send.kind(),
                            header[2],
                        )
                    });
                } else if violation.is_none() {
                    reduce_bytes(send.kind(), op, &mut acc, &scratch);
                }
            }

            let verdict = [u64::from(violation.is_none())];
            for dest in 1..self.size() {
                self.send_on(SendBuffer::new(&verdict[..]), dest, COLL_VERDICT, Channel::Collective)?;
                if violation.is_none() {
                    self.send_on(SendBuffer::new(&acc[..]), dest, COLL_RESULT, Channel::Collective)?;
                }
            }
            if let Some(message) = violation {
                panic!("{message}");
            }
            recv.as_bytes_mut().copy_from_slice(&acc);
        } else {
            self.send_on(SendBuffer::new(&header[..]), COLLECTIVE_ROOT, COLL_HEADER, Channel::Collective)?;
            self.send_on(SendBuffer::new(send.as_bytes()), COLLECTIVE_ROOT, COLL_DATA, Channel::Collective)?;

            let mut verdict = [0u64; 1];
            self.recv_on(&mut RecvBuffer::new(&mut verdict[..]), COLLECTIVE_ROOT, COLL_VERDICT, Channel::Collective)?;
            if verdict[0] == 0 {
                panic!(
                    "allreduce protocol violation detected by rank 0 (rank {} sent count {}, kind {:?}, op {:?})",
                    self.rank,
                    send.len(),
                    send.kind(),
                    op
                );
            }
            self.recv_on(&mut RecvBuffer::new(recv.as_bytes_mut()), COLLECTIVE_ROOT, COLL_RESULT, Channel::Collective)?;
        }
        Ok(())
    }

    /// Every rank waits until all ranks have arrived.
    pub fn barrier(&self) -> Result<()> {
        let token = [0u8];
        let mut out = [0u8];
        self.allreduce(RecvBuffer::new(&mut out[..]), SendBuffer::new(&token[..]), ReduceOp::Sum)
    }

    /// Copy `buf` at `root` into `buf` at every other rank.
    pub fn broadcast(&self, mut buf: RecvBuffer<'_>, root: i32) -> Result<()> {
        Error::check_rank(root, self.size(), "broadcast")?;
        if self.rank == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send_on(buf.as_send(), dest, COLL_BCAST, Channel::Collective)?;
            }
            Ok(())
        } else {
            self.recv_on(&mut buf, root, COLL_BCAST, Channel::Collective).map(|_| ())
        }
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("group", &self.group.id())
            .field("rank", &self.rank)
            .field("size", &self.size())
            .finish()
    }
}
