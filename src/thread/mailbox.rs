//! Per-rank message matching for the thread backend.
//!
//! Every rank owns one [`Mailbox`] holding two ordered queues: sends addressed
//! to it that no receive has claimed yet, and receives it posted that no send
//! has satisfied yet. Posting either side first scans the opposite queue in
//! arrival order; a hit is claimed through the entry's [`Rendezvous`] and the
//! payload is copied straight from the sender's slice into the receiver's
//! slice. A miss enqueues the new entry with a fresh rendezvous for the caller
//! to wait on.
//!
//! Scanning in arrival order on both queues gives non-overtaking delivery for
//! each (sender, receiver, tag, channel).

use super::rendezvous::Rendezvous;
use crate::buffer::{RecvBuffer, SendBuffer};
use crate::datatype::DatatypeTag;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::{ANY_SOURCE, ANY_TAG, RESERVED_TAG_BASE};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Traffic class. Collective operations never match point-to-point receives,
/// whatever their tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    PointToPoint,
    Collective,
}

struct PostedSend {
    source: i32,
    tag: i32,
    channel: Channel,
    data: *const u8,
    count: usize,
    kind: DatatypeTag,
    rdv: Arc<Rendezvous>,
}

struct PostedRecv {
    source: i32,
    tag: i32,
    channel: Channel,
    buf: *mut u8,
    capacity: usize,
    kind: DatatypeTag,
    rdv: Arc<Rendezvous>,
}

#[derive(Default)]
struct Queues {
    sends: VecDeque<PostedSend>,
    recvs: VecDeque<PostedRecv>,
}

// SAFETY: the raw pointers in queued entries point into buffers whose owners
// are blocked on (or hold a pending request for) the entry's rendezvous, so
// they stay valid until the entry is matched or cancelled and removed.
unsafe impl Send for Queues {}

#[derive(Default)]
pub(crate) struct Mailbox {
    queues: Mutex<Queues>,
}

/// Result of posting one side of a transfer.
pub(crate) enum Posted {
    /// A partner was already waiting; the transfer is done.
    Done(Result<Option<Status>>),
    /// Queued; wait on the rendezvous.
    Pending(Arc<Rendezvous>),
}

/// `ANY_TAG` covers user tags only; reserved tags must be named exactly.
fn accepts(want_source: i32, want_tag: i32, want_channel: Channel, source: i32, tag: i32, channel: Channel) -> bool {
    want_channel == channel
        && (want_source == ANY_SOURCE || want_source == source)
        && (want_tag == tag || (want_tag == ANY_TAG && tag < RESERVED_TAG_BASE))
}

/// Copy a send payload into a receive buffer, validating kind and size.
///
/// # Safety
///
/// `src` must be valid for `count` elements of `send_kind`, `dst` for
/// `capacity` elements of `recv_kind`, and both must stay valid for the call.
#[allow(clippy::too_many_arguments)]
unsafe fn transfer(
    source: i32,
    tag: i32,
    src: *const u8,
    count: usize,
    send_kind: DatatypeTag,
    dst: *mut u8,
    capacity: usize,
    recv_kind: DatatypeTag,
) -> Result<Status> {
    if send_kind != recv_kind {
        return Err(Error::DatatypeMismatch {
            source_rank: source,
            tag,
            sent: send_kind,
            expected: recv_kind,
        });
    }
    if count > capacity {
        return Err(Error::Truncated {
            source_rank: source,
            tag,
            incoming: count,
            capacity,
        });
    }
    let bytes = count * send_kind.size_of();
    if bytes > 0 {
        std::ptr::copy(src, dst, bytes);
    }
    Ok(Status {
        source,
        tag,
        count: count as i64,
    })
}

impl Mailbox {
    /// Post a send from `source` into this (the destination's) mailbox.
    pub(crate) fn post_send(&self, buf: SendBuffer<'_>, source: i32, tag: i32, channel: Channel) -> Posted {
        let mut queues = self.queues.lock();
        let mut index = 0;
        while index < queues.recvs.len() {
            let recv = &queues.recvs[index];
            if !accepts(recv.source, recv.tag, recv.channel, source, tag, channel) {
                index += 1;
                continue;
            }
            let Some(recv) = queues.recvs.remove(index) else {
                break;
            };
            if !recv.rdv.try_match() {
                // Cancelled between post and now; drop the stale entry.
                continue;
            }
            drop(queues);
            // SAFETY: the receiver is waiting on `recv.rdv`, which we just
            // claimed, so its buffer is live; ours is borrowed by `buf`.
            let result = unsafe {
                transfer(
                    source,
                    tag,
                    buf.as_ptr(),
                    buf.len(),
                    buf.kind(),
                    recv.buf,
                    recv.capacity,
                    recv.kind,
                )
            };
            match result {
                Ok(status) => recv.rdv.complete(Some(status), None),
                Err(fault) => recv.rdv.complete(None, Some(fault)),
            }
            // Errors belong to the receiver; the send itself succeeded.
            return Posted::Done(Ok(None));
        }

        let rdv = Arc::new(Rendezvous::first_arrival());
        queues.sends.push_back(PostedSend {
            source,
            tag,
            channel,
            data: buf.as_ptr(),
            count: buf.len(),
            kind: buf.kind(),
            rdv: Arc::clone(&rdv),
        });
        Posted::Pending(rdv)
    }

    /// Post a receive owned by this mailbox's rank.
    pub(crate) fn post_recv(&self, buf: &mut RecvBuffer<'_>, source: i32, tag: i32, channel: Channel) -> Posted {
        let mut queues = self.queues.lock();
        let mut index = 0;
        while index < queues.sends.len() {
            let send = &queues.sends[index];
            if !accepts(source, tag, channel, send.source, send.tag, send.channel) {
                index += 1;
                continue;
            }
            let Some(send) = queues.sends.remove(index) else {
                break;
            };
            if !send.rdv.try_match() {
                continue;
            }
            drop(queues);
            // SAFETY: the sender is waiting on `send.rdv`, which we just
            // claimed, so its buffer is live; ours is borrowed by `buf`.
            let result = unsafe {
                transfer(
                    send.source,
                    send.tag,
                    send.data,
                    send.count,
                    send.kind,
                    buf.as_mut_ptr(),
                    buf.len(),
                    buf.kind(),
                )
            };
            send.rdv.complete(None, None);
            return Posted::Done(result.map(Some));
        }

        let rdv = Arc::new(Rendezvous::first_arrival());
        queues.recvs.push_back(PostedRecv {
            source,
            tag,
            channel,
            buf: buf.as_mut_ptr(),
            capacity: buf.len(),
            kind: buf.kind(),
            rdv: Arc::clone(&rdv),
        });
        Posted::Pending(rdv)
    }

    /// Drop the queue entry owning `rdv`, after the owner cancelled it.
    pub(crate) fn withdraw(&self, rdv: &Arc<Rendezvous>) {
        let mut queues = self.queues.lock();
        queues.sends.retain(|s| !Arc::ptr_eq(&s.rdv, rdv));
        queues.recvs.retain(|r| !Arc::ptr_eq(&r.rdv, rdv));
    }

    /// Unmatched (sends, receives) currently queued.
    pub(crate) fn backlog(&self) -> (usize, usize) {
        let queues = self.queues.lock();
        (queues.sends.len(), queues.recvs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::rendezvous::WaitOutcome;

    fn pending(posted: Posted) -> Arc<Rendezvous> {
        match posted {
            Posted::Pending(rdv) => rdv,
            Posted::Done(_) => panic!("expected the post to queue"),
        }
    }

    fn done(posted: Posted) -> Result<Option<Status>> {
        match posted {
            Posted::Done(result) => result,
            Posted::Pending(_) => panic!("expected an immediate match"),
        }
    }

    #[test]
    fn recv_first_then_send_copies_into_receiver() {
        let mailbox = Mailbox::default();
        let mut out = [0i32; 4];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let rdv = pending(mailbox.post_recv(&mut recv, 2, 7, Channel::PointToPoint));

        let data = [1i32, 2, 3];
        let send_result = done(mailbox.post_send(SendBuffer::new(&data[..]), 2, 7, Channel::PointToPoint));
        assert!(send_result.unwrap().is_none());

        assert_eq!(rdv.wait(0), WaitOutcome::Completed);
        let (status, fault) = rdv.take_result();
        assert!(fault.is_none());
        assert_eq!(status, Some(Status { source: 2, tag: 7, count: 3 }));
        drop(recv);
        assert_eq!(out, [1, 2, 3, 0]);
    }

    #[test]
    fn send_first_then_wildcard_recv() {
        let mailbox = Mailbox::default();
        let data = [9u8; 5];
        let rdv = pending(mailbox.post_send(SendBuffer::new(&data[..]), 1, 4, Channel::PointToPoint));

        let mut out = [0u8; 8];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let status = done(mailbox.post_recv(&mut recv, ANY_SOURCE, ANY_TAG, Channel::PointToPoint))
            .unwrap()
            .unwrap();
        assert_eq!(status, Status { source: 1, tag: 4, count: 5 });
        assert_eq!(rdv.wait(0), WaitOutcome::Completed);
    }

    #[test]
    fn channels_do_not_cross() {
        let mailbox = Mailbox::default();
        let data = [1u64];
        let _rdv = pending(mailbox.post_send(SendBuffer::new(&data[..]), 0, 1, Channel::Collective));
        let mut out = [0u64];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let _ = pending(mailbox.post_recv(&mut recv, ANY_SOURCE, ANY_TAG, Channel::PointToPoint));
        assert_eq!(mailbox.backlog(), (1, 1));
    }

    #[test]
    fn same_tag_messages_are_not_overtaken() {
        let mailbox = Mailbox::default();
        let first = [1i64];
        let second = [2i64];
        let a = pending(mailbox.post_send(SendBuffer::new(&first[..]), 3, 0, Channel::PointToPoint));
        let b = pending(mailbox.post_send(SendBuffer::new(&second[..]), 3, 0, Channel::PointToPoint));

        let mut out = [0i64];
        let mut recv = RecvBuffer::new(&mut out[..]);
        done(mailbox.post_recv(&mut recv, 3, 0, Channel::PointToPoint)).unwrap();
        drop(recv);
        assert_eq!(out, [1]);
        assert_eq!(a.wait(0), WaitOutcome::Completed);
        assert_eq!(b.phase(), crate::thread::rendezvous::Phase::Posted);
    }

    #[test]
    fn oversized_message_faults_the_receiver_only() {
        let mailbox = Mailbox::default();
        let mut out = [0f32; 1];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let rdv = pending(mailbox.post_recv(&mut recv, 0, 0, Channel::PointToPoint));
        let data = [1.0f32, 2.0];
        assert!(done(mailbox.post_send(SendBuffer::new(&data[..]), 0, 0, Channel::PointToPoint)).is_ok());
        let (status, fault) = rdv.take_result();
        assert!(status.is_none());
        assert!(matches!(fault, Some(Error::Truncated { incoming: 2, capacity: 1, .. })));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let mailbox = Mailbox::default();
        let data = [1u32];
        let _rdv = pending(mailbox.post_send(SendBuffer::new(&data[..]), 0, 0, Channel::PointToPoint));
        let mut out = [0i32];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let result = done(mailbox.post_recv(&mut recv, 0, 0, Channel::PointToPoint));
        assert!(matches!(result, Err(Error::DatatypeMismatch { .. })));
    }

    #[test]
    fn wildcard_tag_skips_reserved_range() {
        let mailbox = Mailbox::default();
        let data = [3u64];
        let _reserved = pending(mailbox.post_send(SendBuffer::new(&data[..]), 1, RESERVED_TAG_BASE, Channel::PointToPoint));
        let mut out = [0u64];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let _ = pending(mailbox.post_recv(&mut recv, ANY_SOURCE, ANY_TAG, Channel::PointToPoint));
        assert_eq!(mailbox.backlog(), (1, 1));
    }

    #[test]
    fn cancelled_entry_is_skipped_and_withdrawn() {
        let mailbox = Mailbox::default();
        let mut out = [0u8; 1];
        let mut recv = RecvBuffer::new(&mut out[..]);
        let rdv = pending(mailbox.post_recv(&mut recv, 0, 0, Channel::PointToPoint));
        assert!(rdv.cancel());
        mailbox.withdraw(&rdv);
        assert_eq!(mailbox.backlog(), (0, 0));

        let data = [5u8];
        let _late = pending(mailbox.post_send(SendBuffer::new(&data[..]), 0, 0, Channel::PointToPoint));
        assert_eq!(mailbox.backlog(), (1, 0));
    }
}
