//! Irregular all-to-all redistribution of [`XPacket`]s.
//!
//! Every rank contributes any number of packets addressed to any ranks, and
//! receives every packet addressed to it. Payload sizes are not known in
//! advance, so the exchange runs in two phases:
//!
//! 1. **sizes**: one reduction tells each rank how many packets to expect;
//!    each rank then posts that many wildcard receives for `[u64; 3]` size
//!    triples and sends one triple per outgoing packet;
//! 2. **data**: once every triple has arrived, the receive payloads are sized
//!    and receives for the non-empty ones are posted against the now-known
//!    sources, then the non-empty outgoing payloads are sent.
//!
//! Both phases use tags from the context's reserved range (see
//! [`exchange_tags`]), so they never match user traffic. Messages between one pair of ranks on one tag are delivered in
//! order, which keeps each source's data messages aligned with the slots its
//! size triples landed in.

use crate::buffer::{Buffer, RecvBuffer, SendBuffer};
use crate::error::{Error, Result};
use crate::Context;
use crate::{ReduceOp, ANY_SOURCE};
use tracing::{debug, debug_span};

/// Tags of the size and data phases on `ctx`: the first two reserved tags.
pub fn exchange_tags(ctx: &Context) -> (i32, i32) {
    let base = ctx.reserved_tag_base();
    (base, base + 1)
}

/// One rank's contribution to, or delivery from, an [`exchange`].
///
/// On the sending side `rank` is the destination; after an exchange, received
/// packets carry their source in `rank`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XPacket {
    /// Destination (outgoing) or source (received) rank.
    pub rank: i32,
    /// Raw binary payload.
    pub bytes: Vec<u8>,
    /// Integer payload.
    pub ints: Vec<i64>,
    /// Floating-point payload.
    pub floats: Vec<f64>,
}

impl XPacket {
    /// An empty packet addressed to `rank`.
    pub fn new(rank: i32) -> Self {
        XPacket {
            rank,
            ..Default::default()
        }
    }

    /// Set the binary payload.
    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bytes = bytes.into();
        self
    }

    /// Set the integer payload.
    pub fn with_ints(mut self, ints: impl Into<Vec<i64>>) -> Self {
        self.ints = ints.into();
        self
    }

    /// Set the floating-point payload.
    pub fn with_floats(mut self, floats: impl Into<Vec<f64>>) -> Self {
        self.floats = floats.into();
        self
    }

    /// Whether any payload is non-empty.
    pub fn has_data(&self) -> bool {
        !self.bytes.is_empty() || !self.ints.is_empty() || !self.floats.is_empty()
    }

    fn sizes(&self) -> [u64; 3] {
        [self.bytes.len() as u64, self.ints.len() as u64, self.floats.len() as u64]
    }

    fn resize(&mut self, sizes: [u64; 3]) {
        self.bytes.resize(sizes[0] as usize, 0);
        self.ints.resize(sizes[1] as usize, 0);
        self.floats.resize(sizes[2] as usize, 0.0);
    }
}

/// Number of packets in `send` addressed to each rank, summed over all ranks,
/// evaluated at the caller's rank: how many packets this rank will receive.
///
/// Collective: every rank must call it.
pub fn recv_packet_count(ctx: &Context, send: &[XPacket]) -> Result<usize> {
    let size = ctx.size();
    for packet in send {
        Error::check_rank(packet.rank, size, "exchange")?;
    }
    let mut counts = vec![0u64; size as usize];
    for packet in send {
        counts[packet.rank as usize] += 1;
    }
    let mut totals = vec![0u64; size as usize];
    ctx.allreduce(&counts, &mut totals, ReduceOp::Sum)?;
    Ok(totals[ctx.rank() as usize] as usize)
}

/// Deliver every packet in `send` to its destination rank.
///
/// On return `recv` holds exactly the packets addressed to this rank, each
/// with `rank` set to its source. Packets from one source keep the order in
/// which that source listed them; packets from different sources are in
/// arrival order.
///
/// Collective: every rank must call it, with possibly empty `send`.
///
/// # Errors
///
/// [`Error::InvalidRank`] if any packet targets a rank outside `[0, size)`;
/// nothing is sent in that case. Transport errors are passed through.
///
/// # Panics
///
/// If the received size triples disagree with the counts agreed in the
/// reduction, which means the backend broke its delivery contract.
///
/// # Example
///
/// ```
/// use mpcomm::{exchange, RuntimeConfig, ThreadRuntime, XPacket};
///
/// let runtime = ThreadRuntime::new(RuntimeConfig::default());
/// let received = runtime
///     .run(3, |ctx| {
///         let me = ctx.rank();
///         let next = (me + 1) % ctx.size();
///         let send = vec![XPacket::new(next).with_ints(vec![me as i64; me as usize + 1])];
///         let mut recv = Vec::new();
///         exchange(&ctx, &mut recv, &send).unwrap();
///         recv
///     })
///     .unwrap();
/// assert_eq!(received[0], vec![XPacket::new(2).with_ints(vec![2i64; 3])]);
/// ```
pub fn exchange(ctx: &Context, recv: &mut Vec<XPacket>, send: &[XPacket]) -> Result<()> {
    let span = debug_span!("exchange", rank = ctx.rank(), outgoing = send.len());
    let _enter = span.enter();

    let expected = recv_packet_count(ctx, send)?;
    let (size_tag, data_tag) = exchange_tags(ctx);
    debug!(expected, size_tag, "packet count agreed");

    let outgoing: Vec<[u64; 3]> = send.iter().map(XPacket::sizes).collect();
    let mut incoming = vec![[0u64; 3]; expected];
    let statuses = {
        let mut list = ctx.new_request_list();
        for triple in incoming.iter_mut() {
            let buf = Buffer::Recv(RecvBuffer::new(&mut triple[..]));
            list.push(ctx.request_unchecked(buf, ANY_SOURCE, size_tag)?);
        }
        list.start_all()?;
        for (packet, triple) in send.iter().zip(&outgoing) {
            ctx.send_unchecked(SendBuffer::new(&triple[..]), packet.rank, size_tag)?;
        }
        list.wait_all()?.to_vec()
    };

    recv.clear();
    recv.reserve(expected);
    for (slot, (status, triple)) in statuses.iter().zip(&incoming).enumerate() {
        let status = match status {
            Some(status) if status.count == 3 && status.tag == size_tag => *status,
            other => panic!(
                "exchange: size slot {slot} of {expected} at rank {} completed inconsistently ({other:?})",
                ctx.rank()
            ),
        };
        let mut packet = XPacket::new(status.source);
        packet.resize(*triple);
        recv.push(packet);
    }
    debug!(received = recv.len(), "size phase complete");

    {
        let mut list = ctx.new_request_list();
        for packet in recv.iter_mut() {
            let source = packet.rank;
            if !packet.bytes.is_empty() {
                list.push(ctx.request_unchecked(Buffer::from(&mut packet.bytes[..]), source, data_tag)?);
            }
            if !packet.ints.is_empty() {
                list.push(ctx.request_unchecked(Buffer::from(&mut packet.ints[..]), source, data_tag)?);
            }
            if !packet.floats.is_empty() {
                list.push(ctx.request_unchecked(Buffer::from(&mut packet.floats[..]), source, data_tag)?);
            }
        }
        list.start_all()?;
        for packet in send.iter().filter(|p| p.has_data()) {
            if !packet.bytes.is_empty() {
                ctx.send_unchecked(SendBuffer::new(&packet.bytes[..]), packet.rank, data_tag)?;
            }
            if !packet.ints.is_empty() {
                ctx.send_unchecked(SendBuffer::new(&packet.ints[..]), packet.rank, data_tag)?;
            }
            if !packet.floats.is_empty() {
                ctx.send_unchecked(SendBuffer::new(&packet.floats[..]), packet.rank, data_tag)?;
            }
        }
        list.wait_all()?;
    }
    debug!("data phase complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RuntimeConfig, ThreadRuntime};

    #[test]
    fn exchange_tags_sit_at_the_reserved_base() {
        let rt = ThreadRuntime::new(RuntimeConfig::default());
        let tags = rt.run(1, |ctx| exchange_tags(&ctx)).unwrap();
        assert_eq!(tags, vec![(crate::RESERVED_TAG_BASE, crate::RESERVED_TAG_BASE + 1)]);
    }

    #[test]
    fn has_data_looks_at_every_payload() {
        assert!(!XPacket::new(0).has_data());
        assert!(XPacket::new(0).with_bytes(vec![1]).has_data());
        assert!(XPacket::new(0).with_ints(vec![1]).has_data());
        assert!(XPacket::new(0).with_floats(vec![1.0]).has_data());
    }

    #[test]
    fn empty_exchange_is_a_plain_reduction() {
        let rt = ThreadRuntime::new(RuntimeConfig::default());
        let lens = rt
            .run(3, |ctx| {
                let mut recv = vec![XPacket::new(9)];
                exchange(&ctx, &mut recv, &[]).unwrap();
                recv.len()
            })
            .unwrap();
        assert_eq!(lens, vec![0, 0, 0]);
    }

    #[test]
    fn packets_without_data_still_arrive() {
        let rt = ThreadRuntime::new(RuntimeConfig::default());
        let got = rt
            .run(2, |ctx| {
                let send = vec![XPacket::new(1 - ctx.rank()), XPacket::new(ctx.rank())];
                let mut recv = Vec::new();
                exchange(&ctx, &mut recv, &send).unwrap();
                let mut sources: Vec<i32> = recv.iter().map(|p| p.rank).collect();
                sources.sort_unstable();
                sources
            })
            .unwrap();
        assert_eq!(got, vec![vec![0, 1], vec![0, 1]]);
    }

    #[test]
    fn several_packets_to_one_rank_keep_their_order() {
        let rt = ThreadRuntime::new(RuntimeConfig::default());
        let got = rt
            .run(2, |ctx| {
                let send: Vec<XPacket> = if ctx.rank() == 0 {
                    (0..4)
                        .map(|i| {
                            XPacket::new(1)
                                .with_bytes(vec![i as u8; i])
                                .with_floats(vec![i as f64; 4 - i])
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                let mut recv = Vec::new();
                exchange(&ctx, &mut recv, &send).unwrap();
                recv
            })
            .unwrap();
        assert!(got[0].is_empty());
        assert_eq!(got[1].len(), 4);
        for (i, packet) in got[1].iter().enumerate() {
            assert_eq!(packet.rank, 0);
            assert_eq!(packet.bytes, vec![i as u8; i]);
            assert_eq!(packet.floats, vec![i as f64; 4 - i]);
            assert!(packet.ints.is_empty());
        }
    }
}
