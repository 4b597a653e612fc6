//! Non-owning typed views over caller memory.
//!
//! A buffer is `{address, length, element kind}` and nothing more: it borrows
//! the caller's slice for `'a`, so the borrow checker keeps the memory alive
//! for as long as any [`Request`](crate::Request) holds the view.

use crate::datatype::{Datatype, DatatypeTag};
use crate::error::{Error, Result};
use std::marker::PhantomData;

/// Read-only view used as the source of a send or a reduction.
#[derive(Clone, Copy)]
pub struct SendBuffer<'a> {
    ptr: *const u8,
    len: usize,
    kind: DatatypeTag,
    _marker: PhantomData<&'a [u8]>,
}

/// Writable view used as the destination of a receive or a reduction.
pub struct RecvBuffer<'a> {
    ptr: *mut u8,
    len: usize,
    kind: DatatypeTag,
    _marker: PhantomData<&'a mut [u8]>,
}

/// A buffer together with its direction, as handed to
/// [`RequestList::add_request`](crate::RequestList::add_request).
pub enum Buffer<'a> {
    /// Outgoing data
    Send(SendBuffer<'a>),
    /// Incoming data
    Recv(RecvBuffer<'a>),
}

// SAFETY: the views are plain borrows of `[T]` where `T: Datatype` is
// `Send + Copy`; the raw pointers only erase the element type.
unsafe impl Send for SendBuffer<'_> {}
unsafe impl Sync for SendBuffer<'_> {}
unsafe impl Send for RecvBuffer<'_> {}

impl<'a> SendBuffer<'a> {
    /// View a slice as a send buffer.
    pub fn new<T: Datatype>(data: &'a [T]) -> Self {
        SendBuffer {
            ptr: data.as_ptr().cast::<u8>(),
            len: data.len(),
            kind: T::TAG,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element kind.
    pub fn kind(&self) -> DatatypeTag {
        self.kind
    }

    /// Length in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * self.kind.size_of()
    }

    /// Raw start address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// The viewed memory as bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        // SAFETY: `ptr` came from a live `&'a [T]` of `len` elements.
        unsafe { std::slice::from_raw_parts(self.ptr, self.byte_len()) }
    }
}

impl<'a> RecvBuffer<'a> {
    /// View a mutable slice as a receive buffer.
    pub fn new<T: Datatype>(data: &'a mut [T]) -> Self {
        RecvBuffer {
            ptr: data.as_mut_ptr().cast::<u8>(),
            len: data.len(),
            kind: T::TAG,
            _marker: PhantomData,
        }
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element kind.
    pub fn kind(&self) -> DatatypeTag {
        self.kind
    }

    /// Capacity in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * self.kind.size_of()
    }

    /// Raw start address.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Read-only view of the same memory, borrowed from this one.
    pub fn as_send(&self) -> SendBuffer<'_> {
        SendBuffer {
            ptr: self.ptr,
            len: self.len,
            kind: self.kind,
            _marker: PhantomData,
        }
    }

    /// The viewed memory as bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` came from a live `&'a mut [T]` of `len` elements and
        // `self` is the only path to it while borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.byte_len()) }
    }
}

impl<'a, T: Datatype> From<&'a [T]> for SendBuffer<'a> {
    fn from(data: &'a [T]) -> Self {
        SendBuffer::new(data)
    }
}

impl<'a, T: Datatype> From<&'a mut [T]> for RecvBuffer<'a> {
    fn from(data: &'a mut [T]) -> Self {
        RecvBuffer::new(data)
    }
}

impl<'a> From<SendBuffer<'a>> for Buffer<'a> {
    fn from(buf: SendBuffer<'a>) -> Self {
        Buffer::Send(buf)
    }
}

impl<'a> From<RecvBuffer<'a>> for Buffer<'a> {
    fn from(buf: RecvBuffer<'a>) -> Self {
        Buffer::Recv(buf)
    }
}

impl<'a, T: Datatype> From<&'a [T]> for Buffer<'a> {
    fn from(data: &'a [T]) -> Self {
        Buffer::Send(SendBuffer::new(data))
    }
}

impl<'a, T: Datatype> From<&'a mut [T]> for Buffer<'a> {
    fn from(data: &'a mut [T]) -> Self {
        Buffer::Recv(RecvBuffer::new(data))
    }
}

impl Buffer<'_> {
    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        match self {
            Buffer::Send(b) => b.len(),
            Buffer::Recv(b) => b.len(),
        }
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element kind of the view.
    pub fn kind(&self) -> DatatypeTag {
        match self {
            Buffer::Send(b) => b.kind(),
            Buffer::Recv(b) => b.kind(),
        }
    }

    /// Whether this is a send view.
    pub fn is_send(&self) -> bool {
        matches!(self, Buffer::Send(_))
    }
}

/// Local half of the allreduce contract: both views agree on length and kind.
pub(crate) fn check_reduce_buffers(recv: &RecvBuffer<'_>, send: &SendBuffer<'_>) -> Result<()> {
    if recv.len() != send.len() {
        return Err(Error::InvalidBuffer {
            op: "allreduce",
            reason: format!("send holds {} items, receive holds {}", send.len(), recv.len()),
        });
    }
    if recv.kind() != send.kind() {
        return Err(Error::InvalidBuffer {
            op: "allreduce",
            reason: format!("send is {:?}, receive is {:?}", send.kind(), recv.kind()),
        });
    }
    Ok(())
}

impl std::fmt::Debug for SendBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendBuffer")
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}

impl std::fmt::Debug for RecvBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvBuffer")
            .field("len", &self.len)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_view_reports_kind_and_bytes() {
        let data = [1.5f64, -2.0];
        let buf = SendBuffer::new(&data[..]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.kind(), DatatypeTag::F64);
        assert_eq!(buf.byte_len(), 16);
        assert_eq!(&buf.as_bytes()[..8], &1.5f64.to_ne_bytes());
    }

    #[test]
    fn recv_view_writes_through() {
        let mut data = [0u32; 3];
        {
            let mut buf = RecvBuffer::new(&mut data[..]);
            assert_eq!(buf.byte_len(), 12);
            buf.as_bytes_mut()[4..8].copy_from_slice(&7u32.to_ne_bytes());
        }
        assert_eq!(data, [0, 7, 0]);
    }

    #[test]
    fn buffer_direction_from_slices() {
        let send = [1u8, 2, 3];
        let mut recv = [0i64; 4];
        let a: Buffer<'_> = (&send[..]).into();
        let b: Buffer<'_> = (&mut recv[..]).into();
        assert!(a.is_send());
        assert!(!b.is_send());
        assert_eq!(a.len(), 3);
        assert_eq!(b.kind(), DatatypeTag::I64);
    }
}
