//! Message status information.
//!
//! This module provides the [`Status`] struct produced by a completing
//! receive, containing metadata about the message that was delivered.

/// Information about a received message.
///
/// Produced exactly once, by the receive that consumed the message: returned
/// from [`Context::recv`](crate::Context::recv), and recorded on a receive
/// [`Request`](crate::Request) when it completes.
///
/// # Example
///
/// ```no_run
/// # fn demo(ctx: &mpcomm::Context) -> mpcomm::Result<()> {
/// let mut data = [0.0f64; 8];
/// let status = ctx.recv(&mut data, mpcomm::ANY_SOURCE, mpcomm::ANY_TAG)?;
/// println!("Message from rank {} with tag {}, {} elements",
///          status.source, status.tag, status.count);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements actually transferred.
    pub count: i64,
}
