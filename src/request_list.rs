//! Ordered batches of requests started and resolved together.
//!
//! # Example
//!
//! ```no_run
//! # fn demo(ctx: &mpcomm::Context) -> mpcomm::Result<()> {
//! let right = (ctx.rank() + 1) % ctx.size();
//! let left = (ctx.rank() + ctx.size() - 1) % ctx.size();
//! let outgoing = [ctx.rank(); 4];
//! let mut incoming = [0i32; 4];
//!
//! let mut list = ctx.new_request_list();
//! list.add_recv(&mut incoming, left, 0)?;
//! list.add_send(&outgoing, right, 0)?;
//! list.start_all()?;
//! let statuses = list.wait_all()?;
//! assert_eq!(statuses[0].map(|s| s.source), Some(left));
//! assert!(statuses[1].is_none());
//! # Ok(())
//! # }
//! ```

use crate::buffer::Buffer;
use crate::datatype::Datatype;
use crate::error::Result;
use crate::request::{Request, RequestState};
use crate::status::Status;
use crate::Context;

/// Requests in insertion order, with statuses indexed the same way.
#[derive(Debug)]
pub struct RequestList<'a> {
    ctx: &'a Context,
    requests: Vec<Request<'a>>,
    statuses: Vec<Option<Status>>,
}

impl<'a> RequestList<'a> {
    pub(crate) fn new(ctx: &'a Context) -> Self {
        RequestList {
            ctx,
            requests: Vec::new(),
            statuses: Vec::new(),
        }
    }

    /// Append a request built by [`Context::request`]. Returns its position.
    pub fn add_request(&mut self, buf: impl Into<Buffer<'a>>, rank: i32, tag: i32) -> Result<usize> {
        let request = self.ctx.request(buf, rank, tag)?;
        Ok(self.push(request))
    }

    /// Append an already-built request, for tags the caller validated itself.
    pub(crate) fn push(&mut self, request: Request<'a>) -> usize {
        self.requests.push(request);
        self.statuses.push(None);
        self.requests.len() - 1
    }

    /// Append a send of `data` to `dest`.
    pub fn add_send<T: Datatype>(&mut self, data: &'a [T], dest: i32, tag: i32) -> Result<usize> {
        self.add_request(data, dest, tag)
    }

    /// Append a receive into `data` from `source` (or [`ANY_SOURCE`](crate::ANY_SOURCE)).
    pub fn add_recv<T: Datatype>(&mut self, data: &'a mut [T], source: i32, tag: i32) -> Result<usize> {
        self.add_request(data, source, tag)
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the list holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The request at `index`.
    pub fn get(&self, index: usize) -> Option<&Request<'a>> {
        self.requests.get(index)
    }

    /// Mutable access to the request at `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Request<'a>> {
        self.requests.get_mut(index)
    }

    /// Start every request that has not been started yet.
    ///
    /// Stops at the first failure; requests after it stay
    /// [`Created`](RequestState::Created).
    pub fn start_all(&mut self) -> Result<()> {
        for request in &mut self.requests {
            if request.state() == RequestState::Created {
                request.start()?;
            }
        }
        Ok(())
    }

    /// Wait for every started request.
    ///
    /// Every member is resolved even when one of them fails; the first error
    /// in insertion order is returned after that. On success the statuses are
    /// positional: entry `i` belongs to the `i`-th request added, and is
    /// `None` for sends, cancelled requests and requests never started.
    pub fn wait_all(&mut self) -> Result<&[Option<Status>]> {
        let mut first_error = None;
        for (request, status) in self.requests.iter_mut().zip(&mut self.statuses) {
            if request.state() == RequestState::Created {
                continue;
            }
            match request.wait() {
                Ok(st) => *status = st,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(&self.statuses),
        }
    }

    /// Test every started request without blocking. True once all of them
    /// are terminal.
    pub fn test_all(&mut self) -> Result<bool> {
        let mut all_done = true;
        for (request, status) in self.requests.iter_mut().zip(&mut self.statuses) {
            if request.state() == RequestState::Created {
                continue;
            }
            if request.test()? {
                *status = request.status();
            } else {
                all_done = false;
            }
        }
        Ok(all_done)
    }

    /// Statuses recorded so far, by insertion position.
    pub fn statuses(&self) -> &[Option<Status>] {
        &self.statuses
    }

    /// Drop every request, cancelling or waiting on those still pending.
    pub fn clear(&mut self) {
        self.requests.clear();
        self.statuses.clear();
    }
}
