//! Thread-emulated backend: ranks are OS threads sharing one address space.
//!
//! A [`ThreadRuntime`] owns the registry of rank threads. It is an ordinary
//! value with an explicit lifecycle: create it, spawn rank groups from it,
//! reap or join their threads, and shut it down (dropping the last `Arc` does
//! the same). Nothing here is a process-wide singleton, so independent runtimes
//! can coexist, for instance one per test.
//!
//! # Example
//!
//! ```
//! use mpcomm::{RuntimeConfig, ThreadRuntime};
//!
//! let runtime = ThreadRuntime::new(RuntimeConfig::default());
//! let sums = runtime
//!     .run(4, |ctx| ctx.allsum(ctx.rank()).unwrap())
//!     .unwrap();
//! assert_eq!(sums, vec![6, 6, 6, 6]);
//! ```

mod context;
pub(crate) mod mailbox;
pub(crate) mod rendezvous;

pub use context::ThreadContext;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::Context;
use mailbox::Mailbox;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

/// Identity of one group of ranks spawned together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Holds rank threads back until every rank is registered, or tells them to
/// bail out if spawning the group failed part way.
struct StartGate {
    state: Mutex<Option<bool>>,
    cond: Condvar,
}

impl StartGate {
    fn new() -> Self {
        StartGate {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn open(&self, proceed: bool) {
        *self.state.lock() = Some(proceed);
        self.cond.notify_all();
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if let Some(proceed) = *state {
                return proceed;
            }
            self.cond.wait(&mut state);
        }
    }
}

/// Shared state of one rank group: a mailbox per rank.
pub(crate) struct Group {
    id: GroupId,
    mailboxes: Box<[Mailbox]>,
    gate: StartGate,
}

impl Group {
    fn new(id: GroupId, size: usize) -> Self {
        Group {
            id,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            gate: StartGate::new(),
        }
    }

    pub(crate) fn id(&self) -> GroupId {
        self.id
    }

    pub(crate) fn size(&self) -> i32 {
        self.mailboxes.len() as i32
    }

    /// Callers validate `rank` against [`size`](Self::size) first.
    pub(crate) fn mailbox(&self, rank: i32) -> &Mailbox {
        &self.mailboxes[rank as usize]
    }
}

/// One registered rank thread. An entry whose `finished` flag is set but whose
/// handle has not been joined is a zombie.
struct Entry {
    group: GroupId,
    rank: i32,
    thread: ThreadId,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Entry {
    fn is_zombie(&self) -> bool {
        self.handle.is_some() && self.finished.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
}

/// Sets the finished flag when a rank thread unwinds out of its body.
struct ExitGuard(Arc<AtomicBool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

type Slot<R> = Mutex<Option<thread::Result<R>>>;

/// Join `handles`, skipping the calling thread's own handle: a rank thread
/// may run the last drop of its runtime. Skipped handles are detached.
fn join_all(handles: Vec<JoinHandle<()>>) {
    let me = thread::current().id();
    for handle in handles {
        if handle.thread().id() == me {
            debug!("detaching the calling rank thread instead of joining it");
            continue;
        }
        let _ = handle.join();
    }
}

/// Owner of the rank-thread registry for the thread backend.
pub struct ThreadRuntime {
    config: RuntimeConfig,
    registry: spin::Mutex<Registry>,
    next_group: AtomicU64,
}

impl ThreadRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        debug!(spin_count = config.spin_count, "thread runtime created");
        Arc::new(ThreadRuntime {
            config,
            registry: spin::Mutex::new(Registry::default()),
            next_group: AtomicU64::new(0),
        })
    }

    /// Create a runtime configured from `MPCOMM_*` environment variables.
    pub fn from_env() -> Arc<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// The configuration this runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn `size` rank threads, each running `body` with its own
    /// [`Context`]. No rank starts running `body` before all are registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRank`] for an empty group and [`Error::Spawn`]
    /// if the OS refuses a thread; ranks already spawned are released without
    /// running `body` and joined before returning.
    pub fn spawn<F, R>(self: &Arc<Self>, size: usize, body: F) -> Result<RankGroup<R>>
    where
        F: Fn(Context) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        if size == 0 || size > i32::MAX as usize {
            return Err(Error::InvalidRank {
                rank: 0,
                size: size.min(i32::MAX as usize) as i32,
                op: "spawn",
            });
        }

        let id = GroupId(self.next_group.fetch_add(1, Ordering::Relaxed));
        let group = Arc::new(Group::new(id, size));
        let body = Arc::new(body);
        let slots: Arc<Vec<Slot<R>>> = Arc::new((0..size).map(|_| Mutex::new(None)).collect());
        debug!(group = %id, size, "spawning rank group");

        for rank in 0..size as i32 {
            let finished = Arc::new(AtomicBool::new(false));
            let mut builder =
                thread::Builder::new().name(format!("{}-{}-{}", self.config.thread_name_prefix, id, rank));
            if let Some(stack_size) = self.config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let thread_group = Arc::clone(&group);
            let thread_body = Arc::clone(&body);
            let thread_slots = Arc::clone(&slots);
            let exit = ExitGuard(Arc::clone(&finished));
            let spin_count = self.config.spin_count;

            let spawned = builder.spawn(move || {
                let _exit = exit;
                if !thread_group.gate.wait() {
                    return;
                }
                let ctx = Context::Thread(ThreadContext::new(thread_group, rank, spin_count));
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| (*thread_body)(ctx)));
                if let Err(payload) = &outcome {
                    warn!(group = %id, rank, message = %panic_message(payload.as_ref()), "rank panicked");
                }
                *thread_slots[rank as usize].lock() = Some(outcome);
            });

            match spawned {
                Ok(handle) => {
                    let thread = handle.thread().id();
                    self.registry.lock().entries.push(Entry {
                        group: id,
                        rank,
                        thread,
                        finished,
                        handle: Some(handle),
                    });
                }
                Err(source) => {
                    group.gate.open(false);
                    self.join_group(id);
                    return Err(Error::Spawn { rank, source });
                }
            }
        }

        group.gate.open(true);
        Ok(RankGroup {
            runtime: Arc::clone(self),
            id,
            size,
            slots,
        })
    }

    /// Spawn a group and wait for all of its ranks; results are in rank order.
    pub fn run<F, R>(self: &Arc<Self>, size: usize, body: F) -> Result<Vec<R>>
    where
        F: Fn(Context) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        self.spawn(size, body)?.join()
    }

    /// Thread currently registered as `rank` of `group`.
    pub fn thread_of(&self, group: GroupId, rank: i32) -> Option<ThreadId> {
        self.registry
            .lock()
            .entries
            .iter()
            .find(|e| e.group == group && e.rank == rank)
            .map(|e| e.thread)
    }

    /// Group and rank of the calling thread, if it is a rank of this runtime.
    pub fn current_rank(&self) -> Option<(GroupId, i32)> {
        let me = thread::current().id();
        self.registry
            .lock()
            .entries
            .iter()
            .find(|e| e.thread == me)
            .map(|e| (e.group, e.rank))
    }

    /// Registered rank threads that have not finished.
    pub fn live_count(&self) -> usize {
        self.registry
            .lock()
            .entries
            .iter()
            .filter(|e| !e.finished.load(Ordering::Acquire))
            .count()
    }

    /// Rank threads that finished but have not been joined.
    pub fn zombie_count(&self) -> usize {
        self.registry.lock().entries.iter().filter(|e| e.is_zombie()).count()
    }

    /// Join every finished rank thread and drop its registration. Returns the
    /// number of threads reaped. Never blocks on a running rank.
    pub fn reap_zombies(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock();
            let mut handles = Vec::new();
            registry.entries.retain_mut(|e| {
                if e.is_zombie() {
                    handles.extend(e.handle.take());
                    false
                } else {
                    true
                }
            });
            handles
        };
        let reaped = handles.len();
        join_all(handles);
        if reaped > 0 {
            debug!(reaped, "reaped zombie rank threads");
        }
        reaped
    }

    /// Join every thread of `group`, blocking until they finish.
    fn join_group(&self, group: GroupId) {
        let handles: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock();
            registry
                .entries
                .iter_mut()
                .filter(|e| e.group == group)
                .filter_map(|e| e.handle.take())
                .collect()
        };
        join_all(handles);
        self.registry.lock().entries.retain(|e| e.group != group);
    }

    /// Join every registered rank thread. Blocks until all ranks have returned.
    ///
    /// Called from a rank thread, that thread's own registration is detached
    /// rather than joined.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock();
            registry.entries.drain(..).filter_map(|mut e| e.handle.take()).collect()
        };
        if !handles.is_empty() {
            debug!(threads = handles.len(), "thread runtime shutting down");
        }
        join_all(handles);
    }
}

impl Drop for ThreadRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRuntime")
            .field("config", &self.config)
            .field("registered", &self.registry.lock().entries.len())
            .finish()
    }
}

/// Handle to a running group of rank threads.
///
/// Dropping it without [`join`](Self::join) detaches the ranks: they keep
/// running and become zombies once done, to be collected by
/// [`ThreadRuntime::reap_zombies`] or at shutdown.
pub struct RankGroup<R> {
    runtime: Arc<ThreadRuntime>,
    id: GroupId,
    size: usize,
    slots: Arc<Vec<Slot<R>>>,
}

impl<R> RankGroup<R> {
    /// Identity of this group.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether every rank has produced its result.
    pub fn is_finished(&self) -> bool {
        self.slots.iter().all(|slot| slot.lock().is_some())
    }

    /// Wait for every rank and collect the results in rank order.
    ///
    /// # Errors
    ///
    /// [`Error::RankPanicked`] for the lowest rank whose body panicked.
    pub fn join(self) -> Result<Vec<R>> {
        self.runtime.join_group(self.id);
        debug!(group = %self.id, "rank group joined");
        let mut results = Vec::with_capacity(self.size);
        let mut first_panic = None;
        for (rank, slot) in self.slots.iter().enumerate() {
            match slot.lock().take() {
                Some(Ok(value)) => results.push(value),
                Some(Err(payload)) => {
                    first_panic.get_or_insert(Error::RankPanicked {
                        rank: rank as i32,
                        message: panic_message(payload.as_ref()),
                    });
                }
                None => {
                    first_panic.get_or_insert(Error::Internal(format!("rank {rank} produced no result")));
                }
            }
        }
        match first_panic {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
