//! Spin-then-block handoff between one sending and one receiving thread.
//!
//! A [`Rendezvous`] is created by whichever side of a send/recv pair arrives
//! first and is parked in the receiver's mailbox. The second side claims it
//! ([`Rendezvous::try_match`]), copies the payload directly between the two
//! caller buffers, and publishes the outcome ([`Rendezvous::complete`]).
//!
//! ```text
//!            try_match             complete
//!  Posted ─────────────▶ Matched ────────────▶ Completed
//!    │
//!    │ cancel
//!    ▼
//!  Cancelled
//! ```
//!
//! The waiting side spins on `phase` for up to `spin_count` iterations and
//! then parks on the monitor (the "timed out to block" transition, recorded in
//! `parked`). The completing side always publishes the terminal phase while
//! holding the monitor lock and always notifies, so a waiter that checked the
//! phase under the lock cannot miss the wake-up.

use crate::error::Error;
use crate::status::Status;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lifecycle of one handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// First side arrived and is waiting for a partner.
    Posted = 0,
    /// Partner claimed the pair; the copy is in flight and can no longer be cancelled.
    Matched = 1,
    /// Copy finished; the outcome is published.
    Completed = 2,
    /// First side withdrew before any partner claimed it.
    Cancelled = 3,
}

impl Phase {
    fn from_u8(raw: u8) -> Phase {
        match raw {
            0 => Phase::Posted,
            1 => Phase::Matched,
            2 => Phase::Completed,
            _ => Phase::Cancelled,
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled)
    }
}

/// How a wait on the first side ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Completed,
    Cancelled,
}

/// Outcome handed from the completing side to the waiting side.
#[derive(Default)]
struct Handoff {
    status: Option<Status>,
    fault: Option<Error>,
}

pub(crate) struct Rendezvous {
    phase: AtomicU8,
    arrivals: AtomicU8,
    parked: AtomicBool,
    monitor: Mutex<Handoff>,
    cond: Condvar,
}

impl Rendezvous {
    /// A rendezvous as created by the first arriving side.
    pub(crate) fn first_arrival() -> Self {
        Rendezvous {
            phase: AtomicU8::new(Phase::Posted as u8),
            arrivals: AtomicU8::new(1),
            parked: AtomicBool::new(false),
            monitor: Mutex::new(Handoff::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Number of sides that have arrived (1 or 2).
    pub(crate) fn arrivals(&self) -> u8 {
        self.arrivals.load(Ordering::Acquire)
    }

    /// Whether the waiting side exhausted its spin budget and blocked.
    pub(crate) fn parked(&self) -> bool {
        self.parked.load(Ordering::Acquire)
    }

    /// Second side claims the pair. Fails if the first side already cancelled.
    pub(crate) fn try_match(&self) -> bool {
        let claimed = self
            .phase
            .compare_exchange(
                Phase::Posted as u8,
                Phase::Matched as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if claimed {
            let previous = self.arrivals.fetch_add(1, Ordering::AcqRel);
            debug_assert_eq!(previous, 1, "rendezvous matched twice");
        }
        claimed
    }

    /// First side withdraws. Succeeds only while nobody has matched.
    ///
    /// A waiter parked on this rendezvous (for instance the owning thread
    /// while another thread cancels through a handle) is woken up.
    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self
            .phase
            .compare_exchange(
                Phase::Posted as u8,
                Phase::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if cancelled {
            let _guard = self.monitor.lock();
            self.cond.notify_all();
        }
        cancelled
    }

    /// Second side publishes the outcome of the copy and wakes the first side.
    pub(crate) fn complete(&self, status: Option<Status>, fault: Option<Error>) {
        let mut handoff = self.monitor.lock();
        debug_assert_eq!(self.phase(), Phase::Matched, "completing an unmatched rendezvous");
        handoff.status = status;
        handoff.fault = fault;
        self.phase.store(Phase::Completed as u8, Ordering::Release);
        self.cond.notify_all();
    }

    /// Abortable wait: returns once the pair completes or is cancelled.
    pub(crate) fn wait(&self, spin_count: u32) -> WaitOutcome {
        self.wait_until(spin_count, Phase::is_terminal)
    }

    /// Committed wait: the pair is already matched, so only completion ends it.
    pub(crate) fn wait_no_cancel(&self, spin_count: u32) -> WaitOutcome {
        let outcome = self.wait_until(spin_count, |phase| phase == Phase::Completed);
        debug_assert_eq!(outcome, WaitOutcome::Completed);
        outcome
    }

    fn wait_until(&self, spin_count: u32, done: impl Fn(Phase) -> bool) -> WaitOutcome {
        for _ in 0..spin_count {
            let phase = self.phase();
            if done(phase) {
                return Self::outcome(phase);
            }
            std::hint::spin_loop();
        }

        let mut guard = self.monitor.lock();
        loop {
            let phase = self.phase();
            if done(phase) {
                return Self::outcome(phase);
            }
            if !self.parked.swap(true, Ordering::AcqRel) {
                tracing::trace!(spin_count, "rendezvous waiter parking");
            }
            self.cond.wait(&mut guard);
        }
    }

    fn outcome(phase: Phase) -> WaitOutcome {
        match phase {
            Phase::Cancelled => WaitOutcome::Cancelled,
            _ => WaitOutcome::Completed,
        }
    }

    /// Take the published outcome. Only meaningful after `Completed`.
    pub(crate) fn take_result(&self) -> (Option<Status>, Option<Error>) {
        let mut handoff = self.monitor.lock();
        (handoff.status.take(), handoff.fault.take())
    }
}
