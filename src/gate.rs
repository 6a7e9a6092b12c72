//! Ring ownership and interrupt gating.
//!
//! An unowned RX ring runs in [`ServicingMode::Polled`]: its interrupt is
//! enabled and each interrupt drains frames into the conventional path. An
//! owned ring runs in [`ServicingMode::EventDriven`]: its interrupt stays
//! masked while the owner polls, and is only armed while the owner sleeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::errors::{Error, Result};
use crate::hw::desc::Descriptor;
use crate::ring::{Ring, RingState, RxRing, ServicingMode, TxRing};

/// Identity of a context, unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    Woken,
    TimedOut,
    Cancelled,
}

/// Condition a context sleeps on.
///
/// Waiters take a ticket before probing their rings and sleep until the
/// sequence moves past it, so a wakeup between the probe and the sleep is
/// never lost.
#[derive(Default)]
pub struct WaitQueue {
    seq: Mutex<u64>,
    cond: Condvar,
    cancelled: AtomicBool,
}

impl WaitQueue {
    pub fn ticket(&self) -> u64 {
        *self.seq.lock()
    }

    pub fn wake(&self) {
        let mut seq = self.seq.lock();
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Delivers a cancellation to the current or next sleeper.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake();
    }

    /// Sleeps until woken past `ticket`, `deadline` passes or a cancellation
    /// arrives. A reported cancellation is consumed.
    pub fn wait(&self, ticket: u64, deadline: Option<Instant>) -> Wake {
        let mut seq = self.seq.lock();
        loop {
            if self.cancelled.swap(false, Ordering::AcqRel) {
                return Wake::Cancelled;
            }
            if *seq != ticket {
                return Wake::Woken;
            }
            match deadline {
                None => self.cond.wait(&mut seq),
                Some(deadline) => {
                    if self.cond.wait_until(&mut seq, deadline).timed_out() {
                        if self.cancelled.swap(false, Ordering::AcqRel) {
                            return Wake::Cancelled;
                        }
                        return if *seq != ticket {
                            Wake::Woken
                        } else {
                            Wake::TimedOut
                        };
                    }
                }
            }
        }
    }
}

/// Back-reference from a ring to the context that owns it.
#[derive(Clone)]
pub struct Owner {
    pub(crate) id: ContextId,
    pub(crate) waiter: Arc<WaitQueue>,
}

impl Owner {
    pub fn new(id: ContextId, waiter: Arc<WaitQueue>) -> Self {
        Self { id, waiter }
    }
}

impl<D: Descriptor> Ring<D> {
    pub fn owner_id(&self) -> Option<ContextId> {
        self.lock().owner.as_ref().map(|o| o.id)
    }

    /// Unmasks the interrupt for a sleeper and registers `waiter` to be woken
    /// by it.
    pub(crate) fn arm(&self, waiter: &Arc<WaitQueue>) {
        {
            let mut st = self.lock();
            if !st.watchers.iter().any(|w| Arc::ptr_eq(w, waiter)) {
                st.watchers.push(waiter.clone());
            }
        }
        self.nic.irq_enable(self.queue_id());
    }

    /// Undoes [`Ring::arm`]. Once the last sleeper is gone an owned ring goes
    /// back to a masked interrupt; an unowned one keeps it for the
    /// conventional path.
    pub(crate) fn disarm(&self, waiter: &Arc<WaitQueue>) {
        let mut st = self.lock();
        st.watchers.retain(|w| !Arc::ptr_eq(w, waiter));
        if st.mode == ServicingMode::EventDriven && st.watchers.is_empty() {
            self.nic.irq_disable(self.queue_id());
        }
    }

    fn wake_watchers(st: &RingState) {
        for w in &st.watchers {
            w.wake();
        }
    }
}

impl RxRing {
    /// Grants exclusive ownership to `owner` and masks the ring interrupt.
    pub fn attach(&self, owner: Owner) -> Result<()> {
        let mut st = self.lock();
        if st.owner.is_some() {
            return Err(Error::Busy {
                device: self.device(),
                queue: self.index(),
            });
        }
        st.owner = Some(owner);
        st.mode = ServicingMode::EventDriven;
        self.nic.irq_disable(self.queue_id());
        tracing::debug!(device = self.device(), queue = self.index(), "rx ring attached");
        Ok(())
    }

    /// Revokes ownership held by `id` and hands the ring back to the
    /// conventional path.
    pub fn detach(&self, id: ContextId) -> Result<()> {
        let mut st = self.lock();
        match &st.owner {
            Some(owner) if owner.id == id => {}
            _ => {
                return Err(Error::NotOwner {
                    device: self.device(),
                    queue: self.index(),
                });
            }
        }
        st.owner = None;
        st.mode = ServicingMode::Polled;
        self.nic.irq_enable(self.queue_id());
        tracing::debug!(device = self.device(), queue = self.index(), "rx ring detached");
        Ok(())
    }

    /// Interrupt handler. The NIC masked the interrupt before calling in.
    pub(crate) fn handle_interrupt(&self) {
        let mut st = self.lock();
        Self::wake_watchers(&st);
        if let Some(owner) = &st.owner {
            owner.waiter.wake();
            return;
        }
        // Drain, unmask, and drain again if frames landed while masked.
        loop {
            let budget = self.config.kernel_budget;
            if self.service_kernel(&mut st, budget) == budget {
                continue;
            }
            self.nic.irq_enable(self.queue_id());
            if !self.peek_done_locked(&st) {
                break;
            }
            self.nic.irq_disable(self.queue_id());
        }
    }
}

impl TxRing {
    pub(crate) fn handle_interrupt(&self) {
        let mut st = self.lock();
        self.reclaim_locked(&mut st);
        Self::wake_watchers(&st);
        drop(st);
        self.nic.irq_enable(self.queue_id());
    }
}
