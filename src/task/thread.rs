//! A schedulable unit of execution. Grounded in the original kernel's
//! `proc/thread.h` / `proc/thread.c`.

use alloc::collections::VecDeque;
use alloc::sync::Weak;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::prelude::*;
use crate::task::process::Process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Terminated,
}

/// Saved machine state for a not-currently-running thread. Populating
/// and switching this register-level state is architecture-specific
/// CPU bring-up glue this core doesn't provide (SPEC_FULL.md §1); this
/// struct only carries what the out-of-scope glue needs to start a
/// brand-new thread (its entry point and initial stack).
pub struct ArchContext {
    pub entry: usize,
    pub stack_top: usize,
}

static NEXT_TID: AtomicUsize = AtomicUsize::new(1);

pub struct Thread {
    pub tid: usize,
    owner: Weak<Process>,
    pub context: Spin<ArchContext>,
    priority: AtomicUsize,
    state: Spin<ThreadState>,
    last_ran: AtomicU64,
    sleep_until: AtomicU64,
    assigned_cpu: AtomicUsize,
}

pub const MLFQ_LEVELS: usize = 16;

impl Thread {
    /// Builds a brand-new thread owned by `owner`, state `New`, priority
    /// 0, not yet scheduled.
    pub fn new(owner: &Arc<Process>, entry: usize, stack_top: usize) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            owner: Arc::downgrade(owner),
            context: Spin::new(ArchContext { entry, stack_top }),
            priority: AtomicUsize::new(0),
            state: Spin::new(ThreadState::New),
            last_ran: AtomicU64::new(0),
            sleep_until: AtomicU64::new(0),
            assigned_cpu: AtomicUsize::new(0),
        })
    }

    /// The owning process, if it has not already been torn down.
    /// Non-owning per design note "Back-references without cycles".
    pub fn owner(&self) -> Option<Arc<Process>> {
        self.owner.upgrade()
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ThreadState) {
        *self.state.lock() = state;
    }

    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn reset_priority(&self) {
        self.priority.store(0, Ordering::Relaxed);
    }

    /// Increments priority, clamped to the lowest (most-starved-favoring)
    /// level `MLFQ_LEVELS - 1`.
    pub fn bump_priority(&self) {
        let _ = self
            .priority
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(core::cmp::min(p + 1, MLFQ_LEVELS - 1))
            });
    }

    pub fn last_ran(&self) -> u64 {
        self.last_ran.load(Ordering::Relaxed)
    }

    pub fn set_last_ran(&self, ns: u64) {
        self.last_ran.store(ns, Ordering::Relaxed);
    }

    pub fn sleep_until(&self) -> u64 {
        self.sleep_until.load(Ordering::Relaxed)
    }

    pub fn set_sleep_until(&self, ns: u64) {
        self.sleep_until.store(ns, Ordering::Relaxed);
    }

    pub fn assigned_cpu(&self) -> usize {
        self.assigned_cpu.load(Ordering::Relaxed)
    }

    pub fn set_assigned_cpu(&self, id: usize) {
        self.assigned_cpu.store(id, Ordering::Relaxed);
    }
}

/// One MLFQ level's FIFO queue, in the same shape as the upstream
/// ready-queue abstraction (`VecDeque<Arc<_>>`, push/pop at the ends).
pub(crate) type Level = VecDeque<Arc<Thread>>;
