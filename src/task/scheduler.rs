//! The multi-level feedback queue scheduler (SPEC_FULL.md §4.11).
//! Grounded in the original kernel's `proc/sched.h` / `proc/sched.c`;
//! the ready queues follow the `VecDeque`-backed shape of the upstream
//! `FifoReadyQueue`.
//!
//! Register-level context switching is out of this core's scope
//! (SPEC_FULL.md §1): [`preempt`] and [`yield_now`] transition state and
//! return the thread the caller should switch to, but never touch a
//! register file themselves. [`drop_thread`] is the hook the switch
//! glue calls once it has actually moved off the old thread's stack,
//! mirroring `sched_drop` being invoked from the original's assembly
//! trampoline.

use crate::prelude::*;
use crate::task::thread::{Level, ThreadState, MLFQ_LEVELS};
use crate::task::Thread;

struct SchedulerState {
    ready: [Level; MLFQ_LEVELS],
}

static STATE: Spin<Option<SchedulerState>> = Spin::new(None);

/// One processor: its id, its idle thread (run when nothing else is
/// ready), and whatever thread it is currently executing.
pub struct Cpu {
    pub id: usize,
    idle_thread: Spin<Option<Arc<Thread>>>,
    current_thread: Spin<Option<Arc<Thread>>>,
}

impl Cpu {
    pub fn current_thread(&self) -> Arc<Thread> {
        self.current_thread
            .lock()
            .clone()
            .expect("scheduler: cpu has no current thread")
    }

    fn set_current(&self, t: Arc<Thread>) {
        *self.current_thread.lock() = Some(t);
    }

    pub fn set_idle_thread(&self, t: Arc<Thread>) {
        *self.idle_thread.lock() = Some(t.clone());
        self.current_thread.lock().get_or_insert(t);
    }

    fn idle_thread(&self) -> Arc<Thread> {
        self.idle_thread
            .lock()
            .clone()
            .expect("scheduler: cpu has no idle thread")
    }
}

static CPUS: Spin<Vec<Arc<Cpu>>> = Spin::new(Vec::new());

/// Registers a fresh CPU descriptor with no idle thread yet set (SMP
/// bring-up installs one immediately after).
pub fn register_cpu(id: usize) -> Arc<Cpu> {
    let cpu = Arc::new(Cpu {
        id,
        idle_thread: Spin::new(None),
        current_thread: Spin::new(None),
    });
    CPUS.lock().push(cpu.clone());
    cpu
}

pub fn cpu(id: usize) -> Arc<Cpu> {
    CPUS.lock()
        .iter()
        .find(|c| c.id == id)
        .cloned()
        .expect("scheduler: no such cpu registered")
}

pub fn cpu_count() -> usize {
    CPUS.lock().len()
}

/// Must run once, before any call to [`enqueue`]/[`pick_next`].
pub fn init() {
    *STATE.lock() = Some(SchedulerState {
        ready: core::array::from_fn(|_| Level::new()),
    });
}

/// Resets priority/timing state and appends `t` to level 0, ready.
pub fn enqueue(t: Arc<Thread>) {
    t.reset_priority();
    t.set_last_ran(0);
    t.set_sleep_until(0);
    t.set_state(ThreadState::Ready);

    let mut state = STATE.lock();
    let state = state.as_mut().expect("scheduler: enqueue before init");
    state.ready[0].push_back(t);
}

/// Scans levels `0..L` for the first thread whose `sleep_until <= now`;
/// pops and marks it running. Falls back to `cpu`'s idle thread.
fn pick_next_thread(cpu: &Cpu, now: u64) -> Arc<Thread> {
    let mut state = STATE.lock();
    let state = state.as_mut().expect("scheduler: pick_next before init");

    for level in state.ready.iter_mut() {
        if let Some(pos) = level.iter().position(|t| t.sleep_until() <= now) {
            let t = level.remove(pos).expect("position just found");
            t.set_state(ThreadState::Running);
            return t;
        }
    }

    cpu.idle_thread()
}

/// Called by the switch glue once it has moved off `t`'s stack: if `t`
/// is not the idle thread and is still ready or sleeping, appends it
/// back onto its current priority level's queue.
pub fn drop_thread(cpu: &Cpu, t: Arc<Thread>) {
    if Arc::ptr_eq(&t, &cpu.idle_thread()) {
        return;
    }
    if !matches!(t.state(), ThreadState::Ready | ThreadState::Sleeping) {
        return;
    }

    let mut state = STATE.lock();
    let state = state.as_mut().expect("scheduler: drop before init");
    let level = t.priority();
    state.ready[level].push_back(t);
}

/// Timer-driven preemption: ages the current thread's priority down
/// (toward starvation-favoring), marks it ready, and picks the next
/// thread to run. The caller is responsible for context-switching to
/// the result and then calling [`drop_thread`] on the old thread.
pub fn preempt(cpu: &Cpu, now: u64) -> Arc<Thread> {
    let old = cpu.current_thread();
    old.set_last_ran(now);
    old.set_state(ThreadState::Ready);
    old.bump_priority();

    let next = pick_next_thread(cpu, now);
    cpu.set_current(next.clone());
    next
}

/// Voluntary yield: the current thread transitions to `new_state`
/// (typically `Blocked` or `Sleeping`) without a priority bump, then
/// the next thread is picked.
pub fn yield_now(cpu: &Cpu, new_state: ThreadState, now: u64) -> Arc<Thread> {
    let old = cpu.current_thread();
    old.set_last_ran(now);
    old.set_state(new_state);

    let next = pick_next_thread(cpu, now);
    cpu.set_current(next.clone());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::process::Process;

    fn fresh_thread(proc: &Arc<Process>) -> Arc<Thread> {
        Thread::new(proc, 0, 0)
    }

    // S5 from SPEC_FULL.md §8, minus the real passage of time: sleeping
    // threads are skipped until their deadline, ready threads are not.
    #[test]
    fn sleeping_thread_is_skipped_until_deadline() {
        init();
        let proc = Process::create_for_test("test");
        let cpu = register_cpu(100);
        let idle = fresh_thread(&proc);
        cpu.set_idle_thread(idle.clone());

        let t1 = fresh_thread(&proc);
        let t2 = fresh_thread(&proc);
        enqueue(t1.clone());
        enqueue(t2.clone());

        t1.set_state(ThreadState::Sleeping);
        t1.set_sleep_until(1_000_000);
        {
            let mut state = STATE.lock();
            let state = state.as_mut().unwrap();
            let pos = state.ready[0].iter().position(|t| Arc::ptr_eq(t, &t1)).unwrap();
            state.ready[0].remove(pos);
            state.ready[0].push_front(t1.clone());
        }

        let picked = pick_next_thread(&cpu, 0);
        assert!(Arc::ptr_eq(&picked, &t2));

        let picked = pick_next_thread(&cpu, 1_000_001);
        assert!(Arc::ptr_eq(&picked, &t1));
    }

    #[test]
    fn empty_queues_fall_back_to_idle() {
        init();
        let proc = Process::create_for_test("test2");
        let cpu = register_cpu(101);
        let idle = fresh_thread(&proc);
        cpu.set_idle_thread(idle.clone());

        let picked = pick_next_thread(&cpu, 0);
        assert!(Arc::ptr_eq(&picked, &idle));
    }

    #[test]
    fn preempt_bumps_priority_and_requeues_via_drop() {
        init();
        let proc = Process::create_for_test("test3");
        let cpu = register_cpu(102);
        let idle = fresh_thread(&proc);
        cpu.set_idle_thread(idle.clone());

        let running = fresh_thread(&proc);
        running.set_state(ThreadState::Running);
        cpu.set_current(running.clone());
        enqueue(fresh_thread(&proc));

        let next = preempt(&cpu, 5);
        assert!(!Arc::ptr_eq(&next, &running));
        assert_eq!(running.priority(), 1);
        assert_eq!(running.state(), ThreadState::Ready);

        drop_thread(&cpu, running.clone());
        let state = STATE.lock();
        assert!(state.as_ref().unwrap().ready[1].iter().any(|t| Arc::ptr_eq(t, &running)));
    }
}
