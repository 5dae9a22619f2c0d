//! Process entities: pid allocation, address-space ownership (or
//! sharing, for kernel processes), the fd table, and the thread list.
//! Grounded in the original kernel's `proc/proc.c`.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::fd::FdTable;
use crate::mm::bootstrap::kernel_address_space;
use crate::mm::vm::AddressSpace;
use crate::prelude::*;
use crate::task::thread::ThreadState as ProcessState;
use crate::task::Thread;

static NEXT_PID: AtomicUsize = AtomicUsize::new(0);
static PROCESS_LIST: Spin<Vec<Arc<Process>>> = Spin::new(Vec::new());

pub struct Process {
    pub pid: usize,
    name: Spin<String>,
    state: Spin<ProcessState>,
    pub user: bool,
    pub address_space: Arc<AddressSpace>,
    threads: Spin<Vec<Arc<Thread>>>,
    pub fd_table: FdTable,
    cwd: Spin<String>,
}

impl Process {
    fn new(name: &str, user: bool, address_space: Arc<AddressSpace>) -> Arc<Self> {
        let proc = Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            name: Spin::new(name.to_string()),
            state: Spin::new(ProcessState::New),
            user,
            address_space,
            threads: Spin::new(Vec::new()),
            fd_table: FdTable::new(),
            cwd: Spin::new(String::from("/")),
        });
        PROCESS_LIST.lock().push(proc.clone());
        proc
    }

    /// Creates a user process with its own freshly allocated address
    /// space.
    pub fn create_user(name: &str, limit_low: usize, limit_high: usize) -> KResult<Arc<Self>> {
        let as_ = Arc::new(AddressSpace::create(limit_low, limit_high)?);
        Ok(Self::new(name, true, as_))
    }

    /// Creates a kernel process, sharing the singleton kernel address
    /// space rather than allocating its own.
    pub fn create_kernel(name: &str) -> KResult<Arc<Self>> {
        Ok(Self::new(name, false, kernel_address_space()))
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ProcessState) {
        *self.state.lock() = state;
    }

    pub fn cwd(&self) -> String {
        self.cwd.lock().clone()
    }

    pub fn set_cwd(&self, path: &str) {
        *self.cwd.lock() = path.to_string();
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    fn add_thread(&self, t: Arc<Thread>) {
        self.threads.lock().push(t);
    }
}

/// Allocates a thread for `proc` entering at `entry` with a mapped user
/// stack topping out at `stack_top`, and appends it to the process's
/// thread list.
pub fn thread_create(proc: &Arc<Process>, entry: usize, stack_top: usize) -> Arc<Thread> {
    let t = Thread::new(proc, entry, stack_top);
    proc.add_thread(t.clone());
    t
}

/// Tears down `proc`: its fd table (dropped with it), address space,
/// and every thread (marked terminated; the scheduler drops its own
/// reference the next time it tries to requeue one).
pub fn proc_destroy(proc: &Arc<Process>) {
    for t in proc.threads().iter() {
        t.set_state(ProcessState::Terminated);
    }
    PROCESS_LIST.lock().retain(|p| p.pid != proc.pid);
}

impl Process {
    /// Builds a user process over a zeroed test address space, for host
    /// tests of process/scheduler bookkeeping elsewhere in this crate
    /// that need a `Process` to hang threads off of.
    #[cfg(test)]
    pub fn create_for_test(name: &str) -> Arc<Self> {
        Self::new(name, true, Arc::new(AddressSpace::create_for_test()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_process_gets_distinct_pids() {
        let a = Process::create_for_test("a");
        let b = Process::create_for_test("b");
        assert_ne!(a.pid, b.pid);
        assert!(a.user);
    }

    #[test]
    fn thread_create_registers_with_owner() {
        let proc = Process::create_for_test("c");
        let t = thread_create(&proc, 0x1000, 0x2000);
        assert_eq!(proc.threads().len(), 1);
        assert!(Arc::ptr_eq(&t.owner().unwrap(), &proc));
    }
}
