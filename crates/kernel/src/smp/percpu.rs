/// Per-cpu state blocks
///
/// Each cpu owns one `CpuLocal`: its current run level, its deferred-work
/// queues, the cross-cpu request control block, and the fixed set of
/// subsystem pointers (clock queue, scheduler, current thread) installed
/// during per-cpu init. Entries are only mutated by their owning cpu or
/// under the short locks noted on each field.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use spin::Mutex;

use super::mail::SmpControl;
use super::MAX_CPUS;
use crate::runlevel::{Apc, Dpc, RunLevel};
use crate::sched::{Scheduler, Thread};
use crate::time::ClockQueue;

pub struct CpuLocal {
    /// Current run level; written only by the owning cpu.
    run_level: AtomicU8,

    /// Deferred procedure calls, drained when lowering through Dpc.
    pub(crate) dpcs: Mutex<VecDeque<NonNull<Dpc>>>,

    /// Thread-targeted deferred calls, drained when lowering through Apc.
    pub(crate) apcs: Mutex<VecDeque<NonNull<Apc>>>,

    /// A scheduler switch was requested above Normal and is performed when
    /// this cpu lowers back to Normal.
    pub(crate) switch_pending: AtomicBool,

    /// Cross-cpu mail, remote flushes, panic freeze flag.
    pub smp: SmpControl,

    /// Installed during per-cpu init.
    clock_queue: AtomicPtr<ClockQueue>,
    scheduler: AtomicPtr<Scheduler>,

    /// The thread currently executing on this cpu.
    thread: Mutex<Option<Arc<Thread>>>,
}

// Queue entries are raw pointers to records owned elsewhere; all access is
// serialized per the field docs above.
unsafe impl Send for CpuLocal {}
unsafe impl Sync for CpuLocal {}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            run_level: AtomicU8::new(RunLevel::Normal as u8),
            dpcs: Mutex::new(VecDeque::new()),
            apcs: Mutex::new(VecDeque::new()),
            switch_pending: AtomicBool::new(false),
            smp: SmpControl::new(),
            clock_queue: AtomicPtr::new(core::ptr::null_mut()),
            scheduler: AtomicPtr::new(core::ptr::null_mut()),
            thread: Mutex::new(None),
        }
    }

    pub fn run_level(&self) -> RunLevel {
        RunLevel::from_raw(self.run_level.load(Ordering::Relaxed))
    }

    pub(crate) fn store_run_level(&self, level: RunLevel) {
        self.run_level.store(level as u8, Ordering::Relaxed);
    }

    /// Install this cpu's clock queue. Once, during per-cpu init.
    pub fn set_clock_queue(&self, queue: &'static ClockQueue) {
        self.clock_queue
            .store(queue as *const _ as *mut _, Ordering::Release);
    }

    pub fn clock_queue(&self) -> Option<&'static ClockQueue> {
        let ptr = self.clock_queue.load(Ordering::Acquire);
        unsafe { ptr.cast_const().as_ref() }
    }

    /// Install this cpu's scheduler. Once, during per-cpu init.
    pub fn set_scheduler(&self, scheduler: &'static Scheduler) {
        self.scheduler
            .store(scheduler as *const _ as *mut _, Ordering::Release);
    }

    pub fn scheduler(&self) -> Option<&'static Scheduler> {
        let ptr = self.scheduler.load(Ordering::Acquire);
        unsafe { ptr.cast_const().as_ref() }
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.thread.lock().clone()
    }

    pub(crate) fn set_current_thread(&self, thread: Option<Arc<Thread>>) {
        *self.thread.lock() = thread;
    }
}

const CPU_INIT: CpuLocal = CpuLocal::new();
static CPUS: [CpuLocal; MAX_CPUS] = [CPU_INIT; MAX_CPUS];

/// Drop queued work and return every cpu to Normal. Test isolation only;
/// installed clock queues and schedulers are left in place.
#[cfg(test)]
pub fn reset_for_test() {
    for cpu in CPUS.iter() {
        cpu.store_run_level(RunLevel::Normal);
        cpu.switch_pending.store(false, Ordering::Release);
        cpu.dpcs.lock().clear();
        cpu.apcs.lock().clear();
        cpu.smp.reset_for_test();
    }
}

/// Per-cpu block for a specific cpu.
pub fn get(cpu_id: usize) -> &'static CpuLocal {
    &CPUS[cpu_id]
}

/// Per-cpu block for the calling cpu.
pub fn current() -> &'static CpuLocal {
    get(crate::arch::cpu_id())
}
