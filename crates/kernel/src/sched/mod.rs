/// Per-cpu preemptive scheduler
///
/// Each cpu owns a `Scheduler` with one FIFO run queue per priority (higher
/// index runs first) and an idle thread that soaks up empty queues. Yield
/// raises to Dpc, re-queues the current thread if it is still runnable,
/// pops the best candidate, and switches frames; preemption is a clock DPC
/// that requests a switch, performed when the cpu lowers back to Normal.
///
/// Hosted builds cannot transfer control between stacks, so yield there
/// parks the calling context until its thread is made runnable again,
/// pumping the clock and DPC queues in the meantime. The scheduling
/// decisions exercised are the same.

pub mod thread;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use spin::Mutex;

pub use thread::{kernel_process, Process, Thread, ThreadState};

use crate::arch;
use crate::runlevel::{self, Dpc, RunLevel};
use crate::smp::percpu;
use crate::time::ClockEvent;

const DEFAULT_PRIORITIES: usize = 16;
const MAX_PRIORITIES: usize = 128;

/// Preemption quantum.
const TIME_SLICE_NANOS: u64 = 10_000_000;

pub struct Scheduler {
    cpu: usize,
    priorities: usize,
    /// Run queues indexed by priority; guarded as one unit.
    queues: Mutex<Vec<VecDeque<Arc<Thread>>>>,
    idle: Arc<Thread>,
    preempt_dpc: Dpc,
    preempt_event: ClockEvent,
}

unsafe impl Send for Scheduler {}
unsafe impl Sync for Scheduler {}

extern "C" fn idle_main(_arg: usize) {
    loop {
        arch::wait_for_interrupt();
    }
}

fn preempt_tick(arg: *mut ()) {
    let scheduler = unsafe { &*(arg as *const Scheduler) };
    percpu::get(scheduler.cpu)
        .switch_pending
        .store(true, Ordering::Release);

    scheduler.preempt_event.set_duration(TIME_SLICE_NANOS);
    crate::time::queue_clock_event(NonNull::from(&scheduler.preempt_event));
}

impl Scheduler {
    /// Build this cpu's scheduler and install it in the per-cpu block.
    pub fn init(cpu_id: usize) -> &'static Scheduler {
        let priorities = crate::config::get_num("kernel.scheduler.priorities", DEFAULT_PRIORITIES)
            .clamp(1, MAX_PRIORITIES);

        let mut queues = Vec::with_capacity(priorities);
        for _ in 0..priorities {
            queues.push(VecDeque::new());
        }

        let scheduler = crate::mm::wired::wired_new(Scheduler {
            cpu: cpu_id,
            priorities,
            queues: Mutex::new(queues),
            idle: Thread::new_idle(cpu_id),
            preempt_dpc: Dpc::new(preempt_tick, core::ptr::null_mut()),
            preempt_event: ClockEvent::new(),
        })
        .expect("no wired memory for scheduler");

        let scheduler: &'static mut Scheduler = unsafe { &mut *scheduler.as_ptr() };
        scheduler.preempt_dpc.set_arg(scheduler as *const Scheduler as *mut ());
        scheduler
            .preempt_event
            .set_dpc(NonNull::from(&scheduler.preempt_dpc));

        // The idle thread needs a real frame to be switched into.
        let idle_stack = crate::mm::pmm::alloc_contiguous(4).expect("no memory for idle stack");
        let stack_top = crate::mm::phys_to_virt(idle_stack) as usize + 4 * crate::mm::PAGE_SIZE;
        scheduler.idle.frame_slot().store(
            arch::init_exec_frame(stack_top, idle_main as usize, 0, false),
            Ordering::Release,
        );

        percpu::get(cpu_id).set_scheduler(scheduler);
        crate::info!("Scheduler init on cpu {}: {} priorities", cpu_id, priorities);
        scheduler
    }

    pub fn local() -> Option<&'static Scheduler> {
        percpu::current().scheduler()
    }

    pub fn priorities(&self) -> usize {
        self.priorities
    }

    pub fn default_priority(&self) -> usize {
        self.priorities / 2
    }

    /// Make `thread` runnable at `priority` on this cpu.
    pub fn enqueue(&self, thread: &Arc<Thread>, priority: usize) {
        let priority = priority.min(self.priorities - 1);
        thread.set_state(ThreadState::Ready);
        thread.set_active(true);
        self.queues.lock()[priority].push_back(thread.clone());
    }

    /// Remove `thread` from its run queue; required before it may block.
    pub fn dequeue(&self, thread: &Thread) {
        thread.set_active(false);
        let mut queues = self.queues.lock();
        for queue in queues.iter_mut() {
            queue.retain(|t| t.id() != thread.id());
        }
    }

    /// Highest-priority runnable thread, or the idle thread.
    pub fn pop_thread(&self) -> Arc<Thread> {
        let mut queues = self.queues.lock();
        for queue in queues.iter_mut().rev() {
            if let Some(thread) = queue.pop_front() {
                return thread;
            }
        }
        self.idle.clone()
    }

    /// Pull a specific awakened thread out of the queues, keeping it
    /// active. Hosted stand-in for being picked by `pop_thread`.
    #[cfg(not(target_os = "none"))]
    fn claim(&self, thread: &Thread) -> bool {
        let mut queues = self.queues.lock();
        for queue in queues.iter_mut() {
            let before = queue.len();
            queue.retain(|t| t.id() != thread.id());
            if queue.len() != before {
                return true;
            }
        }
        false
    }

    /// Arm the preemption timer for this cpu.
    pub fn start_preemption(&self) {
        self.preempt_event.set_duration(TIME_SLICE_NANOS);
        crate::time::queue_clock_event(NonNull::from(&self.preempt_event));
    }

    /// First entry on a fresh cpu: switch into the best thread and never
    /// return.
    #[cfg(target_os = "none")]
    pub fn kickstart(&self) -> ! {
        arch::disable_interrupts();

        let next = self.pop_thread();
        next.set_state(ThreadState::Running);
        let frame = next.frame_slot().load(Ordering::Acquire);
        percpu::current().set_current_thread(Some(next));

        unsafe {
            arch::switch_exec_frame(core::ptr::null_mut(), frame, None, core::ptr::null_mut());
        }
        unreachable!("kickstart frame returned");
    }

    #[cfg(test)]
    pub fn queue_depth(&self, priority: usize) -> usize {
        self.queues.lock()[priority].len()
    }
}

/// Enqueue on the thread's pinned cpu, or the calling cpu. `priority` is
/// the queue position for this wake only (wake boosts ride through here);
/// the thread's base priority is untouched.
pub fn enqueue(thread: &Arc<Thread>, priority: usize) {
    let cpu = thread.affinity().unwrap_or_else(arch::cpu_id);
    let scheduler = percpu::get(cpu)
        .scheduler()
        .expect("scheduler used before init");
    scheduler.enqueue(thread, priority);
}

/// Remove from whichever cpu's queues hold the thread.
pub fn dequeue(thread: &Thread) {
    for cpu in crate::smp::online_cpus() {
        if let Some(scheduler) = percpu::get(cpu).scheduler() {
            scheduler.dequeue(thread);
        }
    }
}

/// Make a created thread runnable at `priority` (or the default).
pub fn start_thread(thread: &Arc<Thread>, priority: Option<usize>) {
    let scheduler = Scheduler::local().expect("scheduler used before init");
    let priority = priority.unwrap_or_else(|| scheduler.default_priority());
    thread.set_priority(priority);
    enqueue(thread, priority);
}

/// Voluntarily give up the cpu. Never legal above Dpc level.
pub fn yield_now() {
    let prev = runlevel::ensure(RunLevel::Dpc);

    let cpu = percpu::current();
    let scheduler = cpu.scheduler().expect("scheduler used before init");
    let current = cpu.current_thread();

    #[cfg(target_os = "none")]
    {
        if let Some(current) = &current {
            if current.is_active() {
                scheduler.enqueue(current, current.priority());
            }
            let regs = current.ext_regs();
            if !regs.is_null() {
                arch::save_extended_regs(regs);
            }
        }
        let next = scheduler.pop_thread();
        next.set_state(ThreadState::Running);
        let next_frame = next.frame_slot().load(Ordering::Acquire);
        let next_regs = next.ext_regs();
        let save_slot = current
            .as_ref()
            .map(|c| c.frame_slot().as_ptr())
            .unwrap_or(core::ptr::null_mut());
        cpu.set_current_thread(Some(next));

        if !next_regs.is_null() {
            // Some register files need a hardware fence observed before the
            // restore is architecturally safe.
            while arch::extended_regs_fence() {
                core::hint::spin_loop();
            }
            arch::load_extended_regs(next_regs);
        }
        unsafe {
            arch::switch_exec_frame(save_slot, next_frame, None, core::ptr::null_mut());
        }
    }

    #[cfg(not(target_os = "none"))]
    host_wait_until_runnable(scheduler, current);

    runlevel::lower_to(prev);
}

/// Perform a switch requested above Normal; reached from
/// `lower_run_level(Normal)` with interrupts disabled.
pub fn do_pending_switch() {
    if Scheduler::local().is_none() {
        return;
    }
    yield_now();
}

/// Hosted blocking: spin the clock and DPC queues forward until this
/// thread is made runnable again.
#[cfg(not(target_os = "none"))]
fn host_wait_until_runnable(scheduler: &'static Scheduler, current: Option<Arc<Thread>>) {
    let Some(current) = current else {
        // No thread context (early boot, bare test harness): nothing to
        // block on.
        return;
    };
    if current.is_active() {
        // Cooperative yield with no competition: keep running.
        return;
    }

    loop {
        if current.is_active() {
            if scheduler.claim(&current) || claim_anywhere(&current) {
                current.set_state(ThreadState::Running);
                return;
            }
            // Enqueued but not yet visible in a queue; retry.
            core::hint::spin_loop();
            continue;
        }

        // Let queued DPCs (wake-ups, timeouts) run.
        runlevel::poll_local_dpcs();
        if current.is_active() {
            continue;
        }

        // Nothing pending: advance the hosted clock to the next alarm.
        if !arch::advance_to_next_alarm() {
            panic!(
                "hosted scheduler deadlock: thread {} blocked with no wake source",
                current.id()
            );
        }
    }
}

#[cfg(not(target_os = "none"))]
fn claim_anywhere(thread: &Thread) -> bool {
    for cpu in crate::smp::online_cpus() {
        if let Some(scheduler) = percpu::get(cpu).scheduler() {
            if scheduler.claim(thread) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nop_entry(_arg: usize) {}

    #[test]
    fn higher_priority_pops_first() {
        let _world = crate::test_support::world();
        let scheduler = Scheduler::local().unwrap();

        let t_lo = Thread::create(kernel_process(), nop_entry, 0, "lo").unwrap();
        let t_hi = Thread::create(kernel_process(), nop_entry, 0, "hi").unwrap();
        scheduler.enqueue(&t_lo, 0);
        scheduler.enqueue(&t_hi, 3);

        let first = scheduler.pop_thread();
        assert_eq!(first.id(), t_hi.id(), "priority 3 runs before priority 0");
        let second = scheduler.pop_thread();
        assert_eq!(second.id(), t_lo.id());

        // Both drained: idle takes over.
        let idle = scheduler.pop_thread();
        assert_eq!(idle.affinity(), Some(0), "idle thread is pinned");
        t_lo.exit();
        t_hi.exit();
    }

    #[test]
    fn equal_priority_is_fifo() {
        let _world = crate::test_support::world();
        let scheduler = Scheduler::local().unwrap();

        let a = Thread::create(kernel_process(), nop_entry, 0, "a").unwrap();
        let b = Thread::create(kernel_process(), nop_entry, 0, "b").unwrap();
        scheduler.enqueue(&a, 2);
        scheduler.enqueue(&b, 2);

        assert_eq!(scheduler.pop_thread().id(), a.id());
        assert_eq!(scheduler.pop_thread().id(), b.id());
        a.exit();
        b.exit();
    }

    #[test]
    fn dequeue_clears_active_before_blocking() {
        let _world = crate::test_support::world();
        let scheduler = Scheduler::local().unwrap();

        let t = Thread::create(kernel_process(), nop_entry, 0, "blocker").unwrap();
        scheduler.enqueue(&t, 1);
        assert!(t.is_active());
        scheduler.dequeue(&t);
        assert!(!t.is_active());
        assert_eq!(scheduler.queue_depth(1), 0);
        t.exit();
    }

    #[test]
    fn preemption_tick_requests_switch() {
        let _world = crate::test_support::world();
        let scheduler = Scheduler::local().unwrap();

        // Hold the cpu at Apc so the pending switch is observable before a
        // lower to Normal consumes it.
        let prev = runlevel::raise(RunLevel::Apc);
        scheduler.start_preemption();
        assert!(!percpu::current().switch_pending.load(Ordering::Relaxed));
        arch::advance_time(TIME_SLICE_NANOS + 1);
        assert!(percpu::current().switch_pending.load(Ordering::Relaxed));

        // The event re-armed itself for the next quantum.
        assert!(arch::armed_alarm().is_some());

        // Lowering to Normal performs (and clears) the deferred switch.
        runlevel::lower(prev);
        assert!(!percpu::current().switch_pending.load(Ordering::Relaxed));
        crate::time::reset_for_test();
    }
}
