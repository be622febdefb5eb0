//! Hosted test world
//!
//! Builds a miniature machine for the unit tests: a leaked arena standing
//! in for physical memory behind an identity direct map, domain 0 over it,
//! the kernel page tables, cpu 0's mailbox, clock queue, and scheduler, and
//! a bootstrap "current thread". Tests serialize on [`world`]; acquiring it
//! also rolls per-cpu and clock state back to a known baseline so a failed
//! test cannot wedge the rest.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, Once};

use crate::logging::{LogMessage, LogSink};
use crate::sched::{kernel_process, Scheduler, Thread, ThreadState};
use crate::smp::percpu;

/// 16 MiB of fake physical memory.
const ARENA_BYTES: usize = 16 * 1024 * 1024;

static WORLD_LOCK: Mutex<()> = Mutex::new(());
static WORLD_INIT: Once<()> = Once::new();

static CAPTURED_LOGS: AtomicUsize = AtomicUsize::new(0);

struct CaptureSink;

impl LogSink for CaptureSink {
    fn write(&self, _msg: &LogMessage) {
        CAPTURED_LOGS.fetch_add(1, Ordering::Relaxed);
    }
}

static CAPTURE: CaptureSink = CaptureSink;

pub fn captured_log_count() -> usize {
    CAPTURED_LOGS.load(Ordering::Relaxed)
}

/// Allocate a page-aligned arena and leak it, returning its base address.
/// The identity direct map makes the address double as a physical address.
pub fn leak_arena(bytes: usize) -> usize {
    let layout = std::alloc::Layout::from_size_align(bytes, crate::mm::PAGE_SIZE).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr as usize
}

extern "C" fn bootstrap_entry(_arg: usize) {}

fn init_world() {
    crate::config::init("kernel.scheduler.priorities=8");
    crate::logging::add_sink(&CAPTURE);

    // Identity direct map over the host address space.
    crate::mm::set_hhdm(0, usize::MAX / 2);

    let arena = leak_arena(ARENA_BYTES);
    crate::mm::pmm::init(&[(arena, ARENA_BYTES)]);
    crate::mm::wired::init();
    crate::mm::hat::init_kernel_map();

    crate::smp::mark_cpu_online(0);
    crate::smp::mail::init_mailbox(0);
    crate::time::init_local_clock_queue(0);
    Scheduler::init(0);

    let main = Thread::create(kernel_process(), bootstrap_entry, 0, "test-main")
        .expect("arena exhausted building the test world");
    main.set_priority(4);
    main.set_state(ThreadState::Running);
    main.set_active(true);
    percpu::get(0).set_current_thread(Some(main));
}

/// Enter the shared test world. The returned guard serializes tests; the
/// machine state is reset on every entry.
pub fn world() -> MutexGuard<'static, ()> {
    let guard = WORLD_LOCK.lock();
    WORLD_INIT.call_once(init_world);

    crate::arch::reset_for_test();
    percpu::reset_for_test();
    crate::smp::reset_for_test();
    crate::time::reset_for_test();

    // Revive the bootstrap thread in case a failed test left it parked.
    let cpu = percpu::get(0);
    if let Some(main) = cpu.current_thread() {
        crate::sched::dequeue(&main);
        main.set_state(ThreadState::Running);
        main.set_active(true);
        main.set_wait_control(core::ptr::null_mut());
    }

    guard
}
