//! Hosted realization of the architecture contract
//!
//! Used whenever the kernel is compiled for a target with an OS under it,
//! which in practice means `cargo test`. Nothing here touches real hardware:
//! the monotonic clock is an atomic counter that tests advance explicitly,
//! the one-shot alarm calls back into the registered handler when its
//! deadline passes, and "which cpu am I" is a settable value so tests can
//! impersonate secondary cpus when exercising cross-cpu paths.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Once;

use super::ExecFrame;
use crate::smp::MAX_CPUS;

const INTR_INIT: AtomicBool = AtomicBool::new(false);
const ALARM_INIT: AtomicU64 = AtomicU64::new(0);

static INTR_ENABLED: [AtomicBool; MAX_CPUS] = [INTR_INIT; MAX_CPUS];
static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);
static NOW_NANOS: AtomicU64 = AtomicU64::new(1);

/// Armed alarm deadlines per cpu; 0 means disarmed.
static ALARM_DEADLINE: [AtomicU64; MAX_CPUS] = [ALARM_INIT; MAX_CPUS];
static ALARM_HANDLER: Once<fn()> = Once::new();

static IPI_COUNT: [AtomicU64; MAX_CPUS] = [ALARM_INIT; MAX_CPUS];

pub fn cpu_id() -> usize {
    CURRENT_CPU.load(Ordering::Relaxed)
}

/// Impersonate another cpu. Test-only control surface.
pub fn set_cpu_id(id: usize) {
    assert!(id < MAX_CPUS);
    CURRENT_CPU.store(id, Ordering::Relaxed);
}

pub fn interrupts_enabled() -> bool {
    INTR_ENABLED[cpu_id()].load(Ordering::Relaxed)
}

/// Returns the previous state, like the hardware flag it models.
pub fn disable_interrupts() -> bool {
    INTR_ENABLED[cpu_id()].swap(false, Ordering::Relaxed)
}

pub fn enable_interrupts() {
    INTR_ENABLED[cpu_id()].store(true, Ordering::Relaxed);
}

/// Monotonic timestamp in nanoseconds. Starts at 1 so "0" can mean "never".
pub fn timestamp_nanos() -> u64 {
    NOW_NANOS.load(Ordering::Relaxed)
}

pub fn timestamp_frequency() -> u64 {
    1_000_000_000
}

/// Whether the timestamp source runs at a constant rate on every cpu. The
/// hosted counter trivially does.
pub fn timestamp_stable() -> bool {
    true
}

pub fn set_alarm_handler(handler: fn()) {
    ALARM_HANDLER.call_once(|| handler);
}

/// Arm the one-shot alarm `nanos` from now on the calling cpu.
pub fn set_alarm(nanos: u64) {
    let deadline = timestamp_nanos().saturating_add(nanos.max(1));
    ALARM_DEADLINE[cpu_id()].store(deadline, Ordering::Relaxed);
}

pub fn alarm_max() -> u64 {
    u64::MAX / 2
}

/// Deadline currently armed on this cpu, if any. Test observability.
pub fn armed_alarm() -> Option<u64> {
    match ALARM_DEADLINE[cpu_id()].load(Ordering::Relaxed) {
        0 => None,
        deadline => Some(deadline),
    }
}

/// Advance the hosted clock, delivering any alarm whose deadline passes.
/// This is the test stand-in for time passing plus the timer interrupt.
pub fn advance_time(nanos: u64) {
    let target = NOW_NANOS.load(Ordering::Relaxed).saturating_add(nanos);

    loop {
        let deadline = ALARM_DEADLINE[cpu_id()].load(Ordering::Relaxed);
        if deadline == 0 || deadline > target {
            break;
        }
        // Deliver the alarm exactly at its deadline, then let the handler
        // re-arm before we continue toward the target time.
        NOW_NANOS.store(deadline, Ordering::Relaxed);
        ALARM_DEADLINE[cpu_id()].store(0, Ordering::Relaxed);
        if let Some(handler) = ALARM_HANDLER.get() {
            handler();
        }
    }

    NOW_NANOS.store(target, Ordering::Relaxed);
}

/// Jump the clock straight to the next armed alarm and deliver it.
/// Returns false when nothing is armed on the current cpu.
pub fn advance_to_next_alarm() -> bool {
    let deadline = ALARM_DEADLINE[cpu_id()].load(Ordering::Relaxed);
    if deadline == 0 {
        return false;
    }
    let now = NOW_NANOS.load(Ordering::Relaxed);
    advance_time(deadline.saturating_sub(now).max(1));
    true
}

/// Polled short sleep used during bring-up; hosted builds just advance time.
pub fn poll_sleep(nanos: u64) {
    advance_time(nanos);
}

/// Idle until something interesting happens. Hosted cpus push the clock to
/// the next alarm so idle loops make progress in tests.
pub fn wait_for_interrupt() {
    if !advance_to_next_alarm() {
        core::hint::spin_loop();
    }
}

/// Record an IPI. Tests deliver it by impersonating the target cpu and
/// calling the interrupt dispatch path directly.
pub fn send_ipi(target: usize) {
    IPI_COUNT[target].fetch_add(1, Ordering::Relaxed);
}

pub fn ipi_count(cpu: usize) -> u64 {
    IPI_COUNT[cpu].load(Ordering::Relaxed)
}

/// The hosted cpu has no interrupt priority register; the software run
/// level in the per-cpu block is the only state.
pub fn set_hardware_run_level(_level: u8) {}

/// Permission-widening map changes still require a flush on the hosted
/// "hardware", mirroring the conservative default.
pub fn flush_on_perms_upgrade() -> bool {
    true
}

/// Flush one translation entry. The hosted walker reads tables directly, so
/// this only exists to satisfy the contract.
pub fn flush_local_entry(_vaddr: usize) {}

pub fn flush_local_all() {}

/// Hosted frames carry no state; control never actually transfers.
pub fn init_exec_frame(stack_top: usize, _entry: usize, _arg: usize, _user: bool) -> *mut ExecFrame {
    stack_top as *mut ExecFrame
}

/// Run the between-frames callback and return to the caller. The hosted
/// scheduler compensates with its own wait loop; see `sched::yield_now`.
pub unsafe fn switch_exec_frame(
    _save: *mut *mut ExecFrame,
    _load: *mut ExecFrame,
    callback: Option<fn(*mut ())>,
    callback_arg: *mut (),
) {
    if let Some(callback) = callback {
        callback(callback_arg);
    }
}

/// Size of one extended-register save area.
pub const EXTENDED_REGS_SIZE: usize = 512;

pub fn init_extended_regs(_regs: *mut super::ExtendedRegs) {}
pub fn save_extended_regs(_regs: *mut super::ExtendedRegs) {}
pub fn load_extended_regs(_regs: *mut super::ExtendedRegs) {}
pub fn extended_regs_fence() -> bool {
    false
}

static UNSAFE_OP_ABORT: [AtomicU64; MAX_CPUS] = [ALARM_INIT; MAX_CPUS];

/// Arm the per-cpu fault-abort hook. On hardware a fault taken while this is
/// set redirects the trap frame here instead of panicking.
pub fn set_unsafe_op_abort(target: usize) {
    UNSAFE_OP_ABORT[cpu_id()].store(target as u64, Ordering::Relaxed);
}

pub fn clear_unsafe_op_abort() {
    UNSAFE_OP_ABORT[cpu_id()].store(0, Ordering::Relaxed);
}

pub fn unsafe_op_abort() -> Option<usize> {
    match UNSAFE_OP_ABORT[cpu_id()].load(Ordering::Relaxed) {
        0 => None,
        target => Some(target as usize),
    }
}

/// Reset hosted state between tests that need a pristine cpu 0.
pub fn reset_for_test() {
    CURRENT_CPU.store(0, Ordering::Relaxed);
    for cpu in 0..MAX_CPUS {
        ALARM_DEADLINE[cpu].store(0, Ordering::Relaxed);
        INTR_ENABLED[cpu].store(true, Ordering::Relaxed);
        UNSAFE_OP_ABORT[cpu].store(0, Ordering::Relaxed);
    }
}
