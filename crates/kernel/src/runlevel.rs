//! Run levels and deferred work
//!
//! Every cpu carries a current run level from the totally ordered set
//! `Normal < Apc < Dpc < Clock < Interrupt`. Raising is immediate; lowering
//! drains the work queued for each level being left: the DPC queue when
//! leaving Dpc, the APC queue when leaving Apc, and a pending thread switch
//! when landing back at Normal (performed with interrupts disabled).
//!
//! DPC and APC records are owned by their submitters and must stay alive
//! until they have executed; the `queued` flag doubles as the double-queue
//! guard.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::smp::percpu::{self, CpuLocal};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    Normal = 0,
    Apc = 1,
    Dpc = 2,
    Clock = 3,
    Interrupt = 4,
}

impl RunLevel {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => RunLevel::Normal,
            1 => RunLevel::Apc,
            2 => RunLevel::Dpc,
            3 => RunLevel::Clock,
            4 => RunLevel::Interrupt,
            _ => panic!("invalid run level {}", raw),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RunLevel::Normal => "normal",
            RunLevel::Apc => "apc",
            RunLevel::Dpc => "dpc",
            RunLevel::Clock => "clock",
            RunLevel::Interrupt => "interrupt",
        }
    }
}

pub type DeferredFn = fn(*mut ());

/// Deferred procedure call: a short function executed at Dpc level on the
/// cpu that queued it. Must not block.
pub struct Dpc {
    func: DeferredFn,
    arg: *mut (),
    queued: AtomicBool,
}

unsafe impl Send for Dpc {}
unsafe impl Sync for Dpc {}

impl Dpc {
    pub const fn new(func: DeferredFn, arg: *mut ()) -> Self {
        Self {
            func,
            arg,
            queued: AtomicBool::new(false),
        }
    }

    pub fn set_arg(&mut self, arg: *mut ()) {
        self.arg = arg;
    }
}

/// Asynchronous procedure call: like a DPC but bound to a thread, executed
/// when that thread's cpu lowers through Apc while the thread is current.
pub struct Apc {
    func: DeferredFn,
    arg: *mut (),
    thread_id: usize,
    queued: AtomicBool,
}

unsafe impl Send for Apc {}
unsafe impl Sync for Apc {}

impl Apc {
    pub const fn new(func: DeferredFn, arg: *mut (), thread_id: usize) -> Self {
        Self {
            func,
            arg,
            thread_id,
            queued: AtomicBool::new(false),
        }
    }
}

/// Current run level of the calling cpu.
pub fn current() -> RunLevel {
    percpu::current().run_level()
}

/// Assert the calling cpu is at or below `max`. Operations gated to low run
/// levels (wired heap, VMM allocation) call this on entry.
#[track_caller]
pub fn assert_at_most(max: RunLevel) {
    let level = current();
    assert!(
        level <= max,
        "operation requires run level <= {} but cpu is at {}",
        max.name(),
        level.name()
    );
}

#[track_caller]
pub fn assert_at_least(min: RunLevel) {
    let level = current();
    assert!(
        level >= min,
        "operation requires run level >= {} but cpu is at {}",
        min.name(),
        level.name()
    );
}

/// Raise the calling cpu to `target`, returning the prior level. `target`
/// must be strictly above the current level.
pub fn raise(target: RunLevel) -> RunLevel {
    let cpu = percpu::current();
    let prev = cpu.run_level();
    assert!(target > prev, "cannot raise run level {} -> {}", prev.name(), target.name());

    arch::set_hardware_run_level(target as u8);
    cpu.store_run_level(target);
    prev
}

/// Raise to `target` only if currently below it. Returns the prior level if
/// a raise happened, for symmetric lowering.
pub fn ensure(target: RunLevel) -> Option<RunLevel> {
    if current() < target {
        Some(raise(target))
    } else {
        None
    }
}

/// Lower the calling cpu to `target`, draining each level's queued work on
/// the way down. `target` must be strictly below the current level.
pub fn lower(target: RunLevel) {
    let cpu = percpu::current();
    assert!(target < cpu.run_level());

    let mut do_switch = false;
    let mut restore_interrupts = false;
    while cpu.run_level() > target {
        // Any work queued for the level being left must finish before the
        // cpu can drop below it.
        match cpu.run_level() {
            RunLevel::Dpc => drain_dpcs(cpu),
            RunLevel::Apc => {
                drain_apcs(cpu);
                if cpu.switch_pending.swap(false, Ordering::Acquire) {
                    do_switch = true;
                    restore_interrupts = arch::interrupts_enabled();
                    arch::disable_interrupts();
                }
            }
            _ => {}
        }

        let next = RunLevel::from_raw(cpu.run_level() as u8 - 1);
        arch::set_hardware_run_level(next as u8);
        cpu.store_run_level(next);
    }

    if do_switch {
        crate::sched::do_pending_switch();
        if restore_interrupts {
            arch::enable_interrupts();
        }
    }
}

/// Lower to `prev` if `ensure` actually raised.
pub fn lower_to(prev: Option<RunLevel>) {
    if let Some(prev) = prev {
        lower(prev);
    }
}

/// Run pending DPCs without changing the run level. Used by the hosted
/// scheduler's wait loop, which parks at Dpc level.
pub(crate) fn poll_local_dpcs() {
    assert_at_least(RunLevel::Dpc);
    drain_dpcs(percpu::current());
}

fn drain_dpcs(cpu: &CpuLocal) {
    loop {
        let next = cpu.dpcs.lock().pop_front();
        let Some(dpc) = next else { break };
        // Clear the guard before running so the DPC may requeue itself.
        let dpc = unsafe { dpc.as_ref() };
        dpc.queued.store(false, Ordering::Release);
        (dpc.func)(dpc.arg);
    }
}

fn drain_apcs(cpu: &CpuLocal) {
    let current_thread = cpu.current_thread().map(|t| t.id());

    // Only entries targeting the current thread run now; the rest stay
    // queued until their thread is next current on this cpu.
    let mut deferred = alloc::vec::Vec::new();
    loop {
        let next = cpu.apcs.lock().pop_front();
        let Some(apc) = next else { break };
        let entry = unsafe { apc.as_ref() };
        if Some(entry.thread_id) == current_thread {
            entry.queued.store(false, Ordering::Release);
            (entry.func)(entry.arg);
        } else {
            deferred.push(apc);
        }
    }
    cpu.apcs.lock().extend(deferred);
}

/// Queue a DPC on the calling cpu. If the cpu is below Dpc level the queue
/// is drained before returning, so the DPC observes "runs promptly".
///
/// # Safety
/// `dpc` must remain valid until it has executed.
pub unsafe fn queue_dpc(dpc: NonNull<Dpc>) {
    let entry = unsafe { dpc.as_ref() };
    let was_queued = entry.queued.swap(true, Ordering::AcqRel);
    assert!(!was_queued, "Dpc already queued");

    let cpu = percpu::current();
    cpu.dpcs.lock().push_back(dpc);

    if cpu.run_level() >= RunLevel::Dpc {
        return;
    }
    let prev = raise(RunLevel::Dpc);
    lower(prev);
}

/// Queue an APC for its target thread on the calling cpu.
///
/// # Safety
/// `apc` must remain valid until it has executed.
pub unsafe fn queue_apc(apc: NonNull<Apc>) {
    let entry = unsafe { apc.as_ref() };
    let was_queued = entry.queued.swap(true, Ordering::AcqRel);
    assert!(!was_queued, "Apc already queued");

    let cpu = percpu::current();
    cpu.apcs.lock().push_back(apc);

    if cpu.run_level() >= RunLevel::Apc {
        return;
    }
    let prev = raise(RunLevel::Apc);
    lower(prev);
}

fn remote_dpc_handler(arg: *mut ()) {
    let dpc = NonNull::new(arg as *mut Dpc).expect("remote DPC mail without a DPC");
    unsafe { queue_dpc(dpc) };
}

/// Queue a DPC on a specific cpu, routing through SMP mail when the target
/// is not the calling cpu.
///
/// # Safety
/// `dpc` must remain valid until it has executed on the target cpu.
pub unsafe fn queue_remote_dpc(cpu_id: usize, dpc: NonNull<Dpc>) {
    if cpu_id == arch::cpu_id() {
        return unsafe { queue_dpc(dpc) };
    }
    crate::smp::mail::mail_to_one(
        cpu_id,
        crate::smp::mail::MailboxEntry::new(remote_dpc_handler, dpc.as_ptr() as *mut ()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bump(_arg: *mut ()) {
        FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn dpc_fires_via_immediate_round_trip() {
        let _world = crate::test_support::world();
        FIRED.store(0, Ordering::SeqCst);

        let mut dpc = Dpc::new(bump, core::ptr::null_mut());
        assert_eq!(current(), RunLevel::Normal);
        unsafe { queue_dpc(NonNull::from(&mut dpc)) };
        // Queued below Dpc level: must have fired before returning.
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(current(), RunLevel::Normal);
    }

    #[test]
    fn dpc_defers_while_at_or_above_dpc_level() {
        let _world = crate::test_support::world();
        FIRED.store(0, Ordering::SeqCst);

        let mut dpc = Dpc::new(bump, core::ptr::null_mut());
        let prev = raise(RunLevel::Dpc);
        unsafe { queue_dpc(NonNull::from(&mut dpc)) };
        assert_eq!(FIRED.load(Ordering::SeqCst), 0);

        lower(prev);
        // Lowering through Dpc drained the queue.
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raise_reports_prior_level() {
        let _world = crate::test_support::world();
        let prev = raise(RunLevel::Clock);
        assert_eq!(prev, RunLevel::Normal);
        assert_eq!(current(), RunLevel::Clock);
        lower(prev);
        assert_eq!(current(), RunLevel::Normal);
    }

    #[test]
    fn apcs_run_only_for_their_target_thread() {
        let _world = crate::test_support::world();
        FIRED.store(0, Ordering::SeqCst);

        let current_id = percpu::current().current_thread().unwrap().id();
        let mut mine = Apc::new(bump, core::ptr::null_mut(), current_id);
        let mut other = Apc::new(bump, core::ptr::null_mut(), current_id + 1);

        let prev = raise(RunLevel::Apc);
        unsafe { queue_apc(NonNull::from(&mut mine)) };
        unsafe { queue_apc(NonNull::from(&mut other)) };
        lower(prev);

        // Only the APC targeting the current thread ran; the other stays
        // queued for its thread.
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(percpu::current().apcs.lock().len(), 1);
    }

    #[test]
    #[should_panic(expected = "Dpc already queued")]
    fn double_queue_asserts() {
        let _world = crate::test_support::world();
        let mut dpc = Dpc::new(bump, core::ptr::null_mut());
        let _prev = raise(RunLevel::Dpc);
        unsafe { queue_dpc(NonNull::from(&mut dpc)) };
        // Second queue of the same record must assert.
        unsafe { queue_dpc(NonNull::from(&mut dpc)) };
    }
}
