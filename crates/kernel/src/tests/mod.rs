//! Cross-subsystem scenarios
//!
//! Unit tests live next to their modules; the tests here cut across the
//! executive: mail plus waitables, run-level gates over the wired heap,
//! and clock-driven uptime.

#![cfg(test)]

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::runlevel::{self, Dpc, RunLevel};
use crate::sched::Scheduler;
use crate::smp::mail::{self, MailboxEntry};
use crate::time::ClockEvent;
use crate::wait::{wait_one, Timeout, WaitEntry, WaitResult, Waitable};

static REMOTE_RAN: AtomicBool = AtomicBool::new(false);

fn remote_work(_arg: *mut ()) {
    assert_eq!(arch::cpu_id(), 1, "mail must execute on its target cpu");
    REMOTE_RAN.store(true, Ordering::SeqCst);
}

fn deliver_to_cpu1(_arg: *mut ()) {
    mail::simulate_ipi_delivery(&[1]);
}

#[test]
fn remote_dpc_completion_wakes_waiter() {
    let _world = crate::test_support::world();
    crate::smp::mark_cpu_online(1);
    mail::init_mailbox(1);
    if crate::smp::percpu::get(1).scheduler().is_none() {
        Scheduler::init(1);
    }
    REMOTE_RAN.store(false, Ordering::SeqCst);

    // Cpu 0 posts work to cpu 1 with a completion waitable attached.
    let done = Waitable::new_condition();
    assert!(mail::mail_to_one(
        1,
        MailboxEntry::new(remote_work, core::ptr::null_mut()).with_completion(&done),
    ));
    assert!(!REMOTE_RAN.load(Ordering::SeqCst), "runs only on delivery");

    // "Cpu 1 takes the IPI" a millisecond from now.
    let dpc = Dpc::new(deliver_to_cpu1, core::ptr::null_mut());
    let event = ClockEvent::new();
    event.set_dpc(NonNull::from(&dpc));
    event.set_duration(1_000_000);
    crate::time::queue_clock_event(NonNull::from(&event));

    let mut entry = WaitEntry::new();
    let result = wait_one(&done, &mut entry, Timeout::Nanos(100_000_000));
    assert_eq!(result, WaitResult::Success);
    assert!(REMOTE_RAN.load(Ordering::SeqCst));
}

#[test]
#[should_panic(expected = "requires run level")]
fn wired_alloc_is_gated_below_dpc() {
    let _world = crate::test_support::world();
    let _prev = runlevel::raise(RunLevel::Dpc);
    // Wired allocation is a Normal-level operation; this must assert.
    let _ = crate::mm::wired::wired_alloc(64);
}

#[test]
fn uptime_follows_the_hosted_clock() {
    let _world = crate::test_support::world();
    let before = crate::time::uptime_nanos();
    arch::advance_time(5_000_000);
    let after = crate::time::uptime_nanos();
    assert_eq!(after - before, 5_000_000);
}

#[test]
fn kernel_fault_outside_ranges_panics() {
    let _world = crate::test_support::world();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        crate::mm::vmm::kernel_space().handle_fault(
            0xFFFF_FFFF_DEAD_0000,
            crate::mm::vmm::VmFaultFlags::empty(),
        )
    }));
    assert!(result.is_err(), "kernel-address fault must panic");
}
