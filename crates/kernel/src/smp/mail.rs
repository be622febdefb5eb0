/// SMP mail: cross-cpu requests delivered by IPI
///
/// Every cpu owns a fixed pool of mailbox entries split across a free list
/// and a pending list, each guarded by a short lock. A sender takes a free
/// entry on the *target* cpu, fills it, moves it to pending and kicks the
/// target with an IPI. The target drains its mailbox at Interrupt level,
/// signalling the optional completion waitable of each entry.
///
/// Two heavier request kinds ride the same interrupt: remote TLB flushes
/// (posted with an acknowledgement counter the originator spins on) and the
/// panic freeze flag, which is checked before anything else so a panicking
/// cpu can park the others.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use super::percpu;
use crate::arch;
use crate::runlevel::{self, RunLevel};
use crate::wait::Waitable;

pub const MAILBOX_ENTRIES: usize = 32;

/// Cycles spun between stall warnings while waiting for freeze acks.
const PANIC_WAIT_CYCLES: usize = 0x80_0000;

pub type MailFn = fn(*mut ());

#[derive(Clone, Copy)]
pub struct MailboxEntry {
    func: Option<MailFn>,
    arg: *mut (),
    on_complete: Option<NonNull<Waitable>>,
}

impl MailboxEntry {
    pub const fn empty() -> Self {
        Self {
            func: None,
            arg: core::ptr::null_mut(),
            on_complete: None,
        }
    }

    pub fn new(func: MailFn, arg: *mut ()) -> Self {
        Self {
            func: Some(func),
            arg,
            on_complete: None,
        }
    }

    /// Attach a waitable signalled once the entry has run on the target.
    /// The caller must keep the waitable alive until then.
    pub fn with_completion(mut self, waitable: &Waitable) -> Self {
        self.on_complete = NonNull::new(waitable as *const _ as *mut Waitable);
        self
    }
}

/// A posted remote-flush request. Lives on the originator's stack; targets
/// decrement `acks` after flushing and the originator spins on zero.
pub struct FlushRequest {
    pub base: usize,
    pub length: usize,
    acks: AtomicUsize,
}

/// Per-cpu cross-cpu request state, embedded in the `CpuLocal` block.
pub struct SmpControl {
    pub(crate) remote_panic: AtomicBool,
    entries: [UnsafeCell<MailboxEntry>; MAILBOX_ENTRIES],
    free: Mutex<VecDeque<usize>>,
    pending: Mutex<VecDeque<usize>>,
    shootdowns: Mutex<VecDeque<NonNull<FlushRequest>>>,
    initialized: AtomicBool,
}

unsafe impl Send for SmpControl {}
unsafe impl Sync for SmpControl {}

impl SmpControl {
    const ENTRY_INIT: UnsafeCell<MailboxEntry> = UnsafeCell::new(MailboxEntry::empty());

    pub const fn new() -> Self {
        Self {
            remote_panic: AtomicBool::new(false),
            entries: [Self::ENTRY_INIT; MAILBOX_ENTRIES],
            free: Mutex::new(VecDeque::new()),
            pending: Mutex::new(VecDeque::new()),
            shootdowns: Mutex::new(VecDeque::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn ensure_init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut free = self.free.lock();
        free.extend(0..MAILBOX_ENTRIES);
    }

    #[cfg(test)]
    pub(crate) fn reset_for_test(&self) {
        self.remote_panic.store(false, Ordering::Release);
        self.shootdowns.lock().clear();
        if self.initialized.load(Ordering::Acquire) {
            let mut pending = self.pending.lock();
            let mut free = self.free.lock();
            while let Some(slot) = pending.pop_front() {
                free.push_back(slot);
            }
        }
    }
}

/// Prepare this cpu's mailbox; called from per-cpu init.
pub fn init_mailbox(cpu_id: usize) {
    percpu::get(cpu_id).smp.ensure_init();
}

/// Post `mail` to one cpu. Returns false if the target's pool was exhausted.
pub fn mail_to_one(target: usize, mail: MailboxEntry) -> bool {
    mail_to_many(&[target], mail) == 0
}

/// Post `mail` to several cpus, returning the number of targets whose pool
/// was exhausted.
pub fn mail_to_many(targets: &[usize], mail: MailboxEntry) -> usize {
    let mut fail_count = 0;
    let mut self_mail = false;

    for &target in targets {
        let control = &percpu::get(target).smp;
        control.ensure_init();

        let slot = control.free.lock().pop_front();
        let Some(slot) = slot else {
            fail_count += 1;
            continue;
        };

        unsafe { *control.entries[slot].get() = mail };
        control.pending.lock().push_back(slot);

        if target == arch::cpu_id() {
            self_mail = true;
        } else {
            arch::send_ipi(target);
        }
    }

    if self_mail {
        let prev = runlevel::ensure(RunLevel::Interrupt);
        dispatch_ipi();
        runlevel::lower_to(prev);
    }

    if fail_count != 0 {
        crate::warn!("SMP mail: {} target mailbox pools exhausted", fail_count);
    }
    fail_count
}

/// Post `mail` to the cpus set in `who` (bit N = cpu N).
pub fn mail_to_set(who: usize, mail: MailboxEntry) -> usize {
    let mut ids = [0usize; super::MAX_CPUS];
    let mut count = 0;
    for cpu in 0..super::MAX_CPUS {
        if who & (1 << cpu) != 0 {
            ids[count] = cpu;
            count += 1;
        }
    }
    mail_to_many(&ids[..count], mail)
}

/// Post `mail` to every online cpu, optionally including the caller.
pub fn mail_to_all(mail: MailboxEntry, include_self: bool) -> usize {
    let mut fail_count = 0;
    for cpu in super::online_cpus() {
        if cpu == arch::cpu_id() && !include_self {
            continue;
        }
        if !mail_to_one(cpu, mail) {
            fail_count += 1;
        }
    }
    fail_count
}

/// IPI entry point, reached at Interrupt level. Checks the panic flag, then
/// drains mail and remote-flush requests.
pub fn dispatch_ipi() {
    runlevel::assert_at_least(RunLevel::Interrupt);

    let cpu = percpu::current();
    let control = &cpu.smp;

    if control.remote_panic.load(Ordering::Acquire) {
        PENDING_PANICS.fetch_and(!(1 << arch::cpu_id()), Ordering::AcqRel);
        #[cfg(target_os = "none")]
        arch::halt();
        #[cfg(not(target_os = "none"))]
        return;
    }

    loop {
        let slot = control.pending.lock().pop_front();
        let Some(slot) = slot else { break };

        let entry = unsafe { *control.entries[slot].get() };
        if let Some(func) = entry.func {
            func(entry.arg);
        }
        if let Some(on_complete) = entry.on_complete {
            unsafe { on_complete.as_ref() }.signal(1);
        }

        control.free.lock().push_back(slot);
    }

    loop {
        let request = control.shootdowns.lock().pop_front();
        let Some(request) = request else { break };

        let request = unsafe { request.as_ref() };
        let mut vaddr = request.base;
        let top = request.base + request.length;
        while vaddr < top {
            arch::flush_local_entry(vaddr);
            vaddr += arch::PAGE_SIZE;
        }
        request.acks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Flush `[base, base+length)` on every other online cpu and wait for all
/// acknowledgements.
pub fn request_remote_flush(base: usize, length: usize) {
    let self_id = arch::cpu_id();
    let mut targets = [0usize; super::MAX_CPUS];
    let mut count = 0;
    for cpu in super::online_cpus() {
        if cpu != self_id {
            targets[count] = cpu;
            count += 1;
        }
    }
    if count == 0 {
        return;
    }

    let request = FlushRequest {
        base,
        length,
        acks: AtomicUsize::new(count),
    };
    for &target in &targets[..count] {
        percpu::get(target)
            .smp
            .shootdowns
            .lock()
            .push_back(NonNull::from(&request));
        arch::send_ipi(target);
    }

    #[cfg(not(target_os = "none"))]
    simulate_ipi_delivery(&targets[..count]);

    while request.acks.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
}

static PENDING_PANICS: AtomicUsize = AtomicUsize::new(0);

/// Park every other cpu. Used by the panic path; returns once all online
/// cpus have acknowledged the freeze.
pub fn freeze_all_cpus() {
    let self_id = arch::cpu_id();
    let mut mask = 0usize;
    let mut frozen = [0usize; super::MAX_CPUS];
    let mut count = 0;
    for cpu in super::online_cpus() {
        if cpu == self_id {
            continue;
        }
        mask |= 1 << cpu;
        frozen[count] = cpu;
        count += 1;
    }
    PENDING_PANICS.store(mask, Ordering::Release);

    for &cpu in &frozen[..count] {
        percpu::get(cpu).smp.remote_panic.store(true, Ordering::Release);
        arch::send_ipi(cpu);
    }

    #[cfg(not(target_os = "none"))]
    simulate_ipi_delivery(&frozen[..count]);

    while PENDING_PANICS.load(Ordering::Acquire) != 0 {
        for _ in 0..PANIC_WAIT_CYCLES {
            core::hint::spin_loop();
        }
        crate::info!(
            "Panic sequence stalled, waiting on other cpus to ack: {:#x}",
            PENDING_PANICS.load(Ordering::Relaxed)
        );
    }
}

/// Hosted stand-in for hardware IPI delivery: run each target cpu's
/// interrupt dispatch on this thread.
#[cfg(not(target_os = "none"))]
pub fn simulate_ipi_delivery(targets: &[usize]) {
    let home = arch::cpu_id();
    for &target in targets {
        arch::set_cpu_id(target);
        let prev = runlevel::ensure(RunLevel::Interrupt);
        dispatch_ipi();
        runlevel::lower_to(prev);
    }
    arch::set_cpu_id(home);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static RAN_ON: AtomicUsize = AtomicUsize::new(usize::MAX);

    fn record_cpu(_arg: *mut ()) {
        RAN_ON.store(arch::cpu_id(), Ordering::SeqCst);
    }

    #[test]
    fn self_mail_runs_immediately() {
        let _world = crate::test_support::world();
        RAN_ON.store(usize::MAX, Ordering::SeqCst);

        assert!(mail_to_one(0, MailboxEntry::new(record_cpu, core::ptr::null_mut())));
        assert_eq!(RAN_ON.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remote_mail_waits_for_delivery() {
        let _world = crate::test_support::world();
        crate::smp::mark_cpu_online(1);
        init_mailbox(1);
        RAN_ON.store(usize::MAX, Ordering::SeqCst);

        let ipis_before = arch::ipi_count(1);
        assert!(mail_to_one(1, MailboxEntry::new(record_cpu, core::ptr::null_mut())));
        // Not executed until the target takes the interrupt.
        assert_eq!(RAN_ON.load(Ordering::SeqCst), usize::MAX);
        assert_eq!(arch::ipi_count(1), ipis_before + 1);

        simulate_ipi_delivery(&[1]);
        assert_eq!(RAN_ON.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_exhaustion_reports_fail_count() {
        let _world = crate::test_support::world();
        crate::smp::mark_cpu_online(2);
        init_mailbox(2);

        let mail = MailboxEntry::new(record_cpu, core::ptr::null_mut());
        for _ in 0..MAILBOX_ENTRIES {
            assert_eq!(mail_to_many(&[2], mail), 0);
        }
        // Pool drained; the next post must fail without blocking.
        assert_eq!(mail_to_many(&[2], mail), 1);

        simulate_ipi_delivery(&[2]);
        assert_eq!(mail_to_many(&[2], mail), 0);
        simulate_ipi_delivery(&[2]);
    }

    #[test]
    fn remote_flush_acks_drain() {
        let _world = crate::test_support::world();
        crate::smp::mark_cpu_online(1);
        init_mailbox(1);

        // Returns only once every target acknowledged; hosted delivery is
        // inline so this simply must not wedge.
        request_remote_flush(0xffff_8000_0000_0000, 4 * arch::PAGE_SIZE);
    }

    #[test]
    fn freeze_parks_other_cpus() {
        let _world = crate::test_support::world();
        crate::smp::mark_cpu_online(1);
        crate::smp::mark_cpu_online(3);

        freeze_all_cpus();
        assert!(percpu::get(1).smp.remote_panic.load(Ordering::Relaxed));
        assert!(percpu::get(3).smp.remote_panic.load(Ordering::Relaxed));
        assert_eq!(PENDING_PANICS.load(Ordering::Relaxed), 0);
    }
}
