//! Waitable objects
//!
//! Conditions, timers, and mutexes share one wait/signal protocol. A wait
//! builds its bookkeeping (a `WaitControl` and one `WaitEntry` per object)
//! on the caller's stack, queues an optional timeout clock event, and loops:
//! lock every waited object in address order, try to finish, otherwise
//! park the thread on each object's waiter queue and yield. Signals,
//! timeouts, and cancellation all just make the thread runnable again; the
//! next pass of the loop observes why.
//!
//! Before the stack frame dies, an armed timeout event is dequeued. If the
//! dequeue fails because the event already fired, the waiter spins until
//! the timeout DPC has finished touching the control block.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, MutexGuard};

use crate::runlevel::{self, Dpc, RunLevel};
use crate::sched::{self, Thread, ThreadState};
use crate::time::{self, ClockEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitableKind {
    Condition,
    Timer,
    Mutex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever.
    Infinite,
    /// Do not block; report Timeout if the wait cannot finish now.
    Poll,
    /// Give up after this many nanoseconds.
    Nanos(u64),
}

struct WaitableInner {
    count: usize,
    max_count: usize,
    /// Parked waiters, oldest first. Entries live on waiter stacks and are
    /// unlinked by their owners before those stacks unwind.
    waiters: Vec<NonNull<WaitEntry>>,
    /// Mutex kind only: the thread currently holding the lock.
    owner: Option<usize>,
}

pub struct Waitable {
    kind: WaitableKind,
    inner: Mutex<WaitableInner>,
}

unsafe impl Send for Waitable {}
unsafe impl Sync for Waitable {}

/// One (thread, waitable) pair of an in-flight wait.
pub struct WaitEntry {
    control: *mut WaitControl,
    satisfied: AtomicBool,
}

unsafe impl Send for WaitEntry {}
unsafe impl Sync for WaitEntry {}

impl WaitEntry {
    pub const fn new() -> Self {
        Self {
            control: core::ptr::null_mut(),
            satisfied: AtomicBool::new(false),
        }
    }

    pub fn satisfied(&self) -> bool {
        self.satisfied.load(Ordering::Acquire)
    }
}

/// Per-wait-operation state, stack-resident in the waiter.
pub struct WaitControl {
    thread: Arc<Thread>,
    wake_priority: usize,
    timeout_dpc: Dpc,
    timeout_event: ClockEvent,
    timed_out: AtomicBool,
    cancelled: AtomicBool,
}

fn handle_wait_timeout(arg: *mut ()) {
    let control = unsafe { &*(arg as *const WaitControl) };
    control.timed_out.store(true, Ordering::Release);
    if !control.thread.is_active() {
        sched::enqueue(&control.thread, control.wake_priority);
    }
}

impl Waitable {
    pub const fn new(kind: WaitableKind, initial_count: usize, max_count: usize) -> Self {
        Self {
            kind,
            inner: Mutex::new(WaitableInner {
                count: initial_count,
                max_count,
                waiters: Vec::new(),
                owner: None,
            }),
        }
    }

    /// A condition with no tickets; signalling releases waiters.
    pub const fn new_condition() -> Self {
        Self::new(WaitableKind::Condition, 0, usize::MAX)
    }

    pub fn kind(&self) -> WaitableKind {
        self.kind
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// Release `amount` tickets (clamped to `max_count`) and wake waiters
    /// that may now be able to finish. Returns how many threads were made
    /// runnable.
    pub fn signal(&self, amount: usize) -> usize {
        let prev = runlevel::ensure(RunLevel::Dpc);
        let waker_priority = percpu_wake_priority();

        let mut woken = 0;
        {
            let mut inner = self.inner.lock();
            inner.count = inner.count.saturating_add(amount).min(inner.max_count);

            // Wake from the front of the queue, at most one thread per
            // available ticket. A woken waitAll waiter that still cannot
            // finish simply re-parks.
            let budget = inner.count;
            for &entry in inner.waiters.iter() {
                if woken == budget {
                    break;
                }
                let control = unsafe { &*entry.as_ref().control };
                if control.thread.is_active() {
                    continue;
                }
                // Temporary boost: enqueue at the signaller's priority so
                // the wake is not starved behind it; decays on the next
                // quantum when the thread re-enqueues at its base.
                let priority = control.wake_priority.max(waker_priority);
                sched::enqueue(&control.thread, priority);
                woken += 1;
            }
        }

        runlevel::lower_to(prev);
        woken
    }

    /// Reconfigure counts; any now-satisfiable waiters are woken.
    pub fn reset(&self, initial_count: usize, new_max_count: usize) {
        let prev = runlevel::ensure(RunLevel::Dpc);
        {
            let mut inner = self.inner.lock();
            inner.count = initial_count.min(new_max_count);
            inner.max_count = new_max_count;
        }
        runlevel::lower_to(prev);
        if initial_count > 0 {
            self.signal(0);
        }
    }
}

fn percpu_wake_priority() -> usize {
    crate::smp::percpu::current()
        .current_thread()
        .map(|t| t.priority())
        .unwrap_or(0)
}

fn try_finish(
    guards: &mut [MutexGuard<'_, WaitableInner>],
    entries: &mut [WaitEntry],
    wait_all: bool,
    control: &WaitControl,
) -> Option<WaitResult> {
    if control.timed_out.load(Ordering::Acquire) {
        return Some(WaitResult::Timeout);
    }
    if control.cancelled.load(Ordering::Acquire) {
        return Some(WaitResult::Cancelled);
    }

    let ready = guards.iter().filter(|g| g.count > 0).count();

    if !wait_all {
        if ready == 0 {
            return None;
        }
        for (guard, entry) in guards.iter_mut().zip(entries.iter_mut()) {
            if guard.count > 0 {
                guard.count -= 1;
                entry.satisfied.store(true, Ordering::Release);
                break;
            }
        }
        return Some(WaitResult::Success);
    }

    if ready != guards.len() {
        return None;
    }
    for (guard, entry) in guards.iter_mut().zip(entries.iter_mut()) {
        guard.count -= 1;
        entry.satisfied.store(true, Ordering::Release);
    }
    Some(WaitResult::Success)
}

/// Wait on one object. `entry` reports per-object satisfaction.
pub fn wait_one(waitable: &Waitable, entry: &mut WaitEntry, timeout: Timeout) -> WaitResult {
    wait_many(&[waitable], core::slice::from_mut(entry), timeout, false)
}

/// Wait on several objects, either for any one of them or for all at once.
pub fn wait_many(
    waitables: &[&Waitable],
    entries: &mut [WaitEntry],
    timeout: Timeout,
    wait_all: bool,
) -> WaitResult {
    assert_eq!(waitables.len(), entries.len());
    assert!(!waitables.is_empty());

    let thread = crate::smp::percpu::current()
        .current_thread()
        .expect("wait_many without a current thread");

    let mut control = WaitControl {
        wake_priority: thread.priority(),
        thread,
        timeout_dpc: Dpc::new(handle_wait_timeout, core::ptr::null_mut()),
        timeout_event: ClockEvent::new(),
        timed_out: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
    };
    let control_ptr = &mut control as *mut WaitControl;
    control.timeout_dpc.set_arg(control_ptr as *mut ());
    control
        .timeout_event
        .set_dpc(NonNull::from(&control.timeout_dpc));
    control.thread.set_wait_control(control_ptr);

    for entry in entries.iter_mut() {
        entry.control = control_ptr;
        entry.satisfied.store(false, Ordering::Release);
    }

    // Address-ordered lock acquisition below requires distinct objects.
    let mut order: Vec<usize> = (0..waitables.len()).collect();
    order.sort_by_key(|&i| waitables[i] as *const Waitable as usize);
    for pair in order.windows(2) {
        assert!(
            !core::ptr::eq(waitables[pair[0]], waitables[pair[1]]),
            "the same waitable appears twice in one wait"
        );
    }

    let has_timeout = match timeout {
        Timeout::Nanos(nanos) if nanos > 0 => {
            control.timeout_event.set_duration(nanos);
            time::queue_clock_event(NonNull::from(&control.timeout_event));
            true
        }
        _ => false,
    };
    // A zero-length timeout is a poll by definition.
    let polling = matches!(timeout, Timeout::Poll | Timeout::Nanos(0));

    let mut in_queues = false;
    loop {
        let prev = runlevel::ensure(RunLevel::Dpc);

        // Lock every waited object, lowest address first, and index the
        // guards back by argument position.
        let mut guards: Vec<Option<MutexGuard<'_, WaitableInner>>> =
            waitables.iter().map(|_| None).collect();
        for &index in &order {
            guards[index] = Some(waitables[index].inner.lock());
        }
        let mut guards: Vec<MutexGuard<'_, WaitableInner>> =
            guards.into_iter().map(|g| g.unwrap()).collect();

        if in_queues {
            for (guard, entry) in guards.iter_mut().zip(entries.iter()) {
                let target = entry as *const WaitEntry;
                guard.waiters.retain(|&e| e.as_ptr().cast_const() != target);
            }
            in_queues = false;
        }

        let result = try_finish(&mut guards, entries, wait_all, &control);
        if result.is_some() || polling {
            drop(guards);
            runlevel::lower_to(prev);

            if has_timeout && !control.timed_out.load(Ordering::Acquire) {
                if time::dequeue_clock_event(NonNull::from(&control.timeout_event)).is_err() {
                    // The event already fired; its DPC owns the control
                    // block until `timed_out` settles.
                    settle_timeout(&control);
                }
            }

            control.thread.set_wait_control(core::ptr::null_mut());
            return result.unwrap_or(WaitResult::Timeout);
        }

        // Park: entry on every queue, thread off the run queues.
        for (guard, entry) in guards.iter_mut().zip(entries.iter_mut()) {
            guard.waiters.push(NonNull::from(&mut *entry));
        }
        in_queues = true;

        control.thread.set_state(ThreadState::Waiting);
        sched::dequeue(&control.thread);
        drop(guards);
        runlevel::lower_to(prev);

        sched::yield_now();
    }
}

/// Busy-wait for a fired timeout DPC to finish with the control block.
fn settle_timeout(control: &WaitControl) {
    while !control.timed_out.load(Ordering::Acquire) {
        // The DPC is pending on this cpu; give it a chance to run.
        let prev = runlevel::ensure(RunLevel::Dpc);
        runlevel::poll_local_dpcs();
        runlevel::lower_to(prev);
        core::hint::spin_loop();
    }
}

/// Abort `thread`'s in-flight wait. Legal at or below Dpc level; a no-op
/// if the thread is not waiting (or was already satisfied).
pub fn cancel_wait(thread: &Arc<Thread>) {
    runlevel::assert_at_most(RunLevel::Dpc);
    let prev = runlevel::ensure(RunLevel::Dpc);

    let control = thread.wait_control();
    if !control.is_null() {
        let control = unsafe { &*control };
        control.cancelled.store(true, Ordering::Release);
        if !control.thread.is_active() {
            sched::enqueue(&control.thread, control.wake_priority);
        }
    }

    runlevel::lower_to(prev);
}

/// A waitable timer: arming schedules a clock event whose expiry signals
/// the embedded condition.
pub struct WaitableTimer {
    waitable: Waitable,
    event: ClockEvent,
    dpc: Dpc,
}

fn timer_fired(arg: *mut ()) {
    let timer = unsafe { &*(arg as *const WaitableTimer) };
    timer.waitable.signal(1);
}

impl WaitableTimer {
    pub fn new() -> Self {
        Self {
            waitable: Waitable::new(WaitableKind::Timer, 0, usize::MAX),
            event: ClockEvent::new(),
            dpc: Dpc::new(timer_fired, core::ptr::null_mut()),
        }
    }

    pub fn waitable(&self) -> &Waitable {
        &self.waitable
    }

    /// Schedule the timer `nanos` from now. The timer must not move while
    /// armed; re-arming a pending timer asserts in the clock queue.
    pub fn arm(&mut self, nanos: u64) {
        self.dpc.set_arg(self as *const WaitableTimer as *mut ());
        self.event.set_dpc(NonNull::from(&self.dpc));
        self.event.set_duration(nanos);
        time::queue_clock_event(NonNull::from(&self.event));
    }

    pub fn disarm(&self) -> bool {
        time::dequeue_clock_event(NonNull::from(&self.event)).is_ok()
    }
}

/// A blocking mutex built on the wait protocol; one ticket, owner tracked.
pub struct WaitMutex {
    waitable: Waitable,
}

impl WaitMutex {
    pub const fn new() -> Self {
        Self {
            waitable: Waitable::new(WaitableKind::Mutex, 1, 1),
        }
    }

    pub fn lock(&self) {
        let mut entry = WaitEntry::new();
        let result = wait_one(&self.waitable, &mut entry, Timeout::Infinite);
        assert_eq!(result, WaitResult::Success);
        self.note_owner();
    }

    /// Non-blocking attempt; true on acquisition.
    pub fn try_lock(&self) -> bool {
        let mut entry = WaitEntry::new();
        if wait_one(&self.waitable, &mut entry, Timeout::Poll) == WaitResult::Success {
            self.note_owner();
            return true;
        }
        false
    }

    fn note_owner(&self) {
        let owner = crate::smp::percpu::current()
            .current_thread()
            .map(|t| t.id());
        self.waitable.inner.lock().owner = owner;
    }

    pub fn unlock(&self) {
        {
            let mut inner = self.waitable.inner.lock();
            let current = crate::smp::percpu::current()
                .current_thread()
                .map(|t| t.id());
            assert_eq!(inner.owner, current, "mutex unlocked by a non-owner");
            inner.owner = None;
        }
        self.waitable.signal(1);
    }

    pub fn holder(&self) -> Option<usize> {
        self.waitable.inner.lock().owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Schedules `f(arg)` as a DPC behind a clock event `nanos` from now;
    /// the hosted wait loop delivers it while the waiter is parked.
    struct DeferredCall {
        dpc: Dpc,
        event: ClockEvent,
    }

    impl DeferredCall {
        fn new(f: crate::runlevel::DeferredFn, arg: *mut ()) -> Self {
            Self {
                dpc: Dpc::new(f, arg),
                event: ClockEvent::new(),
            }
        }

        fn schedule(&mut self, nanos: u64) {
            self.event.set_dpc(NonNull::from(&self.dpc));
            self.event.set_duration(nanos);
            time::queue_clock_event(NonNull::from(&self.event));
        }
    }

    fn signal_one(arg: *mut ()) {
        let waitable = unsafe { &*(arg as *const Waitable) };
        waitable.signal(1);
    }

    fn cancel_current_wait(arg: *mut ()) {
        let thread = unsafe { &*(arg as *const Arc<Thread>) };
        cancel_wait(thread);
    }

    #[test]
    fn poll_on_empty_condition_times_out() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();
        let mut entry = WaitEntry::new();
        assert_eq!(wait_one(&cond, &mut entry, Timeout::Poll), WaitResult::Timeout);
        assert!(!entry.satisfied());
    }

    #[test]
    fn signalled_tickets_satisfy_exactly_that_many_waits() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();
        cond.signal(2);

        for _ in 0..2 {
            let mut entry = WaitEntry::new();
            assert_eq!(wait_one(&cond, &mut entry, Timeout::Poll), WaitResult::Success);
            assert!(entry.satisfied());
        }
        // Third consumer: no ticket left without another signal.
        let mut entry = WaitEntry::new();
        assert_eq!(wait_one(&cond, &mut entry, Timeout::Poll), WaitResult::Timeout);
    }

    #[test]
    fn wait_times_out_after_requested_interval() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();

        let before = crate::arch::timestamp_nanos();
        let mut entry = WaitEntry::new();
        let result = wait_one(&cond, &mut entry, Timeout::Nanos(10_000_000));
        let elapsed = crate::arch::timestamp_nanos() - before;

        assert_eq!(result, WaitResult::Timeout);
        assert!(elapsed >= 10_000_000, "woke early: {}ns", elapsed);
        assert!(elapsed < 11_000_000, "woke late: {}ns", elapsed);
    }

    #[test]
    fn wait_all_needs_every_ticket() {
        let _world = crate::test_support::world();
        let c1 = Waitable::new_condition();
        let c2 = Waitable::new_condition();

        // Another context signals c1 then c2 while we block.
        let mut first = DeferredCall::new(signal_one, &c1 as *const Waitable as *mut ());
        let mut second = DeferredCall::new(signal_one, &c2 as *const Waitable as *mut ());
        first.schedule(1_000_000);
        second.schedule(2_000_000);

        let mut entries = [WaitEntry::new(), WaitEntry::new()];
        let result = wait_many(&[&c1, &c2], &mut entries, Timeout::Infinite, true);

        assert_eq!(result, WaitResult::Success);
        assert!(entries[0].satisfied() && entries[1].satisfied());
        assert_eq!(c1.count(), 0, "waitAll consumed one ticket from each");
        assert_eq!(c2.count(), 0);
    }

    #[test]
    fn wait_any_consumes_a_single_ticket() {
        let _world = crate::test_support::world();
        let c1 = Waitable::new_condition();
        let c2 = Waitable::new_condition();
        c1.signal(1);
        c2.signal(1);

        let mut entries = [WaitEntry::new(), WaitEntry::new()];
        let result = wait_many(&[&c1, &c2], &mut entries, Timeout::Poll, false);

        assert_eq!(result, WaitResult::Success);
        let satisfied = entries.iter().filter(|e| e.satisfied()).count();
        assert_eq!(satisfied, 1);
        assert_eq!(c1.count() + c2.count(), 1, "only one ticket consumed");
    }

    #[test]
    fn blocked_waiter_wakes_on_signal() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();

        let mut wake = DeferredCall::new(signal_one, &cond as *const Waitable as *mut ());
        wake.schedule(3_000_000);

        let mut entry = WaitEntry::new();
        let result = wait_one(&cond, &mut entry, Timeout::Nanos(50_000_000));
        assert_eq!(result, WaitResult::Success);
        assert!(entry.satisfied());
        assert_eq!(cond.count(), 0);
    }

    #[test]
    fn cancellation_wakes_with_cancelled() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();
        let thread = crate::smp::percpu::current().current_thread().unwrap();

        let mut cancel = DeferredCall::new(
            cancel_current_wait,
            &thread as *const Arc<Thread> as *mut (),
        );
        cancel.schedule(2_000_000);

        let mut entry = WaitEntry::new();
        let result = wait_one(&cond, &mut entry, Timeout::Infinite);
        assert_eq!(result, WaitResult::Cancelled);
        assert!(!entry.satisfied());
    }

    #[test]
    fn timer_signals_its_condition_on_expiry() {
        let _world = crate::test_support::world();
        let mut timer = WaitableTimer::new();
        timer.arm(4_000_000);

        let mut entry = WaitEntry::new();
        let result = wait_one(timer.waitable(), &mut entry, Timeout::Nanos(100_000_000));
        assert_eq!(result, WaitResult::Success);
    }

    #[test]
    fn mutex_tracks_owner_and_excludes() {
        let _world = crate::test_support::world();
        let mutex = WaitMutex::new();
        let me = crate::smp::percpu::current().current_thread().unwrap().id();

        mutex.lock();
        assert_eq!(mutex.holder(), Some(me));
        assert!(!mutex.try_lock(), "held mutex must not double-acquire");
        mutex.unlock();
        assert_eq!(mutex.holder(), None);
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn reset_reloads_tickets() {
        let _world = crate::test_support::world();
        let cond = Waitable::new_condition();
        cond.reset(3, 4);
        assert_eq!(cond.count(), 3);

        // Clamped by the new maximum.
        cond.signal(10);
        assert_eq!(cond.count(), 4);
    }
}

