//! Clock event queues and timekeeping
//!
//! Each cpu keeps a sorted list of pending expiries where every event's
//! `duration` is the delta from its predecessor, so expiry processing only
//! ever decrements the head. The hardware one-shot alarm is armed to the
//! head's remaining time (clamped to what the hardware can count), and the
//! alarm interrupt queues the DPC of every event that has reached zero.
//!
//! Uptime comes straight from the timestamp counter when it is stable
//! across cpus; otherwise (or when forced by config) a softclock event
//! re-queues itself at a fixed frequency and uptime is its tick count.

use alloc::collections::VecDeque;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::runlevel::{self, Dpc, RunLevel};
use crate::smp::percpu;

/// Expiries processed per alarm dispatch before deferring the remainder to
/// the next pass, to bound time spent at clock level.
const MAX_EXPIRIES_PER_PASS: usize = 256;

const DEFAULT_SOFT_CLOCK_HZ: usize = 100;
const MIN_SOFT_CLOCK_HZ: usize = 10;
const MAX_SOFT_CLOCK_HZ: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// The event is not on this cpu's queue (it may already have fired).
    NotQueued,
    /// Events may only be dequeued from the cpu that queued them.
    ForeignCpu,
}

/// A single scheduled expiry. The embedded duration is interpreted as
/// "nanoseconds after the previous event" once queued.
pub struct ClockEvent {
    dpc: AtomicPtr<Dpc>,
    duration: AtomicU64,
    cpu: AtomicUsize,
    queued: AtomicBool,
}

impl ClockEvent {
    pub const fn new() -> Self {
        Self {
            dpc: AtomicPtr::new(core::ptr::null_mut()),
            duration: AtomicU64::new(0),
            cpu: AtomicUsize::new(usize::MAX),
            queued: AtomicBool::new(false),
        }
    }

    pub fn set_dpc(&self, dpc: NonNull<Dpc>) {
        self.dpc.store(dpc.as_ptr(), Ordering::Release);
    }

    /// Set the expiry, relative to "now" at queue time.
    pub fn set_duration(&self, nanos: u64) {
        self.duration.store(nanos, Ordering::Release);
    }

    fn duration(&self) -> u64 {
        self.duration.load(Ordering::Acquire)
    }
}

struct ClockQueueInner {
    events: VecDeque<NonNull<ClockEvent>>,
    last_refresh: u64,
}

/// Per-cpu expiry list; reached through the cpu's subsystem pointer.
pub struct ClockQueue {
    cpu: usize,
    inner: Mutex<ClockQueueInner>,
}

unsafe impl Send for ClockQueue {}
unsafe impl Sync for ClockQueue {}

static UPTIME_OFFSET: AtomicU64 = AtomicU64::new(0);
static USE_SOFT_CLOCK: AtomicBool = AtomicBool::new(false);
static SOFT_TICKS: AtomicU64 = AtomicU64::new(0);
static SOFT_HZ: AtomicUsize = AtomicUsize::new(DEFAULT_SOFT_CLOCK_HZ);

struct SoftDpcPtr(NonNull<Dpc>);

unsafe impl Send for SoftDpcPtr {}
unsafe impl Sync for SoftDpcPtr {}

static SOFT_DPC: Once<SoftDpcPtr> = Once::new();
static SOFT_EVENT: ClockEvent = ClockEvent::new();

static ALARM_HOOKED: Once<()> = Once::new();

fn soft_clock_tick(_arg: *mut ()) {
    SOFT_TICKS.fetch_add(1, Ordering::Relaxed);

    let period = 1_000_000_000 / SOFT_HZ.load(Ordering::Relaxed) as u64;
    SOFT_EVENT.set_duration(period);
    queue_clock_event(NonNull::from(&SOFT_EVENT));
}

/// Alarm interrupt entry: process this cpu's queue at clock level.
fn clock_irq() {
    let prev = runlevel::ensure(RunLevel::Clock);
    dispatch_alarm();
    runlevel::lower_to(prev);
}

/// Create this cpu's clock queue and, on the first cpu through, pick the
/// uptime strategy.
pub fn init_local_clock_queue(cpu_id: usize) {
    ALARM_HOOKED.call_once(|| arch::set_alarm_handler(clock_irq));

    let queue = crate::mm::wired::wired_new(ClockQueue {
        cpu: cpu_id,
        inner: Mutex::new(ClockQueueInner {
            events: VecDeque::new(),
            last_refresh: arch::timestamp_nanos(),
        }),
    })
    .expect("no wired memory for clock queue");
    percpu::get(cpu_id).set_clock_queue(unsafe { queue.as_ref() });

    let now = arch::timestamp_nanos();
    if UPTIME_OFFSET
        .compare_exchange(0, now, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        crate::info!("Set system uptime offset to {}", now);

        let force_soft = crate::config::get_bool("kernel.clock.force_sw_uptime", false);
        let use_soft = force_soft || !arch::timestamp_stable();
        USE_SOFT_CLOCK.store(use_soft, Ordering::Release);

        if use_soft {
            let hz = crate::config::get_num("kernel.clock.uptime_freq", DEFAULT_SOFT_CLOCK_HZ)
                .clamp(MIN_SOFT_CLOCK_HZ, MAX_SOFT_CLOCK_HZ);
            SOFT_HZ.store(hz, Ordering::Release);

            let dpc = SOFT_DPC.call_once(|| {
                SoftDpcPtr(
                    crate::mm::wired::wired_new(Dpc::new(soft_clock_tick, core::ptr::null_mut()))
                        .expect("no wired memory for softclock dpc"),
                )
            });
            SOFT_EVENT.set_dpc(dpc.0);
            SOFT_EVENT.set_duration(1_000_000_000 / hz as u64);
            queue_clock_event(NonNull::from(&SOFT_EVENT));

            crate::info!("Timestamp source unsuitable for uptime, softclock at {} Hz", hz);
        } else {
            crate::info!("System will use hardware timestamp for uptime");
        }
    }
}

fn local_queue() -> &'static ClockQueue {
    percpu::current()
        .clock_queue()
        .expect("clock queue used before per-cpu init")
}

/// Subtract elapsed time from the head of the queue, clamping events that
/// have already come due to zero.
fn refresh_clock_queue(inner: &mut ClockQueueInner) {
    let now = arch::timestamp_nanos();
    let mut delta = now.saturating_sub(inner.last_refresh);
    inner.last_refresh = now;

    for event in inner.events.iter() {
        if delta == 0 {
            break;
        }
        let event = unsafe { event.as_ref() };
        let remaining = event.duration();
        if delta < remaining {
            event.set_duration(remaining - delta);
            break;
        }
        delta -= remaining;
        event.set_duration(0);
    }
}

/// Queue `event` on the calling cpu, relative to now.
///
/// The event must stay valid until its DPC has been queued or it has been
/// dequeued; its DPC pointer must be set.
pub fn queue_clock_event(event: NonNull<ClockEvent>) {
    let entry = unsafe { event.as_ref() };
    assert!(
        !entry.dpc.load(Ordering::Acquire).is_null(),
        "clock event queued without a DPC"
    );
    let was_queued = entry.queued.swap(true, Ordering::AcqRel);
    assert!(!was_queued, "clock event queued twice");

    let prev = runlevel::ensure(RunLevel::Clock);
    let queue = local_queue();
    entry.cpu.store(queue.cpu, Ordering::Release);

    {
        let mut inner = queue.inner.lock();
        refresh_clock_queue(&mut inner);

        let mut remaining = entry.duration();
        let mut index = 0;
        while index < inner.events.len() {
            let ahead = unsafe { inner.events[index].as_ref() }.duration();
            if ahead > remaining {
                break;
            }
            remaining -= ahead;
            index += 1;
        }

        // The successor's delta shrinks by what we absorb ahead of it.
        if let Some(next) = inner.events.get(index) {
            let next = unsafe { next.as_ref() };
            next.set_duration(next.duration() - remaining);
        }
        entry.set_duration(remaining);
        inner.events.insert(index, event);

        if index == 0 {
            arch::set_alarm(remaining.min(arch::alarm_max()).max(1));
        }
    }

    runlevel::lower_to(prev);
}

/// Remove a pending event from the calling cpu's queue.
pub fn dequeue_clock_event(event: NonNull<ClockEvent>) -> Result<(), ClockError> {
    let entry = unsafe { event.as_ref() };

    let prev = runlevel::ensure(RunLevel::Clock);
    let queue = local_queue();
    let result = (|| {
        if entry.cpu.load(Ordering::Acquire) != queue.cpu {
            // Cross-cpu dequeue is forbidden rather than mailed; the owner
            // of an event dequeues it where it was queued.
            return Err(ClockError::ForeignCpu);
        }

        let mut inner = queue.inner.lock();
        let index = inner
            .events
            .iter()
            .position(|&e| e == event)
            .ok_or(ClockError::NotQueued)?;

        inner.events.remove(index);
        if let Some(next) = inner.events.get(index) {
            let next = unsafe { next.as_ref() };
            next.set_duration(next.duration() + entry.duration());
        }
        entry.queued.store(false, Ordering::Release);
        Ok(())
    })();
    runlevel::lower_to(prev);
    result
}

/// Process due events on the calling cpu and re-arm the alarm. Requires
/// clock level.
pub fn dispatch_alarm() {
    runlevel::assert_at_least(RunLevel::Clock);

    let queue = local_queue();
    let mut inner = queue.inner.lock();
    refresh_clock_queue(&mut inner);

    let mut processed = 0;
    while let Some(&head) = inner.events.front() {
        let entry = unsafe { head.as_ref() };
        if entry.duration() != 0 {
            break;
        }
        if processed == MAX_EXPIRIES_PER_PASS {
            crate::error!("Too many clock events expiring at once, deferring the remainder");
            break;
        }
        processed += 1;

        inner.events.pop_front();
        entry.queued.store(false, Ordering::Release);
        let dpc = NonNull::new(entry.dpc.load(Ordering::Acquire)).expect("queued event lost its DPC");
        // The DPC runs when this cpu lowers below Dpc level.
        unsafe { runlevel::queue_dpc(dpc) };
    }

    if let Some(&head) = inner.events.front() {
        let remaining = unsafe { head.as_ref() }.duration();
        arch::set_alarm(remaining.min(arch::alarm_max()).max(1));
    }
}

/// Nanoseconds since boot.
pub fn uptime_nanos() -> u64 {
    if USE_SOFT_CLOCK.load(Ordering::Acquire) {
        let hz = SOFT_HZ.load(Ordering::Relaxed) as u64;
        return SOFT_TICKS.load(Ordering::Relaxed) * (1_000_000_000 / hz);
    }
    let offset = UPTIME_OFFSET.load(Ordering::Acquire);
    if offset == 0 {
        return 0;
    }
    arch::timestamp_nanos().saturating_sub(offset)
}

pub fn uptime_millis() -> u64 {
    uptime_nanos() / 1_000_000
}

/// Drop any queued events on every cpu. Test isolation only.
#[cfg(test)]
pub fn reset_for_test() {
    for cpu in 0..crate::smp::MAX_CPUS {
        if let Some(queue) = percpu::get(cpu).clock_queue() {
            let mut inner = queue.inner.lock();
            for event in inner.events.drain(..) {
                unsafe { event.as_ref() }.queued.store(false, Ordering::Release);
            }
            inner.last_refresh = arch::timestamp_nanos();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    static ORDER: Mutex<alloc::vec::Vec<usize>> = Mutex::new(alloc::vec::Vec::new());
    static FIRE_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn record(arg: *mut ()) {
        ORDER.lock().push(arg as usize);
        FIRE_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn events_fire_in_expiry_order() {
        let _world = crate::test_support::world();
        ORDER.lock().clear();

        let mut dpc_a = Dpc::new(record, 1 as *mut ());
        let mut dpc_b = Dpc::new(record, 2 as *mut ());
        let event_a = ClockEvent::new();
        let event_b = ClockEvent::new();
        event_a.set_dpc(NonNull::from(&mut dpc_a));
        event_b.set_dpc(NonNull::from(&mut dpc_b));

        // Queue out of order: B at 5ms, A at 2ms.
        event_b.set_duration(5_000_000);
        queue_clock_event(NonNull::from(&event_b));
        event_a.set_duration(2_000_000);
        queue_clock_event(NonNull::from(&event_a));

        arch::advance_time(10_000_000);
        assert_eq!(&*ORDER.lock(), &[1, 2], "earlier expiry fires first");
    }

    #[test]
    fn partial_advance_fires_only_due_events() {
        let _world = crate::test_support::world();
        ORDER.lock().clear();

        let mut dpc_a = Dpc::new(record, 10 as *mut ());
        let mut dpc_b = Dpc::new(record, 20 as *mut ());
        let event_a = ClockEvent::new();
        let event_b = ClockEvent::new();
        event_a.set_dpc(NonNull::from(&mut dpc_a));
        event_b.set_dpc(NonNull::from(&mut dpc_b));

        event_a.set_duration(1_000_000);
        queue_clock_event(NonNull::from(&event_a));
        event_b.set_duration(8_000_000);
        queue_clock_event(NonNull::from(&event_b));

        arch::advance_time(2_000_000);
        assert_eq!(&*ORDER.lock(), &[10]);

        arch::advance_time(10_000_000);
        assert_eq!(&*ORDER.lock(), &[10, 20]);
    }

    #[test]
    fn dequeue_returns_remaining_time_to_successor() {
        let _world = crate::test_support::world();
        ORDER.lock().clear();

        let mut dpc_a = Dpc::new(record, 100 as *mut ());
        let mut dpc_b = Dpc::new(record, 200 as *mut ());
        let event_a = ClockEvent::new();
        let event_b = ClockEvent::new();
        event_a.set_dpc(NonNull::from(&mut dpc_a));
        event_b.set_dpc(NonNull::from(&mut dpc_b));

        event_a.set_duration(3_000_000);
        queue_clock_event(NonNull::from(&event_a));
        event_b.set_duration(6_000_000);
        queue_clock_event(NonNull::from(&event_b));

        dequeue_clock_event(NonNull::from(&event_a)).unwrap();
        // A must not fire; B still fires at its original absolute expiry.
        arch::advance_time(4_000_000);
        assert_eq!(ORDER.lock().len(), 0);
        arch::advance_time(3_000_000);
        assert_eq!(&*ORDER.lock(), &[200]);
    }

    #[test]
    fn dequeue_of_fired_event_reports_not_queued() {
        let _world = crate::test_support::world();
        ORDER.lock().clear();

        let mut dpc = Dpc::new(record, 7 as *mut ());
        let event = ClockEvent::new();
        event.set_dpc(NonNull::from(&mut dpc));
        event.set_duration(1_000_000);
        queue_clock_event(NonNull::from(&event));

        arch::advance_time(2_000_000);
        assert_eq!(
            dequeue_clock_event(NonNull::from(&event)),
            Err(ClockError::NotQueued)
        );
    }
}
