//! Kernel logging
//!
//! The producer side is lock-free: a log call takes a preallocated item from
//! the free queue, formats into its fixed buffer, and pushes it onto the
//! pending queue. While `SELF_DRAIN` is set (from boot until the log worker
//! thread takes over) the producer then makes a best-effort pass at writing
//! out up to `MAX_SELF_DRAIN` pending items, guarded by a try-lock so one
//! cpu never spins on another's writeout.
//!
//! Sinks are registered at runtime and written in registration order under
//! the writeout lock.

pub mod sinks;

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

use crate::lib::queue::MpscIndexQueue;

const LOG_ITEMS: usize = 128;
const MAX_LOG_LEN: usize = 128;
const MAX_SELF_DRAIN: usize = 64;
const MAX_SINKS: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// One formatted message as presented to sinks.
pub struct LogMessage<'a> {
    pub level: LogLevel,
    pub cpu: usize,
    pub timestamp_nanos: u64,
    pub text: &'a str,
}

/// A log output. Implementations must not log from inside `write`.
pub trait LogSink: Sync {
    /// Bring the device to a known state; called on registration.
    fn reset(&self) {}
    fn write(&self, msg: &LogMessage);
    /// The panic path is about to emit its dump through this sink.
    fn begin_panic(&self) {}
}

struct LogItem {
    level: UnsafeCell<LogLevel>,
    cpu: UnsafeCell<usize>,
    timestamp: UnsafeCell<u64>,
    len: UnsafeCell<usize>,
    text: UnsafeCell<[u8; MAX_LOG_LEN]>,
}

unsafe impl Sync for LogItem {}

impl LogItem {
    const fn new() -> Self {
        Self {
            level: UnsafeCell::new(LogLevel::Info),
            cpu: UnsafeCell::new(0),
            timestamp: UnsafeCell::new(0),
            len: UnsafeCell::new(0),
            text: UnsafeCell::new([0; MAX_LOG_LEN]),
        }
    }
}

const ITEM_INIT: LogItem = LogItem::new();
static ITEMS: [LogItem; LOG_ITEMS] = [ITEM_INIT; LOG_ITEMS];

static FREE: MpscIndexQueue<LOG_ITEMS> = MpscIndexQueue::new();
static PENDING: MpscIndexQueue<LOG_ITEMS> = MpscIndexQueue::new();
static FREE_PRIMED: AtomicBool = AtomicBool::new(false);

/// Set until the log worker thread assumes drain responsibility.
static SELF_DRAIN: AtomicBool = AtomicBool::new(true);

/// Messages dropped because the item pool was empty.
static LOST_COUNT: AtomicU64 = AtomicU64::new(0);

/// Global level filter (default Info).
static LOG_FILTER: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Serializes sink iteration; self-drain only try-locks it.
static WRITEOUT: Mutex<()> = Mutex::new(());
static SINKS: Mutex<heapless::Vec<&'static dyn LogSink, MAX_SINKS>> =
    Mutex::new(heapless::Vec::new());

pub fn set_level(level: LogLevel) {
    LOG_FILTER.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_FILTER.load(Ordering::Relaxed)
}

/// Register a sink. Its `reset` runs immediately.
pub fn add_sink(sink: &'static dyn LogSink) {
    {
        let _writeout = WRITEOUT.lock();
        if SINKS.lock().push(sink).is_err() {
            return;
        }
    }
    sink.reset();
}

/// The log worker thread takes over draining; producers stop self-draining.
pub fn take_over_drain() {
    SELF_DRAIN.store(false, Ordering::Release);
}

/// Write out up to `limit` pending items. Returns the number written.
pub fn drain(limit: usize) -> usize {
    let Some(_writeout) = WRITEOUT.try_lock() else {
        return 0;
    };

    let mut written = 0;
    while written < limit {
        let Some(index) = PENDING.pop() else { break };
        let item = &ITEMS[index];

        // The item is exclusively ours between pop and the free push.
        unsafe {
            let len = *item.len.get();
            let text = core::str::from_utf8_unchecked(&(&*item.text.get())[..len]);
            let msg = LogMessage {
                level: *item.level.get(),
                cpu: *item.cpu.get(),
                timestamp_nanos: *item.timestamp.get(),
                text,
            };
            for sink in SINKS.lock().iter() {
                sink.write(&msg);
            }
        }

        FREE.push(index);
        written += 1;
    }
    written
}

fn prime_free_list() {
    if FREE_PRIMED.swap(true, Ordering::AcqRel) {
        return;
    }
    for index in 0..LOG_ITEMS {
        FREE.push(index);
    }
}

struct FixedWriter<'a> {
    buffer: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = self.buffer.len() - self.len;
        let take = s.len().min(space);
        // Avoid splitting a UTF-8 sequence when truncating.
        let take = (0..=take)
            .rev()
            .find(|&n| s.is_char_boundary(n))
            .unwrap_or(0);
        self.buffer[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Pops from the free queue are single-consumer; serialize them on the
/// writeout lock, like the drain side.
fn take_free_item() -> Option<usize> {
    let _writeout = WRITEOUT.lock();
    FREE.pop()
}

/// Core log entry point; use the `error!`..`trace!` macros instead.
pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }
    prime_free_list();

    let index = match take_free_item().or_else(|| {
        // Pool dry: recycle by draining a few items first.
        drain(MAX_SELF_DRAIN);
        take_free_item()
    }) {
        Some(index) => index,
        None => {
            LOST_COUNT.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let item = &ITEMS[index];
    unsafe {
        *item.level.get() = level;
        *item.cpu.get() = crate::arch::cpu_id();
        *item.timestamp.get() = crate::arch::timestamp_nanos();

        let mut writer = FixedWriter {
            buffer: &mut *item.text.get(),
            len: 0,
        };
        let _ = writer.write_fmt(args);
        *item.len.get() = writer.len;
    }

    PENDING.push(index);
    if SELF_DRAIN.load(Ordering::Acquire) {
        drain(MAX_SELF_DRAIN);
    }
}

/// The registered-sink list as handed to the panic path.
pub type SinkList = heapless::Vec<&'static dyn LogSink, MAX_SINKS>;

/// Snapshot the sink list for the panic path. Only called after every other
/// cpu has been frozen, so skipping the writeout lock is sound.
pub fn panic_sinks() -> SinkList {
    match SINKS.try_lock() {
        Some(sinks) => sinks.clone(),
        // A frozen cpu died holding the registry lock; the list itself is
        // still intact, so read it anyway.
        None => unsafe {
            SINKS.force_unlock();
            SINKS.lock().clone()
        },
    }
}

pub fn lost_messages() -> u64 {
    LOST_COUNT.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {
        $crate::logging::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::log_at!($crate::logging::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::logging::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::log_at!($crate::logging::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::logging::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::logging::LogLevel::Trace, $($arg)*) };
}
