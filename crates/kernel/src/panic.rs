//! Panic sequence
//!
//! A panicking cpu disables interrupts, logs a pre-freeze message (so the
//! message survives even if another cpu wins the dump race), freezes every
//! other cpu over SMP mail, and then races for the panic outputs. Exactly
//! one cpu wins the claim and emits the dump: header, build info, cpu
//! info, callstack, bytes at the program counter, and stack words. Losers
//! halt quietly without touching the output devices.

use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::logging::{self, LogLevel, LogMessage};

const CALLSTACK_DEPTH: usize = 16;

/// Minimal trap-frame view the dump needs; the arch trap stubs build one
/// when routing a fatal fault here.
#[derive(Debug, Clone, Copy)]
pub struct PanicFrame {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

static OUTPUTS_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Race for the right to emit the dump. First caller wins; everyone else
/// must halt without writing.
pub(crate) fn try_acquire_panic_outputs() -> bool {
    !OUTPUTS_CLAIMED.swap(true, Ordering::AcqRel)
}

fn park() -> ! {
    #[cfg(target_os = "none")]
    arch::halt();
    #[cfg(not(target_os = "none"))]
    loop {
        core::hint::spin_loop();
    }
}

struct PanicWriter {
    sinks: logging::SinkList,
}

impl PanicWriter {
    fn line(&self, text: &str) {
        let msg = LogMessage {
            level: LogLevel::Error,
            cpu: arch::cpu_id(),
            timestamp_nanos: arch::timestamp_nanos(),
            text,
        };
        for sink in self.sinks.iter() {
            sink.write(&msg);
        }
    }

    fn format(&self, args: core::fmt::Arguments) {
        let mut buffer = heapless::String::<160>::new();
        let _ = buffer.write_fmt(args);
        self.line(&buffer);
    }
}

/// The one panic path. Never returns; at most one cpu proceeds past the
/// freeze to write the dump.
pub fn panic_common(message: core::fmt::Arguments, frame: Option<PanicFrame>) -> ! {
    arch::disable_interrupts();

    // Log before freezing: if another cpu panics concurrently and wins the
    // race below, this message still reaches the log queue.
    crate::error!("Panic pending on cpu {}: {}", arch::cpu_id(), message);

    crate::smp::mail::freeze_all_cpus();

    if !try_acquire_panic_outputs() {
        park();
    }

    let writer = PanicWriter {
        sinks: logging::panic_sinks(),
    };
    for sink in writer.sinks.iter() {
        sink.begin_panic();
    }

    writer.line("");
    writer.line("================ KERNEL PANIC ================");
    writer.format(format_args!("{}", message));
    writer.line("");

    writer.line("Build info:");
    writer.format(format_args!(
        "  version {} ({}, {}), commit {}",
        crate::build_info::VERSION,
        crate::build_info::TARGET_ARCH,
        crate::build_info::PROFILE,
        crate::build_info::GIT_HASH,
    ));

    writer.format(format_args!(
        "Cpu info: cpu {}, run level {}, uptime {} ms",
        arch::cpu_id(),
        crate::runlevel::current().name(),
        crate::time::uptime_millis(),
    ));

    if let Some(frame) = frame {
        dump_callstack(&writer, frame.fp);
        writer.line("Bytes at program counter:");
        dump_bytes(&writer, frame.pc, 64);
        writer.line("Stack words:");
        dump_words(&writer, frame.sp, 8);
    } else {
        dump_callstack(&writer, current_frame_pointer());
    }

    // Debugger hook: nothing attaches today, but the sequence point is
    // where a remote stub would take over.
    writer.line("No debugger transport available; halting.");
    park()
}

fn current_frame_pointer() -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let fp: usize;
        unsafe { core::arch::asm!("mov {}, rbp", out(reg) fp, options(nostack, nomem)) };
        fp
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Frame-pointer walk. Frames that leave the direct map or stop making
/// forward progress end the walk.
fn dump_callstack(writer: &PanicWriter, mut fp: usize) {
    writer.line("Call stack (latest first):");
    for depth in 0..CALLSTACK_DEPTH {
        if fp == 0 || fp % core::mem::size_of::<usize>() != 0 {
            break;
        }
        let Some([next_fp, return_addr]) = read_frame(fp) else {
            break;
        };
        if return_addr == 0 {
            break;
        }
        writer.format(format_args!("  {:02}: {:#018x}", depth, return_addr));
        if next_fp <= fp {
            break;
        }
        fp = next_fp;
    }
    writer.line("");
}

#[cfg(target_os = "none")]
fn read_frame(fp: usize) -> Option<[usize; 2]> {
    // The walk follows whatever rbp chains exist; a bad link at worst
    // reads unmapped memory, which the panic path cannot recover from
    // anyway, so bound it to the direct map.
    if fp < crate::mm::hhdm_base() || fp >= crate::mm::hhdm_base() + crate::mm::hhdm_length() {
        return None;
    }
    let slots = fp as *const usize;
    Some(unsafe { [*slots, *slots.add(1)] })
}

#[cfg(not(target_os = "none"))]
fn read_frame(_fp: usize) -> Option<[usize; 2]> {
    None
}

fn dump_bytes(writer: &PanicWriter, addr: usize, count: usize) {
    for row in (0..count).step_by(16) {
        let mut buffer = heapless::String::<160>::new();
        let _ = write!(buffer, "  {:#018x}:", addr + row);
        for offset in row..(row + 16).min(count) {
            match read_byte(addr + offset) {
                Some(byte) => {
                    let _ = write!(buffer, " {:02x}", byte);
                }
                None => {
                    let _ = write!(buffer, " ??");
                }
            }
        }
        writer.line(&buffer);
    }
    writer.line("");
}

fn dump_words(writer: &PanicWriter, addr: usize, count: usize) {
    let addr = addr & !(core::mem::size_of::<usize>() - 1);
    for index in 0..count {
        let slot = addr + index * core::mem::size_of::<usize>();
        let mut buffer = heapless::String::<160>::new();
        match read_word(slot) {
            Some(word) => {
                let _ = write!(buffer, "  {:#018x}: {:#018x}", slot, word);
            }
            None => {
                let _ = write!(buffer, "  {:#018x}: ????????????????", slot);
            }
        }
        writer.line(&buffer);
    }
    writer.line("");
}

#[cfg(target_os = "none")]
fn read_byte(addr: usize) -> Option<u8> {
    if addr < crate::mm::hhdm_base() {
        return None;
    }
    Some(unsafe { *(addr as *const u8) })
}

#[cfg(not(target_os = "none"))]
fn read_byte(_addr: usize) -> Option<u8> {
    None
}

#[cfg(target_os = "none")]
fn read_word(addr: usize) -> Option<usize> {
    if addr < crate::mm::hhdm_base() {
        return None;
    }
    Some(unsafe { *(addr as *const usize) })
}

#[cfg(not(target_os = "none"))]
fn read_word(_addr: usize) -> Option<usize> {
    None
}

/// Entry from the Rust panic machinery on bare metal.
#[cfg(target_os = "none")]
pub fn handle_rust_panic(info: &core::panic::PanicInfo) -> ! {
    match info.location() {
        Some(location) => panic_common(
            format_args!("{} at {}:{}", info.message(), location.file(), location.line()),
            None,
        ),
        None => panic_common(format_args!("{}", info.message()), None),
    }
}

/// Entry from the trap stubs for unrecoverable faults.
pub fn panic_with_frame(message: &str, frame: PanicFrame) -> ! {
    panic_common(format_args!("{}", message), Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_cpu_wins_the_output_race() {
        let _world = crate::test_support::world();
        // Simultaneous panics race on the claim; exactly one may dump.
        let first = try_acquire_panic_outputs();
        let second = try_acquire_panic_outputs();
        assert!(first);
        assert!(!second);
    }
}
