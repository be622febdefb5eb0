#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(all(not(test), target_os = "none"), no_main)]
#![cfg_attr(all(not(test), target_os = "none"), feature(alloc_error_handler))]
// CI lint gate: when built with `--features strict`, fail on any warning
#![cfg_attr(feature = "strict", deny(warnings))]
#![cfg_attr(feature = "strict", deny(unsafe_op_in_unsafe_fn))]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, lock-free queues)
#[allow(special_module_name)]
pub mod lib;
// Logging framework: item pool, MPSC pending queue, sinks
pub mod logging;
// Command-line configuration store
pub mod config;
// Architecture contract (interrupt gate, per-cpu block, exec frames, timers)
pub mod arch;
// Per-cpu state, SMP mailboxes, remote flushes, cpu freeze
pub mod smp;
// Run levels and deferred work (DPCs/APCs)
pub mod runlevel;
// Clock event queues and uptime
pub mod time;
// Waitable objects (condition/timer/mutex) and the wait protocol
pub mod wait;
// Thread contexts, processes, per-cpu scheduler
pub mod sched;
// Memory management: PMM, HAT, wired heap, VMM, kernel heap
pub mod mm;
// Driver manifests, device APIs, I/O packets
pub mod drivers;
// File cache boundary consumed by the VMM file driver
pub mod fs;
// Loader handoff and the boot sequence
pub mod boot;
// Panic sequence (cross-cpu freeze and state dump)
pub mod panic;
// Baked build information for panic dumps
pub mod build_info;

// Test world setup helpers (host only)
#[cfg(test)]
pub mod test_support;
// Cross-subsystem test scenarios
#[cfg(test)]
mod tests;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
bootloader_api::entry_point!(boot_entry, config = &boot::bootinfo::BOOT_CONFIG);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn boot_entry(info: &'static mut bootloader_api::BootInfo) -> ! {
    let handoff = boot::bootinfo::translate(info);
    boot::kernel_entry(handoff)
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic_entry(info: &core::panic::PanicInfo) -> ! {
    panic::handle_rust_panic(info)
}

#[cfg(all(not(test), target_os = "none"))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: failed to allocate {} bytes", layout.size());
}

// Host builds (cargo test, cargo check on the host) provide their own runtime.
#[cfg(all(not(test), not(target_os = "none")))]
fn main() {
    // The kernel only runs on bare metal; the host build exists for tests.
}
