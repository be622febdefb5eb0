//! Architecture contract
//!
//! Everything the portable kernel needs from a cpu, kept deliberately small:
//! the interrupt gate, a current-cpu identity, execution frames, extended
//! register state, a monotonic timestamp plus a one-shot alarm, and an IPI
//! primitive. Two realizations exist: `x86_64` for bare metal and `host`,
//! which backs `cargo test` with a controllable clock and alarm.
//!
//! The page-table walker is architecture-shaped but shared; it lives in
//! `mm::hat` and consumes the constants exported here.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::*;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use self::host::*;

/// Smallest translation granule.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Opaque saved execution state, created on a supplied stack by
/// [`init_exec_frame`] and consumed by [`switch_exec_frame`].
#[repr(C)]
pub struct ExecFrame {
    _opaque: [usize; 0],
}

/// Opaque extended-register save area (FPU/vector state).
#[repr(C)]
pub struct ExtendedRegs {
    _opaque: [usize; 0],
}

/// Disable interrupts, asserting on the expected prior state.
#[track_caller]
pub fn assert_interrupts(expected: bool) {
    debug_assert_eq!(
        interrupts_enabled(),
        expected,
        "interrupt state does not match caller's expectation"
    );
}

/// Run `body` with interrupts disabled, restoring the prior state after.
pub fn without_interrupts<T>(body: impl FnOnce() -> T) -> T {
    let prev = disable_interrupts();
    let value = body();
    if prev {
        enable_interrupts();
    }
    value
}
