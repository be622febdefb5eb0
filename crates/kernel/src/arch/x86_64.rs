//! x86_64 realization of the architecture contract
//!
//! Timestamps come from the TSC (frequency from cpuid leaf 15h when the
//! hardware reports it), the one-shot alarm is the TSC-deadline timer, and
//! IPIs go through the x2APIC ICR. The cpu id is parked in IA32_GS_BASE;
//! nothing else in the kernel uses the GS segment.

use core::arch::global_asm;
use core::sync::atomic::{AtomicU64, Ordering};

use raw_cpuid::CpuId;
use spin::Once;
use x86_64::instructions::interrupts;
use x86_64::instructions::tlb;
use x86_64::registers::model_specific::{GsBase, Msr};
use x86_64::VirtAddr;

use super::{ExecFrame, ExtendedRegs};
use crate::smp::MAX_CPUS;

const MSR_TSC_DEADLINE: u32 = 0x6E0;
const MSR_X2APIC_ICR: u32 = 0x830;
const MSR_X2APIC_EOI: u32 = 0x80B;

/// Fixed vector the mailbox IPI arrives on; the trap stubs route it to
/// `smp::dispatch_ipi`.
pub const IPI_VECTOR: u8 = 0xF0;
/// Vector for the TSC-deadline alarm; routed to the registered handler.
pub const ALARM_VECTOR: u8 = 0xF1;

static TSC_HZ: Once<u64> = Once::new();
static ALARM_HANDLER: Once<fn()> = Once::new();

const ABORT_INIT: AtomicU64 = AtomicU64::new(0);
static UNSAFE_OP_ABORT: [AtomicU64; MAX_CPUS] = [ABORT_INIT; MAX_CPUS];

pub fn cpu_id() -> usize {
    GsBase::read().as_u64() as usize
}

/// Record this cpu's identity; called once per cpu during bring-up.
pub fn set_cpu_id(id: usize) {
    GsBase::write(VirtAddr::new(id as u64));
}

pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

pub fn disable_interrupts() -> bool {
    let prev = interrupts::are_enabled();
    interrupts::disable();
    prev
}

pub fn enable_interrupts() {
    interrupts::enable();
}

fn tsc_hz() -> u64 {
    *TSC_HZ.call_once(|| {
        let cpuid = CpuId::new();
        cpuid
            .get_tsc_info()
            .and_then(|info| info.tsc_frequency())
            .or_else(|| {
                cpuid
                    .get_processor_frequency_info()
                    .map(|info| info.processor_base_frequency() as u64 * 1_000_000)
            })
            .filter(|&hz| hz != 0)
            // Leaves 15h/16h absent: assume the common virtualized default.
            .unwrap_or(1_000_000_000)
    })
}

fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub fn timestamp_nanos() -> u64 {
    let hz = tsc_hz();
    let ticks = rdtsc() as u128;
    ((ticks * 1_000_000_000) / hz as u128) as u64
}

pub fn timestamp_frequency() -> u64 {
    tsc_hz()
}

/// The timestamp is usable for uptime only when the TSC is invariant.
pub fn timestamp_stable() -> bool {
    CpuId::new()
        .get_advanced_power_mgmt_info()
        .map(|info| info.has_invariant_tsc())
        .unwrap_or(false)
}

pub fn set_alarm_handler(handler: fn()) {
    ALARM_HANDLER.call_once(|| handler);
}

pub fn set_alarm(nanos: u64) {
    let hz = tsc_hz() as u128;
    let ticks = (nanos.max(1) as u128 * hz) / 1_000_000_000;
    let deadline = rdtsc().wrapping_add(ticks as u64);
    unsafe { Msr::new(MSR_TSC_DEADLINE).write(deadline) };
}

pub fn alarm_max() -> u64 {
    u64::MAX / 2
}

/// Entered from the alarm vector stub at interrupt level.
pub fn alarm_vector_entry() {
    if let Some(handler) = ALARM_HANDLER.get() {
        handler();
    }
    unsafe { Msr::new(MSR_X2APIC_EOI).write(0) };
}

pub fn poll_sleep(nanos: u64) {
    let end = timestamp_nanos().saturating_add(nanos);
    while timestamp_nanos() < end {
        core::hint::spin_loop();
    }
}

/// Idle until the next interrupt.
pub fn wait_for_interrupt() {
    x86_64::instructions::hlt();
}

/// Park this cpu permanently (panic freeze, offline cores).
pub fn halt() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}

pub fn send_ipi(target: usize) {
    // Fixed delivery, physical destination. Cpu ids map to x2APIC ids 1:1 on
    // the supported boot protocol.
    let icr = ((target as u64) << 32) | IPI_VECTOR as u64;
    unsafe { Msr::new(MSR_X2APIC_ICR).write(icr) };
}

/// Mirror the run level into CR8 so device interrupts stay masked while the
/// cpu is at Clock or Interrupt level. Levels below Clock leave TPR at 0.
pub fn set_hardware_run_level(level: u8) {
    let tpr: u64 = match level {
        3 => 14, // Clock: only the alarm/IPI priority class remains open
        4 => 15, // Interrupt
        _ => 0,
    };
    unsafe { core::arch::asm!("mov cr8, {}", in(reg) tpr, options(nostack, nomem)) };
}

/// x86 re-walks the tables on a permission fault, so widening an entry's
/// permissions never needs an eager flush.
pub fn flush_on_perms_upgrade() -> bool {
    false
}

pub fn flush_local_entry(vaddr: usize) {
    tlb::flush(VirtAddr::new(vaddr as u64));
}

pub fn flush_local_all() {
    tlb::flush_all();
}

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

// Context switch: save callee-saved state on the old stack, publish the old
// stack pointer through `save`, adopt the new stack, optionally run the
// callback while neither frame is current, then restore and return on the
// new stack. Initial frames are laid out by `init_exec_frame` so that the
// restore path "returns" into the thread trampoline.
global_asm!(
    r#"
.global __npk_switch_exec_frame
.global __npk_thread_trampoline
__npk_switch_exec_frame:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    test rdi, rdi
    jz 1f
    mov [rdi], rsp
1:
    mov rsp, rsi
    test rdx, rdx
    jz 2f
    mov rdi, rcx
    call rdx
2:
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret

__npk_thread_trampoline:
    mov rdi, r12
    call r13
    ud2
"#
);

extern "C" {
    fn __npk_switch_exec_frame(
        save: *mut *mut ExecFrame,
        load: *mut ExecFrame,
        callback: Option<fn(*mut ())>,
        callback_arg: *mut (),
    );
    static __npk_thread_trampoline: u8;
}

/// Build an initial frame on `stack_top` that enters `entry(arg)` when first
/// switched to. User-mode entry leaves through the program-manager return
/// path rather than here, so the frame is always a supervisor frame.
pub fn init_exec_frame(stack_top: usize, entry: usize, arg: usize, _user: bool) -> *mut ExecFrame {
    // Layout matches the pop sequence in __npk_switch_exec_frame:
    // [r15][r14][r13=entry][r12=arg][rbx][rbp][ret=trampoline]
    let mut sp = stack_top & !0xF;
    let trampoline = unsafe { &__npk_thread_trampoline as *const u8 as usize };

    let frame = [0usize, 0, entry, arg, 0, 0, trampoline];
    sp -= frame.len() * core::mem::size_of::<usize>();
    unsafe {
        core::ptr::copy_nonoverlapping(frame.as_ptr(), sp as *mut usize, frame.len());
    }
    sp as *mut ExecFrame
}

pub unsafe fn switch_exec_frame(
    save: *mut *mut ExecFrame,
    load: *mut ExecFrame,
    callback: Option<fn(*mut ())>,
    callback_arg: *mut (),
) {
    unsafe { __npk_switch_exec_frame(save, load, callback, callback_arg) };
}

/// Size of one fxsave area.
pub const EXTENDED_REGS_SIZE: usize = 512;

pub fn init_extended_regs(regs: *mut ExtendedRegs) {
    unsafe { core::ptr::write_bytes(regs as *mut u8, 0, EXTENDED_REGS_SIZE) };
}

pub fn save_extended_regs(regs: *mut ExtendedRegs) {
    unsafe { core::arch::asm!("fxsave64 [{}]", in(reg) regs, options(nostack)) };
}

pub fn load_extended_regs(regs: *mut ExtendedRegs) {
    unsafe { core::arch::asm!("fxrstor64 [{}]", in(reg) regs, options(nostack)) };
}

/// No fence needed before fxrstor on this architecture.
pub fn extended_regs_fence() -> bool {
    false
}
