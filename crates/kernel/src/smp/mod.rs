/// SMP (Symmetric Multi-Processing) support
///
/// Tracks which cpus are online, owns the per-cpu state blocks, and carries
/// the cross-cpu request machinery: mailboxes kicked by IPI, remote TLB
/// flushes, and the cooperative freeze used by the panic path.

pub mod mail;
pub mod percpu;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Maximum number of cpus supported
pub const MAX_CPUS: usize = 16;

/// Number of cpus that have entered the kernel
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

const ONLINE_INIT: AtomicBool = AtomicBool::new(false);
static CPU_ONLINE: [AtomicBool; MAX_CPUS] = [ONLINE_INIT; MAX_CPUS];

/// Get the number of online cpus
pub fn num_cpus() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Check if a cpu is online
pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && CPU_ONLINE[cpu_id].load(Ordering::Acquire)
}

/// Mark a cpu as online
pub fn mark_cpu_online(cpu_id: usize) {
    if cpu_id >= MAX_CPUS {
        crate::warn!("SMP: cpu id {} exceeds MAX_CPUS", cpu_id);
        return;
    }

    if !CPU_ONLINE[cpu_id].swap(true, Ordering::Release) {
        CPU_COUNT.fetch_add(1, Ordering::Release);
        crate::info!("SMP: cpu {} is now online", cpu_id);
    }
}

/// Cpus that are currently online, lowest id first.
pub fn online_cpus() -> impl Iterator<Item = usize> {
    (0..MAX_CPUS).filter(|&id| is_cpu_online(id))
}

#[cfg(test)]
pub fn reset_for_test() {
    for cpu in 1..MAX_CPUS {
        CPU_ONLINE[cpu].store(false, Ordering::Release);
    }
    CPU_ONLINE[0].store(true, Ordering::Release);
    CPU_COUNT.store(1, Ordering::Release);
}
