/// Bring-up sequence
///
/// `kernel_entry` runs once on the boot cpu: config store, log sinks,
/// handoff validation, the memory stack bottom-up (PMM, wired heap, kernel
/// map, direct map, kernel heap), config-root attachment, then per-cpu
/// init, the init threads, and finally the scheduler engine. Secondary
/// cpus run `per_core_entry` and join the engine from there.
///
/// Loader data (the handoff, reclaimable memory, modules) stays referenced
/// until every started cpu has passed early init; the last one through
/// spawns the thread that hands reclaimable regions back to the PMM.

use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Once;

use super::LoaderHandoff;
use crate::arch;
use crate::mm::hat::{HatFlags, PageMode};
use crate::mm::{self, PAGE_SIZE};
use crate::sched::{kernel_process, Scheduler, Thread};

/// Cpus still inside early init holding loader-data references.
static LOADER_DATA_REFS: AtomicUsize = AtomicUsize::new(1);

static RECLAIMABLE: Once<heapless::Vec<(usize, usize), 64>> = Once::new();
static MODULES: Once<heapless::Vec<super::Module, 16>> = Once::new();

/// Config-root attachment: whichever firmware description the loader gave.
static RSDP: Once<usize> = Once::new();
static DTB: Once<usize> = Once::new();

pub fn rsdp() -> Option<usize> {
    RSDP.get().copied()
}

pub fn dtb() -> Option<usize> {
    DTB.get().copied()
}

/// True while any cpu still references loader-provided data.
pub fn cores_in_early_init() -> bool {
    LOADER_DATA_REFS.load(Ordering::Relaxed) != 0
}

pub fn kernel_entry(handoff: LoaderHandoff) -> ! {
    LOADER_DATA_REFS.store(1, Ordering::Release);

    crate::config::init(handoff.cmdline);
    crate::logging::sinks::init_early_sinks();
    crate::info!(
        "Northport kernel {} for {} started, commit {} ({})",
        crate::build_info::VERSION,
        crate::build_info::TARGET_ARCH,
        crate::build_info::GIT_HASH,
        crate::build_info::PROFILE,
    );

    if let Err(err) = handoff.validate() {
        panic!("loader handoff failed validation: {:?}", err);
    }
    mm::set_hhdm(handoff.hhdm_base, handoff.hhdm_length);
    crate::info!(
        "Hhdm: base={:#x}, length={:#x}",
        handoff.hhdm_base,
        handoff.hhdm_length
    );

    // Memory stack, leaves first.
    let usable = handoff.usable_ranges();
    mm::pmm::init(&usable);
    mm::wired::init();
    mm::hat::init_kernel_map();
    map_kernel_space(&handoff);
    mm::heap::init();

    // Attach the firmware description to the config root.
    if let Some(rsdp) = handoff.rsdp {
        RSDP.call_once(|| rsdp);
        crate::info!("Config root: RSDP at {:#x}", rsdp);
    } else if let Some(dtb) = handoff.dtb {
        DTB.call_once(|| dtb);
        crate::info!("Config root: DTB at {:#x}", dtb);
    }

    // Upper layers that consume the core's services. The VFS node cache
    // and program manager live above this boundary and register their
    // drivers through the framework.
    crate::drivers::init();

    RECLAIMABLE.call_once(|| handoff.reclaimable_ranges());
    MODULES.call_once(|| handoff.modules.clone());

    if let Some(initdisk) = handoff.initdisk() {
        crate::info!(
            "Initdisk module: {:#x}, {} KiB",
            initdisk.base,
            initdisk.length / 1024
        );
    }

    let started = handoff.cpu_count;
    LOADER_DATA_REFS.store(started, Ordering::Release);
    if started == 1 {
        crate::info!("Boot protocol did not start APs, assuming uni-processor system for now");
    } else {
        crate::info!("Boot protocol started {} other cores", started - 1);
    }

    per_core_entry(0);
    exit_core_init()
}

/// Mirror the loader's essential mappings into the kernel's own map: the
/// direct map (2M leaves where alignment allows), the kernel image, and
/// any framebuffers.
fn map_kernel_space(handoff: &LoaderHandoff) {
    let kernel_map = mm::hat::kernel_map();
    let hhdm = handoff.hhdm_base;
    let flags = HatFlags::WRITE | HatFlags::GLOBAL;

    for entry in handoff.memmap.iter() {
        let mut paddr = entry.base;
        let top = entry.base + entry.length;
        while paddr < top {
            let vaddr = hhdm + paddr;
            let big_ok = paddr % PageMode::Mode2M.size() == 0
                && paddr + PageMode::Mode2M.size() <= top;
            let mode = if big_ok { PageMode::Mode2M } else { PageMode::Mode4K };
            match kernel_map.map(vaddr, paddr, flags, mode) {
                Ok(()) | Err(crate::mm::hat::HatError::MapAlreadyExists) => {}
                Err(err) => panic!("cannot build direct map: {:?}", err),
            }
            paddr += mode.size();
        }
    }

    if handoff.kernel_length != 0 {
        let image_flags = HatFlags::WRITE | HatFlags::EXECUTE | HatFlags::GLOBAL;
        let pages = mm::page_align_up(handoff.kernel_length) / PAGE_SIZE;
        for page in 0..pages {
            let _ = kernel_map.map(
                handoff.kernel_virt_base + page * PAGE_SIZE,
                handoff.kernel_phys_base + page * PAGE_SIZE,
                image_flags,
                PageMode::Mode4K,
            );
        }
    }

    for fb in handoff.framebuffers.iter() {
        let bytes = mm::page_align_up(fb.stride * fb.height * (fb.bits_per_pixel / 8));
        for page in (0..bytes).step_by(PAGE_SIZE) {
            let _ = kernel_map.map(
                hhdm + fb.address + page,
                fb.address + page,
                HatFlags::WRITE | HatFlags::GLOBAL | HatFlags::FRAMEBUFFER,
                PageMode::Mode4K,
            );
        }
    }
}

/// Every cpu runs this once it enters the kernel.
pub fn per_core_entry(cpu_id: usize) {
    crate::info!("Core {} has entered the kernel", cpu_id);

    arch::set_cpu_id(cpu_id);
    mm::vmm::kernel_space().make_active();

    crate::smp::mark_cpu_online(cpu_id);
    crate::smp::mail::init_mailbox(cpu_id);
    crate::time::init_local_clock_queue(cpu_id);
    Scheduler::init(cpu_id);
}

extern "C" fn reclaim_memory_thread(_arg: usize) {
    // Wait out any cpu still touching loader data.
    while cores_in_early_init() {
        crate::sched::yield_now();
    }
    if let Some(ranges) = RECLAIMABLE.get() {
        mm::pmm::reclaim_boot_memory(ranges);
    }
    // Idle-time maintenance: seed the zeroed list so zero-page consumers
    // stop contending with on-demand zeroing.
    mm::pmm::domain0().zero_idle_pages(64);
    finish_thread();
}

extern "C" fn log_flush_thread(_arg: usize) {
    // From here on producers stop self-draining; this thread owns writeout.
    crate::logging::take_over_drain();
    loop {
        if crate::logging::drain(usize::MAX) == 0 {
            crate::sched::yield_now();
        }
    }
}

extern "C" fn module_scan_thread(_arg: usize) {
    if let Some(modules) = MODULES.get() {
        for module in modules.iter() {
            crate::info!(
                "Boot module: {} at {:#x} ({} bytes)",
                module.name,
                module.base,
                module.length
            );
        }
    }
    finish_thread();
}

fn finish_thread() -> ! {
    if let Some(thread) = crate::smp::percpu::current().current_thread() {
        thread.exit();
    }
    loop {
        crate::sched::yield_now();
    }
}

/// Leave early init: the last cpu through spawns the init threads, then
/// everyone starts their scheduler engine.
pub fn exit_core_init() -> ! {
    let scheduler = Scheduler::local().expect("exit_core_init before scheduler init");
    scheduler.start_preemption();

    if LOADER_DATA_REFS.fetch_sub(1, Ordering::AcqRel) == 1 {
        let reclaim = Thread::create(kernel_process(), reclaim_memory_thread, 0, "reclaim")
            .expect("no memory for reclaim thread");
        crate::sched::start_thread(&reclaim, None);
        crate::info!("Bootloader reclaimation thread spawned: id={}", reclaim.id());

        let scan = Thread::create(kernel_process(), module_scan_thread, 0, "modscan")
            .expect("no memory for module scan thread");
        crate::sched::start_thread(&scan, None);

        let log_flush = Thread::create(kernel_process(), log_flush_thread, 0, "logflush")
            .expect("no memory for log flush thread");
        crate::sched::start_thread(&log_flush, Some(1));
    }

    #[cfg(target_os = "none")]
    scheduler.kickstart();
    #[cfg(not(target_os = "none"))]
    unreachable!("hosted builds never start the scheduler engine");
}
