//! Kernel heap
//!
//! A linked-list allocator over a statically reserved region, installed as
//! the global allocator on bare metal. Hosted builds (tests) use the host
//! allocator, so everything here is a no-op there beyond the statistics.

use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;

/// 8 MiB of wired kernel heap.
const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[cfg_attr(all(not(test), target_os = "none"), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[repr(align(4096))]
struct HeapRegion([u8; HEAP_SIZE]);

static HEAP_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Bring up the kernel heap. Idempotent; later callers see it ready.
pub fn init() {
    if HEAP_INIT_DONE.swap(true, Ordering::SeqCst) {
        return;
    }

    static mut HEAP_MEMORY: HeapRegion = HeapRegion([0; HEAP_SIZE]);
    unsafe {
        let base = core::ptr::addr_of_mut!(HEAP_MEMORY) as *mut u8;
        ALLOCATOR.lock().init(base, HEAP_SIZE);
    }
    crate::info!("Kernel heap: {} KiB at static region", HEAP_SIZE / 1024);
}

pub const fn total_size() -> usize {
    HEAP_SIZE
}

pub fn used_bytes() -> usize {
    ALLOCATOR.lock().used()
}

pub fn free_bytes() -> usize {
    ALLOCATOR.lock().free()
}
