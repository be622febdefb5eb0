/// Wired heap
///
/// Fixed-size-class slab allocator over whole PMM frames for kernel
/// bookkeeping that must never page out (clock queues, scheduler blocks,
/// wait bookkeeping). Each slab frame threads a freelist through its own
/// free slots and keeps its head plus a used count in the frame's PageInfo;
/// a frame retires back to the PMM when its last slot is freed.
///
/// Requests at or beyond the largest class fall back to whole contiguous
/// frames. Allocation and free are legal at run level Normal only.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::page::{pa_to_pfn, page_align_down, page_align_up, PageInfo, PageList, PageState, Pfn, PAGE_SIZE};
use super::{phys_to_virt, pmm, virt_to_phys};
use crate::runlevel::{self, RunLevel};

const SIZE_CLASSES: [usize; 5] = [32, 64, 128, 256, 512];
const CLASS_COUNT: usize = SIZE_CLASSES.len();

const POISON_BEFORE: u8 = 0xA5;
const POISON_AFTER: u8 = 0x5A;

/// Freelist node living inside a free slot.
pub struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
}

const LIST_INIT: Mutex<PageList> = Mutex::new(PageList::new());
static SLABS: [Mutex<PageList>; CLASS_COUNT] = [LIST_INIT; CLASS_COUNT];

static TRASH_BEFORE: AtomicBool = AtomicBool::new(false);
static TRASH_AFTER: AtomicBool = AtomicBool::new(false);

/// Read the poison options from config; called once during boot.
pub fn init() {
    TRASH_BEFORE.store(
        crate::config::get_bool("kernel.heap.trash_before_use", false),
        Ordering::Relaxed,
    );
    TRASH_AFTER.store(
        crate::config::get_bool("kernel.heap.trash_after_use", false),
        Ordering::Relaxed,
    );
}

fn resolve(pfn: Pfn) -> *mut PageInfo {
    pmm::lookup(super::pfn_to_pa(pfn)).expect("slab frame outside domain 0")
}

fn class_index(size: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| size <= class)
}

/// Allocate `size` wired bytes. Returns null-equivalent `None` on
/// exhaustion; never blocks.
pub fn wired_alloc(size: usize) -> Option<NonNull<u8>> {
    runlevel::assert_at_most(RunLevel::Normal);
    if size == 0 {
        return None;
    }

    let Some(class) = class_index(size) else {
        // Oversize: whole frames.
        let pages = page_align_up(size) / PAGE_SIZE;
        let paddr = pmm::alloc_contiguous(pages)?;
        return NonNull::new(phys_to_virt(paddr));
    };
    let class_size = SIZE_CLASSES[class];

    let mut list = SLABS[class].lock();

    // Any slab frame in this class with a free slot will do.
    let mut resolver = resolve;
    for pfn in list.iter(&mut resolver) {
        let info = unsafe { &mut *resolve(pfn) };
        let PageState::Slab { used, free_head, .. } = &mut info.state else {
            panic!("slab list frame {:#x} in wrong state", pfn);
        };
        if let Some(slot) = free_head.take() {
            *free_head = unsafe { slot.as_ref().next };
            *used += 1;
            let ptr = slot.cast::<u8>();
            trash(ptr, class_size, TRASH_BEFORE.load(Ordering::Relaxed), POISON_BEFORE);
            return Some(ptr);
        }
    }

    // No partial slab: grow the class by one frame.
    let paddr = pmm::alloc()?;
    let slots = PAGE_SIZE / class_size;
    let base = phys_to_virt(paddr);

    let mut head: Option<NonNull<FreeSlot>> = None;
    for index in (1..slots).rev() {
        let slot = unsafe { base.add(index * class_size) } as *mut FreeSlot;
        unsafe { (*slot).next = head };
        head = NonNull::new(slot);
    }

    let info = unsafe { &mut *pmm::lookup(paddr).expect("fresh frame outside domain 0") };
    info.state = PageState::Slab {
        class,
        used: 1,
        free_head: head,
    };
    list.push_back(pa_to_pfn(paddr), &mut resolver);

    crate::trace!("Wired slab added: base={:#x}, size={} B, count={}", paddr, class_size, slots);

    let ptr = NonNull::new(base)?;
    trash(ptr, class_size, TRASH_BEFORE.load(Ordering::Relaxed), POISON_BEFORE);
    Some(ptr)
}

/// Free a wired allocation of `size` bytes.
pub fn wired_free(ptr: NonNull<u8>, size: usize) {
    runlevel::assert_at_most(RunLevel::Normal);
    if size == 0 {
        return;
    }

    let Some(class) = class_index(size) else {
        let pages = page_align_up(size) / PAGE_SIZE;
        pmm::free_many(virt_to_phys(ptr.as_ptr() as usize), pages);
        return;
    };
    let class_size = SIZE_CLASSES[class];
    trash(ptr, class_size, TRASH_AFTER.load(Ordering::Relaxed), POISON_AFTER);

    let slab_paddr = virt_to_phys(page_align_down(ptr.as_ptr() as usize));
    let mut list = SLABS[class].lock();

    let info = unsafe { &mut *pmm::lookup(slab_paddr).expect("freed slot outside domain 0") };
    let retire = {
        let PageState::Slab {
            class: recorded,
            used,
            free_head,
        } = &mut info.state
        else {
            crate::error!("Wired free of {:p} but frame is not a slab", ptr);
            return;
        };
        assert_eq!(*recorded, class, "wired free with mismatched size");

        let slot = ptr.cast::<FreeSlot>();
        unsafe { (*slot.as_ptr()).next = *free_head };
        *free_head = Some(slot);
        *used -= 1;
        *used == 0
    };

    if retire {
        info.state = PageState::Reserved;
        let mut resolver = resolve;
        let removed = list.remove(pa_to_pfn(slab_paddr), &mut resolver);
        debug_assert!(removed, "retiring slab frame was not on its class list");
        crate::trace!("Wired slab removed: base={:#x}, size={} B", slab_paddr, class_size);
        pmm::free(slab_paddr);
    }
}

/// Allocate and initialize a wired `T`. Slots are aligned to their class
/// size, so sizing by `max(size, align)` keeps any `T` aligned.
pub fn wired_new<T>(value: T) -> Option<NonNull<T>> {
    let size = core::mem::size_of::<T>().max(core::mem::align_of::<T>());
    let ptr = wired_alloc(size)?.cast::<T>();
    unsafe { ptr.as_ptr().write(value) };
    Some(ptr)
}

/// Drop and free a `T` created by [`wired_new`].
///
/// # Safety
/// `ptr` must come from `wired_new::<T>` and not be referenced afterwards.
pub unsafe fn wired_delete<T>(ptr: NonNull<T>) {
    let size = core::mem::size_of::<T>().max(core::mem::align_of::<T>());
    unsafe { core::ptr::drop_in_place(ptr.as_ptr()) };
    wired_free(ptr.cast::<u8>(), size);
}

fn trash(ptr: NonNull<u8>, len: usize, enabled: bool, pattern: u8) {
    if enabled {
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), pattern, len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_lands_in_matching_class() {
        let _world = crate::test_support::world();
        let a = wired_alloc(24).unwrap();
        let b = wired_alloc(24).unwrap();
        // Two small allocations pack into the same frame.
        assert_eq!(
            page_align_down(a.as_ptr() as usize),
            page_align_down(b.as_ptr() as usize)
        );
        assert_eq!(a.as_ptr() as usize % 32, 0);
        wired_free(a, 24);
        wired_free(b, 24);
    }

    #[test]
    fn empty_slab_retires_to_pmm() {
        let _world = crate::test_support::world();
        let before = pmm::domain0().free_pages();
        let a = wired_alloc(400).unwrap();
        let mid = pmm::domain0().free_pages();
        // Either a fresh frame was taken or a partial slab was reused.
        assert!(mid == before || mid == before - 1);
        wired_free(a, 400);
        assert_eq!(pmm::domain0().free_pages(), before);
    }

    #[test]
    fn oversize_requests_take_whole_frames() {
        let _world = crate::test_support::world();
        let size = 3 * PAGE_SIZE / 2;
        let a = wired_alloc(size).unwrap();
        assert_eq!(a.as_ptr() as usize % PAGE_SIZE, 0);
        wired_free(a, size);
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let _world = crate::test_support::world();
        let a = wired_alloc(400).unwrap();
        let keep = wired_alloc(400).unwrap();
        wired_free(a, 400);
        let b = wired_alloc(400).unwrap();
        assert_eq!(a, b, "freelist head should be handed back first");
        wired_free(b, 400);
        wired_free(keep, 400);
    }
}
