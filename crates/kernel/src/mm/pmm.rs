/// Physical memory manager
///
/// Each memory domain owns its frames through a pfndb (one `PageInfo` per
/// frame, O(1) lookup by address) and a pair of free lists: `free` holds
/// runs of contiguous frames in unknown state, `zeroed` holds single frames
/// known to be zero-filled. Both live under one interrupt-disabling
/// spinlock. Live (vm-owned) frames rotate through the active/dirty/standby
/// lists under their own lock.
///
/// The pfndb itself is bootstrapped out of the loader's usable memmap: the
/// first region large enough donates the frames that describe everyone else.

use core::cell::UnsafeCell;
use spin::{Mutex, Once};

use super::page::{
    pa_to_pfn, page_align_down, page_align_up, pfn_to_pa, PageInfo, PageList, PageState, Pfn,
    PhysAddr, PAGE_SIZE,
};
use super::phys_to_virt;
use crate::lib::lock::IntrSpinMutex;

struct FreeLists {
    free: PageList,
    zeroed: PageList,
    free_pages: usize,
}

struct LiveLists {
    active: PageList,
    dirty: PageList,
    standby: PageList,
}

/// Which live list a vm-owned frame sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveList {
    Active,
    Dirty,
    Standby,
}

pub struct MemoryDomain {
    base_pfn: Pfn,
    page_count: usize,
    pfndb: *const UnsafeCell<PageInfo>,
    free_lists: IntrSpinMutex<FreeLists>,
    live_lists: Mutex<LiveLists>,
}

unsafe impl Send for MemoryDomain {}
unsafe impl Sync for MemoryDomain {}

impl MemoryDomain {
    /// Build a domain over `usable` `(base, length)` byte ranges, donating
    /// leading frames of the first sufficiently large range to the pfndb.
    /// The HHDM must already cover every range.
    pub fn from_ranges(usable: &[(PhysAddr, usize)]) -> Option<MemoryDomain> {
        let mut min_addr = usize::MAX;
        let mut max_addr = 0;
        for &(base, length) in usable {
            if length < PAGE_SIZE {
                continue;
            }
            min_addr = min_addr.min(page_align_up(base));
            max_addr = max_addr.max(page_align_down(base + length));
        }
        if min_addr >= max_addr {
            return None;
        }

        let base_pfn = pa_to_pfn(min_addr);
        let page_count = pa_to_pfn(max_addr) - base_pfn;

        // Steal frames for the pfndb from the first range that can hold it.
        let db_bytes = page_count * core::mem::size_of::<PageInfo>();
        let db_pages = page_align_up(db_bytes) / PAGE_SIZE;
        let mut db_base = None;
        for &(base, length) in usable {
            let base_aligned = page_align_up(base);
            let top = page_align_down(base + length);
            if top.saturating_sub(base_aligned) >= db_pages * PAGE_SIZE {
                db_base = Some(base_aligned);
                break;
            }
        }
        let db_base = db_base?;

        let pfndb = phys_to_virt(db_base) as *mut UnsafeCell<PageInfo>;
        for index in 0..page_count {
            unsafe { (*pfndb.add(index)).get().write(PageInfo::new()) };
        }

        let domain = MemoryDomain {
            base_pfn,
            page_count,
            pfndb,
            free_lists: IntrSpinMutex::new(FreeLists {
                free: PageList::new(),
                zeroed: PageList::new(),
                free_pages: 0,
            }),
            live_lists: Mutex::new(LiveLists {
                active: PageList::new(),
                dirty: PageList::new(),
                standby: PageList::new(),
            }),
        };

        // Everything usable (minus the pfndb frames) becomes free runs.
        let db_top = db_base + db_pages * PAGE_SIZE;
        for &(base, length) in usable {
            let mut start = page_align_up(base);
            let top = page_align_down(base + length);
            if start < db_top && db_base < top {
                // Carve the pfndb out of this range.
                if start >= db_base {
                    start = db_top.min(top);
                }
            }
            if start < top {
                domain.insert_free_run(pa_to_pfn(start), (top - start) / PAGE_SIZE);
            }
        }

        crate::info!(
            "PMM domain: {} pages managed, pfndb {} pages at {:#x}",
            page_count,
            db_pages,
            db_base
        );
        Some(domain)
    }

    fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.page_count
    }

    /// Raw access to a frame's record. The caller must be the subsystem
    /// that currently owns the frame, or hold the domain free-lists lock
    /// for free frames.
    pub(crate) fn page_info_ptr(&self, paddr: PhysAddr) -> Option<*mut PageInfo> {
        let pfn = pa_to_pfn(paddr);
        if !self.contains(pfn) {
            return None;
        }
        let index = pfn - self.base_pfn;
        Some(unsafe { (*self.pfndb.add(index)).get() })
    }

    fn resolver(&self) -> impl FnMut(Pfn) -> *mut PageInfo + '_ {
        move |pfn| {
            self.page_info_ptr(pfn_to_pa(pfn))
                .expect("pfn outside domain")
        }
    }

    fn insert_free_run(&self, start: Pfn, run: usize) {
        if run == 0 {
            return;
        }
        let mut lists = self.free_lists.lock();
        let mut resolve = self.resolver();
        for pfn in start..start + run {
            let info = unsafe { &mut *resolve(pfn) };
            info.state = PageState::Free { run: 0 };
        }
        unsafe { (*resolve(start)).state = PageState::Free { run } };
        lists.free.push_back(start, &mut resolve);
        lists.free_pages += run;
    }

    /// Allocate one frame, contents unspecified.
    pub fn alloc(&self) -> Option<PhysAddr> {
        let mut lists = self.free_lists.lock();
        self.take_single(&mut lists, false)
    }

    /// Allocate one zero-filled frame.
    pub fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let mut lists = self.free_lists.lock();
        self.take_single(&mut lists, true)
    }

    fn take_single(&self, lists: &mut FreeLists, want_zeroed: bool) -> Option<PhysAddr> {
        let mut resolve = self.resolver();

        if want_zeroed {
            if let Some(pfn) = lists.zeroed.pop_front(&mut resolve) {
                unsafe { (*resolve(pfn)).state = PageState::Reserved };
                lists.free_pages -= 1;
                return Some(pfn_to_pa(pfn));
            }
        }

        let head = lists.free.pop_front(&mut resolve).or_else(|| {
            // Dirty-ok callers fall back to the zeroed list before failing.
            lists.zeroed.pop_front(&mut resolve)
        })?;

        let run = match unsafe { &(*resolve(head)).state } {
            PageState::Free { run } => (*run).max(1),
            state => panic!("free-list frame {:#x} in state {:?}", head, state),
        };
        if run > 1 {
            let next = head + 1;
            unsafe { (*resolve(next)).state = PageState::Free { run: run - 1 } };
            lists.free.push_front(next, &mut resolve);
        }
        unsafe { (*resolve(head)).state = PageState::Reserved };
        lists.free_pages -= 1;

        let paddr = pfn_to_pa(head);
        if want_zeroed {
            unsafe { core::ptr::write_bytes(phys_to_virt(paddr), 0, PAGE_SIZE) };
        }
        Some(paddr)
    }

    /// Allocate `count` contiguous frames, aligned to the next power of two
    /// of `count` frames.
    pub fn alloc_contiguous(&self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc();
        }
        let align = count.next_power_of_two();

        let mut lists = self.free_lists.lock();
        let mut resolve = self.resolver();

        // First-fit scan of the free runs for an aligned window.
        let mut candidate = None;
        for head in lists.free.iter(&mut self.resolver()) {
            let run = match unsafe { &(*resolve(head)).state } {
                PageState::Free { run } => (*run).max(1),
                _ => continue,
            };
            let aligned = (head + align - 1) & !(align - 1);
            if aligned + count <= head + run {
                candidate = Some((head, run, aligned));
                break;
            }
        }
        let (head, run, aligned) = candidate?;

        assert!(lists.free.remove(head, &mut resolve));
        lists.free_pages -= run;

        // Return the leading and trailing slack to the free list.
        drop(lists);
        self.insert_free_run(head, aligned - head);
        self.insert_free_run(aligned + count, head + run - (aligned + count));

        let mut resolve = self.resolver();
        for pfn in aligned..aligned + count {
            unsafe { (*resolve(pfn)).state = PageState::Reserved };
        }
        Some(pfn_to_pa(aligned))
    }

    /// Return one frame. Double frees are logged and ignored.
    pub fn free(&self, paddr: PhysAddr) {
        self.free_many(paddr, 1);
    }

    /// Return `count` contiguous frames as one run.
    pub fn free_many(&self, paddr: PhysAddr, count: usize) {
        let start = pa_to_pfn(paddr);
        if count == 0 || !self.contains(start) || !self.contains(start + count - 1) {
            crate::error!("PMM: free of {:#x} x{} outside domain", paddr, count);
            return;
        }

        let mut lists = self.free_lists.lock();
        let mut resolve = self.resolver();

        for pfn in start..start + count {
            if let PageState::Free { .. } = unsafe { &(*resolve(pfn)).state } {
                crate::error!("PMM: double free of frame {:#x}", pfn_to_pa(pfn));
                return;
            }
        }

        for pfn in start..start + count {
            let info = unsafe { &mut *resolve(pfn) };
            info.state = PageState::Free { run: 0 };
        }
        unsafe { (*resolve(start)).state = PageState::Free { run: count } };
        lists.free.push_front(start, &mut resolve);
        lists.free_pages += count;
    }

    /// Frames currently on the free and zeroed lists.
    pub fn free_pages(&self) -> usize {
        self.free_lists.lock().free_pages
    }

    /// Move up to `limit` frames from the free list to the zeroed list,
    /// zero-filling them. Called from idle-time maintenance so zero-page
    /// consumers avoid contending with the zeroing path.
    pub fn zero_idle_pages(&self, limit: usize) -> usize {
        let mut moved = 0;
        for _ in 0..limit {
            let Some(paddr) = self.alloc() else { break };
            unsafe { core::ptr::write_bytes(phys_to_virt(paddr), 0, PAGE_SIZE) };

            let mut lists = self.free_lists.lock();
            let mut resolve = self.resolver();
            let pfn = pa_to_pfn(paddr);
            unsafe { (*resolve(pfn)).state = PageState::Free { run: 1 } };
            lists.zeroed.push_back(pfn, &mut resolve);
            lists.free_pages += 1;
            moved += 1;
        }
        moved
    }

    /// Move a vm-owned frame onto a live list.
    pub fn push_live(&self, paddr: PhysAddr, list: LiveList) {
        let pfn = pa_to_pfn(paddr);
        if !self.contains(pfn) {
            return;
        }
        let mut lists = self.live_lists.lock();
        let target = match list {
            LiveList::Active => &mut lists.active,
            LiveList::Dirty => &mut lists.dirty,
            LiveList::Standby => &mut lists.standby,
        };
        target.push_back(pfn, &mut self.resolver());
    }

    /// Take a vm-owned frame off whichever live list holds it.
    pub fn remove_live(&self, paddr: PhysAddr) {
        let pfn = pa_to_pfn(paddr);
        if !self.contains(pfn) {
            return;
        }
        let mut lists = self.live_lists.lock();
        let mut resolve = self.resolver();
        let _ = lists.active.remove(pfn, &mut resolve)
            || lists.dirty.remove(pfn, &mut resolve)
            || lists.standby.remove(pfn, &mut resolve);
    }
}

static DOMAIN0: Once<MemoryDomain> = Once::new();

/// Build domain 0 from the loader's usable memmap. First caller wins.
pub fn init(usable: &[(PhysAddr, usize)]) {
    DOMAIN0.call_once(|| {
        MemoryDomain::from_ranges(usable).expect("no usable physical memory for domain 0")
    });
}

pub fn domain0() -> &'static MemoryDomain {
    DOMAIN0.get().expect("PMM used before init")
}

/// Allocate one frame from domain 0.
pub fn alloc() -> Option<PhysAddr> {
    domain0().alloc()
}

pub fn alloc_zeroed() -> Option<PhysAddr> {
    domain0().alloc_zeroed()
}

pub fn alloc_contiguous(count: usize) -> Option<PhysAddr> {
    domain0().alloc_contiguous(count)
}

pub fn free(paddr: PhysAddr) {
    domain0().free(paddr);
}

pub fn free_many(paddr: PhysAddr, count: usize) {
    domain0().free_many(paddr, count);
}

/// O(1) frame record lookup in domain 0.
pub(crate) fn lookup(paddr: PhysAddr) -> Option<*mut PageInfo> {
    domain0().page_info_ptr(paddr)
}

/// Hand the loader-reclaimable regions back to the allocator. Runs from the
/// reclaim thread once no cpu still references loader data.
pub fn reclaim_boot_memory(reclaimable: &[(PhysAddr, usize)]) {
    let domain = domain0();
    let mut pages = 0;
    for &(base, length) in reclaimable {
        let start = page_align_up(base);
        let top = page_align_down(base + length);
        if start >= top {
            continue;
        }
        // Regions outside the domain (below its base) cannot be tracked.
        if domain.page_info_ptr(start).is_none() {
            continue;
        }
        let run = (top - start) / PAGE_SIZE;
        domain.insert_free_run(pa_to_pfn(start), run);
        pages += run;
    }
    crate::info!("Reclaimed {} pages of loader memory", pages);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_round_trip_reuses_address() {
        let _world = crate::test_support::world();
        // Single 16-page usable region, per the seed scenario.
        let arena = crate::test_support::leak_arena(16 * PAGE_SIZE + PAGE_SIZE);
        let base = page_align_up(arena);
        let domain = MemoryDomain::from_ranges(&[(base, 16 * PAGE_SIZE)]).unwrap();

        let a = domain.alloc_contiguous(4).expect("arena has room");
        assert_eq!(a % (4 * PAGE_SIZE), 0, "contiguous alloc must be aligned");

        domain.free_many(a, 4);
        let a2 = domain.alloc_contiguous(4).expect("freed run is reusable");
        assert_eq!(a, a2, "round trip must reuse the same frames");
    }

    #[test]
    fn zeroed_requests_return_zero_pages() {
        let _world = crate::test_support::world();
        let paddr = alloc_zeroed().expect("domain 0 has memory");
        let bytes = unsafe { core::slice::from_raw_parts(phys_to_virt(paddr), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        free(paddr);
    }

    #[test]
    fn double_free_is_detected_and_ignored() {
        let _world = crate::test_support::world();
        let arena = crate::test_support::leak_arena(8 * PAGE_SIZE + PAGE_SIZE);
        let base = page_align_up(arena);
        let domain = MemoryDomain::from_ranges(&[(base, 8 * PAGE_SIZE)]).unwrap();

        let a = domain.alloc().unwrap();
        let before = domain.free_pages();
        domain.free(a);
        assert_eq!(domain.free_pages(), before + 1);
        // Second free must not change any state.
        domain.free(a);
        assert_eq!(domain.free_pages(), before + 1);
    }

    #[test]
    fn contiguous_alloc_spans_are_disjoint() {
        let _world = crate::test_support::world();
        let arena = crate::test_support::leak_arena(32 * PAGE_SIZE + PAGE_SIZE);
        let base = page_align_up(arena);
        let domain = MemoryDomain::from_ranges(&[(base, 32 * PAGE_SIZE)]).unwrap();

        let a = domain.alloc_contiguous(4).unwrap();
        let b = domain.alloc_contiguous(4).unwrap();
        let a_range = a..a + 4 * PAGE_SIZE;
        assert!(!a_range.contains(&b) && !a_range.contains(&(b + 4 * PAGE_SIZE - 1)));
    }
}
