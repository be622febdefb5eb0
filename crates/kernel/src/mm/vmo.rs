/// VM objects
///
/// A `VmObject` is a named source of pages that one or more VM ranges map.
/// Anonymous objects own their frames outright; MMIO objects name a
/// physical window; file objects bond to a `FileCache` and own only the
/// private copy-up frames made for `Private` views.
///
/// Frames owned by a VMO carry a non-owning back-reference in their
/// PageInfo; the destructor clears those references before the frames are
/// released, so a dangling PageInfo can never outlive its object.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use super::page::{PageState, PhysAddr};
use super::pmm::{self, LiveList};
use crate::fs::FileCache;

#[derive(Clone)]
pub enum VmoKind {
    Anon,
    Mmio { base: PhysAddr },
    File { cache: Arc<FileCache> },
}

pub struct VmObject {
    kind: VmoKind,
    length: usize,
    /// Frames owned by this object, keyed by page index within it.
    pages: Mutex<BTreeMap<usize, PhysAddr>>,
    /// Views (ranges) currently mapping this object.
    views: Mutex<usize>,
}

impl VmObject {
    pub fn new_anon(length: usize) -> Arc<VmObject> {
        Arc::new(VmObject {
            kind: VmoKind::Anon,
            length,
            pages: Mutex::new(BTreeMap::new()),
            views: Mutex::new(0),
        })
    }

    pub fn new_mmio(base: PhysAddr, length: usize) -> Arc<VmObject> {
        Arc::new(VmObject {
            kind: VmoKind::Mmio { base },
            length,
            pages: Mutex::new(BTreeMap::new()),
            views: Mutex::new(0),
        })
    }

    pub fn new_file(cache: Arc<FileCache>, length: usize) -> Arc<VmObject> {
        Arc::new(VmObject {
            kind: VmoKind::File { cache },
            length,
            pages: Mutex::new(BTreeMap::new()),
            views: Mutex::new(0),
        })
    }

    pub fn kind(&self) -> &VmoKind {
        &self.kind
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn add_view(&self) {
        *self.views.lock() += 1;
    }

    pub fn remove_view(&self) {
        let mut views = self.views.lock();
        debug_assert!(*views > 0);
        *views -= 1;
    }

    pub fn view_count(&self) -> usize {
        *self.views.lock()
    }

    /// Frame backing page `index`, if resident in this object.
    pub fn get_page(self: &Arc<Self>, index: usize) -> Option<PhysAddr> {
        self.pages.lock().get(&index).copied()
    }

    /// Take ownership of `paddr` as the backing for page `index`. The frame
    /// gains a vm-state record pointing back here and lands on the active
    /// list.
    pub fn install_page(self: &Arc<Self>, index: usize, paddr: PhysAddr) {
        let mut pages = self.pages.lock();
        let previous = pages.insert(index, paddr);
        debug_assert!(previous.is_none(), "page {} installed twice", index);

        if let Some(info) = pmm::lookup(paddr) {
            unsafe {
                (*info).state = PageState::Vm {
                    vmo: Arc::as_ptr(self) as usize,
                    offset: index as u32,
                    wire_count: 0,
                    dirty: false,
                };
            }
        }
        pmm::domain0().push_live(paddr, LiveList::Active);
    }

    /// Pin page `index` so it cannot be reclaimed; pairs with
    /// [`Self::unwire_page`].
    pub fn wire_page(self: &Arc<Self>, index: usize) -> bool {
        let pages = self.pages.lock();
        let Some(&paddr) = pages.get(&index) else {
            return false;
        };
        if let Some(info) = pmm::lookup(paddr) {
            if let PageState::Vm { wire_count, .. } = unsafe { &mut (*info).state } {
                *wire_count += 1;
                return true;
            }
        }
        false
    }

    pub fn unwire_page(self: &Arc<Self>, index: usize) {
        let pages = self.pages.lock();
        let Some(&paddr) = pages.get(&index) else {
            return;
        };
        if let Some(info) = pmm::lookup(paddr) {
            if let PageState::Vm { wire_count, .. } = unsafe { &mut (*info).state } {
                debug_assert!(*wire_count > 0);
                *wire_count -= 1;
            }
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let pages = self.pages.get_mut();
        for (&index, &paddr) in pages.iter() {
            // Clear the back-reference first; only then may the frame be
            // handed back to the PMM.
            if let Some(info) = pmm::lookup(paddr) {
                let info = unsafe { &mut *info };
                if let PageState::Vm { wire_count, .. } = info.state {
                    debug_assert_eq!(wire_count, 0, "page {} freed while wired", index);
                }
                info.state = PageState::Reserved;
            }
            pmm::domain0().remove_live(paddr);
            pmm::free(paddr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_pages_are_tracked_and_released() {
        let _world = crate::test_support::world();
        let before = pmm::domain0().free_pages();

        let vmo = VmObject::new_anon(4 * crate::mm::PAGE_SIZE);
        let frame = pmm::alloc_zeroed().unwrap();
        vmo.install_page(0, frame);
        assert_eq!(vmo.get_page(0), Some(frame));

        // The frame's record points back at the object.
        let info = pmm::lookup(frame).unwrap();
        match unsafe { &(*info).state } {
            PageState::Vm { vmo: back, .. } => {
                assert_eq!(*back, Arc::as_ptr(&vmo) as usize)
            }
            state => panic!("unexpected state {:?}", state),
        }

        drop(vmo);
        assert_eq!(pmm::domain0().free_pages(), before, "frames released on drop");
    }

    #[test]
    fn wire_counts_nest() {
        let _world = crate::test_support::world();
        let vmo = VmObject::new_anon(crate::mm::PAGE_SIZE);
        let frame = pmm::alloc_zeroed().unwrap();
        vmo.install_page(0, frame);

        assert!(vmo.wire_page(0));
        assert!(vmo.wire_page(0));
        vmo.unwire_page(0);
        vmo.unwire_page(0);

        let info = pmm::lookup(frame).unwrap();
        match unsafe { &(*info).state } {
            PageState::Vm { wire_count, .. } => assert_eq!(*wire_count, 0),
            state => panic!("unexpected state {:?}", state),
        }
    }
}
