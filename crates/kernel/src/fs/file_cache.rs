/// Page-granular file cache
///
/// One `FileCache` exists per open file node; it maps page-sized offsets to
/// physical frames. Misses allocate a zeroed frame and ask the owning
/// filesystem driver's backend to fill it. Dirty units are written back on
/// request or when the cache is dropped.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use spin::Mutex;

use crate::mm::{phys_to_virt, pmm, PhysAddr, PAGE_SIZE};

/// Identity of a file node as presented by the VFS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileId {
    pub driver_id: u64,
    pub vnode_id: u64,
}

/// Filesystem-driver side of the cache: moves one page between the cache
/// frame and backing storage. Offsets are in bytes, page aligned.
pub trait FileBackend: Send + Sync {
    fn read_page(&self, id: FileId, offset: usize, frame: PhysAddr) -> bool;
    fn write_page(&self, id: FileId, offset: usize, frame: PhysAddr) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct FileCacheUnit {
    pub paddr: PhysAddr,
    pub dirty: bool,
}

pub struct FileCache {
    id: FileId,
    length: usize,
    backend: Arc<dyn FileBackend>,
    units: Mutex<BTreeMap<usize, FileCacheUnit>>,
}

impl FileCache {
    pub fn new(id: FileId, length: usize, backend: Arc<dyn FileBackend>) -> Arc<FileCache> {
        Arc::new(FileCache {
            id,
            length,
            backend,
            units: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Look up the unit backing byte `offset`, reading it in on a miss when
    /// `populate` is set.
    pub fn get_unit(&self, offset: usize, populate: bool) -> Option<FileCacheUnit> {
        if offset >= self.length {
            return None;
        }
        let index = offset / PAGE_SIZE;

        let mut units = self.units.lock();
        if let Some(unit) = units.get(&index) {
            return Some(*unit);
        }
        if !populate {
            return None;
        }

        let frame = pmm::alloc_zeroed()?;
        if !self.backend.read_page(self.id, index * PAGE_SIZE, frame) {
            pmm::free(frame);
            return None;
        }
        let unit = FileCacheUnit {
            paddr: frame,
            dirty: false,
        };
        units.insert(index, unit);
        Some(unit)
    }

    /// Record a write-through into the unit backing `offset`.
    pub fn mark_dirty(&self, offset: usize) {
        let index = offset / PAGE_SIZE;
        if let Some(unit) = self.units.lock().get_mut(&index) {
            unit.dirty = true;
        }
    }

    /// Write dirty units back through the backend; returns how many were
    /// cleaned.
    pub fn writeback(&self) -> usize {
        let mut cleaned = 0;
        let mut units = self.units.lock();
        for (&index, unit) in units.iter_mut() {
            if !unit.dirty {
                continue;
            }
            if self.backend.write_page(self.id, index * PAGE_SIZE, unit.paddr) {
                unit.dirty = false;
                cleaned += 1;
            }
        }
        cleaned
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.writeback();
        let units = self.units.get_mut();
        for unit in units.values() {
            pmm::free(unit.paddr);
        }
        REGISTRY.lock().remove(&(self.id.driver_id, self.id.vnode_id));
    }
}

static REGISTRY: Mutex<BTreeMap<(u64, u64), Weak<FileCache>>> = Mutex::new(BTreeMap::new());

/// Fetch the cache bonded to `id`, creating it on first use.
pub fn get_or_create(id: FileId, length: usize, backend: Arc<dyn FileBackend>) -> Arc<FileCache> {
    let mut registry = REGISTRY.lock();
    if let Some(cache) = registry.get(&(id.driver_id, id.vnode_id)).and_then(Weak::upgrade) {
        return cache;
    }
    let cache = FileCache::new(id, length, backend);
    registry.insert((id.driver_id, id.vnode_id), Arc::downgrade(&cache));
    cache
}

#[cfg(test)]
pub mod test_backend {
    use super::*;

    /// Backend serving a byte pattern derived from the offset; records
    /// write-backs for assertions.
    pub struct PatternBackend {
        pub writes: Mutex<alloc::vec::Vec<usize>>,
    }

    impl PatternBackend {
        pub fn new() -> Arc<PatternBackend> {
            Arc::new(PatternBackend {
                writes: Mutex::new(alloc::vec::Vec::new()),
            })
        }
    }

    impl FileBackend for PatternBackend {
        fn read_page(&self, _id: FileId, offset: usize, frame: PhysAddr) -> bool {
            let bytes = unsafe { core::slice::from_raw_parts_mut(phys_to_virt(frame), PAGE_SIZE) };
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = ((offset + i) % 251) as u8;
            }
            true
        }

        fn write_page(&self, _id: FileId, offset: usize, _frame: PhysAddr) -> bool {
            self.writes.lock().push(offset);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_backend::PatternBackend;
    use super::*;

    #[test]
    fn miss_populates_and_hit_reuses() {
        let _world = crate::test_support::world();
        let backend = PatternBackend::new();
        let id = FileId {
            driver_id: 1,
            vnode_id: 10,
        };
        let cache = FileCache::new(id, 4 * PAGE_SIZE, backend);

        assert!(cache.get_unit(0, false).is_none(), "no unit before populate");
        let unit = cache.get_unit(0, true).unwrap();
        let again = cache.get_unit(0, true).unwrap();
        assert_eq!(unit.paddr, again.paddr);

        let byte = unsafe { *phys_to_virt(unit.paddr) };
        assert_eq!(byte, 0, "offset 0 pattern");
        let byte = unsafe { *phys_to_virt(unit.paddr).add(5) };
        assert_eq!(byte, 5);
    }

    #[test]
    fn writeback_cleans_dirty_units() {
        let _world = crate::test_support::world();
        let backend = PatternBackend::new();
        let id = FileId {
            driver_id: 1,
            vnode_id: 11,
        };
        let cache = FileCache::new(id, 4 * PAGE_SIZE, backend.clone());

        cache.get_unit(PAGE_SIZE, true).unwrap();
        cache.mark_dirty(PAGE_SIZE);
        assert_eq!(cache.writeback(), 1);
        assert_eq!(&*backend.writes.lock(), &[PAGE_SIZE]);
        // Already clean: nothing more to do.
        assert_eq!(cache.writeback(), 0);
    }

    #[test]
    fn registry_hands_out_one_cache_per_node() {
        let _world = crate::test_support::world();
        let backend = PatternBackend::new();
        let id = FileId {
            driver_id: 2,
            vnode_id: 20,
        };
        let a = get_or_create(id, PAGE_SIZE, backend.clone());
        let b = get_or_create(id, PAGE_SIZE, backend);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reads_past_eof_miss() {
        let _world = crate::test_support::world();
        let backend = PatternBackend::new();
        let id = FileId {
            driver_id: 3,
            vnode_id: 30,
        };
        let cache = FileCache::new(id, PAGE_SIZE, backend);
        assert!(cache.get_unit(2 * PAGE_SIZE, true).is_none());
    }
}
