/// Page-table abstraction (HAT)
///
/// A portable map/unmap/query interface over a 4-level, 512-entry radix
/// table with 4K/2M/1G leaves, operating on PMM frames through the direct
/// map. Table pages are tracked as `PageState::Table` with a live-entry
/// count; address-space teardown frees table pages and nothing else.
///
/// The kernel half of every space mirrors the kernel map's top-level
/// entries. A generation counter records changes to those entries; spaces
/// re-sync on creation and activation, and lower levels are shared through
/// the top entries themselves.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use super::page::{PhysAddr, PageState, PAGE_SIZE};
use super::{phys_to_virt, pmm};
use crate::arch;

const ENTRIES: usize = 512;
const LEVELS: usize = 4;

/// First virtual address of the shared kernel half (top index 256).
pub const KERNEL_SPLIT: usize = 0xFFFF_8000_0000_0000;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_WRITE_THROUGH: u64 = 1 << 3;
const PTE_NO_CACHE: u64 = 1 << 4;
const PTE_SIZE: u64 = 1 << 7;
const PTE_GLOBAL: u64 = 1 << 8;
const PTE_NO_EXECUTE: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HatFlags: u32 {
        const WRITE       = 1 << 0;
        const EXECUTE     = 1 << 1;
        const USER        = 1 << 2;
        const GLOBAL      = 1 << 3;
        const MMIO        = 1 << 4;
        const FRAMEBUFFER = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HatError {
    PmAllocFailed,
    InvalidArg,
    MapAlreadyExists,
    NoExistingMap,
}

/// Translation size of a leaf entry, named by its level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PageMode {
    Mode4K = 1,
    Mode2M = 2,
    Mode1G = 3,
}

impl PageMode {
    pub fn size(self) -> usize {
        PAGE_SIZE << (9 * (self as usize - 1))
    }

    fn from_level(level: usize) -> PageMode {
        match level {
            1 => PageMode::Mode4K,
            2 => PageMode::Mode2M,
            3 => PageMode::Mode1G,
            _ => panic!("no page mode for level {}", level),
        }
    }
}

/// Largest leaf size this cpu can translate.
pub fn max_page_mode() -> PageMode {
    // 1G leaves are ubiquitous on the supported machines; a finer probe
    // would come from cpuid on real silicon.
    PageMode::Mode1G
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HatMapping {
    pub paddr: PhysAddr,
    pub flags: HatFlags,
    pub mode: PageMode,
}

/// Global generation of the kernel map's top-level entries.
static KERNEL_GEN: AtomicU32 = AtomicU32::new(0);

pub struct HatMap {
    root: PhysAddr,
    /// Generation this map's kernel half was last synchronized at.
    synced_gen: AtomicU32,
    lock: Mutex<()>,
    is_kernel: bool,
}

fn flags_to_pte(flags: HatFlags, mode: PageMode) -> u64 {
    let mut pte = PTE_PRESENT;
    if flags.contains(HatFlags::WRITE) {
        pte |= PTE_WRITE;
    }
    if flags.contains(HatFlags::USER) {
        pte |= PTE_USER;
    }
    if flags.contains(HatFlags::GLOBAL) {
        pte |= PTE_GLOBAL;
    }
    if flags.contains(HatFlags::MMIO) {
        pte |= PTE_NO_CACHE | PTE_WRITE_THROUGH;
    }
    if flags.contains(HatFlags::FRAMEBUFFER) {
        // Write-combining would come from the PAT; write-through is the
        // portable approximation.
        pte |= PTE_WRITE_THROUGH;
    }
    if !flags.contains(HatFlags::EXECUTE) {
        pte |= PTE_NO_EXECUTE;
    }
    if mode != PageMode::Mode4K {
        pte |= PTE_SIZE;
    }
    pte
}

fn pte_to_flags(pte: u64) -> HatFlags {
    let mut flags = HatFlags::empty();
    if pte & PTE_WRITE != 0 {
        flags |= HatFlags::WRITE;
    }
    if pte & PTE_USER != 0 {
        flags |= HatFlags::USER;
    }
    if pte & PTE_GLOBAL != 0 {
        flags |= HatFlags::GLOBAL;
    }
    if pte & PTE_NO_CACHE != 0 {
        flags |= HatFlags::MMIO;
    }
    if pte & PTE_NO_EXECUTE == 0 {
        flags |= HatFlags::EXECUTE;
    }
    flags
}

fn table_entry(table: PhysAddr, index: usize) -> *mut u64 {
    unsafe { (phys_to_virt(table) as *mut u64).add(index) }
}

fn index_at(vaddr: usize, level: usize) -> usize {
    (vaddr >> (12 + 9 * (level - 1))) & (ENTRIES - 1)
}

fn mark_table_page(paddr: PhysAddr) {
    if let Some(info) = pmm::lookup(paddr) {
        unsafe { (*info).state = PageState::Table { valid_ptes: 0 } };
    }
}

fn adjust_valid_ptes(table: PhysAddr, delta: i32) {
    if let Some(info) = pmm::lookup(table) {
        let info = unsafe { &mut *info };
        if let PageState::Table { valid_ptes } = &mut info.state {
            *valid_ptes = (*valid_ptes as i32 + delta) as u16;
        }
    }
}

impl HatMap {
    /// Create an address space sharing the kernel half.
    pub fn create() -> Result<HatMap, HatError> {
        let root = pmm::alloc_zeroed().ok_or(HatError::PmAllocFailed)?;
        mark_table_page(root);

        let map = HatMap {
            root,
            synced_gen: AtomicU32::new(0),
            lock: Mutex::new(()),
            is_kernel: false,
        };
        map.sync_kernel_half();
        Ok(map)
    }

    fn new_kernel(root: PhysAddr) -> HatMap {
        HatMap {
            root,
            synced_gen: AtomicU32::new(0),
            lock: Mutex::new(()),
            is_kernel: true,
        }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Copy the kernel map's top-level kernel-half entries into this map if
    /// its view is stale.
    pub fn sync_kernel_half(&self) {
        if self.is_kernel {
            return;
        }
        let current = KERNEL_GEN.load(Ordering::Acquire);
        if self.synced_gen.swap(current, Ordering::AcqRel) == current {
            return;
        }
        let master = kernel_map().root;
        for index in ENTRIES / 2..ENTRIES {
            unsafe {
                *table_entry(self.root, index) = *table_entry(master, index);
            }
        }
    }

    /// Map `vaddr -> paddr` with the given leaf size. Fails with
    /// `MapAlreadyExists` if any translation already covers `vaddr`.
    pub fn map(
        &self,
        vaddr: usize,
        paddr: PhysAddr,
        flags: HatFlags,
        mode: PageMode,
    ) -> Result<(), HatError> {
        if mode > max_page_mode() {
            return Err(HatError::InvalidArg);
        }
        let align = mode.size();
        if vaddr % align != 0 || paddr % align != 0 {
            return Err(HatError::InvalidArg);
        }

        let _guard = self.lock.lock();

        let mut table = self.root;
        for level in (1..=LEVELS).rev() {
            let index = index_at(vaddr, level);
            let entry = table_entry(table, index);

            if level == mode as usize {
                if unsafe { *entry } & PTE_PRESENT != 0 {
                    return Err(HatError::MapAlreadyExists);
                }
                unsafe { *entry = (paddr as u64 & PTE_ADDR_MASK) | flags_to_pte(flags, mode) };
                adjust_valid_ptes(table, 1);
                return Ok(());
            }

            let current = unsafe { *entry };
            if current & PTE_PRESENT == 0 {
                let next = pmm::alloc_zeroed().ok_or(HatError::PmAllocFailed)?;
                mark_table_page(next);
                // Intermediate entries stay maximally permissive; leaves
                // carry the real permissions.
                unsafe {
                    *entry = (next as u64 & PTE_ADDR_MASK) | PTE_PRESENT | PTE_WRITE | PTE_USER
                };
                adjust_valid_ptes(table, 1);
                if self.is_kernel && level == LEVELS && vaddr >= KERNEL_SPLIT {
                    KERNEL_GEN.fetch_add(1, Ordering::AcqRel);
                }
                table = next;
            } else if current & PTE_SIZE != 0 {
                // A larger leaf already translates this address.
                return Err(HatError::MapAlreadyExists);
            } else {
                table = (current & PTE_ADDR_MASK) as PhysAddr;
            }
        }
        unreachable!("walk ran past the last level");
    }

    fn walk_to_leaf(&self, vaddr: usize) -> Result<(PhysAddr, usize, usize), HatError> {
        let mut table = self.root;
        for level in (1..=LEVELS).rev() {
            let index = index_at(vaddr, level);
            let entry = unsafe { *table_entry(table, index) };
            if entry & PTE_PRESENT == 0 {
                return Err(HatError::NoExistingMap);
            }
            if level == 1 || entry & PTE_SIZE != 0 {
                return Ok((table, index, level));
            }
            table = (entry & PTE_ADDR_MASK) as PhysAddr;
        }
        Err(HatError::NoExistingMap)
    }

    /// Remove the translation covering `vaddr`, returning what was mapped.
    pub fn unmap(&self, vaddr: usize) -> Result<HatMapping, HatError> {
        let _guard = self.lock.lock();

        let (table, index, level) = self.walk_to_leaf(vaddr)?;
        let entry = table_entry(table, index);
        let old = unsafe { *entry };
        unsafe { *entry = 0 };
        adjust_valid_ptes(table, -1);

        let mode = PageMode::from_level(level);
        drop(_guard);

        arch::flush_local_entry(vaddr);
        crate::smp::mail::request_remote_flush(vaddr & !(mode.size() - 1), mode.size());

        Ok(HatMapping {
            paddr: (old & PTE_ADDR_MASK) as PhysAddr,
            flags: pte_to_flags(old),
            mode,
        })
    }

    /// Query the translation covering `vaddr`.
    pub fn get_map(&self, vaddr: usize) -> Result<HatMapping, HatError> {
        let _guard = self.lock.lock();
        let (table, index, level) = self.walk_to_leaf(vaddr)?;
        let entry = unsafe { *table_entry(table, index) };
        Ok(HatMapping {
            paddr: (entry & PTE_ADDR_MASK) as PhysAddr,
            flags: pte_to_flags(entry),
            mode: PageMode::from_level(level),
        })
    }

    /// Change the target frame and/or flags of an existing translation.
    /// A strictly permission-widening change skips the TLB flush when the
    /// architecture allows it.
    pub fn set_map(
        &self,
        vaddr: usize,
        new_paddr: Option<PhysAddr>,
        new_flags: Option<HatFlags>,
    ) -> Result<HatMapping, HatError> {
        let _guard = self.lock.lock();

        let (table, index, level) = self.walk_to_leaf(vaddr)?;
        let mode = PageMode::from_level(level);
        let entry = table_entry(table, index);
        let old = unsafe { *entry };
        let old_mapping = HatMapping {
            paddr: (old & PTE_ADDR_MASK) as PhysAddr,
            flags: pte_to_flags(old),
            mode,
        };

        let paddr = new_paddr.unwrap_or(old_mapping.paddr);
        if paddr % mode.size() != 0 {
            return Err(HatError::InvalidArg);
        }
        let flags = new_flags.unwrap_or(old_mapping.flags);
        unsafe { *entry = (paddr as u64 & PTE_ADDR_MASK) | flags_to_pte(flags, mode) };
        drop(_guard);

        let widening = paddr == old_mapping.paddr && flags.contains(old_mapping.flags);
        if !widening || arch::flush_on_perms_upgrade() {
            arch::flush_local_entry(vaddr);
            crate::smp::mail::request_remote_flush(vaddr & !(mode.size() - 1), mode.size());
        }

        Ok(old_mapping)
    }

    /// Flush one entry or, with `None`, every translation of this space on
    /// the local cpu.
    pub fn flush(&self, vaddr: Option<usize>) {
        match vaddr {
            Some(vaddr) => arch::flush_local_entry(vaddr),
            None => arch::flush_local_all(),
        }
    }

    /// Install this space on the calling cpu.
    pub fn activate(&self) {
        self.sync_kernel_half();
        ACTIVE_ROOT[arch::cpu_id()].store(self.root, Ordering::Release);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.root, options(nostack));
        }
    }
}

impl Drop for HatMap {
    fn drop(&mut self) {
        if self.is_kernel {
            return;
        }
        // Free page-table pages in the private (lower) half only. Leaf
        // frames belong to their VM objects and are never touched here.
        for index in 0..ENTRIES / 2 {
            let entry = unsafe { *table_entry(self.root, index) };
            if entry & PTE_PRESENT != 0 && entry & PTE_SIZE == 0 {
                free_table_tree((entry & PTE_ADDR_MASK) as PhysAddr, LEVELS - 1);
            }
        }
        pmm::free(self.root);
    }
}

fn free_table_tree(table: PhysAddr, level: usize) {
    if level > 1 {
        for index in 0..ENTRIES {
            let entry = unsafe { *table_entry(table, index) };
            if entry & PTE_PRESENT != 0 && entry & PTE_SIZE == 0 {
                free_table_tree((entry & PTE_ADDR_MASK) as PhysAddr, level - 1);
            }
        }
    }
    pmm::free(table);
}

const ACTIVE_INIT: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_ROOT: [AtomicUsize; crate::smp::MAX_CPUS] = [ACTIVE_INIT; crate::smp::MAX_CPUS];

static KERNEL_MAP: Once<HatMap> = Once::new();

/// Build the kernel address space's map. First caller wins.
pub fn init_kernel_map() {
    KERNEL_MAP.call_once(|| {
        let root = pmm::alloc_zeroed().expect("no memory for kernel page tables");
        mark_table_page(root);
        HatMap::new_kernel(root)
    });
}

pub fn kernel_map() -> &'static HatMap {
    KERNEL_MAP.get().expect("kernel map used before init")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_VADDR: usize = 0x5000_0000_0000;

    #[test]
    fn map_unmap_restores_prior_state() {
        let _world = crate::test_support::world();
        let map = HatMap::create().unwrap();
        let frame = pmm::alloc().unwrap();

        assert_eq!(map.get_map(TEST_VADDR), Err(HatError::NoExistingMap));
        map.map(TEST_VADDR, frame, HatFlags::WRITE, PageMode::Mode4K)
            .unwrap();

        let mapping = map.get_map(TEST_VADDR).unwrap();
        assert_eq!(mapping.paddr, frame);
        assert!(mapping.flags.contains(HatFlags::WRITE));

        let prior = map.unmap(TEST_VADDR).unwrap();
        assert_eq!(prior.paddr, frame);
        // Idempotence: the entry is gone again.
        assert_eq!(map.get_map(TEST_VADDR), Err(HatError::NoExistingMap));

        pmm::free(frame);
    }

    #[test]
    fn double_map_is_distinguishable() {
        let _world = crate::test_support::world();
        let map = HatMap::create().unwrap();
        let frame = pmm::alloc().unwrap();

        map.map(TEST_VADDR, frame, HatFlags::empty(), PageMode::Mode4K)
            .unwrap();
        assert_eq!(
            map.map(TEST_VADDR, frame, HatFlags::empty(), PageMode::Mode4K),
            Err(HatError::MapAlreadyExists)
        );
        map.unmap(TEST_VADDR).unwrap();
        pmm::free(frame);
    }

    #[test]
    fn unaligned_arguments_are_rejected() {
        let _world = crate::test_support::world();
        let map = HatMap::create().unwrap();
        assert_eq!(
            map.map(TEST_VADDR + 1, 0x1000, HatFlags::empty(), PageMode::Mode4K),
            Err(HatError::InvalidArg)
        );
        assert_eq!(
            map.map(TEST_VADDR, 0x1000, HatFlags::empty(), PageMode::Mode2M),
            Err(HatError::InvalidArg)
        );
    }

    #[test]
    fn set_map_changes_flags_and_reports_old() {
        let _world = crate::test_support::world();
        let map = HatMap::create().unwrap();
        let frame = pmm::alloc().unwrap();

        map.map(TEST_VADDR, frame, HatFlags::empty(), PageMode::Mode4K)
            .unwrap();
        let old = map
            .set_map(TEST_VADDR, None, Some(HatFlags::WRITE))
            .unwrap();
        assert!(!old.flags.contains(HatFlags::WRITE));
        assert!(map
            .get_map(TEST_VADDR)
            .unwrap()
            .flags
            .contains(HatFlags::WRITE));

        map.unmap(TEST_VADDR).unwrap();
        pmm::free(frame);
    }

    #[test]
    fn kernel_half_syncs_by_generation() {
        let _world = crate::test_support::world();
        let space = HatMap::create().unwrap();

        // Grow the kernel half so the master's top level changes.
        let frame = pmm::alloc().unwrap();
        let kernel_vaddr = KERNEL_SPLIT + 0x40_0000_0000;
        kernel_map()
            .map(kernel_vaddr, frame, HatFlags::WRITE | HatFlags::GLOBAL, PageMode::Mode4K)
            .unwrap();

        // The user space sees it after re-sync (activation path).
        space.sync_kernel_half();
        let through_user = space.get_map(kernel_vaddr).unwrap();
        assert_eq!(through_user.paddr, frame);

        kernel_map().unmap(kernel_vaddr).unwrap();
        pmm::free(frame);
    }
}
