/// Virtual memory manager
///
/// One `AddressSpace` per process (plus the shared kernel space). A space
/// is an ordered, disjoint set of `VmRange`s under a read-write lock; each
/// range carries a typed backing (anonymous, MMIO, or file) that decides
/// how faults inside it are serviced. The backing dispatch is a closed
/// enum, so the fault path is one match over the type bits.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use super::hat::{HatError, HatFlags, HatMap, PageMode};
use super::page::{page_align_down, page_align_up, PhysAddr, PAGE_SIZE};
use super::vmo::{VmObject, VmoKind};
use super::{phys_to_virt, pmm};
use crate::fs::FileCache;
use crate::runlevel::{self, RunLevel};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const WRITE   = 1 << 0;
        const EXEC    = 1 << 1;
        const USER    = 1 << 2;
        /// Unmapped guard range: never backed, faults are always bad.
        const GUARDED = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFaultFlags: u32 {
        const WRITE = 1 << 0;
        const FETCH = 1 << 1;
        const USER  = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    OutOfVirtualSpace,
    InvalidArg,
    /// No range covers the address (user-fatal; kernel addresses panic).
    NoRange,
    /// The access violates the range's permissions or type.
    BadAccess,
    HatFailed(HatError),
}

/// What a new range should be backed by.
pub enum VmInitArg {
    Anon,
    Mmio {
        paddr: PhysAddr,
    },
    File {
        cache: Arc<FileCache>,
        offset: usize,
        private: bool,
    },
}

/// Bounds and alignment for interval selection.
#[derive(Debug, Clone, Copy)]
pub struct VmAllocLimits {
    pub lower_bound: usize,
    pub upper_bound: usize,
    pub alignment: usize,
}

impl Default for VmAllocLimits {
    fn default() -> Self {
        Self {
            lower_bound: 0,
            upper_bound: usize::MAX,
            alignment: PAGE_SIZE,
        }
    }
}

/// Typed backing of a range; the VmDriver dispatch key. Offsets exist so a
/// split range's halves keep addressing the same backing object.
enum VmBacking {
    Anon {
        vmo: Arc<VmObject>,
        offset: usize,
    },
    Mmio {
        paddr: PhysAddr,
    },
    File {
        vmo: Arc<VmObject>,
        offset: usize,
        private: bool,
    },
}

pub struct VmRange {
    base: usize,
    length: usize,
    flags: VmFlags,
    backing: VmBacking,
}

impl VmRange {
    pub fn base(&self) -> usize {
        self.base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    fn top(&self) -> usize {
        self.base + self.length
    }
}

/// Public descriptor of an allocated range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmRangeDesc {
    pub base: usize,
    pub length: usize,
}

pub struct AddressSpace {
    /// None means the shared kernel map.
    hat: Option<HatMap>,
    ranges: RwLock<Vec<VmRange>>,
    lower_bound: usize,
    upper_bound: usize,
}

/// Kernel-space window handed to VMM allocations (heap, wired ranges).
const KERNEL_VM_BASE: usize = 0xFFFF_A000_0000_0000;
const KERNEL_VM_TOP: usize = 0xFFFF_B000_0000_0000;

const USER_VM_BASE: usize = 0x1000;
const USER_VM_TOP: usize = 0x0000_7FFF_FFFF_F000;

lazy_static::lazy_static! {
    static ref KERNEL_SPACE: AddressSpace = AddressSpace {
        hat: None,
        ranges: RwLock::new(Vec::new()),
        lower_bound: KERNEL_VM_BASE,
        upper_bound: KERNEL_VM_TOP,
    };
}

/// The unique kernel address space.
pub fn kernel_space() -> &'static AddressSpace {
    &KERNEL_SPACE
}

impl AddressSpace {
    /// Create a user address space sharing the kernel half.
    pub fn new_user() -> Result<Arc<AddressSpace>, VmError> {
        let hat = HatMap::create().map_err(VmError::HatFailed)?;
        Ok(Arc::new(AddressSpace {
            hat: Some(hat),
            ranges: RwLock::new(Vec::new()),
            lower_bound: USER_VM_BASE,
            upper_bound: USER_VM_TOP,
        }))
    }

    pub fn hat(&self) -> &HatMap {
        self.hat.as_ref().unwrap_or_else(|| super::hat::kernel_map())
    }

    fn hat_flags(&self, flags: VmFlags, mmio: bool) -> HatFlags {
        let mut hat = HatFlags::empty();
        if flags.contains(VmFlags::WRITE) {
            hat |= HatFlags::WRITE;
        }
        if flags.contains(VmFlags::EXEC) {
            hat |= HatFlags::EXECUTE;
        }
        if flags.contains(VmFlags::USER) {
            hat |= HatFlags::USER;
        }
        if self.hat.is_none() {
            hat |= HatFlags::GLOBAL;
        }
        if mmio {
            hat |= HatFlags::MMIO;
        }
        hat
    }

    /// Allocate a range of `length` bytes backed per `init`. Interval
    /// selection honors `limits`; the backing driver's query can only
    /// tighten them.
    pub fn alloc(
        &self,
        length: usize,
        init: VmInitArg,
        flags: VmFlags,
        limits: VmAllocLimits,
    ) -> Result<VmRangeDesc, VmError> {
        runlevel::assert_at_most(RunLevel::Normal);
        if length == 0 || !limits.alignment.is_power_of_two() {
            return Err(VmError::InvalidArg);
        }

        // Driver query: required size and alignment for this backing.
        let (length, alignment) = match &init {
            VmInitArg::Anon => (page_align_up(length), limits.alignment.max(PAGE_SIZE)),
            VmInitArg::Mmio { paddr } => {
                // The window must cover the offset of the target within its
                // first page.
                let offset = paddr % PAGE_SIZE;
                (page_align_up(length + offset), limits.alignment.max(PAGE_SIZE))
            }
            VmInitArg::File { offset, cache, .. } => {
                if *offset % PAGE_SIZE != 0 || *offset >= cache.length() {
                    return Err(VmError::InvalidArg);
                }
                (page_align_up(length), limits.alignment.max(PAGE_SIZE))
            }
        };

        let mut ranges = self.ranges.write();

        // First-fit scan of the gaps between existing ranges.
        let lower = self.lower_bound.max(limits.lower_bound);
        let upper = self.upper_bound.min(limits.upper_bound);
        let mut candidate = align_up_to(lower, alignment);
        let mut insert_at = ranges.len();
        for (index, range) in ranges.iter().enumerate() {
            if candidate + length <= range.base {
                insert_at = index;
                break;
            }
            candidate = align_up_to(candidate.max(range.top()), alignment);
        }
        if candidate + length > upper {
            return Err(VmError::OutOfVirtualSpace);
        }

        // Attach the backing.
        let backing = match init {
            VmInitArg::Anon => VmBacking::Anon {
                vmo: VmObject::new_anon(length),
                offset: 0,
            },
            VmInitArg::Mmio { paddr } => {
                // Eagerly map the whole window; MMIO never faults.
                let base_paddr = page_align_down(paddr);
                let hat_flags = self.hat_flags(flags, true);
                for page in (0..length).step_by(PAGE_SIZE) {
                    self.hat()
                        .map(candidate + page, base_paddr + page, hat_flags, PageMode::Mode4K)
                        .map_err(VmError::HatFailed)?;
                }
                VmBacking::Mmio { paddr: base_paddr }
            }
            VmInitArg::File {
                cache,
                offset,
                private,
            } => {
                let vmo = VmObject::new_file(cache, length);
                vmo.add_view();
                VmBacking::File {
                    vmo,
                    offset,
                    private,
                }
            }
        };
        if let VmBacking::Anon { vmo, .. } = &backing {
            vmo.add_view();
        }

        ranges.insert(
            insert_at,
            VmRange {
                base: candidate,
                length,
                flags,
                backing,
            },
        );
        debug_assert!(ranges_are_ordered(&ranges));

        Ok(VmRangeDesc {
            base: candidate,
            length,
        })
    }

    /// Release the range starting exactly at `base`. A second free of the
    /// same base returns false.
    pub fn free(&self, base: usize) -> bool {
        runlevel::assert_at_most(RunLevel::Normal);
        let mut ranges = self.ranges.write();
        let Some(index) = ranges.iter().position(|r| r.base == base) else {
            return false;
        };
        let range = ranges.remove(index);
        drop(ranges);
        self.detach(&range);
        true
    }

    fn detach(&self, range: &VmRange) {
        match &range.backing {
            VmBacking::Anon { vmo, .. } => {
                for page in (0..range.length).step_by(PAGE_SIZE) {
                    let _ = self.hat().unmap(range.base + page);
                }
                vmo.remove_view();
                // Dropping the last reference frees the frames.
            }
            VmBacking::Mmio { .. } => {
                for page in (0..range.length).step_by(PAGE_SIZE) {
                    let _ = self.hat().unmap(range.base + page);
                }
            }
            VmBacking::File { vmo, .. } => {
                for page in (0..range.length).step_by(PAGE_SIZE) {
                    let _ = self.hat().unmap(range.base + page);
                }
                vmo.remove_view();
            }
        }
    }

    /// Service a fault at `addr`. On success the faulting instruction can
    /// be restarted; user faults outside any range report `NoRange`;
    /// kernel faults outside any range are unrecoverable.
    pub fn handle_fault(&self, addr: usize, fault: VmFaultFlags) -> Result<(), VmError> {
        let ranges = self.ranges.read();
        let Some(range) = ranges.iter().find(|r| r.base <= addr && addr < r.top()) else {
            drop(ranges);
            if fault.contains(VmFaultFlags::USER) {
                crate::debug!("User fault at {:#x} outside any range", addr);
                return Err(VmError::NoRange);
            }
            panic!("kernel page fault at {:#x} outside any known range", addr);
        };

        if range.flags.contains(VmFlags::GUARDED) {
            return Err(VmError::BadAccess);
        }
        if fault.contains(VmFaultFlags::WRITE) && !range.flags.contains(VmFlags::WRITE) {
            return Err(VmError::BadAccess);
        }
        if fault.contains(VmFaultFlags::FETCH) && !range.flags.contains(VmFlags::EXEC) {
            return Err(VmError::BadAccess);
        }

        let page_base = page_align_down(addr);
        let index = (page_base - range.base) / PAGE_SIZE;

        match &range.backing {
            VmBacking::Anon { vmo, offset } => {
                let index = index + offset / PAGE_SIZE;
                if vmo.get_page(index).is_some() {
                    // Already resident: a benign race with another cpu.
                    return Ok(());
                }
                let frame = pmm::alloc_zeroed().ok_or(VmError::OutOfMemory)?;
                let hat_flags = self.hat_flags(range.flags, false);
                match self.hat().map(page_base, frame, hat_flags, PageMode::Mode4K) {
                    Ok(()) => {}
                    Err(HatError::MapAlreadyExists) => {
                        pmm::free(frame);
                        return Ok(());
                    }
                    Err(err) => {
                        pmm::free(frame);
                        return Err(VmError::HatFailed(err));
                    }
                }
                vmo.install_page(index, frame);
                Ok(())
            }
            VmBacking::Mmio { .. } => {
                // Eagerly mapped; a fault here means the mapping is gone.
                Err(VmError::BadAccess)
            }
            VmBacking::File {
                vmo,
                offset,
                private,
            } => self.handle_file_fault(range, vmo, *offset, *private, page_base, index, fault),
        }
    }

    fn handle_file_fault(
        &self,
        range: &VmRange,
        vmo: &Arc<VmObject>,
        offset: usize,
        private: bool,
        page_base: usize,
        index: usize,
        fault: VmFaultFlags,
    ) -> Result<(), VmError> {
        let VmoKind::File { cache } = vmo.kind() else {
            return Err(VmError::BadAccess);
        };
        let file_offset = offset + index * PAGE_SIZE;
        // Overlay pages are keyed by file offset so split views stay
        // coherent.
        let index = file_offset / PAGE_SIZE;

        // A private view that already copied up services everything from
        // its own frame.
        if let Some(frame) = vmo.get_page(index) {
            let hat_flags = self.hat_flags(range.flags, false);
            match self.hat().set_map(page_base, Some(frame), Some(hat_flags)) {
                Ok(_) => return Ok(()),
                Err(HatError::NoExistingMap) => {
                    return self
                        .hat()
                        .map(page_base, frame, hat_flags, PageMode::Mode4K)
                        .map_err(VmError::HatFailed)
                }
                Err(err) => return Err(VmError::HatFailed(err)),
            }
        }

        let unit = cache.get_unit(file_offset, true).ok_or(VmError::BadAccess)?;

        if !fault.contains(VmFaultFlags::WRITE) {
            // Install read-only until a write fault upgrades it.
            let hat_flags = self.hat_flags(range.flags & !VmFlags::WRITE, false);
            return match self.hat().map(page_base, unit.paddr, hat_flags, PageMode::Mode4K) {
                Ok(()) | Err(HatError::MapAlreadyExists) => Ok(()),
                Err(err) => Err(VmError::HatFailed(err)),
            };
        }

        if private {
            // Copy-up: the view gets its own frame from here on.
            let frame = pmm::alloc().ok_or(VmError::OutOfMemory)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_to_virt(unit.paddr),
                    phys_to_virt(frame),
                    PAGE_SIZE,
                );
            }
            let hat_flags = self.hat_flags(range.flags, false);
            let result = match self.hat().set_map(page_base, Some(frame), Some(hat_flags)) {
                Ok(_) => Ok(()),
                Err(HatError::NoExistingMap) => self
                    .hat()
                    .map(page_base, frame, hat_flags, PageMode::Mode4K)
                    .map_err(VmError::HatFailed),
                Err(err) => Err(VmError::HatFailed(err)),
            };
            if result.is_err() {
                pmm::free(frame);
                return result;
            }
            vmo.install_page(index, frame);
            Ok(())
        } else {
            // Shared view: write through to the cache frame.
            cache.mark_dirty(file_offset);
            let hat_flags = self.hat_flags(range.flags, false);
            match self.hat().set_map(page_base, Some(unit.paddr), Some(hat_flags)) {
                Ok(_) => Ok(()),
                Err(HatError::NoExistingMap) => self
                    .hat()
                    .map(page_base, unit.paddr, hat_flags, PageMode::Mode4K)
                    .map_err(VmError::HatFailed),
                Err(err) => Err(VmError::HatFailed(err)),
            }
        }
    }

    /// Change the protection flags of the range starting at `base`,
    /// updating every resident mapping. Strictly widening changes let the
    /// HAT skip TLB flushes where the architecture allows.
    pub fn modify_range(&self, base: usize, new_flags: VmFlags) -> Result<(), VmError> {
        runlevel::assert_at_most(RunLevel::Normal);
        let mut ranges = self.ranges.write();
        let range = ranges
            .iter_mut()
            .find(|r| r.base == base)
            .ok_or(VmError::NoRange)?;

        let mmio = matches!(range.backing, VmBacking::Mmio { .. });
        let hat_flags = self.hat_flags(new_flags, mmio);
        for page in (0..range.length).step_by(PAGE_SIZE) {
            match self.hat().set_map(range.base + page, None, Some(hat_flags)) {
                Ok(_) | Err(HatError::NoExistingMap) => {}
                Err(err) => return Err(VmError::HatFailed(err)),
            }
        }
        range.flags = new_flags;
        Ok(())
    }

    /// Split the range starting at `base` into two at `at_offset` bytes.
    /// Both halves keep the same backing object; returns the bases of the
    /// resulting ranges.
    pub fn split(&self, base: usize, at_offset: usize) -> Result<(usize, usize), VmError> {
        runlevel::assert_at_most(RunLevel::Normal);
        if at_offset == 0 || at_offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArg);
        }

        let mut ranges = self.ranges.write();
        let index = ranges
            .iter()
            .position(|r| r.base == base)
            .ok_or(VmError::NoRange)?;
        if at_offset >= ranges[index].length {
            return Err(VmError::InvalidArg);
        }

        let range = &mut ranges[index];
        let tail_backing = match &range.backing {
            VmBacking::Anon { vmo, offset } => {
                vmo.add_view();
                VmBacking::Anon {
                    vmo: vmo.clone(),
                    offset: offset + at_offset,
                }
            }
            VmBacking::Mmio { paddr } => VmBacking::Mmio {
                paddr: paddr + at_offset,
            },
            VmBacking::File {
                vmo,
                offset,
                private,
            } => {
                vmo.add_view();
                VmBacking::File {
                    vmo: vmo.clone(),
                    offset: offset + at_offset,
                    private: *private,
                }
            }
        };

        let tail = VmRange {
            base: range.base + at_offset,
            length: range.length - at_offset,
            flags: range.flags,
            backing: tail_backing,
        };
        range.length = at_offset;
        ranges.insert(index + 1, tail);
        debug_assert!(ranges_are_ordered(&ranges));

        Ok((base, base + at_offset))
    }

    /// Physical address backing `vaddr`, if mapped.
    pub fn get_physical(&self, vaddr: usize) -> Option<PhysAddr> {
        let mapping = self.hat().get_map(page_align_down(vaddr)).ok()?;
        let within = vaddr & (mapping.mode.size() - 1);
        Some(mapping.paddr + within)
    }

    /// Copy `src` into this space at `dst_vaddr`, faulting pages in as
    /// needed. Returns the number of bytes copied; stops early at the first
    /// unresolvable page.
    pub fn copy_out(&self, dst_vaddr: usize, src: &[u8]) -> usize {
        self.copy_bytes(dst_vaddr, src.len(), |paddr, offset, chunk| unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(offset),
                phys_to_virt(paddr),
                chunk,
            );
        }, VmFaultFlags::WRITE)
    }

    /// Copy from this space at `src_vaddr` into `dst`. Returns bytes copied.
    pub fn copy_in(&self, dst: &mut [u8], src_vaddr: usize) -> usize {
        self.copy_bytes(src_vaddr, dst.len(), |paddr, offset, chunk| unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(paddr),
                dst.as_mut_ptr().add(offset),
                chunk,
            );
        }, VmFaultFlags::empty())
    }

    fn copy_bytes(
        &self,
        vaddr: usize,
        length: usize,
        mut transfer: impl FnMut(PhysAddr, usize, usize),
        fault: VmFaultFlags,
    ) -> usize {
        // The abort hook catches hardware faults taken mid-copy on real
        // machines; the explicit lookup below keeps the hosted path exact.
        crate::arch::set_unsafe_op_abort(copy_abort_landing as usize);

        let mut copied = 0;
        while copied < length {
            let current = vaddr + copied;
            let chunk = (PAGE_SIZE - (current % PAGE_SIZE)).min(length - copied);

            let paddr = match self.get_physical(current) {
                Some(paddr) => Some(paddr),
                None => match self.handle_fault(current, fault) {
                    Ok(()) => self.get_physical(current),
                    Err(_) => None,
                },
            };
            let Some(paddr) = paddr else { break };

            transfer(paddr, copied, chunk);
            copied += chunk;
        }

        crate::arch::clear_unsafe_op_abort();
        copied
    }

    /// Install this space on the calling cpu.
    pub fn make_active(&self) {
        self.hat().activate();
    }

    /// True when `[base, base+length)` lies inside one allocated range with
    /// at least `flags`.
    pub fn range_exists(&self, base: usize, length: usize, flags: VmFlags) -> bool {
        let ranges = self.ranges.read();
        ranges
            .iter()
            .any(|r| r.base <= base && base + length <= r.top() && r.flags.contains(flags))
    }

    #[cfg(test)]
    pub fn range_count(&self) -> usize {
        self.ranges.read().len()
    }
}

fn copy_abort_landing() {
    // Reached from the trap path when a hardware fault interrupts a copy;
    // nothing to unwind, the copy loop observes the miss and stops.
}

fn align_up_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn ranges_are_ordered(ranges: &[VmRange]) -> bool {
    ranges.windows(2).all(|pair| pair[0].top() <= pair[1].base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_space() -> Arc<AddressSpace> {
        AddressSpace::new_user().unwrap()
    }

    #[test]
    fn ranges_stay_disjoint_and_ordered() {
        let _world = crate::test_support::world();
        let space = anon_space();

        let mut descs = Vec::new();
        for _ in 0..6 {
            descs.push(
                space
                    .alloc(3 * PAGE_SIZE, VmInitArg::Anon, VmFlags::WRITE, Default::default())
                    .unwrap(),
            );
        }
        for a in &descs {
            for b in &descs {
                if a.base != b.base {
                    assert!(a.base + a.length <= b.base || b.base + b.length <= a.base);
                }
            }
        }

        // Free one in the middle and reallocate: still disjoint.
        assert!(space.free(descs[2].base));
        let again = space
            .alloc(PAGE_SIZE, VmInitArg::Anon, VmFlags::WRITE, Default::default())
            .unwrap();
        assert!(space.range_exists(again.base, again.length, VmFlags::WRITE));
    }

    #[test]
    fn second_free_returns_false() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(PAGE_SIZE, VmInitArg::Anon, VmFlags::empty(), Default::default())
            .unwrap();
        assert!(space.free(desc.base));
        assert!(!space.free(desc.base));
    }

    #[test]
    fn anon_fault_installs_zero_page() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(
                PAGE_SIZE,
                VmInitArg::Anon,
                VmFlags::WRITE | VmFlags::USER,
                VmAllocLimits {
                    lower_bound: 0x1_0000_0000,
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(space.get_physical(desc.base).is_none());
        space
            .handle_fault(desc.base, VmFaultFlags::USER)
            .expect("anon read fault is always good");

        let paddr = space.get_physical(desc.base).expect("page now resident");
        assert_ne!(paddr, 0);
        let bytes = unsafe { core::slice::from_raw_parts(phys_to_virt(paddr), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0), "anon pages are zero-filled");

        // A write through the mapping then reads back.
        space
            .handle_fault(desc.base, VmFaultFlags::USER | VmFaultFlags::WRITE)
            .expect("write fault on writable range");
        unsafe { *phys_to_virt(paddr) = 0x5A };
        let mut byte = [0u8; 1];
        assert_eq!(space.copy_in(&mut byte, desc.base), 1);
        assert_eq!(byte[0], 0x5A);
    }

    #[test]
    fn faults_outside_ranges_are_fatal_for_user() {
        let _world = crate::test_support::world();
        let space = anon_space();
        assert_eq!(
            space.handle_fault(0x7000_0000, VmFaultFlags::USER),
            Err(VmError::NoRange)
        );
    }

    #[test]
    fn write_fault_on_readonly_range_is_bad_access() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(PAGE_SIZE, VmInitArg::Anon, VmFlags::USER, Default::default())
            .unwrap();
        assert_eq!(
            space.handle_fault(desc.base, VmFaultFlags::USER | VmFaultFlags::WRITE),
            Err(VmError::BadAccess)
        );
    }

    #[test]
    fn copy_out_faults_pages_in() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(
                3 * PAGE_SIZE,
                VmInitArg::Anon,
                VmFlags::WRITE | VmFlags::USER,
                Default::default(),
            )
            .unwrap();

        let message = alloc::vec![0xC3u8; 2 * PAGE_SIZE + 17];
        let copied = space.copy_out(desc.base + 5, &message);
        assert_eq!(copied, message.len());

        let mut back = alloc::vec![0u8; message.len()];
        assert_eq!(space.copy_in(&mut back, desc.base + 5), message.len());
        assert_eq!(back, message);
    }

    #[test]
    fn file_backed_range_reads_cache_and_copies_up() {
        let _world = crate::test_support::world();
        let backend = crate::fs::file_cache::test_backend::PatternBackend::new();
        let id = crate::fs::FileId {
            driver_id: 9,
            vnode_id: 90,
        };
        let cache = crate::fs::FileCache::new(id, 4 * PAGE_SIZE, backend);
        let space = anon_space();

        let desc = space
            .alloc(
                2 * PAGE_SIZE,
                VmInitArg::File {
                    cache: cache.clone(),
                    offset: 0,
                    private: true,
                },
                VmFlags::WRITE | VmFlags::USER,
                Default::default(),
            )
            .unwrap();

        // Read fault: the mapping must expose cache contents.
        space.handle_fault(desc.base, VmFaultFlags::USER).unwrap();
        let shared = space.get_physical(desc.base).unwrap();
        let cached = cache.get_unit(0, false).unwrap().paddr;
        assert_eq!(shared, cached);

        // Write fault on a private view: copy-up to a fresh frame.
        space
            .handle_fault(desc.base, VmFaultFlags::USER | VmFaultFlags::WRITE)
            .unwrap();
        let private = space.get_physical(desc.base).unwrap();
        assert_ne!(private, cached, "private write must not hit the cache frame");
        let byte = unsafe { *phys_to_virt(private).add(3) };
        assert_eq!(byte, 3, "copy-up preserved file contents");
    }

    #[test]
    fn split_halves_share_backing_and_free_independently() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(
                4 * PAGE_SIZE,
                VmInitArg::Anon,
                VmFlags::WRITE | VmFlags::USER,
                Default::default(),
            )
            .unwrap();

        // Fault a page into what will become the tail half.
        let tail_addr = desc.base + 3 * PAGE_SIZE;
        space
            .handle_fault(tail_addr, VmFaultFlags::USER | VmFaultFlags::WRITE)
            .unwrap();
        let before = space.get_physical(tail_addr).unwrap();

        let (head, tail) = space.split(desc.base, 2 * PAGE_SIZE).unwrap();
        assert_eq!(head, desc.base);
        assert_eq!(tail, desc.base + 2 * PAGE_SIZE);

        // The resident page still resolves identically through the tail.
        space
            .handle_fault(tail_addr, VmFaultFlags::USER | VmFaultFlags::WRITE)
            .unwrap();
        assert_eq!(space.get_physical(tail_addr), Some(before));

        // The halves are independent ranges now.
        assert!(space.free(head));
        assert!(space.range_exists(tail, PAGE_SIZE, VmFlags::WRITE));
        assert!(space.free(tail));
    }

    #[test]
    fn modify_range_updates_flags_and_mappings() {
        let _world = crate::test_support::world();
        let space = anon_space();
        let desc = space
            .alloc(
                PAGE_SIZE,
                VmInitArg::Anon,
                VmFlags::WRITE | VmFlags::USER,
                Default::default(),
            )
            .unwrap();
        space
            .handle_fault(desc.base, VmFaultFlags::USER | VmFaultFlags::WRITE)
            .unwrap();

        space.modify_range(desc.base, VmFlags::USER).unwrap();
        // Writes now violate the range's permissions.
        assert_eq!(
            space.handle_fault(desc.base, VmFaultFlags::USER | VmFaultFlags::WRITE),
            Err(VmError::BadAccess)
        );
        assert!(space.range_exists(desc.base, PAGE_SIZE, VmFlags::USER));
        assert!(!space.range_exists(desc.base, PAGE_SIZE, VmFlags::WRITE));
    }

    #[test]
    fn mmio_ranges_map_eagerly() {
        let _world = crate::test_support::world();
        let space = anon_space();
        // A fake device window: any frame works since nothing dereferences
        // it as a device here.
        let window = pmm::alloc().unwrap();

        let desc = space
            .alloc(
                PAGE_SIZE,
                VmInitArg::Mmio { paddr: window },
                VmFlags::WRITE,
                Default::default(),
            )
            .unwrap();
        assert_eq!(space.get_physical(desc.base), Some(window));
        assert!(space.free(desc.base));
        pmm::free(window);
    }
}
