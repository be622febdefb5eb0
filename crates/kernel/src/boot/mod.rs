/// Boot path
///
/// A protocol-agnostic `LoaderHandoff` carries everything the kernel needs
/// from the boot loader; `bootinfo` translates the x86_64 wire format into
/// it. `init` runs the bring-up sequence proper and owns per-cpu entry.

pub mod init;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod bootinfo;

pub use init::{kernel_entry, per_core_entry};

use crate::lib::error::KernelError;
use crate::mm::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemmapKind {
    Usable,
    /// Usable once no cpu references loader data any more.
    Reclaimable,
}

#[derive(Debug, Clone, Copy)]
pub struct MemmapEntry {
    pub base: usize,
    pub length: usize,
    pub kind: MemmapKind,
}

#[derive(Debug, Clone, Copy)]
pub struct Framebuffer {
    pub address: usize,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
    pub bits_per_pixel: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct Module {
    pub name: &'static str,
    pub base: usize,
    pub length: usize,
}

/// Everything the kernel consumes from the boot protocol.
pub struct LoaderHandoff {
    pub hhdm_base: usize,
    pub hhdm_length: usize,
    pub memmap: heapless::Vec<MemmapEntry, 64>,
    pub rsdp: Option<usize>,
    pub dtb: Option<usize>,
    pub kernel_phys_base: usize,
    pub kernel_virt_base: usize,
    pub kernel_length: usize,
    pub cmdline: &'static str,
    pub framebuffers: heapless::Vec<Framebuffer, 4>,
    pub modules: heapless::Vec<Module, 16>,
    /// Cpus the boot protocol started (including the BSP).
    pub cpu_count: usize,
}

impl LoaderHandoff {
    pub fn empty() -> Self {
        Self {
            hhdm_base: 0,
            hhdm_length: 0,
            memmap: heapless::Vec::new(),
            rsdp: None,
            dtb: None,
            kernel_phys_base: 0,
            kernel_virt_base: 0,
            kernel_length: 0,
            cmdline: "",
            framebuffers: heapless::Vec::new(),
            modules: heapless::Vec::new(),
            cpu_count: 1,
        }
    }

    /// Check the loader gave us a world we can stand on.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.hhdm_length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut usable_bytes = 0;
        let mut last_top = 0;
        for entry in self.memmap.iter() {
            if entry.length == 0 || entry.base % PAGE_SIZE != 0 {
                return Err(KernelError::InvalidArgument);
            }
            // The memmap must be sorted and non-overlapping.
            if entry.base < last_top {
                return Err(KernelError::InvalidArgument);
            }
            last_top = entry.base + entry.length;
            if entry.kind == MemmapKind::Usable {
                usable_bytes += entry.length;
            }
            // Everything must be visible through the direct map.
            if last_top > self.hhdm_length {
                return Err(KernelError::InvalidArgument);
            }
        }
        if usable_bytes == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if self.cpu_count == 0 || self.cpu_count > crate::smp::MAX_CPUS {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    pub fn usable_ranges(&self) -> heapless::Vec<(usize, usize), 64> {
        self.memmap
            .iter()
            .filter(|e| e.kind == MemmapKind::Usable)
            .map(|e| (e.base, e.length))
            .collect()
    }

    pub fn reclaimable_ranges(&self) -> heapless::Vec<(usize, usize), 64> {
        self.memmap
            .iter()
            .filter(|e| e.kind == MemmapKind::Reclaimable)
            .map(|e| (e.base, e.length))
            .collect()
    }

    /// The boot archive holding early drivers and configuration.
    pub fn initdisk(&self) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == "initdisk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_handoff() -> LoaderHandoff {
        let mut handoff = LoaderHandoff::empty();
        handoff.hhdm_base = 0xFFFF_8000_0000_0000;
        handoff.hhdm_length = 1 << 40;
        handoff
            .memmap
            .push(MemmapEntry {
                base: 0x10_0000,
                length: 0x40_0000,
                kind: MemmapKind::Usable,
            })
            .unwrap();
        handoff
            .memmap
            .push(MemmapEntry {
                base: 0x80_0000,
                length: 0x10_0000,
                kind: MemmapKind::Reclaimable,
            })
            .unwrap();
        handoff
    }

    #[test]
    fn valid_handoffs_pass() {
        assert!(valid_handoff().validate().is_ok());
    }

    #[test]
    fn missing_hhdm_is_rejected() {
        let mut handoff = valid_handoff();
        handoff.hhdm_length = 0;
        assert_eq!(handoff.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn overlapping_memmap_is_rejected() {
        let mut handoff = valid_handoff();
        handoff
            .memmap
            .push(MemmapEntry {
                base: 0x82_0000,
                length: PAGE_SIZE,
                kind: MemmapKind::Usable,
            })
            .unwrap();
        assert_eq!(handoff.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn handoff_without_usable_memory_is_rejected() {
        let mut handoff = valid_handoff();
        handoff.memmap.clear();
        handoff
            .memmap
            .push(MemmapEntry {
                base: 0x10_0000,
                length: PAGE_SIZE,
                kind: MemmapKind::Reclaimable,
            })
            .unwrap();
        assert_eq!(handoff.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn initdisk_module_is_found_by_name() {
        let mut handoff = valid_handoff();
        handoff
            .modules
            .push(Module {
                name: "initdisk",
                base: 0x100_0000,
                length: 0x8000,
            })
            .unwrap();
        assert_eq!(handoff.initdisk().unwrap().length, 0x8000);
    }
}
