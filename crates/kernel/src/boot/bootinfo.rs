/// Boot-protocol shim for x86_64
///
/// Translates the `bootloader_api` handoff into the protocol-agnostic
/// `LoaderHandoff`. The boot config asks the loader for a full physical
/// memory mapping, which becomes the kernel's direct map.

use bootloader_api::config::Mapping;
use bootloader_api::info::{MemoryRegionKind, Optional};
use bootloader_api::{BootInfo, BootloaderConfig};

use super::{LoaderHandoff, MemmapEntry, MemmapKind, Module};
use crate::mm::page_align_down;

pub const BOOT_CONFIG: BootloaderConfig = {
    let mut config = BootloaderConfig::new_default();
    config.mappings.physical_memory = Some(Mapping::Dynamic);
    config
};

fn optional<T>(value: Optional<T>) -> Option<T> {
    match value {
        Optional::Some(value) => Some(value),
        Optional::None => None,
    }
}

pub fn translate(info: &'static mut BootInfo) -> LoaderHandoff {
    let mut handoff = LoaderHandoff::empty();

    handoff.hhdm_base = optional(info.physical_memory_offset)
        .expect("boot protocol did not map physical memory") as usize;

    // Sort and merge the loader's region list; adjacent same-kind regions
    // collapse so the 64-entry handoff map suffices.
    let regions = &mut *info.memory_regions;
    regions.sort_unstable_by_key(|region| region.start);

    let mut top_of_memory = 0usize;
    let mut pending: Option<MemmapEntry> = None;
    for region in regions.iter() {
        let kind = match region.kind {
            MemoryRegionKind::Usable => MemmapKind::Usable,
            MemoryRegionKind::Bootloader => MemmapKind::Reclaimable,
            _ => {
                top_of_memory = top_of_memory.max(region.end as usize);
                continue;
            }
        };
        top_of_memory = top_of_memory.max(region.end as usize);

        let base = region.start as usize;
        let length = (region.end - region.start) as usize;
        match &mut pending {
            Some(entry) if entry.kind == kind && entry.base + entry.length == base => {
                entry.length += length;
            }
            _ => {
                if let Some(entry) = pending.take() {
                    if handoff.memmap.push(entry).is_err() {
                        break;
                    }
                }
                pending = Some(MemmapEntry { base, length, kind });
            }
        }
    }
    if let Some(entry) = pending {
        let _ = handoff.memmap.push(entry);
    }

    // The direct map must cover everything the memmap names.
    handoff.hhdm_length = top_of_memory;

    handoff.rsdp = optional(info.rsdp_addr).map(|addr| addr as usize);
    handoff.kernel_phys_base = page_align_down(info.kernel_addr as usize);
    handoff.kernel_virt_base = page_align_down(info.kernel_image_offset as usize);
    handoff.kernel_length = info.kernel_len as usize;

    if let (Some(base), len) = (optional(info.ramdisk_addr), info.ramdisk_len) {
        if len != 0 {
            let _ = handoff.modules.push(Module {
                name: "initdisk",
                base: base as usize,
                length: len as usize,
            });
        }
    }

    // The framebuffer's physical address is not part of this protocol's
    // handoff, so the framebuffer list stays empty here; display drivers
    // discover the device through PCI instead.

    handoff.cpu_count = 1;
    handoff
}
