/// Driver framework
///
/// Drivers register a manifest (guid, friendly name, api version, event
/// callback, load names) and receive lifecycle events from the core. A
/// driver exposes its devices as typed device APIs; consumers find APIs by
/// type tag. I/O travels as packets (IOPs) through a stack of device APIs,
/// forward on begin and reverse on end, with one frame of scratch state per
/// API.
///
/// Device naming and power policy are the drivers' business, not the
/// core's.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::lib::error::KernelError;

pub type DriverGuid = u128;

/// Tags describing a discovered device (bus coordinates, compatible ids).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTag {
    pub name: String,
    pub value: u64,
}

impl DeviceTag {
    pub fn new(name: &str, value: u64) -> Self {
        Self {
            name: name.to_owned(),
            value,
        }
    }
}

/// Events the core delivers to a driver's `process_event`.
#[derive(Debug)]
pub enum DriverEvent<'a> {
    Init,
    Exit,
    AddDevice { tags: &'a [DeviceTag] },
    RemoveDevice { device_id: usize },
}

pub type ProcessEvent = fn(&DriverEvent) -> bool;

pub struct DriverManifest {
    pub guid: DriverGuid,
    pub friendly_name: &'static str,
    pub api_version: u16,
    pub process_event: ProcessEvent,
    /// Device tag names this driver wants to be offered.
    pub load_names: &'static [&'static str],
}

/// Version of the driver ABI this kernel speaks.
pub const API_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceApiType {
    Io,
    Framebuffer,
    Gpu,
    Keyboard,
    Filesystem,
}

/// Per-API scratch state carried by an IOP as it traverses the stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct IopFrame {
    pub buffer: usize,
    pub addr: u64,
    pub length: usize,
    pub context: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IopDirection {
    Read,
    Write,
}

/// A device capability published by a driver. The header data (type tag,
/// owner) rides on the trait; operations beyond IOP transport are
/// type-specific extensions.
pub trait DeviceApi: Send + Sync {
    fn api_type(&self) -> DeviceApiType;
    fn driver(&self) -> DriverGuid;

    /// Forward pass of an I/O packet. Returning false aborts the packet.
    fn begin_iop(&self, direction: IopDirection, frame: &mut IopFrame) -> bool;
    /// Reverse pass; runs in the opposite order to `begin_iop`.
    fn end_iop(&self, direction: IopDirection, frame: &mut IopFrame) -> bool;
}

/// An I/O packet traversing a stack of device APIs.
pub struct Iop {
    direction: IopDirection,
    stack: Vec<(Arc<dyn DeviceApi>, IopFrame)>,
    began: usize,
}

impl Iop {
    pub fn new(direction: IopDirection) -> Self {
        Self {
            direction,
            stack: Vec::new(),
            began: 0,
        }
    }

    pub fn push_api(&mut self, api: Arc<dyn DeviceApi>, frame: IopFrame) {
        self.stack.push((api, frame));
    }

    /// Walk the stack top-down. Stops at the first refusal; `end` then
    /// unwinds only the frames that began.
    pub fn begin(&mut self) -> bool {
        let direction = self.direction;
        for (api, frame) in self.stack.iter_mut() {
            if !api.begin_iop(direction, frame) {
                return false;
            }
            self.began += 1;
        }
        true
    }

    /// Walk the begun frames in reverse order.
    pub fn end(&mut self) -> bool {
        let direction = self.direction;
        let mut ok = true;
        for (api, frame) in self.stack[..self.began].iter_mut().rev() {
            ok &= api.end_iop(direction, frame);
        }
        self.began = 0;
        ok
    }

    pub fn frame(&self, index: usize) -> Option<&IopFrame> {
        self.stack.get(index).map(|(_, frame)| frame)
    }
}

struct RegisteredDevice {
    id: usize,
    driver: DriverGuid,
    tags: Vec<DeviceTag>,
}

pub struct DriverManager {
    manifests: Mutex<Vec<DriverManifest>>,
    apis: Mutex<Vec<Arc<dyn DeviceApi>>>,
    devices: Mutex<Vec<RegisteredDevice>>,
    next_device_id: Mutex<usize>,
}

impl DriverManager {
    const fn new() -> Self {
        Self {
            manifests: Mutex::new(Vec::new()),
            apis: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            next_device_id: Mutex::new(1),
        }
    }

    /// Register a driver and deliver its Init event. Guids are unique; the
    /// api version must match the kernel's.
    pub fn register(&self, manifest: DriverManifest) -> Result<(), KernelError> {
        if manifest.api_version != API_VERSION {
            return Err(KernelError::NotSupported);
        }
        let mut manifests = self.manifests.lock();
        if manifests.iter().any(|m| m.guid == manifest.guid) {
            return Err(KernelError::AlreadyExists);
        }

        if !(manifest.process_event)(&DriverEvent::Init) {
            return Err(KernelError::NotInitialized);
        }
        crate::info!("Driver registered: {} (guid {:#x})", manifest.friendly_name, manifest.guid);
        manifests.push(manifest);
        Ok(())
    }

    /// Remove a driver, delivering Exit after its devices are gone.
    pub fn unregister(&self, guid: DriverGuid) -> Result<(), KernelError> {
        let mut manifests = self.manifests.lock();
        let index = manifests
            .iter()
            .position(|m| m.guid == guid)
            .ok_or(KernelError::NotFound)?;

        let device_ids: Vec<usize> = self
            .devices
            .lock()
            .iter()
            .filter(|d| d.driver == guid)
            .map(|d| d.id)
            .collect();
        for id in device_ids {
            (manifests[index].process_event)(&DriverEvent::RemoveDevice { device_id: id });
            self.devices.lock().retain(|d| d.id != id);
        }
        self.apis.lock().retain(|api| api.driver() != guid);

        let manifest = manifests.remove(index);
        (manifest.process_event)(&DriverEvent::Exit);
        Ok(())
    }

    /// Offer a discovered device to the first driver whose load names match
    /// one of its tags. Returns the device id if a driver claimed it.
    pub fn add_device(&self, tags: &[DeviceTag]) -> Option<usize> {
        let manifests = self.manifests.lock();
        let claimer = manifests.iter().find(|m| {
            m.load_names
                .iter()
                .any(|name| tags.iter().any(|tag| tag.name == *name))
        })?;

        if !(claimer.process_event)(&DriverEvent::AddDevice { tags }) {
            return None;
        }

        let mut next_id = self.next_device_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.devices.lock().push(RegisteredDevice {
            id,
            driver: claimer.guid,
            tags: tags.to_vec(),
        });
        crate::debug!("Device {} claimed by {}", id, claimer.friendly_name);
        Some(id)
    }

    /// Publish a device API for consumers.
    pub fn register_api(&self, api: Arc<dyn DeviceApi>) {
        self.apis.lock().push(api);
    }

    /// First registered API of the given type.
    pub fn find_api(&self, api_type: DeviceApiType) -> Option<Arc<dyn DeviceApi>> {
        self.apis
            .lock()
            .iter()
            .find(|api| api.api_type() == api_type)
            .cloned()
    }

    pub fn device_tags(&self, device_id: usize) -> Option<Vec<DeviceTag>> {
        self.devices
            .lock()
            .iter()
            .find(|d| d.id == device_id)
            .map(|d| d.tags.clone())
    }
}

static MANAGER: DriverManager = DriverManager::new();

pub fn manager() -> &'static DriverManager {
    &MANAGER
}

/// Boot-time hook; the registry itself is static.
pub fn init() {
    crate::info!("Driver framework ready, ABI version {}", API_VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static EVENTS: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn record_event(event: &DriverEvent) -> bool {
        let name = match event {
            DriverEvent::Init => "init",
            DriverEvent::Exit => "exit",
            DriverEvent::AddDevice { .. } => "add",
            DriverEvent::RemoveDevice { .. } => "remove",
        };
        EVENTS.lock().push(name);
        true
    }

    fn test_manifest(guid: DriverGuid) -> DriverManifest {
        DriverManifest {
            guid,
            friendly_name: "test-driver",
            api_version: API_VERSION,
            process_event: record_event,
            load_names: &["pci"],
        }
    }

    #[test]
    fn lifecycle_events_flow_in_order() {
        let _world = crate::test_support::world();
        EVENTS.lock().clear();

        let manager = DriverManager::new();
        manager.register(test_manifest(0x10)).unwrap();
        let device = manager
            .add_device(&[DeviceTag::new("pci", 0x8086_100E)])
            .expect("matching load name claims the device");
        assert!(manager.device_tags(device).is_some());

        manager.unregister(0x10).unwrap();
        assert_eq!(&*EVENTS.lock(), &["init", "add", "remove", "exit"]);
    }

    #[test]
    fn duplicate_guid_and_bad_version_are_rejected() {
        let _world = crate::test_support::world();
        let manager = DriverManager::new();
        manager.register(test_manifest(0x20)).unwrap();
        assert_eq!(
            manager.register(test_manifest(0x20)),
            Err(KernelError::AlreadyExists)
        );

        let mut stale = test_manifest(0x21);
        stale.api_version = API_VERSION + 1;
        assert_eq!(manager.register(stale), Err(KernelError::NotSupported));
    }

    #[test]
    fn unmatched_devices_stay_unclaimed() {
        let _world = crate::test_support::world();
        let manager = DriverManager::new();
        manager.register(test_manifest(0x30)).unwrap();
        assert!(manager.add_device(&[DeviceTag::new("usb", 7)]).is_none());
    }

    struct CountingApi {
        order: &'static AtomicUsize,
        begin_seen: AtomicUsize,
        end_seen: AtomicUsize,
    }

    impl DeviceApi for CountingApi {
        fn api_type(&self) -> DeviceApiType {
            DeviceApiType::Io
        }

        fn driver(&self) -> DriverGuid {
            0x40
        }

        fn begin_iop(&self, _direction: IopDirection, frame: &mut IopFrame) -> bool {
            let stamp = self.order.fetch_add(1, Ordering::SeqCst);
            self.begin_seen.store(stamp, Ordering::SeqCst);
            frame.context = stamp;
            true
        }

        fn end_iop(&self, _direction: IopDirection, _frame: &mut IopFrame) -> bool {
            self.end_seen
                .store(self.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn iop_walks_forward_then_reverse() {
        let _world = crate::test_support::world();
        static ORDER: AtomicUsize = AtomicUsize::new(0);
        ORDER.store(0, Ordering::SeqCst);

        let top = Arc::new(CountingApi {
            order: &ORDER,
            begin_seen: AtomicUsize::new(0),
            end_seen: AtomicUsize::new(0),
        });
        let bottom = Arc::new(CountingApi {
            order: &ORDER,
            begin_seen: AtomicUsize::new(0),
            end_seen: AtomicUsize::new(0),
        });

        let mut iop = Iop::new(IopDirection::Read);
        iop.push_api(top.clone(), IopFrame::default());
        iop.push_api(bottom.clone(), IopFrame::default());
        assert!(iop.begin());
        assert!(iop.end());

        // Forward: top(0) then bottom(1). Reverse: bottom(2) then top(3).
        assert_eq!(top.begin_seen.load(Ordering::SeqCst), 0);
        assert_eq!(bottom.begin_seen.load(Ordering::SeqCst), 1);
        assert_eq!(bottom.end_seen.load(Ordering::SeqCst), 2);
        assert_eq!(top.end_seen.load(Ordering::SeqCst), 3);
    }
}
