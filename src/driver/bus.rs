//! Device / bus / driver registry (SPEC_FULL.md §4.15, supplemental).
//! Grounds the NVMe module's attach path in a real registry instead of
//! a hand-wired singleton. Grounded in the original kernel's `bus.c` /
//! `device.h` / `driver.h` / `drive.c`.

use core::any::Any;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::prelude::*;

pub const MAX_DRIVES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Storage,
    Network,
    Display,
    Audio,
    Bus,
    Unknown,
}

/// A bus-enumerated device: named, optionally parented, matched against
/// at most one driver. `bus_data` is the bus-specific descriptor a
/// driver's `probe` downcasts (a PCI config-space header, for the PCI
/// bus the NVMe module attaches to).
pub struct Device {
    pub name: String,
    pub class: DeviceClass,
    pub bus_data: Box<dyn Any + Send + Sync>,
    driver: Spin<Option<Arc<Driver>>>,
}

impl Device {
    pub fn driver(&self) -> Option<Arc<Driver>> {
        self.driver.lock().clone()
    }
}

/// A driver's attach contract: `probe` is offered every device already
/// or newly registered on a bus it is bound to, and claims it by
/// returning `true`.
pub struct Driver {
    pub name: String,
    pub probe: fn(&Arc<Device>) -> bool,
    pub remove: Option<fn(&Arc<Device>)>,
    bound: Spin<Vec<Arc<Device>>>,
}

impl Driver {
    pub fn new(name: &str, probe: fn(&Arc<Device>) -> bool, remove: Option<fn(&Arc<Device>)>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            probe,
            remove,
            bound: Spin::new(Vec::new()),
        })
    }

    pub fn bound_devices(&self) -> Vec<Arc<Device>> {
        self.bound.lock().clone()
    }

    /// Appends this driver to `bus`'s driver list and probes every
    /// device already registered on it.
    pub fn register(self: &Arc<Self>, bus: &Arc<Bus>) {
        bus.drivers.lock().push(self.clone());

        for dev in bus.devices.lock().iter() {
            if dev.driver().is_some() {
                continue;
            }
            if (self.probe)(dev) {
                *dev.driver.lock() = Some(self.clone());
                self.bound.lock().push(dev.clone());
            }
        }
    }

    /// Removes this driver from `bus` and calls `remove` on every device
    /// it had bound.
    pub fn unregister(self: &Arc<Self>, bus: &Arc<Bus>) {
        bus.drivers.lock().retain(|d| !Arc::ptr_eq(d, self));
        for dev in self.bound.lock().drain(..) {
            if let Some(remove) = self.remove {
                remove(&dev);
            }
            *dev.driver.lock() = None;
        }
    }
}

pub struct Bus {
    pub name: String,
    devices: Spin<Vec<Arc<Device>>>,
    drivers: Spin<Vec<Arc<Driver>>>,
    refcount: AtomicU64,
}

impl Bus {
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().clone()
    }

    pub fn drivers(&self) -> Vec<Arc<Driver>> {
        self.drivers.lock().clone()
    }

    /// Registers `device` on this bus and offers it to every driver
    /// already registered, the converse of [`Driver::register`].
    pub fn register_device(self: &Arc<Self>, name: &str, class: DeviceClass, bus_data: Box<dyn Any + Send + Sync>) -> Arc<Device> {
        let device = Arc::new(Device {
            name: name.to_string(),
            class,
            bus_data,
            driver: Spin::new(None),
        });
        self.devices.lock().push(device.clone());

        for driver in self.drivers.lock().iter() {
            if (driver.probe)(&device) {
                *device.driver.lock() = Some(driver.clone());
                driver.bound.lock().push(device.clone());
                break;
            }
        }

        device
    }
}

static BUSES: Spin<Vec<Arc<Bus>>> = Spin::new(Vec::new());

pub fn bus_register(name: &str) -> Arc<Bus> {
    let bus = Arc::new(Bus {
        name: name.to_string(),
        devices: Spin::new(Vec::new()),
        drivers: Spin::new(Vec::new()),
        refcount: AtomicU64::new(1),
    });
    BUSES.lock().push(bus.clone());
    bus
}

/// Looks a bus up by name, bumping its refcount; pair with [`bus_put`].
pub fn bus_get(name: &str) -> Option<Arc<Bus>> {
    let bus = BUSES.lock().iter().find(|b| b.name == name).cloned();
    if let Some(bus) = &bus {
        bus.refcount.fetch_add(1, Ordering::AcqRel);
    }
    bus
}

pub fn bus_put(bus: Arc<Bus>) {
    bus.refcount.fetch_sub(1, Ordering::AcqRel);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveType {
    Hdd,
    Ssd,
    Nvme,
    Usb,
    Network,
}

/// A block-device identity layered over a [`Device`]: type, serial/model
/// strings, sector geometry, and whether it is currently mounted.
pub struct Drive {
    pub device: Arc<Device>,
    pub drive_type: DriveType,
    pub serial: String,
    pub model: String,
    pub sector_size: u32,
    pub sector_count: u64,
    mounted: AtomicBool,
}

impl Drive {
    pub fn mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }
}

static DRIVES: Spin<Vec<Option<Arc<Drive>>>> = Spin::new(Vec::new());

/// Registers a drive in the first free slot of the global drive table
/// (capped at [`MAX_DRIVES`]), the handle namespace block-device
/// consumers look it up by.
pub fn drive_register(
    device: Arc<Device>,
    drive_type: DriveType,
    serial: String,
    model: String,
    sector_size: u32,
    sector_count: u64,
) -> KResult<usize> {
    let drive = Arc::new(Drive {
        device,
        drive_type,
        serial,
        model,
        sector_size,
        sector_count,
        mounted: AtomicBool::new(false),
    });

    let mut drives = DRIVES.lock();
    if let Some(slot) = drives.iter().position(|d| d.is_none()) {
        drives[slot] = Some(drive);
        return Ok(slot);
    }
    if drives.len() >= MAX_DRIVES {
        return Err(Errno::ENOMEM);
    }
    drives.push(Some(drive));
    Ok(drives.len() - 1)
}

pub fn drive_get(index: usize) -> Option<Arc<Drive>> {
    DRIVES.lock().get(index)?.clone()
}

pub fn drive_mount(index: usize) -> KResult<()> {
    let drive = drive_get(index).ok_or(Errno::EINVAL)?;
    drive.mounted.store(true, Ordering::Release);
    Ok(())
}

pub fn drive_unmount(index: usize) -> KResult<()> {
    let drive = drive_get(index).ok_or(Errno::EINVAL)?;
    drive.mounted.store(false, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_ok(_dev: &Arc<Device>) -> bool {
        true
    }

    fn probe_reject(_dev: &Arc<Device>) -> bool {
        false
    }

    #[test]
    fn driver_register_binds_existing_devices() {
        let bus = bus_register("test-bus-1");
        let dev = bus.register_device("dev0", DeviceClass::Storage, Box::new(()));
        assert!(dev.driver().is_none());

        let driver = Driver::new("test-driver", probe_ok, None);
        driver.register(&bus);

        assert!(Arc::ptr_eq(&dev.driver().unwrap(), &driver));
        assert_eq!(driver.bound_devices().len(), 1);
    }

    #[test]
    fn register_device_offers_to_existing_drivers() {
        let bus = bus_register("test-bus-2");
        let driver = Driver::new("test-driver-2", probe_ok, None);
        driver.register(&bus);

        let dev = bus.register_device("dev1", DeviceClass::Network, Box::new(()));
        assert!(Arc::ptr_eq(&dev.driver().unwrap(), &driver));
    }

    #[test]
    fn rejecting_probe_leaves_device_unbound() {
        let bus = bus_register("test-bus-3");
        let dev = bus.register_device("dev2", DeviceClass::Unknown, Box::new(()));
        let driver = Driver::new("test-driver-3", probe_reject, None);
        driver.register(&bus);
        assert!(dev.driver().is_none());
    }

    #[test]
    fn drive_table_round_trip() {
        let bus = bus_register("test-bus-4");
        let dev = bus.register_device("nvme0", DeviceClass::Storage, Box::new(()));
        let idx = drive_register(dev, DriveType::Nvme, "S1".to_string(), "M1".to_string(), 512, 1000).unwrap();
        assert!(!drive_get(idx).unwrap().mounted());
        drive_mount(idx).unwrap();
        assert!(drive_get(idx).unwrap().mounted());
    }
}
