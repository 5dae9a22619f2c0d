//! NVMe driver core: controller reset/bring-up, the admin queue, and
//! identify controller/namespace (SPEC_FULL.md §4.14 — no I/O queues).
//! Grounded in the original kernel's `modules/storage/nvme/nvme.c` /
//! `nvme.h`.

use crate::driver::bus::{self, Device, DeviceClass, DriveType};
use crate::mm::dma::{dma_map, dma_phys_addr};
use crate::prelude::*;

pub const ADMIN_QUEUE_DEPTH: usize = 64;
const ADMIN_POLL_SPINS: u32 = 10_000_000;

const OPC_IDENTIFY: u8 = 0x06;
const CNS_CONTROLLER: u32 = 1;
const CNS_NAMESPACE: u32 = 0;

/// The PCI config-space subset an out-of-scope PCI bus enumerator would
/// populate for a mass-storage/NVMe function; `bar0` is already a
/// dereferenceable kernel virtual address for the device's register
/// window, per this core's external-interface contract (SPEC_FULL.md §1).
pub struct PciHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub bar0: usize,
}

const CLASS_MASS_STORAGE: u8 = 0x01;
const SUBCLASS_NVME: u8 = 0x08;

/// One NVMe submission/completion queue pair. `cid_bitmap` tracks which
/// of the queue's CIDs are outstanding; a set bit means "in flight".
struct Queue {
    sq: usize,
    cq: usize,
    qid: u16,
    depth: u16,
    head: u16,
    tail: u16,
    phase: u8,
    cid_bitmap: u64,
    cid_hint: u16,
}

/// A 64-byte NVMe submission queue entry, matching the wire layout in
/// SPEC_FULL.md §6: opcode, flags/psdt, cid, then the 15-dword command.
#[repr(C)]
#[derive(Clone, Copy)]
struct SqEntry {
    opc: u8,
    flags: u8,
    cid: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    mptr: u64,
    prp1: u64,
    prp2: u64,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
}

const _: () = assert!(core::mem::size_of::<SqEntry>() == 64);

/// A 16-byte completion queue entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct CqEntry {
    cdw0: u32,
    cdw1: u32,
    sq_head: u16,
    sq_id: u16,
    cid: u16,
    status_phase: u16,
}

const _: () = assert!(core::mem::size_of::<CqEntry>() == 16);

impl Queue {
    fn alloc(qid: u16, depth: u16) -> KResult<Self> {
        let sq_size = depth as usize * core::mem::size_of::<SqEntry>();
        let cq_size = depth as usize * core::mem::size_of::<CqEntry>();
        let sq = dma_map(sq_size)?;
        let cq = dma_map(cq_size)?;
        // SAFETY: freshly mapped DMA memory, exclusively owned here.
        unsafe {
            core::ptr::write_bytes(sq as *mut u8, 0, sq_size);
            core::ptr::write_bytes(cq as *mut u8, 0, cq_size);
        }
        Ok(Self {
            sq,
            cq,
            qid,
            depth,
            head: 0,
            tail: 0,
            phase: 1,
            cid_bitmap: 0,
            cid_hint: 0,
        })
    }

    fn alloc_cid(&mut self) -> KResult<u16> {
        for offset in 0..64u16 {
            let cid = (self.cid_hint + offset) % 64;
            if self.cid_bitmap & (1 << cid) == 0 {
                self.cid_bitmap |= 1 << cid;
                self.cid_hint = (cid + 1) % 64;
                return Ok(cid);
            }
        }
        Err(Errno::EBUSY)
    }

    fn release_cid(&mut self, cid: u16) {
        self.cid_bitmap &= !(1 << cid);
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.depth == self.head
    }
}

/// Register offsets, matching the NVMe 2.x layout (SPEC_FULL.md §6).
mod regs {
    pub const CAP: usize = 0x00;
    pub const VS: usize = 0x08;
    pub const CC: usize = 0x14;
    pub const CSTS: usize = 0x1c;
    pub const AQA: usize = 0x24;
    pub const ASQ: usize = 0x28;
    pub const ACQ: usize = 0x30;
}

unsafe fn read_reg32(base: usize, offset: usize) -> u32 {
    core::ptr::read_volatile((base + offset) as *const u32)
}

unsafe fn write_reg32(base: usize, offset: usize, value: u32) {
    core::ptr::write_volatile((base + offset) as *mut u32, value);
}

unsafe fn read_reg64(base: usize, offset: usize) -> u64 {
    core::ptr::read_volatile((base + offset) as *const u64)
}

unsafe fn write_reg64(base: usize, offset: usize, value: u64) {
    core::ptr::write_volatile((base + offset) as *mut u64, value);
}

fn doorbell_sq_tail(base: usize, qid: u16, stride: u32) -> usize {
    base + 0x1000 + (2 * qid as usize) * stride as usize
}

fn doorbell_cq_head(base: usize, qid: u16, stride: u32) -> usize {
    base + 0x1000 + (2 * qid as usize + 1) * stride as usize
}

pub struct Controller {
    base: usize,
    stride: u32,
    admin: Spin<Queue>,
    pub serial: String,
    pub model: String,
}

impl Controller {
    fn reset(&self) {
        // SAFETY: `base` is this controller's MMIO register window.
        unsafe {
            let cc = read_reg32(self.base, regs::CC);
            if cc & 1 != 0 {
                while read_reg32(self.base, regs::CSTS) & 1 != 0 {
                    core::hint::spin_loop();
                }
            }
            write_reg32(self.base, regs::CC, cc & !1);
            for _ in 0..ADMIN_POLL_SPINS {
                if read_reg32(self.base, regs::CSTS) & 1 == 0 {
                    break;
                }
                core::hint::spin_loop();
            }
        }
    }

    fn start(&self) {
        // SAFETY: same as `reset`.
        unsafe {
            let mut cc = read_reg32(self.base, regs::CC);
            cc &= !(0xF << 12); // ams=0
            cc &= !(0xF << 7); // mps=0 (4 KiB)
            cc &= !(0x7 << 4); // css=0
            cc |= (6 & 0xF) << 16; // iosqes=6
            cc |= (4 & 0xF) << 20; // iocqes=4
            cc |= 1; // en=1
            write_reg32(self.base, regs::CC, cc);
            for _ in 0..ADMIN_POLL_SPINS {
                if read_reg32(self.base, regs::CSTS) & 1 != 0 {
                    break;
                }
                core::hint::spin_loop();
            }
        }
    }

    /// Submits one admin command, blocking for its completion (bounded
    /// by `ADMIN_POLL_SPINS` spins before logging and giving up).
    fn admin_command(&self, opc: u8, nsid: u32, prp1: u64, cdw10: u32) -> KResult<CqEntry> {
        let mut admin = self.admin.lock();
        if admin.is_full() {
            return Err(Errno::EBUSY);
        }
        let cid = admin.alloc_cid()?;

        let entry = SqEntry {
            opc,
            flags: 0,
            cid,
            nsid,
            cdw2: 0,
            cdw3: 0,
            mptr: 0,
            prp1,
            prp2: 0,
            cdw10,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        };

        let tail = admin.tail;
        // SAFETY: `admin.sq` is DMA memory sized for `depth` entries.
        unsafe {
            let slot = (admin.sq as *mut SqEntry).add(tail as usize);
            slot.write_volatile(entry);
            write_reg32(doorbell_sq_tail(self.base, admin.qid, self.stride), 0, tail as u32);
        }
        admin.tail = (tail + 1) % admin.depth;

        for _ in 0..ADMIN_POLL_SPINS {
            if let Some(cqe) = poll_cq(self.base, self.stride, &mut admin) {
                if cqe.cid == cid {
                    admin.release_cid(cid);
                    return Ok(cqe);
                }
            }
        }

        admin.release_cid(cid);
        println_warn!("nvme: admin command 0x{:x} timed out", opc);
        Err(Errno::EBUSY)
    }
}

/// Polls the completion queue once; returns the next entry if its phase
/// bit matches the queue's expected phase (SPEC_FULL.md §8's "phase bit
/// flips exactly when head wraps").
fn poll_cq(base: usize, stride: u32, queue: &mut Queue) -> Option<CqEntry> {
    // SAFETY: `queue.cq` is DMA memory sized for `depth` entries.
    let entry = unsafe { (queue.cq as *const CqEntry).add(queue.head as usize).read_volatile() };
    if (entry.status_phase & 1) as u8 != queue.phase {
        return None;
    }

    queue.head = (queue.head + 1) % queue.depth;
    if queue.head == 0 {
        queue.phase ^= 1;
    }
    // SAFETY: `base` is this controller's MMIO window.
    unsafe { write_reg32(doorbell_cq_head(base, queue.qid, stride), 0, queue.head as u32) };

    Some(entry)
}

fn read_ascii(buf: &[u8], start: usize, len: usize) -> String {
    String::from_utf8_lossy(&buf[start..start + len]).trim_end().to_string()
}

/// Brings a controller up against `header` (SPEC_FULL.md §4.14 steps
/// 1-6) and registers it as a [`Device`] on `bus`.
pub fn init(bus_dev: &Arc<Device>) -> KResult<()> {
    let header = bus_dev
        .bus_data
        .downcast_ref::<PciHeader>()
        .ok_or(Errno::EINVAL)?;
    let base = header.bar0;

    // SAFETY: `base` is the controller's register window.
    let cap = unsafe { read_reg64(base, regs::CAP) };
    let dstrd = ((cap >> 32) & 0xF) as u32;
    let stride = 4 << dstrd;

    let admin = Queue::alloc(0, ADMIN_QUEUE_DEPTH as u16)?;

    let controller = Controller {
        base,
        stride,
        admin: Spin::new(admin),
        serial: String::new(),
        model: String::new(),
    };

    controller.reset();

    {
        let admin = controller.admin.lock();
        // SAFETY: `base` is the controller's register window.
        unsafe {
            write_reg32(
                base,
                regs::AQA,
                ((ADMIN_QUEUE_DEPTH as u32 - 1) << 16) | (ADMIN_QUEUE_DEPTH as u32 - 1),
            );
            write_reg64(base, regs::ASQ, dma_phys_addr(admin.sq) as u64);
            write_reg64(base, regs::ACQ, dma_phys_addr(admin.cq) as u64);
        }
    }

    controller.start();

    let identify_buf = dma_map(4096)?;
    let cqe = controller.admin_command(OPC_IDENTIFY, 0, dma_phys_addr(identify_buf) as u64, CNS_CONTROLLER)?;
    if cqe.status_phase >> 1 != 0 {
        println_warn!("nvme: identify controller failed, status 0x{:x}", cqe.status_phase >> 1);
        return Err(Errno::EBUSY);
    }

    // SAFETY: `identify_buf` is a populated 4 KiB DMA buffer in the
    // `nvme_cid_t` layout.
    let identify = unsafe { core::slice::from_raw_parts(identify_buf as *const u8, 4096) };
    let serial = read_ascii(identify, 4, 20);
    let model = read_ascii(identify, 24, 40);
    let nn = u32::from_le_bytes(identify[88..92].try_into().unwrap());

    println_info!("nvme: controller `{}` ({} namespace(s)).", model, nn);

    for nsid in 1..=nn {
        identify_namespace(bus_dev, &controller, nsid, &serial, &model)?;
    }

    Ok(())
}

fn identify_namespace(bus_dev: &Arc<Device>, controller: &Controller, nsid: u32, serial: &str, model: &str) -> KResult<()> {
    let buf = dma_map(4096)?;
    let cqe = controller.admin_command(OPC_IDENTIFY, nsid, dma_phys_addr(buf) as u64, CNS_NAMESPACE)?;
    if cqe.status_phase >> 1 != 0 {
        return Ok(()); // nonexistent namespace; nothing to register
    }

    // SAFETY: `buf` is a populated 4 KiB DMA buffer in the `nvme_nsidn_t`
    // layout (SPEC_FULL.md §4.14 step 7).
    let data = unsafe { core::slice::from_raw_parts(buf as *const u8, 4096) };
    let nsze = u64::from_le_bytes(data[0..8].try_into().unwrap());
    if nsze == 0 {
        return Ok(());
    }

    let flbas = data[26] & 0xF;
    let lbaf_off = 128 + 4 * flbas as usize;
    let lbaf = u32::from_le_bytes(data[lbaf_off..lbaf_off + 4].try_into().unwrap());
    let lba_size = 1u32 << ((lbaf >> 16) & 0xFF);

    let drive_bus = bus::bus_get("storage").unwrap_or_else(|| bus::bus_register("storage"));
    let device = drive_bus.register_device(
        &alloc::format!("nvme-ns{}", nsid),
        DeviceClass::Storage,
        Box::new(nsid),
    );
    let _ = bus_dev;

    let index = bus::drive_register(device, DriveType::Nvme, serial.to_string(), model.to_string(), lba_size, nsze)?;
    bus::drive_mount(index)?;

    println_info!("nvme: namespace {} registered as drive #{} ({} x {} bytes).", nsid, index, nsze, lba_size);
    Ok(())
}

/// Driver entry point offered to the PCI bus: claims mass-storage/NVMe
/// functions and brings the controller up.
pub fn probe(device: &Arc<Device>) -> bool {
    let is_nvme = match device.bus_data.downcast_ref::<PciHeader>() {
        Some(h) => h.class == CLASS_MASS_STORAGE && h.subclass == SUBCLASS_NVME,
        None => false,
    };
    if !is_nvme {
        return false;
    }

    match init(device) {
        Ok(()) => true,
        Err(e) => {
            println_warn!("nvme: controller bring-up failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_allocation_is_round_robin_and_bounded() {
        let mut q = Queue {
            sq: 0,
            cq: 0,
            qid: 0,
            depth: 64,
            head: 0,
            tail: 0,
            phase: 1,
            cid_bitmap: 0,
            cid_hint: 0,
        };
        let a = q.alloc_cid().unwrap();
        let b = q.alloc_cid().unwrap();
        assert_ne!(a, b);
        q.release_cid(a);
        let c = q.alloc_cid().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn queue_full_detection() {
        let mut q = Queue {
            sq: 0,
            cq: 0,
            qid: 0,
            depth: 4,
            head: 0,
            tail: 3,
            phase: 1,
            cid_bitmap: 0,
            cid_hint: 0,
        };
        assert!(q.is_full());
        q.tail = 2;
        assert!(!q.is_full());
    }
}
