//! Multi-architecture monolithic kernel core: physical and virtual
//! memory management, the page-cached VFS, the process/thread/MLFQ
//! scheduler, the kernel module loader, and the NVMe driver core.
//! Grounded in the original kernel's `kernel.c` boot sequence.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod boot;
pub mod driver;
pub mod errno;
pub mod fd;
pub mod mm;
pub mod module;
pub mod panic;
pub mod path;
pub mod prelude;
pub mod task;
pub mod ustar;
pub mod vfs;

use boot::BootInfo;
use prelude::*;
use vfs::VType;

const INITRD_PATH: &str = "/initrd.tar";
const MODULES_DIR: &str = "/boot/modules";
const INIT_PATH: &str = "/boot/init";

/// Walks the boot module list for `path` and returns its bytes as a
/// slice into the bootloader-reserved memory it was handed in at
/// (the region is never reclaimed by the PM allocator; see
/// [`mm::bootstrap::init`]'s memory-map handling).
fn module_bytes<'a>(info: &'a BootInfo, path: &str) -> Option<&'a [u8]> {
    let module = info.find_module(path)?;
    // SAFETY: the bootloader module region is reserved memory distinct
    // from anything the PM allocator ever hands out.
    Some(unsafe { core::slice::from_raw_parts(mm::arch::phys_to_virt(module.address) as *const u8, module.size) })
}

/// Loads and installs every relocatable object under `/boot/modules`.
fn load_kernel_modules() {
    let dir = match vfs::lookup(MODULES_DIR) {
        Ok(dir) => dir,
        Err(_) => return,
    };

    let mut index = 0usize;
    loop {
        let entry = match dir.ops.clone().readdir(&dir, index) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(_) => break,
        };
        index += 1;

        if entry.vtype != VType::Regular {
            continue;
        }
        let path = alloc::format!("{}/{}", MODULES_DIR, entry.name);
        let vn = match vfs::lookup(&path) {
            Ok(vn) => vn,
            Err(_) => continue,
        };
        match module::load(&vn) {
            Ok(m) => m.install(),
            Err(e) => println_warn!("kernel: failed to load module {}: {}", path, e),
        }
    }
}

/// Loads `/boot/init`, builds its process and initial thread, and
/// enqueues it with the scheduler.
fn load_init_process() -> KResult<()> {
    let vn = vfs::lookup(INIT_PATH)?;

    let proc = task::Process::create_user("init", mm::PAGE_4KIB, 0x0000_7fff_ffff_f000)?;
    let (entry, stack_top) = module::load_init(&vn, &proc.address_space)?;

    let thread = task::process::thread_create(&proc, entry, stack_top);
    task::scheduler::enqueue(thread);
    Ok(())
}

/// Runs the full boot control flow (SPEC_FULL.md §2): PM/paging/VM,
/// VFS + DevFS, the device/bus registry, initrd extraction, kernel
/// modules, the init process, then SMP bring-up. Never returns — the
/// calling CPU becomes this core's idle thread.
pub fn kernel_main(info: &BootInfo) -> ! {
    mm::bootstrap::init(info);

    vfs::init().expect("kernel: vfs init failed");
    vfs::devfs::init().expect("kernel: devfs init failed");

    driver::bus::bus_register("storage");
    task::scheduler::init();

    if let Some(archive) = module_bytes(info, INITRD_PATH) {
        if let Err(e) = ustar::extract(archive, "/") {
            println_warn!("kernel: initrd extraction failed: {}", e);
        }
    } else {
        println_warn!("kernel: no initrd module found.");
    }

    load_kernel_modules();

    match load_init_process() {
        Ok(()) => {}
        Err(e) => panic!("failed to load init process: {}", e),
    }

    let smp = task::smp::init(&info.cpus).expect("kernel: smp bring-up failed");
    println_info!("Boot complete.");

    task::smp::secondary_entry(&smp.bsp);
}
