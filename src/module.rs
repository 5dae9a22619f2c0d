//! ELF64-REL kernel module loader (SPEC_FULL.md §4.13) and the init
//! process loader that reuses its header-reading primitives (§4.13a).
//! Grounded in the original kernel's `mod/module.c`.

use alloc::collections::BTreeMap;

use xmas_elf::sections::{SectionData, ShType};
use xmas_elf::symbol_table::Entry;
use xmas_elf::{header, ElfFile};

use crate::mm::arch::Prot;
use crate::mm::bootstrap::kernel_address_space;
use crate::mm::vm::MapFlags;
use crate::mm::{pm_page_size_round_up, PAGE_4KIB};
use crate::prelude::*;
use crate::vfs::{self, Vnode};

const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHN_COMMON: u16 = 0xfff2;

// x86_64 relocation type codes a module object may carry (SPEC_FULL.md §6).
const R_X86_64_64: u32 = 1;
const R_X86_64_PC32: u32 = 2;
const R_X86_64_PLT32: u32 = 4;
const R_X86_64_32: u32 = 10;
const R_X86_64_32S: u32 = 11;
const R_X86_64_PC64: u32 = 24;

/// Kernel-exported symbols a module's `SHN_UNDEF` references resolve
/// against. Populated by `export_kernel_symbol` during boot, before any
/// module is loaded.
static KERNEL_SYMBOLS: Spin<BTreeMap<String, usize>> = Spin::new(BTreeMap::new());

pub fn export_kernel_symbol(name: &str, addr: usize) {
    KERNEL_SYMBOLS.lock().insert(name.to_string(), addr);
}

fn lookup_kernel_symbol(name: &str) -> Option<usize> {
    KERNEL_SYMBOLS.lock().get(name).copied()
}

/// A loaded kernel module: its install/destroy entry points plus the
/// metadata strings pulled out of its `__module_*` symbols.
pub struct Module {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    install: usize,
    destroy: usize,
}

impl Module {
    /// Calls the module's `__module_install` entry point.
    pub fn install(&self) {
        let f: extern "C" fn() = unsafe { core::mem::transmute(self.install) };
        f();
    }

    /// Calls the module's `__module_destroy` entry point.
    pub fn destroy(&self) {
        let f: extern "C" fn() = unsafe { core::mem::transmute(self.destroy) };
        f();
    }
}

/// Allocates `len` bytes (rounded up to whole pages) of writable,
/// executable kernel virtual memory for one loaded section.
fn alloc_section(len: usize) -> KResult<usize> {
    let size = pm_page_size_round_up(len.max(1));
    kernel_address_space().map(0, size, Prot::WRITE | Prot::EXEC, MapFlags::PRIVATE | MapFlags::ANON, None, 0)
}

/// Reads the whole file into a heap buffer. Kernel module objects are
/// small enough that staging the entire file is simpler than streaming
/// section-by-section, and it lets `xmas_elf::ElfFile` parse directly
/// against a single contiguous slice.
fn read_whole(vn: &Arc<Vnode>) -> KResult<Vec<u8>> {
    let size = vn.size() as usize;
    let mut buf = alloc::vec![0u8; size];
    let n = vfs::read(vn, 0, &mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Reads a NUL-terminated string out of already-mapped kernel memory at
/// `vaddr`, as modinfo symbols point at string literals embedded in the
/// module's own data sections.
fn read_cstr(vaddr: usize) -> String {
    // SAFETY: `vaddr` was resolved from a symbol pointing inside a
    // section this loader just mapped and populated.
    unsafe {
        let mut len = 0usize;
        while *(vaddr as *const u8).add(len) != 0 {
            len += 1;
        }
        let bytes = core::slice::from_raw_parts(vaddr as *const u8, len);
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn apply_relocation(r_type: u32, place: usize, value: u64) -> KResult<()> {
    match r_type {
        R_X86_64_64 | R_X86_64_PC64 => {
            // SAFETY: `place` lies inside a section this loader mapped.
            unsafe { (place as *mut u64).write_unaligned(value) };
        }
        R_X86_64_32 | R_X86_64_32S | R_X86_64_PC32 | R_X86_64_PLT32 => {
            // SAFETY: same as above.
            unsafe { (place as *mut u32).write_unaligned(value as u32) };
        }
        _ => {
            println_warn!("module: unsupported relocation type 0x{:x}", r_type);
            return Err(Errno::ENOEXEC);
        }
    }
    Ok(())
}

/// Loads, relocates, and installs a relocatable kernel module object
/// (SPEC_FULL.md §4.13). Does not call `Module::install`; the caller
/// decides when to run it.
pub fn load(vn: &Arc<Vnode>) -> KResult<Module> {
    println_info!("Loading module `{}`.", vn.name());

    let data = read_whole(vn)?;
    let elf = ElfFile::new(&data).map_err(|_| Errno::ENOEXEC)?;
    header::sanity_check(&elf).map_err(|_| Errno::ENOEXEC)?;

    if elf.header.pt1.class() != header::Class::SixtyFour {
        return Err(Errno::ENOEXEC);
    }
    if elf.header.pt1.data() != header::Data::LittleEndian {
        return Err(Errno::ENOEXEC);
    }
    if !matches!(elf.header.pt2.type_().as_type(), header::Type::Relocatable) {
        return Err(Errno::ENOEXEC);
    }

    let nsections = elf.section_iter().count();
    let mut section_addr = alloc::vec![0usize; nsections];

    for (idx, section) in elf.section_iter().enumerate() {
        let alloc_flag = section.flags() & 0x2 != 0; // SHF_ALLOC
        if section.size() == 0 || !alloc_flag {
            continue;
        }

        match section.get_type().map_err(|_| Errno::ENOEXEC)? {
            ShType::ProgBits => {
                let mem = alloc_section(section.size() as usize)?;
                let raw = section.raw_data(&elf);
                // SAFETY: `mem` was just mapped, writable, and at least
                // `raw.len()` bytes long.
                unsafe {
                    core::ptr::copy_nonoverlapping(raw.as_ptr(), mem as *mut u8, raw.len());
                }
                section_addr[idx] = mem;
            }
            ShType::NoBits => {
                section_addr[idx] = alloc_section(section.size() as usize)?;
            }
            _ => {}
        }
    }

    let symtab_section = elf
        .section_iter()
        .find(|s| s.get_type() == Ok(ShType::SymTab))
        .ok_or(Errno::ENOEXEC)?;
    let entries: &[xmas_elf::symbol_table::Entry64] = match symtab_section.get_data(&elf) {
        Ok(SectionData::SymbolTable64(entries)) => entries,
        _ => return Err(Errno::ENOEXEC),
    };

    let mut module = Module {
        name: String::new(),
        version: String::new(),
        description: String::new(),
        author: String::new(),
        install: 0,
        destroy: 0,
    };

    // Resolved absolute address of every symbol table entry, keyed by
    // index, for the relocation pass below.
    let mut resolved = alloc::vec![0usize; entries.len()];

    for (i, sym) in entries.iter().enumerate().skip(1) {
        let name = sym.get_name(&elf).unwrap_or("");
        let addr = match sym.shndx() {
            SHN_UNDEF => {
                let addr = lookup_kernel_symbol(name).ok_or(Errno::ENOEXEC)?;
                addr
            }
            SHN_ABS => sym.value() as usize,
            SHN_COMMON => {
                println_warn!("module: unexpected common symbol `{}`", name);
                0
            }
            shndx => {
                let base = *section_addr.get(shndx as usize).ok_or(Errno::ENOEXEC)?;
                base + sym.value() as usize
            }
        };
        resolved[i] = addr;

        match name {
            "__module_install" => module.install = addr,
            "__module_destroy" => module.destroy = addr,
            "__module_name" => module.name = read_cstr(addr),
            "__module_version" => module.version = read_cstr(addr),
            "__module_description" => module.description = read_cstr(addr),
            "__module_author" => module.author = read_cstr(addr),
            _ => {}
        }
    }

    if module.install == 0 || module.destroy == 0 {
        println_warn!("module: `{}` does not implement required functions.", vn.name());
        return Err(Errno::ENOEXEC);
    }

    for section in elf.section_iter() {
        if section.get_type() != Ok(ShType::Rela) {
            continue;
        }
        let target = section_addr[section.info() as usize];
        let rela_entries = match section.get_data(&elf) {
            Ok(SectionData::Rela64(entries)) => entries,
            _ => return Err(Errno::ENOEXEC),
        };
        for rela in rela_entries {
            let sym = resolved
                .get(rela.get_symbol_table_index() as usize)
                .copied()
                .ok_or(Errno::ENOEXEC)?;
            let place = target + rela.get_offset() as usize;
            let value = (sym as i64 + rela.get_addend()) as u64;
            let value = match rela.get_type() {
                R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_PC64 => value.wrapping_sub(place as u64),
                other => {
                    apply_relocation(other, place, value)?;
                    continue;
                }
            };
            apply_relocation(rela.get_type(), place, value)?;
        }
    }

    println_info!("Kernel module `{}` loaded successfully.", module.name);
    Ok(module)
}

/// Loads `/boot/init`'s ELF64 EXEC image into `as_` (SPEC_FULL.md
/// §4.13a), mapping each `PT_LOAD` segment private, anonymous,
/// populated, and fixed at its program-header vaddr. Returns the entry
/// point and the top of a freshly mapped user stack.
pub fn load_init(vn: &Arc<Vnode>, as_: &crate::mm::vm::AddressSpace) -> KResult<(usize, usize)> {
    let data = read_whole(vn)?;
    let elf = ElfFile::new(&data).map_err(|_| Errno::ENOEXEC)?;
    header::sanity_check(&elf).map_err(|_| Errno::ENOEXEC)?;

    if elf.header.pt1.class() != header::Class::SixtyFour {
        return Err(Errno::ENOEXEC);
    }
    if !matches!(elf.header.pt2.type_().as_type(), header::Type::Executable) {
        return Err(Errno::ENOEXEC);
    }

    for ph in elf.program_iter() {
        if ph.get_type() != Ok(xmas_elf::program::Type::Load) {
            continue;
        }
        let vaddr = crate::mm::pm_page_size_align(ph.virtual_addr() as usize);
        let mem_size = pm_page_size_round_up(ph.mem_size() as usize + (ph.virtual_addr() as usize - vaddr));
        let mut prot = Prot::empty();
        if ph.flags().is_write() {
            prot |= Prot::WRITE;
        }
        if ph.flags().is_execute() {
            prot |= Prot::EXEC;
        }

        as_.map(
            vaddr,
            mem_size,
            prot,
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::POPULATE | MapFlags::FIXED,
            None,
            0,
        )?;

        let file_off = (ph.virtual_addr() as usize) - vaddr;
        let seg_data = ph.raw_data(&elf);
        // `as_` is the init process's address space, not necessarily the
        // one active on this CPU right now, so its user vaddrs are not
        // reachable through a raw pointer into the current page tables;
        // go through `copy_to_user`, which translates per page instead.
        as_.copy_to_user(vaddr + file_off, seg_data)?;
    }

    const STACK_TOP: usize = 0x7fff_ffff_f000;
    const STACK_SIZE: usize = 8 * PAGE_4KIB;
    as_.map(
        STACK_TOP - STACK_SIZE,
        STACK_SIZE,
        Prot::WRITE,
        MapFlags::PRIVATE | MapFlags::ANON | MapFlags::POPULATE | MapFlags::FIXED,
        None,
        0,
    )?;

    Ok((elf.header.pt2.entry_point() as usize, STACK_TOP))
}
