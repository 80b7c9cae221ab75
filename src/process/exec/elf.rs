//! ELF64 program loading: turns a path into a freshly mapped address
//! space, an entry point, and an initial user stack, ready to be handed
//! to a thread about to return to user mode.
//!
//! Building the new address space is kept separate from installing it
//! into a running process (that belongs to the `execve` syscall path) --
//! mirroring how loading can fail partway through without having
//! disturbed anything the caller is still relying on.

use crate::lib::error::Errno;
use crate::mm::mmu;
use crate::mm::page::PAGE_SIZE;
use crate::mm::pmm;
use crate::mm::vmm::{self, MapFlags, VmmContext};
use crate::vfs::{self, Inode, InodeType, OpenFlags};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;
const PT_PHDR: u32 = 6;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Top of every user stack; matches the fixed window the original
/// reserves below it for the stack itself.
const STACK_TOP: u64 = 0x0000_0000_6000_0000;
const STACK_PAGES: u64 = 64;
const INTERP_BASE: u64 = 0x0000_0000_4000_0000;

#[derive(Debug)]
pub enum ElfError {
    Io(Errno),
    NotFound,
    NotRegular,
    BadMagic,
    WrongClass,
    WrongMachine,
    Truncated,
}

impl From<Errno> for ElfError {
    fn from(e: Errno) -> Self {
        ElfError::Io(e)
    }
}

struct Ehdr {
    e_type: u16,
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

fn read_at(inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<(), ElfError> {
    let n = inode.read(offset, buf)?;
    if n != buf.len() {
        return Err(ElfError::Truncated);
    }
    Ok(())
}

fn parse_ehdr(inode: &Inode) -> Result<Ehdr, ElfError> {
    let mut raw = [0u8; EHDR_SIZE];
    read_at(inode, 0, &mut raw)?;

    if raw[0..4] != ELFMAG {
        return Err(ElfError::BadMagic);
    }
    if raw[4] != ELFCLASS64 {
        return Err(ElfError::WrongClass);
    }

    let u16_at = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]);
    let u64_at = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());

    let e_machine = u16_at(EI_NIDENT + 2);
    if e_machine != EM_X86_64 {
        return Err(ElfError::WrongMachine);
    }

    Ok(Ehdr {
        e_type: u16_at(EI_NIDENT),
        e_entry: u64_at(EI_NIDENT + 8),
        e_phoff: u64_at(EI_NIDENT + 16),
        e_phentsize: u16_at(EI_NIDENT + 46),
        e_phnum: u16_at(EI_NIDENT + 48),
    })
}

fn parse_phdr(inode: &Inode, phoff: u64, index: u16) -> Result<Phdr, ElfError> {
    let mut raw = [0u8; PHDR_SIZE];
    read_at(inode, phoff + index as u64 * PHDR_SIZE as u64, &mut raw)?;

    let u32_at = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
    let u64_at = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());

    Ok(Phdr {
        p_type: u32_at(0),
        p_flags: u32_at(4),
        p_offset: u64_at(8),
        p_vaddr: u64_at(16),
        p_filesz: u64_at(32),
        p_memsz: u64_at(40),
    })
}

/// Maps and fills one `PT_LOAD` segment: a fresh frame per page,
/// written through the kernel's direct physical map and then mapped
/// into `context` at its final user address -- the target address
/// space isn't active on this CPU, so there's no other way to reach it.
fn load_segment(context: &Arc<VmmContext>, vaddr: u64, phdr: &Phdr, inode: &Inode) -> Result<(), ElfError> {
    let mut mmu_flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if phdr.p_flags & PF_W != 0 {
        mmu_flags |= PageTableFlags::WRITABLE;
    }
    if phdr.p_flags & PF_X == 0 {
        mmu_flags |= PageTableFlags::NO_EXECUTE;
    }

    let mut remaining_file = phdr.p_filesz;
    let mut file_off = phdr.p_offset;
    let mut cur = vaddr;
    let end = vaddr + phdr.p_memsz;

    while cur < end {
        let misalign = (cur as usize) & (PAGE_SIZE - 1);
        let page_base = cur - misalign as u64;
        let room = PAGE_SIZE - misalign;

        let phys = pmm::alloc().map_err(|_| Errno::ENOMEM)?;
        let kvirt = mmu::phys_to_virt(phys).as_mut_ptr::<u8>();
        unsafe {
            core::ptr::write_bytes(kvirt, 0, PAGE_SIZE);
        }

        if remaining_file > 0 {
            let want = core::cmp::min(room as u64, remaining_file) as usize;
            let dst = unsafe { core::slice::from_raw_parts_mut(kvirt.add(misalign), want) };
            read_at(inode, file_off, dst)?;
            file_off += want as u64;
            remaining_file -= want as u64;
        }

        vmm::map(context, page_base, phys, PAGE_SIZE, MapFlags::empty(), mmu_flags)
            .map_err(|_| Errno::ENOMEM)?;

        cur += room as u64;
    }

    Ok(())
}

struct ElfImage {
    entry: u64,
    phdr: u64,
    phent_size: u16,
    phent_num: u16,
    interpreter: Option<String>,
}

/// Loads one ELF64 image into `context` at `virt_off` (0 for the main
/// executable, a fixed base for its interpreter), returning where it
/// landed.
fn load_elf64(path: &str, virt_off: u64, context: &Arc<VmmContext>) -> Result<ElfImage, ElfError> {
    let file = vfs::open(path, OpenFlags::O_RDONLY)?;
    let inode = file.inode.as_ref().ok_or(ElfError::NotFound)?;
    if inode.itype() != InodeType::Regular {
        return Err(ElfError::NotRegular);
    }

    let ehdr = parse_ehdr(inode)?;
    if ehdr.e_type != 2 && ehdr.e_type != 3 {
        // ET_EXEC or ET_DYN only.
        return Err(ElfError::WrongMachine);
    }

    let mut phdr_addr = 0u64;
    let mut interpreter = None;

    for i in 0..ehdr.e_phnum {
        let phdr = parse_phdr(inode, ehdr.e_phoff, i)?;
        let vaddr = virt_off + phdr.p_vaddr;

        match phdr.p_type {
            PT_PHDR => phdr_addr = vaddr,
            PT_INTERP => {
                let mut buf = alloc::vec![0u8; phdr.p_filesz as usize];
                read_at(inode, phdr.p_offset, &mut buf)?;
                let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                interpreter = Some(String::from_utf8_lossy(&buf[..len]).into_owned());
            }
            PT_LOAD => load_segment(context, vaddr, &phdr, inode)?,
            _ => {}
        }
    }

    Ok(ElfImage {
        entry: virt_off + ehdr.e_entry,
        phdr: phdr_addr,
        phent_size: ehdr.e_phentsize,
        phent_num: ehdr.e_phnum,
        interpreter,
    })
}

const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_ENTRY: u64 = 9;

/// Writes argv/envp strings and an auxv onto a freshly allocated user
/// stack, returning the stack pointer `_start` should be entered with.
/// Built through the same kernel physical-map alias `load_segment` uses,
/// since the target address space isn't active here either.
fn prepare_stack(image: &ElfImage, stack_phys_top: u64, argv: &[String], envp: &[String]) -> u64 {
    let kbase = mmu::phys_to_virt(stack_phys_top - (STACK_PAGES * PAGE_SIZE as u64)).as_u64();
    let ktop = kbase + STACK_PAGES * PAGE_SIZE as u64;
    let mut cursor = ktop;

    let mut push_str = |s: &str| -> u64 {
        let bytes = s.as_bytes();
        cursor -= bytes.len() as u64 + 1;
        let dst = unsafe { core::slice::from_raw_parts_mut(cursor as *mut u8, bytes.len() + 1) };
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
        STACK_TOP - (ktop - cursor)
    };

    let env_ptrs: Vec<u64> = envp.iter().map(|s| push_str(s)).collect();
    let argv_ptrs: Vec<u64> = argv.iter().map(|s| push_str(s)).collect();

    cursor &= !0xF;
    if (argv.len() + envp.len() + 1) & 1 != 0 {
        cursor -= 8;
    }

    let mut push_u64 = |v: u64| {
        cursor -= 8;
        unsafe { (cursor as *mut u64).write(v) };
    };

    push_u64(AT_NULL);
    push_u64(0);
    push_u64(image.entry);
    push_u64(AT_ENTRY);
    push_u64(image.phdr);
    push_u64(AT_PHDR);
    push_u64(image.phent_size as u64);
    push_u64(AT_PHENT);
    push_u64(image.phent_num as u64);
    push_u64(AT_PHNUM);

    push_u64(0);
    for ptr in env_ptrs.iter().rev() {
        push_u64(*ptr);
    }
    push_u64(0);
    for ptr in argv_ptrs.iter().rev() {
        push_u64(*ptr);
    }
    push_u64(argv.len() as u64);

    STACK_TOP - (ktop - cursor)
}

/// Reserves and maps the user stack, returning the physical address one
/// past its last frame (what `prepare_stack` writes downward from).
fn map_stack(context: &Arc<VmmContext>) -> Result<u64, Errno> {
    let stack_base = STACK_TOP - STACK_PAGES * PAGE_SIZE as u64;
    let flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::USER_ACCESSIBLE
        | PageTableFlags::NO_EXECUTE;

    let mut last_phys = 0u64;
    for i in 0..STACK_PAGES {
        let phys = pmm::alloc().map_err(|_| Errno::ENOMEM)?;
        unsafe {
            core::ptr::write_bytes(mmu::phys_to_virt(phys).as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
        vmm::map(context, stack_base + i * PAGE_SIZE as u64, phys, PAGE_SIZE, MapFlags::empty(), flags)
            .map_err(|_| Errno::ENOMEM)?;
        last_phys = phys;
    }
    Ok(last_phys + PAGE_SIZE as u64)
}

/// A loaded, ready-to-run program image: a brand new address space plus
/// the register state a thread needs to land in it at user mode.
pub struct PreparedProcess {
    pub vmm: Arc<VmmContext>,
    pub entry: u64,
    pub stack_pointer: u64,
}

/// Builds a brand new address space for `path`, loading its interpreter
/// (if any) alongside it and laying out argv/envp on a fresh stack.
/// Leaves installing the result into a running process -- swapping a
/// thread's page tables and trap frame -- to the caller.
pub fn prepare_proc(path: &str, argv: &[String], envp: &[String]) -> Result<PreparedProcess, ElfError> {
    let context = vmm::new_context(None).map_err(|_| Errno::ENOMEM)?;

    let program = load_elf64(path, 0, &context)?;
    let entry = if let Some(interp) = &program.interpreter {
        load_elf64(interp, INTERP_BASE, &context)?.entry
    } else {
        program.entry
    };

    let stack_phys_top = map_stack(&context)?;
    let stack_pointer = prepare_stack(&program, stack_phys_top, argv, envp);

    Ok(PreparedProcess { vmm: context, entry, stack_pointer })
}
