//! 从文件系统加载ELF文件开始执行
//!
//! 可执行文件的各个段只在补充页表中登记，页面在第一次访问时才从文件读入。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::ptr;

use crate::consts::{PGSIZE, PHYS_BASE, MAXARG};
use crate::fs::File;
use crate::mm::{pg_round_down, pg_round_up, AddressSpace, Vm};

use super::SysError;

/// 加载完成后用户程序的初始现场
pub struct LoadInfo {
    pub entry: usize,
    pub sp: usize,
    pub argc: usize,
    pub argv: usize,
}

/// # 功能说明
/// 将可执行文件 `image` 装入地址空间 `aspace`，并在用户栈上准备命令行参数。
///
/// # 流程解释
/// 1. 读取并检查 ELF 头；
/// 2. 对每个 `PT_LOAD` 程序头检查合法性，并把它覆盖的页登记为惰性装入的文件页；
/// 3. 建立用户栈第一页；
/// 4. 依次压入各参数字符串与 `argv` 指针数组，栈指针按 16 字节对齐。
///
/// # 参数
/// - `vm`：虚拟内存子系统；
/// - `aspace`：新进程的地址空间；
/// - `image`：可执行文件，段页面共享这一个打开文件；
/// - `argv`：命令行参数，第一个为程序名。
///
/// # 返回值
/// 入口地址、初始栈指针以及 `argc`/`argv`。
///
/// # 可能的错误
/// - [`SysError::BadExecutable`]：文件不是合法的 ELF 可执行文件，或参数放不下一页栈；
/// - [`SysError::Fault`]：登记段页面或建立用户栈失败。
pub fn load(vm: &Vm, aspace: &Arc<AddressSpace>, image: Arc<File>, argv: &[&str]) -> Result<LoadInfo, SysError> {
    let elf: ElfHeader = read_struct(&image, 0).ok_or(SysError::BadExecutable("cannot read elf header"))?;
    if elf.magic != ELF_MAGIC {
        return Err(SysError::BadExecutable("bad elf magic number"))
    }
    if elf.phentsize as usize != mem::size_of::<ProgHeader>() || elf.phnum > 1024 {
        return Err(SysError::BadExecutable("bad program header table"))
    }

    let ph_size = mem::size_of::<ProgHeader>();
    let mut off = elf.phoff as usize;
    for _ in 0..elf.phnum {
        let ph: ProgHeader = read_struct(&image, off)
            .ok_or(SysError::BadExecutable("cannot read elf program header"))?;
        off += ph_size;
        if ph.pg_type != ELF_PROG_LOAD {
            continue;
        }
        validate_segment(&ph, image.length())?;

        let file_page = pg_round_down(ph.off as usize);
        let mem_page = pg_round_down(ph.vaddr as usize);
        let page_offset = ph.vaddr as usize % PGSIZE;
        let (read_bytes, zero_bytes) = if ph.filesz > 0 {
            let read_bytes = page_offset + ph.filesz as usize;
            (read_bytes, pg_round_up(page_offset + ph.memsz as usize) - read_bytes)
        } else {
            (0, pg_round_up(page_offset + ph.memsz as usize))
        };
        let writable = ph.flags & ELF_PROG_FLAG_WRITE != 0;
        vm.load_segment(aspace, image.clone(), file_page, mem_page, read_bytes, zero_bytes, writable)?;
    }

    let mut sp = vm.setup_stack(aspace)?;
    let stack_base = PHYS_BASE - PGSIZE;
    if argv.len() > MAXARG {
        return Err(SysError::BadExecutable("cmd args too much for stack"))
    }

    // 参数字符串
    let mut ustack: Vec<usize> = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        let count = arg.len() + 1;
        sp = sp.checked_sub(count).filter(|&sp| sp >= stack_base)
            .ok_or(SysError::BadExecutable("cmd args too much for stack"))?;
        let mut bytes = Vec::with_capacity(count);
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);
        vm.copy_out(aspace, sp, &bytes)?;
        ustack.push(sp);
    }
    ustack.push(0);

    // argv 指针数组
    let table: Vec<u8> = ustack.iter().flat_map(|p| p.to_le_bytes()).collect();
    sp = align_sp(sp.saturating_sub(table.len()));
    if sp < stack_base {
        return Err(SysError::BadExecutable("cmd args too much for stack"))
    }
    vm.copy_out(aspace, sp, &table)?;

    Ok(LoadInfo { entry: elf.entry as usize, sp, argc: argv.len(), argv: sp })
}

/// 检查程序头描述的段是否可以装入用户地址空间。
fn validate_segment(ph: &ProgHeader, file_len: usize) -> Result<(), SysError> {
    if ph.off as usize % PGSIZE != ph.vaddr as usize % PGSIZE {
        return Err(SysError::BadExecutable("segment offset and address misaligned"))
    }
    if ph.off as usize > file_len {
        return Err(SysError::BadExecutable("segment beyond end of file"))
    }
    if ph.memsz < ph.filesz || ph.memsz == 0 {
        return Err(SysError::BadExecutable("one program header meta not correct"))
    }
    let end = ph.vaddr.checked_add(ph.memsz)
        .ok_or(SysError::BadExecutable("segment wraps around"))?;
    if ph.vaddr < PGSIZE as u64 || end > PHYS_BASE as u64 {
        return Err(SysError::BadExecutable("segment outside user space"))
    }
    Ok(())
}

/// 从文件偏移 `off` 处读出一个 `T`，文件不够长时返回 `None`。
fn read_struct<T: Copy>(file: &File, off: usize) -> Option<T> {
    let mut raw = [0u8; 64];
    let size = mem::size_of::<T>();
    debug_assert!(size <= raw.len());
    if file.read_at(&mut raw[..size], off) != size {
        return None
    }
    // 安全性：只用于由整数字段组成的 repr(C) 头部结构，任何位模式都合法
    Some(unsafe { ptr::read_unaligned(raw.as_ptr() as *const T) })
}

#[inline(always)]
fn align_sp(sp: usize) -> usize {
    sp - (sp % 16)
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ElfHeader {
    pub magic: u32,
    pub elf: [u8; 12],
    pub elf_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProgHeader {
    pub pg_type: u32,
    pub flags: u32,
    pub off: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

pub const ELF_MAGIC: u32 = 0x464C457F;
pub const ELF_PROG_LOAD: u32 = 1;
pub const ELF_PROG_FLAG_WRITE: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes() {
        assert_eq!(mem::size_of::<ElfHeader>(), 64);
        assert_eq!(mem::size_of::<ProgHeader>(), 56);
    }

    #[test]
    fn segment_checks() {
        let mut ph = ProgHeader {
            pg_type: ELF_PROG_LOAD,
            flags: 0,
            off: 0x1000,
            vaddr: 0x0804_8000,
            paddr: 0,
            filesz: 0x200,
            memsz: 0x1000,
            align: 0x1000,
        };
        assert!(validate_segment(&ph, 0x2000).is_ok());
        ph.vaddr += 8;
        assert!(validate_segment(&ph, 0x2000).is_err());
        ph.vaddr = 0;
        ph.off = 0;
        assert!(validate_segment(&ph, 0x2000).is_err());
        ph.vaddr = PHYS_BASE as u64 - 0x1000;
        ph.memsz = 0x2000;
        assert!(validate_segment(&ph, 0x2000).is_err());
    }
}
