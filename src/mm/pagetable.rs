//! 页表配置与管理
//!
//! 用户地址空间的三级 Sv39 页表。中间级页表以 `Box` 挂在父表上，
//! 叶子页表项记录用户页帧的物理地址以及 V/R/W/U/A/D 标志；
//! [`PageTable::touch`] 代替硬件完成一次访存的地址翻译与 A/D 位维护。

use array_macro::array;

use alloc::boxed::Box;

use crate::consts::{PGSHIFT, SV39FLAGLEN};
use super::{Addr, PhysAddr, VirtAddr, VmError};

bitflags! {
    /// 内存页表项权限标志（Page Table Entry Flags）
    ///
    /// 该结构体定义了页表项中的各种权限和状态标志，
    /// 用于控制虚拟内存页的访问权限和管理信息。
    pub struct PteFlag: usize {
        /// 有效位（Valid）
        const V = 1 << 0;
        /// 读权限（Readable）
        const R = 1 << 1;
        /// 写权限（Writable）
        const W = 1 << 2;
        /// 执行权限（Executable）
        const X = 1 << 3;
        /// 用户态访问权限（User）
        const U = 1 << 4;
        /// 全局位（Global）
        const G = 1 << 5;
        /// 访问位（Accessed）
        /// 访存时置位，由页帧置换的时钟扫描清除。
        const A = 1 << 6;
        /// 脏位（Dirty）
        /// 写入时置位，由页帧置换的时钟扫描清除并记入 `remember_dirty`。
        const D = 1 << 7;
    }
}

/// 一次访存失败的原因，对应硬件页故障的两种情形。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessFault {
    /// 页不在内存中
    NotPresent,
    /// 写只读页
    ReadOnly,
}

/// 页表项结构体（PageTableEntry）
///
/// 封装了页表项的原始数据，包括物理页帧号和权限标志。
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageTableEntry {
    data: usize,
}

impl PageTableEntry {
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.data & (PteFlag::V.bits())) > 0
    }

    #[inline]
    fn is_user(&self) -> bool {
        (self.data & (PteFlag::U.bits())) > 0
    }

    #[inline]
    pub fn as_phys_addr(&self) -> PhysAddr {
        PhysAddr::from_raw((self.data >> SV39FLAGLEN) << PGSHIFT)
    }

    #[inline]
    fn write_zero(&mut self) {
        self.data = 0;
    }

    /// 写入指向下一级页表的页表项
    #[inline]
    fn write_table(&mut self) {
        self.data = PteFlag::V.bits();
    }

    #[inline]
    fn write_perm(&mut self, pa: PhysAddr, perm: PteFlag) {
        self.data = ((pa.as_usize() >> PGSHIFT) << SV39FLAGLEN) | (perm | PteFlag::V).bits()
    }

    #[inline]
    pub fn read_perm(&self) -> PteFlag {
        PteFlag::from_bits_truncate(self.data)
    }

    #[inline]
    fn set_flag(&mut self, flag: PteFlag, value: bool) {
        if value {
            self.data |= flag.bits();
        } else {
            self.data &= !flag.bits();
        }
    }
}

/// 一级页表：512 个页表项，以及各项所指向的下一级页表。
pub struct PageTable {
    data: [PageTableEntry; 512],
    children: [Option<Box<PageTable>>; 512],
}

impl PageTable {
    pub fn empty() -> Self {
        Self {
            data: array![_ => PageTableEntry { data: 0 }; 512],
            children: array![_ => None; 512],
        }
    }

    /// 将用户页 `va` 映射到页帧 `pa`。
    ///
    /// # 参数
    /// - `va`：页对齐的用户虚拟地址；
    /// - `pa`：用户页帧的物理地址；
    /// - `writable`：是否允许写入。
    ///
    /// # 可能的错误
    /// `va` 已有有效映射时返回 [`VmError::Remap`]，原映射保持不变。
    pub fn map(&mut self, va: VirtAddr, pa: PhysAddr, writable: bool) -> Result<(), VmError> {
        let pte = self.walk_alloc(va);
        if pte.is_valid() {
            return Err(VmError::Remap(va.as_usize()))
        }
        let mut perm = PteFlag::R | PteFlag::U;
        if writable {
            perm |= PteFlag::W;
        }
        pte.write_perm(pa, perm);
        Ok(())
    }

    /// 清除 `va` 的映射，返回原来映射的页帧。
    pub fn unmap(&mut self, va: VirtAddr) -> Option<PhysAddr> {
        let pte = self.walk_mut(va)?;
        if !pte.is_valid() {
            return None
        }
        let pa = pte.as_phys_addr();
        pte.write_zero();
        Some(pa)
    }

    /// 沿三级页表查找 `va` 的叶子页表项，缺少的中间级页表随之分配。
    fn walk_alloc(&mut self, va: VirtAddr) -> &mut PageTableEntry {
        let mut pgt = self;
        for level in (1..=2).rev() {
            let idx = va.page_num(level);
            if pgt.children[idx].is_none() {
                pgt.data[idx].write_table();
            }
            pgt = pgt.children[idx].get_or_insert_with(|| Box::new(PageTable::empty())).as_mut();
        }
        &mut pgt.data[va.page_num(0)]
    }

    /// 与 [walk_alloc] 功能相同，
    /// 但如果页表不存在时不会分配新的页表。
    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        let mut pgt = self;
        for level in (1..=2).rev() {
            pgt = pgt.children[va.page_num(level)].as_deref_mut()?;
        }
        Some(&mut pgt.data[va.page_num(0)])
    }

    /// 与 [walk_mut] 功能相同，
    /// 但返回的是不可变引用（非可变的页表项引用）。
    pub fn walk(&self, va: VirtAddr) -> Option<&PageTableEntry> {
        let mut pgt = self;
        for level in (1..=2).rev() {
            pgt = pgt.children[va.page_num(level)].as_deref()?;
        }
        Some(&pgt.data[va.page_num(0)])
    }

    /// # 功能说明
    /// 根据虚拟地址 `va` 查找对应的物理页帧。
    ///
    /// # 返回值
    /// - `Ok(PhysAddr)`：虚拟地址所在页映射到的页帧。
    /// - `Err(&'static str)`：页表项无效、非用户映射或虚拟地址未映射。
    pub fn walk_addr(&self, va: VirtAddr)
        -> Result<PhysAddr, &'static str>
    {
        match self.walk(va) {
            Some(pte) => {
                if !pte.is_valid() {
                    Err("pte not valid")
                } else if !pte.is_user() {
                    Err("pte not mapped for user")
                } else {
                    Ok(pte.as_phys_addr())
                }
            }
            None => {
                Err("va not mapped")
            }
        }
    }

    fn flag(&self, va: VirtAddr, flag: PteFlag) -> bool {
        match self.walk(va) {
            Some(pte) if pte.is_valid() => pte.read_perm().contains(flag),
            _ => false,
        }
    }

    fn set(&mut self, va: VirtAddr, flag: PteFlag, value: bool) {
        if let Some(pte) = self.walk_mut(va) {
            if pte.is_valid() {
                pte.set_flag(flag, value);
            }
        }
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.flag(va, PteFlag::A)
    }

    pub fn set_accessed(&mut self, va: VirtAddr, value: bool) {
        self.set(va, PteFlag::A, value)
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.flag(va, PteFlag::D)
    }

    pub fn set_dirty(&mut self, va: VirtAddr, value: bool) {
        self.set(va, PteFlag::D, value)
    }

    pub fn is_writable(&self, va: VirtAddr) -> bool {
        self.flag(va, PteFlag::W)
    }

    /// 模拟一次用户访存。
    ///
    /// # 流程解释
    /// 1. 查找 `va` 的页表项，无效则报告缺页；
    /// 2. 写访问遇到只读页则报告写保护故障；
    /// 3. 置 A 位，写访问再置 D 位；
    /// 4. 返回翻译后的物理地址（含页内偏移）。
    pub fn touch(&mut self, va: VirtAddr, write: bool) -> Result<PhysAddr, AccessFault> {
        let pte = match self.walk_mut(va) {
            Some(pte) if pte.is_valid() => pte,
            _ => return Err(AccessFault::NotPresent),
        };
        if write && !pte.read_perm().contains(PteFlag::W) {
            return Err(AccessFault::ReadOnly)
        }
        pte.set_flag(PteFlag::A, true);
        if write {
            pte.set_flag(PteFlag::D, true);
        }
        Ok(PhysAddr::from_raw(pte.as_phys_addr().as_usize() | va.page_offset()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    fn va(addr: usize) -> VirtAddr {
        VirtAddr::try_from(addr).unwrap()
    }

    #[test]
    fn map_touch_unmap() {
        let mut pt = PageTable::empty();
        let pa = PhysAddr::from_raw(0x8800_3000);
        pt.map(va(0x0804_8000), pa, false).unwrap();
        assert_eq!(pt.walk_addr(va(0x0804_8000)), Ok(pa));
        assert_eq!(pt.map(va(0x0804_8000), pa, true), Err(VmError::Remap(0x0804_8000)));

        assert!(!pt.is_accessed(va(0x0804_8000)));
        assert_eq!(pt.touch(va(0x0804_8010), false), Ok(PhysAddr::from_raw(0x8800_3010)));
        assert!(pt.is_accessed(va(0x0804_8000)));
        assert_eq!(pt.touch(va(0x0804_8010), true), Err(AccessFault::ReadOnly));
        assert!(!pt.is_dirty(va(0x0804_8000)));

        assert_eq!(pt.unmap(va(0x0804_8000)), Some(pa));
        assert_eq!(pt.touch(va(0x0804_8000), false), Err(AccessFault::NotPresent));
        assert_eq!(pt.unmap(va(0x0804_8000)), None);
    }

    #[test]
    fn dirty_bit_follows_writes() {
        let mut pt = PageTable::empty();
        let page = va(0xbfff_f000);
        pt.map(page, PhysAddr::from_raw(0x8800_0000), true).unwrap();
        pt.touch(va(0xbfff_fffc), true).unwrap();
        assert!(pt.is_dirty(page) && pt.is_accessed(page));
        pt.set_dirty(page, false);
        pt.set_accessed(page, false);
        assert!(!pt.is_dirty(page) && !pt.is_accessed(page));
        assert!(pt.is_writable(page));
        assert_eq!(pt.walk_addr(va(0x1000)), Err("va not mapped"));
    }
}
