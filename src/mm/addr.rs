//! 提供物理地址与虚拟地址包装

use core::convert::TryFrom;
use core::result::Result;

use crate::consts::{PGMASK, PGMASKLEN, PGSHIFT, PGSIZE, MAXVA};

/// 地址类型通用接口
///
/// 定义物理地址和虚拟地址共有的操作方法，
/// 包括页对齐调整、地址转换等。
pub trait Addr {
    /// 获取内部地址值的不可变引用
    fn data_ref(&self) -> &usize;

    /// 获取内部地址值的可变引用
    fn data_mut(&mut self) -> &mut usize;

    /// 向下取整到页边界
    #[inline]
    fn pg_round_down(&mut self) {
        *self.data_mut() = *self.data_mut() & !(PGSIZE - 1)
    }

    /// 获取地址的usize表示
    #[inline]
    fn as_usize(&self) -> usize {
        *self.data_ref()
    }

    /// 页内偏移
    #[inline]
    fn page_offset(&self) -> usize {
        *self.data_ref() & (PGSIZE - 1)
    }
}

/// 物理地址封装类型
///
/// 用户页帧的物理地址由页帧池按下标计算得到，始终页对齐。
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct PhysAddr(usize);

impl Addr for PhysAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl PhysAddr {
    /// 从原始usize值构造物理地址
    ///
    /// 调用者必须确保`raw`页对齐。
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

/// 虚拟地址封装类型
///
/// # Sv39规范保证
/// 地址值保证满足RISC-V Sv39虚拟内存规范：
/// - 63-39位必须为0（避免符号扩展问题）
/// - 最大地址不超过`MAXVA`
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct VirtAddr(usize);

impl Addr for VirtAddr {
    #[inline]
    fn data_ref(&self) -> &usize {
        &self.0
    }

    #[inline]
    fn data_mut(&mut self) -> &mut usize {
        &mut self.0
    }
}

impl VirtAddr {
    /// 获取指定层级的虚拟页号(VPN)
    ///
    /// # 参数
    /// - `level`: 页表层级（0=4KB页, 1=2MB大页, 2=1GB大页）
    ///
    /// # 返回值
    /// 指定层级的9位VPN值
    #[inline]
    pub fn page_num(&self, level: usize) -> usize {
        (self.0 >> (PGSHIFT + level * PGMASKLEN)) & PGMASK
    }
}

impl TryFrom<usize> for VirtAddr {
    type Error = &'static str;

    /// 尝试从usize创建虚拟地址
    ///
    /// # 检查条件
    /// 地址值必须小于`MAXVA`
    fn try_from(addr: usize) -> Result<Self, Self::Error> {
        if addr >= MAXVA {
            Err("value for VirtAddr should be smaller than 1<<38")
        } else {
            Ok(Self(addr))
        }
    }
}
