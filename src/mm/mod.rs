//! 内存管理模块
//!
//! 用户页帧池、页帧表与时钟置换、补充页表、交换区，以及缺页处理。

use alloc::boxed::Box;
use core::convert::TryFrom;

use thiserror::Error;

use crate::consts::{PGSIZE, NUSERFRAMES, STACK_LIMIT};

pub use addr::{Addr, PhysAddr, VirtAddr};
pub use frame::FrameTable;
pub use page::{PageEntry, PageKind, SupPageTable};
pub use pagetable::{AccessFault, PageTable, PteFlag};
pub use swap::{SwapSlot, SwapTable};
pub use vm::{AddressSpace, PageFault, Pid, Vm};

mod addr;
mod frame;
mod page;
mod pagetable;
mod swap;
mod vm;

/// 虚拟内存子系统可能返回的错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("swap device is full")]
    SwapFull,
    #[error("illegal access to {0:#x}")]
    InvalidAccess(usize),
    #[error("write to read-only page {0:#x}")]
    ReadOnly(usize),
    #[error("short read while loading page {upage:#x}: {read} of {expected} bytes")]
    ShortRead { upage: usize, read: usize, expected: usize },
    #[error("page {0:#x} is already tracked")]
    DuplicatePage(usize),
    #[error("page {0:#x} is already mapped")]
    Remap(usize),
}

/// 虚拟内存子系统的运行参数
#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    /// 用户页帧池中的页帧数量
    pub user_frames: usize,
    /// 用户栈允许增长到的最大字节数
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { user_frames: NUSERFRAMES, stack_limit: STACK_LIMIT }
    }
}

/// 单页大小（4096字节）的内存页结构
///
/// # 内存布局
/// - `#[repr(C, align(4096)]` 确保页对齐
/// - 固定大小：`PGSIZE`（通常4096字节）
#[repr(C, align(4096))]
pub struct RawSinglePage {
    data: [u8; PGSIZE]
}

impl RawSinglePage {
    /// 分配一个已归零的页
    pub fn new_zeroed() -> Box<Self> {
        Box::new(Self { data: [0; PGSIZE] })
    }

    pub fn as_bytes(&self) -> &[u8; PGSIZE] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PGSIZE] {
        &mut self.data
    }

    pub fn zero(&mut self) {
        self.data.fill(0);
    }
}

/// 向上取整到页边界
///
/// # 功能说明
/// 计算大于等于`address`的最小页对齐地址
#[inline]
pub fn pg_round_up(address: usize) -> usize {
    (address + (PGSIZE - 1)) & !(PGSIZE - 1)
}

/// 向下取整到页边界
///
/// # 功能说明
/// 计算小于等于`address`的最大页对齐地址
#[inline]
pub fn pg_round_down(address: usize) -> usize {
    address & !(PGSIZE - 1)
}

/// 将用户地址向下取整为页对齐的虚拟地址。
///
/// # 可能的错误
/// 地址超出 Sv39 可寻址范围时返回 [`VmError::InvalidAccess`]。
pub(crate) fn user_page(addr: usize) -> Result<VirtAddr, VmError> {
    let mut va = VirtAddr::try_from(addr).map_err(|_| VmError::InvalidAccess(addr))?;
    va.pg_round_down();
    Ok(va)
}
