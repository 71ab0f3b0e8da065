//! 交换区管理
//!
//! 交换设备按扇区记录占用情况，一个交换槽是连续的 `SECTORS_PER_PAGE` 个扇区，
//! 以第一个扇区号标识。位图操作与扇区读写都在同一把睡眠锁下完成。

use alloc::sync::Arc;
use core::convert::TryFrom;

use log::{debug, info};

use crate::bitmap::Bitmap;
use crate::consts::fs::{BSIZE, SECTORS_PER_PAGE};
use crate::driver::{BlockDevice, Sector};
use crate::sleeplock::SleepLock;

use super::{RawSinglePage, VmError};

/// 交换槽，即一页内容在交换设备上的位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[inline]
    pub const fn from_raw(sector: usize) -> Self {
        Self(sector)
    }

    /// 槽内第一个扇区的扇区号
    #[inline]
    pub fn sector(&self) -> usize {
        self.0
    }
}

pub struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    slots: SleepLock<Bitmap>,
}

impl SwapTable {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let sectors = dev.size() as usize;
        info!("swap: {} with {} slots", dev.name(), sectors / SECTORS_PER_PAGE);
        Self { dev, slots: SleepLock::new(Bitmap::new(sectors), "swap") }
    }

    /// # 功能说明
    /// 把一页内容写入交换设备。
    ///
    /// # 流程解释
    /// 1. 在位图中找到第一段连续 `SECTORS_PER_PAGE` 个空闲扇区并标记为已用；
    /// 2. 逐扇区写出页内容。
    ///
    /// # 返回值
    /// 保存该页内容的交换槽。
    ///
    /// # 可能的错误
    /// 没有足够的连续空闲扇区时返回 [`VmError::SwapFull`]，位图保持不变。
    pub fn swap_out(&self, page: &RawSinglePage) -> Result<SwapSlot, VmError> {
        let mut slots = self.slots.lock();
        let start = slots.scan_and_flip(SECTORS_PER_PAGE, false).ok_or(VmError::SwapFull)?;
        for (i, chunk) in page.as_bytes().chunks_exact(BSIZE).enumerate() {
            let buf = match <&Sector>::try_from(chunk) {
                Ok(buf) => buf,
                Err(_) => unreachable!(),
            };
            self.dev.write_sector((start + i) as u32, buf);
        }
        drop(slots);
        debug!("swap: out to slot {}", start);
        Ok(SwapSlot(start))
    }

    /// 从交换槽 `slot` 读回一页内容，随后释放该槽。
    pub fn swap_in(&self, slot: SwapSlot, page: &mut RawSinglePage) {
        let mut slots = self.slots.lock();
        if !slots.all(slot.0, SECTORS_PER_PAGE, true) {
            panic!("swap: reading free slot {}", slot.0);
        }
        for (i, chunk) in page.as_bytes_mut().chunks_exact_mut(BSIZE).enumerate() {
            let buf = match <&mut Sector>::try_from(chunk) {
                Ok(buf) => buf,
                Err(_) => unreachable!(),
            };
            self.dev.read_sector((slot.0 + i) as u32, buf);
        }
        slots.set_multiple(slot.0, SECTORS_PER_PAGE, false);
        drop(slots);
        debug!("swap: in from slot {}", slot.0);
    }

    /// 丢弃交换槽中的内容，用于销毁仍有页面换出在外的地址空间。
    pub fn release(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        if !slots.all(slot.0, SECTORS_PER_PAGE, true) {
            panic!("swap: double freeing slot {}", slot.0);
        }
        slots.set_multiple(slot.0, SECTORS_PER_PAGE, false);
    }

    /// 正在使用的交换槽数量
    pub fn used_slots(&self) -> usize {
        let slots = self.slots.lock();
        slots.count(0, slots.len(), true) / SECTORS_PER_PAGE
    }

    /// 交换设备可容纳的页数
    pub fn capacity(&self) -> usize {
        self.slots.lock().len() / SECTORS_PER_PAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RamDisk;

    fn page_of(byte: u8) -> alloc::boxed::Box<RawSinglePage> {
        let mut page = RawSinglePage::new_zeroed();
        page.as_bytes_mut().fill(byte);
        page
    }

    #[test]
    fn out_and_in_round_trip_frees_slot() {
        let swap = SwapTable::new(Arc::new(RamDisk::new("hdb", 3 * SECTORS_PER_PAGE as u32)));
        assert_eq!(swap.capacity(), 3);

        let a = swap.swap_out(&page_of(0xaa)).unwrap();
        let b = swap.swap_out(&page_of(0xbb)).unwrap();
        assert_eq!(a.sector(), 0);
        assert_eq!(b.sector(), SECTORS_PER_PAGE);
        assert_eq!(swap.used_slots(), 2);

        let mut back = RawSinglePage::new_zeroed();
        swap.swap_in(a, &mut back);
        assert!(back.as_bytes().iter().all(|&x| x == 0xaa));
        assert_eq!(swap.used_slots(), 1);

        // 释放后的槽被第一个适配的换出复用
        assert_eq!(swap.swap_out(&page_of(0xcc)).unwrap(), a);
        swap.release(b);
        assert_eq!(swap.used_slots(), 1);
    }

    #[test]
    fn full_device_reports_error() {
        let swap = SwapTable::new(Arc::new(RamDisk::new("hdb", SECTORS_PER_PAGE as u32 + 3)));
        swap.swap_out(&page_of(1)).unwrap();
        assert_eq!(swap.swap_out(&page_of(2)), Err(VmError::SwapFull));
        assert_eq!(swap.used_slots(), 1);
    }

    #[test]
    #[should_panic(expected = "double freeing")]
    fn double_release_panics() {
        let swap = SwapTable::new(Arc::new(RamDisk::new("hdb", 16)));
        let slot = swap.swap_out(&page_of(1)).unwrap();
        swap.release(slot);
        swap.release(slot);
    }
}
