//! 以内存模拟的块设备

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::consts::fs::BSIZE;
use crate::spinlock::SpinLock;

use super::{BlockDevice, Sector};

/// 内存盘，每个扇区是一段 `BSIZE` 字节的数组。
///
/// 另外记录读写次数，便于观察交换与缓存行为。
pub struct RamDisk {
    name: String,
    sectors: SpinLock<Vec<Sector>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// 创建一块含 `size` 个扇区、内容全零的内存盘。
    pub fn new(name: &str, size: u32) -> Self {
        Self {
            name: String::from(name),
            sectors: SpinLock::new(vec![[0; BSIZE]; size as usize], "ramdisk"),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// 累计读扇区次数
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// 累计写扇区次数
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self, sector: u32, len: usize) {
        if sector as usize >= len {
            panic!("{}: sector {} out of range {}", self.name, sector, len);
        }
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut Sector) {
        let sectors = self.sectors.lock();
        self.check(sector, sectors.len());
        buf.copy_from_slice(&sectors[sector as usize]);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&self, sector: u32, buf: &Sector) {
        let mut sectors = self.sectors.lock();
        self.check(sector, sectors.len());
        sectors[sector as usize].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_sector() {
        let disk = RamDisk::new("hdb", 4);
        let mut buf = [0u8; BSIZE];
        buf[0] = 0xaa;
        buf[BSIZE - 1] = 0x55;
        disk.write_sector(3, &buf);
        let mut out = [1u8; BSIZE];
        disk.read_sector(3, &mut out);
        assert_eq!(&out[..], &buf[..]);
        disk.read_sector(2, &mut out);
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!((disk.reads(), disk.writes()), (2, 1));
    }

    #[test]
    #[should_panic]
    fn out_of_range_sector() {
        let disk = RamDisk::new("hdb", 4);
        disk.write_sector(4, &[0; BSIZE]);
    }
}
