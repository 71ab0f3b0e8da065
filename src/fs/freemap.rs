//! 空闲扇区位图

use alloc::vec;

use log::debug;

use crate::bitmap::Bitmap;
use crate::consts::fs::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::spinlock::SpinLock;

use super::{FsError, Inode};

/// 文件系统设备上每个扇区一位的占用表，置位表示已分配。
///
/// 位图本身保存在 `FREE_MAP_SECTOR` 处的普通文件中，格式化与关机时写回，挂载时读出。
/// 分配与释放只修改内存中的位图。
pub struct FreeMap {
    map: SpinLock<Bitmap>,
}

impl FreeMap {
    /// 为含 `sectors` 个扇区的设备新建位图，位图文件与根目录的 inode 扇区预先标记为已用。
    pub fn new(sectors: u32) -> Self {
        let mut map = Bitmap::new(sectors as usize);
        map.set(FREE_MAP_SECTOR as usize, true);
        map.set(ROOT_DIR_SECTOR as usize, true);
        Self { map: SpinLock::new(map, "free_map") }
    }

    /// 分配 `cnt` 个连续扇区，返回第一个扇区号。
    ///
    /// # 返回值
    /// 找不到足够长的连续空闲段时返回 `None`，位图保持不变。
    pub fn allocate(&self, cnt: usize) -> Option<u32> {
        let start = self.map.lock().scan_and_flip(cnt, false)?;
        Some(start as u32)
    }

    /// 释放从 `sector` 开始的 `cnt` 个扇区。
    ///
    /// # 可能的错误
    /// 其中任何一个扇区原本就是空闲的，说明发生了重复释放，触发 panic。
    pub fn release(&self, sector: u32, cnt: usize) {
        let mut map = self.map.lock();
        if !map.all(sector as usize, cnt, true) {
            panic!("free map: double freeing sector {}", sector);
        }
        map.set_multiple(sector as usize, cnt, false);
    }

    /// 扇区是否已被占用
    pub fn is_allocated(&self, sector: u32) -> bool {
        self.map.lock().test(sector as usize)
    }

    /// 已占用的扇区总数
    pub fn allocated(&self) -> usize {
        let map = self.map.lock();
        map.count(0, map.len(), true)
    }

    /// 位图文件的长度（字节）
    pub fn file_size(&self) -> usize {
        Bitmap::byte_size(self.map.lock().len())
    }

    /// 从位图文件读回位图。
    ///
    /// # 可能的错误
    /// 位图文件比位图短时 panic，说明磁盘与设备大小不符。
    pub fn load(&self, file: &Inode) {
        let len = self.map.lock().len();
        let mut bytes = vec![0u8; Bitmap::byte_size(len)];
        let read = file.read_at(&mut bytes, 0);
        if read != bytes.len() {
            panic!("free map: short read {} of {} bytes", read, bytes.len());
        }
        *self.map.lock() = Bitmap::from_bytes(len, &bytes);
        debug!("free map: loaded {} bytes", read);
    }

    /// 将位图写回位图文件。
    ///
    /// 位图文件的长度在格式化时已经确定，写回不会再分配扇区。
    pub fn store(&self, file: &Inode) -> Result<(), FsError> {
        let bytes = self.map.lock().as_bytes().to_vec();
        file.write_at(&bytes, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_sectors_and_release() {
        let fm = FreeMap::new(16);
        assert!(fm.is_allocated(FREE_MAP_SECTOR));
        assert!(fm.is_allocated(ROOT_DIR_SECTOR));
        assert_eq!(fm.allocate(3), Some(2));
        assert_eq!(fm.allocated(), 5);
        fm.release(3, 1);
        assert_eq!(fm.allocate(1), Some(3));
        assert_eq!(fm.allocate(20), None);
        assert_eq!(fm.allocated(), 5);
    }

    #[test]
    #[should_panic(expected = "double freeing")]
    fn double_free_panics() {
        let fm = FreeMap::new(8);
        let s = fm.allocate(1).unwrap();
        fm.release(s, 1);
        fm.release(s, 1);
    }
}
