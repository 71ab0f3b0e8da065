//! 设备驱动模块，包含块设备抽象、内存盘与控制台

use crate::consts::fs::BSIZE;

pub mod console;
pub mod ramdisk;

pub use console::Console;
pub use ramdisk::RamDisk;

/// 一个扇区的原始内容
pub type Sector = [u8; BSIZE];

/// 以扇区为单位读写的块设备。
///
/// 所有实现都必须可以被多个线程同时调用。
/// 访问超出 [`BlockDevice::size`] 的扇区属于内核错误，实现应当 panic。
pub trait BlockDevice: Send + Sync {
    /// 设备名称，用于日志。
    fn name(&self) -> &str;

    /// 设备扇区总数。
    fn size(&self) -> u32;

    /// 将扇区 `sector` 读入 `buf`。
    fn read_sector(&self, sector: u32, buf: &mut Sector);

    /// 将 `buf` 写入扇区 `sector`。
    fn write_sector(&self, sector: u32, buf: &Sector);
}
