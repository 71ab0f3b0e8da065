//! 文件系统磁盘布局常量

use core::mem;

use super::PGSIZE;

/// 扇区大小（字节）
pub const BSIZE: usize = 512;

/// 磁盘 inode 中直接块的数量
pub const NDIRECT: usize = 120;

/// 一个索引块可容纳的扇区号数量
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();

/// 二级间接块可寻址的数据扇区数量
pub const NDINDIRECT: usize = NINDIRECT * NINDIRECT;

/// 单个文件最多可占用的数据扇区数量
pub const MAX_FILE_SECTORS: usize = NDIRECT + NINDIRECT + NDINDIRECT;

/// 单个文件的最大长度（字节）
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * BSIZE;

/// 磁盘 inode 的魔数，用于检测损坏
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// 空闲位图文件的 inode 所在扇区
pub const FREE_MAP_SECTOR: u32 = 0;

/// 根目录 inode 所在扇区
pub const ROOT_DIR_SECTOR: u32 = 1;

/// 目录项名称的最大长度（不含结尾的 0）
pub const MAX_DIR_SIZE: usize = 14;

/// 格式化时根目录预留的目录项数量
pub const ROOT_DIR_ENTRIES: usize = 16;

/// 一个页对应的扇区数，即一个交换槽的大小
pub const SECTORS_PER_PAGE: usize = PGSIZE / BSIZE;
