//! 内核常量：分页、用户地址空间与进程相关参数

pub mod fs;

/// 页内偏移位数
pub const PGSHIFT: usize = 12;

/// 页大小（字节）
pub const PGSIZE: usize = 1 << PGSHIFT;

/// 每级页表索引的位数（Sv39）
pub const PGMASKLEN: usize = 9;

/// 每级页表索引掩码
pub const PGMASK: usize = 0x1FF;

/// 页表项中标志位所占位数
pub const SV39FLAGLEN: usize = 10;

/// Sv39 可寻址的最大虚拟地址（不含）
pub const MAXVA: usize = 1 << (PGMASKLEN * 3 + PGSHIFT - 1);

/// 用户虚拟地址空间的上界（不含），用户栈自此向下增长。
pub const PHYS_BASE: usize = 0xC000_0000;

/// 用户栈允许增长到的最大尺寸。
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// 栈增长启发式：访问地址不得低于栈指针超过该字节数（`PUSHA` 一次压入 32 字节）。
pub const STACK_HEURISTIC: usize = 32;

/// 用户页池中第一个物理页帧的（模拟）物理地址。
pub const USER_POOL_BASE: usize = 0x8800_0000;

/// 默认的用户物理页帧数量
pub const NUSERFRAMES: usize = 64;

/// 每个进程可同时打开的文件数
pub const NFILE: usize = 128;

/// 路径的最大长度（含结尾的 0）
pub const MAXPATH: usize = 128;

/// 标准输入的文件描述符
pub const STDIN_FILENO: usize = 0;

/// 标准输出的文件描述符
pub const STDOUT_FILENO: usize = 1;

/// 命令行参数的最大个数
pub const MAXARG: usize = 32;
