//! 类 xv6 内核的存储与虚拟内存子系统
//!
//! 文件系统（[`fs`]）提供可扩展文件与目录，虚拟内存（[`mm`]）负责惰性装入、
//! 栈增长、页帧淘汰与交换，[`process`] 在两者之上实现用户进程与系统调用。

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

pub mod bitmap;
pub mod consts;
pub mod driver;
pub mod fs;
pub mod mm;
pub mod process;
pub mod rmain;
pub mod sleeplock;
pub mod spinlock;

pub use rmain::{Kernel, KernelConfig};
