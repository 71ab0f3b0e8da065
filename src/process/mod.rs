//! 用户进程
//!
//! 进程由可执行文件装入，拥有自己的地址空间、打开文件表与陷阱帧。
//! 进程的用户态执行由调用者驱动：通过 [`Process::store`]/[`Process::load`] 模拟访存，
//! 通过设置陷阱帧寄存器并调用 [`Process::syscall`] 发起系统调用。

use array_macro::array;

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, warn};
use thiserror::Error;

use crate::consts::{NFILE, PHYS_BASE, STDOUT_FILENO};
use crate::fs::{File, FsError};
use crate::mm::{AddressSpace, Pid, VmError};
use crate::rmain::Kernel;

pub use syscall::{Syscall, SysResult};
pub use syscall::{
    SYS_EXIT, SYS_CREATE, SYS_REMOVE, SYS_OPEN, SYS_FILESIZE, SYS_READ, SYS_WRITE, SYS_SEEK,
    SYS_TELL, SYS_CLOSE,
};
pub use trapframe::TrapFrame;

pub mod elf;
mod syscall;
mod trapframe;

/// 系统调用与进程装入的错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// 文件描述符未打开或不能用于该操作，系统调用返回 -1
    #[error("bad file descriptor {0}")]
    BadFd(usize),
    /// 文件描述符超出范围，进程被终止
    #[error("illegal file descriptor {0}")]
    IllegalFd(usize),
    #[error("path is not a valid string")]
    BadPath,
    #[error("too many open files")]
    TooManyFiles,
    #[error("unknown syscall {0}")]
    UnknownSyscall(usize),
    #[error("cannot load executable: {0}")]
    BadExecutable(&'static str),
    #[error("file system: {0}")]
    Fs(#[from] FsError),
    /// 非法访存，进程被终止
    #[error("memory fault: {0}")]
    Fault(#[from] VmError),
}

impl SysError {
    /// 该错误是否导致进程被终止
    pub fn is_fatal(&self) -> bool {
        matches!(self, SysError::IllegalFd(_) | SysError::UnknownSyscall(_) | SysError::Fault(_))
    }
}

/// 用户进程
pub struct Process {
    pid: Pid,
    name: String,
    kernel: Arc<Kernel>,
    aspace: Arc<AddressSpace>,
    open_files: [Option<File>; NFILE],
    /// 正在执行的可执行文件，进程存活期间禁止写入
    exec_file: Option<File>,
    tf: TrapFrame,
    exit_status: Option<i32>,
}

impl Process {
    /// # 功能说明
    /// 按命令行 `cmdline` 装入一个新进程：第一个词是可执行文件路径，其余为参数。
    ///
    /// # 流程解释
    /// 1. 打开可执行文件，分配进程号与地址空间；
    /// 2. 装入 ELF 段并在用户栈上准备参数，失败则销毁地址空间；
    /// 3. 禁止写入可执行文件，直到进程退出；
    /// 4. 设置陷阱帧：入口地址、栈指针，`a0`/`a1` 为 `argc`/`argv`。
    ///
    /// # 可能的错误
    /// - [`SysError::BadExecutable`]：命令行为空或文件不是合法的可执行文件；
    /// - [`SysError::Fs`]：可执行文件不存在；
    /// - [`SysError::Fault`]：无法建立用户栈。
    pub(crate) fn start(kernel: &Arc<Kernel>, cmdline: &str) -> Result<Self, SysError> {
        let argv: Vec<&str> = cmdline.split_whitespace().collect();
        let path = *argv.first().ok_or(SysError::BadExecutable("empty command line"))?;
        let mut exe = kernel.fs().open(path)?;

        let pid = kernel.alloc_pid();
        let aspace = AddressSpace::new(pid);
        let info = match elf::load(kernel.vm(), &aspace, Arc::new(exe.reopen()), &argv) {
            Ok(info) => info,
            Err(err) => {
                warn!("process: load {} failed: {}", path, err);
                kernel.vm().destroy(&aspace);
                return Err(err)
            }
        };
        exe.deny_write();

        let name = path.rsplit('/').next().unwrap_or(path);
        let mut tf = TrapFrame::default();
        tf.epc = info.entry;
        tf.sp = info.sp;
        tf.a0 = info.argc;
        tf.a1 = info.argv;
        aspace.set_user_esp(info.sp);
        info!("process: pid {} runs {} at {:#x}", pid, name, info.entry);

        Ok(Self {
            pid,
            name: String::from(name),
            kernel: kernel.clone(),
            aspace,
            open_files: array![_ => None; NFILE],
            exec_file: Some(exe),
            tf,
            exit_status: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aspace(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    pub fn tf(&self) -> &TrapFrame {
        &self.tf
    }

    pub fn tf_mut(&mut self) -> &mut TrapFrame {
        &mut self.tf
    }

    pub fn is_alive(&self) -> bool {
        self.exit_status.is_none()
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// 以用户态身份写入 `[addr, addr + data.len())`，非法访问会终止进程。
    pub fn store(&mut self, addr: usize, data: &[u8]) -> Result<(), VmError> {
        assert!(self.is_alive(), "process: {} already exited", self.pid);
        let ret = self.kernel.vm().user_store(&self.aspace, addr, data, self.tf.sp);
        if let Err(err) = ret {
            self.kill(err);
        }
        ret
    }

    /// 以用户态身份读取 `[addr, addr + buf.len())`，非法访问会终止进程。
    pub fn load(&mut self, addr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        assert!(self.is_alive(), "process: {} already exited", self.pid);
        let ret = self.kernel.vm().user_load(&self.aspace, addr, buf, self.tf.sp);
        if let Err(err) = ret {
            self.kill(err);
        }
        ret
    }

    /// 把 `data` 压入用户栈，返回新的栈指针。
    pub fn push(&mut self, data: &[u8]) -> Result<usize, VmError> {
        let sp = self.tf.sp - data.len();
        self.tf.sp = sp;
        self.store(sp, data)?;
        Ok(sp)
    }

    /// # 功能说明
    /// 处理当前进程发起的系统调用请求。根据陷阱帧中寄存器 a7 指定的系统调用号，
    /// 调用对应的系统调用处理函数，并将返回结果写回寄存器 a0。
    ///
    /// # 流程解释
    /// 1. 记录用户栈指针，供内核代替用户访存时判断栈增长；
    /// 2. 按 `a7` 分派；
    /// 3. 成功时 `a0` 为返回值；普通错误时 `a0` 为 -1；
    ///    非法访存、非法文件描述符与未知的系统调用号会终止进程。
    pub fn syscall(&mut self) {
        assert!(self.is_alive(), "process: {} already exited", self.pid);
        self.aspace.set_user_esp(self.tf.sp);
        let a7 = self.tf.a7;
        self.tf.admit_ecall();
        let sys_result = match a7 {
            SYS_EXIT => self.sys_exit(),
            SYS_CREATE => self.sys_create(),
            SYS_REMOVE => self.sys_remove(),
            SYS_OPEN => self.sys_open(),
            SYS_FILESIZE => self.sys_filesize(),
            SYS_READ => self.sys_read(),
            SYS_WRITE => self.sys_write(),
            SYS_SEEK => self.sys_seek(),
            SYS_TELL => self.sys_tell(),
            SYS_CLOSE => self.sys_close(),
            _ => Err(SysError::UnknownSyscall(a7)),
        };

        match sys_result {
            Ok(ret) => self.tf.a0 = ret,
            Err(err) if err.is_fatal() => self.abandon(err),
            Err(_) => self.tf.a0 = -1isize as usize,
        }
    }

    /// 因非法访存终止进程
    fn kill(&mut self, err: VmError) {
        self.abandon(SysError::Fault(err))
    }

    fn abandon(&mut self, err: SysError) {
        if self.is_alive() {
            warn!("process: pid {} ({}) killed: {}", self.pid, self.name, err);
            self.exit(-1);
        }
    }

    /// # 功能说明
    /// 进程退出：打印退出信息，关闭所有打开文件与可执行文件，
    /// 销毁地址空间，并把退出状态交给 [`Kernel::wait`]。重复调用没有效果。
    pub fn exit(&mut self, status: i32) {
        if !self.is_alive() {
            return
        }
        let kernel = self.kernel.clone();
        kernel.console().puts(&format!("{}: exit({})", self.name, status));
        self.close_files();
        kernel.vm().destroy(&self.aspace);
        kernel.record_exit(self.pid, status);
        self.exit_status = Some(status);
    }

    /// 关闭进程打开的所有文件，可执行文件随之重新允许写入。
    fn close_files(&mut self) {
        let kernel = self.kernel.clone();
        let _fs = kernel.fs_lock();
        for f in self.open_files.iter_mut() {
            drop(f.take())
        }
        drop(self.exec_file.take());
    }

    /// 分配一个新的文件描述符，0 与 1 留给控制台。
    fn alloc_fd(&self) -> Option<usize> {
        self.open_files.iter()
            .enumerate()
            .skip(STDOUT_FILENO + 1)
            .find(|(_, f)| f.is_none())
            .map(|(i, _)| i)
    }

    /// 简单检查用户传入的虚拟地址是否在合法范围内。
    fn check_user_addr(&self, user_addr: usize) -> Result<(), SysError> {
        if user_addr == 0 || user_addr >= PHYS_BASE {
            Err(SysError::Fault(VmError::InvalidAccess(user_addr)))
        } else {
            Ok(())
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.exit(-1);
    }
}
