//! 所有系统调用接口实现

use alloc::string::String;
use alloc::vec;
use core::cmp::min;

use crate::consts::{MAXPATH, NFILE, PGSIZE, STDIN_FILENO, STDOUT_FILENO};
use crate::fs::{File, FsError};

use super::{Process, SysError};

/// 系统调用结果类型
pub type SysResult = Result<usize, SysError>;

pub const SYS_EXIT: usize = 1;
pub const SYS_CREATE: usize = 4;
pub const SYS_REMOVE: usize = 5;
pub const SYS_OPEN: usize = 6;
pub const SYS_FILESIZE: usize = 7;
pub const SYS_READ: usize = 8;
pub const SYS_WRITE: usize = 9;
pub const SYS_SEEK: usize = 10;
pub const SYS_TELL: usize = 11;
pub const SYS_CLOSE: usize = 12;

/// 系统调用 trait 定义
///
/// 包含所有支持的系统调用方法，由 `Process` 实现具体功能。
pub trait Syscall {
    fn sys_exit(&mut self) -> SysResult;
    fn sys_create(&mut self) -> SysResult;
    fn sys_remove(&mut self) -> SysResult;
    fn sys_open(&mut self) -> SysResult;
    fn sys_filesize(&mut self) -> SysResult;
    fn sys_read(&mut self) -> SysResult;
    fn sys_write(&mut self) -> SysResult;
    fn sys_seek(&mut self) -> SysResult;
    fn sys_tell(&mut self) -> SysResult;
    fn sys_close(&mut self) -> SysResult;
}

impl Syscall for Process {
    /// 终止当前进程
    ///
    /// # 功能说明
    /// 以第一个参数为退出状态结束进程，打印 `name: exit(status)` 并释放所有资源。
    fn sys_exit(&mut self) -> SysResult {
        let exit_status = self.arg_i32(0);

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].exit(status={})", self.pid, exit_status);

        self.exit(exit_status);
        Ok(exit_status as isize as usize)
    }

    /// 创建文件
    ///
    /// # 参数
    /// - `path`: 用户空间中的路径字符串
    /// - `initial_size`: 文件初始长度
    ///
    /// # 返回值
    /// 成功返回 1，文件已存在、路径非法或空间不足返回 0。
    fn sys_create(&mut self) -> SysResult {
        let path = match self.arg_str(0) {
            Ok(path) => path,
            Err(SysError::BadPath) => return Ok(0),
            Err(err) => return Err(err),
        };
        let initial_size = self.arg_raw(1);
        let ret = {
            let _fs = self.kernel.fs_lock();
            self.kernel.fs().create(&path, initial_size)
        };

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].create(path={}, size={}) = {:?}", self.pid, path, initial_size, ret);

        Ok(ret.is_ok() as usize)
    }

    /// 删除文件
    ///
    /// 已打开的文件仍然可以继续读写，直到最后一次关闭后才真正释放。
    fn sys_remove(&mut self) -> SysResult {
        let path = match self.arg_str(0) {
            Ok(path) => path,
            Err(SysError::BadPath) => return Ok(0),
            Err(err) => return Err(err),
        };
        let ret = {
            let _fs = self.kernel.fs_lock();
            self.kernel.fs().remove(&path)
        };

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].remove(path={}) = {:?}", self.pid, path, ret);

        Ok(ret.is_ok() as usize)
    }

    /// 打开文件
    ///
    /// # 返回值
    /// - 成功：返回新分配的文件描述符，最小为 2
    /// - 错误：文件不存在、路径非法或描述符耗尽时返回 -1
    fn sys_open(&mut self) -> SysResult {
        let path = self.arg_str(0)?;
        let fd = self.alloc_fd().ok_or(SysError::TooManyFiles)?;
        let file = {
            let _fs = self.kernel.fs_lock();
            self.kernel.fs().open(&path)
        };

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].open(path={}) = {:?}", self.pid, path, file.as_ref().map(|_| fd));

        self.open_files[fd] = Some(file?);
        Ok(fd)
    }

    fn sys_filesize(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let kernel = self.kernel.clone();
        let _fs = kernel.fs_lock();
        Ok(self.file_mut(fd)?.length())
    }

    /// 从文件描述符读取数据
    ///
    /// # 功能说明
    /// 从指定文件描述符读取数据到用户空间缓冲区。描述符 0 从控制台读取。
    ///
    /// # 参数
    /// - `fd`: 文件描述符
    /// - `user_addr`: 用户空间缓冲区地址
    /// - `count`: 要读取的字节数
    ///
    /// # 返回值
    /// 实际读取的字节数，到达文件末尾时可能少于 `count`。
    ///
    /// # 流程
    /// 以页为单位在内核缓冲区中转：持有文件系统锁读文件，释放后再复制到用户空间，
    /// 复制时可能发生缺页并从文件系统读入页面。
    fn sys_read(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_raw(2);
        self.check_user_addr(user_addr)?;
        let kernel = self.kernel.clone();

        let mut kbuf = vec![0u8; min(count, PGSIZE)];
        let mut done = 0;
        while done < count {
            let n = min(PGSIZE, count - done);
            let read = if fd == STDIN_FILENO {
                kernel.console().read(&mut kbuf[..n])
            } else {
                let _fs = kernel.fs_lock();
                self.file_mut(fd)?.read(&mut kbuf[..n])
            };
            kernel.vm().copy_out(&self.aspace, user_addr + done, &kbuf[..read])?;
            done += read;
            if read < n {
                break
            }
        }

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].read(fd={}, addr={:#x}, count={}) = {}", self.pid, fd, user_addr, count, done);

        Ok(done)
    }

    /// 向文件描述符写入数据
    ///
    /// # 功能说明
    /// 把用户缓冲区的内容写入文件，描述符 1 写到控制台。
    /// 写入被禁止的文件（正在执行的可执行文件）时写入 0 字节。
    ///
    /// # 返回值
    /// 实际写入的字节数。
    fn sys_write(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let user_addr = self.arg_addr(1);
        let count = self.arg_raw(2);
        self.check_user_addr(user_addr)?;
        let kernel = self.kernel.clone();

        let mut kbuf = vec![0u8; min(count, PGSIZE)];
        let mut done = 0;
        while done < count {
            let n = min(PGSIZE, count - done);
            kernel.vm().copy_in(&self.aspace, &mut kbuf[..n], user_addr + done)?;
            let written = if fd == STDOUT_FILENO {
                kernel.console().write(&kbuf[..n])
            } else {
                let _fs = kernel.fs_lock();
                match self.file_mut(fd)?.write(&kbuf[..n]) {
                    Ok(written) => written,
                    Err(FsError::WriteDenied) => 0,
                    Err(_) if done > 0 => 0,
                    Err(err) => return Err(err.into()),
                }
            };
            done += written;
            if written < n {
                break
            }
        }

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].write(fd={}, addr={:#x}, count={}) = {}", self.pid, fd, user_addr, count, done);

        Ok(done)
    }

    /// 移动文件读写位置，允许越过文件末尾。
    fn sys_seek(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let pos = self.arg_raw(1);
        let kernel = self.kernel.clone();
        let _fs = kernel.fs_lock();
        self.file_mut(fd)?.seek(pos);
        Ok(0)
    }

    fn sys_tell(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let kernel = self.kernel.clone();
        let _fs = kernel.fs_lock();
        Ok(self.file_mut(fd)?.tell())
    }

    /// 关闭文件描述符
    fn sys_close(&mut self) -> SysResult {
        let fd = self.arg_fd(0)?;
        let kernel = self.kernel.clone();
        let _fs = kernel.fs_lock();
        let file = if fd > STDOUT_FILENO { self.open_files[fd].take() } else { None };

        #[cfg(feature = "trace_syscall")]
        log::trace!("[{}].close(fd={}) = {}", self.pid, fd, file.is_some());

        file.map(|_| 0).ok_or(SysError::BadFd(fd))
    }
}

impl Process {
    /// 获取第 n 个系统调用参数的原始值
    #[inline]
    fn arg_raw(&self, n: usize) -> usize {
        match n {
            0 => self.tf.a0,
            1 => self.tf.a1,
            2 => self.tf.a2,
            3 => self.tf.a3,
            4 => self.tf.a4,
            5 => self.tf.a5,
            _ => panic!("n is larger than 5"),
        }
    }

    #[inline]
    fn arg_i32(&self, n: usize) -> i32 {
        self.arg_raw(n) as i32
    }

    #[inline]
    fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }

    /// 获取文件描述符参数，超出描述符表范围的值会终止进程。
    #[inline]
    fn arg_fd(&self, n: usize) -> Result<usize, SysError> {
        let fd = self.arg_raw(n);
        if fd >= NFILE {
            Err(SysError::IllegalFd(fd))
        } else {
            Ok(fd)
        }
    }

    /// 获取字符串参数，长度不得超过 [`MAXPATH`]。
    fn arg_str(&self, n: usize) -> Result<String, SysError> {
        let addr = self.arg_addr(n);
        self.check_user_addr(addr)?;
        let bytes = self.kernel.vm()
            .copy_in_str(&self.aspace, addr, MAXPATH)?
            .ok_or(SysError::BadPath)?;
        String::from_utf8(bytes).map_err(|_| SysError::BadPath)
    }

    /// 取得已打开的普通文件，控制台描述符与未打开的描述符都返回 [`SysError::BadFd`]。
    fn file_mut(&mut self, fd: usize) -> Result<&mut File, SysError> {
        if fd <= STDOUT_FILENO {
            return Err(SysError::BadFd(fd))
        }
        self.open_files[fd].as_mut().ok_or(SysError::BadFd(fd))
    }
}
