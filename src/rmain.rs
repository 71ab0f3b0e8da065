//! 内核主入口，按启动配置建立文件系统与虚拟内存子系统并装入用户进程。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::info;

use crate::consts::{NUSERFRAMES, STACK_LIMIT};
use crate::driver::{BlockDevice, Console};
use crate::fs::{FileSystem, FsError};
use crate::mm::{Pid, Vm, VmConfig};
use crate::process::{Process, SysError};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// 启动参数
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// 启动时重新格式化文件系统设备，否则挂载已有的文件系统
    pub format: bool,
    /// 用户页帧池中的页帧数量
    pub user_frames: usize,
    /// 用户栈允许增长到的最大字节数
    pub stack_limit: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { format: true, user_frames: NUSERFRAMES, stack_limit: STACK_LIMIT }
    }
}

impl KernelConfig {
    /// 虚拟内存子系统关心的部分
    pub fn vm(&self) -> VmConfig {
        VmConfig { user_frames: self.user_frames, stack_limit: self.stack_limit }
    }
}

/// 内核：持有文件系统、虚拟内存子系统与控制台，启动一次，关机时销毁。
pub struct Kernel {
    fs: FileSystem,
    vm: Vm,
    console: Console,
    /// 系统调用访问文件系统时持有
    fs_lock: SleepLock<()>,
    next_pid: AtomicUsize,
    /// 已退出但尚未被等待的进程的退出状态
    exits: SpinLock<BTreeMap<Pid, i32>>,
}

impl Kernel {
    /// # 功能说明
    /// 启动内核：按配置格式化或挂载文件系统设备，建立用户页帧池与交换区。
    ///
    /// # 参数
    /// - `config`：启动参数；
    /// - `fs_dev`：文件系统设备；
    /// - `swap_dev`：交换设备。
    ///
    /// # 可能的错误
    /// 格式化时设备过小返回 [`FsError::NoSpace`]。
    pub fn boot(
        config: KernelConfig,
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
    ) -> Result<Arc<Self>, FsError> {
        info!("kernel is booting");

        #[cfg(feature = "verbose_init_info")]
        info!("kernel: {:?}, file system on {}, swap on {}", config, fs_dev.name(), swap_dev.name());

        let fs = if config.format {
            FileSystem::format(fs_dev)?
        } else {
            FileSystem::mount(fs_dev)
        };
        let vm = Vm::new(config.vm(), swap_dev);
        info!("kernel: {} user frames, {} swap slots", vm.frames().capacity(), vm.swap().capacity());

        Ok(Arc::new(Self {
            fs,
            vm,
            console: Console::new(),
            fs_lock: SleepLock::new((), "filesys"),
            next_pid: AtomicUsize::new(1),
            exits: SpinLock::new(BTreeMap::new(), "exits"),
        }))
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// 按命令行装入一个新进程，第一个词是可执行文件路径。
    pub fn execute(self: &Arc<Self>, cmdline: &str) -> Result<Process, SysError> {
        Process::start(self, cmdline)
    }

    /// 取走进程 `pid` 的退出状态。进程尚未退出或状态已被取走时返回 `None`。
    pub fn wait(&self, pid: Pid) -> Option<i32> {
        self.exits.lock().remove(&pid)
    }

    /// # 功能说明
    /// 关机，把空闲位图写回磁盘。
    ///
    /// 这是最后一个引用时文件系统随内核一同关闭，否则只做同步。
    pub fn shutdown(self: Arc<Self>) -> Result<(), FsError> {
        info!("kernel: shutting down");
        match Arc::try_unwrap(self) {
            Ok(kernel) => kernel.fs.shutdown(),
            Err(kernel) => kernel.fs.sync(),
        }
    }

    pub(crate) fn fs_lock(&self) -> SleepLockGuard<'_, ()> {
        self.fs_lock.lock()
    }

    pub(crate) fn alloc_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_exit(&self, pid: Pid, status: i32) {
        self.exits.lock().insert(pid, status);
    }
}
