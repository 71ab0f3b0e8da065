//! 文件系统模块
//!
//! 自底向上分为空闲位图（[`freemap`]）、索引节点（[`inode`]）、目录（[`dir`]）与打开文件（[`file`]）四层，
//! [`FileSystem`] 把它们组合成按路径操作的接口。

use alloc::sync::Arc;

use log::{info, warn};

use crate::driver::BlockDevice;
use crate::consts::fs::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES};
use crate::sleeplock::SleepLock;

mod dir;
mod file;
mod freemap;
mod inode;

pub use dir::{Dir, DirEntry};
pub use file::File;
pub use freemap::FreeMap;
pub use inode::{Inode, InodeCache, DiskInode};

/// 文件系统操作可能返回的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("no free sector on the file system device")]
    NoSpace,
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    Exists,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("invalid file name")]
    InvalidName,
    #[error("file name too long")]
    NameTooLong,
    #[error("file too large")]
    FileTooLarge,
    #[error("writes to this file are denied")]
    WriteDenied,
}

/// 文件系统各层共享的状态：块设备、空闲位图与打开的 inode 注册表。
///
/// 每个 [`Inode`] 句柄都持有它的一个 `Arc`，因此只要还有打开的文件，这些状态就不会被释放。
pub struct FsCore {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) free_map: FreeMap,
    pub(crate) icache: InodeCache,
}

impl FsCore {
    fn new(dev: Arc<dyn BlockDevice>) -> Arc<Self> {
        let size = dev.size();
        Arc::new(Self {
            dev,
            free_map: FreeMap::new(size),
            icache: InodeCache::new(),
        })
    }
}

/// 按路径访问的文件系统。
///
/// 路径总是从根目录开始解析，`/a/b` 与 `a/b` 等价。
/// 修改目录内容的操作（创建、删除）彼此串行执行。
pub struct FileSystem {
    core: Arc<FsCore>,
    free_map_file: Inode,
    dir_lock: SleepLock<()>,
}

impl FileSystem {
    /// 在设备上建立一个空文件系统。
    ///
    /// # 流程解释
    /// 1. 新建空闲位图，预先占用位图文件与根目录所在的两个扇区；
    /// 2. 在 `FREE_MAP_SECTOR` 创建空闲位图文件，长度足以容纳整张位图；
    /// 3. 在 `ROOT_DIR_SECTOR` 创建根目录，并加入 `.` 与 `..` 两个指向自身的目录项；
    /// 4. 将位图写回位图文件。
    ///
    /// # 可能的错误
    /// 设备过小、放不下位图文件或根目录时返回 [`FsError::NoSpace`]。
    pub fn format(dev: Arc<dyn BlockDevice>) -> Result<Self, FsError> {
        info!("file system: formatting {} ({} sectors)", dev.name(), dev.size());
        let core = FsCore::new(dev);

        Inode::create(&core, FREE_MAP_SECTOR, core.free_map.file_size(), false)?;
        Dir::create(&core, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES)?;
        let root = Dir::open_root(&core)?;
        root.add(".", ROOT_DIR_SECTOR)?;
        root.add("..", ROOT_DIR_SECTOR)?;
        drop(root);

        let fs = Self {
            free_map_file: Inode::open(&core, FREE_MAP_SECTOR),
            core,
            dir_lock: SleepLock::new((), "dir"),
        };
        fs.sync()?;
        info!("file system: format done");
        Ok(fs)
    }

    /// 挂载一个已格式化的设备，从位图文件读回空闲位图。
    pub fn mount(dev: Arc<dyn BlockDevice>) -> Self {
        info!("file system: mounting {}", dev.name());
        let core = FsCore::new(dev);
        let free_map_file = Inode::open(&core, FREE_MAP_SECTOR);
        core.free_map.load(&free_map_file);

        #[cfg(feature = "verbose_init_info")]
        info!("file system: {} of {} sectors in use",
            core.free_map.allocated(), core.dev.size());

        Self {
            core,
            free_map_file,
            dir_lock: SleepLock::new((), "dir"),
        }
    }

    /// 在 `path` 创建一个初始长度为 `initial_size` 字节的普通文件。
    ///
    /// # 流程解释
    /// 1. 解析父目录与文件名；
    /// 2. 为 inode 分配一个扇区，再由 [`Inode::create`] 分配并清零数据扇区；
    /// 3. 将新目录项加入父目录。
    ///
    /// 任何一步失败都会归还此前占用的全部扇区。
    pub fn create(&self, path: &str, initial_size: usize) -> Result<(), FsError> {
        let _guard = self.dir_lock.lock();
        let (parent, name) = dir::resolve_parent(&self.core, path)?;
        if parent.lookup(name).is_some() {
            return Err(FsError::Exists)
        }
        let sector = self.alloc_inode_sector()?;
        if let Err(err) = Inode::create(&self.core, sector, initial_size, false) {
            self.core.free_map.release(sector, 1);
            return Err(err)
        }
        self.link_or_discard(&parent, name, sector)
    }

    /// 在 `path` 创建一个空目录，其中只有 `.` 与 `..`。
    pub fn create_dir(&self, path: &str) -> Result<(), FsError> {
        let _guard = self.dir_lock.lock();
        let (parent, name) = dir::resolve_parent(&self.core, path)?;
        if parent.lookup(name).is_some() {
            return Err(FsError::Exists)
        }
        let sector = self.alloc_inode_sector()?;
        if let Err(err) = Dir::create(&self.core, sector, 2) {
            self.core.free_map.release(sector, 1);
            return Err(err)
        }
        let populate = Dir::open(Inode::open(&self.core, sector)).and_then(|dir| {
            dir.add(".", sector)?;
            dir.add("..", parent.inode().sector())
        });
        if let Err(err) = populate {
            discard(&self.core, sector);
            return Err(err)
        }
        self.link_or_discard(&parent, name, sector)
    }

    /// 打开 `path` 处的文件（目录也可以作为文件打开）。
    pub fn open(&self, path: &str) -> Result<File, FsError> {
        let inode = dir::resolve(&self.core, path)?;
        Ok(File::open(inode))
    }

    /// 打开 `path` 处的目录。
    pub fn open_dir(&self, path: &str) -> Result<Dir, FsError> {
        let inode = dir::resolve(&self.core, path)?;
        Dir::open(inode)
    }

    /// 删除 `path` 处的文件或空目录。
    ///
    /// 已打开的句柄仍然可以继续读写，扇区在最后一个句柄关闭时归还。
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        let _guard = self.dir_lock.lock();
        let (parent, name) = dir::resolve_parent(&self.core, path)?;
        parent.remove(name)
    }

    /// 将空闲位图写回磁盘。
    pub fn sync(&self) -> Result<(), FsError> {
        self.core.free_map.store(&self.free_map_file)
    }

    /// 关闭文件系统，写回尚未持久化的状态。
    pub fn shutdown(self) -> Result<(), FsError> {
        self.sync()?;
        info!("file system: shutdown, {} sectors in use", self.core.free_map.allocated());
        Ok(())
    }

    /// 空闲位图中已占用的扇区数。
    pub fn allocated_sectors(&self) -> usize {
        self.core.free_map.allocated()
    }

    /// 当前在内存中打开的 inode 数量。
    pub fn open_inodes(&self) -> usize {
        self.core.icache.len()
    }

    /// 按扇区号打开 inode。
    pub fn open_inode(&self, sector: u32) -> Inode {
        Inode::open(&self.core, sector)
    }

    fn alloc_inode_sector(&self) -> Result<u32, FsError> {
        self.core.free_map.allocate(1).ok_or_else(|| {
            warn!("file system: no sector left for a new inode");
            FsError::NoSpace
        })
    }

    /// 将已建好的 inode 加入父目录，失败时回收它的全部扇区。
    fn link_or_discard(&self, parent: &Dir, name: &str, sector: u32) -> Result<(), FsError> {
        match parent.add(name, sector) {
            Ok(()) => Ok(()),
            Err(err) => {
                discard(&self.core, sector);
                Err(err)
            }
        }
    }
}

/// 丢弃一个尚未链接进任何目录的 inode。
fn discard(core: &Arc<FsCore>, sector: u32) {
    let inode = Inode::open(core, sector);
    inode.remove();
}
