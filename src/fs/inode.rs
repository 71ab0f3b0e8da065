//! 索引节点层
//!
//! 每个 inode 占据一个扇区，数据扇区分三级索引：
//! - 前 `NDIRECT` 个扇区号直接记录在磁盘 inode 中；
//! - 接下来 `NINDIRECT` 个扇区号记录在一级间接索引块中；
//! - 其余扇区号记录在二级间接索引块所指向的一组一级索引块中。
//!
//! 索引块本身也恰好占一个扇区，按需读入并缓存在打开的 inode 中。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::{cmp::min, mem, ptr};

use log::{debug, warn};

use crate::consts::fs::{BSIZE, NDIRECT, NINDIRECT, MAX_FILE_SECTORS, MAX_FILE_SIZE, INODE_MAGIC};
use crate::driver::{BlockDevice, Sector};
use crate::spinlock::SpinLock;
use crate::sleeplock::{SleepLock, SleepLockGuard};

use super::{FsCore, FsError};

/// 打开的 inode 注册表，保证每个扇区在内存中至多只有一个 inode 实例。
///
/// # 结构体用途
/// 以 inode 所在扇区号为键，记录引用计数、删除标志与禁止写计数；
/// 实际的 inode 内容放在共享的 [`InodeInner`] 中，由各自的睡眠锁保护。
/// 引用计数降为 0 时条目被移除，下次打开时重新从磁盘读入。
pub struct InodeCache {
    meta: SpinLock<BTreeMap<u32, InodeMeta>>,
}

impl InodeCache {
    pub const fn new() -> Self {
        Self { meta: SpinLock::new(BTreeMap::new(), "inode_meta") }
    }

    /// 查找扇区 `sector` 对应的 inode，没有则新建一个尚未加载的实例，并增加引用计数。
    fn get(&self, sector: u32) -> Arc<InodeInner> {
        let mut guard = self.meta.lock();
        let meta = guard.entry(sector).or_insert_with(|| InodeMeta {
            inner: Arc::new(InodeInner {
                sector,
                data: SleepLock::new(InodeData::empty(), "inode_data"),
            }),
            refs: 0,
            removed: false,
            deny_write: 0,
        });
        meta.refs += 1;
        Arc::clone(&meta.inner)
    }

    fn dup(&self, sector: u32) {
        let mut guard = self.meta.lock();
        let meta = self.entry(&mut guard, sector);
        meta.refs += 1;
    }

    /// 减少引用计数。
    ///
    /// # 返回值
    /// 若这是最后一个引用且 inode 已被删除，返回它的共享实例，由调用者归还扇区。
    fn put(&self, sector: u32) -> Option<Arc<InodeInner>> {
        let mut guard = self.meta.lock();
        let meta = self.entry(&mut guard, sector);
        meta.refs -= 1;
        if meta.refs > 0 {
            return None
        }
        let meta = guard.remove(&sector)?;
        if meta.removed {
            Some(meta.inner)
        } else {
            None
        }
    }

    /// 当前打开的 inode 数量
    pub fn len(&self) -> usize {
        self.meta.lock().len()
    }

    fn entry<'a>(&self, guard: &'a mut BTreeMap<u32, InodeMeta>, sector: u32) -> &'a mut InodeMeta {
        match guard.get_mut(&sector) {
            Some(meta) => meta,
            None => panic!("inode: sector {} is not open", sector),
        }
    }
}

/// 注册表中每个打开 inode 的元信息。
struct InodeMeta {
    inner: Arc<InodeInner>,
    /// 打开计数
    refs: usize,
    /// 已从目录中删除，最后一次关闭时归还全部扇区
    removed: bool,
    /// 禁止写计数，不超过 `refs`
    deny_write: usize,
}

/// 同一扇区的所有 [`Inode`] 句柄共享的实例。
struct InodeInner {
    sector: u32,
    data: SleepLock<InodeData>,
}

impl InodeInner {
    /// 加锁 inode 内容，首次访问时从磁盘读入。
    ///
    /// # 可能的错误
    /// 磁盘上的魔数不符说明该扇区不是 inode，触发 panic。
    fn lock(&self, dev: &dyn BlockDevice) -> SleepLockGuard<'_, InodeData> {
        let mut guard = self.data.lock();
        if !guard.valid {
            let mut buf = [0u8; BSIZE];
            dev.read_sector(self.sector, &mut buf);
            let disk = DiskInode::decode(&buf);
            if disk.magic != INODE_MAGIC {
                panic!("inode: bad magic {:#x} in sector {}", disk.magic, self.sector);
            }
            guard.disk = disk;
            guard.valid = true;
        }
        guard
    }
}

/// 内核中打开的 inode 句柄。
///
/// 克隆句柄等同于再打开一次，丢弃句柄等同于关闭一次；
/// 关闭已删除 inode 的最后一个句柄时，它占用的全部扇区连同 inode 扇区本身都归还给空闲位图。
pub struct Inode {
    core: Arc<FsCore>,
    inner: Arc<InodeInner>,
}

impl Inode {
    /// 在扇区 `sector` 上初始化一个长度为 `length` 字节的 inode，并分配、清零所需的数据扇区。
    ///
    /// # 流程解释
    /// 1. 在内存中构造一个新的磁盘 inode；
    /// 2. 按直接块、一级间接、二级间接的顺序分配覆盖 `length` 的扇区；
    /// 3. 写回索引块与 inode 扇区。
    ///
    /// # 可能的错误
    /// - 空闲扇区不足时返回 [`FsError::NoSpace`]，已分配的扇区全部归还；
    /// - `length` 超过最大文件长度时返回 [`FsError::FileTooLarge`]。
    ///
    /// `sector` 本身由调用者分配与回收。
    pub fn create(core: &FsCore, sector: u32, length: usize, is_dir: bool) -> Result<(), FsError> {
        if length > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge)
        }
        let mut data = InodeData::fresh(is_dir);
        data.grow(core, bytes_to_sectors(length))?;
        data.disk.length = length as u32;
        data.write_back(&*core.dev, sector);
        debug!("inode: created sector {} length {} dir {}", sector, length, is_dir);
        Ok(())
    }

    /// 打开扇区 `sector` 处的 inode，内容在首次访问时才读入。
    pub fn open(core: &Arc<FsCore>, sector: u32) -> Self {
        Self {
            core: Arc::clone(core),
            inner: core.icache.get(sector),
        }
    }

    /// inode 所在扇区，同时也是它的编号。
    pub fn sector(&self) -> u32 {
        self.inner.sector
    }

    pub(super) fn core(&self) -> &Arc<FsCore> {
        &self.core
    }

    /// 两个句柄是否指向同一个内存实例
    pub fn same(&self, other: &Inode) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn length(&self) -> usize {
        self.lock().disk.length as usize
    }

    pub fn is_dir(&self) -> bool {
        self.lock().disk.is_dir != 0
    }

    /// 当前打开计数
    pub fn open_count(&self) -> usize {
        let mut guard = self.core.icache.meta.lock();
        self.core.icache.entry(&mut guard, self.sector()).refs
    }

    /// 标记删除，扇区在最后一个句柄关闭时归还。
    pub fn remove(&self) {
        let mut guard = self.core.icache.meta.lock();
        self.core.icache.entry(&mut guard, self.sector()).removed = true;
    }

    pub fn is_removed(&self) -> bool {
        let mut guard = self.core.icache.meta.lock();
        self.core.icache.entry(&mut guard, self.sector()).removed
    }

    /// 禁止对该 inode 写入，可以叠加多次，每次都要以一次 [`Inode::allow_write`] 抵消。
    ///
    /// # 可能的错误
    /// 每个打开者至多禁止一次，计数超过打开计数时 panic。
    pub fn deny_write(&self) {
        let mut guard = self.core.icache.meta.lock();
        let meta = self.core.icache.entry(&mut guard, self.sector());
        meta.deny_write += 1;
        assert!(meta.deny_write <= meta.refs, "inode: deny_write exceeds open count");
    }

    /// 抵消一次 [`Inode::deny_write`]。
    pub fn allow_write(&self) {
        let mut guard = self.core.icache.meta.lock();
        let meta = self.core.icache.entry(&mut guard, self.sector());
        assert!(meta.deny_write > 0, "inode: allow_write without deny_write");
        meta.deny_write -= 1;
    }

    pub fn write_denied(&self) -> bool {
        let mut guard = self.core.icache.meta.lock();
        self.core.icache.entry(&mut guard, self.sector()).deny_write > 0
    }

    /// 该 inode 占用的扇区总数：数据扇区、索引块与 inode 扇区本身。
    pub fn allocated_sectors(&self) -> usize {
        self.lock().allocated_sectors()
    }

    /// 从 `offset` 开始读取至多 `buf.len()` 字节。
    ///
    /// # 流程解释
    /// 逐扇区循环：先在 inode 锁内把当前位置换算成扇区号，再在锁外读盘。
    /// 整扇区对齐的部分直接读入 `buf`，其余部分经过一个扇区大小的中转缓冲区。
    ///
    /// # 返回值
    /// 实际读取的字节数；到达文件末尾时少于请求值，`offset` 不小于文件长度时为 0。
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let dev = &*self.core.dev;
        let mut read = 0;
        while read < buf.len() {
            let pos = offset + read;
            let (sector, file_left) = {
                let mut data = self.inner.lock(dev);
                match data.byte_to_sector(dev, pos) {
                    Some(sector) => (sector, data.disk.length as usize - pos),
                    None => break,
                }
            };
            let sector_ofs = pos % BSIZE;
            let chunk = min(min(buf.len() - read, BSIZE - sector_ofs), file_left);

            match <&mut Sector>::try_from(&mut buf[read..read + chunk]) {
                Ok(full) => dev.read_sector(sector, full),
                Err(_) => {
                    let mut bounce = [0u8; BSIZE];
                    dev.read_sector(sector, &mut bounce);
                    buf[read..read + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
                }
            }
            read += chunk;
        }
        read
    }

    /// 从 `offset` 开始写入 `buf`，必要时扩展文件。
    ///
    /// # 流程解释
    /// 1. 写入被禁止时直接返回错误；
    /// 2. 写入末尾超过当前长度时，在 inode 锁内分配恰好所缺的扇区（新扇区全部清零），
    ///    并持锁完成整次写入，写完后才更新长度并写回 inode；
    /// 3. 不扩展文件的写入只在换算扇区号时短暂持锁；
    /// 4. 不足一个扇区的部分先读出原扇区，修改后再写回。
    ///
    /// # 可能的错误
    /// - [`FsError::WriteDenied`]：有打开者禁止了写入；
    /// - [`FsError::FileTooLarge`]：写入末尾超过最大文件长度；
    /// - [`FsError::NoSpace`]：扩展时空闲扇区不足，文件保持原样。
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        if self.write_denied() {
            return Err(FsError::WriteDenied)
        }
        if buf.is_empty() {
            return Ok(0)
        }
        let end = offset
            .checked_add(buf.len())
            .filter(|&end| end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge)?;

        let dev = &*self.core.dev;
        let mut data = self.inner.lock(dev);
        let extending = end > data.disk.length as usize;
        if extending {
            data.grow(&self.core, bytes_to_sectors(end))?;
        }
        let mut held = if extending { Some(data) } else { drop(data); None };

        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written;
            let sector = match held.as_mut() {
                Some(data) => data.locate(dev, pos),
                None => match self.inner.lock(dev).byte_to_sector(dev, pos) {
                    Some(sector) => sector,
                    None => break,
                },
            };
            let sector_ofs = pos % BSIZE;
            let chunk = min(buf.len() - written, BSIZE - sector_ofs);
            let src = &buf[written..written + chunk];

            match <&Sector>::try_from(src) {
                Ok(full) => dev.write_sector(sector, full),
                Err(_) => {
                    let mut bounce = [0u8; BSIZE];
                    dev.read_sector(sector, &mut bounce);
                    bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(src);
                    dev.write_sector(sector, &bounce);
                }
            }
            written += chunk;
        }

        if let Some(mut data) = held {
            data.disk.length = end as u32;
            data.write_back(dev, self.sector());
        }
        Ok(written)
    }

    fn lock(&self) -> SleepLockGuard<'_, InodeData> {
        self.inner.lock(&*self.core.dev)
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.core.icache.dup(self.sector());
        Self {
            core: Arc::clone(&self.core),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Inode {
    /// 关闭一次。
    /// 如果这是最后一个句柄且 inode 已被删除，归还它占用的所有扇区。
    fn drop(&mut self) {
        if let Some(inner) = self.core.icache.put(self.inner.sector) {
            let mut data = inner.lock(&*self.core.dev);
            data.release_all(&self.core);
            self.core.free_map.release(inner.sector, 1);
            debug!("inode: sector {} reclaimed", inner.sector);
        }
    }
}

/// inode 在内存中的副本，以及按需读入的索引块。
struct InodeData {
    valid: bool,
    disk: DiskInode,
    cache: IndexCache,
}

impl InodeData {
    const fn empty() -> Self {
        Self {
            valid: false,
            disk: DiskInode::new(false),
            cache: IndexCache::new(),
        }
    }

    const fn fresh(is_dir: bool) -> Self {
        Self {
            valid: true,
            disk: DiskInode::new(is_dir),
            cache: IndexCache::new(),
        }
    }

    /// 将字节偏移换算为扇区号，偏移不小于文件长度时返回 `None`。
    fn byte_to_sector(&mut self, dev: &dyn BlockDevice, offset: usize) -> Option<u32> {
        if offset >= self.disk.length as usize {
            return None
        }
        Some(self.locate(dev, offset))
    }

    /// 查找覆盖字节偏移 `offset` 的已分配扇区。
    ///
    /// 层级按字节阈值划分，只在最后一步换算为该层内的扇区下标。
    fn locate(&mut self, dev: &dyn BlockDevice, offset: usize) -> u32 {
        const DIRECT_BYTES: usize = NDIRECT * BSIZE;
        const FIRST_BYTES: usize = (NDIRECT + NINDIRECT) * BSIZE;

        if offset < DIRECT_BYTES {
            let idx = offset / BSIZE;
            assert!(idx < self.disk.end as usize, "inode: direct sector {} not allocated", idx);
            self.disk.blocks[idx]
        } else if offset < FIRST_BYTES {
            let idx = (offset - DIRECT_BYTES) / BSIZE;
            assert!(idx < self.disk.f_end as usize, "inode: indirect sector {} not allocated", idx);
            self.cache.first(dev, self.disk.first_indir).entries[idx]
        } else {
            let idx = (offset - FIRST_BYTES) / BSIZE;
            assert!(idx < self.disk.s_end as usize, "inode: doubly indirect sector {} not allocated", idx);
            self.cache
                .child(dev, self.disk.second_indir, idx / NINDIRECT)
                .entries[idx % NINDIRECT]
        }
    }

    /// 把已分配的数据扇区数扩展到 `sectors`。
    ///
    /// 失败时归还本次占用的所有扇区，并恢复扩展前的计数与索引块。
    fn grow(&mut self, core: &FsCore, sectors: usize) -> Result<(), FsError> {
        if sectors > MAX_FILE_SECTORS {
            return Err(FsError::FileTooLarge)
        }
        let saved = self.disk;
        let mut claimed = Vec::new();
        match self.extend(core, sectors, &mut claimed) {
            Ok(()) => {
                self.cache.flush(&*core.dev);
                Ok(())
            }
            Err(err) => {
                warn!("inode: growing to {} sectors failed: {}", sectors, err);
                for sector in claimed {
                    core.free_map.release(sector, 1);
                }
                self.disk = saved;
                self.cache.clear();
                Err(err)
            }
        }
    }

    /// 逐级分配扇区：先填满直接块，再一级间接，最后二级间接。
    fn extend(&mut self, core: &FsCore, sectors: usize, claimed: &mut Vec<u32>) -> Result<(), FsError> {
        let dev = &*core.dev;

        // 直接块
        let want = min(sectors, NDIRECT);
        while (self.disk.end as usize) < want {
            let sector = claim(core, claimed)?;
            self.disk.blocks[self.disk.end as usize] = sector;
            self.disk.end += 1;
        }
        if sectors <= NDIRECT {
            return Ok(())
        }

        // 一级间接
        let want = min(sectors - NDIRECT, NINDIRECT);
        if (self.disk.f_end as usize) < want {
            if self.disk.first_indir == 0 {
                let sector = claim(core, claimed)?;
                self.disk.first_indir = sector;
                self.cache.first = Some(IndexBlock::zeroed(sector));
            }
            while (self.disk.f_end as usize) < want {
                let sector = claim(core, claimed)?;
                let block = self.cache.first(dev, self.disk.first_indir);
                block.set(self.disk.f_end as usize, sector);
                self.disk.f_end += 1;
            }
        }
        if sectors <= NDIRECT + NINDIRECT {
            return Ok(())
        }

        // 二级间接
        let want = sectors - NDIRECT - NINDIRECT;
        if (self.disk.s_end as usize) < want && self.disk.second_indir == 0 {
            let sector = claim(core, claimed)?;
            self.disk.second_indir = sector;
            self.cache.second = Some(IndexBlock::zeroed(sector));
        }
        while (self.disk.s_end as usize) < want {
            let outer = self.disk.s_end as usize / NINDIRECT;
            let inner = self.disk.s_end as usize % NINDIRECT;
            if inner == 0 {
                let sector = claim(core, claimed)?;
                self.cache.second(dev, self.disk.second_indir).set(outer, sector);
                self.cache.children.insert(outer, IndexBlock::zeroed(sector));
            }
            let sector = claim(core, claimed)?;
            self.cache.child(dev, self.disk.second_indir, outer).set(inner, sector);
            self.disk.s_end += 1;
        }
        Ok(())
    }

    /// 归还全部数据扇区与索引块，不含 inode 扇区本身。
    fn release_all(&mut self, core: &FsCore) {
        let dev = &*core.dev;
        let free_map = &core.free_map;

        for &sector in &self.disk.blocks[..self.disk.end as usize] {
            free_map.release(sector, 1);
        }
        if self.disk.first_indir != 0 {
            let block = self.cache.first(dev, self.disk.first_indir);
            for &sector in &block.entries[..self.disk.f_end as usize] {
                free_map.release(sector, 1);
            }
            free_map.release(self.disk.first_indir, 1);
        }
        if self.disk.second_indir != 0 {
            let s_end = self.disk.s_end as usize;
            for outer in 0..index_blocks(s_end) {
                let used = min(NINDIRECT, s_end - outer * NINDIRECT);
                let child = self.cache.child(dev, self.disk.second_indir, outer);
                for &sector in &child.entries[..used] {
                    free_map.release(sector, 1);
                }
                free_map.release(child.sector, 1);
            }
            free_map.release(self.disk.second_indir, 1);
        }
        self.disk.end = 0;
        self.disk.f_end = 0;
        self.disk.s_end = 0;
        self.disk.first_indir = 0;
        self.disk.second_indir = 0;
        self.cache.clear();
    }

    fn allocated_sectors(&self) -> usize {
        let disk = &self.disk;
        let mut total = 1 + disk.end as usize + disk.f_end as usize + disk.s_end as usize;
        if disk.first_indir != 0 {
            total += 1;
        }
        if disk.second_indir != 0 {
            total += 1 + index_blocks(disk.s_end as usize);
        }
        total
    }

    /// 写回脏索引块与 inode 扇区。
    fn write_back(&mut self, dev: &dyn BlockDevice, sector: u32) {
        self.cache.flush(dev);
        let mut buf = [0u8; BSIZE];
        self.disk.encode(&mut buf);
        dev.write_sector(sector, &buf);
    }
}

/// 从空闲位图取一个扇区并清零，记入 `claimed` 以便失败时归还。
fn claim(core: &FsCore, claimed: &mut Vec<u32>) -> Result<u32, FsError> {
    let sector = core.free_map.allocate(1).ok_or(FsError::NoSpace)?;
    core.dev.write_sector(sector, &[0; BSIZE]);
    claimed.push(sector);
    Ok(sector)
}

#[inline]
fn bytes_to_sectors(bytes: usize) -> usize {
    (bytes + BSIZE - 1) / BSIZE
}

/// 容纳 `sectors` 个二级数据扇区所需的一级索引块数量
#[inline]
fn index_blocks(sectors: usize) -> usize {
    (sectors + NINDIRECT - 1) / NINDIRECT
}

/// 磁盘上的 inode，恰好占一个扇区。
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DiskInode {
    /// 非 0 表示目录
    is_dir: u32,
    /// 文件长度（字节）
    length: u32,
    /// 已分配的直接块数
    end: u32,
    /// 一级间接索引块中已分配的扇区数
    f_end: u32,
    /// 二级间接索引中已分配的扇区数
    s_end: u32,
    magic: u32,
    /// 一级间接索引块的扇区号，0 表示未分配
    first_indir: u32,
    /// 二级间接索引块的扇区号，0 表示未分配
    second_indir: u32,
    blocks: [u32; NDIRECT],
}

const _: () = assert!(mem::size_of::<DiskInode>() == BSIZE);

impl DiskInode {
    const fn new(is_dir: bool) -> Self {
        Self {
            is_dir: is_dir as u32,
            length: 0,
            end: 0,
            f_end: 0,
            s_end: 0,
            magic: INODE_MAGIC,
            first_indir: 0,
            second_indir: 0,
            blocks: [0; NDIRECT],
        }
    }

    fn decode(buf: &Sector) -> Self {
        // 结构体大小等于扇区大小，且全部字段都是 u32
        unsafe { ptr::read_unaligned(buf.as_ptr() as *const DiskInode) }
    }

    fn encode(&self, buf: &mut Sector) {
        unsafe { ptr::write_unaligned(buf.as_mut_ptr() as *mut DiskInode, *self) }
    }
}

/// 一个索引块：一个扇区中的 `NINDIRECT` 个扇区号。
struct IndexBlock {
    sector: u32,
    entries: [u32; NINDIRECT],
    dirty: bool,
}

impl IndexBlock {
    /// 刚分配并已在磁盘上清零的索引块
    fn zeroed(sector: u32) -> Self {
        Self { sector, entries: [0; NINDIRECT], dirty: false }
    }

    fn load(dev: &dyn BlockDevice, sector: u32) -> Self {
        let mut buf = [0u8; BSIZE];
        dev.read_sector(sector, &mut buf);
        let mut entries = [0u32; NINDIRECT];
        for (entry, raw) in entries.iter_mut().zip(buf.chunks_exact(4)) {
            *entry = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Self { sector, entries, dirty: false }
    }

    fn set(&mut self, idx: usize, sector: u32) {
        self.entries[idx] = sector;
        self.dirty = true;
    }

    fn store(&mut self, dev: &dyn BlockDevice) {
        if !self.dirty {
            return
        }
        let mut buf = [0u8; BSIZE];
        for (entry, raw) in self.entries.iter().zip(buf.chunks_exact_mut(4)) {
            raw.copy_from_slice(&entry.to_le_bytes());
        }
        dev.write_sector(self.sector, &buf);
        self.dirty = false;
    }
}

/// 打开的 inode 缓存的索引块。
struct IndexCache {
    first: Option<IndexBlock>,
    second: Option<IndexBlock>,
    /// 二级间接索引所指向的一级索引块，以其在二级索引块中的下标为键
    children: BTreeMap<usize, IndexBlock>,
}

impl IndexCache {
    const fn new() -> Self {
        Self { first: None, second: None, children: BTreeMap::new() }
    }

    fn first(&mut self, dev: &dyn BlockDevice, sector: u32) -> &mut IndexBlock {
        self.first.get_or_insert_with(|| IndexBlock::load(dev, sector))
    }

    fn second(&mut self, dev: &dyn BlockDevice, sector: u32) -> &mut IndexBlock {
        self.second.get_or_insert_with(|| IndexBlock::load(dev, sector))
    }

    fn child(&mut self, dev: &dyn BlockDevice, second: u32, idx: usize) -> &mut IndexBlock {
        let Self { second: second_block, children, .. } = self;
        children.entry(idx).or_insert_with(|| {
            let block = second_block.get_or_insert_with(|| IndexBlock::load(dev, second));
            IndexBlock::load(dev, block.entries[idx])
        })
    }

    fn flush(&mut self, dev: &dyn BlockDevice) {
        if let Some(block) = self.first.as_mut() {
            block.store(dev);
        }
        if let Some(block) = self.second.as_mut() {
            block.store(dev);
        }
        for block in self.children.values_mut() {
            block.store(dev);
        }
    }

    fn clear(&mut self) {
        self.first = None;
        self.second = None;
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RamDisk;

    fn fs_core(sectors: u32) -> Arc<FsCore> {
        FsCore::new(Arc::new(RamDisk::new("hda", sectors)))
    }

    fn new_inode(core: &Arc<FsCore>, length: usize) -> Result<Inode, FsError> {
        let sector = core.free_map.allocate(1).ok_or(FsError::NoSpace)?;
        Inode::create(core, sector, length, false)?;
        Ok(Inode::open(core, sector))
    }

    #[test]
    fn disk_inode_fills_one_sector() {
        let mut buf = [0u8; BSIZE];
        let mut disk = DiskInode::new(true);
        disk.length = 1234;
        disk.blocks[NDIRECT - 1] = 77;
        disk.encode(&mut buf);
        let back = DiskInode::decode(&buf);
        assert_eq!(back.magic, INODE_MAGIC);
        assert_eq!(back.length, 1234);
        assert_eq!(back.is_dir, 1);
        assert_eq!(back.blocks[NDIRECT - 1], 77);
    }

    #[test]
    fn create_accounts_every_level() {
        let core = fs_core(20_000);
        let base = core.free_map.allocated();
        // 直接块 + 一级间接 + 两个二级子索引块
        let sectors = NDIRECT + NINDIRECT + NINDIRECT + 1;
        let inode = new_inode(&core, sectors * BSIZE).unwrap();
        let expect = 1 + sectors + 1 + 1 + 2;
        assert_eq!(inode.allocated_sectors(), expect);
        assert_eq!(core.free_map.allocated() - base, expect);
        assert_eq!(inode.length(), sectors * BSIZE);
    }

    #[test]
    fn new_sectors_read_as_zero() {
        let core = fs_core(400);
        let inode = new_inode(&core, 0).unwrap();
        assert_eq!(inode.write_at(b"tail", 3 * BSIZE + 10).unwrap(), 4);
        let mut buf = vec![0xffu8; 3 * BSIZE + 14];
        assert_eq!(inode.read_at(&mut buf, 0), buf.len());
        assert!(buf[..3 * BSIZE + 10].iter().all(|&b| b == 0));
        assert_eq!(&buf[3 * BSIZE + 10..], b"tail");
    }

    #[test]
    fn failed_growth_rolls_back() {
        let core = fs_core(150);
        let inode = new_inode(&core, BSIZE).unwrap();
        let before = core.free_map.allocated();
        let err = inode.write_at(&[1u8; 200 * BSIZE], 0).unwrap_err();
        assert_eq!(err, FsError::NoSpace);
        assert_eq!(core.free_map.allocated(), before);
        assert_eq!(inode.length(), BSIZE);
        assert_eq!(inode.allocated_sectors(), 2);
        // 回滚后仍可在剩余空间内扩展
        assert_eq!(inode.write_at(&[2u8; 2 * BSIZE], BSIZE).unwrap(), 2 * BSIZE);
    }

    #[test]
    fn create_too_large_leaves_free_map_untouched() {
        let core = fs_core(100);
        let before = core.free_map.allocated();
        assert_eq!(new_inode(&core, 200 * BSIZE).err(), Some(FsError::NoSpace));
        // 只剩下 inode 扇区本身，由调用者归还
        assert_eq!(core.free_map.allocated(), before + 1);
        assert_eq!(
            Inode::create(&core, 5, MAX_FILE_SIZE + 1, false),
            Err(FsError::FileTooLarge)
        );
    }

    #[test]
    fn one_instance_per_sector() {
        let core = fs_core(64);
        let a = new_inode(&core, 10).unwrap();
        let b = Inode::open(&core, a.sector());
        assert!(a.same(&b));
        assert_eq!(a.open_count(), 2);
        let c = b.clone();
        assert_eq!(a.open_count(), 3);
        drop(b);
        drop(c);
        assert_eq!(a.open_count(), 1);
        assert_eq!(core.icache.len(), 1);
        drop(a);
        assert_eq!(core.icache.len(), 0);
    }

    #[test]
    fn deny_write_is_counted() {
        let core = fs_core(64);
        let a = new_inode(&core, 0).unwrap();
        let b = a.clone();
        a.deny_write();
        b.deny_write();
        assert_eq!(a.write_at(b"x", 0), Err(FsError::WriteDenied));
        a.allow_write();
        assert_eq!(b.write_at(b"x", 0), Err(FsError::WriteDenied));
        b.allow_write();
        assert_eq!(b.write_at(b"x", 0), Ok(1));
    }

    #[test]
    #[should_panic(expected = "deny_write exceeds open count")]
    fn deny_write_beyond_open_count() {
        let core = fs_core(64);
        let a = new_inode(&core, 0).unwrap();
        a.deny_write();
        a.deny_write();
    }

    #[test]
    fn removed_inode_reclaimed_on_last_close() {
        let core = fs_core(400);
        let base = core.free_map.allocated();
        let a = new_inode(&core, (NDIRECT + 3) * BSIZE).unwrap();
        let b = a.clone();
        a.remove();
        drop(a);
        let mut buf = [0u8; 8];
        assert_eq!(b.read_at(&mut buf, 0), 8);
        assert!(core.free_map.allocated() > base);
        drop(b);
        assert_eq!(core.free_map.allocated(), base);
    }

    #[test]
    #[should_panic(expected = "bad magic")]
    fn bad_magic_is_fatal() {
        let core = fs_core(8);
        let inode = Inode::open(&core, 5);
        inode.length();
    }
}
