//! 用户页帧表与时钟置换
//!
//! 用户页帧池是固定数量的页帧组成的环，每个页帧对应一个槽位。
//! 页帧表记录每个在用页帧属于哪个地址空间的哪个用户页，
//! 需要页帧而池已用尽时，时钟指针沿环扫描选出被置换的页帧。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::{hint, mem};

use log::{debug, info, warn};

use crate::consts::{PGSIZE, USER_POOL_BASE};
use crate::sleeplock::SleepLock;
use crate::spinlock::{SpinLock, SpinLockGuard};

use super::{
    Addr, AddressSpace, PageKind, PhysAddr, Pid, RawSinglePage, SupPageTable, SwapTable,
    VirtAddr, VmError,
};

/// 一个在用页帧的记录
struct FrameEntry {
    owner: Arc<AddressSpace>,
    upage: VirtAddr,
    /// 时钟扫描清除过该页的脏位，页面内容仍然需要写回
    remember_dirty: bool,
    /// 固定计数，非零时不会被置换
    pins: usize,
}

enum FrameSlot {
    Free,
    /// 正在被置换，页帧内容仍在写往交换区
    Reserved,
    Used(FrameEntry),
}

/// 一次页帧选择的结果
enum Sweep {
    Free(usize),
    Victim(usize),
    /// 本轮没有可用页帧，但有页帧正在置换或刚被访问，稍后重试
    Retry,
}

struct FrameInner {
    slots: Vec<FrameSlot>,
    /// (进程号, 用户页) 到槽位的索引
    index: BTreeMap<(Pid, VirtAddr), usize>,
    /// 时钟指针
    hand: usize,
}

impl FrameInner {
    /// 第一个空闲槽位。存在空闲槽位时不需要时钟扫描，也不改动任何页面的访问位与脏位。
    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| matches!(slot, FrameSlot::Free))
    }

    /// # 功能说明
    /// 页帧池已无空闲槽位时，从时钟指针处开始沿环扫描，找到一个可置换的页帧。
    ///
    /// # 流程解释
    /// 对指针下的槽位：
    /// 1. 空闲则直接返回，调用者先查过空闲槽位，持锁期间不会出现；
    /// 2. 正在置换或被固定的页帧跳过；
    /// 3. 访问位置位：清除访问位，给它第二次机会；
    /// 4. 脏位置位：清除脏位并记入 `remember_dirty`，下一轮再决定；
    /// 5. 两者都为零：选为被置换页帧。
    ///
    /// 指针每检查一个槽位就前进一格，跨调用保留位置。
    /// 最多扫描三圈，足以让任何未被再次访问的页帧的两个标志位都被清除。
    ///
    /// # 可能的错误
    /// 所有页帧都被固定时不可能腾出页帧，触发 panic。
    fn sweep(&mut self) -> Sweep {
        let n = self.slots.len();
        let mut all_pinned = true;
        for _ in 0..3 * n {
            let idx = self.hand;
            self.hand = (self.hand + 1) % n;
            match &mut self.slots[idx] {
                FrameSlot::Free => return Sweep::Free(idx),
                FrameSlot::Reserved => all_pinned = false,
                FrameSlot::Used(entry) if entry.pins > 0 => {}
                FrameSlot::Used(entry) => {
                    all_pinned = false;
                    let mut pt = entry.owner.pagetable().lock();
                    if pt.is_accessed(entry.upage) {
                        pt.set_accessed(entry.upage, false);
                    } else if pt.is_dirty(entry.upage) {
                        pt.set_dirty(entry.upage, false);
                        entry.remember_dirty = true;
                    } else {
                        return Sweep::Victim(idx)
                    }
                }
            }
        }
        if all_pinned {
            panic!("frame: no evictable frame");
        }
        Sweep::Retry
    }

    fn entry_mut(&mut self, pid: Pid, upage: VirtAddr) -> Option<(usize, &mut FrameEntry)> {
        let idx = *self.index.get(&(pid, upage))?;
        match &mut self.slots[idx] {
            FrameSlot::Used(entry) => Some((idx, entry)),
            _ => panic!("frame: index points to slot {} not in use", idx),
        }
    }
}

/// 用户页帧表。
///
/// 页帧内容各自由一把睡眠锁保护，可以在不持有页帧表锁的情况下进行磁盘读写。
pub struct FrameTable {
    frames: Vec<SleepLock<Box<RawSinglePage>>>,
    inner: SpinLock<FrameInner>,
}

impl FrameTable {
    /// 建立含 `nframes` 个页帧的用户页帧池。
    pub fn new(nframes: usize) -> Self {
        assert!(nframes > 0, "frame: empty user pool");
        let mut frames = Vec::with_capacity(nframes);
        let mut slots = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            frames.push(SleepLock::new(RawSinglePage::new_zeroed(), "frame"));
            slots.push(FrameSlot::Free);
        }
        info!("frame: {} user frames at {:#x}", nframes, USER_POOL_BASE);
        Self {
            frames,
            inner: SpinLock::new(FrameInner { slots, index: BTreeMap::new(), hand: 0 }, "frame_table"),
        }
    }

    #[inline]
    fn phys_addr(idx: usize) -> PhysAddr {
        PhysAddr::from_raw(USER_POOL_BASE + idx * PGSIZE)
    }

    fn slot_of(&self, pa: PhysAddr) -> usize {
        let raw = pa.as_usize();
        if raw < USER_POOL_BASE || raw >= USER_POOL_BASE + self.frames.len() * PGSIZE {
            panic!("frame: {:#x} outside the user pool", raw);
        }
        (raw - USER_POOL_BASE) / PGSIZE
    }

    /// # 功能说明
    /// 为 `owner` 的用户页 `upage` 取得一个页帧，返回时该页帧已登记并处于固定状态，
    /// 调用者填充内容并建立映射后需调用 [`FrameTable::unpin`]。
    ///
    /// # 流程解释
    /// 1. 池中有空闲槽位则直接登记，不扫描也不置换；
    /// 2. 否则置换时钟扫描选出的页帧：先取得其所有者的补充页表，
    ///    所有者就是请求者时使用调用者传入的 `spt`，否则尝试加锁，
    ///    加锁失败说明所有者正在处理缺页，放弃该页帧并重新扫描；
    /// 3. 被置换的页帧直接交给请求者。
    ///
    /// # 参数
    /// - `swap`：换出脏页使用的交换区；
    /// - `owner`：请求页帧的地址空间；
    /// - `spt`：`owner` 的补充页表，调用者必须持有其锁；
    /// - `upage`：页对齐的用户虚拟地址；
    /// - `zero`：是否将页帧清零。
    ///
    /// # 可能的错误
    /// - 交换区已满，无法换出被选中的页帧时返回 [`VmError::SwapFull`]；
    /// - 该页已经驻留在某个页帧中，说明补充页表与页帧表不一致，触发 panic。
    pub fn obtain_frame(
        &self,
        swap: &SwapTable,
        owner: &Arc<AddressSpace>,
        spt: &mut SupPageTable,
        upage: VirtAddr,
        zero: bool,
    ) -> Result<PhysAddr, VmError> {
        let key = (owner.pid(), upage);
        loop {
            let mut inner = self.inner.lock();
            if inner.index.contains_key(&key) {
                panic!("frame: page {:#x} of pid {} already resident", upage.as_usize(), key.0);
            }
            let found = match inner.free_slot() {
                Some(idx) => Sweep::Free(idx),
                None => inner.sweep(),
            };
            let idx = match found {
                Sweep::Free(idx) => idx,
                Sweep::Retry => {
                    drop(inner);
                    hint::spin_loop();
                    continue;
                }
                Sweep::Victim(idx) => {
                    let victim = match &inner.slots[idx] {
                        FrameSlot::Used(entry) => entry.owner.clone(),
                        _ => unreachable!(),
                    };
                    let mut foreign;
                    let victim_spt: &mut SupPageTable = if Arc::ptr_eq(&victim, owner) {
                        &mut *spt
                    } else {
                        match victim.spt().try_lock() {
                            Some(guard) => {
                                foreign = guard;
                                &mut *foreign
                            }
                            None => {
                                drop(inner);
                                hint::spin_loop();
                                continue;
                            }
                        }
                    };
                    self.evict(swap, inner, idx, victim_spt)?;
                    inner = self.inner.lock();
                    idx
                }
            };

            inner.slots[idx] = FrameSlot::Used(FrameEntry {
                owner: owner.clone(),
                upage,
                remember_dirty: false,
                pins: 1,
            });
            inner.index.insert(key, idx);
            drop(inner);

            if zero {
                self.frames[idx].lock().zero();
            }
            return Ok(Self::phys_addr(idx))
        }
    }

    /// # 功能说明
    /// 置换槽位 `idx` 中的页帧，完成后该槽位处于 `Reserved` 状态，由调用者接手。
    ///
    /// # 流程解释
    /// 1. 在页帧表锁下将槽位标记为正在置换、删除索引，并解除所有者的映射；
    /// 2. 释放页帧表锁后决定去向：被写过的页以及匿名页写入交换区，
    ///    并把补充页表项改为指向该交换槽；未被写过的文件页直接丢弃，下次缺页重新读文件；
    /// 3. 将补充页表项标记为未装入。
    ///
    /// # 可能的错误
    /// 交换区已满时恢复原来的映射与登记，返回 [`VmError::SwapFull`]。
    fn evict(
        &self,
        swap: &SwapTable,
        mut inner: SpinLockGuard<'_, FrameInner>,
        idx: usize,
        spt: &mut SupPageTable,
    ) -> Result<(), VmError> {
        let mut entry = match mem::replace(&mut inner.slots[idx], FrameSlot::Reserved) {
            FrameSlot::Used(entry) => entry,
            _ => unreachable!(),
        };
        let key = (entry.owner.pid(), entry.upage);
        inner.index.remove(&key);
        let dirty = {
            let mut pt = entry.owner.pagetable().lock();
            let dirty = pt.is_dirty(entry.upage) || entry.remember_dirty;
            pt.unmap(entry.upage);
            dirty
        };
        drop(inner);

        let page = match spt.lookup_page_mut(entry.upage.as_usize()) {
            Some(page) => page,
            None => panic!("frame: resident page {:#x} has no page entry", entry.upage.as_usize()),
        };
        if dirty || page.is_swap() {
            let frame = self.frames[idx].lock();
            match swap.swap_out(&frame) {
                Ok(slot) => page.kind = PageKind::Swap { slot: Some(slot) },
                Err(err) => {
                    drop(frame);
                    warn!("frame: cannot evict page {:#x} of pid {}: {}", entry.upage.as_usize(), key.0, err);
                    let mut inner = self.inner.lock();
                    {
                        let mut pt = entry.owner.pagetable().lock();
                        if pt.map(entry.upage, Self::phys_addr(idx), !page.read_only).is_err() {
                            panic!("frame: page {:#x} remapped during eviction", entry.upage.as_usize());
                        }
                    }
                    entry.remember_dirty = dirty;
                    inner.slots[idx] = FrameSlot::Used(entry);
                    inner.index.insert(key, idx);
                    return Err(err)
                }
            }
        }
        page.loaded = false;
        debug!("frame: evicted page {:#x} of pid {} from slot {} (dirty={})",
            entry.upage.as_usize(), key.0, idx, dirty);
        Ok(())
    }

    /// 释放 `pid` 的用户页 `upage` 占用的页帧，不论其是否被固定。
    ///
    /// # 返回值
    /// 页面驻留时返回被释放的页帧，否则返回 `None`。
    pub fn free_frame(&self, pid: Pid, upage: VirtAddr) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        let idx = inner.index.remove(&(pid, upage))?;
        inner.slots[idx] = FrameSlot::Free;
        Some(Self::phys_addr(idx))
    }

    /// 固定驻留页帧，使其不会被置换。页面不驻留时返回 `None`。
    pub fn pin(&self, pid: Pid, upage: VirtAddr) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        let (idx, entry) = inner.entry_mut(pid, upage)?;
        entry.pins += 1;
        Some(Self::phys_addr(idx))
    }

    pub fn unpin(&self, pid: Pid, upage: VirtAddr) {
        let mut inner = self.inner.lock();
        if let Some((_, entry)) = inner.entry_mut(pid, upage) {
            if entry.pins == 0 {
                panic!("frame: unpin of unpinned page {:#x}", upage.as_usize());
            }
            entry.pins -= 1;
        }
    }

    pub fn is_pinned(&self, pid: Pid, upage: VirtAddr) -> bool {
        let mut inner = self.inner.lock();
        matches!(inner.entry_mut(pid, upage), Some((_, entry)) if entry.pins > 0)
    }

    /// 查找驻留页面所在的页帧
    pub fn lookup(&self, pid: Pid, upage: VirtAddr) -> Option<PhysAddr> {
        let inner = self.inner.lock();
        inner.index.get(&(pid, upage)).map(|&idx| Self::phys_addr(idx))
    }

    /// 在持有页帧内容锁的情况下访问页帧 `pa`。
    ///
    /// 调用者必须保证页帧处于固定状态，否则内容可能随时被置换。
    pub fn with_frame<R>(&self, pa: PhysAddr, f: impl FnOnce(&mut RawSinglePage) -> R) -> R {
        let idx = self.slot_of(pa);
        let mut frame = self.frames[idx].lock();
        f(&mut frame)
    }

    /// 驻留页面总数
    pub fn resident(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// 所有驻留页面及其页帧
    pub fn resident_pages(&self) -> Vec<(Pid, usize, PhysAddr)> {
        let inner = self.inner.lock();
        inner.index.iter()
            .map(|(&(pid, upage), &idx)| (pid, upage.as_usize(), Self::phys_addr(idx)))
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }
}
