//! 补充页表：记录每个用户页的后备存储，缺页时据此装入页面

use alloc::collections::BTreeMap;
use alloc::collections::btree_map;
use alloc::sync::Arc;

use crate::fs::File;

use super::{pg_round_down, SwapSlot, VmError};

/// 用户页的后备存储
#[derive(Clone)]
pub enum PageKind {
    /// 从文件装入：读取 `read_bytes` 字节，其余部分补零。
    File {
        file: Arc<File>,
        offset: usize,
        read_bytes: usize,
        /// 整页都是零，不需要读文件
        zero_page: bool,
    },
    /// 匿名页（栈页或被写过的文件页）。`slot` 为当前保存页内容的交换槽，
    /// 页面驻留内存或从未换出时为 `None`。
    Swap { slot: Option<SwapSlot> },
}

/// 补充页表项
#[derive(Clone)]
pub struct PageEntry {
    pub vaddr: usize,
    pub kind: PageKind,
    pub read_only: bool,
    /// 页面当前是否驻留在某个页帧中
    pub loaded: bool,
}

impl PageEntry {
    pub fn new(vaddr: usize, kind: PageKind, read_only: bool) -> Self {
        Self { vaddr, kind, read_only, loaded: false }
    }

    pub fn is_swap(&self) -> bool {
        matches!(self.kind, PageKind::Swap { .. })
    }

    /// 当前保存该页内容的交换槽
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.kind {
            PageKind::Swap { slot } => slot,
            PageKind::File { .. } => None,
        }
    }
}

/// 一个进程的补充页表，按页对齐的用户虚拟地址索引。
pub struct SupPageTable {
    pages: BTreeMap<usize, PageEntry>,
}

impl SupPageTable {
    pub const fn new() -> Self {
        Self { pages: BTreeMap::new() }
    }

    /// 加入一个尚未装入的页表项。
    ///
    /// # 可能的错误
    /// 该页已有表项时返回 [`VmError::DuplicatePage`]。
    pub fn insert_page(&mut self, entry: PageEntry) -> Result<&mut PageEntry, VmError> {
        debug_assert_eq!(entry.vaddr, pg_round_down(entry.vaddr));
        match self.pages.entry(entry.vaddr) {
            btree_map::Entry::Occupied(_) => Err(VmError::DuplicatePage(entry.vaddr)),
            btree_map::Entry::Vacant(v) => Ok(v.insert(entry)),
        }
    }

    /// 查找 `vaddr` 所在页的表项，`vaddr` 不必页对齐。
    pub fn lookup_page(&self, vaddr: usize) -> Option<&PageEntry> {
        self.pages.get(&pg_round_down(vaddr))
    }

    pub fn lookup_page_mut(&mut self, vaddr: usize) -> Option<&mut PageEntry> {
        self.pages.get_mut(&pg_round_down(vaddr))
    }

    /// 移除表项；驻留页帧与交换槽由调用者释放。
    pub fn remove_page(&mut self, vaddr: usize) -> Option<PageEntry> {
        self.pages.remove(&pg_round_down(vaddr))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 取出全部表项，用于地址空间销毁。
    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry> {
        core::mem::take(&mut self.pages).into_values()
    }
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}
