//! 地址空间与缺页处理
//!
//! [`Vm`] 持有用户页帧表与交换区；每个进程拥有一个 [`AddressSpace`]，
//! 其中的补充页表描述每个用户页的后备存储，页表记录当前驻留的页面。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info, warn};

use crate::consts::{PGSIZE, PHYS_BASE, STACK_HEURISTIC};
use crate::driver::BlockDevice;
use crate::fs::File;
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLock;

use super::{
    user_page, AccessFault, Addr, FrameTable, PageEntry, PageKind, PageTable, PhysAddr,
    SupPageTable, SwapTable, VirtAddr, VmConfig, VmError,
};

/// 进程号
pub type Pid = usize;

/// 一个进程的用户地址空间
pub struct AddressSpace {
    pid: Pid,
    spt: SleepLock<SupPageTable>,
    pagetable: SpinLock<Box<PageTable>>,
    /// 最近一次从用户态进入内核时的栈指针，内核代替用户访存缺页时据此判断栈增长
    user_esp: AtomicUsize,
}

impl AddressSpace {
    pub fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            spt: SleepLock::new(SupPageTable::new(), "spt"),
            pagetable: SpinLock::new(Box::new(PageTable::empty()), "pagetable"),
            user_esp: AtomicUsize::new(PHYS_BASE),
        })
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// 补充页表。加锁顺序：补充页表先于页帧表与页表。
    #[inline]
    pub fn spt(&self) -> &SleepLock<SupPageTable> {
        &self.spt
    }

    #[inline]
    pub fn pagetable(&self) -> &SpinLock<Box<PageTable>> {
        &self.pagetable
    }

    pub fn user_esp(&self) -> usize {
        self.user_esp.load(Ordering::Acquire)
    }

    pub fn set_user_esp(&self, esp: usize) {
        self.user_esp.store(esp, Ordering::Release)
    }
}

/// 一次缺页的描述，对应硬件在页故障时提供的信息。
#[derive(Clone, Copy, Debug)]
pub struct PageFault {
    pub addr: usize,
    /// 页不在内存中；为假表示写只读页
    pub not_present: bool,
    pub write: bool,
    /// 缺页发生在用户态
    pub user: bool,
    /// 缺页时的用户栈指针，仅当 `user` 为真时有效
    pub esp: usize,
}

/// 一次用户内存访问的方式
#[derive(Clone, Copy)]
struct Access {
    write: bool,
    user: bool,
    esp: usize,
}

/// 虚拟内存子系统，持有用户页帧表与交换区。
pub struct Vm {
    frames: FrameTable,
    swap: SwapTable,
    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig, swap_dev: Arc<dyn BlockDevice>) -> Self {
        let frames = FrameTable::new(config.user_frames);
        let swap = SwapTable::new(swap_dev);
        info!("vm: stack limit {:#x} bytes", config.stack_limit);
        Self { frames, swap, config }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// # 功能说明
    /// 为可执行文件的一个段登记惰性装入的文件页，不读取任何内容。
    ///
    /// # 参数
    /// - `file`：段所在文件；
    /// - `offset`：段在文件中的偏移；
    /// - `upage`：段的起始用户页，必须页对齐；
    /// - `read_bytes`：从文件读取的字节数；
    /// - `zero_bytes`：读取部分之后补零的字节数，两者之和必须是页大小的整数倍；
    /// - `writable`：段是否可写。
    ///
    /// # 可能的错误
    /// - 段超出用户地址空间时返回 [`VmError::InvalidAccess`]；
    /// - 段与已登记的页重叠时返回 [`VmError::DuplicatePage`]。
    pub fn load_segment(
        &self,
        aspace: &AddressSpace,
        file: Arc<File>,
        mut offset: usize,
        upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        assert_eq!((read_bytes + zero_bytes) % PGSIZE, 0, "vm: segment size not page aligned");
        assert_eq!(upage % PGSIZE, 0, "vm: segment start not page aligned");
        if upage == 0 || upage + read_bytes + zero_bytes > PHYS_BASE {
            return Err(VmError::InvalidAccess(upage))
        }

        let mut spt = aspace.spt().lock();
        let mut vaddr = upage;
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read = min(read_bytes, PGSIZE);
            let kind = PageKind::File {
                file: file.clone(),
                offset,
                read_bytes: page_read,
                zero_page: page_read == 0,
            };
            spt.insert_page(PageEntry::new(vaddr, kind, !writable))?;
            read_bytes -= page_read;
            zero_bytes -= PGSIZE - page_read;
            offset += page_read;
            vaddr += PGSIZE;
        }
        Ok(())
    }

    /// 建立用户栈的第一页，返回初始栈指针。
    pub fn setup_stack(&self, aspace: &Arc<AddressSpace>) -> Result<usize, VmError> {
        self.stack_growth(aspace, PHYS_BASE - PGSIZE)?;
        aspace.set_user_esp(PHYS_BASE);
        Ok(PHYS_BASE)
    }

    /// 为栈区的用户页 `upage` 分配一个清零的页帧并建立映射。
    ///
    /// # 可能的错误
    /// - 该页不在栈区内时返回 [`VmError::InvalidAccess`]；
    /// - 该页已登记时返回 [`VmError::DuplicatePage`]；
    /// - 无法腾出页帧时返回 [`VmError::SwapFull`]。
    pub fn stack_growth(&self, aspace: &Arc<AddressSpace>, upage: usize) -> Result<(), VmError> {
        if upage >= PHYS_BASE || upage < PHYS_BASE - self.config.stack_limit {
            return Err(VmError::InvalidAccess(upage))
        }
        let upage = user_page(upage)?;
        let mut spt = aspace.spt().lock();
        self.grow_stack(aspace, &mut spt, upage)
    }

    fn grow_stack(&self, aspace: &Arc<AddressSpace>, spt: &mut SupPageTable, upage: VirtAddr) -> Result<(), VmError> {
        spt.insert_page(PageEntry::new(upage.as_usize(), PageKind::Swap { slot: None }, false))?;
        let pa = match self.frames.obtain_frame(&self.swap, aspace, spt, upage, true) {
            Ok(pa) => pa,
            Err(err) => {
                spt.remove_page(upage.as_usize());
                return Err(err)
            }
        };
        self.install(aspace, spt, upage, pa)?;
        debug!("vm: pid {} stack grows to {:#x}", aspace.pid(), upage.as_usize());
        Ok(())
    }

    /// 用户栈区的访问：位于栈区之内，且不低于栈指针超过 `STACK_HEURISTIC` 字节。
    fn is_stack_access(&self, addr: usize, esp: usize) -> bool {
        addr < PHYS_BASE
            && addr >= PHYS_BASE - self.config.stack_limit
            && addr + STACK_HEURISTIC >= esp
    }

    /// # 功能说明
    /// 处理一次缺页。
    ///
    /// # 流程解释
    /// 1. 写只读页、空指针或内核地址的访问都是非法访问；
    /// 2. 补充页表中没有该页：符合栈增长条件则扩展栈，否则为非法访问；
    /// 3. 该页已经装入：并发缺页已处理完毕，直接返回；
    /// 4. 否则从文件或交换区装入该页。
    ///
    /// # 可能的错误
    /// - [`VmError::InvalidAccess`] / [`VmError::ReadOnly`]：非法访问，调用者应终止进程；
    /// - [`VmError::ShortRead`]：文件页读取不完整；
    /// - [`VmError::SwapFull`]：无法腾出页帧。
    pub fn page_fault(&self, aspace: &Arc<AddressSpace>, fault: PageFault) -> Result<(), VmError> {
        if !fault.not_present {
            return Err(VmError::ReadOnly(fault.addr))
        }
        if fault.addr == 0 || fault.addr >= PHYS_BASE {
            return Err(VmError::InvalidAccess(fault.addr))
        }
        let upage = user_page(fault.addr)?;
        let esp = if fault.user { fault.esp } else { aspace.user_esp() };

        let mut spt = aspace.spt().lock();
        match spt.lookup_page(upage.as_usize()) {
            None if self.is_stack_access(fault.addr, esp) => self.grow_stack(aspace, &mut spt, upage),
            None => Err(VmError::InvalidAccess(fault.addr)),
            Some(entry) if entry.loaded => Ok(()),
            Some(entry) if fault.write && entry.read_only => Err(VmError::ReadOnly(fault.addr)),
            Some(_) => self.load_page(aspace, &mut spt, upage),
        }
    }

    /// # 功能说明
    /// 将尚未驻留的页面 `upage` 装入一个新页帧并建立映射。
    ///
    /// # 流程解释
    /// 1. 取得页帧（固定状态），全零页与未换出过的匿名页要求清零；
    /// 2. 文件页：读取 `read_bytes` 字节，其余补零；读取不完整时释放页帧并报错；
    /// 3. 已换出的匿名页：从交换槽读回，交换槽随之释放；
    /// 4. 建立映射、标记为已装入，最后解除固定。
    fn load_page(&self, aspace: &Arc<AddressSpace>, spt: &mut SupPageTable, upage: VirtAddr) -> Result<(), VmError> {
        let kind = match spt.lookup_page(upage.as_usize()) {
            Some(entry) => entry.kind.clone(),
            None => return Err(VmError::InvalidAccess(upage.as_usize())),
        };
        let zero = matches!(kind, PageKind::File { zero_page: true, .. } | PageKind::Swap { slot: None });
        let pa = self.frames.obtain_frame(&self.swap, aspace, spt, upage, zero)?;

        match kind {
            PageKind::File { file, offset, read_bytes, zero_page: false } => {
                let read = self.frames.with_frame(pa, |frame| {
                    let bytes = frame.as_bytes_mut();
                    let read = file.read_at(&mut bytes[..read_bytes], offset);
                    bytes[read_bytes..].fill(0);
                    read
                });
                if read != read_bytes {
                    self.frames.free_frame(aspace.pid(), upage);
                    warn!("vm: pid {} short read at {:#x}: {} of {} bytes",
                        aspace.pid(), upage.as_usize(), read, read_bytes);
                    return Err(VmError::ShortRead { upage: upage.as_usize(), read, expected: read_bytes })
                }
            }
            PageKind::Swap { slot: Some(slot) } => {
                self.frames.with_frame(pa, |frame| self.swap.swap_in(slot, frame));
                if let Some(entry) = spt.lookup_page_mut(upage.as_usize()) {
                    entry.kind = PageKind::Swap { slot: None };
                }
            }
            PageKind::File { zero_page: true, .. } | PageKind::Swap { slot: None } => {}
        }
        self.install(aspace, spt, upage, pa)
    }

    /// 映射已填好内容的固定页帧，标记为已装入并解除固定。
    fn install(&self, aspace: &AddressSpace, spt: &mut SupPageTable, upage: VirtAddr, pa: PhysAddr) -> Result<(), VmError> {
        let entry = match spt.lookup_page_mut(upage.as_usize()) {
            Some(entry) => entry,
            None => panic!("vm: installing untracked page {:#x}", upage.as_usize()),
        };
        let mapped = aspace.pagetable().lock().map(upage, pa, !entry.read_only);
        if let Err(err) = mapped {
            self.frames.free_frame(aspace.pid(), upage);
            return Err(err)
        }
        entry.loaded = true;
        self.frames.unpin(aspace.pid(), upage);
        Ok(())
    }

    /// # 功能说明
    /// 逐页访问用户区间 `[addr, addr + len)`，对每一段调用 `f(片段, 已处理字节数)`。
    ///
    /// # 流程解释
    /// 对区间经过的每一页：
    /// 1. 页面驻留则先固定页帧，再经页表完成一次访存（置 A/D 位）；
    /// 2. 页面不驻留（或正在装入）则按缺页处理后重试；
    /// 3. 在页帧内容锁下调用 `f`，最后解除固定。
    ///
    /// 固定发生在访存之前，因此访问期间页帧不会被置换。
    fn access_range(
        &self,
        aspace: &Arc<AddressSpace>,
        addr: usize,
        len: usize,
        access: Access,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmError> {
        let pid = aspace.pid();
        let mut done = 0;
        while done < len {
            let va = addr.checked_add(done).ok_or(VmError::InvalidAccess(addr))?;
            if va == 0 || va >= PHYS_BASE {
                return Err(VmError::InvalidAccess(va))
            }
            let upage = user_page(va)?;
            let ofs = va - upage.as_usize();
            let n = min(PGSIZE - ofs, len - done);

            let pa = loop {
                if self.frames.pin(pid, upage).is_some() {
                    let touched = aspace.pagetable().lock().touch(upage, access.write);
                    match touched {
                        Ok(pa) => break pa,
                        Err(AccessFault::ReadOnly) => {
                            self.frames.unpin(pid, upage);
                            return Err(VmError::ReadOnly(va))
                        }
                        Err(AccessFault::NotPresent) => self.frames.unpin(pid, upage),
                    }
                }
                self.page_fault(aspace, PageFault {
                    addr: va,
                    not_present: true,
                    write: access.write,
                    user: access.user,
                    esp: access.esp,
                })?;
            };

            self.frames.with_frame(pa, |frame| f(&mut frame.as_bytes_mut()[ofs..ofs + n], done));
            self.frames.unpin(pid, upage);
            done += n;
        }
        Ok(())
    }

    /// 内核将 `src` 复制到用户地址 `dst`。
    pub fn copy_out(&self, aspace: &Arc<AddressSpace>, dst: usize, src: &[u8]) -> Result<(), VmError> {
        let access = Access { write: true, user: false, esp: 0 };
        self.access_range(aspace, dst, src.len(), access, |chunk, done| {
            chunk.copy_from_slice(&src[done..done + chunk.len()])
        })
    }

    /// 内核从用户地址 `src` 复制到 `dst`。
    pub fn copy_in(&self, aspace: &Arc<AddressSpace>, dst: &mut [u8], src: usize) -> Result<(), VmError> {
        let access = Access { write: false, user: false, esp: 0 };
        let len = dst.len();
        self.access_range(aspace, src, len, access, |chunk, done| {
            dst[done..done + chunk.len()].copy_from_slice(chunk)
        })
    }

    /// 从用户地址 `src` 复制以 0 结尾的字符串，最多读取 `max` 字节。
    ///
    /// # 返回值
    /// - `Ok(Some(bytes))`：不含结尾 0 的字符串内容；
    /// - `Ok(None)`：`max` 字节内没有结尾的 0。
    pub fn copy_in_str(&self, aspace: &Arc<AddressSpace>, src: usize, max: usize) -> Result<Option<Vec<u8>>, VmError> {
        let mut bytes = Vec::new();
        let mut addr = src;
        while bytes.len() < max {
            let n = min(PGSIZE - addr % PGSIZE, max - bytes.len());
            let mut chunk = [0u8; PGSIZE];
            self.copy_in(aspace, &mut chunk[..n], addr)?;
            if let Some(end) = chunk[..n].iter().position(|&c| c == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return Ok(Some(bytes))
            }
            bytes.extend_from_slice(&chunk[..n]);
            addr += n;
        }
        Ok(None)
    }

    /// 用户程序读取 `[addr, addr + buf.len())`，`esp` 为用户栈指针。
    pub fn user_load(&self, aspace: &Arc<AddressSpace>, addr: usize, buf: &mut [u8], esp: usize) -> Result<(), VmError> {
        let access = Access { write: false, user: true, esp };
        self.access_range(aspace, addr, buf.len(), access, |chunk, done| {
            buf[done..done + chunk.len()].copy_from_slice(chunk)
        })
    }

    /// 用户程序写入 `[addr, addr + data.len())`，`esp` 为用户栈指针。
    pub fn user_store(&self, aspace: &Arc<AddressSpace>, addr: usize, data: &[u8], esp: usize) -> Result<(), VmError> {
        let access = Access { write: true, user: true, esp };
        self.access_range(aspace, addr, data.len(), access, |chunk, done| {
            chunk.copy_from_slice(&data[done..done + chunk.len()])
        })
    }

    /// # 功能说明
    /// 销毁地址空间：释放其驻留的所有页帧、解除映射、丢弃换出在外的交换槽，清空补充页表。
    pub fn destroy(&self, aspace: &AddressSpace) {
        let mut spt = aspace.spt().lock();
        let mut frames = 0;
        let mut slots = 0;
        for entry in spt.drain() {
            let upage = match user_page(entry.vaddr) {
                Ok(upage) => upage,
                Err(_) => continue,
            };
            if entry.loaded {
                if self.frames.free_frame(aspace.pid(), upage).is_some() {
                    frames += 1;
                }
                aspace.pagetable().lock().unmap(upage);
            }
            if let Some(slot) = entry.swap_slot() {
                self.swap.release(slot);
                slots += 1;
            }
        }
        debug!("vm: pid {} destroyed, {} frames and {} swap slots released", aspace.pid(), frames, slots);
    }
}
