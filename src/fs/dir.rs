//! 目录层：目录项的查找、添加与删除，以及从根目录出发的路径解析

use alloc::string::String;
use alloc::sync::Arc;
use core::mem;

use crate::consts::fs::{MAX_DIR_SIZE, ROOT_DIR_SECTOR};

use super::{FsCore, FsError, Inode};

/// 磁盘上的目录项。
///
/// 目录文件就是若干个定长目录项的数组，`in_use` 为 0 的项可以被复用。
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// 目标 inode 所在扇区
    pub sector: u32,
    /// 以 0 结尾的名称
    name: [u8; MAX_DIR_SIZE + 1],
    in_use: u8,
}

/// 目录项在磁盘上的大小
const ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

impl DirEntry {
    const fn empty() -> Self {
        Self { sector: 0, name: [0; MAX_DIR_SIZE + 1], in_use: 0 }
    }

    fn new(name: &str, sector: u32) -> Self {
        let mut entry = Self::empty();
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.sector = sector;
        entry.in_use = 1;
        entry
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(MAX_DIR_SIZE);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut raw = [0u8; ENTRY_SIZE];
        raw[..4].copy_from_slice(&self.sector.to_le_bytes());
        raw[4..4 + MAX_DIR_SIZE + 1].copy_from_slice(&self.name);
        raw[ENTRY_SIZE - 1] = self.in_use;
        raw
    }

    fn decode(raw: &[u8; ENTRY_SIZE]) -> Self {
        let mut entry = Self::empty();
        entry.sector = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        entry.name.copy_from_slice(&raw[4..4 + MAX_DIR_SIZE + 1]);
        entry.in_use = raw[ENTRY_SIZE - 1];
        entry
    }
}

/// 检查目录项名称是否合法。
fn check_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidName)
    }
    if name.len() > MAX_DIR_SIZE {
        return Err(FsError::NameTooLong)
    }
    Ok(())
}

/// 打开的目录，附带 [`Dir::readdir`] 使用的读取位置。
pub struct Dir {
    inode: Inode,
    pos: usize,
}

impl Dir {
    /// 在扇区 `sector` 上创建一个可容纳 `entry_cnt` 个目录项的空目录。
    pub fn create(core: &FsCore, sector: u32, entry_cnt: usize) -> Result<(), FsError> {
        Inode::create(core, sector, entry_cnt * ENTRY_SIZE, true)
    }

    /// 以目录方式打开 `inode`。
    ///
    /// # 可能的错误
    /// `inode` 不是目录时返回 [`FsError::NotADirectory`]。
    pub fn open(inode: Inode) -> Result<Self, FsError> {
        if !inode.is_dir() {
            return Err(FsError::NotADirectory)
        }
        Ok(Self { inode, pos: 0 })
    }

    pub fn open_root(core: &Arc<FsCore>) -> Result<Self, FsError> {
        Self::open(Inode::open(core, ROOT_DIR_SECTOR))
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// 查找名为 `name` 的目录项，返回其内容与在目录文件中的偏移。
    fn find(&self, name: &str) -> Option<(DirEntry, usize)> {
        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            let entry = DirEntry::decode(&raw);
            if entry.in_use() && entry.name() == name {
                return Some((entry, ofs))
            }
            ofs += ENTRY_SIZE;
        }
        None
    }

    /// 查找名为 `name` 的目录项并打开它指向的 inode。
    pub fn lookup(&self, name: &str) -> Option<Inode> {
        let (entry, _) = self.find(name)?;
        Some(Inode::open(self.inode.core(), entry.sector))
    }

    /// 加入一个名为 `name`、指向扇区 `sector` 的目录项。
    ///
    /// # 流程解释
    /// 1. 检查名称是否合法、是否已经存在；
    /// 2. 找到第一个空闲目录项，没有则追加到目录末尾（目录文件随之扩展）；
    /// 3. 写入新目录项。
    ///
    /// # 可能的错误
    /// - [`FsError::InvalidName`] / [`FsError::NameTooLong`]：名称不合法；
    /// - [`FsError::Exists`]：同名目录项已存在；
    /// - [`FsError::NoSpace`]：目录文件无法扩展。
    pub fn add(&self, name: &str, sector: u32) -> Result<(), FsError> {
        check_name(name)?;
        if self.find(name).is_some() {
            return Err(FsError::Exists)
        }

        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            if !DirEntry::decode(&raw).in_use() {
                break;
            }
            ofs += ENTRY_SIZE;
        }

        let entry = DirEntry::new(name, sector);
        self.inode.write_at(&entry.encode(), ofs)?;
        Ok(())
    }

    /// 删除名为 `name` 的目录项，并将其 inode 标记为已删除。
    ///
    /// # 可能的错误
    /// - [`FsError::InvalidName`]：不能删除 `.` 与 `..`；
    /// - [`FsError::NotFound`]：目录项不存在；
    /// - [`FsError::DirNotEmpty`]：目标是非空目录。
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidName)
        }
        let (mut entry, ofs) = self.find(name).ok_or(FsError::NotFound)?;
        let inode = Inode::open(self.inode.core(), entry.sector);
        if inode.is_dir() {
            let dir = Dir::open(inode.clone())?;
            if !dir.is_empty() {
                return Err(FsError::DirNotEmpty)
            }
        }

        entry.in_use = 0;
        self.inode.write_at(&entry.encode(), ofs)?;
        inode.remove();
        Ok(())
    }

    /// 依次返回下一个在用目录项的名称，跳过 `.` 与 `..`。
    pub fn readdir(&mut self) -> Option<String> {
        let mut raw = [0u8; ENTRY_SIZE];
        while self.inode.read_at(&mut raw, self.pos) == ENTRY_SIZE {
            self.pos += ENTRY_SIZE;
            let entry = DirEntry::decode(&raw);
            if entry.in_use() && entry.name() != "." && entry.name() != ".." {
                return Some(String::from(entry.name()))
            }
        }
        None
    }

    /// 除 `.` 与 `..` 外没有在用的目录项
    pub fn is_empty(&self) -> bool {
        let mut raw = [0u8; ENTRY_SIZE];
        let mut ofs = 0;
        while self.inode.read_at(&mut raw, ofs) == ENTRY_SIZE {
            let entry = DirEntry::decode(&raw);
            if entry.in_use() && entry.name() != "." && entry.name() != ".." {
                return false
            }
            ofs += ENTRY_SIZE;
        }
        true
    }
}

/// 从根目录出发解析 `path`，返回它指向的 inode。
pub(super) fn resolve(core: &Arc<FsCore>, path: &str) -> Result<Inode, FsError> {
    let mut cur = Inode::open(core, ROOT_DIR_SECTOR);
    for name in path.split('/').filter(|s| !s.is_empty()) {
        check_name(name)?;
        let dir = Dir::open(cur)?;
        cur = dir.lookup(name).ok_or(FsError::NotFound)?;
    }
    Ok(cur)
}

/// 解析 `path` 的父目录，返回父目录与最后一个路径分量。
///
/// # 可能的错误
/// 路径没有任何分量（如 `""` 或 `"/"`）时返回 [`FsError::InvalidName`]。
pub(super) fn resolve_parent<'a>(core: &Arc<FsCore>, path: &'a str) -> Result<(Dir, &'a str), FsError> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    };
    check_name(name)?;
    let dir = Dir::open(resolve(core, parent)?)?;
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RamDisk;
    use crate::fs::FileSystem;

    #[test]
    fn entry_layout() {
        assert_eq!(ENTRY_SIZE, 20);
        let e = DirEntry::new("fourteen-chars", 9);
        let back = DirEntry::decode(&e.encode());
        assert_eq!(back, e);
        assert_eq!(back.name(), "fourteen-chars");
    }

    #[test]
    fn names_are_checked() {
        assert_eq!(check_name(""), Err(FsError::InvalidName));
        assert_eq!(check_name("a/b"), Err(FsError::InvalidName));
        assert_eq!(check_name("fifteen-chars.."), Err(FsError::NameTooLong));
        assert_eq!(check_name("ok"), Ok(()));
    }

    #[test]
    fn add_lookup_remove_reuses_slots() {
        let fs = FileSystem::format(Arc::new(RamDisk::new("hda", 256))).unwrap();
        fs.create("a", 0).unwrap();
        fs.create("b", 0).unwrap();
        let root = fs.open_dir("/").unwrap();
        let len = root.inode().length();
        assert!(root.lookup("a").is_some());
        assert_eq!(root.add("a", 40), Err(FsError::Exists));

        fs.remove("a").unwrap();
        assert!(root.lookup("a").is_none());
        fs.create("c", 0).unwrap();
        assert_eq!(root.inode().length(), len);
        assert_eq!(root.remove("."), Err(FsError::InvalidName));
    }

    #[test]
    fn readdir_skips_dot_entries() {
        let fs = FileSystem::format(Arc::new(RamDisk::new("hda", 256))).unwrap();
        fs.create_dir("d").unwrap();
        fs.create("d/x", 1).unwrap();
        fs.create("/d/y", 1).unwrap();
        let mut dir = fs.open_dir("d").unwrap();
        let mut names = vec![];
        while let Some(name) = dir.readdir() {
            names.push(name);
        }
        assert_eq!(names, ["x", "y"]);
        assert_eq!(fs.remove("d"), Err(FsError::DirNotEmpty));
        fs.remove("d/x").unwrap();
        fs.remove("d/y").unwrap();
        fs.remove("d").unwrap();
        assert_eq!(fs.open("d").err(), Some(FsError::NotFound));
    }

    #[test]
    fn parent_resolution() {
        let fs = FileSystem::format(Arc::new(RamDisk::new("hda", 256))).unwrap();
        assert_eq!(fs.create("/", 0), Err(FsError::InvalidName));
        assert_eq!(fs.create("missing/f", 0), Err(FsError::NotFound));
        fs.create("f", 0).unwrap();
        assert_eq!(fs.create("f/g", 0), Err(FsError::NotADirectory));
        assert_eq!(fs.create("f", 0), Err(FsError::Exists));
    }
}
