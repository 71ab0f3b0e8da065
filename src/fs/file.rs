//! 打开的文件，在 inode 之上维护读写位置与禁止写状态

use super::{FsError, Inode};

/// 内核中的打开文件。
///
/// 多个 `File` 可以指向同一个 inode，各自拥有独立的读写位置。
/// 调用过 [`File::deny_write`] 的文件在被丢弃时会自动重新允许写入。
pub struct File {
    inode: Inode,
    pos: usize,
    deny_write: bool,
}

impl File {
    /// 在 `inode` 上打开文件，接管该句柄。
    pub fn open(inode: Inode) -> Self {
        Self { inode, pos: 0, deny_write: false }
    }

    /// 再次打开同一个 inode，得到一个读写位置从 0 开始的新文件。
    pub fn reopen(&self) -> Self {
        Self::open(self.inode.clone())
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// 从当前位置读取，位置随之前移。
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(buf, self.pos);
        self.pos += n;
        n
    }

    /// 从 `offset` 读取，不影响当前位置。
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// 在当前位置写入，位置随之前移。
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        let n = self.inode.write_at(buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    /// 在 `offset` 写入，不影响当前位置。
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FsError> {
        self.inode.write_at(buf, offset)
    }

    /// 设置读写位置，允许超过文件末尾；之后的写入会把中间部分补零。
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// 禁止通过任何打开者写入底层 inode，直到本文件调用 [`File::allow_write`] 或被关闭。
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
