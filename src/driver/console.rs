//! 控制台设备，收集用户程序与内核写往标准输出的文本

use alloc::string::String;
use alloc::vec::Vec;

use crate::spinlock::SpinLock;

/// 只写控制台，输出按行累积在内存中。
///
/// 标准输入没有数据来源，读取总是返回 0 字节。
pub struct Console {
    out: SpinLock<String>,
}

impl Console {
    pub const fn new() -> Self {
        Self { out: SpinLock::new(String::new(), "console") }
    }

    /// 写入一段字节，非 UTF-8 字节以替换字符呈现。
    ///
    /// # 返回值
    /// 写入的字节数，总是等于 `bytes.len()`。
    pub fn write(&self, bytes: &[u8]) -> usize {
        let text = String::from_utf8_lossy(bytes);
        self.out.lock().push_str(&text);
        bytes.len()
    }

    /// 写入一行文本
    pub fn puts(&self, line: &str) {
        let mut out = self.out.lock();
        out.push_str(line);
        out.push('\n');
    }

    /// 从控制台读取，当前总是得到文件结束。
    pub fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }

    /// 至今输出的全部文本
    pub fn contents(&self) -> String {
        self.out.lock().clone()
    }

    /// 按行切分的输出
    pub fn lines(&self) -> Vec<String> {
        self.out.lock().lines().map(String::from).collect()
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
