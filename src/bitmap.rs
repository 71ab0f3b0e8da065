//! 位图，空闲扇区表与交换槽表共用的底层结构

use alloc::vec;
use alloc::vec::Vec;

use bit_field::BitField;

/// 定长位图，第 `i` 位表示第 `i` 个单元是否被占用。
///
/// 按字节存储，最后一个字节中超出 `len` 的位永远为 0，
/// 因此可以原样写入磁盘，再由 [`Bitmap::from_bytes`] 读回。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    /// 创建一个含 `len` 位、全部清零的位图。
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; Self::byte_size(len)],
            len,
        }
    }

    /// 由磁盘上读回的字节恢复位图，`bytes` 多余的部分被忽略。
    ///
    /// # 可能的错误
    /// `bytes` 长度不足以容纳 `len` 位时 panic，说明磁盘上的位图已损坏。
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Self {
        let size = Self::byte_size(len);
        if bytes.len() < size {
            panic!("bitmap: {} bytes cannot hold {} bits", bytes.len(), len);
        }
        let mut bitmap = Self { bits: bytes[..size].to_vec(), len };
        // 清除尾部无效位
        if len % 8 != 0 {
            let last = size - 1;
            let valid = len % 8;
            let byte = &mut bitmap.bits[last];
            byte.set_bits(valid..8, 0);
        }
        bitmap
    }

    /// 位图的原始字节，用于写回磁盘。
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// 容纳 `len` 位所需的字节数。
    pub const fn byte_size(len: usize) -> usize {
        (len + 7) / 8
    }

    /// 位数
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bitmap: index {} out of {}", idx, self.len);
        self.bits[idx / 8].get_bit(idx % 8)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bitmap: index {} out of {}", idx, self.len);
        self.bits[idx / 8].set_bit(idx % 8, value);
    }

    /// 将 `[start, start + cnt)` 全部设为 `value`。
    pub fn set_multiple(&mut self, start: usize, cnt: usize, value: bool) {
        for idx in start..start + cnt {
            self.set(idx, value);
        }
    }

    /// 统计 `[start, start + cnt)` 中值为 `value` 的位数。
    pub fn count(&self, start: usize, cnt: usize, value: bool) -> usize {
        (start..start + cnt).filter(|&idx| self.test(idx) == value).count()
    }

    /// `[start, start + cnt)` 是否全部为 `value`。
    pub fn all(&self, start: usize, cnt: usize, value: bool) -> bool {
        (start..start + cnt).all(|idx| self.test(idx) == value)
    }

    /// 查找第一段长度为 `cnt`、全部为 `value` 的连续位，返回起始下标。
    ///
    /// # 流程解释
    /// 从低位向高位扫描，维护当前连续段的起点；遇到不匹配的位时把起点移到它之后。
    /// `cnt` 为 0 时直接返回 0。
    pub fn scan(&self, cnt: usize, value: bool) -> Option<usize> {
        if cnt == 0 {
            return Some(0)
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for idx in 0..self.len {
            if self.test(idx) == value {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == cnt {
                    return Some(run_start)
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    /// 查找一段长度为 `cnt`、全部为 `value` 的连续位，并将它们全部翻转。
    pub fn scan_and_flip(&mut self, cnt: usize, value: bool) -> Option<usize> {
        let start = self.scan(cnt, value)?;
        self.set_multiple(start, cnt, !value);
        Some(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_and_flip_finds_contiguous_run() {
        let mut bm = Bitmap::new(20);
        bm.set_multiple(0, 3, true);
        bm.set(5, true);
        assert_eq!(bm.scan_and_flip(2, false), Some(3));
        assert_eq!(bm.scan_and_flip(4, false), Some(6));
        assert!(bm.all(0, 10, true));
        assert_eq!(bm.count(0, 20, true), 10);
        assert_eq!(bm.scan_and_flip(11, false), None);
        assert_eq!(bm.scan_and_flip(10, false), Some(10));
    }

    #[test]
    fn bytes_survive_reload() {
        let mut bm = Bitmap::new(13);
        bm.set(0, true);
        bm.set(12, true);
        let mut raw = bm.as_bytes().to_vec();
        raw[1] |= 0xe0; // 越界的垃圾位
        let back = Bitmap::from_bytes(13, &raw);
        assert_eq!(back, bm);
    }

    #[test]
    #[should_panic]
    fn out_of_range() {
        Bitmap::new(8).test(8);
    }
}
