#![allow(dead_code)]

use std::sync::Arc;

use xv6_vmfs::consts::PGSIZE;
use xv6_vmfs::driver::RamDisk;
use xv6_vmfs::{Kernel, KernelConfig};

/// 文件系统盘 4 MiB
pub const FS_SECTORS: u32 = 8192;
/// 交换盘 2 MiB，即 512 个交换槽
pub const SWAP_SECTORS: u32 = 4096;

/// 测试程序的入口与数据段地址
pub const TEXT_BASE: usize = 0x0804_8000;
pub const DATA_BASE: usize = 0x0805_0000;

pub fn boot(user_frames: usize) -> Arc<Kernel> {
    let config = KernelConfig { user_frames, ..KernelConfig::default() };
    Kernel::boot(
        config,
        Arc::new(RamDisk::new("hda", FS_SECTORS)),
        Arc::new(RamDisk::new("hdb", SWAP_SECTORS)),
    )
    .unwrap()
}

/// 可重复校验的字节序列
pub fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + seed * 13) % 251) as u8).collect()
}

/// 一个可装入段：起始地址、文件中的内容、内存中的长度、是否可写
pub struct Segment<'a> {
    pub vaddr: usize,
    pub data: &'a [u8],
    pub memsz: usize,
    pub writable: bool,
}

/// 生成一个只含 `PT_LOAD` 段的 64 位 ELF 映像。
///
/// 第一页是 ELF 头与程序头表，之后每个段从新的一页开始，页内偏移与段地址相同。
pub fn elf_image(entry: usize, segments: &[Segment<'_>]) -> Vec<u8> {
    let phoff = 64;
    let mut image = vec![0u8; PGSIZE];
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // 64 位
    image[5] = 1; // 小端
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // 可执行文件
    image[18..20].copy_from_slice(&0xf3u16.to_le_bytes()); // RISC-V
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..32].copy_from_slice(&(entry as u64).to_le_bytes());
    image[32..40].copy_from_slice(&(phoff as u64).to_le_bytes());
    image[52..54].copy_from_slice(&64u16.to_le_bytes());
    image[54..56].copy_from_slice(&56u16.to_le_bytes());
    image[56..58].copy_from_slice(&(segments.len() as u16).to_le_bytes());

    for (i, seg) in segments.iter().enumerate() {
        let off = round_up(image.len()) + seg.vaddr % PGSIZE;
        let flags: u32 = if seg.writable { 4 | 2 } else { 4 | 1 };
        let ph = phoff + i * 56;
        image[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&flags.to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&(off as u64).to_le_bytes());
        image[ph + 16..ph + 24].copy_from_slice(&(seg.vaddr as u64).to_le_bytes());
        image[ph + 24..ph + 32].copy_from_slice(&(seg.vaddr as u64).to_le_bytes());
        image[ph + 32..ph + 40].copy_from_slice(&(seg.data.len() as u64).to_le_bytes());
        image[ph + 40..ph + 48].copy_from_slice(&(seg.memsz as u64).to_le_bytes());
        image[ph + 48..ph + 56].copy_from_slice(&(PGSIZE as u64).to_le_bytes());

        image.resize(off, 0);
        image.extend_from_slice(seg.data);
    }
    image
}

fn round_up(n: usize) -> usize {
    (n + PGSIZE - 1) / PGSIZE * PGSIZE
}

/// 一个最小程序：一页只读代码与 `data_len` 字节已初始化、`bss_len` 字节未初始化的数据。
pub fn simple_program(data_len: usize, bss_len: usize) -> Vec<u8> {
    let text = pattern(200, 1);
    let data = pattern(data_len, 2);
    elf_image(TEXT_BASE, &[
        Segment { vaddr: TEXT_BASE, data: &text, memsz: text.len(), writable: false },
        Segment { vaddr: DATA_BASE, data: &data, memsz: data_len + bss_len, writable: true },
    ])
}

/// 把 `image` 写入文件系统中的 `path`。
pub fn install(kernel: &Kernel, path: &str, image: &[u8]) {
    kernel.fs().create(path, 0).unwrap();
    let mut file = kernel.fs().open(path).unwrap();
    assert_eq!(file.write(image).unwrap(), image.len());
}
