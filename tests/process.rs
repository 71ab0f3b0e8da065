mod common;

use std::sync::Arc;

use common::{boot, install, pattern, simple_program, DATA_BASE, TEXT_BASE};
use xv6_vmfs::consts::{PGSIZE, PHYS_BASE};
use xv6_vmfs::fs::FsError;
use xv6_vmfs::mm::VmError;
use xv6_vmfs::process::{
    Process, SysError, SYS_CLOSE, SYS_CREATE, SYS_EXIT, SYS_FILESIZE, SYS_OPEN, SYS_READ,
    SYS_REMOVE, SYS_SEEK, SYS_TELL, SYS_WRITE,
};
use xv6_vmfs::Kernel;

/// 以 `num` 号系统调用陷入内核，返回 a0 的有符号值。
fn syscall(p: &mut Process, num: usize, args: &[usize]) -> isize {
    let tf = p.tf_mut();
    tf.a7 = num;
    tf.a0 = args.first().copied().unwrap_or(0);
    tf.a1 = args.get(1).copied().unwrap_or(0);
    tf.a2 = args.get(2).copied().unwrap_or(0);
    p.syscall();
    p.tf().a0 as isize
}

/// 把以 0 结尾的字符串压入用户栈，返回其地址。
fn push_str(p: &mut Process, s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    p.push(&bytes).unwrap()
}

fn read_word(p: &mut Process, addr: usize) -> usize {
    let mut raw = [0u8; 8];
    p.load(addr, &mut raw).unwrap();
    usize::from_le_bytes(raw)
}

fn read_cstr(p: &mut Process, addr: usize) -> String {
    let mut bytes = Vec::new();
    let mut c = [0u8; 1];
    loop {
        p.load(addr + bytes.len(), &mut c).unwrap();
        if c[0] == 0 {
            return String::from_utf8(bytes).unwrap()
        }
        bytes.push(c[0]);
    }
}

fn spawn(kernel: &Arc<Kernel>, cmdline: &str) -> Process {
    kernel.execute(cmdline).unwrap()
}

#[test]
fn arguments_are_laid_out_on_the_stack() {
    let kernel = boot(16);
    install(&kernel, "echo", &simple_program(100, 0));
    let mut p = spawn(&kernel, "echo  hello   world");

    assert_eq!(p.name(), "echo");
    assert_eq!(p.tf().epc, TEXT_BASE);
    assert_eq!(p.tf().a0, 3);
    assert_eq!(p.tf().a1, p.tf().sp);
    assert_eq!(p.tf().sp % 16, 0);
    assert!(p.tf().sp > PHYS_BASE - PGSIZE);

    let argv = p.tf().a1;
    let args: Vec<String> = (0..3)
        .map(|i| {
            let ptr = read_word(&mut p, argv + i * 8);
            read_cstr(&mut p, ptr)
        })
        .collect();
    assert_eq!(args, ["echo", "hello", "world"]);
    assert_eq!(read_word(&mut p, argv + 3 * 8), 0);
}

#[test]
fn segments_load_lazily_with_zeroed_bss() {
    let kernel = boot(16);
    install(&kernel, "prog", &simple_program(300, 2 * PGSIZE));
    let mut p = spawn(&kernel, "prog");
    // 只有栈页驻留
    assert_eq!(kernel.vm().frames().resident(), 1);

    let mut buf = vec![0u8; 300];
    p.load(DATA_BASE, &mut buf).unwrap();
    assert_eq!(buf, pattern(300, 2));
    let mut bss = vec![0xffu8; PGSIZE];
    p.load(DATA_BASE + PGSIZE, &mut bss).unwrap();
    assert!(bss.iter().all(|&b| b == 0));

    p.store(DATA_BASE + 2 * PGSIZE + 8, b"bss").unwrap();
    let mut back = [0u8; 3];
    p.load(DATA_BASE + 2 * PGSIZE + 8, &mut back).unwrap();
    assert_eq!(&back, b"bss");
    assert!(p.is_alive());
}

#[test]
fn writing_code_kills_the_process() {
    let kernel = boot(16);
    install(&kernel, "prog", &simple_program(16, 0));
    let mut p = spawn(&kernel, "prog");
    let pid = p.pid();

    assert_eq!(p.store(TEXT_BASE + 4, b"x"), Err(VmError::ReadOnly(TEXT_BASE + 4)));
    assert!(!p.is_alive());
    assert_eq!(p.exit_status(), Some(-1));
    assert_eq!(kernel.wait(pid), Some(-1));
    assert_eq!(kernel.console().lines(), ["prog: exit(-1)"]);
    assert_eq!(kernel.vm().frames().resident(), 0);
}

#[test]
fn stack_grows_for_pushes_but_not_wild_accesses() {
    let kernel = boot(16);
    install(&kernel, "stack", &simple_program(16, 0));
    let mut p = spawn(&kernel, "stack");

    let big = vec![7u8; 3 * PGSIZE];
    let sp = p.push(&big).unwrap();
    let mut back = vec![0u8; big.len()];
    p.load(sp, &mut back).unwrap();
    assert!(back == big);

    // 低于栈指针一页以上的访问是非法的
    let wild = p.tf().sp - PGSIZE;
    assert_eq!(p.store(wild, b"x"), Err(VmError::InvalidAccess(wild)));
    assert_eq!(p.exit_status(), Some(-1));
}

#[test]
fn file_syscalls_round_trip() {
    let kernel = boot(16);
    install(&kernel, "files", &simple_program(16, 0));
    let mut p = spawn(&kernel, "files");

    let name = push_str(&mut p, "notes");
    assert_eq!(syscall(&mut p, SYS_CREATE, &[name, 0]), 1);
    assert_eq!(syscall(&mut p, SYS_CREATE, &[name, 0]), 0);
    let fd = syscall(&mut p, SYS_OPEN, &[name]);
    assert!(fd >= 2);
    let fd = fd as usize;

    let text = pattern(5000, 3);
    let buf = p.push(&text).unwrap();
    assert_eq!(syscall(&mut p, SYS_WRITE, &[fd, buf, text.len()]), 5000);
    assert_eq!(syscall(&mut p, SYS_FILESIZE, &[fd]), 5000);
    assert_eq!(syscall(&mut p, SYS_TELL, &[fd]), 5000);

    // 读到栈上新的缓冲区
    let dst = p.push(&vec![0u8; 6000]).unwrap();
    assert_eq!(syscall(&mut p, SYS_SEEK, &[fd, 1000]), 0);
    assert_eq!(syscall(&mut p, SYS_READ, &[fd, dst, 6000]), 4000);
    let mut back = vec![0u8; 4000];
    p.load(dst, &mut back).unwrap();
    assert!(back[..] == text[1000..]);
    assert_eq!(syscall(&mut p, SYS_READ, &[fd, dst, 10]), 0);

    // 第二次打开得到不同的描述符与独立的读写位置
    let fd2 = syscall(&mut p, SYS_OPEN, &[name]) as usize;
    assert_ne!(fd2, fd);
    assert_eq!(syscall(&mut p, SYS_TELL, &[fd2]), 0);

    assert_eq!(syscall(&mut p, SYS_CLOSE, &[fd]), 0);
    assert_eq!(syscall(&mut p, SYS_CLOSE, &[fd]), -1);
    assert_eq!(syscall(&mut p, SYS_READ, &[fd, dst, 10]), -1);

    // 删除后已打开的描述符仍然可读
    assert_eq!(syscall(&mut p, SYS_REMOVE, &[name]), 1);
    assert_eq!(syscall(&mut p, SYS_OPEN, &[name]), -1);
    assert_eq!(syscall(&mut p, SYS_READ, &[fd2, dst, 100]), 100);
    assert_eq!(syscall(&mut p, SYS_REMOVE, &[name]), 0);
    assert!(p.is_alive());
}

#[test]
fn console_descriptors() {
    let kernel = boot(16);
    install(&kernel, "hello", &simple_program(16, 0));
    let mut p = spawn(&kernel, "hello");

    let msg = b"hello, world\n";
    let buf = p.push(msg).unwrap();
    assert_eq!(syscall(&mut p, SYS_WRITE, &[1, buf, msg.len()]), msg.len() as isize);
    assert_eq!(syscall(&mut p, SYS_READ, &[0, buf, msg.len()]), 0);
    assert_eq!(syscall(&mut p, SYS_READ, &[1, buf, 4]), -1);
    assert_eq!(syscall(&mut p, SYS_WRITE, &[0, buf, 4]), -1);
    assert_eq!(syscall(&mut p, SYS_CLOSE, &[0]), -1);
    assert_eq!(syscall(&mut p, SYS_WRITE, &[7, buf, 4]), -1);

    syscall(&mut p, SYS_EXIT, &[0]);
    assert_eq!(kernel.console().contents(), "hello, world\nhello: exit(0)\n");
}

#[test]
fn bad_arguments_terminate() {
    let kernel = boot(16);
    install(&kernel, "bad", &simple_program(16, 0));

    // 未映射的缓冲区
    let mut p = spawn(&kernel, "bad");
    syscall(&mut p, SYS_WRITE, &[1, 0x2000_0000, 10]);
    assert_eq!(p.exit_status(), Some(-1));

    // 空指针路径
    let mut p = spawn(&kernel, "bad");
    syscall(&mut p, SYS_OPEN, &[0]);
    assert_eq!(p.exit_status(), Some(-1));

    // 内核地址
    let mut p = spawn(&kernel, "bad");
    syscall(&mut p, SYS_CREATE, &[PHYS_BASE + 16, 0]);
    assert_eq!(p.exit_status(), Some(-1));

    // 超出范围的描述符
    let mut p = spawn(&kernel, "bad");
    let buf = p.push(b"data").unwrap();
    syscall(&mut p, SYS_WRITE, &[100_000, buf, 4]);
    assert_eq!(p.exit_status(), Some(-1));

    // 读入只读代码段
    let mut p = spawn(&kernel, "bad");
    let name = push_str(&mut p, "bad");
    let fd = syscall(&mut p, SYS_OPEN, &[name]) as usize;
    syscall(&mut p, SYS_READ, &[fd, TEXT_BASE, 16]);
    assert_eq!(p.exit_status(), Some(-1));

    // 未知的系统调用
    let mut p = spawn(&kernel, "bad");
    syscall(&mut p, 99, &[]);
    assert_eq!(p.exit_status(), Some(-1));

    assert_eq!(kernel.console().lines().len(), 6);
    assert!(kernel.console().lines().iter().all(|l| l == "bad: exit(-1)"));
    assert_eq!(kernel.vm().frames().resident(), 0);
}

#[test]
fn overlong_path_fails_softly() {
    let kernel = boot(16);
    install(&kernel, "long", &simple_program(16, 0));
    let mut p = spawn(&kernel, "long");
    let path = push_str(&mut p, &"x".repeat(300));
    assert_eq!(syscall(&mut p, SYS_CREATE, &[path, 0]), 0);
    assert_eq!(syscall(&mut p, SYS_OPEN, &[path]), -1);
    assert!(p.is_alive());
}

#[test]
fn running_executable_is_write_protected() {
    let kernel = boot(16);
    install(&kernel, "self", &simple_program(16, 0));
    let mut p = spawn(&kernel, "self");

    let mut outside = kernel.fs().open("self").unwrap();
    assert_eq!(outside.write(b"x"), Err(FsError::WriteDenied));

    let name = push_str(&mut p, "self");
    let fd = syscall(&mut p, SYS_OPEN, &[name]) as usize;
    let buf = p.push(b"patch").unwrap();
    assert_eq!(syscall(&mut p, SYS_WRITE, &[fd, buf, 5]), 0);

    syscall(&mut p, SYS_EXIT, &[3]);
    assert_eq!(kernel.wait(p.pid()), Some(3));
    assert_eq!(outside.write(b"x"), Ok(1));
}

#[test]
fn exit_releases_everything() {
    let kernel = boot(4);
    install(&kernel, "hog", &simple_program(16, 8 * PGSIZE));
    let mut p = spawn(&kernel, "hog");
    let pid = p.pid();

    // 数据页多于页帧，迫使换出
    for i in 0..8 {
        p.store(DATA_BASE + PGSIZE + i * PGSIZE, &pattern(PGSIZE, i)).unwrap();
    }
    for i in 0..8 {
        let mut back = vec![0u8; PGSIZE];
        p.load(DATA_BASE + PGSIZE + i * PGSIZE, &mut back).unwrap();
        assert!(back == pattern(PGSIZE, i), "page {}", i);
    }
    assert!(kernel.vm().swap().used_slots() > 0);

    let name = push_str(&mut p, "hog");
    syscall(&mut p, SYS_OPEN, &[name]);
    let open_before_exit = kernel.fs().open_inodes();
    syscall(&mut p, SYS_EXIT, &[57]);

    assert_eq!(p.exit_status(), Some(57));
    assert_eq!(kernel.wait(pid), Some(57));
    assert_eq!(kernel.wait(pid), None);
    assert_eq!(kernel.vm().frames().resident(), 0);
    assert_eq!(kernel.vm().swap().used_slots(), 0);
    assert!(kernel.fs().open_inodes() < open_before_exit);
    assert_eq!(kernel.console().lines(), ["hog: exit(57)"]);
}

#[test]
fn dropping_a_live_process_exits_it() {
    let kernel = boot(16);
    install(&kernel, "orphan", &simple_program(16, 0));
    let p = spawn(&kernel, "orphan");
    let pid = p.pid();
    drop(p);
    assert_eq!(kernel.wait(pid), Some(-1));
    assert_eq!(kernel.console().lines(), ["orphan: exit(-1)"]);
}

#[test]
fn failed_loads_report_errors() {
    let kernel = boot(16);
    assert_eq!(kernel.execute("missing").err(), Some(SysError::Fs(FsError::NotFound)));
    assert_eq!(kernel.execute("   ").err(), Some(SysError::BadExecutable("empty command line")));

    install(&kernel, "junk", &pattern(2000, 4));
    assert!(matches!(kernel.execute("junk"), Err(SysError::BadExecutable(_))));
    assert_eq!(kernel.vm().frames().resident(), 0);

    // 失败的装入不会留下写保护
    let mut junk = kernel.fs().open("junk").unwrap();
    assert_eq!(junk.write(b"ok"), Ok(2));
}

#[test]
fn kernel_remounts_after_shutdown() {
    use xv6_vmfs::driver::RamDisk;
    use xv6_vmfs::KernelConfig;

    let fs_dev = Arc::new(RamDisk::new("hda", common::FS_SECTORS));
    let kernel = Kernel::boot(
        KernelConfig::default(),
        fs_dev.clone(),
        Arc::new(RamDisk::new("hdb", common::SWAP_SECTORS)),
    )
    .unwrap();
    install(&kernel, "keep", &simple_program(64, 0));
    kernel.shutdown().unwrap();

    let config = KernelConfig { format: false, ..KernelConfig::default() };
    let kernel = Kernel::boot(config, fs_dev, Arc::new(RamDisk::new("hdb", common::SWAP_SECTORS))).unwrap();
    let mut p = spawn(&kernel, "keep");
    let mut buf = vec![0u8; 64];
    p.load(DATA_BASE, &mut buf).unwrap();
    assert_eq!(buf, pattern(64, 2));
}
