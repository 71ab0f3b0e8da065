//! 用户进程的陷阱帧
///
/// 保存用户程序陷入内核时的寄存器现场。系统调用号放在 `a7`，
/// 参数放在 `a0`~`a5`，返回值写回 `a0`。
#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct TrapFrame {
    /// 用户程序计数器（程序执行到的下一条指令地址）
    pub epc: usize,
    /// 栈指针寄存器（`sp`）
    pub sp: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
}

impl TrapFrame {
    /// 跳过 `ecall` 指令
    #[inline]
    pub fn admit_ecall(&mut self) {
        self.epc += 4;
    }
}
