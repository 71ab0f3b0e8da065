//! 睡眠锁模块
//! 提供可长时间持有的同步原语，适用于临界区中含有块设备 I/O 的场景。
//!
//! 当锁被占用时，尝试获取锁的线程会让出处理器并重试，而不是独占内部自旋锁等待。

use core::ops::{Deref, DerefMut, Drop};
use core::cell::{Cell, UnsafeCell};
use core::hint;

use crate::spinlock::SpinLock;

/// 睡眠锁结构，提供阻塞式同步机制
///
/// 与自旋锁不同，内部自旋锁只在检查和修改`locked`状态的一瞬间持有，
/// 因此持有睡眠锁期间可以进行磁盘读写、获取其他自旋锁等较慢的操作。
///
/// # 类型参数
/// - `T`: 被保护的数据类型
///
/// # 字段说明
/// - `lock`: 内部自旋锁，保护`locked`状态的原子访问
/// - `locked`: 表示锁是否已被占用
/// - `name`: 锁的标识名称，用于调试
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性
pub struct SleepLock<T: ?Sized> {
    lock: SpinLock<()>,
    locked: Cell<bool>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// 为SleepLock实现Sync，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// 创建一个新的睡眠锁实例
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据
    /// - `name`: 锁的标识名称
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lock: SpinLock::new((), "sleeplock"),
            locked: Cell::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// 获取睡眠锁（可能阻塞当前线程）
    ///
    /// # 流程解释
    /// 1. 获取内部自旋锁保护临界区
    /// 2. 检查`locked`状态：
    ///   - 如果已锁定：释放内部锁，让出处理器后重试
    ///   - 如果未锁定：设置`locked=true`
    /// 3. 释放内部自旋锁并返回守卫
    ///
    /// # 安全性
    /// - 使用`UnsafeCell`获取数据指针，但`locked`标志保证同一时刻只有一个守卫存在
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let guard = self.lock.lock();
            if !self.locked.get() {
                self.locked.set(true);
                drop(guard);
                break;
            }
            drop(guard);
            hint::spin_loop();
        }

        SleepLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() }
        }
    }

    /// 尝试获取睡眠锁，锁已被占用时返回 `None`。
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let guard = self.lock.lock();
        if self.locked.get() {
            return None
        }
        self.locked.set(true);
        drop(guard);
        Some(SleepLockGuard {
            lock: &self,
            data: unsafe { &mut *self.data.get() }
        })
    }

    /// 锁当前是否被持有，只用于断言。
    pub fn holding(&self) -> bool {
        let _guard = self.lock.lock();
        self.locked.get()
    }

    /// 锁名称
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 释放锁（内部方法，由守卫的Drop调用）
    fn unlock(&self) {
        let guard = self.lock.lock();
        if !self.locked.get() {
            panic!("sleeplock {} unlock", self.name);
        }
        self.locked.set(false);
        drop(guard);
    }
}

/// 睡眠锁守卫，提供对受保护数据的访问
///
/// 当守卫存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁。
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SleepLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn try_lock_while_held() {
        let l = SleepLock::new(vec![1, 2, 3], "vec");
        let g = l.lock();
        assert!(l.holding());
        assert!(l.try_lock().is_none());
        drop(g);
        assert!(!l.holding());
        assert_eq!(l.try_lock().map(|g| g.len()), Some(3));
    }

    #[test]
    fn long_critical_sections_serialize() {
        let l = Arc::new(SleepLock::new(Vec::new(), "log"));
        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|id| {
                let l = Arc::clone(&l);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut g = l.lock();
                    g.push(id);
                    thread::yield_now();
                    g.push(id);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let g = l.lock();
        assert_eq!(g.len(), 6);
        for pair in g.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
