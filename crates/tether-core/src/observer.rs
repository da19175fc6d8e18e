//! 线程安全的多播观察者集合。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 状态变化需要广播给任意数量的观察者，且每个观察者要求在自己的调度上下文中收到通知；
//! - 不依赖垃圾回收的弱引用语义：`add` 返回显式的 [`ObserverToken`]，调用方可确定性地注销。
//!
//! ## 逻辑 (How)
//! - 登记表由 `parking_lot::Mutex` 保护，每条登记持有观察者的 [`Weak`] 引用、其上下文与
//!   `active` 标记；
//! - 枚举时在锁内拍快照、在锁外投递：每条登记的闭包在执行前再次检查 `active` 并升级弱引用，
//!   因此注销能阻止尚未执行的投递，但不会撤回已经开始执行的回调；
//! - 观察者被释放后其登记成为死条目，在下一次 `add`/`remove`/枚举时清理。
//!
//! ## 契约 (What)
//! - 同一 `(观察者, 上下文)` 组合重复 `add` 为幂等操作，返回既有令牌；
//!   同一观察者搭配不同上下文则新增一条登记；
//! - `remove` 移除该观察者的全部登记；`remove_token` 只移除对应登记；
//! - 枚举在投递后立即返回，不等待回调执行；不同上下文之间不保证顺序，
//!   同一串行上下文内保持 FIFO。
//!
//! ## 注意事项 (Trade-offs)
//! - 观察者与上下文的身份均按指针比较，语义等价但不同实例的上下文视为不同上下文。

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::dispatch::{ContextRef, DispatchContextExt, same_context};

/// 一条登记的注销令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

struct Registration<O: ?Sized> {
    token: ObserverToken,
    observer: Weak<O>,
    context: ContextRef,
    active: AtomicBool,
}

impl<O: ?Sized> Registration<O> {
    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.observer.strong_count() > 0
    }

    fn observes(&self, observer: &Arc<O>) -> bool {
        std::ptr::addr_eq(self.observer.as_ptr(), Arc::as_ptr(observer))
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

struct Registry<O: ?Sized> {
    next_token: u64,
    entries: Vec<Arc<Registration<O>>>,
}

impl<O: ?Sized> Registry<O> {
    fn prune(&mut self) {
        self.entries.retain(|entry| entry.is_live());
    }
}

/// 线程安全的观察者集合。
pub struct ObserverSet<O: ?Sized + Send + Sync + 'static> {
    registry: Mutex<Registry<O>>,
}

impl<O: ?Sized + Send + Sync + 'static> Default for ObserverSet<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ?Sized + Send + Sync + 'static> ObserverSet<O> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_token: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// 登记 `observer`，其通知经 `context` 派发。
    pub fn add(&self, observer: &Arc<O>, context: ContextRef) -> ObserverToken {
        let mut registry = self.registry.lock();
        registry.prune();
        if let Some(existing) = registry
            .entries
            .iter()
            .find(|entry| entry.observes(observer) && same_context(&entry.context, &context))
        {
            return existing.token;
        }
        let token = ObserverToken(registry.next_token);
        registry.next_token += 1;
        registry.entries.push(Arc::new(Registration {
            token,
            observer: Arc::downgrade(observer),
            context,
            active: AtomicBool::new(true),
        }));
        token
    }

    /// 移除 `observer` 的全部登记，返回移除数量。
    pub fn remove(&self, observer: &Arc<O>) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| {
            if entry.observes(observer) {
                entry.deactivate();
                false
            } else {
                true
            }
        });
        let removed = before - registry.entries.len();
        registry.prune();
        removed
    }

    /// 按令牌移除单条登记。
    pub fn remove_token(&self, token: ObserverToken) -> bool {
        let mut registry = self.registry.lock();
        let position = registry
            .entries
            .iter()
            .position(|entry| entry.token == token);
        let removed = match position {
            Some(index) => {
                registry.entries.swap_remove(index).deactivate();
                true
            }
            None => false,
        };
        registry.prune();
        removed
    }

    /// 当前存活的登记数量。
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.is_live())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 对每条登记，经其上下文派发 `block(observer)`。
    pub fn enumerate<F>(&self, block: F)
    where
        F: Fn(&O) + Send + Sync + 'static,
    {
        let block = Arc::new(block);
        for entry in self.snapshot() {
            let block = Arc::clone(&block);
            let context = Arc::clone(&entry.context);
            context.perform_fn(move || {
                if !entry.active.load(Ordering::Acquire) {
                    return;
                }
                if let Some(observer) = entry.observer.upgrade() {
                    block(&observer);
                }
            });
        }
    }

    /// 只对具备 `capability` 的观察者派发 `block`。
    ///
    /// `capability` 将观察者投影为可选能力视图，返回 `None` 的观察者不会被派发。
    pub fn enumerate_capable<C, F>(&self, capability: fn(&O) -> Option<&C>, block: F)
    where
        C: ?Sized + 'static,
        F: Fn(&C) + Send + Sync + 'static,
    {
        let block = Arc::new(block);
        for entry in self.snapshot() {
            let Some(observer) = entry.observer.upgrade() else {
                continue;
            };
            if capability(&observer).is_none() {
                continue;
            }
            drop(observer);
            let block = Arc::clone(&block);
            let context = Arc::clone(&entry.context);
            context.perform_fn(move || {
                if !entry.active.load(Ordering::Acquire) {
                    return;
                }
                if let Some(observer) = entry.observer.upgrade()
                    && let Some(view) = capability(&observer)
                {
                    block(view);
                }
            });
        }
    }

    fn snapshot(&self) -> Vec<Arc<Registration<O>>> {
        let mut registry = self.registry.lock();
        registry.prune();
        registry.entries.clone()
    }
}

impl<O: ?Sized + Send + Sync + 'static> fmt::Debug for ObserverSet<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("registrations", &self.len())
            .finish()
    }
}
