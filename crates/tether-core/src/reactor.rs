//! 反应器句柄：所有异步 I/O 与定时器的执行场所。
//!
//! # 设计动机（Why）
//! - 核心操作均以回调返回、从不阻塞调用线程；真正的挂起点只存在于反应器内部；
//! - 调用方可能处于 Tokio 运行时之内（服务端进程），也可能处于普通线程（GUI 或测试工具），
//!   因此需要“优先复用当前运行时，否则启用进程级回退运行时”的统一入口。
//!
//! # 契约（What）
//! - [`Reactor::current`]：在 Tokio 运行时内调用时返回该运行时句柄，否则返回按
//!   [`ReactorConfig::from_env`] 构建的回退多线程运行时；
//! - 回退运行时在进程生命周期内只构建一次，构建失败会在下次调用时重试。
//!
//! # 风险提示（Trade-offs）
//! - 在 `current_thread` 运行时内发起的操作会在该运行时上执行，调用方若在同一线程同步等待结果将死锁；
//!   测试与示例应使用多线程运行时。

use std::{future::Future, io};

use parking_lot::Mutex;
use tokio::runtime::{Builder, EnterGuard, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ReactorConfig;

static FALLBACK: Mutex<Option<Runtime>> = Mutex::new(None);

/// 对 Tokio 运行时句柄的轻量封装。
#[derive(Clone, Debug)]
pub struct Reactor {
    handle: Handle,
}

impl Reactor {
    /// 以已有运行时句柄构造。
    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    /// 返回当前运行时，若不在运行时内则返回进程级回退运行时。
    pub fn current() -> io::Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self { handle });
        }
        Self::fallback()
    }

    /// 直接返回进程级回退运行时。
    pub fn fallback() -> io::Result<Self> {
        let mut slot = FALLBACK.lock();
        if let Some(runtime) = slot.as_ref() {
            return Ok(Self {
                handle: runtime.handle().clone(),
            });
        }
        let config = ReactorConfig::from_env();
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .thread_name(config.thread_name())
            .enable_all()
            .build()?;
        debug!(
            workers = config.worker_threads(),
            thread_name = config.thread_name(),
            "started fallback reactor"
        );
        let handle = runtime.handle().clone();
        *slot = Some(runtime);
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// 进入运行时上下文，供需要在构造时注册到 I/O 驱动的资源使用。
    pub fn enter(&self) -> EnterGuard<'_> {
        self.handle.enter()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }
}
