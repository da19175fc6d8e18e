//! 协作式、一次性取消票据。
//!
//! # 设计背景（Why）
//! - 建连、读写等长时操作需要能被外部打断，但打断只能阻止“尚未报告的成功结果”，
//!   不能回滚已经发生的副作用；
//! - 仅有原子位的取消令牌需要调用方轮询；票据额外提供回调注册，让 I/O 引擎在取消瞬间得到通知。
//!
//! # 逻辑解析（How）
//! - [`CancelTicketSource`] 持有写权限，[`CancelTicket`] 是只读视图，二者共享同一 `TicketState`；
//! - 取消标记使用 [`AtomicBool`] 以便无锁读取；原因与待触发回调放在同一把锁内，
//!   使“注册回调”与“触发取消”两条路径线性化：回调要么被取出触发，要么在注册时发现已取消而立即触发；
//! - 回调在锁外派发，避免回调内部再次访问票据时重入死锁。
//!
//! # 契约说明（What）
//! - 票据从“未取消”迁移到“已取消”恰好一次，首个原因永久生效；
//! - 已取消后注册的回调以原始原因立即派发（经给定上下文，未给定时在注册线程同步执行）；
//! - 任一回调至多执行一次；与取消并发注册的回调既不会丢失也不会重复执行。
//!
//! # 设计取舍与风险（Trade-offs）
//! - 回调不可注销：长生命周期的父票据会累积链接回调；I/O 引擎内部改用 [`CancelTicket::cancelled`]
//!   等待，不向票据追加回调。

use std::{
    fmt, mem,
    pin::pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::{
    dispatch::{ContextRef, DispatchContextExt},
    reactor::Reactor,
};

/// 取消原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// 调用方显式请求取消。
    Requested,
    /// 超时到期。
    Timeout,
}

type Handler = Box<dyn FnOnce(CancelReason) + Send + 'static>;

struct PendingHandler {
    handler: Handler,
    context: Option<ContextRef>,
}

impl PendingHandler {
    fn fire(self, reason: CancelReason) {
        let handler = self.handler;
        match self.context {
            Some(context) => context.perform_fn(move || handler(reason)),
            None => handler(reason),
        }
    }
}

#[derive(Default)]
struct TicketInner {
    reason: Option<CancelReason>,
    handlers: Vec<PendingHandler>,
}

#[derive(Default)]
struct TicketState {
    cancelled: AtomicBool,
    inner: Mutex<TicketInner>,
    notify: Notify,
}

impl TicketState {
    fn cancel(&self, reason: CancelReason) -> bool {
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.reason.is_some() {
                return false;
            }
            inner.reason = Some(reason);
            self.cancelled.store(true, Ordering::Release);
            mem::take(&mut inner.handlers)
        };
        self.notify.notify_waiters();
        debug!(?reason, handlers = handlers.len(), "cancel ticket fired");
        for pending in handlers {
            pending.fire(reason);
        }
        true
    }

    fn add(&self, pending: PendingHandler) {
        let reason = {
            let mut inner = self.inner.lock();
            match inner.reason {
                Some(reason) => reason,
                None => {
                    inner.handlers.push(pending);
                    return;
                }
            }
        };
        pending.fire(reason);
    }
}

/// 取消状态的只读视图。
///
/// 克隆共享同一状态；票据可以比其 [`CancelTicketSource`] 活得更久。
#[derive(Clone)]
pub struct CancelTicket {
    state: Arc<TicketState>,
}

impl CancelTicket {
    /// 永不取消的票据，供没有取消来源的调用方使用。
    pub fn never() -> Self {
        Self {
            state: Arc::new(TicketState::default()),
        }
    }

    /// 无锁读取取消标记。
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// 生效的取消原因；未取消时为 `None`。
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.state.inner.lock().reason
    }

    /// 注册取消回调；取消时在触发取消的线程上同步执行。
    ///
    /// 若票据已取消，回调在本次调用内以原始原因立即执行。
    pub fn add_cancel_handler<F>(&self, handler: F)
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        self.state.add(PendingHandler {
            handler: Box::new(handler),
            context: None,
        });
    }

    /// 注册取消回调，并经 `context` 派发。
    pub fn add_cancel_handler_on<F>(&self, handler: F, context: ContextRef)
    where
        F: FnOnce(CancelReason) + Send + 'static,
    {
        self.state.add(PendingHandler {
            handler: Box::new(handler),
            context: Some(context),
        });
    }

    /// 等待取消并返回原因；已取消时立即完成。
    ///
    /// 等待本身不向票据注册回调，可在循环中反复调用而不累积状态。
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let mut notified = pin!(self.state.notify.notified());
            notified.as_mut().enable();
            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelTicket")
            .field("reason", &self.reason())
            .finish()
    }
}

/// 一张取消票据的持有者。
pub struct CancelTicketSource {
    state: Arc<TicketState>,
}

impl Default for CancelTicketSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelTicketSource {
    /// 创建处于“未取消”状态的来源。
    pub fn new() -> Self {
        Self {
            state: Arc::new(TicketState::default()),
        }
    }

    /// 创建在 `timeout` 后以 [`CancelReason::Timeout`] 自动取消的来源。
    pub fn with_timeout(timeout: Duration) -> Self {
        let source = Self::new();
        source.cancel_after(timeout);
        source
    }

    /// 创建链接到一组票据的来源：任一票据取消时，以该票据的原因取消自身。
    ///
    /// 已取消的链接票据会立即传播；多张同时已取消时，以迭代顺序中的第一张为准。
    pub fn linked<I>(tickets: I) -> Self
    where
        I: IntoIterator<Item = CancelTicket>,
    {
        let source = Self::new();
        for ticket in tickets {
            let weak: Weak<TicketState> = Arc::downgrade(&source.state);
            ticket.add_cancel_handler(move |reason| {
                if let Some(state) = weak.upgrade() {
                    state.cancel(reason);
                }
            });
        }
        source
    }

    /// 以 [`CancelReason::Requested`] 取消；仅首次调用生效。
    ///
    /// 返回 `true` 表示本次调用触发了取消。
    pub fn cancel(&self) -> bool {
        self.state.cancel(CancelReason::Requested)
    }

    /// 在 `interval` 后以 [`CancelReason::Timeout`] 取消，除非在此之前已被取消。
    ///
    /// 定时器在当前（或回退）反应器上运行，只持有弱引用：票据与来源都被释放后定时器空转结束。
    pub fn cancel_after(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.state);
        match Reactor::current() {
            Ok(reactor) => {
                reactor.spawn(async move {
                    tokio::time::sleep(interval).await;
                    if let Some(state) = weak.upgrade() {
                        state.cancel(CancelReason::Timeout);
                    }
                });
            }
            Err(err) => error!(
                error = %err,
                interval_ms = interval.as_millis() as u64,
                "no reactor available; cancel timeout not armed"
            ),
        }
    }

    /// 本来源的票据。
    pub fn ticket(&self) -> CancelTicket {
        CancelTicket {
            state: Arc::clone(&self.state),
        }
    }

    /// 本来源是否已被取消（无论由谁触发）。
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for CancelTicketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelTicketSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handler_runs_once_with_first_reason() {
        let source = CancelTicketSource::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        source.ticket().add_cancel_handler(move |reason| {
            assert_eq!(reason, CancelReason::Requested);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(source.cancel());
        assert!(!source.cancel(), "重复取消必须返回 false");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_ticket_stays_pending() {
        let ticket = CancelTicket::never();
        assert!(!ticket.is_cancelled());
        assert_eq!(ticket.reason(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_future_resolves_with_reason() {
        let source = CancelTicketSource::new();
        let ticket = source.ticket();
        let waiter = tokio::spawn(async move { ticket.cancelled().await });
        tokio::task::yield_now().await;
        source.cancel();
        assert_eq!(waiter.await.expect("waiter"), CancelReason::Requested);
    }
}
