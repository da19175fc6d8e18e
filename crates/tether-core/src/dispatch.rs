//! 调度上下文：抽象“回调在哪里、以何种顺序执行”。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 栈中的每个组件（取消票据、套接字、管道、观察者集合）都通过回调报告结果；
//!   回调的执行场所与顺序决定了调用方需要承担的同步责任，因此必须显式建模；
//! - 将“执行场所”与“业务回调”解耦，使同一套 I/O 引擎既能服务 UI 线程，也能服务后台队列。
//!
//! ## 逻辑 (How)
//! - [`SerialContext`]：在反应器上运行单个排空任务，按 FIFO 顺序执行所有投递的闭包；
//! - [`ThreadContext`]：独占一个命名 OS 线程的运行循环，同样保证 FIFO；
//! - [`ConcurrentContext`]：每个闭包独立投递到阻塞线程池，不保证任何顺序；
//! - [`DirectContext`]：在调用线程上同步执行，是唯一允许“内联执行”的实现。
//!
//! ## 契约 (What)
//! - 非直接上下文的 `perform` 必须相对调度调用异步执行（从不内联），以免调度方持锁时重入死锁；
//! - 使用 [`DirectContext`] 的调用方不得在调用期间持有锁；
//! - `perform` 没有返回值，结果通过闭包捕获的共享状态或显式传入的完成值传递。
//!
//! ## 注意事项 (Trade-offs)
//! - [`SerialContext`] 在异步任务内同步执行闭包，长时间阻塞的回调会占用一个反应器工作线程；
//!   此类回调应改用 [`ThreadContext`] 或 [`ConcurrentContext`]。

use std::{
    fmt, io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, LazyLock},
    thread::{self, JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, error, warn};

use crate::reactor::Reactor;

/// 被调度的闭包。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 共享的调度上下文引用。
pub type ContextRef = Arc<dyn DispatchContext>;

/// 调度纪律。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Discipline {
    /// 所有投递按 FIFO 顺序依次执行。
    Serial,
    /// 不保证顺序，可能并行执行。
    Concurrent,
    /// 在调用线程上同步执行。
    Direct,
}

/// 回调执行场所的统一抽象。
pub trait DispatchContext: Send + Sync + fmt::Debug {
    /// 将 `task` 投递到本上下文执行。
    fn perform(&self, task: Task);

    /// 本上下文的调度纪律。
    fn discipline(&self) -> Discipline;
}

/// 为所有上下文提供免装箱的投递入口。
pub trait DispatchContextExt: DispatchContext {
    fn perform_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.perform(Box::new(f));
    }
}

impl<T: DispatchContext + ?Sized> DispatchContextExt for T {}

/// 判断两个上下文引用是否指向同一实例。
pub fn same_context(a: &ContextRef, b: &ContextRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn run_guarded(label: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!(context = label, "dispatched block panicked");
    }
}

/// 在调用线程上同步执行闭包。
#[derive(Debug, Default)]
pub struct DirectContext;

static DIRECT: LazyLock<ContextRef> = LazyLock::new(|| Arc::new(DirectContext));

impl DirectContext {
    /// 进程级共享实例。
    pub fn shared() -> ContextRef {
        Arc::clone(&DIRECT)
    }
}

impl DispatchContext for DirectContext {
    fn perform(&self, task: Task) {
        task();
    }

    fn discipline(&self) -> Discipline {
        Discipline::Direct
    }
}

/// 基于反应器任务的串行上下文。
#[derive(Clone)]
pub struct SerialContext {
    sender: UnboundedSender<Task>,
    label: Arc<str>,
}

impl SerialContext {
    /// 在当前（或回退）反应器上创建串行上下文。
    pub fn new(label: impl Into<Arc<str>>) -> io::Result<Self> {
        Ok(Self::on(&Reactor::current()?, label))
    }

    /// 在指定反应器上创建串行上下文。
    pub fn on(reactor: &Reactor, label: impl Into<Arc<str>>) -> Self {
        let label = label.into();
        let (sender, mut receiver) = unbounded_channel::<Task>();
        let task_label = Arc::clone(&label);
        reactor.spawn(async move {
            while let Some(task) = receiver.recv().await {
                run_guarded(&task_label, task);
            }
            debug!(context = %task_label, "serial context drained");
        });
        Self { sender, label }
    }

    /// 转为共享引用。
    pub fn into_ref(self) -> ContextRef {
        Arc::new(self)
    }

    /// 创建时给定的标签，出现在该上下文的日志字段中。
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialContext")
            .field("label", &self.label)
            .finish()
    }
}

impl DispatchContext for SerialContext {
    fn perform(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!(context = %self.label, "serial context reactor is gone; block dropped");
        }
    }

    fn discipline(&self) -> Discipline {
        Discipline::Serial
    }
}

/// 不保证顺序的并发上下文，闭包在反应器的阻塞线程池上执行。
#[derive(Clone, Debug)]
pub struct ConcurrentContext {
    reactor: Reactor,
}

impl ConcurrentContext {
    /// 绑定当前（或回退）反应器的阻塞线程池。
    pub fn new() -> io::Result<Self> {
        Ok(Self::on(&Reactor::current()?))
    }

    /// 绑定指定反应器的阻塞线程池。
    pub fn on(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.clone(),
        }
    }

    /// 转为共享引用。
    pub fn into_ref(self) -> ContextRef {
        Arc::new(self)
    }
}

impl DispatchContext for ConcurrentContext {
    fn perform(&self, task: Task) {
        self.reactor
            .spawn_blocking(move || run_guarded("concurrent", task));
    }

    fn discipline(&self) -> Discipline {
        Discipline::Concurrent
    }
}

/// 独占一个命名 OS 线程的运行循环上下文。
///
/// # 契约说明（What）
/// - 所有投递按 FIFO 顺序在同一线程上执行；即使在该线程内部投递，也只入队而不内联执行；
/// - [`ThreadContext::stop`] 之后的投递被丢弃并记录 `warn!`；已入队的闭包在线程退出前执行完毕；
/// - 最后一个克隆被释放时线程自行退出，不阻塞释放方。
#[derive(Clone)]
pub struct ThreadContext {
    inner: Arc<ThreadInner>,
}

struct ThreadInner {
    name: String,
    sender: Mutex<Option<UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

static DEFAULT_THREAD: Mutex<Option<ThreadContext>> = Mutex::new(None);

impl ThreadContext {
    /// 启动一个新的运行循环线程。
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = unbounded_channel::<Task>();
        let loop_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            debug!(thread = %loop_name, "run loop thread started");
            while let Some(task) = receiver.blocking_recv() {
                run_guarded(&loop_name, task);
            }
            debug!(thread = %loop_name, "run loop thread stopped");
        })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(ThreadInner {
                name,
                sender: Mutex::new(Some(sender)),
                thread: Mutex::new(Some(handle)),
                thread_id,
            }),
        })
    }

    /// 进程级默认运行循环线程，首次调用时启动；停止后的下一次调用会启动新的线程。
    pub fn default_thread() -> io::Result<Self> {
        let mut slot = DEFAULT_THREAD.lock();
        if let Some(context) = slot.as_ref() {
            return Ok(context.clone());
        }
        let context = Self::spawn("tether-runloop")?;
        *slot = Some(context.clone());
        Ok(context)
    }

    /// 运行循环线程的名称。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 当前线程是否为本上下文的运行循环线程。
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// 停止运行循环：拒绝后续投递，等待已入队闭包执行完毕后回收线程。
    ///
    /// 在运行循环线程内部调用时不会等待自身退出。
    pub fn stop(&self) {
        self.inner.sender.lock().take();
        let evicted = {
            let mut default = DEFAULT_THREAD.lock();
            let is_default = default
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(&cached.inner, &self.inner));
            if is_default { default.take() } else { None }
        };
        drop(evicted);
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle
            && !self.is_current()
            && handle.join().is_err()
        {
            error!(thread = %self.inner.name, "run loop thread panicked");
        }
    }

    /// 转为共享引用。
    pub fn into_ref(self) -> ContextRef {
        Arc::new(self)
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl DispatchContext for ThreadContext {
    fn perform(&self, task: Task) {
        let sender = self.inner.sender.lock().clone();
        match sender {
            Some(sender) if sender.send(task).is_ok() => {}
            _ => warn!(thread = %self.inner.name, "run loop thread stopped; block dropped"),
        }
    }

    fn discipline(&self) -> Discipline {
        Discipline::Serial
    }
}

/// 将一个可多次调用的回调绑定到其派发上下文。
///
/// 每次 [`Emitter::emit`] 都经上下文投递一次回调；回调本身由锁保护，
/// 因此即使上下文并发执行，同一回调也不会被重入。
pub struct Emitter<E> {
    handler: Arc<Mutex<Box<dyn FnMut(E) + Send + 'static>>>,
    context: ContextRef,
}

impl<E: Send + 'static> Emitter<E> {
    /// 绑定回调与其投递上下文。
    pub fn new(handler: Box<dyn FnMut(E) + Send + 'static>, context: ContextRef) -> Self {
        Self {
            handler: Arc::new(Mutex::new(handler)),
            context,
        }
    }

    /// 经上下文投递一次事件。
    pub fn emit(&self, event: E) {
        let handler = Arc::clone(&self.handler);
        self.context.perform_fn(move || {
            let mut handler = handler.lock();
            (*handler)(event);
        });
    }
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            context: Arc::clone(&self.context),
        }
    }
}

impl<E> fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn direct_context_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        DirectContext::shared().perform_fn(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst), "直接上下文必须同步执行");
    }

    #[test]
    fn thread_context_never_runs_inline() {
        let context = ThreadContext::spawn("inline-check").expect("spawn run loop");
        let (tx, rx) = oneshot::channel();
        let inner = context.clone();
        context.perform_fn(move || {
            let ran_inline = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&ran_inline);
            inner.perform_fn(move || flag.store(true, Ordering::SeqCst));
            let _ = tx.send(ran_inline.load(Ordering::SeqCst));
        });
        assert!(!rx.blocking_recv().expect("outer block runs"));
        context.stop();
    }

    #[test]
    fn thread_context_drops_blocks_after_stop() {
        let context = ThreadContext::spawn("stopped").expect("spawn run loop");
        context.stop();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        context.perform_fn(move || flag.store(true, Ordering::SeqCst));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_context_runs_off_caller_stack() {
        let context = ConcurrentContext::new().expect("reactor").into_ref();
        assert_eq!(context.discipline(), Discipline::Concurrent);

        let caller = thread::current().id();
        let (tx, rx) = oneshot::channel();
        context.perform_fn(move || {
            let _ = tx.send(thread::current().id());
        });
        let worker = rx.await.expect("block runs");
        assert_ne!(worker, caller, "并发上下文必须在阻塞线程池上执行闭包，而不是在调用栈内");
    }

    #[test]
    fn each_context_reports_its_discipline() {
        assert_eq!(DirectContext::shared().discipline(), Discipline::Direct);
        let context = ThreadContext::spawn("discipline").expect("spawn run loop");
        assert_eq!(context.discipline(), Discipline::Serial);
        context.stop();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let reactor = Reactor::from_handle(runtime.handle().clone());
        assert_eq!(SerialContext::on(&reactor, "serial").discipline(), Discipline::Serial);
        assert_eq!(ConcurrentContext::on(&reactor).discipline(), Discipline::Concurrent);
    }

    #[test]
    fn default_thread_restarts_after_stop() {
        let first = ThreadContext::default_thread().expect("default run loop");
        first.stop();

        let second = ThreadContext::default_thread().expect("default run loop");
        let (tx, rx) = oneshot::channel();
        second.perform_fn(move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        });
        let name = rx.blocking_recv().expect("停止后的默认运行循环必须被替换为可用的线程");
        assert_eq!(name.as_deref(), Some("tether-runloop"));
    }

    #[test]
    fn same_context_compares_identity() {
        let a = DirectContext::shared();
        let b = DirectContext::shared();
        let c: ContextRef = Arc::new(DirectContext);
        assert!(same_context(&a, &b));
        assert!(!same_context(&a, &c));
    }
}
