//! 类型状态套接字：`Socket → BoundSocket → ListenSocket/AcceptSocket`，或经 `Connecting` 到 `ConnectedSocket`。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 套接字生命周期严格单调前进；以不同类型表达每个阶段，使“未绑定就监听”“重复绑定”
//!   在编译期即不可表达；
//! - 建连与接受连接是长时操作，必须能被取消票据或 `close` 打断，且结果只经调用方指定的
//!   [`DispatchContext`](tether_core::dispatch::DispatchContext) 交付。
//!
//! ## 逻辑 (How)
//! - 描述符由 [`AddressFamily::create_socket`] 创建，依次应用选项、切换为非阻塞；
//! - 监听与已连接描述符注册为 `tokio::io::unix::AsyncFd`，接受循环与建连在套接字记住的
//!   [`Reactor`] 上运行；
//! - 每个可关闭阶段持有一个 [`CancelTicketSource`] 作为关闭信号，挂起操作在 `select!` 中
//!   以“取消 → 关闭 → I/O”的固定优先级竞争。
//!
//! ## 契约 (What)
//! - `close` 在任何阶段均可调用且幂等，并释放该阶段的描述符；挂起的接受循环以 `Closed` 错误完成，挂起的建连以
//!   `Closed` 完成，已连接套接字的管道随之关闭；
//! - 建连回调恰好触发一次；票据在建连完成前取消时回调收到 `Cancelled`；成功回调一旦投递，
//!   取消不再产生任何效果；
//! - 接受错误逐次报告，不终止接受循环。
//!
//! ## 注意事项 (Trade-offs)
//! - 取消与建连在同一次轮询中同时就绪时取消获胜，新建立的连接随即被关闭；
//! - 同一监听套接字可派生多个接受控制器，但它们竞争同一个描述符，不增加吞吐。

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{SockAddr, Socket as RawSocket};
use tether_core::{
    cancel::{CancelTicket, CancelTicketSource},
    config::PipeConfig,
    dispatch::{ContextRef, DispatchContextExt, Emitter},
    error::{SocketError, SocketErrorKind},
    pipe::{PipeSink, PipeSource, StreamSink, StreamSource, SymmetricPipe},
    reactor::Reactor,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace, warn};

use crate::{
    address::SocketAddress,
    family::SocketType,
    option::{SocketOption, read_option},
    stream::SocketStream,
};

/// 持续失败（如描述符耗尽）时两次接受尝试之间的间隔。
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// 建连或接受的结果。
pub type SocketResult = Result<ConnectedSocket, SocketError>;

/// 已连接套接字上的双向管道。
pub type SocketPipe = SymmetricPipe<StreamSource<SocketStream>, StreamSink<SocketStream>>;

fn local_address_of(socket: &RawSocket) -> Result<SocketAddress, SocketError> {
    let addr = socket
        .local_addr()
        .map_err(|err| SocketError::from_io(SocketErrorKind::FetchLocalAddress, err))?;
    SocketAddress::from_sock_addr(&addr).ok_or_else(|| {
        SocketError::from_io(
            SocketErrorKind::FetchLocalAddress,
            io::Error::from(io::ErrorKind::Unsupported),
        )
    })
}

fn peer_address_of(socket: &RawSocket) -> Result<SocketAddress, SocketError> {
    let addr = socket
        .peer_addr()
        .map_err(|err| SocketError::from_io(SocketErrorKind::FetchPeerAddress, err))?;
    SocketAddress::from_sock_addr(&addr).ok_or_else(|| {
        SocketError::from_io(
            SocketErrorKind::FetchPeerAddress,
            io::Error::from(io::ErrorKind::Unsupported),
        )
    })
}

fn register(socket: RawSocket, reactor: &Reactor) -> io::Result<AsyncFd<RawSocket>> {
    socket.set_nonblocking(true)?;
    let _enter = reactor.enter();
    AsyncFd::new(socket)
}

/// 未绑定的套接字：选项列表与其所属反应器。
///
/// 描述符在 `bind` 或 `connect` 时才创建，地址族取自目标地址。
pub struct Socket {
    options: Vec<SocketOption>,
    reactor: Reactor,
    pipe_config: PipeConfig,
    closed: AtomicBool,
}

impl Socket {
    /// 在当前（或回退）反应器上创建。
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_reactor(Reactor::current()?))
    }

    pub fn with_reactor(reactor: Reactor) -> Self {
        Self {
            options: Vec::new(),
            reactor,
            pipe_config: PipeConfig::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// 以 `options` 替换选项列表。
    pub fn with_options(mut self, options: impl IntoIterator<Item = SocketOption>) -> Self {
        self.options = options.into_iter().collect();
        self
    }

    /// 在选项列表末尾追加一条。
    pub fn appending_option(mut self, option: SocketOption) -> Self {
        self.options.push(option);
        self
    }

    /// 已连接后创建管道时使用的块大小。
    pub fn with_pipe_config(mut self, pipe_config: PipeConfig) -> Self {
        self.pipe_config = pipe_config;
        self
    }

    pub fn options(&self) -> &[SocketOption] {
        &self.options
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// 绑定到 `address`。
    pub fn bind(
        self,
        address: &SocketAddress,
        ty: SocketType,
    ) -> Result<BoundSocket, SocketError> {
        let descriptor = self.bound_descriptor(address, ty)?;
        Ok(BoundSocket::from_parts(descriptor, self.reactor, self.pipe_config))
    }

    /// 以新描述符连接 `address`，回调恰好触发一次。
    pub fn connect<F>(
        self,
        address: &SocketAddress,
        ty: SocketType,
        ticket: &CancelTicket,
        context: ContextRef,
        handler: F,
    ) -> Connecting
    where
        F: FnOnce(SocketResult) + Send + 'static,
    {
        let prepared = self.ensure_open().and_then(|()| self.prepare(address, ty));
        spawn_connect(
            prepared,
            address,
            &self.reactor,
            self.pipe_config,
            ticket.clone(),
            context,
            handler,
        )
    }

    /// 关闭；之后的 `bind`/`connect` 以 `Closed` 失败。
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!("unbound socket closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SocketError> {
        if self.is_closed() {
            Err(SocketError::closed())
        } else {
            Ok(())
        }
    }

    fn prepare(&self, address: &SocketAddress, ty: SocketType) -> Result<RawSocket, SocketError> {
        let socket = address.family().create_socket(ty)?;
        for option in &self.options {
            option.apply(&socket)?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|err| SocketError::from_io(SocketErrorKind::Create, err))?;
        Ok(socket)
    }

    pub(crate) fn bound_descriptor(
        &self,
        address: &SocketAddress,
        ty: SocketType,
    ) -> Result<RawSocket, SocketError> {
        self.ensure_open()?;
        let socket = self.prepare(address, ty)?;
        let target = address
            .to_sock_addr()
            .map_err(|err| SocketError::from_io(SocketErrorKind::Bind, err))?;
        socket
            .bind(&target)
            .map_err(|err| SocketError::from_io(SocketErrorKind::Bind, err))?;
        debug!(%address, "socket bound");
        Ok(socket)
    }

    pub(crate) fn pipe_config(&self) -> PipeConfig {
        self.pipe_config
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 已绑定本地地址的套接字。
pub struct BoundSocket {
    descriptor: Mutex<Option<RawSocket>>,
    reactor: Reactor,
    pipe_config: PipeConfig,
}

impl BoundSocket {
    pub(crate) fn from_parts(
        descriptor: RawSocket,
        reactor: Reactor,
        pipe_config: PipeConfig,
    ) -> Self {
        Self {
            descriptor: Mutex::new(Some(descriptor)),
            reactor,
            pipe_config,
        }
    }

    fn with_descriptor<T>(
        &self,
        f: impl FnOnce(&RawSocket) -> Result<T, SocketError>,
    ) -> Result<T, SocketError> {
        match self.descriptor.lock().as_ref() {
            Some(socket) => f(socket),
            None => Err(SocketError::closed()),
        }
    }

    pub fn local_address(&self) -> Result<SocketAddress, SocketError> {
        self.with_descriptor(local_address_of)
    }

    /// 未连接的套接字通常以 `ENOTCONN` 失败。
    pub fn peer_address(&self) -> Result<SocketAddress, SocketError> {
        self.with_descriptor(peer_address_of)
    }

    pub fn get_option(&self, level: i32, name: i32) -> Result<Bytes, SocketError> {
        self.with_descriptor(|socket| read_option(socket, level, name))
    }

    /// 开始监听入站连接。
    pub fn listen(self, backlog: i32) -> Result<ListenSocket, SocketError> {
        self.listen_in_place(backlog)
    }

    /// 以已绑定的描述符连接 `address`，回调恰好触发一次。
    pub fn connect<F>(
        self,
        address: &SocketAddress,
        ticket: &CancelTicket,
        context: ContextRef,
        handler: F,
    ) -> Connecting
    where
        F: FnOnce(SocketResult) + Send + 'static,
    {
        self.connect_in_place(address, ticket, context, handler)
    }

    /// 关闭并释放描述符；幂等。
    pub fn close(&self) {
        if self.descriptor.lock().take().is_some() {
            trace!("bound socket closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.descriptor.lock().is_none()
    }

    pub(crate) fn listen_in_place(&self, backlog: i32) -> Result<ListenSocket, SocketError> {
        let mut slot = self.descriptor.lock();
        let socket = slot.take().ok_or_else(SocketError::closed)?;
        if let Err(err) = socket.listen(backlog) {
            *slot = Some(socket);
            return Err(SocketError::from_io(SocketErrorKind::Listen, err));
        }
        let local = local_address_of(&socket).ok();
        let fd = register(socket, &self.reactor)
            .map_err(|err| SocketError::from_io(SocketErrorKind::Listen, err))?;
        debug!(address = ?local, backlog, "socket listening");
        Ok(ListenSocket {
            shared: Arc::new(ListenShared {
                fd: Mutex::new(Some(Arc::new(fd))),
                closer: CancelTicketSource::new(),
                reactor: self.reactor.clone(),
                pipe_config: self.pipe_config,
            }),
        })
    }

    pub(crate) fn connect_in_place<F>(
        &self,
        address: &SocketAddress,
        ticket: &CancelTicket,
        context: ContextRef,
        handler: F,
    ) -> Connecting
    where
        F: FnOnce(SocketResult) + Send + 'static,
    {
        let prepared = self.descriptor.lock().take().ok_or_else(SocketError::closed);
        spawn_connect(
            prepared,
            address,
            &self.reactor,
            self.pipe_config,
            ticket.clone(),
            context,
            handler,
        )
    }
}

impl fmt::Debug for BoundSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundSocket")
            .field("local", &self.local_address().ok())
            .finish()
    }
}

/// 挂起建连的控制器。
///
/// 关闭控制器会让尚未完成的建连以 `Closed` 完成；已完成的建连不受影响。
#[derive(Debug)]
pub struct Connecting {
    closer: CancelTicketSource,
}

impl Connecting {
    /// 中止尚未完成的建连；幂等。
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

fn spawn_connect<F>(
    prepared: Result<RawSocket, SocketError>,
    address: &SocketAddress,
    reactor: &Reactor,
    pipe_config: PipeConfig,
    ticket: CancelTicket,
    context: ContextRef,
    handler: F,
) -> Connecting
where
    F: FnOnce(SocketResult) + Send + 'static,
{
    let closer = CancelTicketSource::new();
    let closed = closer.ticket();
    let target = address.clone();
    let task_reactor = reactor.clone();
    reactor.spawn(async move {
        let outcome = match prepared {
            Ok(socket) => {
                tokio::select! {
                    biased;
                    _ = ticket.cancelled() => Err(SocketError::cancelled()),
                    _ = closed.cancelled() => Err(SocketError::closed()),
                    outcome = establish(socket, &target, &task_reactor, pipe_config) => outcome,
                }
            }
            Err(err) => Err(err),
        };
        match &outcome {
            Ok(_) => debug!(peer = %target, "socket connected"),
            Err(err) => debug!(peer = %target, error = %err, "socket connect failed"),
        }
        context.perform_fn(move || handler(outcome));
    });
    Connecting { closer }
}

async fn establish(
    socket: RawSocket,
    target: &SocketAddress,
    reactor: &Reactor,
    pipe_config: PipeConfig,
) -> SocketResult {
    let failed = |err: io::Error| SocketError::from_io(SocketErrorKind::Connect, err);
    let target: SockAddr = target.to_sock_addr().map_err(failed)?;
    let pending = match socket.connect(&target) {
        Ok(()) => false,
        Err(err) if connect_in_progress(&err) => true,
        Err(err) => return Err(failed(err)),
    };
    let fd = register(socket, reactor).map_err(failed)?;
    if pending {
        wait_connected(&fd).await.map_err(failed)?;
    }
    Ok(ConnectedSocket::from_fd(fd, reactor.clone(), pipe_config))
}

/// 非阻塞建连被内核接受但尚未完成；被信号打断的建连同样在后台继续。
fn connect_in_progress(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINPROGRESS | libc::EINTR))
}

async fn wait_connected(fd: &AsyncFd<RawSocket>) -> io::Result<()> {
    loop {
        let mut guard = fd.writable().await?;
        if let Some(err) = fd.get_ref().take_error()? {
            return Err(err);
        }
        match fd.get_ref().peer_addr() {
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => guard.clear_ready(),
            Err(err) => return Err(err),
        }
    }
}

/// 监听描述符槽位；关闭时取出，接受循环在每轮迭代前重新借出。
struct ListenShared {
    fd: Mutex<Option<Arc<AsyncFd<RawSocket>>>>,
    closer: CancelTicketSource,
    reactor: Reactor,
    pipe_config: PipeConfig,
}

impl ListenShared {
    fn descriptor(&self) -> Result<Arc<AsyncFd<RawSocket>>, SocketError> {
        descriptor_of(&self.fd, &self.closer)
    }
}

/// 处于监听状态的套接字；克隆共享同一描述符。
#[derive(Clone)]
pub struct ListenSocket {
    shared: Arc<ListenShared>,
}

impl ListenSocket {
    pub fn local_address(&self) -> Result<SocketAddress, SocketError> {
        local_address_of(self.shared.descriptor()?.get_ref())
    }

    pub fn peer_address(&self) -> Result<SocketAddress, SocketError> {
        peer_address_of(self.shared.descriptor()?.get_ref())
    }

    pub fn get_option(&self, level: i32, name: i32) -> Result<Bytes, SocketError> {
        read_option(self.shared.descriptor()?.get_ref(), level, name)
    }

    /// 启动接受循环：每接受一个连接（或每次接受失败）调用一次 `handler`。
    ///
    /// 循环持续到返回的控制器被关闭或本监听套接字被关闭；后者会向回调投递最后一个 `Closed` 错误。
    pub fn accept<F>(&self, context: ContextRef, handler: F) -> AcceptSocket
    where
        F: FnMut(SocketResult) + Send + 'static,
    {
        let stop = CancelTicketSource::new();
        let emitter = Emitter::new(Box::new(handler), context);
        let shared = Arc::clone(&self.shared);
        self.shared
            .reactor
            .spawn(accept_loop(shared, stop.ticket(), emitter));
        AcceptSocket {
            stop,
            listener: self.clone(),
        }
    }

    /// 关闭监听并释放描述符；挂起的接受循环以 `Closed` 结束。
    ///
    /// 内核侧的监听在最后一个接受循环观察到关闭、归还其借出的描述符后终止。
    pub fn close(&self) {
        if !self.shared.closer.cancel() {
            return;
        }
        self.shared.fd.lock().take();
        debug!("listen socket closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closer.is_cancelled()
    }
}

impl fmt::Debug for ListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenSocket")
            .field("local", &self.local_address().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn accept_loop(
    listener: Arc<ListenShared>,
    stop: CancelTicket,
    emitter: Emitter<SocketResult>,
) {
    let closed = listener.closer.ticket();
    loop {
        let Ok(fd) = listener.descriptor() else {
            if !stop.is_cancelled() {
                emitter.emit(Err(SocketError::closed()));
            }
            return;
        };
        let attempt = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            _ = closed.cancelled() => {
                emitter.emit(Err(SocketError::closed()));
                return;
            }
            attempt = accept_once(&fd) => attempt,
        };
        drop(fd);
        match attempt {
            Ok((socket, peer)) => {
                let reactor = &listener.reactor;
                let accepted = register(socket, reactor)
                    .map(|fd| ConnectedSocket::from_fd(fd, reactor.clone(), listener.pipe_config))
                    .map_err(|err| SocketError::from_io(SocketErrorKind::Accept, err));
                debug!(peer = ?SocketAddress::from_sock_addr(&peer), "connection accepted");
                emitter.emit(accepted);
            }
            Err(err) => {
                warn!(error = %err, "accept attempt failed");
                emitter.emit(Err(SocketError::from_io(SocketErrorKind::Accept, err)));
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_once(fd: &AsyncFd<RawSocket>) -> io::Result<(RawSocket, SockAddr)> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| inner.get_ref().accept()) {
            Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// 一个接受循环的控制器。
#[derive(Debug)]
pub struct AcceptSocket {
    stop: CancelTicketSource,
    listener: ListenSocket,
}

impl AcceptSocket {
    pub fn listener(&self) -> &ListenSocket {
        &self.listener
    }

    /// 停止本接受循环，之后不再调用回调；监听套接字保持打开。
    pub fn close(&self) {
        if self.stop.cancel() {
            trace!("accept loop stopped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled() || self.listener.is_closed()
    }
}

/// 已连接描述符槽位；管道持有克隆，管道关闭后随之归还。
struct ConnectedShared {
    fd: Mutex<Option<Arc<AsyncFd<RawSocket>>>>,
    closer: CancelTicketSource,
    reactor: Reactor,
    pipe_config: PipeConfig,
}

impl ConnectedShared {
    fn descriptor(&self) -> Result<Arc<AsyncFd<RawSocket>>, SocketError> {
        descriptor_of(&self.fd, &self.closer)
    }
}

fn descriptor_of(
    slot: &Mutex<Option<Arc<AsyncFd<RawSocket>>>>,
    closer: &CancelTicketSource,
) -> Result<Arc<AsyncFd<RawSocket>>, SocketError> {
    if closer.is_cancelled() {
        return Err(SocketError::closed());
    }
    slot.lock().clone().ok_or_else(SocketError::closed)
}

/// 已连接的套接字；克隆共享同一描述符。
#[derive(Clone)]
pub struct ConnectedSocket {
    shared: Arc<ConnectedShared>,
}

impl ConnectedSocket {
    fn from_fd(fd: AsyncFd<RawSocket>, reactor: Reactor, pipe_config: PipeConfig) -> Self {
        Self {
            shared: Arc::new(ConnectedShared {
                fd: Mutex::new(Some(Arc::new(fd))),
                closer: CancelTicketSource::new(),
                reactor,
                pipe_config,
            }),
        }
    }

    pub fn local_address(&self) -> Result<SocketAddress, SocketError> {
        local_address_of(self.shared.descriptor()?.get_ref())
    }

    pub fn peer_address(&self) -> Result<SocketAddress, SocketError> {
        peer_address_of(self.shared.descriptor()?.get_ref())
    }

    pub fn get_option(&self, level: i32, name: i32) -> Result<Bytes, SocketError> {
        read_option(self.shared.descriptor()?.get_ref(), level, name)
    }

    /// 在本连接上创建一对读写管道。
    ///
    /// 关闭套接字会关闭由它创建的全部管道；关闭管道不会关闭套接字。
    /// 在已关闭的套接字上创建的管道一经返回即处于关闭状态。
    pub fn pipe(&self) -> SocketPipe {
        let stream = SocketStream::new(self.shared.fd.lock().clone());
        let source = StreamSource::with_reactor(
            stream.clone(),
            self.shared.reactor.clone(),
            self.shared.pipe_config,
        );
        let sink = StreamSink::with_reactor(
            stream,
            self.shared.reactor.clone(),
            self.shared.pipe_config,
        );
        let (on_close_source, on_close_sink) = (source.clone(), sink.clone());
        self.shared.closer.ticket().add_cancel_handler(move |_| {
            on_close_source.close();
            on_close_sink.close();
        });
        SymmetricPipe::new(source, sink)
    }

    /// 消费本句柄并返回其管道。
    pub fn into_pipe(self) -> SocketPipe {
        self.pipe()
    }

    /// 关闭连接：挂起的读写以 `Closed` 完成，向对端发送关闭并释放描述符。
    pub fn close(&self) {
        if !self.shared.closer.cancel() {
            return;
        }
        let released = self.shared.fd.lock().take();
        if let Some(fd) = released
            && let Err(err) = fd.get_ref().shutdown(std::net::Shutdown::Both)
        {
            trace!(error = %err, "shutdown on close failed");
        }
        debug!("connected socket closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closer.is_cancelled()
    }
}

impl fmt::Debug for ConnectedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedSocket")
            .field("local", &self.local_address().ok())
            .field("peer", &self.peer_address().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Inet4Address;
    use tether_core::dispatch::DirectContext;
    use tokio::sync::oneshot;

    fn loopback() -> SocketAddress {
        SocketAddress::inet4(Inet4Address::loopback(), 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_unbound_socket_rejects_bind_and_connect() {
        let socket = Socket::new().expect("reactor");
        socket.close();
        socket.close();
        let err = socket
            .bind(&loopback(), SocketType::STREAM)
            .expect_err("closed socket must not bind");
        assert_eq!(err.kind(), SocketErrorKind::Closed);

        let socket = Socket::new().expect("reactor");
        socket.close();
        let (tx, rx) = oneshot::channel();
        socket.connect(
            &loopback(),
            SocketType::STREAM,
            &CancelTicket::never(),
            DirectContext::shared(),
            move |outcome| {
                let _ = tx.send(outcome.map(|_| ()));
            },
        );
        let err = rx
            .await
            .expect("handler fires")
            .expect_err("closed socket must not connect");
        assert_eq!(err.kind(), SocketErrorKind::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn options_are_applied_before_bind() {
        let bound = Socket::new()
            .expect("reactor")
            .appending_option(SocketOption::reuse_address())
            .bind(&loopback(), SocketType::STREAM)
            .expect("bind loopback");
        let raw = bound
            .get_option(libc::SOL_SOCKET, libc::SO_REUSEADDR)
            .expect("getsockopt");
        assert_ne!(crate::sys::decode_int(&raw), Some(0), "SO_REUSEADDR 必须已生效");

        bound.close();
        bound.close();
        assert_eq!(
            bound.local_address().expect_err("closed").kind(),
            SocketErrorKind::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_connect_reports_connect_error() {
        let placeholder = Socket::new()
            .expect("reactor")
            .bind(&loopback(), SocketType::STREAM)
            .expect("bind placeholder");
        let target = placeholder.local_address().expect("local address");
        placeholder.close();

        let (tx, rx) = oneshot::channel();
        Socket::new().expect("reactor").connect(
            &target,
            SocketType::STREAM,
            &CancelTicket::never(),
            DirectContext::shared(),
            move |outcome| {
                let _ = tx.send(outcome.map(|_| ()));
            },
        );
        let err = rx.await.expect("handler fires").expect_err("nobody listens");
        assert_eq!(err.kind(), SocketErrorKind::Connect);
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    fn listen_on_loopback() -> ListenSocket {
        Socket::new()
            .expect("reactor")
            .bind(&loopback(), SocketType::STREAM)
            .expect("bind loopback")
            .listen(1)
            .expect("listen")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_listener_releases_descriptor() {
        let listener = listen_on_loopback();
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let _controller = listener.accept(DirectContext::shared(), move |outcome: SocketResult| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(outcome.map(|_| ()));
            }
        });

        listener.close();
        let err = rx.await.expect("accept loop reports").expect_err("closed listener");
        assert_eq!(err.kind(), SocketErrorKind::Closed);
        assert!(listener.shared.fd.lock().is_none(), "关闭后监听描述符必须已从槽位取出");
        assert_eq!(
            listener
                .get_option(libc::SOL_SOCKET, libc::SO_ACCEPTCONN)
                .expect_err("closed")
                .kind(),
            SocketErrorKind::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_connected_socket_releases_descriptor() {
        let listener = listen_on_loopback();
        let target = listener.local_address().expect("listener address");
        let (accept_tx, accept_rx) = oneshot::channel();
        let mut accept_tx = Some(accept_tx);
        let controller = listener.accept(DirectContext::shared(), move |outcome| {
            if let Some(tx) = accept_tx.take() {
                let _ = tx.send(outcome);
            }
        });
        let (tx, rx) = oneshot::channel();
        Socket::new().expect("reactor").connect(
            &target,
            SocketType::STREAM,
            &CancelTicket::never(),
            DirectContext::shared(),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        let client = rx.await.expect("handler fires").expect("connect loopback");
        let _server = accept_rx.await.expect("accept fires").expect("accepted");
        controller.close();

        let before = client.pipe();
        client.close();
        assert!(client.shared.fd.lock().is_none(), "关闭后已连接描述符必须已从槽位取出");
        assert!(PipeSource::is_closed(&before) && PipeSink::is_closed(&before));

        let after = client.pipe();
        assert!(
            PipeSource::is_closed(&after) && PipeSink::is_closed(&after),
            "在已关闭套接字上创建的管道必须立即处于关闭状态"
        );
        listener.close();
    }
}
