//! 回环端到端场景：监听、接受、建连、管道往返、取消与关闭。
//!
//! # 教案式说明
//! - **意图 (Why)**：套接字状态机的契约只有在真实内核上才能完整验证，回环地址让测试无需外部网络；
//! - **逻辑 (How)**：所有结果经 `DirectContext` 投递到 `tokio::sync` 通道，测试主体以 `timeout` 等待，
//!   避免回调丢失时无限挂起；
//! - **契约 (What)**：接受回调每个连接恰好一次、建连回调恰好一次、关闭后的 I/O 以 `Closed` 完成。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tether_core::{
    cancel::{CancelTicket, CancelTicketSource},
    dispatch::DirectContext,
    error::SocketErrorKind,
    pipe::{PipeSinkExt, PipeSource, PipeSourceExt},
};
use tether_socket::{
    AnySocket, ConnectedSocket, Connecting, Inet4Address, ListenSocket, Socket, SocketAddress,
    SocketOption, SocketResult, SocketState, SocketType,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback_any_port() -> SocketAddress {
    SocketAddress::inet4(Inet4Address::loopback(), 0)
}

fn listen_on_loopback() -> ListenSocket {
    Socket::new()
        .expect("reactor")
        .appending_option(SocketOption::reuse_address())
        .bind(&loopback_any_port(), SocketType::STREAM)
        .expect("bind loopback")
        .listen(1)
        .expect("listen")
}

async fn connect_to(target: &SocketAddress, ticket: &CancelTicket) -> SocketResult {
    let (tx, rx) = oneshot::channel();
    Socket::new().expect("reactor").connect(
        target,
        SocketType::STREAM,
        ticket,
        DirectContext::shared(),
        move |outcome| {
            let _ = tx.send(outcome);
        },
    );
    timeout(WAIT, rx)
        .await
        .expect("connect handler must fire")
        .expect("handler dropped without firing")
}

async fn accepted_pair(listener: &ListenSocket) -> (ConnectedSocket, ConnectedSocket) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = listener.accept(DirectContext::shared(), move |outcome| {
        let _ = tx.send(outcome);
    });
    let target = listener.local_address().expect("listener address");
    let client = connect_to(&target, &CancelTicket::never())
        .await
        .expect("connect loopback");
    let server = timeout(WAIT, rx.recv())
        .await
        .expect("accept handler must fire")
        .expect("accept channel open")
        .expect("accept succeeds");
    controller.close();
    (client, server)
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_fires_once_with_peer_matching_connector() {
    init_tracing();
    let listener = listen_on_loopback();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&accepted);
    let controller = listener.accept(DirectContext::shared(), move |outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(outcome);
    });

    let target = listener.local_address().expect("listener address");
    let client = connect_to(&target, &CancelTicket::never())
        .await
        .expect("connect loopback");
    let server = timeout(WAIT, rx.recv())
        .await
        .expect("accept handler must fire")
        .expect("accept channel open")
        .expect("accept succeeds");

    assert_eq!(
        server.peer_address().expect("peer address"),
        client.local_address().expect("client local address"),
        "被接受连接的对端地址必须等于发起方的本地地址"
    );
    assert_eq!(
        client.peer_address().expect("client peer"),
        target,
        "发起方的对端必须是监听地址"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "单个连接只能触发一次接受回调");

    controller.close();
    assert!(controller.is_closed());
    listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn pipes_round_trip_over_loopback() {
    init_tracing();
    let listener = listen_on_loopback();
    let (client, server) = accepted_pair(&listener).await;
    let client_pipe = client.into_pipe();
    let server_pipe = server.pipe();

    client_pipe
        .write_all(Bytes::from_static(b"hello tether"))
        .await
        .expect("client write");
    let received = server_pipe.read_all(12).await.expect("server read");
    assert_eq!(&received[..], b"hello tether");

    server_pipe
        .write_all(Bytes::from_static(b"ack"))
        .await
        .expect("server write");
    let reply = client_pipe.read_all(3).await.expect("client read");
    assert_eq!(&reply[..], b"ack");

    server.close();
    let tail = client_pipe.read_all(0).await.expect("peer shutdown reads as EOF");
    assert!(tail.is_empty(), "对端关闭后应读到流结束");
    listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_socket_closes_its_pipes() {
    let listener = listen_on_loopback();
    let (client, _server) = accepted_pair(&listener).await;
    let pipe = client.pipe();

    let pending = pipe.read_all(0);
    client.close();
    client.close();

    let (partial, err) = timeout(WAIT, pending)
        .await
        .expect("pending read must complete")
        .expect_err("read on a closed socket");
    assert!(partial.is_empty());
    assert!(err.is_closed(), "关闭套接字后挂起读取应以 Closed 完成: {err}");
    assert!(PipeSource::is_closed(&pipe));
    assert_eq!(
        client.peer_address().expect_err("closed").kind(),
        SocketErrorKind::Closed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_ticket_wins_before_connect() {
    let listener = listen_on_loopback();
    let target = listener.local_address().expect("listener address");
    let source = CancelTicketSource::new();
    source.cancel();

    let err = connect_to(&target, &source.ticket())
        .await
        .expect_err("cancelled before connect");
    assert_eq!(err.kind(), SocketErrorKind::Cancelled);
    listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_listener_completes_accept_loop_with_closed() {
    let listener = listen_on_loopback();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _controller = listener.accept(DirectContext::shared(), move |outcome: SocketResult| {
        let _ = tx.send(outcome.map(|_| ()));
    });
    listener.close();

    let err = timeout(WAIT, rx.recv())
        .await
        .expect("accept loop must report close")
        .expect("accept channel open")
        .expect_err("closed listener");
    assert_eq!(err.kind(), SocketErrorKind::Closed);
    assert_eq!(
        listener.local_address().expect_err("closed").kind(),
        SocketErrorKind::Closed
    );
}

/// 填满 backlog 为 0 且从不接受的监听队列，返回停在握手阶段的下一次建连。
///
/// 接受队列已满时内核丢弃新的 SYN，发起方持续重传，建连既不成功也不失败。
struct StalledConnect {
    listener: ListenSocket,
    _queued: Vec<ConnectedSocket>,
    connecting: Connecting,
    outcome: oneshot::Receiver<SocketResult>,
}

async fn stalled_connect(ticket: &CancelTicket) -> StalledConnect {
    let listener = Socket::new()
        .expect("reactor")
        .bind(&loopback_any_port(), SocketType::STREAM)
        .expect("bind loopback")
        .listen(0)
        .expect("listen");
    let target = listener.local_address().expect("listener address");
    let mut queued = Vec::new();
    for _ in 0..16 {
        let (tx, mut rx) = oneshot::channel();
        let connecting = Socket::new().expect("reactor").connect(
            &target,
            SocketType::STREAM,
            ticket,
            DirectContext::shared(),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        );
        match timeout(Duration::from_millis(300), &mut rx).await {
            Ok(outcome) => queued.push(
                outcome
                    .expect("handler fired")
                    .expect("queued connect succeeds"),
            ),
            Err(_) => {
                return StalledConnect {
                    listener,
                    _queued: queued,
                    connecting,
                    outcome: rx,
                };
            }
        }
    }
    panic!("接受队列始终未被填满");
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_listener_refuses_new_connections() {
    init_tracing();
    let listener = listen_on_loopback();
    let target = listener.local_address().expect("listener address");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = listener.accept(DirectContext::shared(), move |outcome: SocketResult| {
        let _ = tx.send(outcome.map(|_| ()));
    });

    listener.close();
    let err = timeout(WAIT, rx.recv())
        .await
        .expect("accept loop must report close")
        .expect("accept channel open")
        .expect_err("closed listener");
    assert_eq!(err.kind(), SocketErrorKind::Closed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = connect_to(&target, &CancelTicket::never())
        .await
        .expect_err("关闭后的监听端口不得再完成握手");
    assert_eq!(err.kind(), SocketErrorKind::Connect);
    assert!(controller.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_idle_listener_refuses_new_connections() {
    let listener = listen_on_loopback();
    let target = listener.local_address().expect("listener address");
    let clone = listener.clone();
    listener.close();

    let err = connect_to(&target, &CancelTicket::never())
        .await
        .expect_err("存活的克隆不得让监听描述符继续打开");
    assert_eq!(err.kind(), SocketErrorKind::Connect);
    assert!(clone.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_in_flight_connect_completes_with_closed_once() {
    init_tracing();
    let stalled = stalled_connect(&CancelTicket::never()).await;
    assert!(!stalled.connecting.is_closed());

    stalled.connecting.close();
    stalled.connecting.close();
    assert!(stalled.connecting.is_closed());

    let err = timeout(WAIT, stalled.outcome)
        .await
        .expect("closing must complete the connect")
        .expect("handler fired")
        .expect_err("closed before the handshake finished");
    assert_eq!(err.kind(), SocketErrorKind::Closed, "挂起建连被关闭时必须以 Closed 完成");
    stalled.listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_in_flight_connect_reports_cancelled() {
    let source = CancelTicketSource::new();
    let stalled = stalled_connect(&source.ticket()).await;

    assert!(source.cancel());
    let err = timeout(WAIT, stalled.outcome)
        .await
        .expect("cancellation must complete the connect")
        .expect("handler fired")
        .expect_err("cancelled before the handshake finished");
    assert_eq!(err.kind(), SocketErrorKind::Cancelled, "建连完成前取消必须报告 Cancelled");
    stalled.listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_ticket_cancels_in_flight_connect() {
    let source = CancelTicketSource::new();
    let stalled = stalled_connect(&source.ticket()).await;

    source.cancel_after(Duration::from_millis(20));
    let err = timeout(WAIT, stalled.outcome)
        .await
        .expect("timeout must complete the connect")
        .expect("handler fired")
        .expect_err("timed out before the handshake finished");
    assert_eq!(err.kind(), SocketErrorKind::Cancelled);
    stalled.listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_after_connect_keeps_connection_usable() {
    let listener = listen_on_loopback();
    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
    let controller = listener.accept(DirectContext::shared(), move |outcome| {
        let _ = accept_tx.send(outcome);
    });
    let target = listener.local_address().expect("listener address");
    let source = CancelTicketSource::new();
    let fired = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = oneshot::channel();
    let counter = Arc::clone(&fired);
    let connecting = Socket::new().expect("reactor").connect(
        &target,
        SocketType::STREAM,
        &source.ticket(),
        DirectContext::shared(),
        move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome);
        },
    );
    let client = timeout(WAIT, rx)
        .await
        .expect("connect handler must fire")
        .expect("handler fired")
        .expect("connect loopback");
    let server = timeout(WAIT, accept_rx.recv())
        .await
        .expect("accept handler must fire")
        .expect("accept channel open")
        .expect("accepted");

    assert!(source.cancel());
    connecting.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1, "成功后的取消不得再次触发回调");
    assert!(!client.is_closed(), "成功投递后的取消不得回滚连接");

    client
        .pipe()
        .write_all(Bytes::from_static(b"still here"))
        .await
        .expect("write after cancel");
    let received = server.pipe().read_all(10).await.expect("read after cancel");
    assert_eq!(&received[..], b"still here");

    controller.close();
    client.close();
    listener.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn any_socket_rejects_out_of_order_transitions() {
    let socket = AnySocket::new(Socket::new().expect("reactor"));
    let err = socket.listen(1).expect_err("listen before bind");
    assert_eq!(err.kind(), SocketErrorKind::InvalidState);
    assert_eq!(socket.state(), SocketState::Unbound);

    socket
        .bind(&loopback_any_port(), SocketType::STREAM)
        .expect("first bind");
    let err = socket
        .bind(&loopback_any_port(), SocketType::STREAM)
        .expect_err("second bind");
    assert_eq!(err.kind(), SocketErrorKind::InvalidState);
    assert_eq!(socket.state(), SocketState::Bound);

    socket.listen(1).expect("listen after bind");
    assert_eq!(socket.state(), SocketState::Listening);

    socket.close();
    socket.close();
    assert_eq!(socket.state(), SocketState::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn any_socket_connects_and_pipes() {
    let server = AnySocket::new(Socket::new().expect("reactor"));
    server
        .bind(&loopback_any_port(), SocketType::STREAM)
        .expect("bind");
    server.listen(4).expect("listen");
    let (accept_tx, mut accept_rx) = mpsc::unbounded_channel();
    let controller = server
        .accept(DirectContext::shared(), move |outcome| {
            let _ = accept_tx.send(outcome);
        })
        .expect("accept while listening");
    let target = server.local_address().expect("server address");

    let client = AnySocket::new(Socket::new().expect("reactor"));
    let (tx, rx) = oneshot::channel();
    client
        .connect(
            &target,
            SocketType::STREAM,
            &CancelTicket::never(),
            DirectContext::shared(),
            move |outcome| {
                let _ = tx.send(outcome.map(|_| ()));
            },
        )
        .expect("connect from unbound");
    timeout(WAIT, rx)
        .await
        .expect("connect handler must fire")
        .expect("handler fired")
        .expect("connected");
    assert_eq!(client.state(), SocketState::Connected);

    let accepted = timeout(WAIT, accept_rx.recv())
        .await
        .expect("accept handler must fire")
        .expect("accept channel open")
        .expect("accepted");
    client
        .pipe()
        .expect("pipe while connected")
        .write_all(Bytes::from_static(b"any"))
        .await
        .expect("write");
    let echoed = accepted.pipe().read_all(3).await.expect("read");
    assert_eq!(&echoed[..], b"any");

    controller.close();
    client.close();
    server.close();
    assert!(client.is_closed() && server.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn unix_path_round_trip() {
    let path = std::env::temp_dir().join(format!("tether-loopback-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let address = SocketAddress::unix(&path).expect("path fits sun_path");

    let listener = Socket::new()
        .expect("reactor")
        .bind(&address, SocketType::STREAM)
        .expect("bind unix path")
        .listen(1)
        .expect("listen");
    assert_eq!(listener.local_address().expect("local"), address);

    let (client, server) = accepted_pair(&listener).await;
    client
        .pipe()
        .write_all(Bytes::from_static(b"unix"))
        .await
        .expect("write");
    let received = server.pipe().read_all(4).await.expect("read");
    assert_eq!(&received[..], b"unix");

    listener.close();
    let _ = std::fs::remove_file(&path);
}
