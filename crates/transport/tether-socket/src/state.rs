//! 运行时标签的套接字：在单一句柄上按顺序驱动各阶段。
//!
//! 类型状态 API 在编译期排除越序调用；当调用方需要把套接字存放在一个固定类型的字段中
//! （例如协议层的连接表），[`AnySocket`] 以内部标签记录阶段，越序调用以
//! `SocketErrorKind::InvalidState` 失败，而不是无法编译。
//!
//! 内部锁只保护阶段切换本身，任何用户回调都不会在持锁期间执行。

use std::{fmt, mem, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{cancel::CancelTicket, dispatch::ContextRef, error::SocketError};
use tracing::trace;

use crate::{
    address::SocketAddress,
    family::SocketType,
    socket::{
        AcceptSocket, BoundSocket, ConnectedSocket, Connecting, ListenSocket, Socket, SocketPipe,
        SocketResult,
    },
};

/// [`AnySocket`] 当前所处的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

impl SocketState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

enum Slot {
    Unbound(Socket),
    Bound(BoundSocket),
    Listening(ListenSocket),
    Connecting(Connecting),
    Connected(ConnectedSocket),
    Closed,
}

impl Slot {
    fn state(&self) -> SocketState {
        match self {
            Self::Unbound(_) => SocketState::Unbound,
            Self::Bound(_) => SocketState::Bound,
            Self::Listening(_) => SocketState::Listening,
            Self::Connecting(_) => SocketState::Connecting,
            Self::Connected(_) => SocketState::Connected,
            Self::Closed => SocketState::Closed,
        }
    }

    fn close(self) {
        match self {
            Self::Unbound(socket) => socket.close(),
            Self::Bound(bound) => bound.close(),
            Self::Listening(listener) => listener.close(),
            Self::Connecting(connecting) => connecting.close(),
            Self::Connected(connected) => connected.close(),
            Self::Closed => {}
        }
    }
}

/// 运行时标签的套接字句柄；克隆共享同一状态。
#[derive(Clone)]
pub struct AnySocket {
    slot: Arc<Mutex<Slot>>,
}

impl AnySocket {
    pub fn new(socket: Socket) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Unbound(socket))),
        }
    }

    pub fn state(&self) -> SocketState {
        self.slot.lock().state()
    }

    /// `Unbound → Bound`；失败时保持 `Unbound`，可以换一个地址重试。
    pub fn bind(&self, address: &SocketAddress, ty: SocketType) -> Result<(), SocketError> {
        let mut slot = self.slot.lock();
        let Slot::Unbound(socket) = &*slot else {
            return Err(SocketError::invalid_state("bind", slot.state().name()));
        };
        let descriptor = socket.bound_descriptor(address, ty)?;
        let reactor = socket.reactor().clone();
        let bound = BoundSocket::from_parts(descriptor, reactor, socket.pipe_config());
        *slot = Slot::Bound(bound);
        Ok(())
    }

    /// `Bound → Listening`；失败时保持 `Bound`。
    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        let mut slot = self.slot.lock();
        let Slot::Bound(bound) = &*slot else {
            return Err(SocketError::invalid_state("listen", slot.state().name()));
        };
        let listener = bound.listen_in_place(backlog)?;
        *slot = Slot::Listening(listener);
        Ok(())
    }

    /// 在 `Listening` 阶段启动一个接受循环，语义同 [`ListenSocket::accept`]。
    pub fn accept<F>(&self, context: ContextRef, handler: F) -> Result<AcceptSocket, SocketError>
    where
        F: FnMut(SocketResult) + Send + 'static,
    {
        let listener = match &*self.slot.lock() {
            Slot::Listening(listener) => listener.clone(),
            other => return Err(SocketError::invalid_state("accept", other.state().name())),
        };
        Ok(listener.accept(context, handler))
    }

    /// `Unbound | Bound → Connecting → Connected`。
    ///
    /// 建连失败或被取消时阶段变为 `Closed`：描述符已随尝试一起释放。
    /// 若建连完成前本句柄已被关闭，新连接随即关闭，回调收到 `Closed`。
    pub fn connect<F>(
        &self,
        address: &SocketAddress,
        ty: SocketType,
        ticket: &CancelTicket,
        context: ContextRef,
        handler: F,
    ) -> Result<(), SocketError>
    where
        F: FnOnce(SocketResult) + Send + 'static,
    {
        let shared = Arc::clone(&self.slot);
        let settle = move |outcome: SocketResult| {
            let outcome = settle_connect(&shared, outcome);
            handler(outcome);
        };

        let mut slot = self.slot.lock();
        let connecting = match mem::replace(&mut *slot, Slot::Closed) {
            Slot::Unbound(socket) => socket.connect(address, ty, ticket, context, settle),
            Slot::Bound(bound) => bound.connect(address, ticket, context, settle),
            other => {
                let state = other.state();
                *slot = other;
                return Err(SocketError::invalid_state("connect", state.name()));
            }
        };
        *slot = Slot::Connecting(connecting);
        Ok(())
    }

    pub fn local_address(&self) -> Result<SocketAddress, SocketError> {
        match &*self.slot.lock() {
            Slot::Bound(bound) => bound.local_address(),
            Slot::Listening(listener) => listener.local_address(),
            Slot::Connected(connected) => connected.local_address(),
            other => Err(SocketError::invalid_state("local_address", other.state().name())),
        }
    }

    pub fn peer_address(&self) -> Result<SocketAddress, SocketError> {
        match &*self.slot.lock() {
            Slot::Bound(bound) => bound.peer_address(),
            Slot::Listening(listener) => listener.peer_address(),
            Slot::Connected(connected) => connected.peer_address(),
            other => Err(SocketError::invalid_state("peer_address", other.state().name())),
        }
    }

    pub fn get_option(&self, level: i32, name: i32) -> Result<Bytes, SocketError> {
        match &*self.slot.lock() {
            Slot::Bound(bound) => bound.get_option(level, name),
            Slot::Listening(listener) => listener.get_option(level, name),
            Slot::Connected(connected) => connected.get_option(level, name),
            other => Err(SocketError::invalid_state("get_option", other.state().name())),
        }
    }

    /// `Connected` 阶段的读写管道。
    pub fn pipe(&self) -> Result<SocketPipe, SocketError> {
        let connected = match &*self.slot.lock() {
            Slot::Connected(connected) => connected.clone(),
            other => return Err(SocketError::invalid_state("pipe", other.state().name())),
        };
        Ok(connected.pipe())
    }

    /// 任意阶段均可关闭；幂等。
    pub fn close(&self) {
        let previous = mem::replace(&mut *self.slot.lock(), Slot::Closed);
        let state = previous.state();
        if state != SocketState::Closed {
            trace!(from = %state, "socket closed");
        }
        previous.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }
}

fn settle_connect(slot: &Mutex<Slot>, outcome: SocketResult) -> SocketResult {
    let mut slot = slot.lock();
    if !matches!(&*slot, Slot::Connecting(_)) {
        drop(slot);
        if let Ok(connected) = outcome {
            connected.close();
            return Err(SocketError::closed());
        }
        return outcome;
    }
    match outcome {
        Ok(connected) => {
            *slot = Slot::Connected(connected.clone());
            Ok(connected)
        }
        Err(err) => {
            *slot = Slot::Closed;
            Err(err)
        }
    }
}

impl fmt::Debug for AnySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnySocket")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Inet4Address;
    use tether_core::error::SocketErrorKind;

    fn loopback() -> SocketAddress {
        SocketAddress::inet4(Inet4Address::loopback(), 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_bind_keeps_unbound() {
        let socket = AnySocket::new(Socket::new().expect("reactor"));
        let documentation = Inet4Address::from_presentation("192.0.2.1").expect("ip");
        let foreign = SocketAddress::inet4(documentation, 0);
        let err = socket
            .bind(&foreign, SocketType::STREAM)
            .expect_err("TEST-NET address is not local");
        assert_eq!(err.kind(), SocketErrorKind::Bind);
        assert_eq!(socket.state(), SocketState::Unbound, "绑定失败后应允许重试");

        socket.bind(&loopback(), SocketType::STREAM).expect("bind loopback");
        assert_eq!(socket.state(), SocketState::Bound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accessors_outside_named_states_are_invalid() {
        let socket = AnySocket::new(Socket::new().expect("reactor"));
        assert_eq!(
            socket.local_address().expect_err("unbound").kind(),
            SocketErrorKind::InvalidState
        );
        assert_eq!(
            socket.pipe().expect_err("unbound").kind(),
            SocketErrorKind::InvalidState
        );
        socket.close();
        assert!(socket.is_closed());
        assert_eq!(
            socket.bind(&loopback(), SocketType::STREAM).expect_err("closed").kind(),
            SocketErrorKind::InvalidState
        );
    }
}
