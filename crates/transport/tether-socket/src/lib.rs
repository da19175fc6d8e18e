#![cfg(unix)]
#![deny(unsafe_code)]
#![doc = r#"
# tether-socket

## 模块使命（Why）
- **协议无关的套接字**：为上层协议（HTTP 客户端、缓存同步等协作方）提供 BSD 套接字的完整生命周期，
  不预设任何应用层线协议；
- **阶段即类型**：`Socket → BoundSocket → ListenSocket`、`Socket → ConnectedSocket` 以不同类型表达，
  越序调用在编译期即被拒绝；需要运行时灵活性的调用方使用 [`AnySocket`]。

## 核心契约（What）
- [`AddressFamily`]：`INET4`、`INET6`、`UNIX` 三个地址族，负责创建描述符与解析原始地址字节；
- [`SocketAddress`]：地址族无关的地址值，可与网络字节序的原始形式互转；
- [`SocketOption`]：`(level, name, value)` 三元组，在绑定或建连前按顺序应用；
- 所有异步结果（接受、建连、读写）经调用方指定的 `DispatchContext` 投递，错误以
  `tether_core::error::SocketError` 报告并携带 OS `errno`。

## 实现策略（How）
- 描述符由 `socket2` 创建并切换为非阻塞，注册为 `tokio::io::unix::AsyncFd`；
- 已连接套接字经 [`SocketStream`] 适配为 `AsyncRead`/`AsyncWrite`，复用 `tether-core` 的管道引擎；
- 被信号打断的系统调用在反应器内部重试，调用方不可见。

## 风险提示（Trade-offs）
- 仅支持 Unix 目标；
- 建连与取消在同一轮询中同时就绪时取消获胜，已建立的连接被立即关闭，不回滚对端可见的副作用。
"#]

mod address;
mod family;
mod option;
mod socket;
mod state;
mod stream;
mod sys;

pub use address::{
    Inet4Address, Inet4SocketAddress, Inet6Address, Inet6SocketAddress, SocketAddress,
    UnixSocketAddress,
};
pub use family::{AddressFamily, INET4, INET6, SocketType, UNIX};
pub use option::{OptionValue, SocketOption};
pub use socket::{
    AcceptSocket, BoundSocket, ConnectedSocket, Connecting, ListenSocket, Socket, SocketPipe,
    SocketResult,
};
pub use state::{AnySocket, SocketState};
pub use stream::SocketStream;
