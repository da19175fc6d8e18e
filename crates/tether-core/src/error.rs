//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义管道、套接字与面向应用层三个错误域，保证所有异步回调以同一套
//!   `(结果, 错误)` 约定报告失败；
//! - 每个错误类别都附带稳定错误码（如 `tether.pipe.closed`），便于日志检索与告警聚合。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，并以 `Option<Cause>` 携带底层原因（通常是 OS `errno`）；
//! - 错误值为 `Clone`：同一错误可能被派发给多个回调（如关闭时的所有挂起请求）；
//! - 类别枚举标记为 `#[non_exhaustive]`，为后续扩展预留空间。
//!
//! ## 扩展建议（How）
//! - 传输实现通过 [`PipeError::from_io`] / [`SocketError::from_io`] 将 `std::io::Error` 映射到本域；
//! - 协作方（网络客户端、本地缓存）通过 `From` 转换得到 [`ServiceError`]，再决定重试策略。

use std::{error::Error as StdError, fmt, io, sync::Arc};

use thiserror::Error;

/// 错误链中的底层原因，使用 `Arc` 以便错误值可以廉价克隆。
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// 管道错误类别，覆盖字节流端点可能出现的全部失败形态。
///
/// # 契约说明（What）
/// - 变体与数值一一对应，`as_code` 返回稳定数值，便于跨进程传递；
/// - `Closed` 表示在已关闭的端点上执行 I/O，或在关闭时被中止的挂起请求。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PipeErrorKind {
    Unknown,
    Write,
    Read,
    Closed,
    TimedOut,
    BrokenPipe,
    LimitExceeded,
    QuotaExhausted,
    InsufficientSpace,
    OperationNotSupported,
    NetworkUnreachable,
}

impl PipeErrorKind {
    /// 稳定的数值编码。
    pub const fn as_code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Write => 1,
            Self::Read => 2,
            Self::Closed => 3,
            Self::TimedOut => 4,
            Self::BrokenPipe => 5,
            Self::LimitExceeded => 6,
            Self::QuotaExhausted => 7,
            Self::InsufficientSpace => 8,
            Self::OperationNotSupported => 9,
            Self::NetworkUnreachable => 10,
        }
    }

    /// 稳定的点分错误码，适合作为日志字段。
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unknown => "tether.pipe.unknown",
            Self::Write => "tether.pipe.write_failed",
            Self::Read => "tether.pipe.read_failed",
            Self::Closed => "tether.pipe.closed",
            Self::TimedOut => "tether.pipe.timed_out",
            Self::BrokenPipe => "tether.pipe.broken_pipe",
            Self::LimitExceeded => "tether.pipe.limit_exceeded",
            Self::QuotaExhausted => "tether.pipe.quota_exhausted",
            Self::InsufficientSpace => "tether.pipe.insufficient_space",
            Self::OperationNotSupported => "tether.pipe.not_supported",
            Self::NetworkUnreachable => "tether.pipe.network_unreachable",
        }
    }

    /// 默认文案。
    pub const fn message(self) -> &'static str {
        match self {
            Self::Unknown => "an unknown pipe error occurred",
            Self::Write => "a write error occurred",
            Self::Read => "a read error occurred",
            Self::Closed => "i/o attempted on a closed pipe",
            Self::TimedOut => "the i/o request timed out",
            Self::BrokenPipe => "the other side of the pipe was closed",
            Self::LimitExceeded => "a user-specified byte limit was exceeded",
            Self::QuotaExhausted => "the disk quota has been exhausted",
            Self::InsufficientSpace => "no free space remains in the destination",
            Self::OperationNotSupported => "the requested operation is not supported",
            Self::NetworkUnreachable => "the network is unreachable",
        }
    }
}

impl fmt::Display for PipeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 管道错误：类别 + 可选底层原因。
#[derive(Clone, Debug, Error)]
#[error("{}: {}", .kind.code(), .kind.message())]
pub struct PipeError {
    kind: PipeErrorKind,
    #[source]
    cause: Option<Cause>,
}

impl PipeError {
    /// 构造不带底层原因的错误。
    pub fn new(kind: PipeErrorKind) -> Self {
        Self { kind, cause: None }
    }

    /// 关闭类错误的便捷构造。
    pub fn closed() -> Self {
        Self::new(PipeErrorKind::Closed)
    }

    /// 附加底层原因。
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> PipeErrorKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.kind == PipeErrorKind::Closed
    }

    /// 将 `std::io::Error` 映射为管道错误。
    ///
    /// # 契约说明（What）
    /// - 能识别的 `ErrorKind` 映射到具体类别；其余落入 `fallback`（读路径传 `Read`，写路径传 `Write`）；
    /// - 原始 `io::Error` 始终作为 `cause` 保留。
    pub fn from_io(error: io::Error, fallback: PipeErrorKind) -> Self {
        use io::ErrorKind;
        let kind = match error.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                PipeErrorKind::BrokenPipe
            }
            ErrorKind::TimedOut => PipeErrorKind::TimedOut,
            ErrorKind::Unsupported => PipeErrorKind::OperationNotSupported,
            ErrorKind::StorageFull => PipeErrorKind::InsufficientSpace,
            ErrorKind::QuotaExceeded => PipeErrorKind::QuotaExhausted,
            ErrorKind::FileTooLarge => PipeErrorKind::LimitExceeded,
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable | ErrorKind::NetworkDown => {
                PipeErrorKind::NetworkUnreachable
            }
            _ => fallback,
        };
        Self::new(kind).with_cause(error)
    }
}

/// 套接字错误类别。
///
/// # 契约说明（What）
/// - `SetOption`/`GetOption` 携带被拒绝选项的 `(level, name)`；
/// - `Connect`、`Closed`、`Cancelled`、`InvalidState` 服务于状态机：建连失败、
///   关闭时中止的挂起操作、取消票据抢先触发、以及运行时标签状态机上的越序迁移。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketErrorKind {
    Unknown,
    Listen,
    Bind,
    FetchLocalAddress,
    FetchPeerAddress,
    Create,
    SetOption { level: i32, name: i32 },
    GetOption { level: i32, name: i32 },
    Accept,
    Connect,
    Closed,
    Cancelled,
    InvalidState,
}

impl SocketErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unknown => "tether.socket.unknown",
            Self::Listen => "tether.socket.listen_failed",
            Self::Bind => "tether.socket.bind_failed",
            Self::FetchLocalAddress => "tether.socket.local_address_failed",
            Self::FetchPeerAddress => "tether.socket.peer_address_failed",
            Self::Create => "tether.socket.create_failed",
            Self::SetOption { .. } => "tether.socket.set_option_failed",
            Self::GetOption { .. } => "tether.socket.get_option_failed",
            Self::Accept => "tether.socket.accept_failed",
            Self::Connect => "tether.socket.connect_failed",
            Self::Closed => "tether.socket.closed",
            Self::Cancelled => "tether.socket.cancelled",
            Self::InvalidState => "tether.socket.invalid_state",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::Unknown => "an unknown socket error occurred",
            Self::Listen => "failed to open the socket for listening",
            Self::Bind => "failed to bind an address to the socket",
            Self::FetchLocalAddress => "failed to fetch the local socket address",
            Self::FetchPeerAddress => "failed to fetch the peer socket address",
            Self::Create => "failed to create a socket endpoint",
            Self::SetOption { .. } => "failed to set a socket option",
            Self::GetOption { .. } => "failed to get a socket option",
            Self::Accept => "failed to accept a new connection",
            Self::Connect => "failed to connect the socket",
            Self::Closed => "the socket was closed",
            Self::Cancelled => "the operation was cancelled",
            Self::InvalidState => "the socket is not in a state that permits this operation",
        }
    }

    /// 选项类错误携带的 `(level, name)`。
    pub const fn option(self) -> Option<(i32, i32)> {
        match self {
            Self::SetOption { level, name } | Self::GetOption { level, name } => {
                Some((level, name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SocketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.option() {
            Some((level, name)) => write!(f, "{} (level={level}, name={name})", self.code()),
            None => f.write_str(self.code()),
        }
    }
}

/// 套接字错误：类别 + 可选底层原因。
#[derive(Clone, Debug, Error)]
#[error("{}: {}", .kind, .kind.message())]
pub struct SocketError {
    kind: SocketErrorKind,
    #[source]
    cause: Option<Cause>,
}

impl SocketError {
    pub fn new(kind: SocketErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 以 OS 错误为原因构造。
    pub fn from_io(kind: SocketErrorKind, error: io::Error) -> Self {
        Self::new(kind).with_cause(error)
    }

    pub fn closed() -> Self {
        Self::new(SocketErrorKind::Closed)
    }

    pub fn cancelled() -> Self {
        Self::new(SocketErrorKind::Cancelled)
    }

    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::new(SocketErrorKind::InvalidState).with_cause(InvalidTransition { operation, state })
    }

    pub fn kind(&self) -> SocketErrorKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// 若原因是 OS 错误，返回其 `errno`。
    pub fn raw_os_error(&self) -> Option<i32> {
        self.cause
            .as_ref()
            .and_then(|cause| cause.downcast_ref::<io::Error>())
            .and_then(io::Error::raw_os_error)
    }
}

/// 运行时标签状态机拒绝越序迁移时附带的原因。
#[derive(Clone, Debug, Error)]
#[error("`{operation}` is not valid on a socket in the `{state}` state")]
pub struct InvalidTransition {
    pub operation: &'static str,
    pub state: &'static str,
}

/// 面向应用层的错误类别。
///
/// 核心原语自身不会产出这些错误；它们由网络客户端、本地缓存等协作方使用，
/// 核心只提供从传输错误出发的映射。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServiceErrorKind {
    Unknown,
    ConnectionLost,
    ResponseInvalid,
    TimedOut,
    RequestConflict,
    AuthenticationFailed,
    AuthenticationRequired,
    PermissionDenied,
    InvalidRequest,
    ResourceNotFound,
    NetworkUnavailable,
}

impl ServiceErrorKind {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unknown => "tether.service.unknown",
            Self::ConnectionLost => "tether.service.connection_lost",
            Self::ResponseInvalid => "tether.service.response_invalid",
            Self::TimedOut => "tether.service.timed_out",
            Self::RequestConflict => "tether.service.request_conflict",
            Self::AuthenticationFailed => "tether.service.authentication_failed",
            Self::AuthenticationRequired => "tether.service.authentication_required",
            Self::PermissionDenied => "tether.service.permission_denied",
            Self::InvalidRequest => "tether.service.invalid_request",
            Self::ResourceNotFound => "tether.service.resource_not_found",
            Self::NetworkUnavailable => "tether.service.network_unavailable",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::Unknown => "an unknown error occurred",
            Self::ConnectionLost => "the connection to the server was lost",
            Self::ResponseInvalid => "the server's response was invalid",
            Self::TimedOut => "the request timed out",
            Self::RequestConflict => "the request was superseded by a conflicting request",
            Self::AuthenticationFailed => "authentication failed",
            Self::AuthenticationRequired => "authentication is required",
            Self::PermissionDenied => "access to the requested resource was denied",
            Self::InvalidRequest => "the request arguments were invalid",
            Self::ResourceNotFound => "the requested resource was not found",
            Self::NetworkUnavailable => "the network is unavailable",
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 面向应用层的错误。
#[derive(Clone, Debug, Error)]
#[error("{}: {}", .kind.code(), .kind.message())]
pub struct ServiceError {
    kind: ServiceErrorKind,
    #[source]
    cause: Option<Cause>,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn kind(&self) -> ServiceErrorKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }
}

impl From<PipeError> for ServiceError {
    fn from(error: PipeError) -> Self {
        let kind = match error.kind() {
            PipeErrorKind::Closed | PipeErrorKind::BrokenPipe => ServiceErrorKind::ConnectionLost,
            PipeErrorKind::TimedOut => ServiceErrorKind::TimedOut,
            PipeErrorKind::NetworkUnreachable => ServiceErrorKind::NetworkUnavailable,
            _ => ServiceErrorKind::Unknown,
        };
        ServiceError::new(kind).with_cause(error)
    }
}

impl From<SocketError> for ServiceError {
    fn from(error: SocketError) -> Self {
        let kind = match error.kind() {
            SocketErrorKind::Cancelled => ServiceErrorKind::RequestConflict,
            SocketErrorKind::Closed => ServiceErrorKind::ConnectionLost,
            SocketErrorKind::Connect => match connect_cause_kind(&error) {
                Some(io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset) => {
                    ServiceErrorKind::ConnectionLost
                }
                Some(io::ErrorKind::TimedOut) => ServiceErrorKind::TimedOut,
                Some(
                    io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::NetworkDown,
                ) => ServiceErrorKind::NetworkUnavailable,
                _ => ServiceErrorKind::Unknown,
            },
            _ => ServiceErrorKind::Unknown,
        };
        ServiceError::new(kind).with_cause(error)
    }
}

fn connect_cause_kind(error: &SocketError) -> Option<io::ErrorKind> {
    error
        .cause()
        .and_then(|cause| cause.downcast_ref::<io::Error>())
        .map(io::Error::kind)
}
