//! 常用类型的一站式导入：`use tether_core::prelude::*;`。
//!
//! 仅收录跨模块高频使用的契约；边缘类型请使用完整路径。

pub use crate::{
    cancel::{CancelReason, CancelTicket, CancelTicketSource},
    config::{PipeConfig, ReactorConfig},
    dispatch::{
        ConcurrentContext, ContextRef, DirectContext, Discipline, DispatchContext,
        DispatchContextExt, Emitter, SerialContext, ThreadContext,
    },
    error::{
        PipeError, PipeErrorKind, ServiceError, ServiceErrorKind, SocketError, SocketErrorKind,
    },
    observer::{ObserverSet, ObserverToken},
    pipe::{
        PipeSink, PipeSinkExt, PipeSource, PipeSourceExt, ReadEvent, StreamSink, StreamSource,
        SymmetricPipe, WriteEvent,
    },
    reactor::Reactor,
};
