//! 单向字节流端点：部分传输、多次回调的完成语义。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 套接字、文件、内存缓冲等字节流需要统一的读写契约，使协议层（HTTP、缓存同步等协作方）
//!   无需关心底层描述符类型；
//! - 大块读写天然是“部分完成”的：每推进一段就回调一次，调用方可以边收边处理，
//!   也可以据此实现背压。
//!
//! ## 契约 (What)
//! - [`PipeSource::read`]：`length == 0` 表示读到流结束；回调按块多次触发，
//!   直到 `done == true` 或出现错误；被信号中断的读取在内部透明重试；
//! - [`PipeSink::write`]：回调多次触发，`remaining` 为尚未被接收的字节，清空时 `done == true`；
//!   写入空缓冲表示刷新请求；
//! - `close`：终止且幂等；所有挂起与后续请求以 [`PipeErrorKind::Closed`] 完成，
//!   并附带中止时刻的部分结果（写路径为剩余缓冲）；
//! - 单个请求一旦报告 `done`，不会再有该请求的回调。
//!
//! ## 注意事项 (Trade-offs)
//! - 回调经调用方给定的 [`ContextRef`] 派发；只有串行上下文保证同一请求的多个事件按序到达。
//!
//! [`PipeErrorKind::Closed`]: crate::error::PipeErrorKind::Closed

mod stream;
mod symmetric;

use std::{future::Future, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    dispatch::{ContextRef, DirectContext},
    error::PipeError,
};

pub use stream::{StreamSink, StreamSource};
pub use symmetric::SymmetricPipe;

/// 读请求的一次进展。
#[derive(Clone, Debug)]
pub struct ReadEvent {
    /// 本请求是否已结束。
    pub done: bool,
    /// 本次交付的数据块，可能为空。
    pub data: Bytes,
    /// 失败原因；出现时 `done` 恒为 `true`。
    pub error: Option<PipeError>,
}

impl ReadEvent {
    pub(crate) fn chunk(data: Bytes, done: bool) -> Self {
        Self {
            done,
            data,
            error: None,
        }
    }

    pub(crate) fn end() -> Self {
        Self::chunk(Bytes::new(), true)
    }

    pub(crate) fn failed(error: PipeError) -> Self {
        Self {
            done: true,
            data: Bytes::new(),
            error: Some(error),
        }
    }
}

/// 写请求的一次进展。
#[derive(Clone, Debug)]
pub struct WriteEvent {
    /// 本请求是否已结束。
    pub done: bool,
    /// 尚未被接收的字节。
    pub remaining: Bytes,
    /// 失败原因；出现时 `done` 恒为 `true`。
    pub error: Option<PipeError>,
}

impl WriteEvent {
    pub(crate) fn progress(remaining: Bytes) -> Self {
        Self {
            done: remaining.is_empty(),
            remaining,
            error: None,
        }
    }

    pub(crate) fn failed(remaining: Bytes, error: PipeError) -> Self {
        Self {
            done: true,
            remaining,
            error: Some(error),
        }
    }
}

/// 读回调。
pub type ReadHandler = Box<dyn FnMut(ReadEvent) + Send + 'static>;
/// 写回调。
pub type WriteHandler = Box<dyn FnMut(WriteEvent) + Send + 'static>;

/// 字节流的读端。
pub trait PipeSource: Send + Sync {
    /// 读取至多 `length` 字节（`0` 表示读到流结束），进展经 `context` 派发给 `handler`。
    fn read(&self, length: usize, context: ContextRef, handler: ReadHandler);

    /// 关闭读端；终止且幂等。
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// 字节流的写端。
pub trait PipeSink: Send + Sync {
    /// 写入 `data`，进展经 `context` 派发给 `handler`；空缓冲表示刷新。
    fn write(&self, data: Bytes, context: ContextRef, handler: WriteHandler);

    /// 关闭写端；终止且幂等。
    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl<T: PipeSource + ?Sized> PipeSource for Arc<T> {
    fn read(&self, length: usize, context: ContextRef, handler: ReadHandler) {
        (**self).read(length, context, handler);
    }

    fn close(&self) {
        (**self).close();
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

impl<T: PipeSink + ?Sized> PipeSink for Arc<T> {
    fn write(&self, data: Bytes, context: ContextRef, handler: WriteHandler) {
        (**self).write(data, context, handler);
    }

    fn close(&self) {
        (**self).close();
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// 读端的便捷扩展。
pub trait PipeSourceExt: PipeSource {
    /// 以闭包形式发起读请求。
    fn read_with<F>(&self, length: usize, context: ContextRef, handler: F)
    where
        F: FnMut(ReadEvent) + Send + 'static,
    {
        self.read(length, context, Box::new(handler));
    }

    /// 发起读请求并汇总全部数据块。
    ///
    /// 失败时返回已收到的部分数据与错误。
    fn read_all(
        &self,
        length: usize,
    ) -> impl Future<Output = Result<Bytes, (Bytes, PipeError)>> + Send + 'static {
        let (sender, mut receiver) = unbounded_channel::<ReadEvent>();
        self.read_with(length, DirectContext::shared(), move |event| {
            let _ = sender.send(event);
        });
        async move {
            let mut collected = BytesMut::new();
            while let Some(event) = receiver.recv().await {
                collected.extend_from_slice(&event.data);
                if let Some(error) = event.error {
                    return Err((collected.freeze(), error));
                }
                if event.done {
                    break;
                }
            }
            Ok(collected.freeze())
        }
    }
}

impl<T: PipeSource + ?Sized> PipeSourceExt for T {}

/// 写端的便捷扩展。
pub trait PipeSinkExt: PipeSink {
    /// 以闭包形式发起写请求。
    fn write_with<F>(&self, data: Bytes, context: ContextRef, handler: F)
    where
        F: FnMut(WriteEvent) + Send + 'static,
    {
        self.write(data, context, Box::new(handler));
    }

    /// 写入全部数据并等待完成。
    ///
    /// 失败时返回尚未被接收的字节与错误。
    fn write_all(
        &self,
        data: Bytes,
    ) -> impl Future<Output = Result<(), (Bytes, PipeError)>> + Send + 'static {
        let (sender, mut receiver) = unbounded_channel::<WriteEvent>();
        self.write_with(data, DirectContext::shared(), move |event| {
            let _ = sender.send(event);
        });
        async move {
            while let Some(event) = receiver.recv().await {
                if let Some(error) = event.error {
                    return Err((event.remaining, error));
                }
                if event.done {
                    break;
                }
            }
            Ok(())
        }
    }
}

impl<T: PipeSink + ?Sized> PipeSinkExt for T {}
