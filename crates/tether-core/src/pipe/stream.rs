use std::{fmt, io, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, trace};

use super::{PipeSink, PipeSource, ReadEvent, ReadHandler, WriteEvent, WriteHandler};
use crate::{
    cancel::CancelTicketSource,
    config::PipeConfig,
    dispatch::{ContextRef, Emitter},
    error::{PipeError, PipeErrorKind},
    reactor::Reactor,
};

/// 以任意 [`AsyncRead`] 为后端的管道读端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将 Tokio 的拉取式读取适配为“按块回调”的推送式契约，使文件、内存双工流与套接字共享同一引擎；
///
/// ## 逻辑 (How)
/// - 读取器置于 `tokio::sync::Mutex` 内：该锁按 FIFO 交付，天然保证同一端点上挂起请求的公平性；
/// - 每个请求在反应器上运行一个任务，循环执行单次读取，每推进一块即派发一次事件；
/// - `close` 触发内部 [`CancelTicketSource`]，所有等待锁或等待读取的任务在 `select!` 中
///   观测到关闭并以 `Closed` 完成，随后读取器被释放。
///
/// ## 契约 (What)
/// - `ErrorKind::Interrupted` 在内部重试，调用方不可见；
/// - 读到 EOF 时以空数据块、`done == true` 结束请求；指定长度已满足时，最后一块即携带 `done == true`。
pub struct StreamSource<R> {
    shared: Arc<SourceShared<R>>,
}

struct SourceShared<R> {
    reader: AsyncMutex<Option<R>>,
    closer: CancelTicketSource,
    reactor: Reactor,
    config: PipeConfig,
}

impl<R> StreamSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// 在当前（或回退）反应器上以默认配置创建。
    pub fn new(reader: R) -> io::Result<Self> {
        Ok(Self::with_reactor(reader, Reactor::current()?, PipeConfig::default()))
    }

    /// 在指定反应器上以给定分块配置创建。
    pub fn with_reactor(reader: R, reactor: Reactor, config: PipeConfig) -> Self {
        Self {
            shared: Arc::new(SourceShared {
                reader: AsyncMutex::new(Some(reader)),
                closer: CancelTicketSource::new(),
                reactor,
                config,
            }),
        }
    }
}

impl<R> SourceShared<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn run(self: Arc<Self>, length: usize, emitter: Emitter<ReadEvent>) {
        let closed = self.closer.ticket();
        let mut guard = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                emitter.emit(ReadEvent::failed(PipeError::closed()));
                return;
            }
            guard = self.reader.lock() => guard,
        };
        let Some(reader) = guard.as_mut() else {
            emitter.emit(ReadEvent::failed(PipeError::closed()));
            return;
        };

        let mut delivered = 0usize;
        loop {
            let want = match length {
                0 => self.config.read_chunk(),
                _ => self.config.read_chunk().min(length - delivered),
            };
            let mut buffer = vec![0u8; want];
            let result = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    emitter.emit(ReadEvent::failed(PipeError::closed()));
                    return;
                }
                result = reader.read(&mut buffer) => result,
            };
            match result {
                Ok(0) => {
                    trace!(delivered, "pipe source reached end of stream");
                    emitter.emit(ReadEvent::end());
                    return;
                }
                Ok(read) => {
                    delivered += read;
                    buffer.truncate(read);
                    let done = length != 0 && delivered >= length;
                    emitter.emit(ReadEvent::chunk(Bytes::from(buffer), done));
                    if done {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    emitter.emit(ReadEvent::failed(PipeError::from_io(
                        err,
                        PipeErrorKind::Read,
                    )));
                    return;
                }
            }
        }
    }
}

impl<R> PipeSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn read(&self, length: usize, context: ContextRef, handler: ReadHandler) {
        let emitter = Emitter::new(handler, context);
        if self.is_closed() {
            emitter.emit(ReadEvent::failed(PipeError::closed()));
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.reactor.spawn(shared.run(length, emitter));
    }

    fn close(&self) {
        if !self.shared.closer.cancel() {
            return;
        }
        debug!("pipe source closed");
        let shared = Arc::clone(&self.shared);
        self.shared.reactor.spawn(async move {
            shared.reader.lock().await.take();
        });
    }

    fn is_closed(&self) -> bool {
        self.shared.closer.is_cancelled()
    }
}

impl<R> Clone for StreamSource<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> fmt::Debug for StreamSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("closed", &self.shared.closer.is_cancelled())
            .finish()
    }
}

/// 以任意 [`AsyncWrite`] 为后端的管道写端。
///
/// 克隆共享同一写入器与关闭状态。与 [`StreamSource`] 对称：写入器由 FIFO 锁保护，每次部分写入后派发剩余缓冲；
/// 关闭时挂起请求以 `Closed` 完成并携带尚未被接收的字节。
pub struct StreamSink<W> {
    shared: Arc<SinkShared<W>>,
}

struct SinkShared<W> {
    writer: AsyncMutex<Option<W>>,
    closer: CancelTicketSource,
    reactor: Reactor,
    config: PipeConfig,
}

impl<W> StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// 在当前（或回退）反应器上以默认配置创建。
    pub fn new(writer: W) -> io::Result<Self> {
        Ok(Self::with_reactor(writer, Reactor::current()?, PipeConfig::default()))
    }

    /// 在指定反应器上以给定分块配置创建。
    pub fn with_reactor(writer: W, reactor: Reactor, config: PipeConfig) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                writer: AsyncMutex::new(Some(writer)),
                closer: CancelTicketSource::new(),
                reactor,
                config,
            }),
        }
    }
}

impl<W> SinkShared<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self: Arc<Self>, data: Bytes, emitter: Emitter<WriteEvent>) {
        let closed = self.closer.ticket();
        let mut guard = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                emitter.emit(WriteEvent::failed(data, PipeError::closed()));
                return;
            }
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            emitter.emit(WriteEvent::failed(data, PipeError::closed()));
            return;
        };

        if data.is_empty() {
            let result = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    emitter.emit(WriteEvent::failed(data, PipeError::closed()));
                    return;
                }
                result = writer.flush() => result,
            };
            match result {
                Ok(()) => emitter.emit(WriteEvent::progress(data)),
                Err(err) => emitter.emit(WriteEvent::failed(
                    data,
                    PipeError::from_io(err, PipeErrorKind::Write),
                )),
            }
            return;
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            let span = remaining.len().min(self.config.write_chunk());
            let result = tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    emitter.emit(WriteEvent::failed(remaining, PipeError::closed()));
                    return;
                }
                result = writer.write(&remaining[..span]) => result,
            };
            match result {
                Ok(0) => {
                    let err = io::Error::from(io::ErrorKind::WriteZero);
                    emitter.emit(WriteEvent::failed(
                        remaining,
                        PipeError::from_io(err, PipeErrorKind::Write),
                    ));
                    return;
                }
                Ok(written) => {
                    let _ = remaining.split_to(written);
                    emitter.emit(WriteEvent::progress(remaining.clone()));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    emitter.emit(WriteEvent::failed(
                        remaining,
                        PipeError::from_io(err, PipeErrorKind::Write),
                    ));
                    return;
                }
            }
        }
    }
}

impl<W> PipeSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write(&self, data: Bytes, context: ContextRef, handler: WriteHandler) {
        let emitter = Emitter::new(handler, context);
        if self.is_closed() {
            emitter.emit(WriteEvent::failed(data, PipeError::closed()));
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.reactor.spawn(shared.run(data, emitter));
    }

    fn close(&self) {
        if !self.shared.closer.cancel() {
            return;
        }
        debug!("pipe sink closed");
        let shared = Arc::clone(&self.shared);
        self.shared.reactor.spawn(async move {
            shared.writer.lock().await.take();
        });
    }

    fn is_closed(&self) -> bool {
        self.shared.closer.is_cancelled()
    }
}

impl<W> Clone for StreamSink<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W> fmt::Debug for StreamSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("closed", &self.shared.closer.is_cancelled())
            .finish()
    }
}
