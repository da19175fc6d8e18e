use bytes::Bytes;

use super::{PipeSink, PipeSource, ReadHandler, WriteHandler};
use crate::dispatch::ContextRef;

/// 将一个读端与一个写端组合为单一生命周期的双向管道。
///
/// 读请求转发给读端、写请求转发给写端；关闭组合体即关闭两端。
#[derive(Debug)]
pub struct SymmetricPipe<S, K> {
    source: S,
    sink: K,
}

impl<S, K> SymmetricPipe<S, K>
where
    S: PipeSource,
    K: PipeSink,
{
    pub fn new(source: S, sink: K) -> Self {
        Self { source, sink }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// 拆回两端；之后两端的生命周期各自独立。
    pub fn into_parts(self) -> (S, K) {
        (self.source, self.sink)
    }
}

impl<S, K> PipeSource for SymmetricPipe<S, K>
where
    S: PipeSource,
    K: PipeSink,
{
    fn read(&self, length: usize, context: ContextRef, handler: ReadHandler) {
        self.source.read(length, context, handler);
    }

    fn close(&self) {
        self.source.close();
        self.sink.close();
    }

    fn is_closed(&self) -> bool {
        self.source.is_closed() && self.sink.is_closed()
    }
}

impl<S, K> PipeSink for SymmetricPipe<S, K>
where
    S: PipeSource,
    K: PipeSink,
{
    fn write(&self, data: Bytes, context: ContextRef, handler: WriteHandler) {
        self.sink.write(data, context, handler);
    }

    fn close(&self) {
        self.source.close();
        self.sink.close();
    }

    fn is_closed(&self) -> bool {
        self.source.is_closed() && self.sink.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{PipeSinkExt, PipeSourceExt, StreamSink, StreamSource};

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_composite_closes_both_sides() {
        let (writer, reader) = tokio::io::duplex(64);
        let pipe = SymmetricPipe::new(
            StreamSource::new(reader).expect("reactor"),
            StreamSink::new(writer).expect("reactor"),
        );

        pipe.write_all(Bytes::from_static(b"ping"))
            .await
            .expect("write");
        let echoed = pipe.read_all(4).await.expect("read");
        assert_eq!(&echoed[..], b"ping");

        PipeSource::close(&pipe);
        assert!(pipe.source().is_closed());
        assert!(pipe.sink().is_closed());
        assert!(PipeSink::is_closed(&pipe));
    }
}
