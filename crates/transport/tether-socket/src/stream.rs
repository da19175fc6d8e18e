//! 已连接描述符上的 `AsyncRead`/`AsyncWrite` 适配，供管道引擎驱动。

use std::{
    io::{self, Read},
    net::Shutdown,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use socket2::Socket;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, unix::AsyncFd};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const SEND_FLAGS: libc::c_int = 0;

/// 共享描述符的字节流视图。
///
/// 读端与写端各持一个克隆；反应器分别跟踪读写就绪，两者互不阻塞。
/// `EINTR` 与伪就绪在轮询内部重试，不会传播给管道。
/// 描述符已被套接字释放时，所有操作以 `NotConnected` 失败。
#[derive(Clone, Debug)]
pub struct SocketStream {
    fd: Option<Arc<AsyncFd<Socket>>>,
}

impl SocketStream {
    pub(crate) fn new(fd: Option<Arc<AsyncFd<Socket>>>) -> Self {
        Self { fd }
    }

    fn descriptor(&self) -> io::Result<&AsyncFd<Socket>> {
        self.fd
            .as_deref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let fd = self.descriptor()?;
        loop {
            let mut guard = ready!(fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(unfilled)
            }) {
                Ok(Ok(read)) => {
                    buf.advance(read);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let fd = self.descriptor()?;
        loop {
            let mut guard = ready!(fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().send_with_flags(buf, SEND_FLAGS)) {
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.descriptor()?.get_ref().shutdown(Shutdown::Write))
    }
}
