use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A stream wrapper that can peek ahead of the read cursor. The SOCKS
/// listener uses this to sniff the version byte before committing to a
/// handshake; the HTTP outbound uses it to sniff for a request line.
pub struct BufferedStream<S> {
	inner: S,
	buf: BytesMut,
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
	pub fn new(inner: S) -> Self {
		BufferedStream {
			inner,
			buf: BytesMut::new(),
		}
	}

	/// Returns at least `n` buffered bytes without consuming them, reading
	/// from the underlying stream as needed. Errors with UnexpectedEof if
	/// the stream ends first.
	pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
		while self.buf.len() < n {
			let read = self.inner.read_buf(&mut self.buf).await?;
			if read == 0 {
				return Err(io::ErrorKind::UnexpectedEof.into());
			}
		}
		Ok(&self.buf[..n])
	}

	/// Like `peek`, but gives up after `deadline` and returns whatever has
	/// arrived so far (possibly fewer than `n` bytes).
	pub async fn peek_until(&mut self, n: usize, deadline: std::time::Duration) -> io::Result<&[u8]> {
		let _ = tokio::time::timeout(deadline, async {
			while self.buf.len() < n {
				if self.inner.read_buf(&mut self.buf).await? == 0 {
					break;
				}
			}
			Ok::<_, io::Error>(())
		})
		.await;
		let have = self.buf.len().min(n);
		Ok(&self.buf[..have])
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		if !self.buf.is_empty() {
			let n = self.buf.len().min(buf.remaining());
			buf.put_slice(&self.buf[..n]);
			self.buf.advance(n);
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}
