use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use flowgate_core::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::errors::ProxyError;
use crate::outbound::{Outbound, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream, OutboundDatagram};
use crate::types::Metadata;

/// Black-holes flows: the dial succeeds structurally so the caller's
/// lifecycle runs as usual, but every read and write fails immediately.
pub struct Reject {
	name: Strng,
}

impl Reject {
	pub fn new(name: Strng) -> Arc<Reject> {
		Arc::new(Reject { name })
	}
}

#[async_trait]
impl Outbound for Reject {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Reject
	}

	fn supports_udp(&self) -> bool {
		true
	}

	async fn connect(&self, _metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		Ok(Box::new(RejectStream))
	}

	async fn listen_packet(&self, _metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		Ok(Arc::new(RejectDatagram))
	}
}

fn refused() -> io::Error {
	io::Error::new(io::ErrorKind::ConnectionRefused, "connection rejected")
}

struct RejectStream;

impl AsyncRead for RejectStream {
	fn poll_read(
		self: Pin<&mut Self>,
		_cx: &mut Context<'_>,
		_buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Poll::Ready(Err(refused()))
	}
}

impl AsyncWrite for RejectStream {
	fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
		Poll::Ready(Err(refused()))
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Err(refused()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

struct RejectDatagram;

#[async_trait]
impl OutboundDatagram for RejectDatagram {
	async fn send_to(&self, _buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
		Err(refused())
	}

	async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		Err(refused())
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		Ok(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
	}

	fn close(&self) {}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	#[tokio::test]
	async fn all_io_fails() {
		let reject = Reject::new(strng::new("REJECT"));
		let metadata = Metadata::new(InboundKind::Socks5, Network::Tcp);
		let mut conn = reject.connect(&metadata).await.unwrap();
		assert!(conn.write_all(b"x").await.is_err());
		let mut buf = [0u8; 1];
		assert!(conn.read(&mut buf).await.is_err());

		let pc = reject.listen_packet(&metadata).await.unwrap();
		assert!(
			pc.send_to(b"x", "1.1.1.1:53".parse().unwrap())
				.await
				.is_err()
		);
	}
}
