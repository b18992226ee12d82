pub mod buffered;
pub mod pool;
pub mod socks4;
pub mod socks5;
pub mod tls;

use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can carry a proxied byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

impl std::fmt::Debug for dyn Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("BoxedStream")
	}
}

pub type BoxedStream = Box<dyn Stream>;

/// An outbound datagram endpoint bound by an adapter's `listen_packet`.
/// One of these backs each NAT session.
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
	async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;
	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
	fn local_addr(&self) -> io::Result<SocketAddr>;
	fn close(&self);
}

pub type BoxedDatagram = Arc<dyn OutboundDatagram>;
