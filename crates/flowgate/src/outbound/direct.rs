use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use tokio::net::{TcpStream, UdpSocket};

use crate::errors::ProxyError;
use crate::outbound::{Outbound, ProxyType};
use crate::resolve::Resolver;
use crate::transport::{BoxedDatagram, BoxedStream, OutboundDatagram};
use crate::types::Metadata;

/// Dials the destination itself, resolving the hostname when the flow
/// reached us unresolved.
pub struct Direct {
	name: Strng,
	resolver: Arc<dyn Resolver>,
}

impl Direct {
	pub fn new(name: Strng, resolver: Arc<dyn Resolver>) -> Arc<Direct> {
		Arc::new(Direct { name, resolver })
	}

	async fn destination(&self, metadata: &Metadata) -> Result<SocketAddr, ProxyError> {
		if let Some(addr) = metadata.udp_addr() {
			return Ok(addr);
		}
		let ip = self
			.resolver
			.resolve(&metadata.host)
			.await
			.map_err(|e| ProxyError::dial(strng::new(metadata.remote_addr()), e))?;
		Ok(SocketAddr::new(ip, metadata.dst_port))
	}
}

#[async_trait]
impl Outbound for Direct {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Direct
	}

	fn supports_udp(&self) -> bool {
		true
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		let dst = self.destination(metadata).await?;
		let stream = TcpStream::connect(dst)
			.await
			.map_err(|e| ProxyError::dial(strng::new(metadata.remote_addr()), e))?;
		let _ = stream.set_nodelay(true);
		Ok(Box::new(stream))
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		let bind: SocketAddr = match metadata.udp_addr() {
			Some(SocketAddr::V6(_)) => "[::]:0".parse().expect("addr"),
			_ => "0.0.0.0:0".parse().expect("addr"),
		};
		let socket = UdpSocket::bind(bind)
			.await
			.map_err(|e| ProxyError::dial(strng::new(metadata.remote_addr()), e))?;
		Ok(Arc::new(DirectDatagram { socket }))
	}
}

struct DirectDatagram {
	socket: UdpSocket,
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
	async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
		self.socket.send_to(buf, dst).await
	}

	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		self.socket.recv_from(buf).await
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	fn close(&self) {}
}
