use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::errors::ProxyError;
use crate::inbound::{Inbound, InboundType, metadata_for_target, set_keepalive};
use crate::transport::pool::{BufferPool, UDP_BUFFER_SIZE};
use crate::transport::socks5::SocksAddr;
use crate::tunnel::{ConnContext, PacketAdapter, PacketWriter, Tunnel};
use crate::types::{InboundKind, Network};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RedirectInboundOption {
	pub name: String,
	pub listen: String,
	pub port: u16,
	/// Every accepted flow is forwarded here, whatever the client asked.
	pub redirect_addr: String,
}

/// Transparent forwarder: the destination is fixed in configuration, so
/// clients need no proxy handshake at all.
pub struct RedirectInbound {
	name: Strng,
	raw_addr: Strng,
	local_addr: SocketAddr,
	handles: Vec<JoinHandle<()>>,
}

impl RedirectInbound {
	pub async fn new(
		option: RedirectInboundOption,
		tunnel: Arc<Tunnel>,
		pool: Arc<BufferPool>,
	) -> Result<Arc<RedirectInbound>, ProxyError> {
		let target = SocksAddr::parse(&option.redirect_addr).ok_or_else(|| {
			ProxyError::InvalidConfig(format!("bad redirect-addr {}", option.redirect_addr))
		})?;

		let raw_addr = crate::outbound::join_host_port(&option.listen, option.port);
		let tcp = TcpListener::bind(raw_addr.as_str())
			.await
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let tcp_local = tcp
			.local_addr()
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let udp = UdpSocket::bind(tcp_local)
			.await
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let udp = Arc::new(udp);

		let name = strng::new(&option.name);
		info!(inbound = %name, addr = %tcp_local, "redirect inbound listening");

		let mut handles = Vec::new();

		let accept_name = name.clone();
		let accept_target = target.clone();
		let accept_tunnel = tunnel.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let (stream, peer) = match tcp.accept().await {
					Ok(accepted) => accepted,
					Err(e) => {
						debug!(err = %e, "redirect accept failed");
						continue;
					},
				};
				set_keepalive(&stream);
				let metadata = metadata_for_target(
					&accept_target,
					InboundKind::Redir,
					Network::Tcp,
					accept_name.clone(),
					peer,
				);
				accept_tunnel
					.submit_tcp(ConnContext {
						stream: Box::new(stream),
						metadata,
					})
					.await;
			}
		}));

		let udp_name = name.clone();
		let udp_target = target.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let mut buffer = pool.get_pooled();
				buffer.buf_mut().resize(UDP_BUFFER_SIZE, 0);
				let (n, from) = match udp.recv_from(buffer.buf_mut()).await {
					Ok(received) => received,
					Err(e) => {
						debug!(err = %e, "redirect udp recv failed");
						continue;
					},
				};
				buffer.buf_mut().truncate(n);

				let metadata = metadata_for_target(
					&udp_target,
					InboundKind::Redir,
					Network::Udp,
					udp_name.clone(),
					from,
				);
				let writer = Arc::new(RawPacketWriter {
					socket: udp.clone(),
					client: from,
				});
				tunnel.submit_udp(PacketAdapter::new(buffer, 0, writer, metadata));
			}
		}));

		Ok(Arc::new(RedirectInbound {
			name,
			raw_addr,
			local_addr: tcp_local,
			handles,
		}))
	}
}

/// Replies go back raw; redirect clients speak no encapsulation.
struct RawPacketWriter {
	socket: Arc<UdpSocket>,
	client: SocketAddr,
}

#[async_trait]
impl PacketWriter for RawPacketWriter {
	async fn write_back(&self, buf: &[u8], _from: SocketAddr) -> io::Result<usize> {
		self.socket.send_to(buf, self.client).await
	}

	fn local_addr(&self) -> SocketAddr {
		self.client
	}
}

impl Inbound for RedirectInbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn kind(&self) -> InboundType {
		InboundType::Redirect
	}

	fn raw_address(&self) -> Strng {
		self.raw_addr.clone()
	}

	fn local_address(&self) -> SocketAddr {
		self.local_addr
	}

	fn close(&self) {
		for handle in &self.handles {
			handle.abort();
		}
		info!(inbound = %self.name, "redirect inbound closed");
	}
}
