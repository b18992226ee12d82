use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::errors::ProxyError;
use crate::inbound::auth::Authenticator;
use crate::inbound::{Inbound, InboundType, User, metadata_for_target, set_keepalive};
use crate::transport::buffered::BufferedStream;
use crate::transport::pool::{BufferPool, UDP_BUFFER_SIZE};
use crate::transport::{socks4, socks5};
use crate::tunnel::{ConnContext, PacketAdapter, PacketWriter, Tunnel};
use crate::types::{InboundKind, Network};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SocksInboundOption {
	pub name: String,
	pub listen: String,
	pub port: u16,
	#[serde(default)]
	pub users: Vec<User>,
}

/// Mixed SOCKS listener: one TCP socket serving SOCKS4 and SOCKS5 (told
/// apart by peeking the version byte) and a UDP socket for SOCKS5
/// associations.
pub struct SocksInbound {
	name: Strng,
	raw_addr: Strng,
	local_addr: SocketAddr,
	handles: Vec<JoinHandle<()>>,
}

impl SocksInbound {
	pub async fn new(
		option: SocksInboundOption,
		tunnel: Arc<Tunnel>,
		pool: Arc<BufferPool>,
	) -> Result<Arc<SocksInbound>, ProxyError> {
		let raw_addr = crate::outbound::join_host_port(&option.listen, option.port);
		let tcp = TcpListener::bind(raw_addr.as_str())
			.await
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		// The UDP socket shares the TCP socket's concrete port, which may
		// have been assigned by the kernel.
		let tcp_local = tcp
			.local_addr()
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let udp = UdpSocket::bind(tcp_local)
			.await
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;
		let udp = Arc::new(udp);
		let udp_bind = udp
			.local_addr()
			.map_err(|e| ProxyError::dial(raw_addr.clone(), e))?;

		let authenticator = if option.users.is_empty() {
			None
		} else {
			let pairs: Vec<(String, String)> = option
				.users
				.iter()
				.map(|u| (u.username.clone(), u.password.clone()))
				.collect();
			Some(Arc::new(Authenticator::new(&pairs)))
		};

		let name = strng::new(&option.name);
		info!(inbound = %name, addr = %tcp_local, "SOCKS inbound listening");

		let mut handles = Vec::new();

		let accept_name = name.clone();
		let accept_tunnel = tunnel.clone();
		let accept_auth = authenticator.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let (stream, peer) = match tcp.accept().await {
					Ok(accepted) => accepted,
					Err(e) => {
						debug!(err = %e, "socks accept failed");
						continue;
					},
				};
				let tunnel = accept_tunnel.clone();
				let auth = accept_auth.clone();
				let inbound = accept_name.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_tcp(stream, peer, udp_bind, tunnel, auth, inbound).await {
						debug!(err = %e, "socks handshake failed");
					}
				});
			}
		}));

		let udp_name = name.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let mut buffer = pool.get_pooled();
				buffer.buf_mut().resize(UDP_BUFFER_SIZE, 0);
				let (n, from) = match udp.recv_from(buffer.buf_mut()).await {
					Ok(received) => received,
					Err(e) => {
						debug!(err = %e, "socks udp recv failed");
						continue;
					},
				};
				buffer.buf_mut().truncate(n);

				let (target, offset) = match socks5::decode_udp_packet(&buffer) {
					Ok(decoded) => decoded,
					// Undecodable datagram: the buffer goes back to the pool
					// as the borrow drops.
					Err(_) => continue,
				};

				let metadata = metadata_for_target(
					&target,
					InboundKind::Socks5,
					Network::Udp,
					udp_name.clone(),
					from,
				);
				let writer = Arc::new(SocksPacketWriter {
					socket: udp.clone(),
					client: from,
				});
				tunnel.submit_udp(PacketAdapter::new(buffer, offset, writer, metadata));
			}
		}));

		Ok(Arc::new(SocksInbound {
			name,
			raw_addr,
			local_addr: tcp_local,
			handles,
		}))
	}
}

async fn handle_tcp(
	stream: TcpStream,
	peer: SocketAddr,
	udp_bind: SocketAddr,
	tunnel: Arc<Tunnel>,
	auth: Option<Arc<Authenticator>>,
	inbound: Strng,
) -> io::Result<()> {
	set_keepalive(&stream);
	let mut buffered = BufferedStream::new(stream);
	let version = buffered.peek(1).await?[0];
	match version {
		socks4::VERSION => {
			let target = socks4::server_handshake(&mut buffered, auth.as_deref()).await?;
			let metadata =
				metadata_for_target(&target, InboundKind::Socks4, Network::Tcp, inbound, peer);
			tunnel
				.submit_tcp(ConnContext {
					stream: Box::new(buffered),
					metadata,
				})
				.await;
		},
		socks5::VERSION => {
			let (target, command) =
				socks5::server_handshake(&mut buffered, auth.as_deref(), udp_bind).await?;
			if command == socks5::CMD_UDP_ASSOCIATE {
				// The association lives as long as this control connection;
				// drain it until the client goes away.
				let mut sink = [0u8; 512];
				loop {
					match buffered.read(&mut sink).await {
						Ok(0) | Err(_) => return Ok(()),
						Ok(_) => {},
					}
				}
			}
			let metadata =
				metadata_for_target(&target, InboundKind::Socks5, Network::Tcp, inbound, peer);
			tunnel
				.submit_tcp(ConnContext {
					stream: Box::new(buffered),
					metadata,
				})
				.await;
		},
		_ => {
			// Not a SOCKS client; close silently.
		},
	}
	Ok(())
}

/// Replies ride the listener socket, SOCKS5-encapsulated with the remote
/// source as the embedded address.
struct SocksPacketWriter {
	socket: Arc<UdpSocket>,
	client: SocketAddr,
}

#[async_trait]
impl PacketWriter for SocksPacketWriter {
	async fn write_back(&self, buf: &[u8], from: SocketAddr) -> io::Result<usize> {
		let packet = socks5::encode_udp_packet(&socks5::SocksAddr::Ip(from), buf);
		self.socket.send_to(&packet, self.client).await?;
		Ok(buf.len())
	}

	fn local_addr(&self) -> SocketAddr {
		self.client
	}
}

impl Inbound for SocksInbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn kind(&self) -> InboundType {
		InboundType::Socks
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
		info!(inbound = %self.name, "SOCKS inbound closed");
	}
}
