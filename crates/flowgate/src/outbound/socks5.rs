use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket, lookup_host};

use crate::errors::ProxyError;
use crate::outbound::{Outbound, ProxyType, join_host_port};
use crate::transport::socks5::{self, SocksAddr};
use crate::transport::{BoxedDatagram, BoxedStream, OutboundDatagram};
use crate::types::Metadata;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Socks5OutboundOption {
	pub name: String,
	pub server: String,
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub udp: bool,
}

pub struct Socks5Outbound {
	name: Strng,
	addr: Strng,
	credentials: Option<(String, String)>,
	udp: bool,
}

impl Socks5Outbound {
	pub fn new(option: Socks5OutboundOption) -> Arc<Socks5Outbound> {
		let credentials = match (option.username, option.password) {
			(Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
			_ => None,
		};
		Arc::new(Socks5Outbound {
			name: strng::new(option.name),
			addr: join_host_port(&option.server, option.port),
			credentials,
			udp: option.udp,
		})
	}

	fn credentials(&self) -> Option<(&str, &str)> {
		self
			.credentials
			.as_ref()
			.map(|(u, p)| (u.as_str(), p.as_str()))
	}

	fn target(metadata: &Metadata) -> Result<SocksAddr, ProxyError> {
		if !metadata.host.is_empty() {
			Ok(SocksAddr::Domain(metadata.host.clone(), metadata.dst_port))
		} else if let Some(addr) = metadata.udp_addr() {
			Ok(SocksAddr::Ip(addr))
		} else {
			Err(ProxyError::AddressUnsupported)
		}
	}
}

#[async_trait]
impl Outbound for Socks5Outbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Socks5
	}

	fn addr(&self) -> Option<Strng> {
		Some(self.addr.clone())
	}

	fn supports_udp(&self) -> bool {
		self.udp
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		let stream = TcpStream::connect(self.addr.as_str())
			.await
			.map_err(|e| ProxyError::dial(self.addr.clone(), e))?;
		let _ = stream.set_nodelay(true);
		self.stream_through(Some(Box::new(stream)), metadata).await
	}

	async fn stream_through(
		&self,
		underlying: Option<BoxedStream>,
		metadata: &Metadata,
	) -> Result<BoxedStream, ProxyError> {
		let mut stream = underlying.ok_or(ProxyError::EmptyConnection)?;
		let target = Self::target(metadata)?;
		socks5::client_handshake(
			&mut stream,
			&target,
			socks5::CMD_CONNECT,
			self.credentials(),
		)
		.await
		.map_err(|e| ProxyError::HandshakeFailed(format!("{}: {e}", self.addr)))?;
		Ok(stream)
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		if !self.udp {
			return Err(ProxyError::UdpUnsupported(self.name.clone()));
		}
		let mut control = TcpStream::connect(self.addr.as_str())
			.await
			.map_err(|e| ProxyError::dial(self.addr.clone(), e))?;
		// Target in the associate request is advisory; 0.0.0.0:0 keeps the
		// association usable for the whole session.
		let associate = SocksAddr::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
		let bound = socks5::client_handshake(
			&mut control,
			&associate,
			socks5::CMD_UDP_ASSOCIATE,
			self.credentials(),
		)
		.await
		.map_err(|e| ProxyError::HandshakeFailed(format!("{}: {e}", self.addr)))?;

		let relay = self.resolve_relay(bound).await?;
		let socket = UdpSocket::bind(if relay.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" })
			.await
			.map_err(|e| ProxyError::dial(self.addr.clone(), e))?;
		let _ = metadata;
		Ok(Arc::new(Socks5Datagram {
			socket,
			relay,
			_control: control,
		}))
	}
}

impl Socks5Outbound {
	/// The server tells us where to send encapsulated datagrams; an
	/// unspecified address means "same host as the proxy".
	async fn resolve_relay(&self, bound: SocksAddr) -> Result<SocketAddr, ProxyError> {
		let server_ip = async {
			lookup_host(self.addr.as_str())
				.await
				.ok()
				.and_then(|mut addrs| addrs.next())
				.map(|sa| sa.ip())
		};
		match bound {
			SocksAddr::Ip(sa) if !sa.ip().is_unspecified() => Ok(sa),
			SocksAddr::Ip(sa) => {
				let ip = server_ip
					.await
					.ok_or_else(|| ProxyError::HandshakeFailed("cannot resolve relay".to_string()))?;
				Ok(SocketAddr::new(ip, sa.port()))
			},
			SocksAddr::Domain(name, port) => {
				let addr = lookup_host((name.as_str(), port))
					.await
					.ok()
					.and_then(|mut addrs| addrs.next())
					.ok_or_else(|| ProxyError::HandshakeFailed("cannot resolve relay".to_string()))?;
				Ok(addr)
			},
		}
	}
}

/// Datagrams ride the association: every payload is SOCKS5-encapsulated
/// toward the relay, and the TCP control connection is held open for the
/// lifetime of the session.
struct Socks5Datagram {
	socket: UdpSocket,
	relay: SocketAddr,
	_control: TcpStream,
}

#[async_trait]
impl OutboundDatagram for Socks5Datagram {
	async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
		let packet = socks5::encode_udp_packet(&SocksAddr::Ip(dst), buf);
		self.socket.send_to(&packet, self.relay).await?;
		Ok(buf.len())
	}

	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let mut raw = vec![0u8; crate::transport::pool::UDP_BUFFER_SIZE];
		loop {
			let (n, _) = self.socket.recv_from(&mut raw).await?;
			let Ok((from, offset)) = socks5::decode_udp_packet(&raw[..n]) else {
				continue;
			};
			let from = match from {
				SocksAddr::Ip(sa) => sa,
				// Remote sources are addresses, not names; drop oddballs.
				SocksAddr::Domain(_, _) => continue,
			};
			let payload = &raw[offset..n];
			let len = payload.len().min(buf.len());
			buf[..len].copy_from_slice(&payload[..len]);
			return Ok((len, from));
		}
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	fn close(&self) {}
}
