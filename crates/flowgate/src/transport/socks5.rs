//! SOCKS5 wire protocol: address codec, server/client handshakes, and the
//! UDP encapsulation header (RFC 1928 / RFC 1929).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flowgate_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::inbound::auth::Authenticator;

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// A SOCKS destination: a socket address or a domain name with port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
	Ip(SocketAddr),
	Domain(Strng, u16),
}

impl SocksAddr {
	pub fn port(&self) -> u16 {
		match self {
			SocksAddr::Ip(sa) => sa.port(),
			SocksAddr::Domain(_, port) => *port,
		}
	}

	/// Parses "host:port", treating a non-IP host as a domain.
	pub fn parse(s: &str) -> Option<SocksAddr> {
		if let Ok(sa) = s.parse::<SocketAddr>() {
			return Some(SocksAddr::Ip(sa));
		}
		let (host, port) = s.rsplit_once(':')?;
		let port = port.parse::<u16>().ok()?;
		if host.is_empty() {
			return None;
		}
		Some(SocksAddr::Domain(strng::new(host), port))
	}

	pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<SocksAddr> {
		let atyp = r.read_u8().await?;
		match atyp {
			ATYP_IPV4 => {
				let mut octets = [0u8; 4];
				r.read_exact(&mut octets).await?;
				let port = r.read_u16().await?;
				Ok(SocksAddr::Ip(SocketAddr::new(
					Ipv4Addr::from(octets).into(),
					port,
				)))
			},
			ATYP_IPV6 => {
				let mut octets = [0u8; 16];
				r.read_exact(&mut octets).await?;
				let port = r.read_u16().await?;
				Ok(SocksAddr::Ip(SocketAddr::new(
					Ipv6Addr::from(octets).into(),
					port,
				)))
			},
			ATYP_DOMAIN => {
				let len = r.read_u8().await? as usize;
				let mut name = vec![0u8; len];
				r.read_exact(&mut name).await?;
				let port = r.read_u16().await?;
				let name = String::from_utf8(name)
					.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "domain is not utf-8"))?;
				Ok(SocksAddr::Domain(strng::new(name), port))
			},
			_ => Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"unsupported address type",
			)),
		}
	}

	pub fn write_to(&self, buf: &mut BytesMut) {
		match self {
			SocksAddr::Ip(SocketAddr::V4(sa)) => {
				buf.put_u8(ATYP_IPV4);
				buf.put_slice(&sa.ip().octets());
				buf.put_u16(sa.port());
			},
			SocksAddr::Ip(SocketAddr::V6(sa)) => {
				buf.put_u8(ATYP_IPV6);
				buf.put_slice(&sa.ip().octets());
				buf.put_u16(sa.port());
			},
			SocksAddr::Domain(name, port) => {
				buf.put_u8(ATYP_DOMAIN);
				buf.put_u8(name.len() as u8);
				buf.put_slice(name.as_bytes());
				buf.put_u16(*port);
			},
		}
	}

	fn read_from_slice(buf: &mut &[u8]) -> io::Result<SocksAddr> {
		let short = || io::Error::new(io::ErrorKind::InvalidData, "truncated address");
		if buf.is_empty() {
			return Err(short());
		}
		let atyp = buf.get_u8();
		match atyp {
			ATYP_IPV4 => {
				if buf.len() < 6 {
					return Err(short());
				}
				let ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
				Ok(SocksAddr::Ip(SocketAddr::new(ip.into(), buf.get_u16())))
			},
			ATYP_IPV6 => {
				if buf.len() < 18 {
					return Err(short());
				}
				let mut octets = [0u8; 16];
				buf.copy_to_slice(&mut octets);
				Ok(SocksAddr::Ip(SocketAddr::new(
					Ipv6Addr::from(octets).into(),
					buf.get_u16(),
				)))
			},
			ATYP_DOMAIN => {
				if buf.is_empty() {
					return Err(short());
				}
				let len = buf.get_u8() as usize;
				if buf.len() < len + 2 {
					return Err(short());
				}
				let name = String::from_utf8(buf[..len].to_vec())
					.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "domain is not utf-8"))?;
				buf.advance(len);
				Ok(SocksAddr::Domain(strng::new(name), buf.get_u16()))
			},
			_ => Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"unsupported address type",
			)),
		}
	}
}

impl Display for SocksAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SocksAddr::Ip(sa) => write!(f, "{sa}"),
			SocksAddr::Domain(name, port) => write!(f, "{name}:{port}"),
		}
	}
}

impl From<SocketAddr> for SocksAddr {
	fn from(sa: SocketAddr) -> Self {
		SocksAddr::Ip(sa)
	}
}

/// Server side of the SOCKS5 handshake: negotiates the auth method
/// (USER/PASS when an authenticator is configured), reads the request, and
/// acknowledges it. Returns the requested target and command.
///
/// `udp_bind` is the address returned for UDP-ASSOCIATE requests.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
	stream: &mut S,
	authenticator: Option<&Authenticator>,
	udp_bind: SocketAddr,
) -> io::Result<(SocksAddr, u8)> {
	let ver = stream.read_u8().await?;
	if ver != VERSION {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
	}
	let nmethods = stream.read_u8().await? as usize;
	let mut methods = vec![0u8; nmethods];
	stream.read_exact(&mut methods).await?;

	match authenticator {
		Some(auth) => {
			if !methods.contains(&METHOD_USER_PASS) {
				stream.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
				return Err(io::Error::new(
					io::ErrorKind::PermissionDenied,
					"client does not support user/pass auth",
				));
			}
			stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;
			// RFC 1929 sub-negotiation.
			let _sub_ver = stream.read_u8().await?;
			let ulen = stream.read_u8().await? as usize;
			let mut user = vec![0u8; ulen];
			stream.read_exact(&mut user).await?;
			let plen = stream.read_u8().await? as usize;
			let mut pass = vec![0u8; plen];
			stream.read_exact(&mut pass).await?;
			let ok = auth.verify(
				std::str::from_utf8(&user).unwrap_or_default(),
				std::str::from_utf8(&pass).unwrap_or_default(),
			);
			stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
			if !ok {
				return Err(io::Error::new(
					io::ErrorKind::PermissionDenied,
					"auth failed",
				));
			}
		},
		None => {
			stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
		},
	}

	let mut head = [0u8; 3];
	stream.read_exact(&mut head).await?;
	if head[0] != VERSION {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
	}
	let command = head[1];
	let target = SocksAddr::read_from(stream).await?;

	let mut reply = BytesMut::with_capacity(32);
	match command {
		CMD_CONNECT => {
			reply.put_slice(&[VERSION, REP_SUCCESS, 0x00]);
			SocksAddr::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).write_to(&mut reply);
		},
		CMD_UDP_ASSOCIATE => {
			reply.put_slice(&[VERSION, REP_SUCCESS, 0x00]);
			SocksAddr::Ip(udp_bind).write_to(&mut reply);
		},
		_ => {
			reply.put_slice(&[VERSION, REP_COMMAND_NOT_SUPPORTED, 0x00]);
			SocksAddr::Ip(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)).write_to(&mut reply);
			stream.write_all(&reply).await?;
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"unsupported command",
			));
		},
	}
	stream.write_all(&reply).await?;

	Ok((target, command))
}

/// Client side of the SOCKS5 handshake toward an upstream server. Returns
/// the server-reported bound address (meaningful for UDP-ASSOCIATE).
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
	stream: &mut S,
	target: &SocksAddr,
	command: u8,
	credentials: Option<(&str, &str)>,
) -> io::Result<SocksAddr> {
	match credentials {
		Some(_) => {
			stream
				.write_all(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS])
				.await?
		},
		None => stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?,
	}
	let mut resp = [0u8; 2];
	stream.read_exact(&mut resp).await?;
	match resp[1] {
		METHOD_NO_AUTH => {},
		METHOD_USER_PASS => {
			let (user, pass) = credentials.ok_or_else(|| {
				io::Error::new(io::ErrorKind::PermissionDenied, "server requires auth")
			})?;
			let mut req = BytesMut::with_capacity(3 + user.len() + pass.len());
			req.put_u8(0x01);
			req.put_u8(user.len() as u8);
			req.put_slice(user.as_bytes());
			req.put_u8(pass.len() as u8);
			req.put_slice(pass.as_bytes());
			stream.write_all(&req).await?;
			let mut status = [0u8; 2];
			stream.read_exact(&mut status).await?;
			if status[1] != 0x00 {
				return Err(io::Error::new(
					io::ErrorKind::PermissionDenied,
					"auth rejected",
				));
			}
		},
		_ => {
			return Err(io::Error::new(
				io::ErrorKind::PermissionDenied,
				"no acceptable auth method",
			));
		},
	}

	let mut req = BytesMut::with_capacity(32);
	req.put_slice(&[VERSION, command, 0x00]);
	target.write_to(&mut req);
	stream.write_all(&req).await?;

	let mut head = [0u8; 3];
	stream.read_exact(&mut head).await?;
	if head[1] != REP_SUCCESS {
		return Err(io::Error::new(
			io::ErrorKind::ConnectionRefused,
			format!("socks5 request rejected: {:#04x}", head[1]),
		));
	}
	SocksAddr::read_from(stream).await
}

/// Decodes a SOCKS5-encapsulated UDP datagram header: RSV(2) FRAG(1) ADDR
/// PORT PAYLOAD. Returns the target and the payload offset into `raw`, so
/// pooled buffers can be sliced in place. Fragments are not supported.
pub fn decode_udp_packet(raw: &[u8]) -> io::Result<(SocksAddr, usize)> {
	if raw.len() < 3 {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "short packet"));
	}
	if raw[2] != 0 {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			"fragmented packets unsupported",
		));
	}
	let mut rest = &raw[3..];
	let target = SocksAddr::read_from_slice(&mut rest)?;
	let offset = raw.len() - rest.len();
	Ok((target, offset))
}

/// Encapsulates a payload for delivery to a SOCKS5 UDP client, stamping
/// `from` as the remote source address.
pub fn encode_udp_packet(from: &SocksAddr, payload: &[u8]) -> Bytes {
	let mut buf = BytesMut::with_capacity(payload.len() + 32);
	buf.put_slice(&[0x00, 0x00, 0x00]);
	from.write_to(&mut buf);
	buf.put_slice(payload);
	buf.freeze()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn addr_codec_round_trips() {
		for addr in [
			SocksAddr::Ip("1.2.3.4:53".parse().unwrap()),
			SocksAddr::Ip("[2001:db8::1]:443".parse().unwrap()),
			SocksAddr::Domain(strng::new("example.com"), 8080),
		] {
			let mut buf = BytesMut::new();
			addr.write_to(&mut buf);
			let mut cursor = std::io::Cursor::new(buf.freeze());
			let back = SocksAddr::read_from(&mut cursor).await.unwrap();
			assert_eq!(addr, back);
		}
	}

	#[test]
	fn udp_encapsulation_round_trips() {
		let from = SocksAddr::Ip("9.9.9.9:53".parse().unwrap());
		let packet = encode_udp_packet(&from, b"payload");
		assert_eq!(&packet[..3], &[0, 0, 0]);
		let (addr, offset) = decode_udp_packet(&packet).unwrap();
		assert_eq!(addr, from);
		assert_eq!(&packet[offset..], b"payload");
	}

	#[test]
	fn fragmented_udp_rejected() {
		let mut packet = encode_udp_packet(&SocksAddr::Ip("9.9.9.9:53".parse().unwrap()), b"x").to_vec();
		packet[2] = 1;
		assert!(decode_udp_packet(&packet).is_err());
	}

	#[tokio::test]
	async fn handshake_connect_no_auth() {
		let (mut client, server) = tokio::io::duplex(256);
		let bind = "127.0.0.1:0".parse().unwrap();
		let server_task = tokio::spawn(async move {
			let mut server = server;
			server_handshake(&mut server, None, bind).await
		});

		let target = SocksAddr::Domain(strng::new("www.example.com"), 443);
		client_handshake(&mut client, &target, CMD_CONNECT, None)
			.await
			.unwrap();
		let (got, command) = server_task.await.unwrap().unwrap();
		assert_eq!(command, CMD_CONNECT);
		assert_eq!(got, target);
	}

	#[tokio::test]
	async fn handshake_with_credentials() {
		let auth = Authenticator::new(&[("u".to_string(), "p".to_string())]);
		let (mut client, server) = tokio::io::duplex(256);
		let bind = "127.0.0.1:0".parse().unwrap();
		let server_task = tokio::spawn(async move {
			let mut server = server;
			server_handshake(&mut server, Some(&auth), bind).await
		});

		let target = SocksAddr::Ip("10.0.0.1:80".parse().unwrap());
		client_handshake(&mut client, &target, CMD_CONNECT, Some(("u", "p")))
			.await
			.unwrap();
		let (got, _) = server_task.await.unwrap().unwrap();
		assert_eq!(got, target);
	}

	#[tokio::test]
	async fn handshake_rejects_bad_credentials() {
		let auth = Authenticator::new(&[("u".to_string(), "p".to_string())]);
		let (mut client, server) = tokio::io::duplex(256);
		let bind = "127.0.0.1:0".parse().unwrap();
		let server_task = tokio::spawn(async move {
			let mut server = server;
			server_handshake(&mut server, Some(&auth), bind).await
		});

		let target = SocksAddr::Ip("10.0.0.1:80".parse().unwrap());
		let res = client_handshake(&mut client, &target, CMD_CONNECT, Some(("u", "wrong"))).await;
		assert!(res.is_err());
		assert!(server_task.await.unwrap().is_err());
	}
}
