//! SOCKS4/4a server handshake. Only CONNECT is meaningful for a local
//! proxy listener; BIND is refused.

use std::io;
use std::net::Ipv4Addr;

use flowgate_core::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::inbound::auth::Authenticator;
use crate::transport::socks5::SocksAddr;

pub const VERSION: u8 = 0x04;

const CMD_CONNECT: u8 = 0x01;

const REP_GRANTED: u8 = 0x5a;
const REP_REJECTED: u8 = 0x5b;

/// Reads the full SOCKS4 request (the caller has only peeked at the
/// version byte), validates the userid against the authenticator, and
/// acknowledges. SOCKS4a domain form (0.0.0.x destination) is honored.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin>(
	stream: &mut S,
	authenticator: Option<&Authenticator>,
) -> io::Result<SocksAddr> {
	let ver = stream.read_u8().await?;
	if ver != VERSION {
		return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
	}
	let command = stream.read_u8().await?;
	let port = stream.read_u16().await?;
	let mut ip = [0u8; 4];
	stream.read_exact(&mut ip).await?;

	let userid = read_null_terminated(stream).await?;

	// SOCKS4a: 0.0.0.x (x non-zero) means a domain follows the userid.
	let socks4a = ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0;
	let target = if socks4a {
		let domain = read_null_terminated(stream).await?;
		let domain = String::from_utf8(domain)
			.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "domain is not utf-8"))?;
		SocksAddr::Domain(strng::new(domain), port)
	} else {
		SocksAddr::Ip(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
	};

	// SOCKS4 has no password; the userid doubles as a shared secret when
	// authentication is configured.
	let authed = match authenticator {
		Some(auth) => {
			let user = String::from_utf8(userid).unwrap_or_default();
			auth.verify_user(&user)
		},
		None => true,
	};

	if command != CMD_CONNECT || !authed {
		stream
			.write_all(&[0x00, REP_REJECTED, 0, 0, 0, 0, 0, 0])
			.await?;
		return Err(io::Error::new(
			io::ErrorKind::PermissionDenied,
			"request rejected",
		));
	}

	stream
		.write_all(&[0x00, REP_GRANTED, 0, 0, 0, 0, 0, 0])
		.await?;
	Ok(target)
}

async fn read_null_terminated<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
	let mut out = Vec::new();
	loop {
		let b = stream.read_u8().await?;
		if b == 0 {
			return Ok(out);
		}
		if out.len() >= 255 {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "field too long"));
		}
		out.push(b);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncWriteExt;

	#[tokio::test]
	async fn connect_with_ip() {
		let (mut client, mut server) = tokio::io::duplex(128);
		client
			.write_all(&[0x04, 0x01, 0x00, 0x50, 1, 2, 3, 4, b'u', 0x00])
			.await
			.unwrap();
		let target = server_handshake(&mut server, None).await.unwrap();
		assert_eq!(target, SocksAddr::Ip("1.2.3.4:80".parse().unwrap()));
		let mut reply = [0u8; 8];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply[1], REP_GRANTED);
	}

	#[tokio::test]
	async fn socks4a_domain_form() {
		let (mut client, mut server) = tokio::io::duplex(128);
		let mut req = vec![0x04, 0x01, 0x01, 0xbb, 0, 0, 0, 1, 0x00];
		req.extend_from_slice(b"example.com\x00");
		client.write_all(&req).await.unwrap();
		let target = server_handshake(&mut server, None).await.unwrap();
		assert_eq!(target, SocksAddr::Domain(strng::new("example.com"), 443));
	}

	#[tokio::test]
	async fn bind_is_rejected() {
		let (mut client, mut server) = tokio::io::duplex(128);
		client
			.write_all(&[0x04, 0x02, 0x00, 0x50, 1, 2, 3, 4, 0x00])
			.await
			.unwrap();
		assert!(server_handshake(&mut server, None).await.is_err());
		let mut reply = [0u8; 8];
		client.read_exact(&mut reply).await.unwrap();
		assert_eq!(reply[1], REP_REJECTED);
	}
}
