//! End-to-end flows over loopback sockets: a SOCKS5 CONNECT routed through
//! a selector group, and an authenticated HTTP CONNECT tunnel.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use flowgate::group::GroupCommonOption;
use flowgate::inbound::http::{HttpInbound, HttpInboundOption};
use flowgate::inbound::socks::{SocksInbound, SocksInboundOption};
use flowgate::inbound::User;
use flowgate::resolve::{NoProcessLookup, Resolver};
use flowgate::transport::pool::BufferPool;
use flowgate::tunnel::{Tunnel, TunnelOptions};

struct NoResolve;

#[async_trait]
impl Resolver for NoResolve {
	async fn resolve(&self, _host: &str) -> io::Result<std::net::IpAddr> {
		Err(io::ErrorKind::NotFound.into())
	}
}

async fn echo_server() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				return;
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 1024];
				loop {
					match stream.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(n) => {
							if stream.write_all(&buf[..n]).await.is_err() {
								return;
							}
						},
					}
				}
			});
		}
	});
	addr
}

/// A tunnel routing loopback flows through GROUP = Selector{DIRECT}.
fn routed_tunnel() -> Arc<Tunnel> {
	let tunnel = Tunnel::new(
		Arc::new(NoResolve),
		Arc::new(NoProcessLookup),
		TunnelOptions::default(),
	);
	tunnel.run();

	tunnel
		.add_outbound_groups(&[GroupCommonOption {
			name: "GROUP".to_string(),
			group_type: "select".to_string(),
			proxies: vec!["DIRECT".to_string()],
			use_providers: vec![],
			url: None,
			interval: 0,
			lazy: true,
			tolerance: 0,
			strategy: None,
			block_time: None,
		}])
		.unwrap();

	let geoip: Arc<dyn flowgate::resolve::GeoIpLookup> = Arc::new(flowgate::resolve::NoGeoIp);
	let rules = flowgate::config::parse_rules(
		&["IP-CIDR,127.0.0.0/8,GROUP".to_string()],
		&tunnel.proxies(),
		&geoip,
	)
	.unwrap();
	tunnel.update_rules(rules);
	tunnel
}

#[tokio::test]
async fn socks5_connect_through_selector_group() {
	let echo = echo_server().await;
	let tunnel = routed_tunnel();

	let inbound = SocksInbound::new(
		SocksInboundOption {
			name: "socks-in".to_string(),
			listen: "127.0.0.1".to_string(),
			port: 0,
			users: Vec::new(),
		},
		tunnel.clone(),
		BufferPool::udp(),
	)
	.await
	.unwrap();

	use flowgate::inbound::Inbound as _;
	let mut client = TcpStream::connect(inbound.local_address()).await.unwrap();

	// Method negotiation: no auth.
	client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
	let mut reply = [0u8; 2];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply, [0x05, 0x00]);

	// CONNECT to the echo server by IPv4 address.
	let ip = match echo.ip() {
		std::net::IpAddr::V4(v4) => v4.octets(),
		_ => unreachable!(),
	};
	let mut request = vec![0x05, 0x01, 0x00, 0x01];
	request.extend_from_slice(&ip);
	request.extend_from_slice(&echo.port().to_be_bytes());
	client.write_all(&request).await.unwrap();
	let mut reply = [0u8; 10];
	client.read_exact(&mut reply).await.unwrap();
	assert_eq!(reply[1], 0x00);

	client.write_all(b"ping through the tunnel").await.unwrap();
	let mut buf = [0u8; 23];
	client.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"ping through the tunnel");

	inbound.close();
}

#[tokio::test]
async fn http_connect_with_credentials() {
	let echo = echo_server().await;
	let tunnel = routed_tunnel();

	let inbound = HttpInbound::new(
		HttpInboundOption {
			name: "http-in".to_string(),
			listen: "127.0.0.1".to_string(),
			port: 0,
			users: vec![User {
				username: "u".to_string(),
				password: "p".to_string(),
			}],
		},
		tunnel.clone(),
	)
	.await
	.unwrap();

	use flowgate::inbound::Inbound as _;
	let addr = inbound.local_address();

	// Correct credentials: 200 and a working tunnel.
	let mut client = TcpStream::connect(addr).await.unwrap();
	let connect = format!(
		"CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic dTpw\r\n\r\n"
	);
	client.write_all(connect.as_bytes()).await.unwrap();
	let status = read_head(&mut client).await;
	assert!(status.starts_with("HTTP/1.1 200"), "got: {status}");

	client.write_all(b"tunneled").await.unwrap();
	let mut buf = [0u8; 8];
	client.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"tunneled");
	drop(client);

	// Bad credentials: 403.
	let mut client = TcpStream::connect(addr).await.unwrap();
	let connect = format!(
		"CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic d3Jvbmc6bm8=\r\n\r\n"
	);
	client.write_all(connect.as_bytes()).await.unwrap();
	let status = read_head(&mut client).await;
	assert!(status.starts_with("HTTP/1.1 403"), "got: {status}");

	// Missing credentials: 407 with a challenge.
	let mut client = TcpStream::connect(addr).await.unwrap();
	let connect = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
	client.write_all(connect.as_bytes()).await.unwrap();
	let head = read_head(&mut client).await;
	assert!(head.starts_with("HTTP/1.1 407"), "got: {head}");
	assert!(head.to_lowercase().contains("proxy-authenticate: basic"));

	inbound.close();
}

async fn read_head(stream: &mut TcpStream) -> String {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	while !head.ends_with(b"\r\n\r\n") {
		let n = stream.read(&mut byte).await.unwrap();
		if n == 0 {
			break;
		}
		head.push(byte[0]);
	}
	String::from_utf8_lossy(&head).to_string()
}
