use std::io;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::errors::ProxyError;
use crate::outbound::{Outbound, ProxyType, join_host_port};
use crate::transport::buffered::BufferedStream;
use crate::transport::{BoxedStream, tls};
use crate::types::Metadata;

/// How requests are carried to the upstream HTTP proxy.
///
/// Tunnel always issues CONNECT. Auto sniffs the first bytes of the client
/// stream: plaintext HTTP requests are rewritten to absolute form and sent
/// as ordinary proxy requests, anything else falls back to CONNECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpProxyMode {
	#[default]
	Tunnel,
	Auto,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpOutboundOption {
	pub name: String,
	pub server: String,
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub tls: bool,
	#[serde(default)]
	pub sni: Option<String>,
	#[serde(default)]
	pub skip_cert_verify: bool,
	#[serde(default)]
	pub proxy_mode: HttpProxyMode,
}

pub struct HttpOutbound {
	name: Strng,
	addr: Strng,
	credentials: Option<(String, String)>,
	tls: Option<(Arc<rustls::ClientConfig>, rustls_pki_types::ServerName<'static>)>,
	mode: HttpProxyMode,
}

impl HttpOutbound {
	pub fn new(option: HttpOutboundOption) -> anyhow::Result<Arc<HttpOutbound>> {
		let tls = if option.tls {
			let sni = option.sni.as_deref().unwrap_or(&option.server);
			Some((
				tls::client_config(option.skip_cert_verify)?,
				tls::server_name(sni)?,
			))
		} else {
			None
		};
		let credentials = match (option.username, option.password) {
			(Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
			_ => None,
		};
		Ok(Arc::new(HttpOutbound {
			name: strng::new(option.name),
			addr: join_host_port(&option.server, option.port),
			credentials,
			tls,
			mode: option.proxy_mode,
		}))
	}

	fn proxy_authorization(&self) -> Option<String> {
		self
			.credentials
			.as_ref()
			.map(|(user, pass)| format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
	}
}

#[async_trait]
impl Outbound for HttpOutbound {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Http
	}

	fn addr(&self) -> Option<Strng> {
		Some(self.addr.clone())
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
		let stream = underlying.ok_or(ProxyError::EmptyConnection)?;
		let mut stream: BoxedStream = match &self.tls {
			Some((config, sni)) => {
				let handshake = tokio_rustls::TlsConnector::from(config.clone())
					.connect(sni.clone(), stream);
				let tls = tokio::time::timeout(crate::DEFAULT_TLS_TIMEOUT, handshake)
					.await
					.map_err(|_| ProxyError::Timeout)?
					.map_err(|e| ProxyError::HandshakeFailed(format!("{} tls: {e}", self.addr)))?;
				Box::new(tls)
			},
			None => stream,
		};

		match self.mode {
			HttpProxyMode::Tunnel => {
				shake_hand(&mut stream, metadata, self.proxy_authorization()).await?;
				Ok(stream)
			},
			HttpProxyMode::Auto => Ok(auto_stream(stream, metadata, self.proxy_authorization())),
		}
	}
}

/// CONNECT handshake against the upstream proxy.
async fn shake_hand(
	stream: &mut BoxedStream,
	metadata: &Metadata,
	authorization: Option<String>,
) -> Result<(), ProxyError> {
	let addr = metadata.remote_addr();
	let mut request = format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\nProxy-Connection: Keep-Alive\r\n");
	if let Some(auth) = authorization {
		request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
	}
	request.push_str("\r\n");
	stream
		.write_all(request.as_bytes())
		.await
		.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;

	let head = read_http_head(stream)
		.await
		.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
	let status_line = head.split(|&b| b == b'\r').next().unwrap_or_default();
	let status_line = String::from_utf8_lossy(status_line);
	let code: u16 = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|c| c.parse().ok())
		.ok_or_else(|| ProxyError::HandshakeFailed(format!("malformed response: {status_line}")))?;

	match code {
		200 => Ok(()),
		407 => Err(ProxyError::AuthRequired),
		405 => Err(ProxyError::HandshakeFailed(
			"CONNECT method not allowed by proxy".to_string(),
		)),
		c if c >= 500 => Err(ProxyError::HandshakeFailed(status_line.to_string())),
		c => Err(ProxyError::HandshakeFailed(format!(
			"cannot connect remote, code: {c}"
		))),
	}
}

const SNIFF_WINDOW: usize = 8;
const SNIFF_DEADLINE: Duration = Duration::from_millis(300);
const MAX_HEAD: usize = 16 * 1024;

const HTTP_METHODS: &[&str] = &[
	"GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "PATCH", "TRACE",
];

fn sniff_http_method(head: &[u8]) -> bool {
	HTTP_METHODS.iter().any(|m| {
		head.len() > m.len()
			&& head[..m.len()].eq_ignore_ascii_case(m.as_bytes())
			&& head[m.len()] == b' '
	})
}

/// Auto mode returns a conn immediately but holds reads back until the
/// spawned sniffer has decided tunnel-vs-intermediary and finished the
/// handshake; the read half of the upstream arrives through the latch.
fn auto_stream(
	server: BoxedStream,
	metadata: &Metadata,
	authorization: Option<String>,
) -> BoxedStream {
	let (client_io, relay_io) = tokio::io::duplex(32 * 1024);
	let (gate_tx, gate_rx) = oneshot::channel();
	let metadata = metadata.clone();
	tokio::spawn(async move {
		if let Err(e) = run_auto(server, relay_io, gate_tx, metadata, authorization).await {
			debug!(err=%e, "http outbound auto mode ended");
		}
	});
	Box::new(AutoStream {
		pending: Some(gate_rx),
		reader: None,
		writer: client_io,
	})
}

async fn run_auto(
	mut server: BoxedStream,
	relay: tokio::io::DuplexStream,
	gate: oneshot::Sender<tokio::io::ReadHalf<BoxedStream>>,
	metadata: Metadata,
	authorization: Option<String>,
) -> io::Result<()> {
	let mut sniffer = BufferedStream::new(relay);
	let sniffed = sniffer.peek_until(SNIFF_WINDOW, SNIFF_DEADLINE).await?;
	let is_http = sniff_http_method(sniffed);

	if is_http {
		let head = read_http_head(&mut sniffer).await?;
		let rewritten = rewrite_proxy_request(&head, authorization)?;
		server.write_all(&rewritten).await?;
	} else {
		shake_hand(&mut server, &metadata, authorization)
			.await
			.map_err(|e| io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string()))?;
	}

	let (read_half, mut write_half) = tokio::io::split(server);
	// Unblock reads on the conn we handed out.
	let _ = gate.send(read_half);

	// Everything past the (possibly rewritten) head passes through verbatim.
	tokio::io::copy(&mut sniffer, &mut write_half).await?;
	write_half.shutdown().await
}

/// Rewrites a proxy request head to absolute form with our credentials:
/// origin-form targets gain an `http://host` prefix and any client
/// Proxy-Authorization is replaced.
fn rewrite_proxy_request(head: &[u8], authorization: Option<String>) -> io::Result<Vec<u8>> {
	let text = std::str::from_utf8(head)
		.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "head is not utf-8"))?;
	let mut lines = text.split("\r\n");
	let request_line = lines
		.next()
		.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty head"))?;
	let mut parts = request_line.splitn(3, ' ');
	let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
		(Some(m), Some(t), Some(v)) => (m, t, v),
		_ => {
			return Err(io::Error::new(
				io::ErrorKind::InvalidData,
				"malformed request line",
			));
		},
	};

	let headers: Vec<&str> = lines.take_while(|l| !l.is_empty()).collect();
	let host = headers
		.iter()
		.find_map(|l| {
			let (name, value) = l.split_once(':')?;
			name.trim().eq_ignore_ascii_case("host").then(|| value.trim())
		})
		.unwrap_or_default();

	let absolute = if target.starts_with('/') {
		format!("http://{host}{target}")
	} else {
		target.to_string()
	};

	let mut out = String::with_capacity(head.len() + 64);
	out.push_str(&format!("{method} {absolute} {version}\r\n"));
	for line in &headers {
		if let Some((name, _)) = line.split_once(':')
			&& name.trim().eq_ignore_ascii_case("proxy-authorization")
		{
			continue;
		}
		out.push_str(line);
		out.push_str("\r\n");
	}
	if let Some(auth) = authorization {
		out.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
	}
	out.push_str("\r\n");
	Ok(out.into_bytes())
}

/// Reads an HTTP message head (through the blank line), never consuming
/// past it.
async fn read_http_head<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
	let mut head = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		head.push(byte[0]);
		if head.ends_with(b"\r\n\r\n") {
			return Ok(head);
		}
		if head.len() > MAX_HEAD {
			return Err(io::Error::new(io::ErrorKind::InvalidData, "head too large"));
		}
	}
}

struct AutoStream {
	pending: Option<oneshot::Receiver<tokio::io::ReadHalf<BoxedStream>>>,
	reader: Option<tokio::io::ReadHalf<BoxedStream>>,
	writer: tokio::io::DuplexStream,
}

impl AsyncRead for AutoStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		if self.reader.is_none() {
			let Some(pending) = self.pending.as_mut() else {
				return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
			};
			match Pin::new(pending).poll(cx) {
				Poll::Ready(Ok(reader)) => {
					self.pending = None;
					self.reader = Some(reader);
				},
				Poll::Ready(Err(_)) => {
					self.pending = None;
					return Poll::Ready(Err(io::Error::new(
						io::ErrorKind::ConnectionRefused,
						"proxy handshake failed",
					)));
				},
				Poll::Pending => return Poll::Pending,
			}
		}
		Pin::new(self.reader.as_mut().expect("reader installed")).poll_read(cx, buf)
	}
}

impl AsyncWrite for AutoStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		Pin::new(&mut self.writer).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.writer).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.writer).poll_shutdown(cx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};
	use tokio::io::AsyncWriteExt;

	fn meta(host: &str, port: u16) -> Metadata {
		let mut m = Metadata::new(InboundKind::Https, Network::Tcp);
		m.host = strng::new(host);
		m.dst_port = port;
		m
	}

	#[test]
	fn sniffs_known_methods_case_insensitively() {
		assert!(sniff_http_method(b"GET / HT"));
		assert!(sniff_http_method(b"get / HT"));
		assert!(sniff_http_method(b"OPTIONS "));
		assert!(!sniff_http_method(b"\x16\x03\x01\x02\x00\x01\x00\x01"));
		assert!(!sniff_http_method(b"GETX / H"));
	}

	#[test]
	fn rewrite_makes_absolute_and_swaps_auth() {
		let head = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Authorization: Basic old\r\nAccept: */*\r\n\r\n";
		let out = rewrite_proxy_request(head, Some("Basic bmV3".to_string())).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.starts_with("GET http://example.com/index.html HTTP/1.1\r\n"));
		assert!(!text.contains("Basic old"));
		assert!(text.contains("Proxy-Authorization: Basic bmV3\r\n"));
		assert!(text.contains("Accept: */*\r\n"));
	}

	#[tokio::test]
	async fn tunnel_handshake_accepts_200() {
		let (mut far, near) = tokio::io::duplex(1024);
		let mut stream: BoxedStream = Box::new(near);
		let server = tokio::spawn(async move {
			let head = read_http_head(&mut far).await.unwrap();
			let text = String::from_utf8(head).unwrap();
			assert!(text.starts_with("CONNECT foo.bar:443 HTTP/1.1\r\n"));
			assert!(text.contains("Proxy-Authorization: Basic dTpw\r\n"));
			far
				.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
				.await
				.unwrap();
		});
		shake_hand(&mut stream, &meta("foo.bar", 443), Some("Basic dTpw".to_string()))
			.await
			.unwrap();
		server.await.unwrap();
	}

	#[tokio::test]
	async fn tunnel_handshake_maps_407() {
		let (mut far, near) = tokio::io::duplex(1024);
		let mut stream: BoxedStream = Box::new(near);
		tokio::spawn(async move {
			let _ = read_http_head(&mut far).await;
			let _ = far
				.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
				.await;
		});
		let err = shake_hand(&mut stream, &meta("foo.bar", 443), None)
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::AuthRequired));
	}

	#[tokio::test]
	async fn auto_mode_falls_back_to_connect_for_binary_traffic() {
		let (mut upstream, near) = tokio::io::duplex(4096);
		let server: BoxedStream = Box::new(near);
		let mut conn = auto_stream(server, &meta("foo.bar", 443), None);

		// Upstream proxy side: expect CONNECT, then echo one payload.
		let upstream_task = tokio::spawn(async move {
			let head = read_http_head(&mut upstream).await.unwrap();
			assert!(head.starts_with(b"CONNECT foo.bar:443"));
			upstream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
			let mut buf = [0u8; 5];
			upstream.read_exact(&mut buf).await.unwrap();
			assert_eq!(&buf, b"\x16\x03\x01\x00\x05");
			upstream.write_all(b"reply").await.unwrap();
		});

		conn.write_all(b"\x16\x03\x01\x00\x05").await.unwrap();
		let mut buf = [0u8; 5];
		conn.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"reply");
		upstream_task.await.unwrap();
	}

	#[tokio::test]
	async fn auto_mode_rewrites_plaintext_http() {
		let (mut upstream, near) = tokio::io::duplex(4096);
		let server: BoxedStream = Box::new(near);
		let mut conn = auto_stream(server, &meta("example.com", 80), None);

		conn
			.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
			.await
			.unwrap();

		let head = read_http_head(&mut upstream).await.unwrap();
		let text = String::from_utf8(head).unwrap();
		assert!(text.starts_with("GET http://example.com/ HTTP/1.1\r\n"));

		upstream
			.write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
			.await
			.unwrap();
		let reply = read_http_head(&mut conn).await.unwrap();
		assert!(reply.starts_with(b"HTTP/1.1 204"));
	}
}
