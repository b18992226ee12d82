pub mod direct;
pub mod http;
pub mod reject;
pub mod socks5;
pub mod ssh;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use flowgate_core::prelude::*;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::ProxyError;
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

const DELAY_HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProxyType {
	Direct,
	Reject,
	Http,
	Socks5,
	Ssh,
	Selector,
	UrlTest,
	Fallback,
	LoadBalance,
	Relay,
	AutoSelector,
}

impl ProxyType {
	pub fn is_group(&self) -> bool {
		matches!(
			self,
			ProxyType::Selector
				| ProxyType::UrlTest
				| ProxyType::Fallback
				| ProxyType::LoadBalance
				| ProxyType::Relay
				| ProxyType::AutoSelector
		)
	}
}

impl Display for ProxyType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ProxyType::Direct => "Direct",
			ProxyType::Reject => "Reject",
			ProxyType::Http => "Http",
			ProxyType::Socks5 => "Socks5",
			ProxyType::Ssh => "Ssh",
			ProxyType::Selector => "Selector",
			ProxyType::UrlTest => "URLTest",
			ProxyType::Fallback => "Fallback",
			ProxyType::LoadBalance => "LoadBalance",
			ProxyType::Relay => "Relay",
			ProxyType::AutoSelector => "AutoSelector",
		};
		f.write_str(s)
	}
}

/// A protocol adapter that can carry flows to an upstream. Groups implement
/// this too; `unwrap` lets callers descend through group nesting to the
/// concrete adapter that will do the work.
#[async_trait]
pub trait Outbound: Send + Sync {
	fn name(&self) -> Strng;

	fn proto(&self) -> ProxyType;

	/// The adapter's own server address, where it has one. Relay chains dial
	/// hop N toward hop N+1's address.
	fn addr(&self) -> Option<Strng> {
		None
	}

	fn supports_udp(&self) -> bool {
		false
	}

	/// Establishes a stream to the metadata's destination.
	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError>;

	/// Binds a datagram endpoint for the metadata's destination.
	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		let _ = metadata;
		Err(ProxyError::UdpUnsupported(self.name()))
	}

	/// Speaks this adapter's protocol over an already-established hop,
	/// targeting the metadata's destination. Relay chains use this for every
	/// hop after the first; adapters that need the hop signal its absence
	/// with `ProxyError::EmptyConnection`.
	async fn stream_through(
		&self,
		underlying: Option<BoxedStream>,
		metadata: &Metadata,
	) -> Result<BoxedStream, ProxyError> {
		let _ = (underlying, metadata);
		Err(ProxyError::HandshakeFailed(format!(
			"{} cannot wrap an existing connection",
			self.name()
		)))
	}

	/// For groups: the member this group would currently route the flow to.
	fn unwrap(&self, metadata: &Metadata) -> Option<Arc<Proxy>> {
		let _ = metadata;
		None
	}

	/// Extra fields merged into the REST representation (groups report
	/// `now`/`all` here).
	fn describe(&self) -> serde_json::Value {
		serde_json::json!({})
	}
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DelayRecord {
	pub time: u64,
	pub delay: u16,
}

/// An outbound plus its health history. Everything the tunnel routes
/// through is one of these.
pub struct Proxy {
	outbound: Arc<dyn Outbound>,
	history: Mutex<VecDeque<DelayRecord>>,
	alive: AtomicBool,
}

impl Proxy {
	pub fn new(outbound: Arc<dyn Outbound>) -> Arc<Proxy> {
		Arc::new(Proxy {
			outbound,
			history: Mutex::new(VecDeque::with_capacity(DELAY_HISTORY_LEN)),
			alive: AtomicBool::new(true),
		})
	}

	pub fn name(&self) -> Strng {
		self.outbound.name()
	}

	pub fn proto(&self) -> ProxyType {
		self.outbound.proto()
	}

	pub fn addr(&self) -> Option<Strng> {
		self.outbound.addr()
	}

	pub fn supports_udp(&self) -> bool {
		self.outbound.supports_udp()
	}

	pub fn alive(&self) -> bool {
		self.alive.load(Ordering::Relaxed)
	}

	pub async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		self.outbound.connect(metadata).await
	}

	pub async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		self.outbound.listen_packet(metadata).await
	}

	pub async fn stream_through(
		&self,
		underlying: Option<BoxedStream>,
		metadata: &Metadata,
	) -> Result<BoxedStream, ProxyError> {
		self.outbound.stream_through(underlying, metadata).await
	}

	pub fn unwrap(&self, metadata: &Metadata) -> Option<Arc<Proxy>> {
		self.outbound.unwrap(metadata)
	}

	pub fn delay_history(&self) -> Vec<DelayRecord> {
		self.history.lock().expect("history lock").iter().copied().collect()
	}

	/// Most recent probe latency; 0 means unknown or failing.
	pub fn last_delay(&self) -> u16 {
		if !self.alive() {
			return 0;
		}
		self
			.history
			.lock()
			.expect("history lock")
			.back()
			.map(|r| r.delay)
			.unwrap_or(0)
	}

	pub(crate) fn record_delay(&self, delay: u16) {
		let mut history = self.history.lock().expect("history lock");
		if history.len() == DELAY_HISTORY_LEN {
			history.pop_front();
		}
		history.push_back(DelayRecord {
			time: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default(),
			delay,
		});
		self.alive.store(delay > 0, Ordering::Relaxed);
	}

	/// Issues an HTTP(S) GET through this outbound and records first-byte
	/// latency. Failures record a zero delay and mark the member dead.
	pub async fn url_test(&self, url: &str, deadline: Duration) -> Result<u16, ProxyError> {
		let started = Instant::now();
		let res = tokio::time::timeout(deadline, self.url_test_inner(url)).await;
		match res {
			Ok(Ok(())) => {
				let delay = started.elapsed().as_millis().min(u16::MAX as u128) as u16;
				// A probe fast enough to round to zero still counts as alive.
				let delay = delay.max(1);
				self.record_delay(delay);
				Ok(delay)
			},
			Ok(Err(e)) => {
				self.record_delay(0);
				Err(e)
			},
			Err(_) => {
				self.record_delay(0);
				Err(ProxyError::Timeout)
			},
		}
	}

	async fn url_test_inner(&self, url: &str) -> Result<(), ProxyError> {
		let uri: ::http::Uri = url
			.parse()
			.map_err(|_| ProxyError::InvalidConfig(format!("bad test url {url}")))?;
		let https = uri.scheme_str() == Some("https");
		let host = uri
			.host()
			.ok_or_else(|| ProxyError::InvalidConfig(format!("test url {url} has no host")))?
			.to_string();
		let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
		let path = uri
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());

		let mut metadata = Metadata::new(crate::types::InboundKind::Http, crate::types::Network::Tcp);
		metadata.host = strng::new(&host);
		metadata.dst_port = port;

		let stream = self.connect(&metadata).await?;
		let mut stream: BoxedStream = if https {
			let config = crate::transport::tls::client_config(false)
				.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
			let sni = crate::transport::tls::server_name(&host)
				.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
			let tls = tokio_rustls::TlsConnector::from(config)
				.connect(sni, stream)
				.await
				.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
			Box::new(tls)
		} else {
			stream
		};

		let request =
			format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nUser-Agent: flowgate\r\n\r\n");
		stream
			.write_all(request.as_bytes())
			.await
			.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
		// First byte back is all we time.
		let mut byte = [0u8; 1];
		let n = stream
			.read(&mut byte)
			.await
			.map_err(|e| ProxyError::HandshakeFailed(e.to_string()))?;
		if n == 0 {
			return Err(ProxyError::HandshakeFailed("empty response".to_string()));
		}
		Ok(())
	}

	pub fn describe(&self) -> serde_json::Value {
		let mut value = serde_json::json!({
			"name": self.name().as_str(),
			"type": self.proto().to_string(),
			"udp": self.supports_udp(),
			"alive": self.alive(),
			"history": self.delay_history(),
		});
		if let serde_json::Value::Object(extra) = self.outbound.describe() {
			let map = value.as_object_mut().expect("object");
			for (k, v) in extra {
				map.insert(k, v);
			}
		}
		value
	}
}

impl Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("name", &self.name())
			.field("type", &self.proto())
			.finish_non_exhaustive()
	}
}

/// Joins a server and port into the `host:port` form adapters store.
pub fn join_host_port(server: &str, port: u16) -> Strng {
	if server.contains(':') && !server.starts_with('[') {
		strng::format!("[{}]:{}", server, port)
	} else {
		strng::format!("{}:{}", server, port)
	}
}
