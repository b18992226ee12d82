use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use flowgate_core::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::transport::{BoxedDatagram, BoxedStream, OutboundDatagram};
use crate::types::Metadata;

/// Process-wide connection registry and byte totals. Trackers register on
/// construction and unregister when dropped, so the live set is exactly
/// the set of open flows.
pub struct Manager {
	connections: Mutex<HashMap<u64, Arc<TrackerInfo>>>,
	upload_total: AtomicU64,
	download_total: AtomicU64,
	next_id: AtomicU64,
}

pub struct TrackerInfo {
	pub id: u64,
	pub metadata: Metadata,
	pub rule: Option<(Strng, Strng)>,
	pub chain: Strng,
	pub start_unix: u64,
	pub upload: AtomicU64,
	pub download: AtomicU64,
}

impl Manager {
	pub fn new() -> Arc<Manager> {
		Arc::new(Manager {
			connections: Mutex::new(HashMap::new()),
			upload_total: AtomicU64::new(0),
			download_total: AtomicU64::new(0),
			next_id: AtomicU64::new(1),
		})
	}

	fn join(
		self: &Arc<Self>,
		metadata: Metadata,
		rule: Option<(Strng, Strng)>,
		chain: Strng,
	) -> Arc<TrackerInfo> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let info = Arc::new(TrackerInfo {
			id,
			metadata,
			rule,
			chain,
			start_unix: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_secs())
				.unwrap_or_default(),
			upload: AtomicU64::new(0),
			download: AtomicU64::new(0),
		});
		self
			.connections
			.lock()
			.expect("connections lock")
			.insert(id, info.clone());
		info
	}

	fn leave(&self, id: u64) {
		self.connections.lock().expect("connections lock").remove(&id);
	}

	fn count_upload(&self, info: &TrackerInfo, n: u64) {
		info.upload.fetch_add(n, Ordering::Relaxed);
		self.upload_total.fetch_add(n, Ordering::Relaxed);
	}

	fn count_download(&self, info: &TrackerInfo, n: u64) {
		info.download.fetch_add(n, Ordering::Relaxed);
		self.download_total.fetch_add(n, Ordering::Relaxed);
	}

	/// Cumulative (upload, download) byte totals.
	pub fn now(&self) -> (u64, u64) {
		(
			self.upload_total.load(Ordering::Relaxed),
			self.download_total.load(Ordering::Relaxed),
		)
	}

	pub fn connection_count(&self) -> usize {
		self.connections.lock().expect("connections lock").len()
	}

	pub fn snapshot(&self) -> Vec<serde_json::Value> {
		let connections = self.connections.lock().expect("connections lock");
		let mut out: Vec<_> = connections.values().collect();
		out.sort_by_key(|info| info.id);
		out
			.into_iter()
			.map(|info| {
				serde_json::json!({
					"id": info.id,
					"metadata": info.metadata,
					"rule": info.rule.as_ref().map(|(t, _)| t.as_str()),
					"rulePayload": info.rule.as_ref().map(|(_, p)| p.as_str()),
					"chains": [info.chain.as_str()],
					"start": info.start_unix,
					"upload": info.upload.load(Ordering::Relaxed),
					"download": info.download.load(Ordering::Relaxed),
				})
			})
			.collect()
	}
}

/// Counts bytes moving through a remote-side stream. Reads are downloads,
/// writes are uploads.
pub struct TcpTracker {
	inner: BoxedStream,
	manager: Arc<Manager>,
	info: Arc<TrackerInfo>,
}

impl TcpTracker {
	pub fn new(
		inner: BoxedStream,
		manager: Arc<Manager>,
		metadata: Metadata,
		rule: Option<(Strng, Strng)>,
		chain: Strng,
	) -> TcpTracker {
		let info = manager.join(metadata, rule, chain);
		TcpTracker {
			inner,
			manager,
			info,
		}
	}
}

impl Drop for TcpTracker {
	fn drop(&mut self) {
		self.manager.leave(self.info.id);
	}
}

impl AsyncRead for TcpTracker {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let before = buf.filled().len();
		let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
		if let Poll::Ready(Ok(())) = &poll {
			let n = (buf.filled().len() - before) as u64;
			self.manager.count_download(&self.info, n);
		}
		poll
	}
}

impl AsyncWrite for TcpTracker {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Poll::Ready(Ok(n)) = &poll {
			self.manager.count_upload(&self.info, *n as u64);
		}
		poll
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

/// Datagram counterpart of TcpTracker: sends are uploads, receives are
/// downloads.
pub struct UdpTracker {
	inner: BoxedDatagram,
	manager: Arc<Manager>,
	info: Arc<TrackerInfo>,
}

impl UdpTracker {
	pub fn new(
		inner: BoxedDatagram,
		manager: Arc<Manager>,
		metadata: Metadata,
		rule: Option<(Strng, Strng)>,
		chain: Strng,
	) -> Arc<UdpTracker> {
		let info = manager.join(metadata, rule, chain);
		Arc::new(UdpTracker {
			inner,
			manager,
			info,
		})
	}
}

impl Drop for UdpTracker {
	fn drop(&mut self) {
		self.manager.leave(self.info.id);
	}
}

#[async_trait]
impl OutboundDatagram for UdpTracker {
	async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
		let n = self.inner.send_to(buf, dst).await?;
		self.manager.count_upload(&self.info, n as u64);
		Ok(n)
	}

	async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
		let (n, from) = self.inner.recv_from(buf).await?;
		self.manager.count_download(&self.info, n as u64);
		Ok((n, from))
	}

	fn local_addr(&self) -> io::Result<SocketAddr> {
		self.inner.local_addr()
	}

	fn close(&self) {
		self.inner.close()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	fn meta() -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new("example.com");
		m.dst_port = 443;
		m
	}

	#[tokio::test]
	async fn tracker_counts_and_unregisters() {
		let manager = Manager::new();
		let (near, mut far) = tokio::io::duplex(256);
		let mut tracker = TcpTracker::new(
			Box::new(near),
			manager.clone(),
			meta(),
			Some((strng::new("DOMAIN"), strng::new("example.com"))),
			strng::new("DIRECT"),
		);
		assert_eq!(manager.connection_count(), 1);

		tracker.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		far.read_exact(&mut buf).await.unwrap();
		far.write_all(b"hi").await.unwrap();
		let mut buf = [0u8; 2];
		tracker.read_exact(&mut buf).await.unwrap();

		let (up, down) = manager.now();
		assert_eq!(up, 5);
		assert_eq!(down, 2);

		drop(tracker);
		assert_eq!(manager.connection_count(), 0);
		// Totals survive the connection.
		assert_eq!(manager.now(), (5, 2));
	}
}
