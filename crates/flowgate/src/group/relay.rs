use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::{GroupBase, addr_to_metadata, unwrap_proxy};
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

/// Chains members end to end: the first member dials toward the second
/// member's server, every following hop is layered on with
/// `stream_through`, and the last hop targets the real destination.
///
/// Direct members contribute nothing to a chain and are dropped; an empty
/// chain degrades to the plain DIRECT outbound.
pub struct Relay {
	base: GroupBase,
	direct: Arc<Proxy>,
}

impl Relay {
	pub fn new(base: GroupBase, direct: Arc<Proxy>) -> Arc<Relay> {
		Arc::new(Relay { base, direct })
	}

	/// Members with group nesting unwrapped and Direct hops removed.
	fn chain(&self, metadata: &Metadata, touch: bool) -> Vec<Arc<Proxy>> {
		self
			.base
			.proxies(touch)
			.iter()
			.map(|p| unwrap_proxy(p, metadata))
			.filter(|p| p.proto() != ProxyType::Direct)
			.collect()
	}
}

#[async_trait]
impl Outbound for Relay {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Relay
	}

	fn supports_udp(&self) -> bool {
		// Only a degenerate relay can carry datagrams; a real chain cannot.
		let members = self.base.proxies(false);
		match members.len() {
			0 => true,
			1 => members[0].supports_udp(),
			_ => false,
		}
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		let chain = self.chain(metadata, true);

		match chain.len() {
			0 => return self.direct.connect(metadata).await,
			1 => return chain[0].connect(metadata).await,
			_ => {},
		}

		let first = &chain[0];
		let last = &chain[chain.len() - 1];

		let second_addr = chain[1].addr().ok_or(ProxyError::AddressUnsupported)?;
		let hop_metadata = addr_to_metadata(&second_addr)?;
		let mut current = first.connect(&hop_metadata).await.map_err(|e| {
			ProxyError::HandshakeFailed(format!("relay first hop {}: {e}", first.name()))
		})?;

		// Middle hops: each speaks its protocol over the stream so far,
		// aimed at the next hop's server.
		for window in chain.windows(2).skip(1) {
			let (hop, next) = (&window[0], &window[1]);
			let next_addr = next.addr().ok_or(ProxyError::AddressUnsupported)?;
			let next_metadata = addr_to_metadata(&next_addr)?;
			current = hop
				.stream_through(Some(current), &next_metadata)
				.await
				.map_err(|e| ProxyError::HandshakeFailed(format!("{}: {e}", hop.name())))?;
		}

		last
			.stream_through(Some(current), metadata)
			.await
			.map_err(|e| ProxyError::HandshakeFailed(format!("{}: {e}", last.name())))
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		let chain = self.chain(metadata, true);
		match chain.len() {
			0 => self.direct.listen_packet(metadata).await,
			1 => chain[0].listen_packet(metadata).await,
			_ => Err(ProxyError::UdpUnsupported(self.base.name())),
		}
	}

	fn describe(&self) -> serde_json::Value {
		serde_json::json!({
			"all": self.base.member_names(),
		})
	}
}
