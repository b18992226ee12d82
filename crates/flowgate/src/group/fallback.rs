use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::GroupBase;
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

/// Routes through the first healthy member in declaration order, so the
/// list doubles as a preference order.
pub struct Fallback {
	base: GroupBase,
}

impl Fallback {
	pub fn new(base: GroupBase) -> Arc<Fallback> {
		Arc::new(Fallback { base })
	}

	fn alive_proxy(&self, touch: bool) -> Result<Arc<Proxy>, ProxyError> {
		let members = self.base.proxies(touch);
		members
			.iter()
			.find(|p| p.alive() && p.last_delay() > 0)
			.or_else(|| members.first())
			.cloned()
			.ok_or(ProxyError::NoAvailableProxy)
	}

	pub fn now(&self) -> Strng {
		self
			.alive_proxy(false)
			.map(|p| p.name())
			.unwrap_or(strng::EMPTY)
	}
}

#[async_trait]
impl Outbound for Fallback {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Fallback
	}

	fn supports_udp(&self) -> bool {
		self
			.alive_proxy(false)
			.map(|p| p.supports_udp())
			.unwrap_or(false)
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		self.alive_proxy(true)?.connect(metadata).await
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		self.alive_proxy(true)?.listen_packet(metadata).await
	}

	fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<Proxy>> {
		self.alive_proxy(false).ok()
	}

	fn describe(&self) -> serde_json::Value {
		serde_json::json!({
			"now": self.now().as_str(),
			"all": self.base.member_names(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::group::testing::base_of;

	#[test]
	fn first_healthy_member_wins() {
		let group = Fallback::new(base_of(&["a", "b", "c"]));
		let members = group.base.proxies(false);
		// Nothing measured: declaration order.
		assert_eq!(group.now(), "a");
		members[0].record_delay(0);
		members[1].record_delay(25);
		members[2].record_delay(10);
		assert_eq!(group.now(), "b");
		members[1].record_delay(0);
		assert_eq!(group.now(), "c");
	}
}
