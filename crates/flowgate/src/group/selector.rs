use std::sync::RwLock;

use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::GroupBase;
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

/// A group with a constant, operator-chosen member.
pub struct Selector {
	base: GroupBase,
	current: RwLock<Strng>,
}

impl Selector {
	pub fn new(base: GroupBase) -> Arc<Selector> {
		let initial = base
			.proxies(false)
			.first()
			.map(|p| p.name())
			.unwrap_or(strng::EMPTY);
		Arc::new(Selector {
			base,
			current: RwLock::new(initial),
		})
	}

	pub fn now(&self) -> Strng {
		self.current.read().expect("current lock").clone()
	}

	pub fn set_selected(&self, name: &str) -> Result<(), ProxyError> {
		let members = self.base.proxies(false);
		if !members.iter().any(|p| p.name().as_str() == name) {
			return Err(ProxyError::InvalidConfig(format!(
				"{} is not a member of {}",
				name,
				self.base.name()
			)));
		}
		*self.current.write().expect("current lock") = strng::new(name);
		Ok(())
	}

	fn selected(&self, touch: bool) -> Result<Arc<Proxy>, ProxyError> {
		let members = self.base.proxies(touch);
		let current = self.now();
		members
			.iter()
			.find(|p| p.name() == current)
			.or_else(|| members.first())
			.cloned()
			.ok_or(ProxyError::NoAvailableProxy)
	}
}

#[async_trait]
impl Outbound for Selector {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::Selector
	}

	fn supports_udp(&self) -> bool {
		self
			.selected(false)
			.map(|p| p.supports_udp())
			.unwrap_or(false)
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		self.selected(true)?.connect(metadata).await
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		self.selected(true)?.listen_packet(metadata).await
	}

	fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<Proxy>> {
		self.selected(false).ok()
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
	fn defaults_to_first_member_and_switches() {
		let selector = Selector::new(base_of(&["a", "b"]));
		assert_eq!(selector.now(), "a");
		selector.set_selected("b").unwrap();
		assert_eq!(selector.now(), "b");
		assert!(selector.set_selected("missing").is_err());
		assert_eq!(selector.now(), "b");
	}

	#[test]
	fn unwrap_returns_selected_member() {
		let selector = Selector::new(base_of(&["a", "b"]));
		selector.set_selected("b").unwrap();
		let m = Metadata::new(crate::types::InboundKind::Socks5, crate::types::Network::Tcp);
		assert_eq!(selector.unwrap(&m).unwrap().name(), "b");
	}
}
