use std::sync::RwLock;

use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::GroupBase;
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

/// Routes through the member with the lowest measured delay. The choice is
/// sticky: a new best member only takes over when it beats the incumbent
/// by more than `tolerance` milliseconds, so jittery probes do not flap
/// the selection.
pub struct UrlTest {
	base: GroupBase,
	tolerance: u16,
	fast: RwLock<Strng>,
}

impl UrlTest {
	pub fn new(base: GroupBase, tolerance: u16) -> Arc<UrlTest> {
		Arc::new(UrlTest {
			base,
			tolerance,
			fast: RwLock::new(strng::EMPTY),
		})
	}

	fn fast_proxy(&self, touch: bool) -> Result<Arc<Proxy>, ProxyError> {
		let members = self.base.proxies(touch);
		if members.is_empty() {
			return Err(ProxyError::NoAvailableProxy);
		}

		let best = members
			.iter()
			.filter(|p| p.alive() && p.last_delay() > 0)
			.min_by_key(|p| p.last_delay());

		let mut fast = self.fast.write().expect("fast lock");
		let incumbent = members
			.iter()
			.find(|p| p.name() == *fast && p.alive() && p.last_delay() > 0);

		let chosen = match (incumbent, best) {
			(Some(current), Some(best)) => {
				if best.last_delay().saturating_add(self.tolerance) < current.last_delay() {
					best
				} else {
					current
				}
			},
			(None, Some(best)) => best,
			// Nothing measured yet (or everything failing): fall back to
			// declaration order so flows still move.
			(_, None) => &members[0],
		};
		*fast = chosen.name();
		Ok(chosen.clone())
	}

	pub fn now(&self) -> Strng {
		self.fast_proxy(false).map(|p| p.name()).unwrap_or(strng::EMPTY)
	}
}

#[async_trait]
impl Outbound for UrlTest {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::UrlTest
	}

	fn supports_udp(&self) -> bool {
		self
			.fast_proxy(false)
			.map(|p| p.supports_udp())
			.unwrap_or(false)
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		self.fast_proxy(true)?.connect(metadata).await
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		self.fast_proxy(true)?.listen_packet(metadata).await
	}

	fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<Proxy>> {
		self.fast_proxy(false).ok()
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

	fn record(base: &GroupBase, name: &str, delay: u16) {
		let members = base.proxies(false);
		let p = members.iter().find(|p| p.name().as_str() == name).unwrap();
		p.record_delay(delay);
	}

	#[test]
	fn picks_lowest_nonzero_delay() {
		let group = UrlTest::new(base_of(&["a", "b", "c"]), 0);
		record(&group.base, "a", 80);
		record(&group.base, "b", 30);
		// c unmeasured (delay 0) is never chosen over measured members.
		assert_eq!(group.fast_proxy(false).unwrap().name(), "b");
	}

	#[test]
	fn sticky_within_tolerance() {
		let group = UrlTest::new(base_of(&["a", "b"]), 50);
		record(&group.base, "a", 100);
		assert_eq!(group.fast_proxy(false).unwrap().name(), "a");
		// 20ms better than the incumbent, but inside the 50ms tolerance.
		record(&group.base, "b", 80);
		assert_eq!(group.fast_proxy(false).unwrap().name(), "a");
		// Clearly better: switch.
		record(&group.base, "b", 40);
		assert_eq!(group.fast_proxy(false).unwrap().name(), "b");
	}
}
