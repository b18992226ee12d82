use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::GroupBase;
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(7);

/// A selector that remembers recent failures: members that failed within
/// `block_time` sit out of candidate selection until the cooldown lapses.
/// If everyone is cooling down the full list is tried anyway, so the group
/// degrades to ordinary retry instead of refusing service.
pub struct AutoSelector {
	base: GroupBase,
	block_time: Duration,
	failed: Mutex<HashMap<Strng, Instant>>,
	current: RwLock<Strng>,
}

impl AutoSelector {
	pub fn new(base: GroupBase, block_time: Duration) -> Arc<AutoSelector> {
		Arc::new(AutoSelector {
			base,
			block_time,
			failed: Mutex::new(HashMap::new()),
			current: RwLock::new(strng::EMPTY),
		})
	}

	pub fn now(&self) -> Strng {
		let current = self.current.read().expect("current lock").clone();
		if !current.is_empty() {
			return current;
		}
		self
			.candidates()
			.first()
			.map(|p| p.name())
			.unwrap_or(strng::EMPTY)
	}

	/// Members eligible for the next dial, preferring the one that worked
	/// last time.
	fn candidates(&self) -> Vec<Arc<Proxy>> {
		let members = self.base.proxies(true);

		let blocked: Vec<Strng> = {
			let mut failed = self.failed.lock().expect("failed lock");
			failed.retain(|_, at| at.elapsed() < self.block_time);
			failed.keys().cloned().collect()
		};

		let mut eligible: Vec<Arc<Proxy>> = members
			.iter()
			.filter(|p| !blocked.contains(&p.name()))
			.cloned()
			.collect();
		if eligible.is_empty() {
			eligible = members;
		}

		// Keep the member that last worked at the front of the order.
		let current = self.current.read().expect("current lock").clone();
		if eligible.len() > 1 && !current.is_empty() {
			if let Some(idx) = eligible.iter().position(|p| p.name() == current)
				&& idx != 0
			{
				eligible.rotate_left(idx);
			}
		}
		eligible
	}

	fn record_failure(&self, name: Strng) {
		self
			.failed
			.lock()
			.expect("failed lock")
			.insert(name, Instant::now());
		// The memoized member snapshot may now start with a dead proxy;
		// recompute on the next dial.
		self.base.invalidate_members();
	}

	fn record_success(&self, name: Strng) {
		*self.current.write().expect("current lock") = name;
	}
}

#[async_trait]
impl Outbound for AutoSelector {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::AutoSelector
	}

	fn supports_udp(&self) -> bool {
		true
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		let candidates = self.candidates();
		if candidates.is_empty() {
			return Err(ProxyError::NoAvailableProxy);
		}
		for proxy in candidates {
			match tokio::time::timeout(ATTEMPT_TIMEOUT, proxy.connect(metadata)).await {
				Ok(Ok(stream)) => {
					self.record_success(proxy.name());
					return Ok(stream);
				},
				Ok(Err(e)) => {
					debug!(member = %proxy.name(), err = %e, "auto selector member failed");
					self.record_failure(proxy.name());
				},
				Err(_) => {
					debug!(member = %proxy.name(), "auto selector member timed out");
					self.record_failure(proxy.name());
				},
			}
		}
		Err(ProxyError::NoAvailableProxy)
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		let candidates = self.candidates();
		if candidates.is_empty() {
			return Err(ProxyError::NoAvailableProxy);
		}
		for proxy in candidates {
			match tokio::time::timeout(ATTEMPT_TIMEOUT, proxy.listen_packet(metadata)).await {
				Ok(Ok(datagram)) => {
					self.record_success(proxy.name());
					return Ok(datagram);
				},
				Ok(Err(e)) => {
					debug!(member = %proxy.name(), err = %e, "auto selector member failed");
					self.record_failure(proxy.name());
				},
				Err(_) => self.record_failure(proxy.name()),
			}
		}
		Err(ProxyError::NoAvailableProxy)
	}

	fn unwrap(&self, _metadata: &Metadata) -> Option<Arc<Proxy>> {
		// Descending would bypass the failure bookkeeping; the group itself
		// carries the flow.
		None
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
	use crate::group::GroupBase;
	use crate::outbound::testing::FakeOutbound;
	use crate::provider::CompatibleProvider;
	use crate::provider::healthcheck::HealthCheck;
	use crate::types::{InboundKind, Network};
	use std::sync::atomic::Ordering;

	fn group_of(fakes: &[Arc<FakeOutbound>], block_time: Duration) -> Arc<AutoSelector> {
		let members: Vec<Arc<Proxy>> = fakes
			.iter()
			.map(|f| Proxy::new(f.clone() as Arc<dyn Outbound>))
			.collect();
		let hc = HealthCheck::new(Vec::new(), strng::EMPTY, 0, true);
		let provider = CompatibleProvider::new(strng::new("members"), members, hc).unwrap();
		AutoSelector::new(
			GroupBase::new(strng::new("auto"), vec![provider]),
			block_time,
		)
	}

	fn ok(name: &str) -> Arc<FakeOutbound> {
		let f = FakeOutbound::failing(name);
		f.fail.store(false, Ordering::SeqCst);
		f
	}

	fn meta() -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new("example.com");
		m.dst_port = 443;
		m
	}

	#[tokio::test]
	async fn failed_member_sits_out_cooldown() {
		let p1 = FakeOutbound::failing("P1");
		let p2 = ok("P2");
		let p3 = ok("P3");
		let group = group_of(&[p1.clone(), p2.clone(), p3.clone()], Duration::from_secs(60));

		// First dial: P1 fails and is recorded, P2 carries the flow.
		group.connect(&meta()).await.unwrap();
		assert_eq!(group.now(), "P2");
		assert_eq!(p1.dials.load(Ordering::SeqCst), 1);

		// Second dial: P1 is cooling down and must not be attempted.
		group.connect(&meta()).await.unwrap();
		assert_eq!(p1.dials.load(Ordering::SeqCst), 1);
		assert_eq!(p2.dials.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn cooldown_expiry_restores_candidacy() {
		let p1 = FakeOutbound::failing("P1");
		let p2 = ok("P2");
		let group = group_of(&[p1.clone(), p2.clone()], Duration::from_millis(30));

		group.connect(&meta()).await.unwrap();
		let blocked = group.candidates();
		assert!(!blocked.iter().any(|p| p.name() == "P1"));

		tokio::time::sleep(Duration::from_millis(50)).await;
		// No extra signal needed: lapse of the cooldown is enough.
		let names: Vec<_> = group.candidates().iter().map(|p| p.name()).collect();
		assert!(names.contains(&strng::new("P1")));
	}

	#[tokio::test]
	async fn all_cooling_down_falls_back_to_full_list() {
		let p1 = FakeOutbound::failing("P1");
		let p2 = FakeOutbound::failing("P2");
		let group = group_of(&[p1.clone(), p2.clone()], Duration::from_secs(60));

		let err = group.connect(&meta()).await.unwrap_err();
		assert!(matches!(err, ProxyError::NoAvailableProxy));
		// Both blocked, yet candidates still offers the full list.
		assert_eq!(group.candidates().len(), 2);
	}

	#[tokio::test]
	async fn successful_member_moves_to_front() {
		let p1 = FakeOutbound::failing("P1");
		let p2 = ok("P2");
		let p3 = ok("P3");
		let group = group_of(&[p1, p2, p3], Duration::from_millis(10));

		group.connect(&meta()).await.unwrap();
		tokio::time::sleep(Duration::from_millis(20)).await;
		// P1's cooldown lapsed, but P2 stays preferred.
		let names: Vec<_> = group.candidates().iter().map(|p| p.name()).collect();
		assert_eq!(names[0], strng::new("P2"));
	}
}
