use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::group::GroupBase;
use crate::outbound::{Outbound, Proxy, ProxyType};
use crate::transport::{BoxedDatagram, BoxedStream};
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
	ConsistentHashing,
	RoundRobin,
}

impl Strategy {
	pub fn parse(s: Option<&str>) -> Result<Strategy, ProxyError> {
		match s.unwrap_or("consistent-hashing") {
			"consistent-hashing" => Ok(Strategy::ConsistentHashing),
			"round-robin" => Ok(Strategy::RoundRobin),
			other => Err(ProxyError::InvalidConfig(format!(
				"unknown load-balance strategy {other}"
			))),
		}
	}
}

/// Spreads flows over members. Consistent hashing keys on the destination
/// host (or IP when there is none), so one site sticks to one member;
/// round-robin just rotates.
pub struct LoadBalance {
	base: GroupBase,
	strategy: Strategy,
	counter: AtomicUsize,
}

impl LoadBalance {
	pub fn new(base: GroupBase, strategy: Strategy) -> Arc<LoadBalance> {
		Arc::new(LoadBalance {
			base,
			strategy,
			counter: AtomicUsize::new(0),
		})
	}

	fn key(metadata: &Metadata) -> String {
		if !metadata.host.is_empty() {
			metadata.host.to_string()
		} else if let Some(ip) = metadata.dst_ip {
			ip.to_string()
		} else {
			String::new()
		}
	}

	fn pick(&self, metadata: &Metadata, touch: bool) -> Result<Arc<Proxy>, ProxyError> {
		let members = self.base.proxies(touch);
		if members.is_empty() {
			return Err(ProxyError::NoAvailableProxy);
		}
		let start = match self.strategy {
			Strategy::ConsistentHashing => {
				let mut hasher = std::hash::DefaultHasher::new();
				Self::key(metadata).hash(&mut hasher);
				(hasher.finish() % members.len() as u64) as usize
			},
			Strategy::RoundRobin => self.counter.fetch_add(1, Ordering::Relaxed) % members.len(),
		};
		// Prefer the slot owner, then walk forward to the next live member.
		for offset in 0..members.len() {
			let candidate = &members[(start + offset) % members.len()];
			if candidate.alive() {
				return Ok(candidate.clone());
			}
		}
		Ok(members[start].clone())
	}
}

#[async_trait]
impl Outbound for LoadBalance {
	fn name(&self) -> Strng {
		self.base.name()
	}

	fn proto(&self) -> ProxyType {
		ProxyType::LoadBalance
	}

	fn supports_udp(&self) -> bool {
		true
	}

	async fn connect(&self, metadata: &Metadata) -> Result<BoxedStream, ProxyError> {
		self.pick(metadata, true)?.connect(metadata).await
	}

	async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedDatagram, ProxyError> {
		self.pick(metadata, true)?.listen_packet(metadata).await
	}

	fn unwrap(&self, metadata: &Metadata) -> Option<Arc<Proxy>> {
		self.pick(metadata, false).ok()
	}

	fn describe(&self) -> serde_json::Value {
		serde_json::json!({
			"all": self.base.member_names(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::group::testing::base_of;
	use crate::types::{InboundKind, Network};

	fn meta_for(host: &str) -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new(host);
		m.dst_port = 443;
		m
	}

	#[test]
	fn consistent_hashing_is_deterministic_per_host() {
		let group = LoadBalance::new(base_of(&["a", "b", "c"]), Strategy::ConsistentHashing);
		let first = group.pick(&meta_for("example.com"), false).unwrap().name();
		for _ in 0..10 {
			assert_eq!(
				group.pick(&meta_for("example.com"), false).unwrap().name(),
				first
			);
		}
	}

	#[test]
	fn round_robin_rotates() {
		let group = LoadBalance::new(base_of(&["a", "b"]), Strategy::RoundRobin);
		let m = meta_for("example.com");
		let first = group.pick(&m, false).unwrap().name();
		let second = group.pick(&m, false).unwrap().name();
		assert_ne!(first, second);
		assert_eq!(group.pick(&m, false).unwrap().name(), first);
	}

	#[test]
	fn unknown_strategy_is_rejected() {
		assert!(Strategy::parse(Some("bogus")).is_err());
		assert_eq!(Strategy::parse(None).unwrap(), Strategy::ConsistentHashing);
	}
}
