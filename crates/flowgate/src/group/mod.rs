pub mod autoselect;
pub mod fallback;
pub mod loadbalance;
pub mod relay;
pub mod selector;
pub mod urltest;

use std::collections::HashMap;

use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ProxyError;
use crate::group::autoselect::AutoSelector;
use crate::group::fallback::Fallback;
use crate::group::loadbalance::{LoadBalance, Strategy};
use crate::group::relay::Relay;
use crate::group::selector::Selector;
use crate::group::urltest::UrlTest;
use crate::outbound::Proxy;
use crate::provider::healthcheck::HealthCheck;
use crate::provider::{CompatibleProvider, ProxyProvider, VehicleType};
use crate::types::{InboundKind, Metadata, Network};

/// Member snapshots are memoized briefly so hot paths do not re-walk the
/// provider list per dial.
const MEMBER_CACHE_TTL: Duration = Duration::from_secs(10);

/// How far `unwrap` descends through nested groups. Config-time DAG
/// validation rules cycles out; this bounds the walk anyway.
pub const MAX_UNWRAP_DEPTH: usize = 8;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GroupCommonOption {
	pub name: String,
	#[serde(rename = "type")]
	pub group_type: String,
	#[serde(default)]
	pub proxies: Vec<String>,
	#[serde(default, rename = "use")]
	pub use_providers: Vec<String>,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub interval: u64,
	#[serde(default = "default_lazy")]
	pub lazy: bool,
	#[serde(default)]
	pub tolerance: u16,
	#[serde(default)]
	pub strategy: Option<String>,
	#[serde(default)]
	pub block_time: Option<u64>,
}

fn default_lazy() -> bool {
	true
}

/// Shared state for every group kind: the provider set and a short-lived
/// snapshot of the merged member list.
pub struct GroupBase {
	name: Strng,
	providers: Vec<Arc<dyn ProxyProvider>>,
	members: Memo<Vec<Arc<Proxy>>>,
}

impl GroupBase {
	pub fn new(name: Strng, providers: Vec<Arc<dyn ProxyProvider>>) -> GroupBase {
		GroupBase {
			name,
			providers,
			members: Memo::new(MEMBER_CACHE_TTL),
		}
	}

	pub fn name(&self) -> Strng {
		self.name.clone()
	}

	pub fn proxies(&self, touch: bool) -> Vec<Arc<Proxy>> {
		self
			.members
			.get_or_compute(|| get_provider_proxies(&self.providers, touch))
	}

	pub fn invalidate_members(&self) {
		self.members.invalidate();
	}

	pub fn member_names(&self) -> Vec<String> {
		self
			.proxies(false)
			.iter()
			.map(|p| p.name().to_string())
			.collect()
	}
}

pub fn get_provider_proxies(
	providers: &[Arc<dyn ProxyProvider>],
	touch: bool,
) -> Vec<Arc<Proxy>> {
	let mut out = Vec::new();
	for provider in providers {
		if touch {
			provider.touch();
		}
		out.extend(provider.proxies());
	}
	out
}

/// Single-flight memoization with a TTL: concurrent readers share one
/// computation, and recording a failure can invalidate early.
pub struct Memo<T> {
	ttl: Duration,
	slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> Memo<T> {
	pub fn new(ttl: Duration) -> Memo<T> {
		Memo {
			ttl,
			slot: Mutex::new(None),
		}
	}

	pub fn get_or_compute(&self, compute: impl FnOnce() -> T) -> T {
		let mut slot = self.slot.lock().expect("memo lock");
		if let Some((at, value)) = slot.as_ref()
			&& at.elapsed() < self.ttl
		{
			return value.clone();
		}
		let value = compute();
		*slot = Some((Instant::now(), value.clone()));
		value
	}

	pub fn invalidate(&self) {
		*self.slot.lock().expect("memo lock") = None;
	}
}

/// Builds flow metadata describing a relay hop's server address.
pub fn addr_to_metadata(addr: &str) -> Result<Metadata, ProxyError> {
	let mut metadata = Metadata::new(InboundKind::Socks5, Network::Tcp);
	if let Ok(sa) = addr.parse::<SocketAddr>() {
		metadata.dst_ip = Some(sa.ip());
		metadata.dst_port = sa.port();
		return Ok(metadata);
	}
	let (host, port) = addr
		.rsplit_once(':')
		.ok_or(ProxyError::AddressUnsupported)?;
	metadata.host = strng::new(host);
	metadata.dst_port = port.parse().map_err(|_| ProxyError::AddressUnsupported)?;
	Ok(metadata)
}

/// Follows `unwrap` through nested groups to the adapter that would carry
/// the flow, bounded by MAX_UNWRAP_DEPTH.
pub fn unwrap_proxy(proxy: &Arc<Proxy>, metadata: &Metadata) -> Arc<Proxy> {
	let mut current = proxy.clone();
	for _ in 0..MAX_UNWRAP_DEPTH {
		match current.unwrap(metadata) {
			Some(inner) => current = inner,
			None => break,
		}
	}
	current
}

/// Constructs a group from its option block against the current outbound
/// and provider maps. Mirrors the transactional mutation path: any error
/// leaves no state behind.
pub fn parse_proxy_group(
	option: &GroupCommonOption,
	proxies: &HashMap<Strng, Arc<Proxy>>,
	providers: &HashMap<Strng, Arc<dyn ProxyProvider>>,
) -> Result<Arc<Proxy>, ProxyError> {
	if option.name.is_empty() || option.group_type.is_empty() {
		return Err(ProxyError::InvalidConfig(
			"group needs a name and a type".to_string(),
		));
	}
	if option.proxies.is_empty() && option.use_providers.is_empty() {
		return Err(ProxyError::InvalidConfig(format!(
			"group {}: `proxies` or `use` missing",
			option.name
		)));
	}

	let name = strng::new(&option.name);
	let mut group_providers: Vec<Arc<dyn ProxyProvider>> = Vec::new();

	if !option.proxies.is_empty() {
		let mut members = Vec::with_capacity(option.proxies.len());
		for member in &option.proxies {
			let proxy = proxies
				.get(member.as_str())
				.ok_or_else(|| ProxyError::InvalidConfig(format!("'{member}' not found")))?;
			members.push(proxy.clone());
		}

		// Selection-style groups do not probe on their own; the measuring
		// kinds need a url and interval.
		let needs_health_check = matches!(option.group_type.as_str(), "url-test" | "fallback" | "load-balance");
		let health_check = if needs_health_check {
			let url = option.url.as_deref().unwrap_or_default();
			if url.is_empty() || option.interval == 0 {
				return Err(ProxyError::InvalidConfig(format!(
					"group {}: `url` or `interval` missing",
					option.name
				)));
			}
			HealthCheck::new(Vec::new(), strng::new(url), option.interval, option.lazy)
		} else {
			HealthCheck::new(Vec::new(), strng::EMPTY, 0, true)
		};
		group_providers.push(CompatibleProvider::new(name.clone(), members, health_check)?);
	}

	for use_name in &option.use_providers {
		let provider = providers
			.get(use_name.as_str())
			.ok_or_else(|| ProxyError::InvalidConfig(format!("'{use_name}' not found")))?;
		if provider.vehicle_type() == VehicleType::Compatible {
			return Err(ProxyError::InvalidConfig(format!(
				"group {} cannot appear in `use`",
				use_name
			)));
		}
		group_providers.push(provider.clone());
	}

	let base = GroupBase::new(name, group_providers);
	let group: Arc<Proxy> = match option.group_type.as_str() {
		"select" => Proxy::new(Selector::new(base)),
		"url-test" => Proxy::new(UrlTest::new(base, option.tolerance)),
		"fallback" => Proxy::new(Fallback::new(base)),
		"load-balance" => {
			let strategy = Strategy::parse(option.strategy.as_deref())?;
			Proxy::new(LoadBalance::new(base, strategy))
		},
		"relay" => {
			let direct = proxies
				.get(&crate::DIRECT)
				.cloned()
				.ok_or_else(|| ProxyError::InvalidConfig("DIRECT missing".to_string()))?;
			Proxy::new(Relay::new(base, direct))
		},
		"auto" => Proxy::new(AutoSelector::new(
			base,
			Duration::from_secs(option.block_time.unwrap_or(60)),
		)),
		other => Err(ProxyError::UnknownProxyType(strng::new(other)))?,
	};
	Ok(group)
}

#[cfg(test)]
pub mod testing {
	use super::*;
	use crate::outbound::testing::FakeOutbound;

	/// A compatible provider over fakes, with a manual health check.
	pub fn provider_of(names: &[&str]) -> Arc<dyn ProxyProvider> {
		let members: Vec<Arc<Proxy>> = names.iter().map(|n| FakeOutbound::proxy(n)).collect();
		let hc = HealthCheck::new(Vec::new(), strng::EMPTY, 0, true);
		CompatibleProvider::new(strng::new("test"), members, hc).unwrap()
	}

	pub fn base_of(names: &[&str]) -> GroupBase {
		GroupBase::new(strng::new("group"), vec![provider_of(names)])
	}

	#[test]
	fn memo_caches_and_invalidates() {
		let memo: Memo<u32> = Memo::new(Duration::from_secs(10));
		assert_eq!(memo.get_or_compute(|| 1), 1);
		assert_eq!(memo.get_or_compute(|| 2), 1);
		memo.invalidate();
		assert_eq!(memo.get_or_compute(|| 3), 3);
	}

	#[test]
	fn addr_to_metadata_handles_ip_and_domain() {
		let m = addr_to_metadata("1.2.3.4:8080").unwrap();
		assert_eq!(m.dst_ip, Some("1.2.3.4".parse().unwrap()));
		assert_eq!(m.dst_port, 8080);
		let m = addr_to_metadata("relay.example:443").unwrap();
		assert_eq!(m.host, strng::new("relay.example"));
		assert_eq!(m.dst_port, 443);
		assert!(addr_to_metadata("nonsense").is_err());
	}
}
