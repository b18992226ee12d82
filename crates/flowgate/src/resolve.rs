//! Resolution capabilities consumed by the tunnel. The actual DNS engine,
//! fake-ip pool, and process tables live outside the core; the core only
//! depends on these traits.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use hickory_resolver::TokioResolver;
use hickory_resolver::name_server::TokioConnectionProvider;

use crate::types::Network;

/// Name resolution plus the enhanced-mode hooks the dispatcher needs:
/// static hosts, ip-to-host reverse mapping, and fake-ip awareness.
#[async_trait]
pub trait Resolver: Send + Sync {
	async fn resolve(&self, host: &str) -> io::Result<IpAddr>;

	/// Static hosts table lookup.
	fn search_hosts(&self, host: &str) -> Option<IpAddr> {
		let _ = host;
		None
	}

	/// Reverse mapping installed by the DNS layer (enhanced modes only).
	fn find_host_by_ip(&self, ip: IpAddr) -> Option<Strng> {
		let _ = ip;
		None
	}

	fn mapping_enabled(&self) -> bool {
		false
	}

	fn is_fake_ip(&self, ip: IpAddr) -> bool {
		let _ = ip;
		false
	}

	/// Whether the fake-ip pool ever handed out this address (even if the
	/// record has since been evicted).
	fn fake_ip_enabled(&self) -> bool {
		false
	}
}

/// System resolver with a static hosts table layered in front.
pub struct SystemResolver {
	resolver: TokioResolver,
	hosts: HashMap<Strng, IpAddr>,
}

impl SystemResolver {
	pub fn new(hosts: HashMap<Strng, IpAddr>) -> anyhow::Result<SystemResolver> {
		let (config, options) = hickory_resolver::system_conf::read_system_conf()?;
		let mut builder =
			TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
		*builder.options_mut() = options;
		Ok(SystemResolver {
			resolver: builder.build(),
			hosts,
		})
	}
}

#[async_trait]
impl Resolver for SystemResolver {
	async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
		if let Some(ip) = self.search_hosts(host) {
			return Ok(ip);
		}
		let response = self
			.resolver
			.lookup_ip(host)
			.await
			.map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
		response
			.iter()
			.next()
			.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses"))
	}

	fn search_hosts(&self, host: &str) -> Option<IpAddr> {
		self.hosts.get(host).copied()
	}
}

/// Country lookup for GEOIP rules. The mmdb-backed implementation is
/// provided by the embedding application.
pub trait GeoIpLookup: Send + Sync {
	fn country(&self, ip: IpAddr) -> Option<Strng>;
}

/// A lookup that never matches, for deployments without a geo database.
pub struct NoGeoIp;

impl GeoIpLookup for NoGeoIp {
	fn country(&self, _ip: IpAddr) -> Option<Strng> {
		None
	}
}

/// Maps a flow's source socket to the owning process path. Platform
/// implementations are out of scope for the core.
pub trait ProcessLookup: Send + Sync {
	fn find(&self, network: Network, source: SocketAddr) -> io::Result<Strng>;
}

pub struct NoProcessLookup;

impl ProcessLookup for NoProcessLookup {
	fn find(&self, _network: Network, _source: SocketAddr) -> io::Result<Strng> {
		Err(io::Error::new(
			io::ErrorKind::Unsupported,
			"process lookup unavailable",
		))
	}
}

#[cfg(test)]
pub mod testing {
	use super::*;

	/// Fixed-table resolver for tests.
	pub struct StaticResolver {
		pub table: HashMap<Strng, IpAddr>,
		pub hosts: HashMap<Strng, IpAddr>,
	}

	impl StaticResolver {
		pub fn of(entries: &[(&str, &str)]) -> Arc<StaticResolver> {
			Arc::new(StaticResolver {
				table: entries
					.iter()
					.map(|(h, ip)| (strng::new(h), ip.parse().unwrap()))
					.collect(),
				hosts: HashMap::new(),
			})
		}
	}

	#[async_trait]
	impl Resolver for StaticResolver {
		async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
			self
				.table
				.get(host)
				.copied()
				.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no record"))
		}

		fn search_hosts(&self, host: &str) -> Option<IpAddr> {
			self.hosts.get(host).copied()
		}
	}
}
