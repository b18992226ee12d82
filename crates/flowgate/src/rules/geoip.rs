use flowgate_core::prelude::*;

use crate::resolve::GeoIpLookup;
use crate::rules::{Rule, RuleType};
use crate::types::Metadata;

pub struct GeoIp {
	country: Strng,
	adapter: Strng,
	no_resolve: bool,
	lookup: Arc<dyn GeoIpLookup>,
}

impl GeoIp {
	pub fn new(
		country: &str,
		adapter: Strng,
		no_resolve: bool,
		lookup: Arc<dyn GeoIpLookup>,
	) -> GeoIp {
		GeoIp {
			country: strng::new(country.to_ascii_uppercase()),
			adapter,
			no_resolve,
			lookup,
		}
	}

	fn is_lan(ip: IpAddr) -> bool {
		match ip {
			IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
			IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
		}
	}
}

impl Rule for GeoIp {
	fn rule_type(&self) -> RuleType {
		RuleType::GeoIp
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		let Some(ip) = metadata.dst_ip else {
			return false;
		};
		// LAN is a pseudo-country resolved without a database.
		if self.country.as_str() == "LAN" {
			return Self::is_lan(ip);
		}
		self
			.lookup
			.country(ip)
			.is_some_and(|c| c.as_str() == self.country.as_str())
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.country.clone()
	}

	fn should_resolve_ip(&self) -> bool {
		!self.no_resolve
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};

	struct OneCountry;

	impl GeoIpLookup for OneCountry {
		fn country(&self, ip: IpAddr) -> Option<Strng> {
			if ip.to_string().starts_with("1.") {
				Some(strng::new("CN"))
			} else {
				None
			}
		}
	}

	fn meta(ip: &str) -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.dst_ip = Some(ip.parse().unwrap());
		m
	}

	#[test]
	fn matches_by_database_country() {
		let rule = GeoIp::new("cn", strng::new("T"), false, Arc::new(OneCountry));
		assert!(rule.matches(&meta("1.2.3.4")));
		assert!(!rule.matches(&meta("8.8.8.8")));
	}

	#[test]
	fn lan_pseudo_country() {
		let rule = GeoIp::new("LAN", strng::new("T"), true, Arc::new(OneCountry));
		assert!(rule.matches(&meta("192.168.1.1")));
		assert!(rule.matches(&meta("127.0.0.1")));
		assert!(!rule.matches(&meta("8.8.8.8")));
	}
}
