use flowgate_core::prelude::*;
use ipnet::IpNet;

use crate::errors::ProxyError;
use crate::rules::{Rule, RuleType};
use crate::types::Metadata;

pub struct IpCidr {
	net: IpNet,
	payload: Strng,
	adapter: Strng,
	match_source: bool,
	no_resolve: bool,
}

impl IpCidr {
	pub fn destination(payload: &str, adapter: Strng, no_resolve: bool) -> Result<IpCidr, ProxyError> {
		Self::new(payload, adapter, false, no_resolve)
	}

	/// Source rules never trigger resolution; the source is always known.
	pub fn source(payload: &str, adapter: Strng) -> Result<IpCidr, ProxyError> {
		Self::new(payload, adapter, true, true)
	}

	fn new(
		payload: &str,
		adapter: Strng,
		match_source: bool,
		no_resolve: bool,
	) -> Result<IpCidr, ProxyError> {
		let net = payload
			.parse::<IpNet>()
			.map_err(|_| ProxyError::InvalidConfig(format!("bad CIDR {payload}")))?;
		Ok(IpCidr {
			net,
			payload: strng::new(payload),
			adapter,
			match_source,
			no_resolve,
		})
	}
}

impl Rule for IpCidr {
	fn rule_type(&self) -> RuleType {
		if self.match_source {
			RuleType::SrcIpCidr
		} else {
			RuleType::IpCidr
		}
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		let ip = if self.match_source {
			Some(metadata.src_ip)
		} else {
			metadata.dst_ip
		};
		ip.is_some_and(|ip| self.net.contains(&ip))
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.payload.clone()
	}

	fn should_resolve_ip(&self) -> bool {
		!self.match_source && !self.no_resolve
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};

	#[test]
	fn destination_cidr() {
		let rule = IpCidr::destination("10.0.0.0/8", strng::new("T"), false).unwrap();
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		assert!(!rule.matches(&m));
		m.dst_ip = Some("10.1.2.3".parse().unwrap());
		assert!(rule.matches(&m));
		m.dst_ip = Some("11.0.0.1".parse().unwrap());
		assert!(!rule.matches(&m));
	}

	#[test]
	fn source_cidr_ignores_destination() {
		let rule = IpCidr::source("192.168.0.0/16", strng::new("T")).unwrap();
		assert!(!rule.should_resolve_ip());
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.src_ip = "192.168.1.5".parse().unwrap();
		m.dst_ip = Some("8.8.8.8".parse().unwrap());
		assert!(rule.matches(&m));
	}

	#[test]
	fn ipv6_cidr_parses() {
		let rule = IpCidr::destination("2001:db8::/32", strng::new("T"), true).unwrap();
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.dst_ip = Some("2001:db8::1".parse().unwrap());
		assert!(rule.matches(&m));
	}
}
