use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::resolve::GeoIpLookup;
use crate::rules::{Rule, RuleType, parse_rule};
use crate::types::Metadata;

/// Splits `TYPE:payload[:param...]` into parse_rule arguments.
fn parse_component(
	component: &str,
	geoip: &Arc<dyn GeoIpLookup>,
) -> Result<Box<dyn Rule>, ProxyError> {
	let parts: Vec<&str> = component.split(':').map(str::trim).collect();
	if parts.len() < 2 {
		return Err(ProxyError::InvalidConfig(format!(
			"rule [{component}] format invalid"
		)));
	}
	parse_rule(parts[0], parts[1], "", &parts[2..], geoip)
}

/// Conjunction of sub-rules: `AND,a:x && b:y,TARGET`. Resolution and
/// process-lookup demands are the union of the components'.
pub struct And {
	rules: Vec<Box<dyn Rule>>,
	payload: Strng,
	adapter: Strng,
	should_resolve_ip: bool,
	should_find_process: bool,
}

impl And {
	pub fn new(
		payload: &str,
		adapter: Strng,
		geoip: &Arc<dyn GeoIpLookup>,
	) -> Result<And, ProxyError> {
		let mut rules = Vec::new();
		let mut should_resolve_ip = false;
		let mut should_find_process = false;
		for component in payload.split("&&") {
			let rule = parse_component(component.trim(), geoip)?;
			should_resolve_ip |= rule.should_resolve_ip();
			should_find_process |= rule.should_find_process();
			rules.push(rule);
		}
		if rules.is_empty() {
			return Err(ProxyError::InvalidConfig("empty AND rule".to_string()));
		}
		Ok(And {
			rules,
			payload: strng::new(payload),
			adapter,
			should_resolve_ip,
			should_find_process,
		})
	}
}

impl Rule for And {
	fn rule_type(&self) -> RuleType {
		RuleType::And
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		self.rules.iter().all(|r| r.matches(metadata))
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.payload.clone()
	}

	fn should_resolve_ip(&self) -> bool {
		self.should_resolve_ip
	}

	fn should_find_process(&self) -> bool {
		self.should_find_process
	}
}

/// Negation of one sub-rule: `NOT,TYPE:payload,TARGET`. Demands propagate
/// so the inner rule still sees resolved metadata.
pub struct Not {
	rule: Box<dyn Rule>,
	payload: Strng,
	adapter: Strng,
}

impl Not {
	pub fn new(
		payload: &str,
		adapter: Strng,
		geoip: &Arc<dyn GeoIpLookup>,
	) -> Result<Not, ProxyError> {
		let rule = parse_component(payload, geoip)?;
		Ok(Not {
			rule,
			payload: strng::new(payload),
			adapter,
		})
	}
}

impl Rule for Not {
	fn rule_type(&self) -> RuleType {
		RuleType::Not
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		!self.rule.matches(metadata)
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.payload.clone()
	}

	fn should_resolve_ip(&self) -> bool {
		self.rule.should_resolve_ip()
	}

	fn should_find_process(&self) -> bool {
		self.rule.should_find_process()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolve::NoGeoIp;
	use crate::types::{InboundKind, Network};

	fn geoip() -> Arc<dyn GeoIpLookup> {
		Arc::new(NoGeoIp)
	}

	fn meta(host: &str, dst_port: u16) -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new(host);
		m.dst_port = dst_port;
		m
	}

	#[test]
	fn and_requires_all_components() {
		let rule = And::new(
			"DOMAIN-SUFFIX:example.com && DST-PORT:443",
			strng::new("T"),
			&geoip(),
		)
		.unwrap();
		assert!(rule.matches(&meta("www.example.com", 443)));
		assert!(!rule.matches(&meta("www.example.com", 80)));
		assert!(!rule.matches(&meta("other.net", 443)));
	}

	#[test]
	fn and_unions_component_demands() {
		let rule = And::new(
			"DOMAIN-SUFFIX:example.com && IP-CIDR:10.0.0.0/8",
			strng::new("T"),
			&geoip(),
		)
		.unwrap();
		assert!(rule.should_resolve_ip());
		assert!(!rule.should_find_process());
	}

	#[test]
	fn not_negates_and_propagates_flags() {
		let rule = Not::new("DST-PORT:443", strng::new("T"), &geoip()).unwrap();
		assert!(rule.matches(&meta("x", 80)));
		assert!(!rule.matches(&meta("x", 443)));

		let resolving = Not::new("IP-CIDR:10.0.0.0/8", strng::new("T"), &geoip()).unwrap();
		assert!(resolving.should_resolve_ip());
	}

	#[test]
	fn malformed_component_is_rejected() {
		assert!(And::new("DOMAIN-ONLY-NO-PAYLOAD", strng::new("T"), &geoip()).is_err());
	}
}
