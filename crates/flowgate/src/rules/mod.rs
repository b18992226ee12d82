mod domain;
mod geoip;
mod ipcidr;
mod logical;
mod port;
mod process;

use flowgate_core::prelude::*;

pub use domain::{Domain, DomainKeyword, DomainSuffix};
pub use geoip::GeoIp;
pub use ipcidr::IpCidr;
pub use logical::{And, Not};
pub use port::Port;
pub use process::{Process, NotProcess};

use crate::errors::ProxyError;
use crate::resolve::GeoIpLookup;
use crate::types::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
	Domain,
	DomainSuffix,
	DomainKeyword,
	GeoIp,
	IpCidr,
	SrcIpCidr,
	SrcPort,
	DstPort,
	ProcessName,
	ProcessPath,
	Match,
	Inbound,
	And,
	Not,
}

impl Display for RuleType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			RuleType::Domain => "DOMAIN",
			RuleType::DomainSuffix => "DOMAIN-SUFFIX",
			RuleType::DomainKeyword => "DOMAIN-KEYWORD",
			RuleType::GeoIp => "GEOIP",
			RuleType::IpCidr => "IP-CIDR",
			RuleType::SrcIpCidr => "SRC-IP-CIDR",
			RuleType::SrcPort => "SRC-PORT",
			RuleType::DstPort => "DST-PORT",
			RuleType::ProcessName => "PROCESS-NAME",
			RuleType::ProcessPath => "PROCESS-PATH",
			RuleType::Match => "MATCH",
			RuleType::Inbound => "INBOUND",
			RuleType::And => "AND",
			RuleType::Not => "NOT",
		};
		f.write_str(s)
	}
}

/// A typed predicate over flow metadata, bound to the outbound it selects.
pub trait Rule: Send + Sync {
	fn rule_type(&self) -> RuleType;

	fn matches(&self, metadata: &Metadata) -> bool;

	/// Name of the outbound this rule routes to.
	fn adapter(&self) -> Strng;

	fn payload(&self) -> Strng;

	/// Whether the matcher should resolve the destination host before
	/// evaluating this rule.
	fn should_resolve_ip(&self) -> bool {
		false
	}

	/// Whether the matcher should look up the owning process before
	/// evaluating this rule.
	fn should_find_process(&self) -> bool {
		false
	}
}

pub fn has_no_resolve(params: &[&str]) -> bool {
	params.iter().any(|p| *p == "no-resolve")
}

/// Always matches; the terminal MATCH rule.
pub struct MatchAll {
	adapter: Strng,
}

impl MatchAll {
	pub fn new(adapter: Strng) -> MatchAll {
		MatchAll { adapter }
	}
}

impl Rule for MatchAll {
	fn rule_type(&self) -> RuleType {
		RuleType::Match
	}

	fn matches(&self, _metadata: &Metadata) -> bool {
		true
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		strng::EMPTY
	}
}

/// Matches flows by the listener that produced them.
pub struct InboundRule {
	inbound: Strng,
	adapter: Strng,
}

impl InboundRule {
	pub fn new(inbound: Strng, adapter: Strng) -> InboundRule {
		InboundRule { inbound, adapter }
	}
}

impl Rule for InboundRule {
	fn rule_type(&self) -> RuleType {
		RuleType::Inbound
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		metadata.inbound == self.inbound
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.inbound.clone()
	}
}

/// Constructs one typed rule from its config parts.
pub fn parse_rule(
	type_tag: &str,
	payload: &str,
	target: &str,
	params: &[&str],
	geoip: &Arc<dyn GeoIpLookup>,
) -> Result<Box<dyn Rule>, ProxyError> {
	let target = strng::new(target);
	let rule: Box<dyn Rule> = match type_tag {
		"DOMAIN" => Box::new(Domain::new(payload, target)),
		"DOMAIN-SUFFIX" => Box::new(DomainSuffix::new(payload, target)),
		"DOMAIN-KEYWORD" => Box::new(DomainKeyword::new(payload, target)),
		"GEOIP" => Box::new(GeoIp::new(
			payload,
			target,
			has_no_resolve(params),
			geoip.clone(),
		)),
		"IP-CIDR" | "IP-CIDR6" => Box::new(IpCidr::destination(
			payload,
			target,
			has_no_resolve(params),
		)?),
		"SRC-IP-CIDR" => Box::new(IpCidr::source(payload, target)?),
		"SRC-PORT" => Box::new(Port::source(payload, target)?),
		"DST-PORT" => Box::new(Port::destination(payload, target)?),
		"PROCESS-NAME" => Box::new(Process::new(payload, target, true)),
		"PROCESS-PATH" => Box::new(Process::new(payload, target, false)),
		"NOT-PROCESS-NAME" => Box::new(NotProcess::new(payload, target, true)),
		"NOT-PROCESS-PATH" => Box::new(NotProcess::new(payload, target, false)),
		"INBOUND" => Box::new(InboundRule::new(strng::new(payload), target)),
		"AND" => Box::new(And::new(payload, target, geoip)?),
		"NOT" => Box::new(Not::new(payload, target, geoip)?),
		"MATCH" => Box::new(MatchAll::new(target)),
		other => return Err(ProxyError::InvalidConfig(format!("unsupported rule type {other}"))),
	};
	Ok(rule)
}
