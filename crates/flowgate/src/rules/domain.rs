use flowgate_core::prelude::*;

use crate::rules::{Rule, RuleType};
use crate::types::Metadata;

pub struct Domain {
	domain: Strng,
	adapter: Strng,
}

impl Domain {
	pub fn new(domain: &str, adapter: Strng) -> Domain {
		Domain {
			domain: strng::new(domain.to_ascii_lowercase()),
			adapter,
		}
	}
}

impl Rule for Domain {
	fn rule_type(&self) -> RuleType {
		RuleType::Domain
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		metadata.host.as_str() == self.domain.as_str()
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.domain.clone()
	}
}

pub struct DomainSuffix {
	suffix: Strng,
	adapter: Strng,
}

impl DomainSuffix {
	pub fn new(suffix: &str, adapter: Strng) -> DomainSuffix {
		DomainSuffix {
			suffix: strng::new(suffix.to_ascii_lowercase()),
			adapter,
		}
	}
}

impl Rule for DomainSuffix {
	fn rule_type(&self) -> RuleType {
		RuleType::DomainSuffix
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		let host = metadata.host.as_str();
		let suffix = self.suffix.as_str();
		host == suffix || host.ends_with(&format!(".{suffix}"))
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.suffix.clone()
	}
}

pub struct DomainKeyword {
	keyword: Strng,
	adapter: Strng,
}

impl DomainKeyword {
	pub fn new(keyword: &str, adapter: Strng) -> DomainKeyword {
		DomainKeyword {
			keyword: strng::new(keyword.to_ascii_lowercase()),
			adapter,
		}
	}
}

impl Rule for DomainKeyword {
	fn rule_type(&self) -> RuleType {
		RuleType::DomainKeyword
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		metadata.host.contains(self.keyword.as_str())
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.keyword.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};

	fn meta(host: &str) -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new(host);
		m
	}

	#[test]
	fn exact_domain() {
		let rule = Domain::new("Example.com", strng::new("T"));
		assert!(rule.matches(&meta("example.com")));
		assert!(!rule.matches(&meta("www.example.com")));
	}

	#[test]
	fn suffix_matches_subdomains_not_lookalikes() {
		let rule = DomainSuffix::new("example.com", strng::new("T"));
		assert!(rule.matches(&meta("example.com")));
		assert!(rule.matches(&meta("deep.www.example.com")));
		assert!(!rule.matches(&meta("notexample.com")));
	}

	#[test]
	fn keyword_is_substring() {
		let rule = DomainKeyword::new("tracker", strng::new("T"));
		assert!(rule.matches(&meta("ads.tracker.net")));
		assert!(!rule.matches(&meta("example.com")));
	}
}
