use flowgate_core::prelude::*;

use crate::errors::ProxyError;
use crate::rules::{Rule, RuleType};
use crate::types::Metadata;

pub struct Port {
	port: u16,
	payload: Strng,
	adapter: Strng,
	match_source: bool,
}

impl Port {
	pub fn source(payload: &str, adapter: Strng) -> Result<Port, ProxyError> {
		Self::new(payload, adapter, true)
	}

	pub fn destination(payload: &str, adapter: Strng) -> Result<Port, ProxyError> {
		Self::new(payload, adapter, false)
	}

	fn new(payload: &str, adapter: Strng, match_source: bool) -> Result<Port, ProxyError> {
		let port = payload
			.parse::<u16>()
			.map_err(|_| ProxyError::InvalidConfig(format!("bad port {payload}")))?;
		Ok(Port {
			port,
			payload: strng::new(payload),
			adapter,
			match_source,
		})
	}
}

impl Rule for Port {
	fn rule_type(&self) -> RuleType {
		if self.match_source {
			RuleType::SrcPort
		} else {
			RuleType::DstPort
		}
	}

	fn matches(&self, metadata: &Metadata) -> bool {
		if self.match_source {
			metadata.src_port == self.port
		} else {
			metadata.dst_port == self.port
		}
	}

	fn adapter(&self) -> Strng {
		self.adapter.clone()
	}

	fn payload(&self) -> Strng {
		self.payload.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{InboundKind, Network};

	#[test]
	fn src_and_dst_ports() {
		let src = Port::source("30000", strng::new("T")).unwrap();
		let dst = Port::destination("53", strng::new("T")).unwrap();
		let mut m = Metadata::new(InboundKind::Socks5, Network::Udp);
		m.src_port = 30000;
		m.dst_port = 53;
		assert!(src.matches(&m));
		assert!(dst.matches(&m));
		m.dst_port = 443;
		assert!(!dst.matches(&m));
		assert!(Port::destination("banana", strng::new("T")).is_err());
	}
}
