use std::collections::HashMap;
use std::path::Path;

use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ProxyError;
use crate::group::GroupCommonOption;
use crate::inbound::InboundOption;
use crate::outbound::http::{HttpOutbound, HttpOutboundOption};
use crate::outbound::socks5::{Socks5Outbound, Socks5OutboundOption};
use crate::outbound::ssh::{SshOutbound, SshOutboundOption};
use crate::outbound::Proxy;
use crate::provider::FetcherOption;
use crate::resolve::GeoIpLookup;
use crate::rules::{Rule, parse_rule};
use crate::tunnel::TunnelMode;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundOption {
	Http(HttpOutboundOption),
	Socks5(Socks5OutboundOption),
	Ssh(SshOutboundOption),
}

impl OutboundOption {
	pub fn name(&self) -> &str {
		match self {
			OutboundOption::Http(o) => &o.name,
			OutboundOption::Socks5(o) => &o.name,
			OutboundOption::Ssh(o) => &o.name,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ApiOption {
	pub listen: String,
	#[serde(default)]
	pub secret: Option<String>,
}

/// The validated top-level configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub inbounds: Vec<InboundOption>,
	#[serde(default)]
	pub outbounds: Vec<OutboundOption>,
	#[serde(default)]
	pub outbound_groups: Vec<GroupCommonOption>,
	#[serde(default)]
	pub providers: Vec<FetcherOption>,
	#[serde(default)]
	pub rules: Vec<String>,
	#[serde(default)]
	pub mode: TunnelMode,
	#[serde(default)]
	pub default_proxy: Option<String>,
	#[serde(default)]
	pub local_dns: bool,
	#[serde(default)]
	pub local_dns_retry: bool,
	#[serde(default)]
	pub hosts: HashMap<String, IpAddr>,
	#[serde(default)]
	pub api: Option<ApiOption>,
	#[serde(default)]
	pub log_level: Option<String>,
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
	let raw = std::fs::read_to_string(path)
		.with_context(|| format!("read config {}", path.display()))?;
	let config: Config = serde_yaml::from_str(&raw).context("parse config")?;
	Ok(config)
}

/// Constructs one concrete outbound adapter from its option block.
pub fn parse_outbound(option: OutboundOption) -> Result<Arc<Proxy>, ProxyError> {
	if option.name().is_empty() {
		return Err(ProxyError::InvalidConfig("outbound name required".to_string()));
	}
	let outbound: Arc<Proxy> = match option {
		OutboundOption::Http(o) => Proxy::new(
			HttpOutbound::new(o).map_err(|e| ProxyError::InvalidConfig(e.to_string()))?,
		),
		OutboundOption::Socks5(o) => Proxy::new(Socks5Outbound::new(o)),
		OutboundOption::Ssh(o) => Proxy::new(SshOutbound::new(o)?),
	};
	Ok(outbound)
}

/// Parses a provider document: a YAML mapping with a `proxies` list of
/// outbound option blocks.
pub fn parse_provider_payload(raw: &str) -> Result<Vec<Arc<Proxy>>, ProxyError> {
	#[derive(Deserialize)]
	#[serde(deny_unknown_fields)]
	struct Payload {
		proxies: Vec<OutboundOption>,
	}
	let payload: Payload = serde_yaml::from_str(raw)
		.map_err(|e| ProxyError::InvalidConfig(format!("provider payload: {e}")))?;
	payload.proxies.into_iter().map(parse_outbound).collect()
}

/// Parses one `TYPE,PAYLOAD,TARGET[,PARAM...]` rule line. MATCH takes no
/// payload: `MATCH,TARGET`.
pub fn parse_rule_line(
	line: &str,
	geoip: &Arc<dyn GeoIpLookup>,
) -> Result<Box<dyn Rule>, ProxyError> {
	let parts: Vec<&str> = line.split(',').map(str::trim).collect();
	let bad = || ProxyError::InvalidConfig(format!("rule [{line}] format invalid"));
	match parts.as_slice() {
		["MATCH", target] => parse_rule("MATCH", "", target, &[], geoip),
		[tp, payload, target, params @ ..] => parse_rule(tp, payload, target, params, geoip),
		_ => Err(bad()),
	}
}

/// Parses the whole rule list, verifying every target resolves to a known
/// outbound so a typo fails at load time instead of dial time.
pub fn parse_rules(
	lines: &[String],
	proxies: &HashMap<Strng, Arc<Proxy>>,
	geoip: &Arc<dyn GeoIpLookup>,
) -> Result<Vec<Arc<dyn Rule>>, ProxyError> {
	let mut rules: Vec<Arc<dyn Rule>> = Vec::with_capacity(lines.len());
	for line in lines {
		let rule = parse_rule_line(line, geoip)?;
		if !proxies.contains_key(&rule.adapter()) {
			return Err(ProxyError::InvalidConfig(format!(
				"rule [{line}]: outbound '{}' not found",
				rule.adapter()
			)));
		}
		rules.push(Arc::from(rule));
	}
	Ok(rules)
}

/// Orders groups so every group is constructed after the groups it
/// references (Kahn's algorithm). A cycle in the group graph is a config
/// error; the runtime never guards against one.
pub fn sort_groups(groups: &[GroupCommonOption]) -> Result<Vec<GroupCommonOption>, ProxyError> {
	let index: HashMap<&str, usize> = groups
		.iter()
		.enumerate()
		.map(|(i, g)| (g.name.as_str(), i))
		.collect();

	// Edge from dependency to dependent: a group's members must exist
	// before the group itself.
	let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); groups.len()];
	let mut indegree: Vec<usize> = vec![0; groups.len()];
	for (i, group) in groups.iter().enumerate() {
		for member in &group.proxies {
			if let Some(&dep) = index.get(member.as_str()) {
				dependents[dep].push(i);
				indegree[i] += 1;
			}
		}
	}

	let mut queue: Vec<usize> = indegree
		.iter()
		.enumerate()
		.filter(|(_, deg)| **deg == 0)
		.map(|(i, _)| i)
		.collect();
	let mut sorted = Vec::with_capacity(groups.len());
	while let Some(i) = queue.pop() {
		sorted.push(groups[i].clone());
		for &dependent in &dependents[i] {
			indegree[dependent] -= 1;
			if indegree[dependent] == 0 {
				queue.push(dependent);
			}
		}
	}

	if sorted.len() != groups.len() {
		let stuck = groups
			.iter()
			.enumerate()
			.find(|(i, _)| indegree[*i] > 0)
			.map(|(_, g)| strng::new(&g.name))
			.unwrap_or(strng::EMPTY);
		return Err(ProxyError::RelayLoop(stuck));
	}
	Ok(sorted)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolve::NoGeoIp;

	fn geoip() -> Arc<dyn GeoIpLookup> {
		Arc::new(NoGeoIp)
	}

	fn group(name: &str, members: &[&str]) -> GroupCommonOption {
		GroupCommonOption {
			name: name.to_string(),
			group_type: "select".to_string(),
			proxies: members.iter().map(|s| s.to_string()).collect(),
			use_providers: vec![],
			url: None,
			interval: 0,
			lazy: true,
			tolerance: 0,
			strategy: None,
			block_time: None,
		}
	}

	#[test]
	fn parses_full_document() {
		let doc = r#"
mode: rule
log-level: debug
inbounds:
  - type: socks
    name: socks-in
    listen: 127.0.0.1
    port: 7891
  - type: http
    name: http-in
    listen: 127.0.0.1
    port: 7890
    users:
      - username: u
        password: p
outbounds:
  - type: http
    name: corp
    server: proxy.corp.example
    port: 3128
    proxy-mode: tunnel
  - type: ssh
    name: bastion
    server: bastion.example
    port: 22
    username: ops
    password: hunter2
outbound-groups:
  - name: OUT
    type: select
    proxies: [corp, bastion]
rules:
  - DOMAIN-SUFFIX,example.com,OUT
  - MATCH,DIRECT
api:
  listen: 127.0.0.1:9090
  secret: s3cret
"#;
		let config: Config = serde_yaml::from_str(doc).unwrap();
		assert_eq!(config.inbounds.len(), 2);
		assert_eq!(config.outbounds.len(), 2);
		assert_eq!(config.outbound_groups.len(), 1);
		assert_eq!(config.rules.len(), 2);
		assert_eq!(config.mode, TunnelMode::Rule);
		assert_eq!(config.api.unwrap().secret.as_deref(), Some("s3cret"));
	}

	#[test]
	fn rule_lines_parse_with_params() {
		let rule = parse_rule_line("IP-CIDR,10.0.0.0/8,DIRECT,no-resolve", &geoip()).unwrap();
		assert!(!rule.should_resolve_ip());
		assert_eq!(rule.adapter(), strng::new("DIRECT"));

		let rule = parse_rule_line("MATCH,REJECT", &geoip()).unwrap();
		assert_eq!(rule.adapter(), strng::new("REJECT"));

		assert!(parse_rule_line("DOMAIN", &geoip()).is_err());
	}

	#[test]
	fn rules_validate_targets() {
		let mut proxies = HashMap::new();
		proxies.insert(
			strng::new("DIRECT"),
			crate::outbound::testing::FakeOutbound::proxy("DIRECT"),
		);
		let ok = parse_rules(&["MATCH,DIRECT".to_string()], &proxies, &geoip());
		assert!(ok.is_ok());
		let missing = parse_rules(&["MATCH,NOPE".to_string()], &proxies, &geoip());
		assert!(missing.is_err());
	}

	#[test]
	fn groups_sort_dependencies_first() {
		let groups = vec![
			group("outer", &["middle", "corp"]),
			group("middle", &["inner"]),
			group("inner", &["corp"]),
		];
		let sorted = sort_groups(&groups).unwrap();
		let pos = |name: &str| sorted.iter().position(|g| g.name == name).unwrap();
		assert!(pos("inner") < pos("middle"));
		assert!(pos("middle") < pos("outer"));
	}

	#[test]
	fn group_cycles_are_rejected() {
		let groups = vec![group("a", &["b"]), group("b", &["a"])];
		let err = sort_groups(&groups).unwrap_err();
		assert!(matches!(err, ProxyError::RelayLoop(_)));
	}

	#[test]
	fn provider_payload_parses() {
		let doc = r#"
proxies:
  - type: socks5
    name: up1
    server: 10.0.0.1
    port: 1080
  - type: http
    name: up2
    server: 10.0.0.2
    port: 3128
"#;
		let proxies = parse_provider_payload(doc).unwrap();
		assert_eq!(proxies.len(), 2);
		assert_eq!(proxies[0].name(), "up1");
	}
}
