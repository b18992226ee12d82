use flowgate_core::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
	Tcp,
	Udp,
}

impl Display for Network {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Network::Tcp => f.write_str("tcp"),
			Network::Udp => f.write_str("udp"),
		}
	}
}

/// How the destination address was produced by the resolver layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsMode {
	#[default]
	Normal,
	Mapping,
	FakeIp,
}

/// Which inbound protocol produced the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InboundKind {
	Http,
	Https,
	Socks4,
	Socks5,
	Redir,
}

impl Display for InboundKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			InboundKind::Http => "HTTP",
			InboundKind::Https => "HTTPS",
			InboundKind::Socks4 => "SOCKS4",
			InboundKind::Socks5 => "SOCKS5",
			InboundKind::Redir => "REDIR",
		};
		f.write_str(s)
	}
}

/// Per-flow descriptor. Stamped by the inbound listener, refined by
/// pre-handling and rule resolution, then immutable while the flow relays.
///
/// Valid metadata always carries at least one of `host` or `dst_ip`; a flow
/// is "resolved" once `dst_ip` is set.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
	pub network: Network,
	pub inbound: Strng,
	#[serde(rename = "sourceIP")]
	pub src_ip: IpAddr,
	pub src_port: u16,
	#[serde(rename = "destinationIP")]
	pub dst_ip: Option<IpAddr>,
	pub host: Strng,
	pub dst_port: u16,
	pub dns_mode: DnsMode,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub process_path: Option<Strng>,
	#[serde(rename = "type")]
	pub typ: InboundKind,
}

impl Metadata {
	pub fn new(typ: InboundKind, network: Network) -> Metadata {
		Metadata {
			network,
			inbound: strng::EMPTY,
			src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			src_port: 0,
			dst_ip: None,
			host: strng::EMPTY,
			dst_port: 0,
			dns_mode: DnsMode::Normal,
			process_path: None,
			typ,
		}
	}

	pub fn with_source(mut self, addr: SocketAddr) -> Metadata {
		self.src_ip = addr.ip();
		self.src_port = addr.port();
		self
	}

	pub fn valid(&self) -> bool {
		!self.host.is_empty() || self.dst_ip.is_some()
	}

	pub fn resolved(&self) -> bool {
		self.dst_ip.is_some()
	}

	/// The address an outbound should dial, preferring the hostname so the
	/// far end of a proxy chain can resolve it itself.
	pub fn remote_addr(&self) -> String {
		if !self.host.is_empty() {
			format!("{}:{}", self.host, self.dst_port)
		} else if let Some(ip) = self.dst_ip {
			SocketAddr::new(ip, self.dst_port).to_string()
		} else {
			format!(":{}", self.dst_port)
		}
	}

	pub fn source_addr(&self) -> SocketAddr {
		SocketAddr::new(self.src_ip, self.src_port)
	}

	/// Destination as a socket address; requires the flow to be resolved.
	pub fn udp_addr(&self) -> Option<SocketAddr> {
		self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
	}

	/// A view safe to hand to a real dialer: fake-ip destinations are
	/// stripped so the adapter dials by hostname instead.
	pub fn pure(&self) -> Metadata {
		if self.dns_mode == DnsMode::FakeIp && self.dst_ip.is_some() {
			let mut m = self.clone();
			m.dst_ip = None;
			return m;
		}
		self.clone()
	}
}

impl Display for Metadata {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{} {} --> {}",
			self.network,
			self.source_addr(),
			self.remote_addr()
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn meta() -> Metadata {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		m.host = strng::new("www.example.com");
		m.dst_port = 443;
		m
	}

	#[test]
	fn host_or_ip_makes_metadata_valid() {
		let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
		assert!(!m.valid());
		m.host = strng::new("example.com");
		assert!(m.valid());
		m.host = strng::EMPTY;
		m.dst_ip = Some("1.1.1.1".parse().unwrap());
		assert!(m.valid());
	}

	#[test]
	fn remote_addr_prefers_host() {
		let mut m = meta();
		m.dst_ip = Some("93.184.216.34".parse().unwrap());
		assert_eq!(m.remote_addr(), "www.example.com:443");
		m.host = strng::EMPTY;
		assert_eq!(m.remote_addr(), "93.184.216.34:443");
	}

	#[test]
	fn pure_strips_fake_ip() {
		let mut m = meta();
		m.dst_ip = Some("198.18.0.5".parse().unwrap());
		m.dns_mode = DnsMode::FakeIp;
		let p = m.pure();
		assert_eq!(p.dst_ip, None);
		assert_eq!(p.host, m.host);
		// Mapping mode keeps the resolved address.
		m.dns_mode = DnsMode::Mapping;
		assert!(m.pure().dst_ip.is_some());
	}
}
