pub mod auth;
pub mod http;
pub mod redirect;
pub mod socks;

use std::collections::HashMap;

use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ProxyError;
use crate::transport::pool::BufferPool;
use crate::transport::socks5::SocksAddr;
use crate::tunnel::Tunnel;
use crate::types::{InboundKind, Metadata, Network};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundType {
	Http,
	Socks,
	Redirect,
}

impl Display for InboundType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			InboundType::Http => f.write_str("http"),
			InboundType::Socks => f.write_str("socks"),
			InboundType::Redirect => f.write_str("redirect"),
		}
	}
}

/// A running local listener feeding the tunnel.
pub trait Inbound: Send + Sync {
	fn name(&self) -> Strng;

	fn kind(&self) -> InboundType;

	/// The address the listener was asked to bind.
	fn raw_address(&self) -> Strng;

	/// The address actually bound (differs from raw when port 0 was
	/// requested).
	fn local_address(&self) -> SocketAddr;

	/// Stops accepting and releases the sockets.
	fn close(&self);
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct User {
	pub username: String,
	pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundOption {
	Http(http::HttpInboundOption),
	Socks(socks::SocksInboundOption),
	Redirect(redirect::RedirectInboundOption),
}

impl InboundOption {
	pub fn name(&self) -> &str {
		match self {
			InboundOption::Http(o) => &o.name,
			InboundOption::Socks(o) => &o.name,
			InboundOption::Redirect(o) => &o.name,
		}
	}
}

/// Builds flow metadata for a handshake-provided target.
pub(crate) fn metadata_for_target(
	target: &SocksAddr,
	typ: InboundKind,
	network: Network,
	inbound: Strng,
	source: SocketAddr,
) -> Metadata {
	let mut metadata = Metadata::new(typ, network).with_source(source);
	metadata.inbound = inbound;
	match target {
		SocksAddr::Ip(sa) => {
			metadata.dst_ip = Some(sa.ip());
			metadata.dst_port = sa.port();
		},
		SocksAddr::Domain(host, port) => {
			metadata.host = host.clone();
			metadata.dst_port = *port;
		},
	}
	metadata
}

pub(crate) fn set_keepalive(stream: &tokio::net::TcpStream) {
	let sock = socket2::SockRef::from(stream);
	if let Err(e) = sock.set_keepalive(true) {
		debug!(err = %e, "set keepalive failed");
	}
}

/// Named registry of running listeners, mutated transactionally: a batch
/// either fully binds or leaves nothing behind.
pub struct InboundManager {
	tunnel: Arc<Tunnel>,
	pool: Arc<BufferPool>,
	inbounds: Mutex<HashMap<Strng, Arc<dyn Inbound>>>,
}

impl InboundManager {
	pub fn new(tunnel: Arc<Tunnel>) -> Arc<InboundManager> {
		Arc::new(InboundManager {
			tunnel,
			pool: BufferPool::udp(),
			inbounds: Mutex::new(HashMap::new()),
		})
	}

	pub async fn add_inbounds(&self, options: Vec<InboundOption>) -> Result<(), ProxyError> {
		// Validate the whole batch before binding anything.
		{
			let inbounds = self.inbounds.lock().expect("inbounds lock");
			let mut seen = Vec::new();
			for option in &options {
				let name = option.name();
				if name.is_empty() {
					return Err(ProxyError::InvalidConfig("inbound name required".to_string()));
				}
				if inbounds.contains_key(name) || seen.contains(&name) {
					return Err(ProxyError::DuplicateName(strng::new(name)));
				}
				seen.push(name);
			}
		}

		fn erase<T: Inbound + 'static>(inbound: Arc<T>) -> Arc<dyn Inbound> {
			inbound
		}

		let mut built: Vec<Arc<dyn Inbound>> = Vec::with_capacity(options.len());
		for option in options {
			let result: Result<Arc<dyn Inbound>, ProxyError> = match option {
				InboundOption::Http(o) => http::HttpInbound::new(o, self.tunnel.clone())
					.await
					.map(erase),
				InboundOption::Socks(o) => {
					socks::SocksInbound::new(o, self.tunnel.clone(), self.pool.clone())
						.await
						.map(erase)
				},
				InboundOption::Redirect(o) => {
					redirect::RedirectInbound::new(o, self.tunnel.clone(), self.pool.clone())
						.await
						.map(erase)
				},
			};
			match result {
				Ok(inbound) => built.push(inbound),
				Err(e) => {
					// Unwind the part of the batch that already bound.
					for inbound in built {
						inbound.close();
					}
					return Err(e);
				},
			}
		}

		let mut inbounds = self.inbounds.lock().expect("inbounds lock");
		for inbound in built {
			inbounds.insert(inbound.name(), inbound);
		}
		Ok(())
	}

	pub fn delete_inbounds(&self, names: &[Strng]) {
		let mut inbounds = self.inbounds.lock().expect("inbounds lock");
		for name in names {
			if let Some(inbound) = inbounds.remove(name) {
				inbound.close();
			}
		}
	}

	pub fn snapshot(&self) -> Vec<serde_json::Value> {
		let inbounds = self.inbounds.lock().expect("inbounds lock");
		let mut names: Vec<_> = inbounds.keys().cloned().collect();
		names.sort();
		names
			.iter()
			.map(|name| {
				let inbound = &inbounds[name];
				serde_json::json!({
					"name": inbound.name().as_str(),
					"type": inbound.kind().to_string(),
					"address": inbound.local_address().to_string(),
				})
			})
			.collect()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.inbounds.lock().expect("inbounds lock").contains_key(name)
	}

	pub fn close_all(&self) {
		let mut inbounds = self.inbounds.lock().expect("inbounds lock");
		for (_, inbound) in inbounds.drain() {
			inbound.close();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::resolve::{NoProcessLookup, testing::StaticResolver};
	use crate::tunnel::TunnelOptions;

	fn manager() -> Arc<InboundManager> {
		let tunnel = Tunnel::new(
			StaticResolver::of(&[]),
			Arc::new(NoProcessLookup),
			TunnelOptions::default(),
		);
		InboundManager::new(tunnel)
	}

	fn socks_option(name: &str) -> InboundOption {
		InboundOption::Socks(socks::SocksInboundOption {
			name: name.to_string(),
			listen: "127.0.0.1".to_string(),
			port: 0,
			users: Vec::new(),
		})
	}

	#[tokio::test]
	async fn add_and_delete_inbounds() {
		let manager = manager();
		manager
			.add_inbounds(vec![socks_option("s1"), socks_option("s2")])
			.await
			.unwrap();
		assert!(manager.contains("s1"));
		assert_eq!(manager.snapshot().len(), 2);

		manager.delete_inbounds(&[strng::new("s1")]);
		assert!(!manager.contains("s1"));
		assert!(manager.contains("s2"));
	}

	#[tokio::test]
	async fn duplicate_names_abort_the_batch() {
		let manager = manager();
		manager.add_inbounds(vec![socks_option("dup")]).await.unwrap();
		let err = manager
			.add_inbounds(vec![socks_option("fresh"), socks_option("dup")])
			.await
			.unwrap_err();
		assert!(matches!(err, ProxyError::DuplicateName(_)));
		// The valid batch-mate must not have landed either.
		assert!(!manager.contains("fresh"));
	}
}
