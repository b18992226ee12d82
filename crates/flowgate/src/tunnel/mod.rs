pub mod nat;
pub mod statistic;

#[cfg(test)]
#[path = "tunnel_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use flowgate_core::copy::copy_bidirectional;
use flowgate_core::prelude::*;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::ProxyError;
use crate::group::selector::Selector;
use crate::group::{GroupBase, GroupCommonOption, parse_proxy_group};
use crate::outbound::Proxy;
use crate::provider::healthcheck::HealthCheck;
use crate::provider::{CompatibleProvider, ProxyProvider};
use crate::resolve::{ProcessLookup, Resolver};
use crate::rules::Rule;
use crate::transport::pool::{PooledBuffer, UDP_BUFFER_SIZE};
use crate::transport::BoxedStream;
use crate::tunnel::nat::{NatTable, UdpSession};
use crate::tunnel::statistic::{Manager, TcpTracker, UdpTracker};
use crate::types::{DnsMode, Metadata, Network};
use crate::{
	DEFAULT_TCP_TIMEOUT, DEFAULT_UDP_TIMEOUT, DIRECT, GLOBAL, REJECT, UDP_SESSION_TIMEOUT,
};

/// Fan-in queue depth for both the TCP and UDP paths. TCP producers block
/// on a full queue (backpressure on accepts); UDP producers drop instead.
const QUEUE_DEPTH: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
	Direct,
	Global,
	#[default]
	Rule,
}

impl Display for TunnelMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TunnelMode::Direct => f.write_str("direct"),
			TunnelMode::Global => f.write_str("global"),
			TunnelMode::Rule => f.write_str("rule"),
		}
	}
}

/// A client-side byte stream plus its flow descriptor, as produced by an
/// inbound listener.
pub struct ConnContext {
	pub stream: BoxedStream,
	pub metadata: Metadata,
}

/// Write-back channel to a UDP client. Outlives individual packets: the
/// NAT reader task holds one for the whole session.
#[async_trait]
pub trait PacketWriter: Send + Sync {
	async fn write_back(&self, buf: &[u8], from: SocketAddr) -> std::io::Result<usize>;

	/// The client's source address, which keys the NAT session.
	fn local_addr(&self) -> SocketAddr;
}

/// One inbound datagram: a pooled buffer (returned to its pool when the
/// adapter drops), the payload's offset into it, the write-back channel,
/// and flow metadata.
pub struct PacketAdapter {
	buffer: PooledBuffer,
	offset: usize,
	writer: Arc<dyn PacketWriter>,
	pub metadata: Metadata,
}

impl PacketAdapter {
	pub fn new(
		buffer: PooledBuffer,
		offset: usize,
		writer: Arc<dyn PacketWriter>,
		metadata: Metadata,
	) -> PacketAdapter {
		PacketAdapter {
			buffer,
			offset,
			writer,
			metadata,
		}
	}

	pub fn data(&self) -> &[u8] {
		&self.buffer[self.offset..]
	}

	pub fn writer(&self) -> Arc<dyn PacketWriter> {
		self.writer.clone()
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.writer.local_addr()
	}
}

struct State {
	proxies: HashMap<Strng, Arc<Proxy>>,
	providers: HashMap<Strng, Arc<dyn ProxyProvider>>,
	rules: Vec<Arc<dyn Rule>>,
	mode: TunnelMode,
	default_proxy: Strng,
}

/// The tunnel runtime: fan-in queues, the rule matcher, the UDP NAT table,
/// and the guarded mutable outbound/rule state.
pub struct Tunnel {
	tcp_tx: mpsc::Sender<ConnContext>,
	udp_tx: mpsc::Sender<PacketAdapter>,
	tcp_rx: Mutex<Option<mpsc::Receiver<ConnContext>>>,
	udp_rx: Mutex<Option<mpsc::Receiver<PacketAdapter>>>,
	nat: NatTable,
	state: RwLock<State>,
	pub manager: Arc<Manager>,
	resolver: Arc<dyn Resolver>,
	process: Arc<dyn ProcessLookup>,
	local_dns: bool,
	local_dns_retry: bool,
}

pub struct TunnelOptions {
	pub mode: TunnelMode,
	pub default_proxy: Strng,
	pub local_dns: bool,
	pub local_dns_retry: bool,
}

impl Default for TunnelOptions {
	fn default() -> Self {
		TunnelOptions {
			mode: TunnelMode::Rule,
			default_proxy: REJECT,
			local_dns: false,
			local_dns_retry: false,
		}
	}
}

impl Tunnel {
	pub fn new(
		resolver: Arc<dyn Resolver>,
		process: Arc<dyn ProcessLookup>,
		options: TunnelOptions,
	) -> Arc<Tunnel> {
		let (tcp_tx, tcp_rx) = mpsc::channel(QUEUE_DEPTH);
		let (udp_tx, udp_rx) = mpsc::channel(QUEUE_DEPTH);

		let mut proxies = HashMap::new();
		proxies.insert(
			DIRECT,
			Proxy::new(crate::outbound::direct::Direct::new(DIRECT, resolver.clone())),
		);
		proxies.insert(REJECT, Proxy::new(crate::outbound::reject::Reject::new(REJECT)));
		Self::rebuild_global(&mut proxies);

		Arc::new(Tunnel {
			tcp_tx,
			udp_tx,
			tcp_rx: Mutex::new(Some(tcp_rx)),
			udp_rx: Mutex::new(Some(udp_rx)),
			nat: NatTable::new(),
			state: RwLock::new(State {
				proxies,
				providers: HashMap::new(),
				rules: Vec::new(),
				mode: options.mode,
				default_proxy: options.default_proxy,
			}),
			manager: Manager::new(),
			resolver,
			process,
			local_dns: options.local_dns,
			local_dns_retry: options.local_dns_retry,
		})
	}

	/// Starts the dispatcher: one task per accepted TCP connection, and a
	/// fixed pool of UDP workers draining the packet queue.
	pub fn run(self: &Arc<Self>) {
		let udp_workers = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1)
			.max(4);

		let udp_rx = self
			.udp_rx
			.lock()
			.expect("udp rx lock")
			.take()
			.expect("tunnel already running");
		let udp_rx = Arc::new(AsyncMutex::new(udp_rx));
		for _ in 0..udp_workers {
			let tunnel = self.clone();
			let udp_rx = udp_rx.clone();
			tokio::spawn(async move {
				loop {
					let packet = { udp_rx.lock().await.recv().await };
					match packet {
						Some(packet) => tunnel.handle_udp(packet).await,
						None => return,
					}
				}
			});
		}

		let mut tcp_rx = self
			.tcp_rx
			.lock()
			.expect("tcp rx lock")
			.take()
			.expect("tunnel already running");
		let tunnel = self.clone();
		tokio::spawn(async move {
			while let Some(ctx) = tcp_rx.recv().await {
				let tunnel = tunnel.clone();
				tokio::spawn(async move { tunnel.handle_tcp(ctx).await });
			}
		});
	}

	/// Blocking submission; a saturated queue backpressures the listener.
	pub async fn submit_tcp(&self, ctx: ConnContext) {
		let _ = self.tcp_tx.send(ctx).await;
	}

	/// Non-blocking submission; overflow drops the packet (its buffer
	/// returns to the pool via the adapter's drop).
	pub fn submit_udp(&self, packet: PacketAdapter) {
		if let Err(e) = self.udp_tx.try_send(packet) {
			debug!("udp queue full, dropping packet from {}", e.into_inner().local_addr());
		}
	}

	// --- metadata pipeline ---------------------------------------------

	fn pre_handle_metadata(&self, metadata: &mut Metadata) -> Result<(), ProxyError> {
		// A literal IP in the host slot is really a destination address.
		if let Ok(ip) = metadata.host.parse::<IpAddr>() {
			metadata.dst_ip = Some(ip);
			metadata.host = strng::EMPTY;
		}

		if self.resolver.mapping_enabled()
			&& metadata.host.is_empty()
			&& let Some(ip) = metadata.dst_ip
		{
			if let Some(host) = self.resolver.find_host_by_ip(ip) {
				metadata.host = host;
				metadata.dns_mode = DnsMode::Mapping;
				if self.resolver.fake_ip_enabled() {
					metadata.dst_ip = None;
					metadata.dns_mode = DnsMode::FakeIp;
				} else if let Some(real) = self.resolver.search_hosts(&metadata.host) {
					metadata.dst_ip = Some(real);
				}
			} else if self.resolver.is_fake_ip(ip) {
				debug!(%ip, "fake dns record missing");
				return Err(ProxyError::AddressUnsupported);
			}
		}
		Ok(())
	}

	async fn resolve_outbound(
		&self,
		metadata: &mut Metadata,
	) -> (Arc<Proxy>, Option<Arc<dyn Rule>>) {
		// Snapshot under the read lock so one classification sees one
		// consistent state, then walk without holding it across awaits.
		let (mode, rules, proxies, default_proxy) = {
			let state = self.state.read().expect("state lock");
			(
				state.mode,
				state.rules.clone(),
				state.proxies.clone(),
				state.default_proxy.clone(),
			)
		};

		match mode {
			TunnelMode::Direct => (
				proxies.get(&DIRECT).expect("DIRECT is reserved").clone(),
				None,
			),
			TunnelMode::Global => (
				proxies.get(&GLOBAL).expect("GLOBAL is derived").clone(),
				None,
			),
			TunnelMode::Rule => {
				self
					.match_rules(metadata, &rules, &proxies, &default_proxy)
					.await
			},
		}
	}

	async fn match_rules(
		&self,
		metadata: &mut Metadata,
		rules: &[Arc<dyn Rule>],
		proxies: &HashMap<Strng, Arc<Proxy>>,
		default_proxy: &Strng,
	) -> (Arc<Proxy>, Option<Arc<dyn Rule>>) {
		let mut resolved = metadata.resolved();
		let mut process_found = false;

		if !metadata.host.is_empty()
			&& let Some(ip) = self.resolver.search_hosts(&metadata.host)
		{
			metadata.dst_ip = Some(ip);
			resolved = true;
		}

		for rule in rules {
			if !resolved
				&& rule.should_resolve_ip()
				&& !metadata.host.is_empty()
				&& metadata.dst_ip.is_none()
			{
				match self.resolver.resolve(&metadata.host).await {
					Ok(ip) => {
						debug!(host = %metadata.host, %ip, "resolved for rule match");
						metadata.dst_ip = Some(ip);
					},
					Err(e) => debug!(host = %metadata.host, err = %e, "resolve failed"),
				}
				resolved = true;
			}

			if !process_found && rule.should_find_process() {
				process_found = true;
				match self.process.find(metadata.network, metadata.source_addr()) {
					Ok(path) => {
						debug!(%metadata, process = %path, "found process");
						metadata.process_path = Some(path);
					},
					Err(e) => debug!(%metadata, err = %e, "find process failed"),
				}
			}

			if rule.matches(metadata) {
				let Some(adapter) = proxies.get(&rule.adapter()) else {
					continue;
				};
				// A matched adapter that cannot carry UDP does not end the
				// search; a later rule may still route this flow.
				if metadata.network == Network::Udp && !adapter.supports_udp() {
					debug!(adapter = %adapter.name(), "udp not supported, continuing");
					continue;
				}
				return (adapter.clone(), Some(rule.clone()));
			}
		}

		let fallback = proxies
			.get(default_proxy)
			.or_else(|| proxies.get(&REJECT))
			.expect("REJECT is reserved")
			.clone();
		(fallback, None)
	}

	fn apply_local_dns(metadata: &mut Metadata, ip: IpAddr) {
		metadata.dst_ip = Some(ip);
		metadata.host = strng::new(ip.to_string());
	}

	// --- TCP path ------------------------------------------------------

	async fn handle_tcp(self: Arc<Self>, ctx: ConnContext) {
		let ConnContext {
			stream: local,
			mut metadata,
		} = ctx;
		if !metadata.valid() {
			warn!(?metadata, "metadata not valid");
			return;
		}
		if let Err(e) = self.pre_handle_metadata(&mut metadata) {
			debug!(err = %e, "metadata prehandle failed");
			return;
		}

		let (proxy, rule) = self.resolve_outbound(&mut metadata).await;

		let mut dial_meta = metadata.pure();
		if self.local_dns
			&& !dial_meta.resolved()
			&& !dial_meta.host.is_empty()
			&& let Ok(ip) = self.resolver.resolve(&dial_meta.host).await
		{
			Self::apply_local_dns(&mut dial_meta, ip);
		}

		let dialed = match tokio::time::timeout(DEFAULT_TCP_TIMEOUT, proxy.connect(&dial_meta)).await
		{
			Ok(Ok(remote)) => Ok(remote),
			Ok(Err(e)) => Err(e),
			Err(_) => Err(ProxyError::Timeout),
		};

		let remote = match dialed {
			Ok(remote) => remote,
			Err(e) => {
				// One more try with a locally resolved address, when enabled.
				let retried = if self.local_dns_retry && !metadata.host.is_empty() {
					match self.resolver.resolve(&metadata.host).await {
						Ok(ip) => {
							let mut retry_meta = metadata.pure();
							Self::apply_local_dns(&mut retry_meta, ip);
							tokio::time::timeout(DEFAULT_TCP_TIMEOUT, proxy.connect(&retry_meta))
								.await
								.ok()
								.and_then(|r| r.ok())
						},
						Err(_) => None,
					}
				} else {
					None
				};
				match retried {
					Some(remote) => remote,
					None => {
						match &rule {
							Some(rule) => warn!(
								proxy = %proxy.name(),
								"[TCP] dial (match {}/{}) {} --> {} error: {e}",
								rule.rule_type(), rule.payload(),
								metadata.source_addr(), metadata.remote_addr(),
							),
							None => warn!(
								proxy = %proxy.name(),
								"[TCP] dial {} --> {} error: {e}",
								metadata.source_addr(), metadata.remote_addr(),
							),
						}
						return;
					},
				}
			},
		};

		self.log_route(&metadata, rule.as_deref(), &proxy, "TCP");

		let rule_info = rule
			.as_ref()
			.map(|r| (strng::format!("{}", r.rule_type()), r.payload()));
		let tracker = TcpTracker::new(
			remote,
			self.manager.clone(),
			metadata.clone(),
			rule_info,
			proxy.name(),
		);

		if let Err(e) = copy_bidirectional(local, tracker).await {
			debug!(err = %e, "relay ended with error");
		}
	}

	fn log_route(&self, metadata: &Metadata, rule: Option<&dyn Rule>, proxy: &Arc<Proxy>, net: &str) {
		let mode = self.mode();
		match rule {
			Some(rule) => info!(
				"[{net}] {} --> {} match {}({}) using {}",
				metadata.source_addr(),
				metadata.remote_addr(),
				rule.rule_type(),
				rule.payload(),
				proxy.name(),
			),
			None if mode == TunnelMode::Global => info!(
				"[{net}] {} --> {} using GLOBAL",
				metadata.source_addr(),
				metadata.remote_addr()
			),
			None if mode == TunnelMode::Direct => info!(
				"[{net}] {} --> {} using DIRECT",
				metadata.source_addr(),
				metadata.remote_addr()
			),
			None => info!(
				"[{net}] {} --> {} doesn't match any rule using {}",
				metadata.source_addr(),
				metadata.remote_addr(),
				proxy.name(),
			),
		}
	}

	// --- UDP path ------------------------------------------------------

	async fn handle_udp(self: &Arc<Self>, packet: PacketAdapter) {
		let mut metadata = packet.metadata.clone();
		if !metadata.valid() {
			warn!(?metadata, "metadata not valid");
			return;
		}

		// Remember the fake destination so replies can be stamped with the
		// address the client actually sent to.
		let fake_addr = metadata.dst_ip.filter(|ip| self.resolver.is_fake_ip(*ip));

		if let Err(e) = self.pre_handle_metadata(&mut metadata) {
			debug!(err = %e, "metadata prehandle failed");
			return;
		}

		if !metadata.resolved() {
			match self.resolver.resolve(&metadata.host).await {
				Ok(ip) => metadata.dst_ip = Some(ip),
				Err(_) => return,
			}
		}
		let Some(dst) = metadata.udp_addr() else {
			return;
		};

		let key = strng::new(packet.local_addr().to_string());

		if let Some(session) = self.nat.get(&key) {
			session.touch();
			if let Err(e) = session.datagram.send_to(packet.data(), dst).await {
				debug!(err = %e, "udp forward failed");
			}
			return;
		}

		// First packet of a burst: resolve off the worker so the queue
		// keeps draining while we dial.
		let tunnel = self.clone();
		tokio::spawn(async move {
			tunnel
				.establish_udp_session(key, packet, metadata, dst, fake_addr)
				.await;
		});
	}

	async fn establish_udp_session(
		self: Arc<Self>,
		key: Strng,
		packet: PacketAdapter,
		mut metadata: Metadata,
		dst: SocketAddr,
		fake_addr: Option<IpAddr>,
	) {
		let (lock, _existed) = self.nat.get_or_create_lock(&key);
		let _guard = lock.lock().await;

		// Someone else may have installed the session while we waited.
		if let Some(session) = self.nat.get(&key) {
			session.touch();
			if let Err(e) = session.datagram.send_to(packet.data(), dst).await {
				debug!(err = %e, "udp forward failed");
			}
			return;
		}

		let (proxy, rule) = self.resolve_outbound(&mut metadata).await;

		let listened =
			tokio::time::timeout(DEFAULT_UDP_TIMEOUT, proxy.listen_packet(&metadata.pure())).await;
		let datagram = match listened {
			Ok(Ok(datagram)) => datagram,
			Ok(Err(e)) => {
				warn!(
					proxy = %proxy.name(),
					"[UDP] dial {} --> {} error: {e}",
					metadata.source_addr(), metadata.remote_addr(),
				);
				self.nat.remove_lock(&key);
				return;
			},
			Err(_) => {
				warn!(
					proxy = %proxy.name(),
					"[UDP] dial {} --> {} timed out",
					metadata.source_addr(), metadata.remote_addr(),
				);
				self.nat.remove_lock(&key);
				return;
			},
		};

		let rule_info = rule
			.as_ref()
			.map(|r| (strng::format!("{}", r.rule_type()), r.payload()));
		let tracked = UdpTracker::new(
			datagram,
			self.manager.clone(),
			metadata.clone(),
			rule_info,
			proxy.name(),
		);
		let session = UdpSession::new(tracked);

		self.log_route(&metadata, rule.as_deref(), &proxy, "UDP");

		// Remote-to-local pump for the whole session.
		let tunnel = self.clone();
		let writer = packet.writer();
		let resolved_ip = metadata.dst_ip;
		let reader_key = key.clone();
		let reader_session = session.clone();
		tokio::spawn(async move {
			tunnel
				.relay_udp_to_local(writer, reader_session, reader_key, fake_addr, resolved_ip)
				.await;
		});

		self.nat.insert(key.clone(), session.clone());
		self.nat.remove_lock(&key);

		session.touch();
		if let Err(e) = session.datagram.send_to(packet.data(), dst).await {
			debug!(err = %e, "udp forward failed");
		}
	}

	async fn relay_udp_to_local(
		self: Arc<Self>,
		writer: Arc<dyn PacketWriter>,
		session: Arc<UdpSession>,
		key: Strng,
		fake_addr: Option<IpAddr>,
		resolved_ip: Option<IpAddr>,
	) {
		let mut buf = vec![0u8; UDP_BUFFER_SIZE];
		loop {
			let remaining = UDP_SESSION_TIMEOUT.saturating_sub(session.idle());
			if remaining.is_zero() {
				break;
			}
			match tokio::time::timeout(remaining, session.datagram.recv_from(&mut buf)).await {
				// Idle check runs again at the top; sends refresh it.
				Err(_) => continue,
				Ok(Err(e)) => {
					debug!(err = %e, "udp session read ended");
					break;
				},
				Ok(Ok((n, from))) => {
					session.touch();
					let mut src = from;
					if let (Some(fake), Some(real)) = (fake_addr, resolved_ip)
						&& from.ip() == real
					{
						src = SocketAddr::new(fake, from.port());
					}
					if writer.write_back(&buf[..n], src).await.is_err() {
						break;
					}
				},
			}
		}
		self.nat.remove(&key);
		session.datagram.close();
	}

	// --- guarded state -------------------------------------------------

	pub fn mode(&self) -> TunnelMode {
		self.state.read().expect("state lock").mode
	}

	pub fn set_mode(&self, mode: TunnelMode) {
		self.state.write().expect("state lock").mode = mode;
	}

	pub fn proxies(&self) -> HashMap<Strng, Arc<Proxy>> {
		self.state.read().expect("state lock").proxies.clone()
	}

	pub fn providers(&self) -> HashMap<Strng, Arc<dyn ProxyProvider>> {
		self.state.read().expect("state lock").providers.clone()
	}

	pub fn set_providers(&self, providers: HashMap<Strng, Arc<dyn ProxyProvider>>) {
		self.state.write().expect("state lock").providers = providers;
	}

	pub fn rules_json(&self) -> Vec<serde_json::Value> {
		let state = self.state.read().expect("state lock");
		state
			.rules
			.iter()
			.map(|r| {
				serde_json::json!({
					"type": r.rule_type().to_string(),
					"payload": r.payload().as_str(),
					"proxy": r.adapter().as_str(),
				})
			})
			.collect()
	}

	pub fn proxies_json(&self) -> serde_json::Value {
		let proxies = self.proxies();
		let mut map = serde_json::Map::new();
		for name in proxies.keys().sorted() {
			map.insert(name.to_string(), proxies[name].describe());
		}
		serde_json::Value::Object(map)
	}

	pub fn proxy_json(&self, name: &str) -> Option<serde_json::Value> {
		self
			.state
			.read()
			.expect("state lock")
			.proxies
			.get(name)
			.map(|p| p.describe())
	}

	/// Adds outbounds as one transaction: either every entry is valid and
	/// all become visible together, or none do.
	pub fn add_outbounds(&self, proxies: Vec<Arc<Proxy>>) -> Result<(), ProxyError> {
		let mut state = self.state.write().expect("state lock");
		let mut staged: HashMap<Strng, Arc<Proxy>> = HashMap::new();
		for proxy in proxies {
			let name = proxy.name();
			if name.is_empty() {
				return Err(ProxyError::InvalidConfig("proxy name required".to_string()));
			}
			if state.proxies.contains_key(&name) || staged.contains_key(&name) {
				return Err(ProxyError::DuplicateName(name));
			}
			staged.insert(name, proxy);
		}
		state.proxies.extend(staged);
		Self::rebuild_global(&mut state.proxies);
		Ok(())
	}

	/// Deletes outbounds by name. The reserved DIRECT and REJECT entries
	/// are skipped with an error log; group references are not chased, a
	/// dangling member surfaces at dial time.
	pub fn delete_outbounds(&self, names: &[Strng]) {
		let mut state = self.state.write().expect("state lock");
		for name in names {
			if *name == DIRECT || *name == REJECT {
				error!(%name, "reserved outbound cannot be deleted");
				continue;
			}
			state.proxies.remove(name);
		}
		Self::rebuild_global(&mut state.proxies);
	}

	/// Adds groups transactionally. Members must already exist; groups in
	/// one batch cannot reference each other.
	pub fn add_outbound_groups(&self, options: &[GroupCommonOption]) -> Result<(), ProxyError> {
		let mut state = self.state.write().expect("state lock");
		let mut staged: HashMap<Strng, Arc<Proxy>> = HashMap::new();
		for option in options {
			let name = strng::new(&option.name);
			if name.is_empty() {
				return Err(ProxyError::InvalidConfig("group name required".to_string()));
			}
			if state.proxies.contains_key(&name) || staged.contains_key(&name) {
				return Err(ProxyError::DuplicateName(name));
			}
			let group = parse_proxy_group(option, &state.proxies, &state.providers)?;
			staged.insert(name, group);
		}
		state.proxies.extend(staged);
		Self::rebuild_global(&mut state.proxies);
		Ok(())
	}

	pub fn update_rules(&self, rules: Vec<Arc<dyn Rule>>) {
		self.state.write().expect("state lock").rules = rules;
	}

	/// GLOBAL is a selector over every other outbound, rebuilt after any
	/// outbound mutation.
	fn rebuild_global(proxies: &mut HashMap<Strng, Arc<Proxy>>) {
		let members: Vec<Arc<Proxy>> = proxies
			.keys()
			.filter(|n| **n != GLOBAL)
			.sorted()
			.map(|n| proxies[n].clone())
			.collect();

		let health_check = HealthCheck::new(Vec::new(), strng::EMPTY, 0, true);
		let provider: Arc<dyn ProxyProvider> = CompatibleProvider::new(GLOBAL, members, health_check)
			.expect("DIRECT and REJECT always populate GLOBAL");
		let selector = Selector::new(GroupBase::new(GLOBAL, vec![provider]));
		proxies.insert(GLOBAL, Proxy::new(selector));
	}

	pub fn nat_sessions(&self) -> usize {
		self.nat.session_count()
	}
}
