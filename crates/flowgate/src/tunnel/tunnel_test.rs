use std::sync::atomic::Ordering;

use super::*;
use crate::outbound::testing::FakeOutbound;
use crate::resolve::testing::StaticResolver;
use crate::resolve::NoProcessLookup;
use crate::rules::{MatchAll, parse_rule};
use crate::transport::pool::BufferPool;
use crate::types::InboundKind;

fn tunnel() -> Arc<Tunnel> {
	let resolver = StaticResolver::of(&[("www.example.com", "93.184.216.34")]);
	Tunnel::new(resolver, Arc::new(NoProcessLookup), TunnelOptions::default())
}

fn geoip() -> Arc<dyn crate::resolve::GeoIpLookup> {
	Arc::new(crate::resolve::NoGeoIp)
}

fn rule(parts: (&str, &str, &str)) -> Arc<dyn Rule> {
	Arc::from(parse_rule(parts.0, parts.1, parts.2, &[], &geoip()).unwrap())
}

fn tcp_meta(host: &str) -> Metadata {
	let mut m = Metadata::new(InboundKind::Socks5, Network::Tcp);
	m.host = strng::new(host);
	m.dst_port = 443;
	m.src_ip = "10.0.0.5".parse().unwrap();
	m.src_port = 30000;
	m
}

fn udp_meta(dst: &str) -> Metadata {
	let dst: SocketAddr = dst.parse().unwrap();
	let mut m = Metadata::new(InboundKind::Socks5, Network::Udp);
	m.dst_ip = Some(dst.ip());
	m.dst_port = dst.port();
	m.src_ip = "10.0.0.5".parse().unwrap();
	m.src_port = 30000;
	m
}

struct FakeWriter {
	source: SocketAddr,
}

#[async_trait]
impl PacketWriter for FakeWriter {
	async fn write_back(&self, buf: &[u8], _from: SocketAddr) -> std::io::Result<usize> {
		Ok(buf.len())
	}

	fn local_addr(&self) -> SocketAddr {
		self.source
	}
}

fn packet(pool: &Arc<BufferPool>, payload: &[u8], source: &str, meta: Metadata) -> PacketAdapter {
	let mut buffer = pool.get_pooled();
	buffer.buf_mut().extend_from_slice(payload);
	PacketAdapter::new(
		buffer,
		0,
		Arc::new(FakeWriter {
			source: source.parse().unwrap(),
		}),
		meta,
	)
}

#[tokio::test]
async fn first_matching_rule_wins_and_later_rules_do_not_shadow() {
	let t = tunnel();
	t.add_outbounds(vec![FakeOutbound::proxy("A"), FakeOutbound::proxy("B")])
		.unwrap();
	t.update_rules(vec![
		rule(("DOMAIN-SUFFIX", "example.com", "A")),
		rule(("MATCH", "", "B")),
	]);

	let (proxy, matched) = t.resolve_outbound(&mut tcp_meta("www.example.com")).await;
	assert_eq!(proxy.name(), "A");
	assert_eq!(matched.unwrap().adapter(), strng::new("A"));

	// Appending another rule that would also match must not change the
	// decision for flows already claimed by an earlier rule.
	t.update_rules(vec![
		rule(("DOMAIN-SUFFIX", "example.com", "A")),
		rule(("MATCH", "", "B")),
		rule(("DOMAIN-KEYWORD", "example", "B")),
	]);
	let (proxy, _) = t.resolve_outbound(&mut tcp_meta("www.example.com")).await;
	assert_eq!(proxy.name(), "A");
}

#[tokio::test]
async fn no_match_falls_back_to_default_proxy() {
	let t = tunnel();
	t.update_rules(vec![rule(("DOMAIN", "only.this.host", "DIRECT"))]);
	let (proxy, matched) = t.resolve_outbound(&mut tcp_meta("other.net")).await;
	assert!(matched.is_none());
	assert_eq!(proxy.name(), REJECT);
}

#[tokio::test]
async fn udp_unsupported_adapter_falls_through() {
	let t = tunnel();
	let tcp_only = FakeOutbound::tcp_only("NOUDP");
	t.add_outbounds(vec![
		crate::outbound::Proxy::new(tcp_only),
		FakeOutbound::proxy("U"),
	])
	.unwrap();
	// Both rules match; the first selects an adapter with no UDP support,
	// so the walk continues instead of giving up.
	t.update_rules(vec![
		rule(("DOMAIN-SUFFIX", "example.com", "NOUDP")),
		rule(("DOMAIN-KEYWORD", "example", "U")),
	]);

	let mut m = udp_meta("1.1.1.1:53");
	m.host = strng::new("www.example.com");
	let (proxy, _) = t.resolve_outbound(&mut m).await;
	assert_eq!(proxy.name(), "U");

	// The same flow over TCP takes the first rule.
	let (proxy, _) = t.resolve_outbound(&mut tcp_meta("www.example.com")).await;
	assert_eq!(proxy.name(), "NOUDP");
}

#[tokio::test]
async fn direct_and_global_modes_bypass_rules() {
	let t = tunnel();
	t.update_rules(vec![rule(("MATCH", "", "REJECT"))]);
	t.set_mode(TunnelMode::Direct);
	let (proxy, matched) = t.resolve_outbound(&mut tcp_meta("www.example.com")).await;
	assert_eq!(proxy.name(), DIRECT);
	assert!(matched.is_none());

	t.set_mode(TunnelMode::Global);
	let (proxy, _) = t.resolve_outbound(&mut tcp_meta("www.example.com")).await;
	assert_eq!(proxy.name(), GLOBAL);
}

#[tokio::test]
async fn add_outbounds_is_transactional() {
	let t = tunnel();
	let before: Vec<_> = {
		let mut names: Vec<_> = t.proxies().keys().cloned().collect();
		names.sort();
		names
	};

	let err = t
		.add_outbounds(vec![FakeOutbound::proxy("X"), FakeOutbound::proxy("DIRECT")])
		.unwrap_err();
	assert!(matches!(err, ProxyError::DuplicateName(_)));

	let mut after: Vec<_> = t.proxies().keys().cloned().collect();
	after.sort();
	// Neither the duplicate nor its batch-mate landed.
	assert_eq!(before, after);
	assert!(!after.contains(&strng::new("X")));
}

#[tokio::test]
async fn global_tracks_outbound_mutations() {
	let t = tunnel();
	t.add_outbounds(vec![FakeOutbound::proxy("X"), FakeOutbound::proxy("Y")])
		.unwrap();

	let global = t.proxy_json("GLOBAL").unwrap();
	let members: Vec<String> = global["all"]
		.as_array()
		.unwrap()
		.iter()
		.map(|v| v.as_str().unwrap().to_string())
		.collect();
	assert_eq!(members, vec!["DIRECT", "REJECT", "X", "Y"]);

	t.delete_outbounds(&[strng::new("X")]);
	let global = t.proxy_json("GLOBAL").unwrap();
	let members: Vec<String> = global["all"]
		.as_array()
		.unwrap()
		.iter()
		.map(|v| v.as_str().unwrap().to_string())
		.collect();
	assert_eq!(members, vec!["DIRECT", "REJECT", "Y"]);
}

#[tokio::test]
async fn reserved_outbounds_survive_deletion() {
	let t = tunnel();
	t.delete_outbounds(&[DIRECT, REJECT]);
	let proxies = t.proxies();
	assert!(proxies.contains_key(&DIRECT));
	assert!(proxies.contains_key(&REJECT));
}

#[tokio::test]
async fn group_batch_rejects_unknown_members() {
	let t = tunnel();
	let option = GroupCommonOption {
		name: "G".to_string(),
		group_type: "select".to_string(),
		proxies: vec!["NOPE".to_string()],
		use_providers: vec![],
		url: None,
		interval: 0,
		lazy: true,
		tolerance: 0,
		strategy: None,
		block_time: None,
	};
	assert!(t.add_outbound_groups(&[option]).is_err());
	assert!(!t.proxies().contains_key(&strng::new("G")));
}

#[tokio::test]
async fn nat_single_flight_resolves_once_per_source() {
	let t = tunnel();
	let slow = FakeOutbound::udp("U", Duration::from_millis(50));
	t.add_outbounds(vec![crate::outbound::Proxy::new(slow.clone())])
		.unwrap();
	t.update_rules(vec![Arc::new(MatchAll::new(strng::new("U")))]);

	let pool = BufferPool::udp();
	// A burst from one source, all arriving before the resolver finishes.
	for i in 0..5u8 {
		let p = packet(&pool, &[i], "10.0.0.5:30000", udp_meta("1.1.1.1:53"));
		t.handle_udp(p).await;
	}
	tokio::time::sleep(Duration::from_millis(200)).await;

	assert_eq!(slow.listens.load(Ordering::SeqCst), 1);
	assert_eq!(t.nat_sessions(), 1);
	// Every packet of the burst reached the one session.
	assert_eq!(slow.sent.lock().unwrap().len(), 5);

	// A second source resolves its own session.
	let p = packet(&pool, b"x", "10.0.0.6:40000", udp_meta("1.1.1.1:53"));
	t.handle_udp(p).await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(slow.listens.load(Ordering::SeqCst), 2);
	assert_eq!(t.nat_sessions(), 2);
}

#[tokio::test(start_paused = true)]
async fn nat_session_evicts_after_idle_timeout() {
	let t = tunnel();
	let fake = FakeOutbound::udp("U", Duration::from_millis(0));
	t.add_outbounds(vec![crate::outbound::Proxy::new(fake.clone())])
		.unwrap();
	t.update_rules(vec![Arc::new(MatchAll::new(strng::new("U")))]);

	let pool = BufferPool::udp();
	let p = packet(&pool, b"q", "10.0.0.5:30000", udp_meta("1.1.1.1:53"));
	t.handle_udp(p).await;
	tokio::time::sleep(Duration::from_millis(10)).await;
	assert_eq!(t.nat_sessions(), 1);

	tokio::time::sleep(UDP_SESSION_TIMEOUT + Duration::from_secs(1)).await;
	assert_eq!(t.nat_sessions(), 0);
}

#[tokio::test]
async fn udp_queue_overflow_drops_and_returns_buffer() {
	// The tunnel is never run, so the queue fills and stays full.
	let t = tunnel();
	let pool = BufferPool::udp();

	for _ in 0..QUEUE_DEPTH {
		let p = packet(&pool, b"fill", "10.0.0.5:30000", udp_meta("1.1.1.1:53"));
		t.submit_udp(p);
	}
	assert_eq!(pool.free_len(), 0);

	// One past capacity: dropped, and its buffer comes straight back.
	let p = packet(&pool, b"overflow", "10.0.0.5:30000", udp_meta("1.1.1.1:53"));
	t.submit_udp(p);
	assert_eq!(pool.free_len(), 1);
}
