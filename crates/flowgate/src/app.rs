use std::collections::HashMap;

use flowgate_core::prelude::*;
use flowgate_core::signal;

use crate::config::{Config, parse_outbound, parse_rules, sort_groups};
use crate::inbound::InboundManager;
use crate::management::{self, AdminState};
use crate::provider::{FetcherProvider, ProxyProvider};
use crate::resolve::{GeoIpLookup, NoGeoIp, NoProcessLookup, SystemResolver};
use crate::telemetry;
use crate::telemetry::log::LogBroadcast;
use crate::tunnel::{Tunnel, TunnelOptions};

/// Wires the whole engine from a validated config and runs until a
/// shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
	let logs = LogBroadcast::new();
	telemetry::log::init(config.log_level.as_deref().unwrap_or("info"), &logs)?;

	let hosts = config
		.hosts
		.iter()
		.map(|(name, ip)| (strng::new(name), *ip))
		.collect();
	let resolver = Arc::new(SystemResolver::new(hosts).context("build resolver")?);
	let geoip: Arc<dyn GeoIpLookup> = Arc::new(NoGeoIp);

	let tunnel = Tunnel::new(
		resolver,
		Arc::new(NoProcessLookup),
		TunnelOptions {
			mode: config.mode,
			default_proxy: config
				.default_proxy
				.as_deref()
				.map(strng::new)
				.unwrap_or(crate::REJECT),
			local_dns: config.local_dns,
			local_dns_retry: config.local_dns_retry,
		},
	);
	tunnel.run();

	// Outbounds first, then providers, then groups in dependency order, so
	// every reference already resolves.
	let mut outbounds = Vec::with_capacity(config.outbounds.len());
	for option in config.outbounds {
		outbounds.push(parse_outbound(option)?);
	}
	tunnel.add_outbounds(outbounds)?;

	let mut providers: HashMap<Strng, Arc<dyn ProxyProvider>> = HashMap::new();
	for option in config.providers {
		let provider = FetcherProvider::new(option)?;
		if let Err(e) = provider.initial().await {
			warn!(provider = %provider.name(), err = %e, "initial provider fetch failed");
		}
		providers.insert(provider.name(), provider);
	}
	tunnel.set_providers(providers);

	let groups = sort_groups(&config.outbound_groups)?;
	tunnel.add_outbound_groups(&groups)?;

	let rules = parse_rules(&config.rules, &tunnel.proxies(), &geoip)?;
	tunnel.update_rules(rules);

	let inbounds = InboundManager::new(tunnel.clone());
	inbounds.add_inbounds(config.inbounds).await?;

	if let Some(api) = config.api {
		let state = Arc::new(AdminState {
			tunnel: tunnel.clone(),
			inbounds: inbounds.clone(),
			logs: logs.clone(),
			geoip: geoip.clone(),
			registry: telemetry::metrics::build_registry(tunnel.manager.clone()),
			secret: api.secret.clone(),
		});
		tokio::spawn(async move {
			if let Err(e) = management::serve(&api.listen, state).await {
				error!(err = %e, "management api exited");
			}
		});
	}

	let shutdown = signal::Shutdown::new();
	shutdown.wait().await;
	inbounds.close_all();
	info!("shutdown complete");
	Ok(())
}
