use flowgate_core::prelude::*;
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::MetricType;
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::registry::Registry;

use crate::tunnel::statistic::Manager;

/// Exposes the statistics manager's live totals at scrape time, so the
/// byte counters stay single-sourced.
pub struct TrafficCollector {
	manager: Arc<Manager>,
}

impl Debug for TrafficCollector {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TrafficCollector").finish_non_exhaustive()
	}
}

impl Collector for TrafficCollector {
	fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
		let (up, down) = self.manager.now();

		let metric = encoder.encode_descriptor(
			"upload_bytes",
			"Total bytes relayed toward upstreams",
			None,
			MetricType::Counter,
		)?;
		ConstCounter::new(up).encode(metric)?;

		let metric = encoder.encode_descriptor(
			"download_bytes",
			"Total bytes relayed back to clients",
			None,
			MetricType::Counter,
		)?;
		ConstCounter::new(down).encode(metric)?;

		let metric = encoder.encode_descriptor(
			"active_connections",
			"Currently tracked connections",
			None,
			MetricType::Gauge,
		)?;
		ConstGauge::new(self.manager.connection_count() as i64).encode(metric)?;

		Ok(())
	}
}

pub fn build_registry(manager: Arc<Manager>) -> Registry {
	let mut registry = Registry::default();
	let sub = flowgate_core::metrics::sub_registry(&mut registry);
	sub.register_collector(Box::new(TrafficCollector { manager }));
	registry
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_encodes_traffic() {
		let manager = Manager::new();
		let registry = build_registry(manager);
		let mut out = String::new();
		prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
		assert!(out.contains("upload_bytes"));
		assert!(out.contains("active_connections"));
	}
}
