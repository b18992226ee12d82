pub mod healthcheck;

use std::sync::RwLock;

use async_trait::async_trait;
use flowgate_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::ProxyError;
use crate::outbound::Proxy;
use crate::provider::healthcheck::HealthCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleType {
	Compatible,
	File,
	Http,
}

/// A named source of outbound members with a health-check lifecycle.
/// Groups consume these instead of raw member lists so externally-updated
/// subscriptions and inline lists look the same.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
	fn name(&self) -> Strng;

	fn vehicle_type(&self) -> VehicleType;

	fn proxies(&self) -> Vec<Arc<Proxy>>;

	/// Marks the provider as in-use so a lazy health check keeps probing.
	fn touch(&self);

	/// First fetch for vehicles with external sources.
	async fn initial(&self) -> Result<(), ProxyError> {
		Ok(())
	}

	/// Refetches and swaps the member list.
	async fn update(&self) -> Result<(), ProxyError> {
		Ok(())
	}

	fn close(&self);
}

/// In-memory provider wrapping a fixed member list.
pub struct CompatibleProvider {
	name: Strng,
	proxies: RwLock<Vec<Arc<Proxy>>>,
	health_check: Arc<HealthCheck>,
}

impl CompatibleProvider {
	pub fn new(
		name: Strng,
		proxies: Vec<Arc<Proxy>>,
		health_check: Arc<HealthCheck>,
	) -> Result<Arc<CompatibleProvider>, ProxyError> {
		if proxies.is_empty() {
			return Err(ProxyError::InvalidConfig(format!(
				"provider {name} has no proxies"
			)));
		}
		health_check.set_proxies(proxies.clone());
		health_check.process();
		Ok(Arc::new(CompatibleProvider {
			name,
			proxies: RwLock::new(proxies),
			health_check,
		}))
	}
}

#[async_trait]
impl ProxyProvider for CompatibleProvider {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn vehicle_type(&self) -> VehicleType {
		VehicleType::Compatible
	}

	fn proxies(&self) -> Vec<Arc<Proxy>> {
		self.proxies.read().expect("proxies lock").clone()
	}

	fn touch(&self) {
		self.health_check.touch();
	}

	fn close(&self) {
		self.health_check.close();
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FetcherOption {
	pub name: String,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub interval: u64,
	#[serde(default = "default_lazy")]
	pub lazy: bool,
	#[serde(default)]
	pub health_check_url: Option<String>,
}

fn default_lazy() -> bool {
	true
}

enum Vehicle {
	File(String),
	Http(String, reqwest::Client),
}

/// Provider whose member list comes from an external document (a local
/// file or an HTTP subscription) holding a `proxies:` list.
pub struct FetcherProvider {
	name: Strng,
	vehicle: Vehicle,
	proxies: RwLock<Vec<Arc<Proxy>>>,
	health_check: Arc<HealthCheck>,
}

impl FetcherProvider {
	pub fn new(option: FetcherOption) -> Result<Arc<FetcherProvider>, ProxyError> {
		let vehicle = match (&option.path, &option.url) {
			(Some(path), None) => Vehicle::File(path.clone()),
			(None, Some(url)) => Vehicle::Http(url.clone(), reqwest::Client::new()),
			_ => {
				return Err(ProxyError::InvalidConfig(format!(
					"provider {} needs exactly one of path or url",
					option.name
				)));
			},
		};
		let health_check = HealthCheck::new(
			Vec::new(),
			option
				.health_check_url
				.as_deref()
				.map(strng::new)
				.unwrap_or(strng::EMPTY),
			option.interval,
			option.lazy,
		);
		health_check.process();
		Ok(Arc::new(FetcherProvider {
			name: strng::new(option.name),
			vehicle,
			proxies: RwLock::new(Vec::new()),
			health_check,
		}))
	}

	async fn fetch(&self) -> Result<Vec<Arc<Proxy>>, ProxyError> {
		let raw = match &self.vehicle {
			Vehicle::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
				ProxyError::InvalidConfig(format!("provider {}: read {path}: {e}", self.name))
			})?,
			Vehicle::Http(url, client) => client
				.get(url)
				.send()
				.await
				.and_then(|r| r.error_for_status())
				.map_err(|e| ProxyError::InvalidConfig(format!("provider {}: {e}", self.name)))?
				.text()
				.await
				.map_err(|e| ProxyError::InvalidConfig(format!("provider {}: {e}", self.name)))?,
		};
		crate::config::parse_provider_payload(&raw)
	}
}

#[async_trait]
impl ProxyProvider for FetcherProvider {
	fn name(&self) -> Strng {
		self.name.clone()
	}

	fn vehicle_type(&self) -> VehicleType {
		match self.vehicle {
			Vehicle::File(_) => VehicleType::File,
			Vehicle::Http(_, _) => VehicleType::Http,
		}
	}

	fn proxies(&self) -> Vec<Arc<Proxy>> {
		self.proxies.read().expect("proxies lock").clone()
	}

	fn touch(&self) {
		self.health_check.touch();
	}

	async fn initial(&self) -> Result<(), ProxyError> {
		self.update().await
	}

	async fn update(&self) -> Result<(), ProxyError> {
		let fetched = self.fetch().await?;
		info!(provider = %self.name, members = fetched.len(), "provider updated");
		self.health_check.set_proxies(fetched.clone());
		*self.proxies.write().expect("proxies lock") = fetched;
		Ok(())
	}

	fn close(&self) {
		self.health_check.close();
	}
}
