pub mod vendor_a;
pub mod vendor_b;

use std::collections::HashMap;

use async_trait::async_trait;
use ocean_core::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{PlanType, ProviderTag, RegionName};

/// An account at an upstream proxy vendor. Values returned by the vendor are
/// authoritative, including credentials the caller did not choose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub id: String,
	pub username: String,
	pub password: String,
	/// Authenticating endpoint the local forwarder chains to.
	pub host: String,
	pub port: u16,
	pub region: RegionName,
}

/// What the saga asks a vendor for. Derived from the customer's PlanRequest
/// after the catalog resolved the plan-type key.
#[derive(Debug, Clone)]
pub struct AccountRequest {
	pub plan_type: PlanType,
	pub region: RegionName,
	pub username: Option<String>,
	pub password: Option<String>,
	pub bandwidth_gb: u64,
	pub duration_days: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
	#[error("unknown provider {0}")]
	UnknownProvider(ProviderTag),
	#[error("account not found")]
	NotFound,
	#[error("vendor rejected request ({status}): {detail}")]
	Rejected { status: u16, detail: String },
	#[error("vendor unreachable: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("unexpected vendor response: {0}")]
	Decode(String),
	#[error("proxy test failed: {0}")]
	Unreachable(String),
}

/// One upstream proxy vendor. Each implementation translates the neutral
/// account contract into that vendor's REST shapes; there is no shared base.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
	fn name(&self) -> ProviderTag;

	/// Whether this vendor generates account credentials itself. When true,
	/// caller-supplied credentials are discarded and the vendor's returned
	/// values win.
	fn chooses_credentials(&self) -> bool {
		false
	}

	async fn create_account(&self, req: &AccountRequest) -> Result<Account, ProviderError>;
	async fn get_account(&self, id: &str) -> Result<Account, ProviderError>;
	async fn delete_account(&self, id: &str) -> Result<(), ProviderError>;

	/// Performs a real HTTP fetch through the account's credentials.
	async fn test_account(&self, account: &Account) -> Result<(), ProviderError>;
}

/// Providers are registered by string tag; the catalog's provider field is
/// the lookup key.
#[derive(Default)]
pub struct Registry {
	providers: HashMap<ProviderTag, Arc<dyn ProviderClient>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
		self.providers.insert(client.name(), client);
	}

	pub fn get(&self, tag: &str) -> Result<Arc<dyn ProviderClient>, ProviderError> {
		self
			.providers
			.get(tag)
			.cloned()
			.ok_or_else(|| ProviderError::UnknownProvider(strng::new(tag)))
	}

	pub fn tags(&self) -> Vec<ProviderTag> {
		self.providers.keys().cloned().collect()
	}
}

/// Fetch `probe_url` through the given authenticating HTTP proxy. Shared by
/// vendor account tests and forwarder health probes.
pub async fn proxied_fetch(
	proxy_host: &str,
	proxy_port: u16,
	username: &str,
	password: &str,
	probe_url: &str,
	timeout: Duration,
) -> Result<(), ProviderError> {
	let proxy = reqwest::Proxy::all(format!("http://{proxy_host}:{proxy_port}"))
		.map_err(|e| ProviderError::Unreachable(e.to_string()))?
		.basic_auth(username, password);
	let client = reqwest::Client::builder()
		.proxy(proxy)
		.timeout(timeout)
		.build()
		.map_err(|e| ProviderError::Unreachable(e.to_string()))?;
	let resp = client
		.get(probe_url)
		.send()
		.await
		.map_err(|e| ProviderError::Unreachable(e.to_string()))?;
	if !resp.status().is_success() {
		return Err(ProviderError::Unreachable(format!(
			"probe returned {}",
			resp.status()
		)));
	}
	Ok(())
}

pub(crate) async fn reject(resp: reqwest::Response) -> ProviderError {
	let status = resp.status().as_u16();
	if status == 404 {
		return ProviderError::NotFound;
	}
	let detail = resp.text().await.unwrap_or_default();
	ProviderError::Rejected { status, detail }
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Fake;

	#[async_trait]
	impl ProviderClient for Fake {
		fn name(&self) -> ProviderTag {
			strng::literal!("fake")
		}
		async fn create_account(&self, _req: &AccountRequest) -> Result<Account, ProviderError> {
			unimplemented!()
		}
		async fn get_account(&self, _id: &str) -> Result<Account, ProviderError> {
			unimplemented!()
		}
		async fn delete_account(&self, _id: &str) -> Result<(), ProviderError> {
			unimplemented!()
		}
		async fn test_account(&self, _account: &Account) -> Result<(), ProviderError> {
			unimplemented!()
		}
	}

	#[test]
	fn registry_resolves_by_tag() {
		let mut reg = Registry::new();
		reg.register(Arc::new(Fake));
		assert!(reg.get("fake").is_ok());
		assert!(matches!(
			reg.get("missing"),
			Err(ProviderError::UnknownProvider(_))
		));
	}
}
