use async_trait::async_trait;
use ocean_core::prelude::*;
use serde::Deserialize;

use super::{Account, AccountRequest, ProviderClient, ProviderError, proxied_fetch, reject};
use crate::types::{PlanType, ProviderTag};

pub const NAME: Strng = strng::literal!("vendor-b");

const GATEWAY_HOST: &str = "gate.vendor-b.net";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
	pub base_url: String,
	#[serde(serialize_with = "crate::serdes::ser_redact")]
	pub api_key: String,
	#[serde(default = "default_probe_url")]
	pub probe_url: String,
	#[serde(default = "default_timeout", with = "crate::serdes::serde_dur")]
	pub timeout: Duration,
}

fn default_probe_url() -> String {
	"http://api.ipify.org".to_string()
}

fn default_timeout() -> Duration {
	Duration::from_secs(30)
}

/// JSON vendor. Generates credentials itself: create returns only the account
/// id, and a follow-up fetch yields the generated username/password.
pub struct Provider {
	cfg: Config,
	client: reqwest::Client,
}

impl Provider {
	pub fn new(cfg: Config) -> Self {
		let client = reqwest::Client::builder()
			.timeout(cfg.timeout)
			.build()
			.expect("static client config");
		Provider { cfg, client }
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
	}

	/// The gateway port is fixed per plan type.
	fn gateway_port(plan_type: PlanType) -> u16 {
		match plan_type {
			PlanType::Residential | PlanType::Isp => 9000,
			PlanType::Datacenter => 9100,
			PlanType::Mobile => 9200,
			PlanType::Unlimited => 9300,
		}
	}
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
	account_id: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
	account_id: String,
	username: String,
	password: String,
	#[serde(default)]
	region: Option<String>,
	#[serde(default)]
	plan: Option<PlanType>,
}

#[async_trait]
impl ProviderClient for Provider {
	fn name(&self) -> ProviderTag {
		NAME
	}

	fn chooses_credentials(&self) -> bool {
		true
	}

	async fn create_account(&self, req: &AccountRequest) -> Result<Account, ProviderError> {
		let mut body = serde_json::json!({
			"plan": req.plan_type,
			"region": req.region.as_str(),
		});
		if req.plan_type == PlanType::Unlimited {
			body["duration_hours"] = serde_json::json!(u64::from(req.duration_days) * 24);
		} else {
			body["bandwidth_mb"] = serde_json::json!(req.bandwidth_gb * 1024);
		}
		let resp = self
			.client
			.post(self.url("/v2/accounts"))
			.bearer_auth(&self.cfg.api_key)
			.json(&body)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(reject(resp).await);
		}
		let created: CreateResponse = resp
			.json()
			.await
			.map_err(|e| ProviderError::Decode(e.to_string()))?;
		// The generated credentials only appear on the account fetch.
		let mut account = self.get_account(&created.account_id).await?;
		account.port = Self::gateway_port(req.plan_type);
		if account.region.is_empty() {
			account.region = req.region.clone();
		}
		Ok(account)
	}

	async fn get_account(&self, id: &str) -> Result<Account, ProviderError> {
		let resp = self
			.client
			.get(self.url(&format!("/v2/accounts/{id}")))
			.bearer_auth(&self.cfg.api_key)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(reject(resp).await);
		}
		let body: AccountResponse = resp
			.json()
			.await
			.map_err(|e| ProviderError::Decode(e.to_string()))?;
		Ok(Account {
			id: body.account_id,
			username: body.username,
			password: body.password,
			host: GATEWAY_HOST.to_string(),
			port: body.plan.map(Self::gateway_port).unwrap_or(9000),
			region: body.region.map(strng::new).unwrap_or_default(),
		})
	}

	async fn delete_account(&self, id: &str) -> Result<(), ProviderError> {
		let resp = self
			.client
			.delete(self.url(&format!("/v2/accounts/{id}")))
			.bearer_auth(&self.cfg.api_key)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(reject(resp).await);
		}
		Ok(())
	}

	async fn test_account(&self, account: &Account) -> Result<(), ProviderError> {
		proxied_fetch(
			&account.host,
			account.port,
			&account.username,
			&account.password,
			&self.cfg.probe_url,
			self.cfg.timeout,
		)
		.await
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{body_partial_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn provider(base_url: String) -> Provider {
		Provider::new(Config {
			base_url,
			api_key: "k".into(),
			probe_url: default_probe_url(),
			timeout: Duration::from_secs(5),
		})
	}

	fn request(plan_type: PlanType) -> AccountRequest {
		AccountRequest {
			plan_type,
			region: strng::literal!("alpha"),
			username: None,
			password: None,
			bandwidth_gb: 5,
			duration_days: 30,
		}
	}

	async fn mount_get(server: &MockServer) {
		Mock::given(method("GET"))
			.and(path("/v2/accounts/b-77"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"account_id": "b-77",
				"username": "vendor_u",
				"password": "vendor_p"
			})))
			.mount(server)
			.await;
	}

	#[tokio::test]
	async fn create_converts_gb_to_mb_and_fetches_credentials() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v2/accounts"))
			.and(body_partial_json(serde_json::json!({"bandwidth_mb": 5120})))
			.respond_with(
				ResponseTemplate::new(201).set_body_json(serde_json::json!({"account_id": "b-77"})),
			)
			.expect(1)
			.mount(&server)
			.await;
		mount_get(&server).await;

		let account = provider(server.uri())
			.create_account(&request(PlanType::Residential))
			.await
			.unwrap();
		assert_eq!(account.username, "vendor_u");
		assert_eq!(account.password, "vendor_p");
		assert_eq!(account.port, 9000);
		assert_eq!(account.host, GATEWAY_HOST);
	}

	#[tokio::test]
	async fn unlimited_converts_days_to_hours() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v2/accounts"))
			.and(body_partial_json(serde_json::json!({"duration_hours": 720})))
			.respond_with(
				ResponseTemplate::new(201).set_body_json(serde_json::json!({"account_id": "b-77"})),
			)
			.expect(1)
			.mount(&server)
			.await;
		mount_get(&server).await;

		let account = provider(server.uri())
			.create_account(&request(PlanType::Unlimited))
			.await
			.unwrap();
		assert_eq!(account.port, 9300);
	}

	#[tokio::test]
	async fn missing_account_maps_to_not_found() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v2/accounts/gone"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let err = provider(server.uri()).get_account("gone").await.unwrap_err();
		assert!(matches!(err, ProviderError::NotFound));
	}
}
