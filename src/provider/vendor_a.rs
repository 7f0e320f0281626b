use async_trait::async_trait;
use ocean_core::prelude::*;
use serde::Deserialize;

use super::{Account, AccountRequest, ProviderClient, ProviderError, proxied_fetch, reject};
use crate::types::{PlanType, ProviderTag};

pub const NAME: Strng = strng::literal!("vendor-a");

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

/// Form-encoded vendor. Accepts caller-supplied credentials verbatim;
/// bandwidth plans (residential/isp) buy GB, datacenter plans buy days.
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

	/// The create response frequently omits the gateway host; in that case it
	/// is a function of (plan type, region).
	fn default_host(&self, plan_type: PlanType, region: &str) -> (String, u16) {
		match plan_type {
			PlanType::Residential => (format!("{region}.res.vendor-a.io"), 8000),
			PlanType::Isp => (format!("{region}.isp.vendor-a.io"), 8000),
			_ => ("dc.vendor-a.io".to_string(), 8100),
		}
	}
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
	id: String,
	#[serde(default)]
	username: Option<String>,
	#[serde(default)]
	password: Option<String>,
	#[serde(default)]
	host: Option<String>,
	#[serde(default)]
	port: Option<u16>,
	#[serde(default)]
	region: Option<String>,
}

#[async_trait]
impl ProviderClient for Provider {
	fn name(&self) -> ProviderTag {
		NAME
	}

	async fn create_account(&self, req: &AccountRequest) -> Result<Account, ProviderError> {
		let username = req.username.clone().unwrap_or_default();
		let password = req.password.clone().unwrap_or_default();
		let mut form = vec![
			("plan".to_string(), req.plan_type.to_string()),
			("region".to_string(), req.region.to_string()),
			("username".to_string(), username.clone()),
			("password".to_string(), password.clone()),
		];
		if req.plan_type.is_bandwidth_based() {
			form.push(("bandwidth_gb".to_string(), req.bandwidth_gb.to_string()));
		} else {
			form.push(("duration_days".to_string(), req.duration_days.to_string()));
		}
		let resp = self
			.client
			.post(self.url("/api/plans"))
			.header("x-api-key", &self.cfg.api_key)
			.form(&form)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(reject(resp).await);
		}
		let body: CreateResponse = resp
			.json()
			.await
			.map_err(|e| ProviderError::Decode(e.to_string()))?;
		let (default_host, default_port) = self.default_host(req.plan_type, &req.region);
		Ok(Account {
			id: body.id,
			username: body.username.unwrap_or(username),
			password: body.password.unwrap_or(password),
			host: body.host.unwrap_or(default_host),
			port: body.port.unwrap_or(default_port),
			region: body
				.region
				.map(strng::new)
				.unwrap_or_else(|| req.region.clone()),
		})
	}

	async fn get_account(&self, id: &str) -> Result<Account, ProviderError> {
		let resp = self
			.client
			.get(self.url(&format!("/api/plans/{id}")))
			.header("x-api-key", &self.cfg.api_key)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(reject(resp).await);
		}
		let body: CreateResponse = resp
			.json()
			.await
			.map_err(|e| ProviderError::Decode(e.to_string()))?;
		Ok(Account {
			id: body.id,
			username: body.username.unwrap_or_default(),
			password: body.password.unwrap_or_default(),
			host: body.host.unwrap_or_default(),
			port: body.port.unwrap_or(8000),
			region: body.region.map(strng::new).unwrap_or_default(),
		})
	}

	async fn delete_account(&self, id: &str) -> Result<(), ProviderError> {
		let resp = self
			.client
			.delete(self.url(&format!("/api/plans/{id}")))
			.header("x-api-key", &self.cfg.api_key)
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
	use wiremock::matchers::{body_string_contains, header, method, path};
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
			region: strng::literal!("usa"),
			username: Some("u".into()),
			password: Some("p".into()),
			bandwidth_gb: 10,
			duration_days: 30,
		}
	}

	#[tokio::test]
	async fn residential_create_sends_bandwidth_form() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/plans"))
			.and(header("x-api-key", "k"))
			.and(body_string_contains("bandwidth_gb=10"))
			.and(body_string_contains("username=u"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"id": "acc-1"
			})))
			.expect(1)
			.mount(&server)
			.await;

		let account = provider(server.uri())
			.create_account(&request(PlanType::Residential))
			.await
			.unwrap();
		// Caller credentials survive, host falls back to (plan type, region).
		assert_eq!(account.username, "u");
		assert_eq!(account.password, "p");
		assert_eq!(account.host, "usa.res.vendor-a.io");
	}

	#[tokio::test]
	async fn datacenter_create_sends_duration_form() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/plans"))
			.and(body_string_contains("duration_days=30"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"id": "acc-2",
				"host": "dc7.vendor-a.io",
				"port": 8100
			})))
			.expect(1)
			.mount(&server)
			.await;

		let account = provider(server.uri())
			.create_account(&request(PlanType::Datacenter))
			.await
			.unwrap();
		assert_eq!(account.host, "dc7.vendor-a.io");
		assert_eq!(account.port, 8100);
	}

	#[tokio::test]
	async fn vendor_rejection_surfaces_status() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/plans"))
			.respond_with(ResponseTemplate::new(402).set_body_string("quota exceeded"))
			.mount(&server)
			.await;

		let err = provider(server.uri())
			.create_account(&request(PlanType::Residential))
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::Rejected { status: 402, .. }));
	}

	#[tokio::test]
	async fn delete_missing_account_is_not_found() {
		let server = MockServer::start().await;
		Mock::given(method("DELETE"))
			.and(path("/api/plans/acc-9"))
			.respond_with(ResponseTemplate::new(404))
			.mount(&server)
			.await;

		let err = provider(server.uri()).delete_account("acc-9").await.unwrap_err();
		assert!(matches!(err, ProviderError::NotFound));
	}
}
