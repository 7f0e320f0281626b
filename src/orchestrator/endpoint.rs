use ocean_core::prelude::*;
use serde::Serialize;

use super::PlanError;
use crate::types::{Catalog, Plan, PlanType};

/// Customer-facing connection details for one plan.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyEndpoint {
	pub url: String,
	pub region: String,
	pub username: String,
	pub password: String,
}

/// Map a plan onto its branded edge endpoint. The host and region label
/// depend on (provider, plan type); the port always comes from a region
/// entry, with the vendor-b mobile/unlimited families falling back to the
/// alpha region when they have no entry of their own.
pub fn customer_endpoints(
	catalog: &Catalog,
	domain: &str,
	plan: &Plan,
) -> Result<Vec<ProxyEndpoint>, PlanError> {
	let port_of = |region: &str| -> Option<u16> { catalog.region(region).map(|r| r.outbound_port) };
	let missing = |region: &str| PlanError::RegionNotConfigured(strng::new(region));

	let (host, port, label) = match (plan.provider.as_str(), plan.plan_type) {
		("vendor-a", PlanType::Residential) => (
			format!("{}.{domain}", plan.region),
			port_of(&plan.region).ok_or_else(|| missing(&plan.region))?,
			plan.region.to_string(),
		),
		("vendor-a", PlanType::Datacenter) => (
			format!("datacenter.{domain}"),
			port_of(&plan.region).ok_or_else(|| missing(&plan.region))?,
			"datacenter".to_string(),
		),
		("vendor-a", PlanType::Isp) => (
			format!("isp.{domain}"),
			port_of(&plan.region).ok_or_else(|| missing(&plan.region))?,
			"isp".to_string(),
		),
		("vendor-b", PlanType::Residential) => (
			format!("alpha.{domain}"),
			port_of("alpha").ok_or_else(|| missing("alpha"))?,
			"alpha".to_string(),
		),
		("vendor-b", PlanType::Datacenter) => (
			format!("beta.{domain}"),
			port_of("beta").ok_or_else(|| missing("beta"))?,
			"beta".to_string(),
		),
		("vendor-b", PlanType::Mobile) => (
			format!("mobile.{domain}"),
			port_of("mobile")
				.or_else(|| port_of("alpha"))
				.ok_or_else(|| missing("mobile"))?,
			"mobile".to_string(),
		),
		("vendor-b", PlanType::Unlimited) => (
			format!("unlim.{domain}"),
			port_of("unlim")
				.or_else(|| port_of("alpha"))
				.ok_or_else(|| missing("unlim"))?,
			"unlim".to_string(),
		),
		_ => {
			return Err(PlanError::UnsupportedConfiguration {
				provider: plan.provider.clone(),
				region: plan.region.clone(),
				plan_type: plan.plan_type,
			});
		},
	};

	Ok(vec![ProxyEndpoint {
		url: format!(
			"http://{}:{}@{host}:{port}",
			plan.username, plan.password
		),
		region: label,
		username: plan.username.clone(),
		password: plan.password.clone(),
	}])
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use uuid::Uuid;

	use super::*;
	use crate::types::{PlanStatus, PlanTypeEntry, RegionEntry, plan_type_key};

	fn catalog() -> Catalog {
		let mk_region = |name: &str, port: u16| RegionEntry {
			name: strng::new(name),
			outbound_port: port,
			plan_types: vec![],
			conf_file: format!("{name}.conf"),
		};
		Catalog::new(
			vec![PlanTypeEntry {
				provider: strng::literal!("vendor-a"),
				region: strng::literal!("usa"),
				plan_type: PlanType::Residential,
				upstream_host: "usa.res.vendor-a.io".into(),
				upstream_port: 8000,
				port_start: 10000,
				port_end: 11999,
				outbound_port: 1337,
				pool: plan_type_key("vendor-a", "usa", PlanType::Residential),
			}],
			vec![mk_region("usa", 1337), mk_region("alpha", 2020)],
		)
		.unwrap()
	}

	fn plan(provider: &str, region: &str, plan_type: PlanType) -> Plan {
		let now = Utc::now();
		Plan {
			id: Uuid::new_v4(),
			customer_id: "c1".into(),
			plan_type,
			provider: strng::new(provider),
			region: strng::new(region),
			plan_type_key: plan_type_key(provider, region, plan_type),
			username: "u".into(),
			password: "p".into(),
			bandwidth_gb: 10,
			status: PlanStatus::Active,
			upstream_account_id: None,
			expires_at: now,
			created_at: now,
			updated_at: now,
		}
	}

	#[test]
	fn vendor_a_residential_uses_the_plan_region() {
		let eps =
			customer_endpoints(&catalog(), "example.io", &plan("vendor-a", "usa", PlanType::Residential))
				.unwrap();
		assert_eq!(eps[0].url, "http://u:p@usa.example.io:1337");
		assert_eq!(eps[0].region, "usa");
	}

	#[test]
	fn vendor_a_datacenter_uses_the_datacenter_host() {
		let eps =
			customer_endpoints(&catalog(), "example.io", &plan("vendor-a", "usa", PlanType::Datacenter))
				.unwrap();
		assert_eq!(eps[0].url, "http://u:p@datacenter.example.io:1337");
		assert_eq!(eps[0].region, "datacenter");
	}

	#[test]
	fn vendor_b_mobile_falls_back_to_alpha_port() {
		let eps =
			customer_endpoints(&catalog(), "example.io", &plan("vendor-b", "alpha", PlanType::Mobile))
				.unwrap();
		assert_eq!(eps[0].url, "http://u:p@mobile.example.io:2020");
		assert_eq!(eps[0].region, "mobile");
	}

	#[test]
	fn missing_region_is_an_error() {
		let err =
			customer_endpoints(&catalog(), "example.io", &plan("vendor-a", "emea", PlanType::Residential))
				.unwrap_err();
		assert!(matches!(err, PlanError::RegionNotConfigured(r) if r == "emea"));
	}
}
