use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ocean_core::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type PlanTypeKey = Strng;
pub type ProviderTag = Strng;
pub type RegionName = Strng;
pub type PoolName = Strng;

/// The kind of upstream network a plan buys into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
	Residential,
	Datacenter,
	Isp,
	Mobile,
	Unlimited,
}

impl PlanType {
	pub fn as_str(&self) -> &'static str {
		match self {
			PlanType::Residential => "residential",
			PlanType::Datacenter => "datacenter",
			PlanType::Isp => "isp",
			PlanType::Mobile => "mobile",
			PlanType::Unlimited => "unlimited",
		}
	}

	/// Bandwidth-metered plans are billed in GB; the rest are billed by duration.
	pub fn is_bandwidth_based(&self) -> bool {
		matches!(self, PlanType::Residential | PlanType::Isp)
	}
}

impl Display for PlanType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for PlanType {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"residential" => Ok(PlanType::Residential),
			"datacenter" => Ok(PlanType::Datacenter),
			"isp" => Ok(PlanType::Isp),
			"mobile" => Ok(PlanType::Mobile),
			"unlimited" => Ok(PlanType::Unlimited),
			other => Err(format!("unknown plan type {other:?}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
	Creating,
	Active,
	Expired,
	Suspended,
	Failed,
}

impl Display for PlanStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			PlanStatus::Creating => "creating",
			PlanStatus::Active => "active",
			PlanStatus::Expired => "expired",
			PlanStatus::Suspended => "suspended",
			PlanStatus::Failed => "failed",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
	Starting,
	Running,
	Stopped,
	Failed,
}

impl Display for InstanceStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			InstanceStatus::Starting => "starting",
			InstanceStatus::Running => "running",
			InstanceStatus::Stopped => "stopped",
			InstanceStatus::Failed => "failed",
		};
		f.write_str(s)
	}
}

impl FromStr for InstanceStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"starting" => Ok(InstanceStatus::Starting),
			"running" => Ok(InstanceStatus::Running),
			"stopped" => Ok(InstanceStatus::Stopped),
			"failed" => Ok(InstanceStatus::Failed),
			other => Err(format!("unknown instance status {other:?}")),
		}
	}
}

/// A customer's subscription. Owns its instances exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
	pub id: Uuid,
	pub customer_id: String,
	pub plan_type: PlanType,
	pub provider: ProviderTag,
	pub region: RegionName,
	pub plan_type_key: PlanTypeKey,
	pub username: String,
	pub password: String,
	pub bandwidth_gb: u64,
	pub status: PlanStatus,
	/// Vendor-side account id, kept for teardown and reconciliation.
	pub upstream_account_id: Option<String>,
	pub expires_at: DateTime<Utc>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Plan {
	pub fn touch(&mut self) {
		self.updated_at = Utc::now();
	}
}

/// One local forwarder process serving one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
	pub id: Uuid,
	pub plan_id: Uuid,
	pub plan_type_key: PlanTypeKey,
	pub local_port: u16,
	pub upstream_host: String,
	pub upstream_port: u16,
	/// OS process id; 0 when no process is running.
	pub pid: u32,
	pub status: InstanceStatus,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Instance {
	pub fn touch(&mut self) {
		self.updated_at = Utc::now();
	}
}

/// Incoming plan purchase, as posted to the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
	#[serde(alias = "customer")]
	pub customer_id: String,
	#[serde(rename = "type")]
	pub plan_type: PlanType,
	pub provider: ProviderTag,
	pub region: RegionName,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	/// Purchased bandwidth in GB; ignored by duration-billed plan types.
	#[serde(default)]
	pub bandwidth: u64,
	/// Plan duration in days.
	#[serde(default)]
	pub duration: Option<u32>,
}

/// Static description of one sellable (provider, region, plan-type) combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTypeEntry {
	pub provider: ProviderTag,
	pub region: RegionName,
	pub plan_type: PlanType,
	pub upstream_host: String,
	pub upstream_port: u16,
	/// Private local port range, disjoint from every other entry.
	pub port_start: u16,
	pub port_end: u16,
	/// Customer-facing port on the edge.
	pub outbound_port: u16,
	/// Name of the edge upstream pool this entry's instances join.
	pub pool: PoolName,
}

impl PlanTypeEntry {
	pub fn key(&self) -> PlanTypeKey {
		plan_type_key(&self.provider, &self.region, self.plan_type)
	}
}

/// Derive the catalog key for a (provider, region, plan-type) tuple.
pub fn plan_type_key(provider: &str, region: &str, plan_type: PlanType) -> PlanTypeKey {
	strng::new(format!(
		"{}_{}_{}",
		provider.to_ascii_lowercase(),
		region.to_ascii_lowercase(),
		plan_type
	))
}

/// Static description of one edge region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionEntry {
	pub name: RegionName,
	pub outbound_port: u16,
	/// Plan-type keys whose instances this region's edge file fans out to.
	pub plan_types: Vec<PlanTypeKey>,
	pub conf_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
	entries: HashMap<PlanTypeKey, PlanTypeEntry>,
	regions: HashMap<RegionName, RegionEntry>,
}

impl Catalog {
	pub fn new(entries: Vec<PlanTypeEntry>, regions: Vec<RegionEntry>) -> anyhow::Result<Self> {
		let mut by_key: HashMap<PlanTypeKey, PlanTypeEntry> = HashMap::new();
		for e in entries {
			let key = e.key();
			for other in by_key.values() {
				if e.port_start <= other.port_end && other.port_start <= e.port_end {
					anyhow::bail!(
						"plan type {} port range {}-{} overlaps {} ({}-{})",
						key,
						e.port_start,
						e.port_end,
						other.key(),
						other.port_start,
						other.port_end
					);
				}
			}
			if e.port_start > e.port_end {
				anyhow::bail!("plan type {key} has inverted port range");
			}
			if by_key.insert(key.clone(), e).is_some() {
				anyhow::bail!("duplicate plan type {key}");
			}
		}
		let regions = regions
			.into_iter()
			.map(|r| (r.name.clone(), r))
			.collect();
		Ok(Catalog {
			entries: by_key,
			regions,
		})
	}

	pub fn entry(&self, key: &str) -> Option<&PlanTypeEntry> {
		self.entries.get(key)
	}

	pub fn resolve(
		&self,
		provider: &str,
		region: &str,
		plan_type: PlanType,
	) -> Option<&PlanTypeEntry> {
		self.entries.get(&plan_type_key(provider, region, plan_type))
	}

	pub fn region(&self, name: &str) -> Option<&RegionEntry> {
		self.regions.get(name)
	}

	pub fn entries(&self) -> impl Iterator<Item = &PlanTypeEntry> {
		self.entries.values()
	}

	pub fn regions(&self) -> impl Iterator<Item = &RegionEntry> {
		self.regions.values()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(provider: &str, region: &str, pt: PlanType, start: u16, end: u16) -> PlanTypeEntry {
		PlanTypeEntry {
			provider: strng::new(provider),
			region: strng::new(region),
			plan_type: pt,
			upstream_host: "up.example.net".into(),
			upstream_port: 8000,
			port_start: start,
			port_end: end,
			outbound_port: 1337,
			pool: plan_type_key(provider, region, pt),
		}
	}

	#[test]
	fn key_derivation_lowercases() {
		assert_eq!(
			plan_type_key("Vendor-A", "USA", PlanType::Residential),
			strng::literal!("vendor-a_usa_residential")
		);
	}

	#[test]
	fn catalog_rejects_overlapping_ranges() {
		let err = Catalog::new(
			vec![
				entry("vendor-a", "usa", PlanType::Residential, 10000, 11999),
				entry("vendor-a", "usa", PlanType::Datacenter, 11500, 13999),
			],
			vec![],
		)
		.unwrap_err();
		assert!(err.to_string().contains("overlaps"));
	}

	#[test]
	fn catalog_resolves_by_tuple() {
		let cat = Catalog::new(
			vec![entry("vendor-a", "usa", PlanType::Residential, 10000, 11999)],
			vec![],
		)
		.unwrap();
		assert!(cat.resolve("vendor-a", "usa", PlanType::Residential).is_some());
		assert!(cat.resolve("vendor-a", "usa", PlanType::Datacenter).is_none());
	}
}
