use std::collections::{BTreeMap, BTreeSet, HashMap};

use ocean_core::prelude::*;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{Catalog, Instance, InstanceStatus, PlanTypeKey};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PortError {
	#[error("unknown plan type {0}")]
	UnknownPlanType(PlanTypeKey),
	#[error("no ports available for {0}")]
	NoPortsAvailable(PlanTypeKey),
	#[error("port {1} is not allocated in {0}")]
	NotAllocated(PlanTypeKey, u16),
	#[error("port {1} is outside the range of {0}")]
	OutOfRange(PlanTypeKey, u16),
}

struct Pool {
	start: u16,
	end: u16,
	free: BTreeSet<u16>,
	in_use: BTreeMap<u16, Uuid>,
}

impl Pool {
	fn new(start: u16, end: u16) -> Self {
		Pool {
			start,
			end,
			free: (start..=end).collect(),
			in_use: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolSnapshot {
	pub in_use: BTreeSet<u16>,
	pub free: usize,
}

/// Hands out local forwarder ports from the disjoint per-plan-type ranges in
/// the catalog. Allocation state is purely in memory; on startup it is
/// reconstructed from the store's live instance records.
pub struct PortAllocator {
	pools: Mutex<HashMap<PlanTypeKey, Pool>>,
}

impl PortAllocator {
	pub fn new(catalog: &Catalog) -> Self {
		let pools = catalog
			.entries()
			.map(|e| (e.key(), Pool::new(e.port_start, e.port_end)))
			.collect();
		PortAllocator {
			pools: Mutex::new(pools),
		}
	}

	/// Claim ports recorded against live instances. Claims that no longer fit
	/// the catalog are logged and skipped rather than failing startup.
	pub fn restore(&self, instances: &[Instance]) {
		let mut pools = self.pools.lock();
		for i in instances {
			if !matches!(i.status, InstanceStatus::Starting | InstanceStatus::Running) {
				continue;
			}
			let Some(pool) = pools.get_mut(&i.plan_type_key) else {
				warn!(instance = %i.id, key = %i.plan_type_key, "instance references unknown plan type, skipping");
				continue;
			};
			if !pool.free.remove(&i.local_port) {
				warn!(
					instance = %i.id,
					port = i.local_port,
					"port already claimed or out of range, skipping"
				);
				continue;
			}
			pool.in_use.insert(i.local_port, i.plan_id);
		}
	}

	/// Returns the smallest unused port in the plan type's range.
	pub fn allocate(&self, key: &PlanTypeKey, plan_id: Uuid) -> Result<u16, PortError> {
		let mut pools = self.pools.lock();
		let pool = pools
			.get_mut(key)
			.ok_or_else(|| PortError::UnknownPlanType(key.clone()))?;
		let Some(port) = pool.free.iter().next().copied() else {
			return Err(PortError::NoPortsAvailable(key.clone()));
		};
		pool.free.remove(&port);
		pool.in_use.insert(port, plan_id);
		debug!(%key, port, %plan_id, "port allocated");
		Ok(port)
	}

	/// Claim a specific port, used when re-adopting a persisted instance.
	/// Claiming a port already held for the same plan is a no-op.
	pub fn claim(&self, key: &PlanTypeKey, port: u16, plan_id: Uuid) -> Result<(), PortError> {
		let mut pools = self.pools.lock();
		let pool = pools
			.get_mut(key)
			.ok_or_else(|| PortError::UnknownPlanType(key.clone()))?;
		if port < pool.start || port > pool.end {
			return Err(PortError::OutOfRange(key.clone(), port));
		}
		if let Some(owner) = pool.in_use.get(&port) {
			if *owner == plan_id {
				return Ok(());
			}
			return Err(PortError::NotAllocated(key.clone(), port));
		}
		pool.free.remove(&port);
		pool.in_use.insert(port, plan_id);
		Ok(())
	}

	pub fn release(&self, key: &PlanTypeKey, port: u16) -> Result<(), PortError> {
		let mut pools = self.pools.lock();
		let pool = pools
			.get_mut(key)
			.ok_or_else(|| PortError::UnknownPlanType(key.clone()))?;
		if port < pool.start || port > pool.end {
			return Err(PortError::OutOfRange(key.clone(), port));
		}
		if pool.in_use.remove(&port).is_none() {
			return Err(PortError::NotAllocated(key.clone(), port));
		}
		pool.free.insert(port);
		debug!(%key, port, "port released");
		Ok(())
	}

	pub fn is_allocated(&self, key: &PlanTypeKey, port: u16) -> bool {
		self
			.pools
			.lock()
			.get(key)
			.map(|p| p.in_use.contains_key(&port))
			.unwrap_or(false)
	}

	pub fn snapshot(&self) -> BTreeMap<PlanTypeKey, PoolSnapshot> {
		self
			.pools
			.lock()
			.iter()
			.map(|(k, p)| {
				(
					k.clone(),
					PoolSnapshot {
						in_use: p.in_use.keys().copied().collect(),
						free: p.free.len(),
					},
				)
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{PlanType, PlanTypeEntry, plan_type_key};

	fn catalog(start: u16, end: u16) -> Catalog {
		Catalog::new(
			vec![PlanTypeEntry {
				provider: strng::literal!("vendor-a"),
				region: strng::literal!("usa"),
				plan_type: PlanType::Residential,
				upstream_host: "up.example.net".into(),
				upstream_port: 8000,
				port_start: start,
				port_end: end,
				outbound_port: 1337,
				pool: strng::literal!("vendor-a_usa_residential"),
			}],
			vec![],
		)
		.unwrap()
	}

	fn key() -> PlanTypeKey {
		plan_type_key("vendor-a", "usa", PlanType::Residential)
	}

	#[test]
	fn allocates_in_range_without_duplicates() {
		let alloc = PortAllocator::new(&catalog(10000, 10009));
		let mut seen = BTreeSet::new();
		for _ in 0..10 {
			let port = alloc.allocate(&key(), Uuid::new_v4()).unwrap();
			assert!((10000..=10009).contains(&port));
			assert!(seen.insert(port), "port {port} returned twice");
		}
		assert_eq!(
			alloc.allocate(&key(), Uuid::new_v4()),
			Err(PortError::NoPortsAvailable(key()))
		);
	}

	#[test]
	fn release_then_allocate_reuses_the_port() {
		let alloc = PortAllocator::new(&catalog(12000, 13999));
		let port = alloc.allocate(&key(), Uuid::new_v4()).unwrap();
		alloc.release(&key(), port).unwrap();
		assert_eq!(alloc.allocate(&key(), Uuid::new_v4()).unwrap(), port);
	}

	#[test]
	fn release_validates_range_and_allocation() {
		let alloc = PortAllocator::new(&catalog(10000, 10009));
		assert_eq!(
			alloc.release(&key(), 9999),
			Err(PortError::OutOfRange(key(), 9999))
		);
		assert_eq!(
			alloc.release(&key(), 10005),
			Err(PortError::NotAllocated(key(), 10005))
		);
		assert_eq!(
			alloc.allocate(&strng::literal!("nope"), Uuid::new_v4()),
			Err(PortError::UnknownPlanType(strng::literal!("nope")))
		);
	}

	#[test]
	fn claim_readopts_specific_ports() {
		let alloc = PortAllocator::new(&catalog(10000, 10009));
		let plan = Uuid::new_v4();
		alloc.claim(&key(), 10004, plan).unwrap();
		// Same plan re-claims freely; another plan cannot take it.
		alloc.claim(&key(), 10004, plan).unwrap();
		assert_eq!(
			alloc.claim(&key(), 10004, Uuid::new_v4()),
			Err(PortError::NotAllocated(key(), 10004))
		);
		assert!(alloc.is_allocated(&key(), 10004));
	}

	#[test]
	fn restore_claims_live_instances_only() {
		let alloc = PortAllocator::new(&catalog(10000, 10009));
		let mk = |port: u16, status| crate::types::Instance {
			id: Uuid::new_v4(),
			plan_id: Uuid::new_v4(),
			plan_type_key: key(),
			local_port: port,
			upstream_host: "up.example.net".into(),
			upstream_port: 8000,
			pid: 0,
			status,
			created_at: chrono::Utc::now(),
			updated_at: chrono::Utc::now(),
		};
		alloc.restore(&[
			mk(10000, InstanceStatus::Running),
			mk(10001, InstanceStatus::Starting),
			mk(10002, InstanceStatus::Stopped),
		]);
		let snap = alloc.snapshot();
		let pool = snap.get(&key()).unwrap();
		assert_eq!(pool.in_use, BTreeSet::from([10000, 10001]));
		assert_eq!(pool.free, 8);
	}
}
