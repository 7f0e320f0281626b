use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ocean_core::prelude::*;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{StateExport, Store, StoreError};
use crate::types::{Instance, InstanceStatus, Plan, PlanStatus};

const PLANS_FILE: &str = "plans.json";
const INSTANCES_FILE: &str = "instances.json";

/// File-backed store: two whole-file JSON documents under a state directory.
/// Every mutation rewrites the affected document atomically (temp + rename),
/// so a crash mid-write leaves the previous intact version on disk.
pub struct FileStore {
	dir: PathBuf,
	plans: RwLock<HashMap<Uuid, Plan>>,
	instances: RwLock<HashMap<Uuid, Instance>>,
}

impl FileStore {
	pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		let dir = dir.as_ref().to_path_buf();
		fs_err::create_dir_all(&dir)?;
		let plans: Vec<Plan> = load_doc(&dir.join(PLANS_FILE))?;
		let instances: Vec<Instance> = load_doc(&dir.join(INSTANCES_FILE))?;
		info!(
			plans = plans.len(),
			instances = instances.len(),
			dir = %dir.display(),
			"state loaded"
		);
		Ok(FileStore {
			dir,
			plans: RwLock::new(plans.into_iter().map(|p| (p.id, p)).collect()),
			instances: RwLock::new(instances.into_iter().map(|i| (i.id, i)).collect()),
		})
	}

	fn flush_plans(&self, plans: &HashMap<Uuid, Plan>) -> Result<(), StoreError> {
		write_doc(&self.dir, PLANS_FILE, &sorted(plans))
	}

	fn flush_instances(&self, instances: &HashMap<Uuid, Instance>) -> Result<(), StoreError> {
		write_doc(&self.dir, INSTANCES_FILE, &sorted(instances))
	}

	pub fn export(&self) -> StateExport {
		StateExport {
			plans: sorted(&self.plans.read()),
			instances: sorted(&self.instances.read()),
		}
	}

	pub fn import(&self, state: StateExport) -> Result<(), StoreError> {
		let mut plans = self.plans.write();
		let mut instances = self.instances.write();
		*plans = state.plans.into_iter().map(|p| (p.id, p)).collect();
		*instances = state.instances.into_iter().map(|i| (i.id, i)).collect();
		self.flush_plans(&plans)?;
		self.flush_instances(&instances)
	}
}

fn sorted<T: Clone + HasId>(map: &HashMap<Uuid, T>) -> Vec<T> {
	let mut v: Vec<T> = map.values().cloned().collect();
	v.sort_by_key(|t| t.id());
	v
}

trait HasId {
	fn id(&self) -> Uuid;
}

impl HasId for Plan {
	fn id(&self) -> Uuid {
		self.id
	}
}

impl HasId for Instance {
	fn id(&self) -> Uuid {
		self.id
	}
}

fn load_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
	match fs_err::read_to_string(path) {
		Ok(raw) => serde_json::from_str(&raw)
			.map_err(|e| StoreError::Corrupt(path.display().to_string(), e)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
		Err(e) => Err(e.into()),
	}
}

fn write_doc<T: serde::Serialize>(dir: &Path, name: &str, doc: &T) -> Result<(), StoreError> {
	let tmp = dir.join(format!(".{name}.tmp"));
	let raw = serde_json::to_vec_pretty(doc).expect("state types serialize");
	fs_err::write(&tmp, raw)?;
	fs_err::rename(&tmp, dir.join(name))?;
	Ok(())
}

impl Store for FileStore {
	fn insert_plan(&self, plan: Plan) -> Result<(), StoreError> {
		let mut plans = self.plans.write();
		if plans.contains_key(&plan.id) {
			return Err(StoreError::Duplicate(plan.id));
		}
		plans.insert(plan.id, plan);
		self.flush_plans(&plans)
	}

	fn update_plan(&self, plan: Plan) -> Result<(), StoreError> {
		let mut plans = self.plans.write();
		if !plans.contains_key(&plan.id) {
			return Err(StoreError::PlanNotFound(plan.id));
		}
		plans.insert(plan.id, plan);
		self.flush_plans(&plans)
	}

	fn delete_plan(&self, id: Uuid) -> Result<(), StoreError> {
		let mut plans = self.plans.write();
		if plans.remove(&id).is_none() {
			return Err(StoreError::PlanNotFound(id));
		}
		self.flush_plans(&plans)
	}

	fn plan(&self, id: Uuid) -> Option<Plan> {
		self.plans.read().get(&id).cloned()
	}

	fn plans(&self) -> Vec<Plan> {
		sorted(&self.plans.read())
	}

	fn plans_by_customer(&self, customer_id: &str) -> Vec<Plan> {
		let mut v: Vec<Plan> = self
			.plans
			.read()
			.values()
			.filter(|p| p.customer_id == customer_id)
			.cloned()
			.collect();
		v.sort_by_key(|p| p.id);
		v
	}

	fn plans_by_status(&self, status: PlanStatus) -> Vec<Plan> {
		let mut v: Vec<Plan> = self
			.plans
			.read()
			.values()
			.filter(|p| p.status == status)
			.cloned()
			.collect();
		v.sort_by_key(|p| p.id);
		v
	}

	fn plans_expired_before(&self, t: DateTime<Utc>) -> Vec<Plan> {
		let mut v: Vec<Plan> = self
			.plans
			.read()
			.values()
			.filter(|p| p.status == PlanStatus::Active && p.expires_at < t)
			.cloned()
			.collect();
		v.sort_by_key(|p| p.id);
		v
	}

	fn insert_instance(&self, instance: Instance) -> Result<(), StoreError> {
		let mut instances = self.instances.write();
		if instances.contains_key(&instance.id) {
			return Err(StoreError::Duplicate(instance.id));
		}
		instances.insert(instance.id, instance);
		self.flush_instances(&instances)
	}

	fn update_instance(&self, instance: Instance) -> Result<(), StoreError> {
		let mut instances = self.instances.write();
		if !instances.contains_key(&instance.id) {
			return Err(StoreError::InstanceNotFound(instance.id));
		}
		instances.insert(instance.id, instance);
		self.flush_instances(&instances)
	}

	fn delete_instance(&self, id: Uuid) -> Result<(), StoreError> {
		let mut instances = self.instances.write();
		if instances.remove(&id).is_none() {
			return Err(StoreError::InstanceNotFound(id));
		}
		self.flush_instances(&instances)
	}

	fn instance(&self, id: Uuid) -> Option<Instance> {
		self.instances.read().get(&id).cloned()
	}

	fn instances(&self) -> Vec<Instance> {
		sorted(&self.instances.read())
	}

	fn instances_by_plan(&self, plan_id: Uuid) -> Vec<Instance> {
		let mut v: Vec<Instance> = self
			.instances
			.read()
			.values()
			.filter(|i| i.plan_id == plan_id)
			.cloned()
			.collect();
		v.sort_by_key(|i| i.id);
		v
	}

	fn instances_by_status(&self, status: InstanceStatus) -> Vec<Instance> {
		let mut v: Vec<Instance> = self
			.instances
			.read()
			.values()
			.filter(|i| i.status == status)
			.cloned()
			.collect();
		v.sort_by_key(|i| i.id);
		v
	}

	fn instance_by_port(&self, port: u16) -> Option<Instance> {
		self
			.instances
			.read()
			.values()
			.find(|i| i.local_port == port)
			.cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{PlanType, plan_type_key};

	fn plan(customer: &str) -> Plan {
		let now = Utc::now();
		Plan {
			id: Uuid::new_v4(),
			customer_id: customer.to_string(),
			plan_type: PlanType::Residential,
			provider: strng::literal!("vendor-a"),
			region: strng::literal!("usa"),
			plan_type_key: plan_type_key("vendor-a", "usa", PlanType::Residential),
			username: "u".into(),
			password: "p".into(),
			bandwidth_gb: 10,
			status: PlanStatus::Creating,
			upstream_account_id: None,
			expires_at: now + chrono::Duration::days(30),
			created_at: now,
			updated_at: now,
		}
	}

	fn instance(plan: &Plan, port: u16) -> Instance {
		let now = Utc::now();
		Instance {
			id: Uuid::new_v4(),
			plan_id: plan.id,
			plan_type_key: plan.plan_type_key.clone(),
			local_port: port,
			upstream_host: "up.example.net".into(),
			upstream_port: 8000,
			pid: 0,
			status: InstanceStatus::Starting,
			created_at: now,
			updated_at: now,
		}
	}

	#[test]
	fn survives_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let p = plan("c1");
		let i = instance(&p, 10000);
		{
			let store = FileStore::open(dir.path()).unwrap();
			store.insert_plan(p.clone()).unwrap();
			store.insert_instance(i.clone()).unwrap();
		}
		let store = FileStore::open(dir.path()).unwrap();
		assert_eq!(store.plan(p.id).unwrap().customer_id, "c1");
		assert_eq!(store.instance_by_port(10000).unwrap().id, i.id);
	}

	#[test]
	fn duplicate_insert_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::open(dir.path()).unwrap();
		let p = plan("c1");
		store.insert_plan(p.clone()).unwrap();
		assert!(matches!(
			store.insert_plan(p),
			Err(StoreError::Duplicate(_))
		));
	}

	#[test]
	fn expiry_query_only_matches_active() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::open(dir.path()).unwrap();
		let mut expired = plan("c1");
		expired.status = PlanStatus::Active;
		expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
		let mut fresh = plan("c2");
		fresh.status = PlanStatus::Active;
		let mut dead = plan("c3");
		dead.status = PlanStatus::Expired;
		dead.expires_at = Utc::now() - chrono::Duration::days(1);
		store.insert_plan(expired.clone()).unwrap();
		store.insert_plan(fresh).unwrap();
		store.insert_plan(dead).unwrap();
		let due = store.plans_expired_before(Utc::now());
		assert_eq!(due.len(), 1);
		assert_eq!(due[0].id, expired.id);
	}

	#[test]
	fn export_import_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let store = FileStore::open(dir.path()).unwrap();
		let p = plan("c1");
		store.insert_plan(p.clone()).unwrap();
		store.insert_instance(instance(&p, 10001)).unwrap();
		let exported = store.export();

		let dir2 = tempfile::tempdir().unwrap();
		let other = FileStore::open(dir2.path()).unwrap();
		other.import(exported.clone()).unwrap();
		let reexported = other.export();
		assert_eq!(
			serde_json::to_value(&exported).unwrap(),
			serde_json::to_value(&reexported).unwrap()
		);
	}
}
