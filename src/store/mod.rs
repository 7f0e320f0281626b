mod file;

use chrono::{DateTime, Utc};
pub use file::FileStore;
use uuid::Uuid;

use crate::types::{Instance, InstanceStatus, Plan, PlanStatus};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("plan {0} not found")]
	PlanNotFound(Uuid),
	#[error("instance {0} not found")]
	InstanceNotFound(Uuid),
	#[error("duplicate id {0}")]
	Duplicate(Uuid),
	#[error("persistence failed: {0}")]
	Io(#[from] std::io::Error),
	#[error("corrupt state file {0}: {1}")]
	Corrupt(String, serde_json::Error),
}

/// Durable record of plans and instances. The store is the serialization
/// point for all durable state; callers never hold references into it.
pub trait Store: Send + Sync + 'static {
	fn insert_plan(&self, plan: Plan) -> Result<(), StoreError>;
	fn update_plan(&self, plan: Plan) -> Result<(), StoreError>;
	fn delete_plan(&self, id: Uuid) -> Result<(), StoreError>;
	fn plan(&self, id: Uuid) -> Option<Plan>;
	fn plans(&self) -> Vec<Plan>;
	fn plans_by_customer(&self, customer_id: &str) -> Vec<Plan>;
	fn plans_by_status(&self, status: PlanStatus) -> Vec<Plan>;
	/// Active plans whose expiry is strictly before `t`.
	fn plans_expired_before(&self, t: DateTime<Utc>) -> Vec<Plan>;

	fn insert_instance(&self, instance: Instance) -> Result<(), StoreError>;
	fn update_instance(&self, instance: Instance) -> Result<(), StoreError>;
	fn delete_instance(&self, id: Uuid) -> Result<(), StoreError>;
	fn instance(&self, id: Uuid) -> Option<Instance>;
	fn instances(&self) -> Vec<Instance>;
	fn instances_by_plan(&self, plan_id: Uuid) -> Vec<Instance>;
	fn instances_by_status(&self, status: InstanceStatus) -> Vec<Instance>;
	fn instance_by_port(&self, port: u16) -> Option<Instance>;
}

/// Whole-state snapshot, used for export/import and operator backup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateExport {
	pub plans: Vec<Plan>,
	pub instances: Vec<Instance>,
}
