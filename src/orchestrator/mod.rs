pub mod endpoint;

use std::collections::HashMap;

use chrono::Utc;
pub use endpoint::{ProxyEndpoint, customer_endpoints};
use ocean_core::prelude::*;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::edge::{EdgeError, EdgeReconciler};
use crate::forwarder::{ForwarderSupervisor, SupervisorError};
use crate::ports::{PortAllocator, PortError};
use crate::provider::{Account, AccountRequest, ProviderError, Registry};
use crate::store::{Store, StoreError};
use crate::types::{
	Catalog, Instance, InstanceStatus, Plan, PlanRequest, PlanStatus, PlanType,
};

/// Duration applied when a plan request does not specify one.
pub const DEFAULT_PLAN_DURATION_DAYS: u32 = 30;

#[derive(thiserror::Error, Debug)]
pub enum PlanError {
	#[error("no plan offering for {provider}/{region}/{plan_type}")]
	UnsupportedConfiguration {
		provider: Strng,
		region: Strng,
		plan_type: PlanType,
	},
	#[error("username and password are required for this provider")]
	MissingCredentials,
	#[error("region {0} is not configured")]
	RegionNotConfigured(Strng),
	#[error("plan not found")]
	PlanNotFound,
	#[error("proxy instance not found")]
	InstanceNotFound,
	#[error(transparent)]
	Provider(#[from] ProviderError),
	#[error(transparent)]
	Ports(#[from] PortError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("forwarder error: {0}")]
	Supervisor(#[from] SupervisorError),
	#[error("edge error: {0}")]
	Edge(#[from] EdgeError),
	#[error("plan creation cancelled")]
	Cancelled,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
	pub domain: String,
	pub provider_timeout: Duration,
	pub saga_timeout: Duration,
}

#[derive(Debug)]
pub struct PlanCreated {
	pub plan: Plan,
	pub endpoints: Vec<ProxyEndpoint>,
}

/// Drives the plan lifecycle across the upstream vendor, the port pool, the
/// forwarder supervisor, and the edge config. Creation is a saga: every step
/// that commits state records enough to unwind it, and the unwind runs in
/// reverse on failure. All mutations for one plan are serialized through a
/// per-plan lock.
pub struct PlanOrchestrator {
	catalog: Arc<Catalog>,
	store: Arc<dyn Store>,
	ports: Arc<PortAllocator>,
	providers: Arc<Registry>,
	supervisor: Arc<ForwarderSupervisor>,
	edge: Arc<EdgeReconciler>,
	cfg: OrchestratorConfig,
	locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl PlanOrchestrator {
	pub fn new(
		catalog: Arc<Catalog>,
		store: Arc<dyn Store>,
		ports: Arc<PortAllocator>,
		providers: Arc<Registry>,
		supervisor: Arc<ForwarderSupervisor>,
		edge: Arc<EdgeReconciler>,
		cfg: OrchestratorConfig,
	) -> Self {
		PlanOrchestrator {
			catalog,
			store,
			ports,
			providers,
			supervisor,
			edge,
			cfg,
			locks: Mutex::new(HashMap::new()),
		}
	}

	pub fn catalog(&self) -> &Catalog {
		&self.catalog
	}

	async fn lock_plan(&self, id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
		let lock = self
			.locks
			.lock()
			.entry(id)
			.or_insert_with(|| Arc::new(AsyncMutex::new(())))
			.clone();
		lock.lock_owned().await
	}

	pub async fn create_plan(
		&self,
		req: PlanRequest,
		cancel: CancellationToken,
	) -> Result<PlanCreated, PlanError> {
		// The saga deadline cancels in-flight steps rather than dropping the
		// future, so compensations still run.
		let cancel = cancel.child_token();
		let deadline = cancel.clone();
		let saga_timeout = self.cfg.saga_timeout;
		let timer = tokio::spawn(async move {
			tokio::time::sleep(saga_timeout).await;
			deadline.cancel();
		});
		let res = self.create_plan_inner(req, &cancel).await;
		timer.abort();
		res
	}

	async fn create_plan_inner(
		&self,
		req: PlanRequest,
		cancel: &CancellationToken,
	) -> Result<PlanCreated, PlanError> {
		// Step 1: resolve the plan-type key. No side effects yet.
		let entry = self
			.catalog
			.resolve(&req.provider, &req.region, req.plan_type)
			.cloned()
			.ok_or_else(|| PlanError::UnsupportedConfiguration {
				provider: req.provider.clone(),
				region: req.region.clone(),
				plan_type: req.plan_type,
			})?;
		let key = entry.key();
		let provider = self.providers.get(&req.provider)?;

		// Step 2: the vendor either generates credentials or requires both.
		let (username, password) = if provider.chooses_credentials() {
			(String::new(), String::new())
		} else {
			match (req.username.as_deref(), req.password.as_deref()) {
				(Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u.to_string(), p.to_string()),
				_ => return Err(PlanError::MissingCredentials),
			}
		};
		let duration_days = req.duration.unwrap_or(DEFAULT_PLAN_DURATION_DAYS);

		// Step 3: persist the plan in creating state.
		let now = Utc::now();
		let mut plan = Plan {
			id: Uuid::new_v4(),
			customer_id: req.customer_id.clone(),
			plan_type: req.plan_type,
			provider: req.provider.clone(),
			region: req.region.clone(),
			plan_type_key: key.clone(),
			username,
			password,
			bandwidth_gb: req.bandwidth,
			status: PlanStatus::Creating,
			upstream_account_id: None,
			expires_at: now + chrono::Duration::days(i64::from(duration_days)),
			created_at: now,
			updated_at: now,
		};
		self.store.insert_plan(plan.clone())?;
		let _guard = self.lock_plan(plan.id).await;
		info!(plan = %plan.id, %key, customer = %plan.customer_id, "plan creation started");

		// Step 4: create the vendor account. The first committed external
		// effect; everything from here on unwinds through fail_plan.
		let account_req = AccountRequest {
			plan_type: req.plan_type,
			region: req.region.clone(),
			username: req.username.clone(),
			password: req.password.clone(),
			bandwidth_gb: req.bandwidth,
			duration_days,
		};
		let created = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				self.fail_plan(&mut plan, None, None, None).await;
				return Err(PlanError::Cancelled);
			},
			r = tokio::time::timeout(self.cfg.provider_timeout, provider.create_account(&account_req)) => {
				match r {
					Ok(r) => r,
					Err(_) => Err(ProviderError::Unreachable("vendor deadline exceeded".into())),
				}
			},
		};
		let account = match created {
			Ok(a) => a,
			Err(e) => {
				warn!(plan = %plan.id, "vendor account creation failed: {e}");
				self.fail_plan(&mut plan, None, None, None).await;
				return Err(e.into());
			},
		};

		// Step 5: the returned credentials are authoritative.
		plan.username = account.username.clone();
		plan.password = account.password.clone();
		plan.upstream_account_id = Some(account.id.clone());
		plan.touch();
		if let Err(e) = self.store.update_plan(plan.clone()) {
			self.fail_plan(&mut plan, Some(&account), None, None).await;
			return Err(e.into());
		}

		if cancel.is_cancelled() {
			self.fail_plan(&mut plan, Some(&account), None, None).await;
			return Err(PlanError::Cancelled);
		}

		// Step 6: allocate the local port.
		let port = match self.ports.allocate(&key, plan.id) {
			Ok(p) => p,
			Err(e @ PortError::NoPortsAvailable(_)) => {
				// Port exhaustion leaves nothing behind: the account is
				// deleted and the creating plan record is removed outright.
				warn!(plan = %plan.id, %key, "port pool exhausted");
				self.delete_account_best_effort(&plan, &account).await;
				if let Err(del) = self.store.delete_plan(plan.id) {
					warn!(plan = %plan.id, "failed to remove plan record: {del}");
				}
				return Err(e.into());
			},
			Err(e) => {
				self.fail_plan(&mut plan, Some(&account), None, None).await;
				return Err(e.into());
			},
		};

		// Step 7: persist the instance in starting state.
		let instance = Instance {
			id: Uuid::new_v4(),
			plan_id: plan.id,
			plan_type_key: key.clone(),
			local_port: port,
			upstream_host: account.host.clone(),
			upstream_port: account.port,
			pid: 0,
			status: InstanceStatus::Starting,
			created_at: now,
			updated_at: now,
		};
		if let Err(e) = self.store.insert_instance(instance.clone()) {
			self.fail_plan(&mut plan, Some(&account), Some((&key, port)), None)
				.await;
			return Err(e.into());
		}

		if cancel.is_cancelled() {
			self
				.fail_plan(&mut plan, Some(&account), Some((&key, port)), Some(&instance))
				.await;
			return Err(PlanError::Cancelled);
		}

		// Step 8: start the forwarder. Non-fatal: the recovery loop retries
		// failed instances, so the customer still gets their plan. Like the
		// vendor call, the await is raced against the saga deadline so a hung
		// spawn cannot pin the handler.
		let started = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				// The spawn may have landed before the cancel; reap it if so.
				match self.supervisor.stop(instance.id).await {
					Ok(()) | Err(SupervisorError::NotRunning(_)) => {},
					Err(e) => warn!(instance = %instance.id, "failed to stop forwarder after cancel: {e}"),
				}
				self
					.fail_plan(&mut plan, Some(&account), Some((&key, port)), Some(&instance))
					.await;
				return Err(PlanError::Cancelled);
			},
			r = self.supervisor.start(&instance, &plan.username, &plan.password) => r,
		};
		if let Err(e) = started {
			warn!(plan = %plan.id, instance = %instance.id, "forwarder start failed, recovery loop will retry: {e}");
		}

		// Step 9: register the edge member. Also non-fatal; the operator can
		// regenerate the edge config. Raced against the deadline as well.
		let registered = tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				match self.supervisor.stop(instance.id).await {
					Ok(()) | Err(SupervisorError::NotRunning(_)) => {},
					Err(e) => warn!(instance = %instance.id, "failed to stop forwarder after cancel: {e}"),
				}
				if let Err(e) = self.edge.remove_member(&key, port).await {
					warn!(plan = %plan.id, port, "failed to remove edge member after cancel: {e}");
				}
				self
					.fail_plan(&mut plan, Some(&account), Some((&key, port)), Some(&instance))
					.await;
				return Err(PlanError::Cancelled);
			},
			r = self.edge.add_member(&key, port) => r,
		};
		if let Err(e) = registered {
			warn!(plan = %plan.id, port, "edge registration failed: {e}");
		}

		// Step 10: the plan is live.
		plan.status = PlanStatus::Active;
		plan.touch();
		if let Err(e) = self.store.update_plan(plan.clone()) {
			self
				.fail_plan(&mut plan, Some(&account), Some((&key, port)), Some(&instance))
				.await;
			return Err(e.into());
		}

		// Step 11: the customer endpoint.
		let endpoints = customer_endpoints(&self.catalog, &self.cfg.domain, &plan)?;
		info!(plan = %plan.id, port, "plan active");
		Ok(PlanCreated { plan, endpoints })
	}

	/// Reverse-order compensation for a failed create: remove the instance
	/// record, return the port, delete the vendor account, and leave the plan
	/// persisted as failed. Each step is idempotent; the recovery loop may
	/// run the same cleanup again after a crash.
	async fn fail_plan(
		&self,
		plan: &mut Plan,
		account: Option<&Account>,
		port: Option<(&Strng, u16)>,
		instance: Option<&Instance>,
	) {
		if let Some(instance) = instance {
			if let Err(e) = self.store.delete_instance(instance.id) {
				warn!(plan = %plan.id, instance = %instance.id, "compensation failed to delete instance: {e}");
			}
		}
		if let Some((key, port)) = port {
			if let Err(e) = self.ports.release(key, port) {
				warn!(plan = %plan.id, port, "compensation failed to release port: {e}");
			}
		}
		if let Some(account) = account {
			self.delete_account_best_effort(plan, account).await;
		}
		plan.status = PlanStatus::Failed;
		plan.touch();
		if let Err(e) = self.store.update_plan(plan.clone()) {
			warn!(plan = %plan.id, "failed to persist failed plan: {e}");
		}
	}

	async fn delete_account_best_effort(&self, plan: &Plan, account: &Account) {
		let Ok(provider) = self.providers.get(&plan.provider) else {
			return;
		};
		if let Err(e) = provider.delete_account(&account.id).await {
			warn!(plan = %plan.id, account = %account.id, "failed to delete vendor account: {e}");
		}
	}

	pub fn get_plan(&self, id: Uuid) -> Result<Plan, PlanError> {
		self.store.plan(id).ok_or(PlanError::PlanNotFound)
	}

	pub fn list_plans(&self, customer_id: Option<&str>) -> Vec<Plan> {
		match customer_id {
			Some(c) => self.store.plans_by_customer(c),
			None => self.store.plans(),
		}
	}

	/// Tear a plan down completely: every child instance is stopped, its port
	/// released and edge entry removed, then the records and the vendor
	/// account go. Per-instance failures are logged and do not abort the rest
	/// of the cleanup.
	pub async fn delete_plan(&self, id: Uuid) -> Result<(), PlanError> {
		let _guard = self.lock_plan(id).await;
		let plan = self.store.plan(id).ok_or(PlanError::PlanNotFound)?;
		info!(plan = %id, "deleting plan");
		for instance in self.store.instances_by_plan(id) {
			self.teardown_instance(&instance, true).await;
		}
		if let Some(account_id) = &plan.upstream_account_id {
			if let Ok(provider) = self.providers.get(&plan.provider) {
				if let Err(e) = provider.delete_account(account_id).await {
					warn!(plan = %id, account = %account_id, "failed to delete vendor account: {e}");
				}
			}
		}
		self.store.delete_plan(id)?;
		self.locks.lock().remove(&id);
		Ok(())
	}

	/// Stop one instance and release its resources. With `delete_record` the
	/// instance row is removed too (plan deletion); otherwise it is kept as a
	/// stopped record (expiry).
	async fn teardown_instance(&self, instance: &Instance, delete_record: bool) {
		match self.supervisor.stop(instance.id).await {
			Ok(()) | Err(SupervisorError::NotRunning(_)) => {},
			Err(e) => warn!(instance = %instance.id, "failed to stop forwarder: {e}"),
		}
		match self
			.ports
			.release(&instance.plan_type_key, instance.local_port)
		{
			Ok(()) | Err(PortError::NotAllocated(_, _)) => {},
			Err(e) => warn!(instance = %instance.id, "failed to release port: {e}"),
		}
		if let Err(e) = self
			.edge
			.remove_member(&instance.plan_type_key, instance.local_port)
			.await
		{
			warn!(instance = %instance.id, "failed to remove edge member: {e}");
		}
		if delete_record {
			if let Err(e) = self.store.delete_instance(instance.id) {
				warn!(instance = %instance.id, "failed to delete instance record: {e}");
			}
		}
	}

	/// One expiration pass: every active plan past its expiry is marked
	/// expired and its instances are wound down. Idempotent; safe to rerun.
	pub async fn expire_due(&self) -> usize {
		let due = self.store.plans_expired_before(Utc::now());
		let mut expired = 0;
		for plan in due {
			let _guard = self.lock_plan(plan.id).await;
			// Re-check under the lock; a concurrent delete may have won.
			let Some(mut plan) = self.store.plan(plan.id) else {
				continue;
			};
			if plan.status != PlanStatus::Active || plan.expires_at >= Utc::now() {
				continue;
			}
			info!(plan = %plan.id, "plan expired");
			plan.status = PlanStatus::Expired;
			plan.touch();
			if let Err(e) = self.store.update_plan(plan.clone()) {
				warn!(plan = %plan.id, "failed to persist expiry: {e}");
				continue;
			}
			for instance in self.store.instances_by_plan(plan.id) {
				self.teardown_instance(&instance, false).await;
			}
			expired += 1;
		}
		expired
	}

	pub fn get_instance(&self, id: Uuid) -> Result<Instance, PlanError> {
		self.store.instance(id).ok_or(PlanError::InstanceNotFound)
	}

	pub fn list_instances(
		&self,
		status: Option<InstanceStatus>,
		plan_id: Option<Uuid>,
	) -> Vec<Instance> {
		let mut instances = match status {
			Some(s) => self.store.instances_by_status(s),
			None => self.store.instances(),
		};
		if let Some(plan_id) = plan_id {
			instances.retain(|i| i.plan_id == plan_id);
		}
		instances
	}

	pub async fn start_instance(&self, id: Uuid) -> Result<(), PlanError> {
		let instance = self.store.instance(id).ok_or(PlanError::InstanceNotFound)?;
		let plan = self
			.store
			.plan(instance.plan_id)
			.ok_or(PlanError::PlanNotFound)?;
		let _guard = self.lock_plan(plan.id).await;
		self
			.supervisor
			.start(&instance, &plan.username, &plan.password)
			.await?;
		Ok(())
	}

	pub async fn stop_instance(&self, id: Uuid) -> Result<(), PlanError> {
		let instance = self.store.instance(id).ok_or(PlanError::InstanceNotFound)?;
		let _guard = self.lock_plan(instance.plan_id).await;
		self.supervisor.stop(id).await?;
		Ok(())
	}

	pub async fn restart_instance(&self, id: Uuid) -> Result<(), PlanError> {
		let instance = self.store.instance(id).ok_or(PlanError::InstanceNotFound)?;
		let plan = self
			.store
			.plan(instance.plan_id)
			.ok_or(PlanError::PlanNotFound)?;
		let _guard = self.lock_plan(plan.id).await;
		self
			.supervisor
			.restart(id, &plan.username, &plan.password)
			.await?;
		Ok(())
	}

	pub fn instance_status(&self, id: Uuid) -> Result<InstanceStatus, PlanError> {
		Ok(self.supervisor.get_status(id)?)
	}
}

#[cfg(test)]
mod tests;
