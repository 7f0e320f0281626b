use std::collections::HashMap;

use ocean_core::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::forwarder::ForwarderSupervisor;
use crate::orchestrator::PlanOrchestrator;
use crate::store::Store;
use crate::types::InstanceStatus;

#[derive(Debug, Clone)]
pub struct LoopConfig {
	pub sweep_interval: Duration,
	pub recovery_interval: Duration,
	pub health_interval: Duration,
	pub recovery_backoff_base: Duration,
	pub recovery_backoff_cap: Duration,
	/// After this many consecutive restart failures the instance is left in
	/// failed for operator attention.
	pub recovery_max_failures: u32,
	/// Consecutive health-check failures before a running instance is
	/// demoted to failed.
	pub health_failure_threshold: u32,
}

impl Default for LoopConfig {
	fn default() -> Self {
		LoopConfig {
			sweep_interval: Duration::from_secs(60),
			recovery_interval: Duration::from_secs(10),
			health_interval: Duration::from_secs(30),
			recovery_backoff_base: Duration::from_secs(2),
			recovery_backoff_cap: Duration::from_secs(300),
			recovery_max_failures: 5,
			health_failure_threshold: 3,
		}
	}
}

/// Spawn the three reconciliation loops. Each drives the stored intent
/// towards reality and is idempotent per pass, so overlap with the saga or a
/// crashed predecessor is harmless.
pub fn spawn_all(
	orchestrator: Arc<PlanOrchestrator>,
	store: Arc<dyn Store>,
	supervisor: Arc<ForwarderSupervisor>,
	cfg: LoopConfig,
	cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
	let expiry = {
		let orchestrator = orchestrator.clone();
		let cancel = cancel.clone();
		let interval = cfg.sweep_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = ticker.tick() => {},
				}
				let expired = orchestrator.expire_due().await;
				if expired > 0 {
					info!(expired, "expiration sweep finished");
				}
			}
			debug!("expiration sweep stopped");
		})
	};

	let recovery = {
		let store = store.clone();
		let supervisor = supervisor.clone();
		let cancel = cancel.clone();
		let cfg = cfg.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(cfg.recovery_interval);
			let mut states: HashMap<Uuid, RetryState> = HashMap::new();
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = ticker.tick() => {},
				}
				recovery_pass(&store, &supervisor, &cfg, &mut states).await;
			}
			debug!("recovery loop stopped");
		})
	};

	let health = {
		let cancel = cancel.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(cfg.health_interval);
			let mut counters: HashMap<Uuid, u32> = HashMap::new();
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = ticker.tick() => {},
				}
				health_pass(&store, &supervisor, cfg.health_failure_threshold, &mut counters).await;
			}
			debug!("health loop stopped");
		})
	};

	vec![expiry, recovery, health]
}

#[derive(Debug, Default)]
struct RetryState {
	failures: u32,
	next_at: Option<Instant>,
}

fn backoff(base: Duration, cap: Duration, failures: u32) -> Duration {
	let exp = base.saturating_mul(1u32 << failures.min(16));
	exp.min(cap)
}

/// Restart failed instances with exponential backoff, giving up after the
/// configured failure budget.
async fn recovery_pass(
	store: &Arc<dyn Store>,
	supervisor: &ForwarderSupervisor,
	cfg: &LoopConfig,
	states: &mut HashMap<Uuid, RetryState>,
) {
	let failed = store.instances_by_status(InstanceStatus::Failed);
	let failed_ids: std::collections::HashSet<Uuid> = failed.iter().map(|i| i.id).collect();
	states.retain(|id, _| failed_ids.contains(id));

	for instance in failed {
		let state = states.entry(instance.id).or_default();
		if state.failures >= cfg.recovery_max_failures {
			continue;
		}
		if let Some(at) = state.next_at {
			if Instant::now() < at {
				continue;
			}
		}
		let Some(plan) = store.plan(instance.plan_id) else {
			warn!(instance = %instance.id, "failed instance has no plan, skipping");
			continue;
		};
		match supervisor
			.restart(instance.id, &plan.username, &plan.password)
			.await
		{
			Ok(()) => {
				info!(instance = %instance.id, "failed instance recovered");
				states.remove(&instance.id);
			},
			Err(e) => {
				state.failures += 1;
				let delay = backoff(cfg.recovery_backoff_base, cfg.recovery_backoff_cap, state.failures);
				state.next_at = Some(Instant::now() + delay);
				if state.failures >= cfg.recovery_max_failures {
					warn!(instance = %instance.id, "giving up on instance after {} restart failures: {e}", state.failures);
				} else {
					debug!(instance = %instance.id, ?delay, "restart failed, backing off: {e}");
				}
			},
		}
	}
}

/// Health-check running instances; repeated failures demote to failed so the
/// recovery loop takes over.
async fn health_pass(
	store: &Arc<dyn Store>,
	supervisor: &ForwarderSupervisor,
	threshold: u32,
	counters: &mut HashMap<Uuid, u32>,
) {
	let running = store.instances_by_status(InstanceStatus::Running);
	let running_ids: std::collections::HashSet<Uuid> = running.iter().map(|i| i.id).collect();
	counters.retain(|id, _| running_ids.contains(id));

	for instance in running {
		let Some(plan) = store.plan(instance.plan_id) else {
			continue;
		};
		match supervisor
			.health_check(instance.id, &plan.username, &plan.password)
			.await
		{
			Ok(()) => {
				counters.remove(&instance.id);
			},
			Err(e) => {
				let count = counters.entry(instance.id).or_default();
				*count += 1;
				warn!(instance = %instance.id, failures = *count, "health check failed: {e}");
				if *count >= threshold {
					counters.remove(&instance.id);
					if let Some(mut record) = store.instance(instance.id) {
						record.status = InstanceStatus::Failed;
						record.touch();
						if let Err(e) = store.update_instance(record) {
							warn!(instance = %instance.id, "failed to persist health demotion: {e}");
						}
					}
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::os::unix::fs::PermissionsExt;
	use std::path::PathBuf;

	use chrono::Utc;

	use super::*;
	use crate::forwarder::SupervisorConfig;
	use crate::store::FileStore;
	use crate::types::{Instance, Plan, PlanStatus, PlanType, plan_type_key};

	fn fake_forwarder(dir: &std::path::Path) -> PathBuf {
		let path = dir.join("fake-forwarder");
		fs_err::write(&path, "#!/bin/sh\nsleep 300\n").unwrap();
		let mut perm = fs_err::metadata(&path).unwrap().permissions();
		perm.set_mode(0o755);
		fs_err::set_permissions(&path, perm).unwrap();
		path
	}

	fn setup(dir: &std::path::Path, bin: PathBuf) -> (Arc<FileStore>, ForwarderSupervisor, Uuid) {
		let store = Arc::new(FileStore::open(dir.join("state")).unwrap());
		let supervisor = ForwarderSupervisor::new(
			SupervisorConfig {
				forwarder_bin: bin,
				config_dir: dir.join("conf"),
				log_dir: dir.join("log"),
				probe_url: "http://127.0.0.1:1/".into(),
				probe_delay: Duration::from_secs(60),
				stop_grace: Duration::from_secs(2),
			},
			store.clone(),
		);
		let now = Utc::now();
		let plan = Plan {
			id: Uuid::new_v4(),
			customer_id: "c1".into(),
			plan_type: PlanType::Residential,
			provider: strng::literal!("vendor-a"),
			region: strng::literal!("usa"),
			plan_type_key: plan_type_key("vendor-a", "usa", PlanType::Residential),
			username: "u".into(),
			password: "p".into(),
			bandwidth_gb: 10,
			status: PlanStatus::Active,
			upstream_account_id: None,
			expires_at: now + chrono::Duration::days(30),
			created_at: now,
			updated_at: now,
		};
		let instance = Instance {
			id: Uuid::new_v4(),
			plan_id: plan.id,
			plan_type_key: plan.plan_type_key.clone(),
			local_port: 10200,
			upstream_host: "up.example.net".into(),
			upstream_port: 8000,
			pid: 0,
			status: InstanceStatus::Failed,
			created_at: now,
			updated_at: now,
		};
		store.insert_plan(plan).unwrap();
		store.insert_instance(instance.clone()).unwrap();
		(store, supervisor, instance.id)
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let base = Duration::from_secs(2);
		let cap = Duration::from_secs(300);
		assert_eq!(backoff(base, cap, 1), Duration::from_secs(4));
		assert_eq!(backoff(base, cap, 2), Duration::from_secs(8));
		assert_eq!(backoff(base, cap, 10), cap);
	}

	#[tokio::test]
	async fn recovery_pass_restarts_failed_instances() {
		let dir = tempfile::tempdir().unwrap();
		let bin = fake_forwarder(dir.path());
		let (store, supervisor, id) = setup(dir.path(), bin);
		let store_dyn: Arc<dyn Store> = store.clone();
		let mut states = HashMap::new();

		recovery_pass(&store_dyn, &supervisor, &LoopConfig::default(), &mut states).await;

		let instance = store.instance(id).unwrap();
		assert_eq!(instance.status, InstanceStatus::Running);
		assert!(instance.pid > 0);
		assert!(states.is_empty());
		supervisor.stop(id).await.unwrap();
	}

	#[tokio::test]
	async fn recovery_pass_gives_up_after_budget() {
		let dir = tempfile::tempdir().unwrap();
		let (store, supervisor, id) = setup(dir.path(), dir.path().join("missing-bin"));
		let store_dyn: Arc<dyn Store> = store.clone();
		let cfg = LoopConfig {
			recovery_backoff_base: Duration::from_millis(0),
			recovery_max_failures: 2,
			..LoopConfig::default()
		};
		let mut states = HashMap::new();

		for _ in 0..5 {
			recovery_pass(&store_dyn, &supervisor, &cfg, &mut states).await;
		}
		assert_eq!(states.get(&id).unwrap().failures, 2);
		assert_eq!(store.instance(id).unwrap().status, InstanceStatus::Failed);
	}

	#[tokio::test]
	async fn health_pass_demotes_after_threshold() {
		let dir = tempfile::tempdir().unwrap();
		let bin = fake_forwarder(dir.path());
		let (store, supervisor, id) = setup(dir.path(), bin);
		// Pretend it is running behind a pid that cannot exist.
		let mut instance = store.instance(id).unwrap();
		instance.status = InstanceStatus::Running;
		instance.pid = 4_000_000;
		store.update_instance(instance).unwrap();
		let store_dyn: Arc<dyn Store> = store.clone();
		let mut counters = HashMap::new();

		health_pass(&store_dyn, &supervisor, 2, &mut counters).await;
		assert_eq!(store.instance(id).unwrap().status, InstanceStatus::Running);
		health_pass(&store_dyn, &supervisor, 2, &mut counters).await;
		assert_eq!(store.instance(id).unwrap().status, InstanceStatus::Failed);
	}
}
