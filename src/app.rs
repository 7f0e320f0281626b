use ocean_core::prelude::*;
use ocean_core::readiness;
use ocean_core::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::edge::{EdgeReconciler, NginxReload};
use crate::forwarder::{ForwarderSupervisor, SupervisorConfig, process_alive};
use crate::loops;
use crate::management::{ApiState, router};
use crate::orchestrator::{OrchestratorConfig, PlanOrchestrator};
use crate::ports::PortAllocator;
use crate::provider::{Registry, vendor_a, vendor_b};
use crate::store::{FileStore, Store};
use crate::types::PlanStatus;
use crate::Config;

pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let cancel = CancellationToken::new();
	let ready = readiness::Ready::new();
	let recover_task = ready.register_task("state recovery");
	let api_task = ready.register_task("api server");

	let catalog = Arc::new(config.catalog.clone());
	let store: Arc<FileStore> = Arc::new(FileStore::open(&config.state_dir)?);
	let store_dyn: Arc<dyn Store> = store.clone();
	let ports = Arc::new(PortAllocator::new(&catalog));

	let mut registry = Registry::new();
	if let Some(cfg) = &config.vendor_a {
		registry.register(Arc::new(vendor_a::Provider::new(cfg.clone())));
	}
	if let Some(cfg) = &config.vendor_b {
		registry.register(Arc::new(vendor_b::Provider::new(cfg.clone())));
	}
	let registry = Arc::new(registry);

	let supervisor = Arc::new(ForwarderSupervisor::new(
		SupervisorConfig {
			forwarder_bin: config.forwarder_bin.clone(),
			config_dir: config.config_dir.clone(),
			log_dir: config.log_dir.clone(),
			probe_url: config.probe_url.clone(),
			probe_delay: config.probe_delay,
			stop_grace: config.stop_grace,
		},
		store_dyn.clone(),
	));
	let edge = Arc::new(EdgeReconciler::new(
		config.nginx_conf_dir.clone(),
		catalog.clone(),
		Arc::new(NginxReload),
	));
	let orchestrator = Arc::new(PlanOrchestrator::new(
		catalog,
		store_dyn.clone(),
		ports.clone(),
		registry,
		supervisor.clone(),
		edge.clone(),
		OrchestratorConfig {
			domain: config.domain.clone(),
			provider_timeout: config.provider_timeout,
			saga_timeout: config.saga_timeout,
		},
	));

	reconcile_on_startup(&store_dyn, &ports, &supervisor, &edge).await;
	drop(recover_task);

	let loop_handles = loops::spawn_all(
		orchestrator.clone(),
		store_dyn.clone(),
		supervisor.clone(),
		config.loops.clone(),
		cancel.clone(),
	);

	let state = ApiState {
		orchestrator,
		store: store_dyn,
		edge,
		ready: ready.clone(),
		bearer_token: config.bearer_token.clone(),
	};
	let listener = tokio::net::TcpListener::bind(config.api_addr)
		.await
		.context("api server binds")?;
	info!(address = %config.api_addr, "api server listening");
	let server_cancel = cancel.clone();
	let server = tokio::spawn(async move {
		let serve = axum::serve(listener, router(state))
			.with_graceful_shutdown(async move { server_cancel.cancelled().await });
		if let Err(e) = serve.await {
			error!("api server exited: {e}");
		}
	});
	drop(api_task);

	Ok(Bound {
		shutdown,
		cancel,
		server,
		loop_handles,
		supervisor,
	})
}

/// After a restart, drive recorded state back to reality: re-claim ports of
/// live instances, restart the dead ones that belong to active plans, and
/// make sure every live port is in its edge pool. Anything that cannot be
/// repaired here is left to the background loops.
async fn reconcile_on_startup(
	store: &Arc<dyn Store>,
	ports: &PortAllocator,
	supervisor: &ForwarderSupervisor,
	edge: &EdgeReconciler,
) {
	ports.restore(&store.instances());
	for plan in store.plans_by_status(PlanStatus::Active) {
		for instance in store.instances_by_plan(plan.id) {
			if instance.pid != 0 && process_alive(instance.pid) {
				if let Err(e) = edge.add_member(&instance.plan_type_key, instance.local_port).await {
					warn!(instance = %instance.id, "startup edge repair failed: {e}");
				}
				continue;
			}
			if let Err(e) = ports.claim(&instance.plan_type_key, instance.local_port, plan.id) {
				warn!(instance = %instance.id, "cannot re-adopt port: {e}");
				continue;
			}
			info!(instance = %instance.id, port = instance.local_port, "restarting forwarder for active plan");
			if let Err(e) = supervisor
				.start(&instance, &plan.username, &plan.password)
				.await
			{
				warn!(instance = %instance.id, "startup restart failed, recovery loop will retry: {e}");
			}
			if let Err(e) = edge.add_member(&instance.plan_type_key, instance.local_port).await {
				warn!(instance = %instance.id, "startup edge repair failed: {e}");
			}
		}
	}
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	cancel: CancellationToken,
	server: JoinHandle<()>,
	loop_handles: Vec<JoinHandle<()>>,
	supervisor: Arc<ForwarderSupervisor>,
}

impl Bound {
	/// Block until SIGTERM/SIGINT (or an explicit trigger), then wind down:
	/// stop the loops and API, and reap every child forwarder.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		self.shutdown.wait().await;
		self.cancel.cancel();
		let _ = self.server.await;
		for handle in self.loop_handles {
			let _ = handle.await;
		}
		self.supervisor.stop_all().await;
		info!("shutdown complete");
		Ok(())
	}
}
