use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use ocean_core::prelude::*;

use crate::edge::EdgeReconciler;
use crate::edge::tests::RecordingHook;
use crate::forwarder::{ForwarderSupervisor, SupervisorConfig};
use crate::orchestrator::{OrchestratorConfig, PlanOrchestrator};
use crate::ports::PortAllocator;
use crate::provider::{Account, AccountRequest, ProviderClient, ProviderError, Registry};
use crate::store::FileStore;
use crate::types::{Catalog, PlanType, PlanTypeEntry, RegionEntry, plan_type_key};

/// In-memory vendor double: hands out accounts and records deletions.
pub(crate) struct FakeProvider {
	pub tag: Strng,
	pub chooses: bool,
	pub fail_create: AtomicBool,
	pub deleted: parking_lot::Mutex<Vec<String>>,
}

impl FakeProvider {
	pub fn new(tag: &str, chooses: bool) -> Arc<Self> {
		Arc::new(FakeProvider {
			tag: strng::new(tag),
			chooses,
			fail_create: AtomicBool::new(false),
			deleted: parking_lot::Mutex::new(vec![]),
		})
	}
}

#[async_trait]
impl ProviderClient for FakeProvider {
	fn name(&self) -> Strng {
		self.tag.clone()
	}

	fn chooses_credentials(&self) -> bool {
		self.chooses
	}

	async fn create_account(&self, req: &AccountRequest) -> Result<Account, ProviderError> {
		if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
			return Err(ProviderError::Unreachable("vendor down".into()));
		}
		let (username, password) = if self.chooses {
			("vendor_u".to_string(), "vendor_p".to_string())
		} else {
			(
				req.username.clone().unwrap_or_default(),
				req.password.clone().unwrap_or_default(),
			)
		};
		Ok(Account {
			id: format!("acc-{}", req.region),
			username,
			password,
			host: "up.example.net".into(),
			port: 8000,
			region: req.region.clone(),
		})
	}

	async fn get_account(&self, id: &str) -> Result<Account, ProviderError> {
		Ok(Account {
			id: id.to_string(),
			username: "vendor_u".into(),
			password: "vendor_p".into(),
			host: "up.example.net".into(),
			port: 8000,
			region: strng::literal!("usa"),
		})
	}

	async fn delete_account(&self, id: &str) -> Result<(), ProviderError> {
		self.deleted.lock().push(id.to_string());
		Ok(())
	}

	async fn test_account(&self, _account: &Account) -> Result<(), ProviderError> {
		Ok(())
	}
}

/// A stand-in forwarder binary: ignores its config argument and stays alive.
pub(crate) fn fake_forwarder(dir: &std::path::Path) -> PathBuf {
	let path = dir.join("fake-forwarder");
	fs_err::write(&path, "#!/bin/sh\nsleep 300\n").unwrap();
	let mut perm = fs_err::metadata(&path).unwrap().permissions();
	perm.set_mode(0o755);
	fs_err::set_permissions(&path, perm).unwrap();
	path
}

pub(crate) fn catalog() -> Catalog {
	let res_key = plan_type_key("vendor-a", "usa", PlanType::Residential);
	let dc_key = plan_type_key("vendor-a", "usa", PlanType::Datacenter);
	let b_key = plan_type_key("vendor-b", "alpha", PlanType::Residential);
	Catalog::new(
		vec![
			PlanTypeEntry {
				provider: strng::literal!("vendor-a"),
				region: strng::literal!("usa"),
				plan_type: PlanType::Residential,
				upstream_host: "usa.res.vendor-a.io".into(),
				upstream_port: 8000,
				port_start: 10000,
				port_end: 11999,
				outbound_port: 1337,
				pool: res_key.clone(),
			},
			PlanTypeEntry {
				provider: strng::literal!("vendor-a"),
				region: strng::literal!("usa"),
				plan_type: PlanType::Datacenter,
				upstream_host: "dc.vendor-a.io".into(),
				upstream_port: 8100,
				// Deliberately tiny so exhaustion is cheap to arrange.
				port_start: 12000,
				port_end: 12000,
				outbound_port: 1337,
				pool: dc_key.clone(),
			},
			PlanTypeEntry {
				provider: strng::literal!("vendor-b"),
				region: strng::literal!("alpha"),
				plan_type: PlanType::Residential,
				upstream_host: "gate.vendor-b.net".into(),
				upstream_port: 9000,
				port_start: 13000,
				port_end: 13999,
				outbound_port: 2020,
				pool: b_key.clone(),
			},
		],
		vec![
			RegionEntry {
				name: strng::literal!("usa"),
				outbound_port: 1337,
				plan_types: vec![res_key, dc_key],
				conf_file: "usa.conf".into(),
			},
			RegionEntry {
				name: strng::literal!("alpha"),
				outbound_port: 2020,
				plan_types: vec![b_key],
				conf_file: "alpha.conf".into(),
			},
		],
	)
	.unwrap()
}

pub(crate) struct Harness {
	pub _dir: tempfile::TempDir,
	pub orch: Arc<PlanOrchestrator>,
	pub store: Arc<FileStore>,
	pub ports: Arc<PortAllocator>,
	pub supervisor: Arc<ForwarderSupervisor>,
	pub edge: Arc<EdgeReconciler>,
	pub vendor_a: Arc<FakeProvider>,
	pub vendor_b: Arc<FakeProvider>,
	pub edge_dir: PathBuf,
}

impl Harness {
	pub fn edge_file(&self, name: &str) -> String {
		fs_err::read_to_string(self.edge_dir.join(name)).unwrap_or_default()
	}
}

pub(crate) fn harness() -> Harness {
	let dir = tempfile::tempdir().unwrap();
	let catalog = Arc::new(catalog());
	let store = Arc::new(FileStore::open(dir.path().join("state")).unwrap());
	let ports = Arc::new(PortAllocator::new(&catalog));
	let vendor_a = FakeProvider::new("vendor-a", false);
	let vendor_b = FakeProvider::new("vendor-b", true);
	let mut registry = Registry::new();
	registry.register(vendor_a.clone());
	registry.register(vendor_b.clone());
	let supervisor = Arc::new(ForwarderSupervisor::new(
		SupervisorConfig {
			forwarder_bin: fake_forwarder(dir.path()),
			config_dir: dir.path().join("conf"),
			log_dir: dir.path().join("log"),
			probe_url: "http://127.0.0.1:1/".into(),
			probe_delay: Duration::from_secs(60),
			stop_grace: Duration::from_secs(2),
		},
		store.clone(),
	));
	let edge_dir = dir.path().join("edge");
	let edge = Arc::new(EdgeReconciler::new(
		edge_dir.clone(),
		catalog.clone(),
		RecordingHook::new(),
	));
	let orch = Arc::new(PlanOrchestrator::new(
		catalog,
		store.clone(),
		ports.clone(),
		Arc::new(registry),
		supervisor.clone(),
		edge.clone(),
		OrchestratorConfig {
			domain: "example.io".into(),
			provider_timeout: Duration::from_secs(5),
			saga_timeout: Duration::from_secs(30),
		},
	));
	Harness {
		_dir: dir,
		orch,
		store,
		ports,
		supervisor,
		edge,
		vendor_a,
		vendor_b,
		edge_dir,
	}
}
