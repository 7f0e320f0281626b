use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ocean_core::prelude::*;

use crate::types::{Catalog, Instance, InstanceStatus, PlanTypeKey, RegionEntry};

#[derive(thiserror::Error, Debug)]
pub enum EdgeError {
	#[error("unknown plan type {0}")]
	UnknownPlanType(PlanTypeKey),
	#[error("region {0} has no edge config entry")]
	UnknownRegion(Strng),
	#[error("pool {0} missing from {1}; regenerate the edge config")]
	MissingPool(Strng, String),
	#[error("edge config io: {0}")]
	Io(#[from] std::io::Error),
	#[error("edge config rejected by validator: {0}")]
	Invalid(String),
	#[error("edge reload failed: {0}")]
	Reload(String),
}

/// Validates and reloads the edge reverse proxy after config edits. Injected
/// so tests and nginx-less hosts can run without the real binary.
#[async_trait]
pub trait ReloadHook: Send + Sync + 'static {
	async fn validate(&self, conf_dir: &Path) -> anyhow::Result<()>;
	async fn reload(&self) -> anyhow::Result<()>;
}

/// Production hook: `nginx -t` to validate, then `nginx -s reload` with a
/// systemctl fallback.
pub struct NginxReload;

#[async_trait]
impl ReloadHook for NginxReload {
	async fn validate(&self, _conf_dir: &Path) -> anyhow::Result<()> {
		let out = tokio::process::Command::new("nginx")
			.arg("-t")
			.output()
			.await?;
		if !out.status.success() {
			anyhow::bail!("{}", String::from_utf8_lossy(&out.stderr));
		}
		Ok(())
	}

	async fn reload(&self) -> anyhow::Result<()> {
		let direct = tokio::process::Command::new("nginx")
			.args(["-s", "reload"])
			.output()
			.await;
		if matches!(&direct, Ok(out) if out.status.success()) {
			return Ok(());
		}
		let fallback = tokio::process::Command::new("systemctl")
			.args(["reload", "nginx"])
			.output()
			.await?;
		if !fallback.status.success() {
			anyhow::bail!("{}", String::from_utf8_lossy(&fallback.stderr));
		}
		Ok(())
	}
}

/// Keeps the edge upstream-pool files in agreement with the set of live
/// forwarder instances. Edits are line-oriented and idempotent so concurrent
/// plans touching the same region file cannot clobber each other; all
/// mutations funnel through one async lock because the reload command is not
/// re-entrant-safe.
pub struct EdgeReconciler {
	conf_dir: PathBuf,
	catalog: Arc<Catalog>,
	hook: Arc<dyn ReloadHook>,
	lock: AsyncMutex<()>,
}

impl EdgeReconciler {
	pub fn new(conf_dir: PathBuf, catalog: Arc<Catalog>, hook: Arc<dyn ReloadHook>) -> Self {
		EdgeReconciler {
			conf_dir,
			catalog,
			hook,
			lock: AsyncMutex::new(()),
		}
	}

	fn member_line(port: u16) -> String {
		format!("\tserver 127.0.0.1:{port};")
	}

	/// Add `server 127.0.0.1:<port>;` to the key's pool, creating the region
	/// file from its template when absent. Calling twice is indistinguishable
	/// from calling once.
	pub async fn add_member(&self, key: &PlanTypeKey, port: u16) -> Result<(), EdgeError> {
		let _guard = self.lock.lock().await;
		let (region, pool) = self.locate(key)?;
		let path = self.conf_dir.join(&region.conf_file);
		let content = match fs_err::read_to_string(&path) {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.render_region(&region),
			Err(e) => return Err(e.into()),
		};
		let line = Self::member_line(port);
		if content.lines().any(|l| l == line) {
			debug!(%key, port, "edge member already present");
			return Ok(());
		}
		let updated = insert_into_pool(&content, &pool, &line)
			.ok_or_else(|| EdgeError::MissingPool(pool.clone(), region.conf_file.clone()))?;
		self.commit(&path, &content, updated).await?;
		info!(%key, port, file = %region.conf_file, "edge member added");
		Ok(())
	}

	/// Remove the member line. Absent file or absent line are both fine; the
	/// file stays even when its pools end up empty.
	pub async fn remove_member(&self, key: &PlanTypeKey, port: u16) -> Result<(), EdgeError> {
		let _guard = self.lock.lock().await;
		let (region, _pool) = self.locate(key)?;
		let path = self.conf_dir.join(&region.conf_file);
		let content = match fs_err::read_to_string(&path) {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		let line = Self::member_line(port);
		if !content.lines().any(|l| l == line) {
			return Ok(());
		}
		let updated: String = content
			.lines()
			.filter(|l| *l != line)
			.map(|l| format!("{l}\n"))
			.collect();
		self.commit(&path, &content, updated).await?;
		info!(%key, port, file = %region.conf_file, "edge member removed");
		Ok(())
	}

	/// Rebuild every region file from the catalog and the given live
	/// instances. Repair path after corruption or large batch changes. The
	/// validator gate applies here too: a rejected regen puts every file back
	/// the way it was.
	pub async fn regenerate_all(&self, instances: &[Instance]) -> Result<(), EdgeError> {
		let _guard = self.lock.lock().await;
		fs_err::create_dir_all(&self.conf_dir)?;
		let mut staged: Vec<(PathBuf, Option<String>, String)> = Vec::new();
		for region in self.catalog.regions() {
			let mut content = self.render_region(region);
			for i in instances {
				if !matches!(i.status, InstanceStatus::Starting | InstanceStatus::Running) {
					continue;
				}
				let Some(entry) = self.catalog.entry(&i.plan_type_key) else {
					continue;
				};
				if !region.plan_types.contains(&i.plan_type_key) {
					continue;
				}
				content = insert_into_pool(&content, &entry.pool, &Self::member_line(i.local_port))
					.unwrap_or(content);
			}
			let path = self.conf_dir.join(&region.conf_file);
			let previous = match fs_err::read_to_string(&path) {
				Ok(c) => Some(c),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
				Err(e) => return Err(e.into()),
			};
			staged.push((path, previous, content));
		}
		for (path, _, content) in &staged {
			fs_err::write(path, content)?;
		}
		if let Err(e) = self.hook.validate(&self.conf_dir).await {
			self.restore(&staged);
			return Err(EdgeError::Invalid(e.to_string()));
		}
		self
			.hook
			.reload()
			.await
			.map_err(|e| EdgeError::Reload(e.to_string()))?;
		info!("edge config regenerated");
		Ok(())
	}

	/// Roll staged files back to their pre-regen bytes, deleting the ones
	/// that did not exist before.
	fn restore(&self, staged: &[(PathBuf, Option<String>, String)]) {
		for (path, previous, _) in staged {
			let res = match previous {
				Some(bytes) => fs_err::write(path, bytes),
				None => match fs_err::remove_file(path) {
					Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
					other => other,
				},
			};
			if let Err(e) = res {
				warn!(file = %path.display(), "failed to restore edge config: {e}");
			}
		}
	}

	fn locate(&self, key: &PlanTypeKey) -> Result<(RegionEntry, Strng), EdgeError> {
		let entry = self
			.catalog
			.entry(key)
			.ok_or_else(|| EdgeError::UnknownPlanType(key.clone()))?;
		let region = self
			.catalog
			.region(&entry.region)
			.ok_or_else(|| EdgeError::UnknownRegion(entry.region.clone()))?;
		Ok((region.clone(), entry.pool.clone()))
	}

	/// One upstream pool block and one server block per plan type the region
	/// exposes.
	fn render_region(&self, region: &RegionEntry) -> String {
		let mut out = String::new();
		out.push_str(&format!(
			"# region {} pools, maintained by oceanproxy\n",
			region.name
		));
		for key in &region.plan_types {
			let Some(entry) = self.catalog.entry(key) else {
				warn!(%key, region = %region.name, "region references unknown plan type");
				continue;
			};
			out.push_str(&format!("upstream {} {{\n\tleast_conn;\n}}\n", entry.pool));
			out.push_str(&format!(
				"server {{\n\tlisten {};\n\tproxy_pass {};\n}}\n",
				entry.outbound_port, entry.pool
			));
		}
		out
	}

	/// Swap in the new content behind the validator gate: a rejected edit is
	/// rolled back to the previous bytes before returning.
	async fn commit(
		&self,
		path: &Path,
		previous: &str,
		updated: String,
	) -> Result<(), EdgeError> {
		fs_err::create_dir_all(&self.conf_dir)?;
		let tmp = path.with_extension("tmp");
		fs_err::write(&tmp, &updated)?;
		fs_err::rename(&tmp, path)?;
		if let Err(e) = self.hook.validate(&self.conf_dir).await {
			fs_err::write(path, previous)?;
			return Err(EdgeError::Invalid(e.to_string()));
		}
		self
			.hook
			.reload()
			.await
			.map_err(|e| EdgeError::Reload(e.to_string()))
	}
}

/// Insert a line at the top of the named upstream block. Returns None when
/// the block is missing.
fn insert_into_pool(content: &str, pool: &str, line: &str) -> Option<String> {
	let header = format!("upstream {pool} {{");
	let mut out = String::with_capacity(content.len() + line.len() + 1);
	let mut inserted = false;
	for l in content.lines() {
		out.push_str(l);
		out.push('\n');
		if !inserted && l.trim_end() == header {
			out.push_str(line);
			out.push('\n');
			inserted = true;
		}
	}
	inserted.then_some(out)
}

#[cfg(test)]
pub(crate) mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;
	use crate::types::{PlanType, PlanTypeEntry, plan_type_key};

	/// No-op hook that counts reloads.
	pub(crate) struct RecordingHook {
		pub reloads: AtomicUsize,
	}

	impl RecordingHook {
		pub(crate) fn new() -> Arc<Self> {
			Arc::new(RecordingHook {
				reloads: AtomicUsize::new(0),
			})
		}
	}

	#[async_trait]
	impl ReloadHook for RecordingHook {
		async fn validate(&self, _conf_dir: &Path) -> anyhow::Result<()> {
			Ok(())
		}
		async fn reload(&self) -> anyhow::Result<()> {
			self.reloads.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	pub(crate) fn catalog() -> Arc<Catalog> {
		let key = plan_type_key("vendor-a", "usa", PlanType::Residential);
		Arc::new(
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
					pool: key.clone(),
				}],
				vec![RegionEntry {
					name: strng::literal!("usa"),
					outbound_port: 1337,
					plan_types: vec![key],
					conf_file: "usa.conf".into(),
				}],
			)
			.unwrap(),
		)
	}

	fn key() -> PlanTypeKey {
		plan_type_key("vendor-a", "usa", PlanType::Residential)
	}

	#[tokio::test]
	async fn add_is_idempotent_and_creates_the_file() {
		let dir = tempfile::tempdir().unwrap();
		let hook = RecordingHook::new();
		let edge = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), hook.clone());

		edge.add_member(&key(), 10042).await.unwrap();
		edge.add_member(&key(), 10042).await.unwrap();

		let content = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();
		let members = content
			.lines()
			.filter(|l| l.trim() == "server 127.0.0.1:10042;")
			.count();
		assert_eq!(members, 1);
		assert!(content.contains("upstream vendor-a_usa_residential {"));
		assert!(content.contains("listen 1337;"));
		// Second add changed nothing, so only the first reloaded.
		assert_eq!(hook.reloads.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn remove_is_idempotent_and_keeps_the_file() {
		let dir = tempfile::tempdir().unwrap();
		let edge = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), RecordingHook::new());

		edge.add_member(&key(), 10042).await.unwrap();
		edge.add_member(&key(), 10043).await.unwrap();
		edge.remove_member(&key(), 10042).await.unwrap();
		edge.remove_member(&key(), 10042).await.unwrap();

		let content = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();
		assert!(!content.contains("127.0.0.1:10042"));
		assert!(content.contains("127.0.0.1:10043"));

		edge.remove_member(&key(), 10043).await.unwrap();
		assert!(dir.path().join("usa.conf").exists());
	}

	struct RejectingHook;

	#[async_trait]
	impl ReloadHook for RejectingHook {
		async fn validate(&self, _conf_dir: &Path) -> anyhow::Result<()> {
			anyhow::bail!("no")
		}
		async fn reload(&self) -> anyhow::Result<()> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn rejected_edit_rolls_back() {
		let dir = tempfile::tempdir().unwrap();
		let edge = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), Arc::new(RejectingHook));
		let err = edge.add_member(&key(), 10042).await.unwrap_err();
		assert!(matches!(err, EdgeError::Invalid(_)));
		// The rejected edit must not survive on disk.
		let content = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();
		assert!(!content.contains("10042"));
	}

	#[tokio::test]
	async fn rejected_regenerate_restores_previous_files() {
		let dir = tempfile::tempdir().unwrap();
		let good = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), RecordingHook::new());
		good.add_member(&key(), 10042).await.unwrap();
		let before = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();

		let bad = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), Arc::new(RejectingHook));
		let err = bad.regenerate_all(&[]).await.unwrap_err();
		assert!(matches!(err, EdgeError::Invalid(_)));
		// The rejected regen (which would have dropped the member) is rolled
		// back; the file keeps its previous valid bytes.
		let after = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();
		assert_eq!(before, after);

		// A file the regen created from scratch is removed again on failure.
		let fresh = tempfile::tempdir().unwrap();
		let bad = EdgeReconciler::new(fresh.path().to_path_buf(), catalog(), Arc::new(RejectingHook));
		bad.regenerate_all(&[]).await.unwrap_err();
		assert!(!fresh.path().join("usa.conf").exists());
	}

	#[tokio::test]
	async fn regenerate_rebuilds_from_instances() {
		let dir = tempfile::tempdir().unwrap();
		let edge = EdgeReconciler::new(dir.path().to_path_buf(), catalog(), RecordingHook::new());
		let now = chrono::Utc::now();
		let mk = |port: u16, status| Instance {
			id: uuid::Uuid::new_v4(),
			plan_id: uuid::Uuid::new_v4(),
			plan_type_key: key(),
			local_port: port,
			upstream_host: "usa.res.vendor-a.io".into(),
			upstream_port: 8000,
			pid: 0,
			status,
			created_at: now,
			updated_at: now,
		};
		edge
			.regenerate_all(&[
				mk(10042, InstanceStatus::Running),
				mk(10043, InstanceStatus::Stopped),
			])
			.await
			.unwrap();
		let content = fs_err::read_to_string(dir.path().join("usa.conf")).unwrap();
		assert!(content.contains("127.0.0.1:10042"));
		assert!(!content.contains("127.0.0.1:10043"));
	}
}
