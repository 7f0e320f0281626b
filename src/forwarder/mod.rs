pub mod config;

use std::path::PathBuf;

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use ocean_core::prelude::*;
use uuid::Uuid;

use crate::provider::proxied_fetch;
use crate::store::{Store, StoreError};
use crate::types::{Instance, InstanceStatus};

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
	#[error("instance {0} not found")]
	NotFound(Uuid),
	#[error("instance {0} is not running")]
	NotRunning(Uuid),
	#[error("failed to spawn forwarder: {0}")]
	SpawnFailed(std::io::Error),
	#[error("failed to write forwarder config: {0}")]
	Config(#[from] std::io::Error),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("instance {0} is unhealthy: {1}")]
	Unhealthy(Uuid, String),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub forwarder_bin: PathBuf,
	pub config_dir: PathBuf,
	pub log_dir: PathBuf,
	pub probe_url: String,
	pub probe_delay: Duration,
	pub stop_grace: Duration,
}

/// Translates instance records into live forwarder processes. The OS is the
/// source of truth for liveness (`kill(pid, 0)`); the supervisor reconciles
/// the stored status against it rather than listening for exits.
pub struct ForwarderSupervisor {
	cfg: SupervisorConfig,
	store: Arc<dyn Store>,
}

impl ForwarderSupervisor {
	pub fn new(cfg: SupervisorConfig, store: Arc<dyn Store>) -> Self {
		ForwarderSupervisor { cfg, store }
	}

	/// Spawn the forwarder for an instance. On success the instance record
	/// carries the new pid and status running; a delayed probe then exercises
	/// the listener end to end and logs the outcome.
	pub async fn start(
		&self,
		instance: &Instance,
		username: &str,
		password: &str,
	) -> Result<(), SupervisorError> {
		fs_err::create_dir_all(&self.cfg.config_dir)?;
		fs_err::create_dir_all(&self.cfg.log_dir)?;
		let path = config::config_path(&self.cfg.config_dir, instance.id);
		fs_err::write(
			&path,
			config::render(instance, username, password, &self.cfg.log_dir),
		)?;

		// A crashed run may have left a process holding our port.
		self.kill_port_owner(instance.local_port).await;

		let mut cmd = tokio::process::Command::new(&self.cfg.forwarder_bin);
		cmd.arg(&path);
		#[cfg(unix)]
		cmd.process_group(0);
		let mut child = match cmd.spawn() {
			Ok(c) => c,
			Err(e) => {
				self.mark(instance.id, InstanceStatus::Failed, 0)?;
				return Err(SupervisorError::SpawnFailed(e));
			},
		};
		let pid = child.id().unwrap_or_default();
		info!(instance = %instance.id, pid, port = instance.local_port, "forwarder started");
		// Reap the child when it exits; liveness is tracked through the pid.
		tokio::spawn(async move {
			let _ = child.wait().await;
		});
		self.mark(instance.id, InstanceStatus::Running, pid)?;

		let probe_delay = self.cfg.probe_delay;
		let probe_url = self.cfg.probe_url.clone();
		let port = instance.local_port;
		let id = instance.id;
		let username = username.to_string();
		let password = password.to_string();
		tokio::spawn(async move {
			tokio::time::sleep(probe_delay).await;
			match proxied_fetch(
				"127.0.0.1",
				port,
				&username,
				&password,
				&probe_url,
				Duration::from_secs(10),
			)
			.await
			{
				Ok(()) => info!(instance = %id, port, "forwarder probe succeeded"),
				Err(e) => warn!(instance = %id, port, "forwarder probe failed: {e}"),
			}
		});
		Ok(())
	}

	/// SIGTERM, bounded wait, then SIGKILL. Also clears the config file and
	/// zeroes the recorded pid.
	pub async fn stop(&self, id: Uuid) -> Result<(), SupervisorError> {
		let instance = self
			.store
			.instance(id)
			.ok_or(SupervisorError::NotFound(id))?;
		if instance.pid == 0 {
			return Err(SupervisorError::NotRunning(id));
		}
		self.terminate(instance.pid).await;
		self.kill_port_owner(instance.local_port).await;
		self.mark(id, InstanceStatus::Stopped, 0)?;
		let path = config::config_path(&self.cfg.config_dir, id);
		if let Err(e) = fs_err::remove_file(&path) {
			if e.kind() != std::io::ErrorKind::NotFound {
				warn!(instance = %id, "failed to remove forwarder config: {e}");
			}
		}
		info!(instance = %id, "forwarder stopped");
		Ok(())
	}

	pub async fn restart(
		&self,
		id: Uuid,
		username: &str,
		password: &str,
	) -> Result<(), SupervisorError> {
		match self.stop(id).await {
			Ok(()) | Err(SupervisorError::NotRunning(_)) => {},
			Err(e) => return Err(e),
		}
		tokio::time::sleep(Duration::from_millis(500)).await;
		let instance = self
			.store
			.instance(id)
			.ok_or(SupervisorError::NotFound(id))?;
		self.start(&instance, username, password).await
	}

	/// Report the instance's live status, demoting the stored record when the
	/// recorded process is gone.
	pub fn get_status(&self, id: Uuid) -> Result<InstanceStatus, SupervisorError> {
		let instance = self
			.store
			.instance(id)
			.ok_or(SupervisorError::NotFound(id))?;
		if instance.pid == 0 {
			return Ok(instance.status);
		}
		if process_alive(instance.pid) {
			Ok(InstanceStatus::Running)
		} else {
			debug!(instance = %id, pid = instance.pid, "recorded process is gone");
			self.mark(id, InstanceStatus::Stopped, 0)?;
			Ok(InstanceStatus::Stopped)
		}
	}

	/// Process liveness plus an end-to-end fetch through the forwarder.
	pub async fn health_check(
		&self,
		id: Uuid,
		username: &str,
		password: &str,
	) -> Result<(), SupervisorError> {
		let instance = self
			.store
			.instance(id)
			.ok_or(SupervisorError::NotFound(id))?;
		if instance.pid == 0 || !process_alive(instance.pid) {
			return Err(SupervisorError::Unhealthy(id, "process is not running".into()));
		}
		proxied_fetch(
			"127.0.0.1",
			instance.local_port,
			username,
			password,
			&self.cfg.probe_url,
			Duration::from_secs(10),
		)
		.await
		.map_err(|e| SupervisorError::Unhealthy(id, e.to_string()))
	}

	/// Stop every child whose record claims a live pid. Used at teardown.
	pub async fn stop_all(&self) {
		for instance in self.store.instances() {
			if instance.pid != 0 {
				if let Err(e) = self.stop(instance.id).await {
					warn!(instance = %instance.id, "failed to stop forwarder: {e}");
				}
			}
		}
	}

	fn mark(&self, id: Uuid, status: InstanceStatus, pid: u32) -> Result<(), StoreError> {
		let Some(mut instance) = self.store.instance(id) else {
			return Err(StoreError::InstanceNotFound(id));
		};
		instance.status = status;
		instance.pid = pid;
		instance.touch();
		self.store.update_instance(instance)
	}

	async fn terminate(&self, pid: u32) {
		let pgid = Pid::from_raw(pid as i32);
		if killpg(pgid, Signal::SIGTERM).is_err() {
			// Not a group leader (or already gone); fall back to the pid.
			let _ = kill(pgid, Signal::SIGTERM);
		}
		let deadline = Instant::now() + self.cfg.stop_grace;
		while process_alive(pid) && Instant::now() < deadline {
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
		if process_alive(pid) {
			warn!(pid, "forwarder ignored SIGTERM, escalating");
			if killpg(pgid, Signal::SIGKILL).is_err() {
				let _ = kill(pgid, Signal::SIGKILL);
			}
		}
	}

	/// Best effort: signal whatever our records say last owned the port.
	async fn kill_port_owner(&self, port: u16) {
		let Some(other) = self.store.instance_by_port(port) else {
			return;
		};
		if other.pid != 0 && process_alive(other.pid) {
			warn!(port, pid = other.pid, "reaping stray owner of local port");
			self.terminate(other.pid).await;
		}
	}
}

pub fn process_alive(pid: u32) -> bool {
	if pid == 0 {
		return false;
	}
	kill(Pid::from_raw(pid as i32), None).is_ok()
}
