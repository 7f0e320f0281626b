use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::types::Instance;

pub fn config_path(config_dir: &Path, id: Uuid) -> PathBuf {
	config_dir.join(format!("forwarder_{id}.cfg"))
}

pub fn log_path(log_dir: &Path, id: Uuid) -> PathBuf {
	log_dir.join(format!("forwarder_{id}.log"))
}

/// Render the forwarder's config file. The contract with the external binary:
/// run as a daemon, rotate an append-only log, define exactly one cleartext
/// user, only accept that user, and chain the local HTTP listener with
/// authentication to the upstream gateway.
pub fn render(instance: &Instance, username: &str, password: &str, log_dir: &Path) -> String {
	let log = log_path(log_dir, instance.id);
	format!(
		"daemon\n\
		log {log} D\n\
		rotate 30\n\
		auth strong\n\
		users {username}:CL:{password}\n\
		allow {username}\n\
		parent 1000 http {upstream_host} {upstream_port} {username} {password}\n\
		proxy -n -a -p{port} -i127.0.0.1 -e0.0.0.0\n",
		log = log.display(),
		upstream_host = instance.upstream_host,
		upstream_port = instance.upstream_port,
		port = instance.local_port,
	)
}

#[cfg(test)]
mod tests {
	use chrono::Utc;

	use super::*;
	use crate::types::InstanceStatus;

	#[test]
	fn renders_the_forwarding_chain() {
		let instance = Instance {
			id: Uuid::new_v4(),
			plan_id: Uuid::new_v4(),
			plan_type_key: ocean_core::strng::literal!("vendor-a_usa_residential"),
			local_port: 10042,
			upstream_host: "usa.res.vendor-a.io".into(),
			upstream_port: 8000,
			pid: 0,
			status: InstanceStatus::Starting,
			created_at: Utc::now(),
			updated_at: Utc::now(),
		};
		let rendered = render(&instance, "u", "p", Path::new("/var/log/oceanproxy"));
		assert!(rendered.contains("users u:CL:p\n"));
		assert!(rendered.contains("allow u\n"));
		assert!(rendered.contains("parent 1000 http usa.res.vendor-a.io 8000 u p\n"));
		assert!(rendered.contains("proxy -n -a -p10042 -i127.0.0.1"));
		assert!(rendered.contains(&format!("forwarder_{}.log", instance.id)));
	}
}
