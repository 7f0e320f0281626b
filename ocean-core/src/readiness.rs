// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

/// Ready tracks whether the process is ready.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// register_task adds a dependency that must complete before the process
	/// reports ready. Readiness for it is released when the returned guard drops.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed); // It is a bug to somehow remove something twice
		let left = pending.len();
		if left == 0 {
			info!("task '{}' complete, marking server ready", self.name);
		} else {
			info!("task '{}' complete, still awaiting {left} tasks", self.name);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pending_drains_as_guards_drop() {
		let ready = Ready::new();
		let a = ready.register_task("store");
		let b = a.subtask("edge");
		assert_eq!(ready.pending().len(), 2);
		drop(a);
		assert_eq!(ready.pending(), HashSet::from(["edge".to_string()]));
		drop(b);
		assert!(ready.pending().is_empty());
	}
}
