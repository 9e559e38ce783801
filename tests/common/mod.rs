//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use meshsync::auth::Authenticator;
use meshsync::config::Config;
use meshsync::coordinator::Coordinator;
use meshsync::error::SyncError;
use meshsync::layout::Layout;
use meshsync::peer::{IdentityBundle, Peer};
use meshsync::protocol::{MemoryNetwork, MemoryTransport};
use meshsync::session;

/// A replica on disk, not yet opened
pub struct Node {
	pub dir: TempDir,
	pub layout: Layout,
	pub peer: Peer,
}

impl Node {
	pub fn id(&self) -> &str {
		&self.peer.identification
	}

	pub fn write(&self, path: &str, content: &[u8]) {
		let full = self.dir.path().join(path);
		if let Some(parent) = full.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(full, content).unwrap();
	}

	pub fn read(&self, path: &str) -> Option<Vec<u8>> {
		std::fs::read(self.dir.path().join(path)).ok()
	}

	pub fn exists(&self, path: &str) -> bool {
		self.dir.path().join(path).exists()
	}
}

/// Create the marker directory tree, the way the bootstrapper leaves it
pub fn create_layout(layout: &Layout) {
	for dir in [
		layout.peers_dir(),
		layout.local_dir(),
		layout.temp_dir(),
		layout.receiving_dir(),
		layout.removed_dir(),
	] {
		std::fs::create_dir_all(dir).unwrap();
	}
}

/// Replicas that know each other; `secret` makes them trusted peers
pub async fn nodes(names: &[&str], secret: Option<[u8; 32]>) -> Vec<Node> {
	let mut nodes = Vec::new();
	for name in names {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		create_layout(&layout);
		let mut peer = Peer::new(name, &format!("{}-address", name), secret.is_some());
		peer.identification = name.to_string();
		let bundle = IdentityBundle { self_peer: peer.clone(), transport_data: vec![1, 2, 3] };
		bundle.store(&layout).await.unwrap();
		Authenticator::new(secret.unwrap_or([0; 32])).store(&layout).await.unwrap();
		nodes.push(Node { dir, layout, peer });
	}
	for node in &nodes {
		for other in &nodes {
			if other.id() != node.id() {
				other.peer.store(&node.layout).await.unwrap();
			}
		}
	}
	nodes
}

pub fn quick_config() -> Config {
	Config { tick_interval_ms: 50, lock_timeout_secs: 1, session_restart_ms: 100, ..Config::default() }
}

/// An opened replica serving on the in-memory network
pub struct Running {
	pub coordinator: Arc<Coordinator>,
	pub transport: MemoryTransport,
	pub task: JoinHandle<Result<(), SyncError>>,
}

/// Join every node to the network first, then start serving them all
pub async fn start_all(network: &MemoryNetwork, nodes: &[&Node], config: Config) -> Vec<Running> {
	let mut inboxes = Vec::new();
	for node in nodes {
		inboxes.push(network.join(node.id(), node.layout.receiving_dir()).await);
	}
	let mut running = Vec::new();
	for (node, inbox) in nodes.iter().zip(inboxes) {
		let coordinator = Arc::new(Coordinator::open(node.layout.clone(), config.clone()).await.unwrap());
		let transport = network.endpoint(node.id());
		let task = tokio::spawn(session::run(coordinator.clone(), Arc::new(transport.clone()), inbox));
		running.push(Running { coordinator, transport, task });
	}
	running
}

impl Running {
	pub async fn send(&self, outbound: Vec<meshsync::Outbound>) {
		session::dispatch(&self.transport, outbound).await.unwrap();
	}
}

/// Stop every replica and wait for their models to be saved
pub async fn stop(network: &MemoryNetwork, nodes: &[&Node], running: Vec<Running>) {
	for node in nodes {
		network.leave(node.id()).await;
	}
	for r in running {
		r.task.await.unwrap().unwrap();
	}
}

/// Poll `check` until it holds or a few seconds have passed
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	for _ in 0..250 {
		if check().await {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("timed out waiting for {}", what);
}

// vim: ts=4
