// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wgmesh_agent::{NodeConfig, Role};
use wgmesh_common::{Interface, Peer};
use wgmesh_store::Namespace;
use wgmesh_wireguard::{InterfaceError, InterfaceManager};

/// Interface manager that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingManager {
	configured: Mutex<Vec<(Interface, Vec<Peer>)>>,
	synced: Mutex<Vec<Vec<Peer>>>,
	fail_sync: AtomicBool,
}

impl RecordingManager {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn configured(&self) -> Vec<(Interface, Vec<Peer>)> {
		self.configured.lock().unwrap().clone()
	}

	pub fn synced(&self) -> Vec<Vec<Peer>> {
		self.synced.lock().unwrap().clone()
	}

	pub fn sync_count(&self) -> usize {
		self.synced.lock().unwrap().len()
	}

	pub fn set_fail_sync(&self, fail: bool) {
		self.fail_sync.store(fail, Ordering::SeqCst);
	}
}

#[async_trait]
impl InterfaceManager for RecordingManager {
	async fn configure(&self, interface: &Interface, peers: &[Peer]) -> Result<(), InterfaceError> {
		self.configured
			.lock()
			.unwrap()
			.push((interface.clone(), peers.to_vec()));
		Ok(())
	}

	async fn sync_peers(&self, _interface: &Interface, peers: &[Peer]) -> Result<(), InterfaceError> {
		if self.fail_sync.load(Ordering::SeqCst) {
			return Err(InterfaceError::CommandFailed {
				cmd: "wg".to_string(),
				args: vec!["syncconf".to_string()],
				stderr: "device busy".to_string(),
			});
		}
		self.synced.lock().unwrap().push(peers.to_vec());
		Ok(())
	}
}

pub fn namespace() -> Namespace {
	Namespace::new("mesh", "wg0")
}

pub fn cattle(range: &str) -> Role {
	Role::Cattle {
		range: range.parse().unwrap(),
	}
}

pub fn pet(ip: &str) -> Role {
	Role::Pet {
		ip: ip.parse().unwrap(),
	}
}

pub fn node_config(key_root: &Path, endpoint: &str, role: Role) -> NodeConfig {
	let range = match role {
		Role::Cattle { range } => Some(range),
		Role::Pet { .. } => None,
	};
	NodeConfig {
		namespace: namespace(),
		interface_name: "wg0".to_string(),
		config_folder: key_root.to_path_buf(),
		key_folder: key_root.join(endpoint),
		role,
		range,
		relay: false,
		listen_port: 51820,
		endpoint_ip: endpoint.parse().unwrap(),
		extra_allowed_ips: Vec::new(),
		post_up: None,
		post_down: None,
		gc_enable: false,
	}
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	while !check().await {
		assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
