// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use wgmesh_common::Peer;

/// Peer list currently applied to the local interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedConfig {
	/// Remote peers, sorted by public key.
	pub peers: Vec<Peer>,
	/// Bumped on every publish.
	pub revision: u64,
}

/// Shared, atomically replaced view of the applied configuration.
///
/// Readers get a consistent `Arc` snapshot; writers are serialized so the
/// revision always increases by one per publish.
#[derive(Debug)]
pub struct MeshState {
	current: watch::Sender<Arc<AppliedConfig>>,
	write: Mutex<()>,
}

impl MeshState {
	pub fn new(peers: Vec<Peer>) -> Self {
		let (current, _) = watch::channel(Arc::new(AppliedConfig {
			peers: canonical(peers),
			revision: 0,
		}));
		Self {
			current,
			write: Mutex::new(()),
		}
	}

	pub fn snapshot(&self) -> Arc<AppliedConfig> {
		self.current.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<Arc<AppliedConfig>> {
		self.current.subscribe()
	}

	/// Whether `peers` is what is already applied.
	pub fn is_current(&self, peers: &[Peer]) -> bool {
		self.current.borrow().peers == canonical(peers.to_vec())
	}

	pub async fn publish(&self, peers: Vec<Peer>) -> Arc<AppliedConfig> {
		let _write = self.write.lock().await;
		let next = Arc::new(AppliedConfig {
			peers: canonical(peers),
			revision: self.current.borrow().revision + 1,
		});
		self.current.send_replace(next.clone());
		next
	}
}

fn canonical(mut peers: Vec<Peer>) -> Vec<Peer> {
	peers.sort_by_key(|p| p.public_key);
	peers
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_common::WgKeyPair;

	fn peer(ip: &str) -> Peer {
		Peer {
			public_key: *WgKeyPair::generate().public_key(),
			ip: Some(ip.parse().unwrap()),
			endpoint_ip: None,
			endpoint_port: 51820,
			allowed_ips: Default::default(),
			node: None,
		}
	}

	#[tokio::test]
	async fn publish_replaces_snapshot_and_bumps_revision() {
		let state = MeshState::new(vec![]);
		let before = state.snapshot();
		let mut rx = state.subscribe();

		let after = state.publish(vec![peer("10.0.0.2")]).await;

		assert_eq!(before.revision, 0);
		assert!(before.peers.is_empty());
		assert_eq!(after.revision, 1);
		assert!(rx.has_changed().unwrap());
		assert_eq!(rx.borrow_and_update().peers.len(), 1);
	}

	#[tokio::test]
	async fn order_does_not_matter_for_is_current() {
		let a = peer("10.0.0.2");
		let b = peer("10.0.0.3");
		let state = MeshState::new(vec![a.clone(), b.clone()]);
		assert!(state.is_current(&[b, a]));
		assert!(!state.is_current(&[]));
	}

	#[tokio::test]
	async fn concurrent_publishes_get_distinct_revisions() {
		let state = Arc::new(MeshState::new(vec![]));
		let handles: Vec<_> = (0..8)
			.map(|_| {
				let state = state.clone();
				tokio::spawn(async move { state.publish(vec![]).await.revision })
			})
			.collect();

		let mut revisions = Vec::new();
		for h in handles {
			revisions.push(h.await.unwrap());
		}
		revisions.sort_unstable();
		assert_eq!(revisions, (1..=8).collect::<Vec<u64>>());
	}
}
