// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use futures::{FutureExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use wgmesh_common::{Peer, WgPublicKey};
use wgmesh_store::{CoordinationStore, MembershipStream, Namespace, StoreError};

/// Records owned by nodes missing from `alive`.
///
/// Records without an owner and the local node's record (by node name or
/// public key) are never returned.
pub fn stale_records<'a>(
	peers: &'a [Peer],
	alive: &BTreeSet<String>,
	local_node: &str,
	local_key: &WgPublicKey,
) -> Vec<&'a Peer> {
	peers
		.iter()
		.filter(|p| p.public_key != *local_key)
		.filter(|p| match p.node.as_deref() {
			Some(node) => node != local_node && !alive.contains(node),
			None => false,
		})
		.collect()
}

/// Deletes peer records whose owning node has left the cluster.
pub struct MembershipGc {
	store: Arc<dyn CoordinationStore>,
	namespace: Namespace,
	local_node: String,
	local_key: WgPublicKey,
}

impl MembershipGc {
	pub fn new(
		store: Arc<dyn CoordinationStore>,
		namespace: Namespace,
		local_node: String,
		local_key: WgPublicKey,
	) -> Self {
		Self {
			store,
			namespace,
			local_node,
			local_key,
		}
	}

	#[instrument(skip_all, fields(namespace = %self.namespace, node = %self.local_node))]
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
		let mut members = self.store.watch_membership().await?;
		info!("watching cluster membership");

		loop {
			tokio::select! {
				biased;

				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				update = members.next() => match update {
					Some(Ok(alive)) => {
						let alive = latest(&mut members).unwrap_or(alive);
						if let Err(e) = self.collect(&alive).await {
							warn!(error = %e, "garbage collection pass failed");
						}
					}
					Some(Err(e)) => warn!(error = %e, "membership watch error"),
					None => {
						info!("membership watch ended");
						break;
					}
				},
			}
		}
		Ok(())
	}

	/// One collection pass against the given alive set. Returns how many
	/// records were deleted.
	pub async fn collect(&self, alive: &BTreeSet<String>) -> Result<usize, StoreError> {
		// An empty view is a truncated catalog response, not a dead mesh.
		if alive.is_empty() {
			warn!("empty membership view, skipping collection");
			return Ok(0);
		}

		let peers = self.store.get_peers(&self.namespace).await?;
		let stale = stale_records(&peers, alive, &self.local_node, &self.local_key);
		if stale.is_empty() {
			debug!(alive = alive.len(), "no peers to collect");
			return Ok(0);
		}

		let mut deleted = 0;
		for peer in stale {
			match self.store.delete_peer(&self.namespace, &peer.public_key).await {
				Ok(()) => {
					info!(peer = %peer.public_key, node = ?peer.node, ip = ?peer.ip, "removed peer of departed node");
					deleted += 1;
				}
				Err(e) => warn!(error = %e, peer = %peer.public_key, "failed to remove peer"),
			}
		}
		Ok(deleted)
	}
}

fn latest(updates: &mut MembershipStream) -> Option<BTreeSet<String>> {
	let mut newest = None;
	while let Some(Some(item)) = updates.next().now_or_never() {
		match item {
			Ok(alive) => newest = Some(alive),
			Err(e) => warn!(error = %e, "membership watch error"),
		}
	}
	newest
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_common::WgKeyPair;

	fn owned(node: Option<&str>) -> Peer {
		Peer {
			public_key: *WgKeyPair::generate().public_key(),
			ip: None,
			endpoint_ip: None,
			endpoint_port: 51820,
			allowed_ips: Default::default(),
			node: node.map(str::to_string),
		}
	}

	fn alive(nodes: &[&str]) -> BTreeSet<String> {
		nodes.iter().map(|n| n.to_string()).collect()
	}

	#[test]
	fn only_departed_owners_are_stale() {
		let a = owned(Some("a"));
		let b = owned(Some("b"));
		let c = owned(Some("c"));
		let peers = vec![a.clone(), b.clone(), c.clone()];

		let stale = stale_records(&peers, &alive(&["a", "c"]), "a", &a.public_key);
		assert_eq!(stale, vec![&b]);
	}

	#[test]
	fn unowned_records_are_kept() {
		let local = owned(Some("a"));
		let placeholder = owned(None);
		let peers = vec![local.clone(), placeholder];

		assert!(stale_records(&peers, &alive(&["a"]), "a", &local.public_key).is_empty());
	}

	#[test]
	fn local_record_is_kept_even_if_missing_from_view() {
		let local = owned(Some("a"));
		let by_key = owned(Some("renamed"));
		let peers = vec![local.clone(), by_key.clone()];

		let stale = stale_records(&peers, &alive(&["b"]), "a", &by_key.public_key);
		assert!(stale.is_empty());
	}
}
