// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::lock::NamespaceLock;
use crate::state::MeshState;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use wgmesh_common::{find_by_endpoint, find_by_ip, Interface, Peer};
use wgmesh_store::{CoordinationStore, Namespace, PeerStream, StoreError};
use wgmesh_wireguard::InterfaceManager;

/// Keeps the local interface's peer list in step with the store.
pub struct KvReconciler {
	store: Arc<dyn CoordinationStore>,
	manager: Arc<dyn InterfaceManager>,
	namespace: Namespace,
	interface: Interface,
	record: Peer,
	state: Arc<MeshState>,
}

impl KvReconciler {
	pub fn new(
		store: Arc<dyn CoordinationStore>,
		manager: Arc<dyn InterfaceManager>,
		namespace: Namespace,
		interface: Interface,
		record: Peer,
		state: Arc<MeshState>,
	) -> Self {
		Self {
			store,
			manager,
			namespace,
			interface,
			record,
			state,
		}
	}

	/// Runs until `shutdown` flips to true or the watch ends. Only failing to
	/// set up the watch is an error.
	#[instrument(skip_all, fields(namespace = %self.namespace))]
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
		let mut updates = self.store.watch_kv(&self.namespace).await?;
		info!("watching peer records");

		loop {
			tokio::select! {
				biased;

				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("shutdown signal received");
						break;
					}
				}

				update = updates.next() => match update {
					Some(Ok(peers)) => {
						let peers = latest(&mut updates).unwrap_or(peers);
						self.apply(peers).await;
					}
					Some(Err(e)) => warn!(error = %e, "peer watch error"),
					None => {
						info!("peer watch ended");
						break;
					}
				},
			}
		}
		Ok(())
	}

	/// Applies one peer set notification.
	pub async fn apply(&self, peers: Vec<Peer>) {
		if !peers.iter().any(|p| p.public_key == self.record.public_key) {
			self.restore_own_record().await;
		}

		let remote: Vec<Peer> = peers
			.into_iter()
			.filter(|p| p.public_key != self.record.public_key)
			.collect();

		if self.state.is_current(&remote) {
			debug!("peer set unchanged");
			return;
		}

		match self.manager.sync_peers(&self.interface, &remote).await {
			Ok(()) => {
				let applied = self.state.publish(remote).await;
				info!(peers = applied.peers.len(), revision = applied.revision, "applied peer set");
			}
			Err(e) => warn!(error = %e, "failed to apply peer set"),
		}
	}

	/// Puts this node's record back after it vanished from the store, as long
	/// as nobody else has claimed its address or endpoint since.
	async fn restore_own_record(&self) {
		warn!("own peer record missing from store, restoring it");
		let identity = self
			.record
			.endpoint_ip
			.map(|ip| ip.to_string())
			.unwrap_or_else(|| self.interface.name.clone());

		let lock = match NamespaceLock::acquire(self.store.clone(), &self.namespace, &identity).await {
			Ok(lock) => lock,
			Err(e) => {
				warn!(error = %e, "could not lock namespace to restore own record");
				return;
			}
		};

		if let Err(e) = self.restore_locked().await {
			warn!(error = %e, "failed to restore own record");
		}
		if let Err(e) = lock.release().await {
			warn!(error = %e, "failed to release namespace lock");
		}
	}

	async fn restore_locked(&self) -> Result<(), StoreError> {
		let peers = self.store.get_peers(&self.namespace).await?;
		if peers.iter().any(|p| p.public_key == self.record.public_key) {
			debug!("own record already back in store");
			return Ok(());
		}

		let ip_owner = self.record.ip.and_then(|ip| find_by_ip(&peers, ip));
		let endpoint_owner = self
			.record
			.endpoint_ip
			.and_then(|ip| find_by_endpoint(&peers, ip));
		if let Some(owner) = ip_owner.or(endpoint_owner) {
			error!(
				owner = %owner.public_key,
				"tunnel IP or endpoint was claimed by another peer, keeping current tunnel without republishing"
			);
			return Ok(());
		}

		self
			.store
			.put_peer(&self.namespace, &self.interface, &self.record)
			.await?;
		info!("restored own peer record");
		Ok(())
	}
}

/// Drains notifications that are already queued and returns the newest peer
/// set among them.
fn latest(updates: &mut PeerStream) -> Option<Vec<Peer>> {
	let mut newest = None;
	while let Some(Some(item)) = updates.next().now_or_never() {
		match item {
			Ok(peers) => newest = Some(peers),
			Err(e) => warn!(error = %e, "peer watch error"),
		}
	}
	newest
}
