// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::namespace::Namespace;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeSet;
use wgmesh_common::{Interface, Peer, WgPublicKey};

/// Full peer set of a namespace, delivered on every change.
pub type PeerStream = BoxStream<'static, Result<Vec<Peer>>>;

/// Names of the nodes the store currently considers alive.
pub type MembershipStream = BoxStream<'static, Result<BTreeSet<String>>>;

/// A held namespace lock. Pass it back to [`CoordinationStore::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
	pub key: String,
	pub token: String,
}

/// Distributed lock, key/value and change-notification capability the mesh
/// agent is built on.
///
/// Watch streams yield the current state first, then one item per change.
/// Transient failures after the subscription is established surface as `Err`
/// items and the stream keeps going; an `Err` from the `watch_*` call itself
/// means the subscription could not be set up.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
	/// Blocks until the namespace lock is held. `identity` is recorded as the
	/// lock holder for operators inspecting the store.
	async fn lock(&self, namespace: &Namespace, identity: &str) -> Result<LockHandle>;

	/// Releases a lock. Releasing twice is not an error.
	async fn unlock(&self, handle: &LockHandle) -> Result<()>;

	async fn get_peers(&self, namespace: &Namespace) -> Result<Vec<Peer>>;

	/// Upserts the record of the local `interface`. Records for any other
	/// public key are rejected.
	async fn put_peer(&self, namespace: &Namespace, interface: &Interface, peer: &Peer)
		-> Result<()>;

	async fn delete_peer(&self, namespace: &Namespace, public_key: &WgPublicKey) -> Result<()>;

	async fn watch_kv(&self, namespace: &Namespace) -> Result<PeerStream>;

	async fn watch_membership(&self) -> Result<MembershipStream>;

	/// Name of this process's node in the membership view.
	async fn local_node(&self) -> Result<String>;
}

pub(crate) fn check_owner(interface: &Interface, peer: &Peer) -> Result<()> {
	if interface.public_key() != &peer.public_key {
		return Err(crate::error::StoreError::ForeignRecord {
			peer: peer.public_key.to_base64(),
			interface: interface.name.clone(),
		});
	}
	Ok(())
}
