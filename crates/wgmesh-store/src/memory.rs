// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process [`CoordinationStore`] used by tests and single-host dry runs.
//!
//! Several agents sharing one `Arc<MemoryStore>` behave like nodes sharing
//! one cluster: the namespace lock is exclusive, writes are immediately
//! visible to readers, and watches see every committed change.

use crate::error::{Result, StoreError};
use crate::namespace::Namespace;
use crate::store::{check_owner, CoordinationStore, LockHandle, MembershipStream, PeerStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::debug;
use wgmesh_common::{Interface, Peer, WgPublicKey};

type Records = BTreeMap<String, BTreeMap<String, Peer>>;

pub struct MemoryStore {
	node: String,
	records: watch::Sender<Records>,
	members: watch::Sender<BTreeSet<String>>,
	locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
	held: Mutex<HashMap<String, OwnedMutexGuard<()>>>,
	next_token: AtomicU64,
	unavailable: AtomicBool,
	lock_count: AtomicU64,
}

fn guard<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
	/// Creates a store whose local node is `node`; the membership view starts
	/// with just that node alive.
	pub fn new(node: impl Into<String>) -> Self {
		let node = node.into();
		let (records, _) = watch::channel(Records::new());
		let (members, _) = watch::channel(BTreeSet::from([node.clone()]));
		Self {
			node,
			records,
			members,
			locks: Mutex::new(HashMap::new()),
			held: Mutex::new(HashMap::new()),
			next_token: AtomicU64::new(1),
			unavailable: AtomicBool::new(false),
			lock_count: AtomicU64::new(0),
		}
	}

	/// A handle onto the same cluster as seen from another node.
	pub fn view_as(self: &Arc<Self>, node: impl Into<String>) -> NodeView {
		NodeView {
			store: Arc::clone(self),
			node: node.into(),
		}
	}

	pub fn set_members<I, S>(&self, members: I)
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self
			.members
			.send_replace(members.into_iter().map(Into::into).collect());
	}

	/// Writes a record without an ownership check, like an operator editing
	/// the store by hand.
	pub fn insert_raw(&self, namespace: &Namespace, peer: Peer) {
		self.records.send_modify(|records| {
			records
				.entry(namespace.to_string())
				.or_default()
				.insert(namespace.peer_key(&peer.public_key), peer);
		});
	}

	pub fn peers(&self, namespace: &Namespace) -> Vec<Peer> {
		self
			.records
			.borrow()
			.get(namespace.as_str())
			.map(|m| m.values().cloned().collect())
			.unwrap_or_default()
	}

	/// While set, every call fails with [`StoreError::Unavailable`].
	pub fn set_unavailable(&self, unavailable: bool) {
		self.unavailable.store(unavailable, Ordering::SeqCst);
	}

	/// Number of successful lock acquisitions so far.
	pub fn lock_count(&self) -> u64 {
		self.lock_count.load(Ordering::SeqCst)
	}

	pub fn is_locked(&self, namespace: &Namespace) -> bool {
		guard(&self.held)
			.keys()
			.any(|token| token.starts_with(&format!("{}#", namespace.lock_key())))
	}

	fn check_available(&self) -> Result<()> {
		if self.unavailable.load(Ordering::SeqCst) {
			return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
		}
		Ok(())
	}

	fn namespace_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
		guard(&self.locks)
			.entry(key.to_string())
			.or_default()
			.clone()
	}
}

impl std::fmt::Debug for MemoryStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryStore")
			.field("node", &self.node)
			.finish()
	}
}

#[async_trait]
impl CoordinationStore for MemoryStore {
	async fn lock(&self, namespace: &Namespace, identity: &str) -> Result<LockHandle> {
		self.check_available()?;
		let key = namespace.lock_key();
		let held = self.namespace_lock(&key).lock_owned().await;

		let token = format!("{key}#{}", self.next_token.fetch_add(1, Ordering::SeqCst));
		guard(&self.held).insert(token.clone(), held);
		self.lock_count.fetch_add(1, Ordering::SeqCst);
		debug!(%key, %identity, "acquired memory lock");

		Ok(LockHandle { key, token })
	}

	async fn unlock(&self, handle: &LockHandle) -> Result<()> {
		guard(&self.held).remove(&handle.token);
		Ok(())
	}

	async fn get_peers(&self, namespace: &Namespace) -> Result<Vec<Peer>> {
		self.check_available()?;
		Ok(self.peers(namespace))
	}

	async fn put_peer(
		&self,
		namespace: &Namespace,
		interface: &Interface,
		peer: &Peer,
	) -> Result<()> {
		self.check_available()?;
		check_owner(interface, peer)?;
		self.insert_raw(namespace, peer.clone());
		Ok(())
	}

	async fn delete_peer(&self, namespace: &Namespace, public_key: &WgPublicKey) -> Result<()> {
		self.check_available()?;
		let key = namespace.peer_key(public_key);
		self.records.send_if_modified(|records| {
			records
				.get_mut(namespace.as_str())
				.map(|m| m.remove(&key).is_some())
				.unwrap_or(false)
		});
		Ok(())
	}

	async fn watch_kv(&self, namespace: &Namespace) -> Result<PeerStream> {
		self.check_available()?;
		let ns = namespace.to_string();
		let rx = self.records.subscribe();

		let stream = futures::stream::unfold((rx, None::<Vec<Peer>>), move |(mut rx, last)| {
			let ns = ns.clone();
			async move {
				loop {
					if last.is_some() && rx.changed().await.is_err() {
						return None;
					}
					let current: Vec<Peer> = rx
						.borrow_and_update()
						.get(&ns)
						.map(|m| m.values().cloned().collect())
						.unwrap_or_default();
					// Changes in other namespaces are not notifications for this one.
					if last.as_ref() == Some(&current) {
						continue;
					}
					return Some((Ok(current.clone()), (rx, Some(current))));
				}
			}
		});
		Ok(stream.boxed())
	}

	async fn watch_membership(&self) -> Result<MembershipStream> {
		self.check_available()?;
		let rx = self.members.subscribe();

		let stream = futures::stream::unfold((rx, true), |(mut rx, first)| async move {
			if !first && rx.changed().await.is_err() {
				return None;
			}
			let alive = rx.borrow_and_update().clone();
			Some((Ok(alive), (rx, false)))
		});
		Ok(stream.boxed())
	}

	async fn local_node(&self) -> Result<String> {
		Ok(self.node.clone())
	}
}

/// The shared [`MemoryStore`] as seen from one node: same records, locks and
/// membership, different [`CoordinationStore::local_node`].
#[derive(Clone)]
pub struct NodeView {
	store: Arc<MemoryStore>,
	node: String,
}

#[async_trait]
impl CoordinationStore for NodeView {
	async fn lock(&self, namespace: &Namespace, identity: &str) -> Result<LockHandle> {
		self.store.lock(namespace, identity).await
	}

	async fn unlock(&self, handle: &LockHandle) -> Result<()> {
		self.store.unlock(handle).await
	}

	async fn get_peers(&self, namespace: &Namespace) -> Result<Vec<Peer>> {
		self.store.get_peers(namespace).await
	}

	async fn put_peer(
		&self,
		namespace: &Namespace,
		interface: &Interface,
		peer: &Peer,
	) -> Result<()> {
		self.store.put_peer(namespace, interface, peer).await
	}

	async fn delete_peer(&self, namespace: &Namespace, public_key: &WgPublicKey) -> Result<()> {
		self.store.delete_peer(namespace, public_key).await
	}

	async fn watch_kv(&self, namespace: &Namespace) -> Result<PeerStream> {
		self.store.watch_kv(namespace).await
	}

	async fn watch_membership(&self) -> Result<MembershipStream> {
		self.store.watch_membership().await
	}

	async fn local_node(&self) -> Result<String> {
		Ok(self.node.clone())
	}
}
