// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod common;

use common::{cattle, eventually, namespace, node_config, RecordingManager};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::watch;
use wgmesh_agent::{JoinProtocol, Joined, KvReconciler, MembershipGc, MeshState};
use wgmesh_common::{Peer, WgKeyPair};
use wgmesh_store::{CoordinationStore, MemoryStore};

fn alive(nodes: &[&str]) -> BTreeSet<String> {
	nodes.iter().map(|n| n.to_string()).collect()
}

async fn join(store: &Arc<MemoryStore>, dir: &TempDir, node: &str, endpoint: &str) -> Joined {
	let view: Arc<dyn CoordinationStore> = Arc::new(store.view_as(node));
	JoinProtocol::new(
		view,
		RecordingManager::new(),
		node_config(dir.path(), endpoint, cattle("10.0.0.0/24")),
	)
	.run()
	.await
	.unwrap()
}

fn gc_for(store: &Arc<MemoryStore>, joined: &Joined) -> MembershipGc {
	MembershipGc::new(
		store.clone(),
		namespace(),
		joined.record.node.clone().unwrap(),
		joined.record.public_key,
	)
}

fn has_key(store: &MemoryStore, joined: &Joined) -> bool {
	store
		.peers(&namespace())
		.iter()
		.any(|p| p.public_key == joined.record.public_key)
}

#[tokio::test]
async fn departed_node_record_is_collected() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("a"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;
	let c = join(&store, &dir, "c", "192.0.2.3").await;

	let placeholder = Peer {
		public_key: *WgKeyPair::generate().public_key(),
		ip: Some("10.0.0.200".parse().unwrap()),
		endpoint_ip: None,
		endpoint_port: 0,
		allowed_ips: "10.0.0.200/32".parse().unwrap(),
		node: None,
	};
	store.insert_raw(&namespace(), placeholder.clone());

	let deleted = gc_for(&store, &a).collect(&alive(&["a", "c"])).await.unwrap();

	assert_eq!(deleted, 1);
	assert!(has_key(&store, &a));
	assert!(!has_key(&store, &b));
	assert!(has_key(&store, &c));
	assert!(store.peers(&namespace()).contains(&placeholder));
}

#[tokio::test]
async fn local_record_survives_a_view_without_it() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("d"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;
	let c = join(&store, &dir, "c", "192.0.2.3").await;
	let d = join(&store, &dir, "d", "192.0.2.4").await;

	// The local node is wrongly reported dead: b still goes, d stays.
	let deleted = gc_for(&store, &d).collect(&alive(&["a", "c"])).await.unwrap();

	assert_eq!(deleted, 1);
	assert!(has_key(&store, &a));
	assert!(!has_key(&store, &b));
	assert!(has_key(&store, &c));
	assert!(has_key(&store, &d));
}

#[tokio::test]
async fn empty_view_collects_nothing() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("a"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;

	let deleted = gc_for(&store, &a).collect(&BTreeSet::new()).await.unwrap();

	assert_eq!(deleted, 0);
	assert!(has_key(&store, &a));
	assert!(has_key(&store, &b));
}

#[tokio::test]
async fn loop_collects_on_membership_change() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("a"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;
	store.set_members(["a", "b"]);

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let task = tokio::spawn(gc_for(&store, &a).run(shutdown_rx));

	tokio::task::yield_now().await;
	assert!(has_key(&store, &b));

	store.set_members(["a"]);
	let (s, bb) = (store.clone(), b.clone());
	eventually("departed record removed", move || {
		let (s, bb) = (s.clone(), bb.clone());
		async move { !has_key(&s, &bb) }
	})
	.await;
	assert!(has_key(&store, &a));

	shutdown_tx.send(true).unwrap();
	task.await.unwrap().unwrap();
}

#[tokio::test]
async fn restarted_node_rejoins_after_being_collected() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("a"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;

	// b restarts: it drops out of the membership view and a collects it.
	gc_for(&store, &a).collect(&alive(&["a"])).await.unwrap();
	assert!(!has_key(&store, &b));

	// b comes back with the same key and endpoint and gets the same address.
	store.set_members(["a", "b"]);
	let rejoined = join(&store, &dir, "b", "192.0.2.2").await;
	assert_eq!(rejoined.record, b.record);
	assert!(has_key(&store, &b));

	// Later passes leave it alone.
	assert_eq!(
		gc_for(&store, &a).collect(&alive(&["a", "b"])).await.unwrap(),
		0
	);
}

#[tokio::test]
async fn running_node_restores_record_collected_during_membership_flap() {
	let dir = TempDir::new().unwrap();
	let store = Arc::new(MemoryStore::new("a"));
	let a = join(&store, &dir, "a", "192.0.2.1").await;
	let b = join(&store, &dir, "b", "192.0.2.2").await;

	let b_view: Arc<dyn CoordinationStore> = Arc::new(store.view_as("b"));
	let b_state = Arc::new(MeshState::new(b.peers.clone()));
	let reconciler = KvReconciler::new(
		b_view,
		RecordingManager::new(),
		namespace(),
		b.interface.clone(),
		b.record.clone(),
		b_state,
	);
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let task = tokio::spawn(reconciler.run(shutdown_rx));
	tokio::task::yield_now().await;

	gc_for(&store, &a).collect(&alive(&["a"])).await.unwrap();

	let (s, bb) = (store.clone(), b.clone());
	eventually("record restored by its owner", move || {
		let (s, bb) = (s.clone(), bb.clone());
		async move { has_key(&s, &bb) }
	})
	.await;
	let restored = store
		.peers(&namespace())
		.into_iter()
		.find(|p| p.public_key == b.record.public_key)
		.unwrap();
	assert_eq!(restored, b.record);

	shutdown_tx.send(true).unwrap();
	task.await.unwrap().unwrap();
}
