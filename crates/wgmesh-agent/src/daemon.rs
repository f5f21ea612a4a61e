// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::NodeConfig;
use crate::error::{DaemonError, Result};
use crate::gc::MembershipGc;
use crate::join::{JoinProtocol, Joined};
use crate::reconcile::KvReconciler;
use crate::state::MeshState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};
use wgmesh_store::{CoordinationStore, StoreError};
use wgmesh_wireguard::InterfaceManager;

type LoopHandle = JoinHandle<std::result::Result<(), StoreError>>;

/// Joins the mesh, then runs the reconciliation loops until shutdown.
pub struct MeshDaemon {
	config: NodeConfig,
	store: Arc<dyn CoordinationStore>,
	manager: Arc<dyn InterfaceManager>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl MeshDaemon {
	pub fn new(
		config: NodeConfig,
		store: Arc<dyn CoordinationStore>,
		manager: Arc<dyn InterfaceManager>,
	) -> Self {
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		Self {
			config,
			store,
			manager,
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Sender that stops the daemon when `true` is sent.
	pub fn shutdown_handle(&self) -> watch::Sender<bool> {
		self.shutdown_tx.clone()
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	#[instrument(skip(self), fields(interface = %self.config.interface_name))]
	pub async fn run(&self) -> Result<()> {
		info!("starting wgmesh");

		let join = JoinProtocol::new(
			self.store.clone(),
			self.manager.clone(),
			self.config.clone(),
		);
		let mut shutdown = self.shutdown_rx.clone();
		let joined = tokio::select! {
			joined = join.run() => joined?,
			_ = shutdown_requested(&mut shutdown) => {
				info!("shutdown requested before join completed");
				return Ok(());
			}
		};
		info!(
			address = %joined.interface.address,
			public_key = %joined.interface.public_key(),
			"joined mesh"
		);

		let (state, reconciler, gc) = self.spawn_loops(joined).await?;
		let result = match gc {
			Some(gc) => tokio::try_join!(flatten(reconciler), flatten(gc)).map(|_| ()),
			None => flatten(reconciler).await,
		};

		// One loop failing takes the other down with it.
		self.shutdown();

		let applied = state.snapshot();
		info!(peers = applied.peers.len(), revision = applied.revision, "wgmesh stopped");
		result
	}

	async fn spawn_loops(
		&self,
		joined: Joined,
	) -> Result<(Arc<MeshState>, LoopHandle, Option<LoopHandle>)> {
		let state = Arc::new(MeshState::new(joined.peers));

		let gc = if self.config.gc_enable {
			let local_node = match joined.record.node.clone() {
				Some(node) => node,
				None => self.store.local_node().await?,
			};
			let gc = MembershipGc::new(
				self.store.clone(),
				self.config.namespace.clone(),
				local_node,
				*joined.interface.public_key(),
			);
			Some(tokio::spawn(gc.run(self.shutdown_rx.clone())))
		} else {
			info!("peer garbage collection disabled");
			None
		};

		let reconciler = KvReconciler::new(
			self.store.clone(),
			self.manager.clone(),
			self.config.namespace.clone(),
			joined.interface,
			joined.record,
			state.clone(),
		);
		let reconciler = tokio::spawn(reconciler.run(self.shutdown_rx.clone()));

		Ok((state, reconciler, gc))
	}
}

async fn flatten(handle: LoopHandle) -> Result<()> {
	match handle.await {
		Ok(result) => result.map_err(DaemonError::from),
		Err(e) => Err(DaemonError::Task(e.to_string())),
	}
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
	let _ = rx.wait_for(|stop| *stop).await;
}
