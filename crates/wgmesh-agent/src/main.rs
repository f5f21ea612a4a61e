// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wgmesh_agent::{Args, Backend, LogFormat, MeshDaemon, SystemProbe};
use wgmesh_store::{ConsulStore, CoordinationStore};
use wgmesh_wireguard::WgQuickManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_tracing(&args);

	let config = args
		.resolve(&SystemProbe)
		.context("invalid configuration")?;

	let store: Arc<dyn CoordinationStore> = match args.backend {
		Backend::Consul => Arc::new(
			ConsulStore::new(args.consul_config()).context("failed to set up consul client")?,
		),
	};
	let manager = Arc::new(WgQuickManager::new(config.config_folder.clone()));

	info!(
		namespace = %config.namespace,
		endpoint = %config.endpoint_ip,
		role = ?config.role,
		relay = config.relay,
		gc = config.gc_enable,
		"starting wgmesh"
	);

	let daemon = MeshDaemon::new(config, store, manager);
	tokio::spawn(forward_signals(daemon.shutdown_handle()));

	daemon.run().await?;
	Ok(())
}

fn init_tracing(args: &Args) {
	let filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	let registry = tracing_subscriber::registry().with(filter);

	match args.log_format {
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json())
			.init(),
		LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
	}
}

async fn forward_signals(shutdown: watch::Sender<bool>) {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		let mut terminate = match signal(SignalKind::terminate()) {
			Ok(s) => s,
			Err(e) => {
				warn!(error = %e, "failed to install SIGTERM handler");
				let _ = tokio::signal::ctrl_c().await;
				let _ = shutdown.send(true);
				return;
			}
		};
		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("received SIGINT"),
			_ = terminate.recv() => info!("received SIGTERM"),
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
		info!("received Ctrl-C");
	}

	let _ = shutdown.send(true);
}
