// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{InterfaceError, Result};
use crate::probe;
use crate::render::{render_syncconf, render_wg_quick};
use crate::render::remote_peers;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn};
use wgmesh_common::{Interface, Peer};

/// Applies mesh state to the local WireGuard device.
#[async_trait]
pub trait InterfaceManager: Send + Sync {
	/// Persists the full configuration and (re)starts the interface.
	async fn configure(&self, interface: &Interface, peers: &[Peer]) -> Result<()>;

	/// Replaces the running interface's peer list without restarting it.
	async fn sync_peers(&self, interface: &Interface, peers: &[Peer]) -> Result<()>;
}

/// Remote allowed-IPs that need a route through `interface`.
///
/// Nets inside the interface's own prefix are already reachable through its
/// connected route, and default routes are left to wg-quick's policy routing.
pub fn peer_routes(interface: &Interface, peers: &[Peer]) -> BTreeSet<IpNet> {
	let local = interface.address.trunc();
	remote_peers(interface, peers)
		.into_iter()
		.flat_map(|p| p.allowed_ips.as_slice().iter().map(IpNet::trunc))
		.filter(|net| net.prefix_len() > 0 && !local.contains(net))
		.collect()
}

/// [`InterfaceManager`] backed by the `wg-quick`, `wg` and `ip` command line
/// tools.
#[derive(Debug, Clone)]
pub struct WgQuickManager {
	config_folder: PathBuf,
	wg_quick: String,
	wg: String,
	ip: String,
	/// Peer routes currently installed on the interface.
	routes: Arc<Mutex<BTreeSet<IpNet>>>,
}

impl WgQuickManager {
	pub fn new(config_folder: impl Into<PathBuf>) -> Self {
		Self {
			config_folder: config_folder.into(),
			wg_quick: "wg-quick".to_string(),
			wg: "wg".to_string(),
			ip: "ip".to_string(),
			routes: Arc::default(),
		}
	}

	/// Overrides the binaries invoked, e.g. to run through a wrapper.
	pub fn with_tools(
		mut self,
		wg_quick: impl Into<String>,
		wg: impl Into<String>,
		ip: impl Into<String>,
	) -> Self {
		self.wg_quick = wg_quick.into();
		self.wg = wg.into();
		self.ip = ip.into();
		self
	}

	pub fn config_path(&self, interface: &Interface) -> PathBuf {
		self.config_folder.join(format!("{}.conf", interface.name))
	}

	async fn write_config(&self, interface: &Interface, peers: &[Peer]) -> Result<PathBuf> {
		let path = self.config_path(interface);
		let contents = render_wg_quick(interface, peers);
		write_private(&path, contents.as_bytes())
			.await
			.map_err(|source| InterfaceError::ConfigWrite {
				path: path.clone(),
				source,
			})?;
		debug!(path = %path.display(), "wrote WireGuard config");
		Ok(path)
	}

	/// `wg syncconf` leaves the routing table alone, so peers added after
	/// `wg-quick up` need their routes installed here.
	async fn converge_routes(&self, interface: &Interface, peers: &[Peer]) -> Result<()> {
		let desired = peer_routes(interface, peers);
		let mut installed = self.routes.lock().await;

		for net in &desired {
			let cidr = net.to_string();
			run_tool(
				&self.ip,
				&[family(net), "route", "replace", &cidr, "dev", &interface.name],
				None,
			)
			.await?;
		}

		for net in installed.difference(&desired) {
			let cidr = net.to_string();
			match run_tool(
				&self.ip,
				&[family(net), "route", "del", &cidr, "dev", &interface.name],
				None,
			)
			.await
			{
				Ok(_) => debug!(route = %net, "removed peer route"),
				Err(e) => warn!(route = %net, error = %e, "failed to remove peer route"),
			}
		}

		*installed = desired;
		Ok(())
	}
}

fn family(net: &IpNet) -> &'static str {
	match net {
		IpNet::V4(_) => "-4",
		IpNet::V6(_) => "-6",
	}
}

#[async_trait]
impl InterfaceManager for WgQuickManager {
	#[instrument(skip_all, fields(interface = %interface.name, address = %interface.address))]
	async fn configure(&self, interface: &Interface, peers: &[Peer]) -> Result<()> {
		let path = self.write_config(interface, peers).await?;
		let path_arg = path.to_string_lossy().into_owned();

		if probe::is_interface_up(&interface.name)? {
			info!("interface already exists, restarting it");
			run_tool(&self.wg_quick, &["down", &path_arg], None).await?;
		}
		run_tool(&self.wg_quick, &["up", &path_arg], None).await?;
		*self.routes.lock().await = peer_routes(interface, peers);

		info!(peers = peers.len(), "WireGuard interface is up");
		Ok(())
	}

	#[instrument(skip_all, fields(interface = %interface.name))]
	async fn sync_peers(&self, interface: &Interface, peers: &[Peer]) -> Result<()> {
		// Keep the file current so a restart comes up with the latest peers.
		self.write_config(interface, peers).await?;

		let conf = render_syncconf(interface, peers);
		run_tool(
			&self.wg,
			&["syncconf", &interface.name, "/dev/stdin"],
			Some(conf.as_bytes()),
		)
		.await?;
		self.converge_routes(interface, peers).await?;

		debug!(peers = peers.len(), "synced WireGuard peers");
		Ok(())
	}
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}

	let mut options = tokio::fs::OpenOptions::new();
	options.write(true).create(true).truncate(true);
	#[cfg(unix)]
	options.mode(0o600);

	let mut file = options.open(path).await?;
	file.write_all(contents).await?;
	file.flush().await?;

	// `mode` only applies on create; tighten files left by older runs.
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
	}
	Ok(())
}

/// Runs `tool args...`, feeding `stdin` if given, and fails on a non-zero exit.
async fn run_tool(tool: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
	trace!(cmd = %format!("{tool} {}", args.join(" ")), "running command");

	let mut cmd = Command::new(tool);
	cmd.args(args)
		.stdin(if stdin.is_some() {
			Stdio::piped()
		} else {
			Stdio::null()
		})
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.kill_on_drop(true);

	let mut child = cmd.spawn().map_err(|e| {
		if e.kind() == ErrorKind::NotFound {
			warn!(%tool, "tool not found in PATH");
			InterfaceError::ToolNotInstalled {
				tool: tool.to_string(),
			}
		} else {
			InterfaceError::Io(e)
		}
	})?;

	if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
		match pipe.write_all(input).await {
			// The exit status below decides whether the tool succeeded.
			Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
			other => other?,
		}
	}

	let output = child.wait_with_output().await?;
	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
	} else {
		Err(InterfaceError::CommandFailed {
			cmd: tool.to_string(),
			args: args.iter().map(|s| s.to_string()).collect(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;
	use wgmesh_common::{Peer, WgKeyPair};

	fn interface() -> Interface {
		interface_at("10.0.0.1/32")
	}

	fn interface_at(address: &str) -> Interface {
		Interface {
			name: "wgmesh-test0".to_string(),
			address: address.parse().unwrap(),
			listen_port: 51820,
			keypair: WgKeyPair::generate(),
			post_up: None,
			post_down: None,
		}
	}

	#[tokio::test]
	async fn configure_writes_private_config_then_runs_wg_quick() {
		let dir = TempDir::new().unwrap();
		let manager = WgQuickManager::new(dir.path().join("nested")).with_tools("true", "true", "true");
		let iface = interface();

		manager.configure(&iface, &[]).await.unwrap();

		let path = manager.config_path(&iface);
		assert_eq!(path, dir.path().join("nested/wgmesh-test0.conf"));
		let contents = tokio::fs::read_to_string(&path).await.unwrap();
		assert!(contents.contains("Address = 10.0.0.1/32"));

		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = std::fs::metadata(&path).unwrap().permissions().mode();
			assert_eq!(mode & 0o777, 0o600);
		}
	}

	#[tokio::test]
	async fn failing_tool_is_reported() {
		let dir = TempDir::new().unwrap();
		let manager = WgQuickManager::new(dir.path()).with_tools("false", "false", "false");

		let err = manager.sync_peers(&interface(), &[]).await.unwrap_err();
		match err {
			InterfaceError::CommandFailed { cmd, args, .. } => {
				assert_eq!(cmd, "false");
				assert_eq!(args, vec!["syncconf", "wgmesh-test0", "/dev/stdin"]);
			}
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test]
	async fn missing_tool_is_reported() {
		let dir = TempDir::new().unwrap();
		let manager =
			WgQuickManager::new(dir.path()).with_tools("wgmesh-no-such-tool", "wgmesh-no-such-tool", "true");

		let err = manager.configure(&interface(), &[]).await.unwrap_err();
		assert!(matches!(err, InterfaceError::ToolNotInstalled { .. }));
	}

	#[tokio::test]
	async fn sync_peers_feeds_config_on_stdin() {
		let dir = TempDir::new().unwrap();
		let manager = WgQuickManager::new(dir.path()).with_tools("true", "true", "true");
		manager.sync_peers(&interface(), &[]).await.unwrap();
	}

	fn peer(allowed_ips: &str) -> Peer {
		Peer {
			public_key: *WgKeyPair::generate().public_key(),
			ip: None,
			endpoint_ip: Some("192.0.2.10".parse().unwrap()),
			endpoint_port: 51820,
			allowed_ips: allowed_ips.parse().unwrap(),
			node: None,
		}
	}

	/// A stand-in `ip` that appends its arguments to `log`.
	#[cfg(unix)]
	fn recording_tool(dir: &Path) -> (String, PathBuf) {
		use std::os::unix::fs::PermissionsExt;

		let log = dir.join("ip.log");
		let script = dir.join("ip");
		std::fs::write(
			&script,
			format!("#!/bin/sh\nprintf '%s\\n' \"$*\" >> '{}'\n", log.display()),
		)
		.unwrap();
		std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
		(script.to_string_lossy().into_owned(), log)
	}

	#[cfg(unix)]
	fn logged(log: &Path) -> Vec<String> {
		std::fs::read_to_string(log)
			.unwrap_or_default()
			.lines()
			.map(str::to_string)
			.collect()
	}

	#[test]
	fn peer_routes_skip_own_prefix_and_default_routes() {
		let iface = interface_at("10.0.0.1/24");
		let peers = vec![
			peer("10.0.0.2/32"),
			peer("10.1.0.0/16, 0.0.0.0/0"),
			peer("fd00::2/128"),
		];

		let routes: Vec<String> = peer_routes(&iface, &peers)
			.iter()
			.map(ToString::to_string)
			.collect();
		assert_eq!(routes, vec!["10.1.0.0/16", "fd00::2/128"]);
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn sync_peers_routes_new_peers_and_drops_departed_ones() {
		let dir = TempDir::new().unwrap();
		let (ip, log) = recording_tool(dir.path());
		let manager = WgQuickManager::new(dir.path()).with_tools("true", "true", ip);
		let iface = interface();
		let b = peer("10.0.0.2/32");
		let c = peer("10.0.0.3/32");

		// wg-quick up installs routes for the peers it starts with.
		manager.configure(&iface, &[b.clone()]).await.unwrap();
		assert!(logged(&log).is_empty());

		manager.sync_peers(&iface, &[b, c.clone()]).await.unwrap();
		assert_eq!(
			logged(&log),
			vec![
				"-4 route replace 10.0.0.2/32 dev wgmesh-test0",
				"-4 route replace 10.0.0.3/32 dev wgmesh-test0",
			]
		);

		std::fs::remove_file(&log).unwrap();
		manager.sync_peers(&iface, &[c]).await.unwrap();
		assert_eq!(
			logged(&log),
			vec![
				"-4 route replace 10.0.0.3/32 dev wgmesh-test0",
				"-4 route del 10.0.0.2/32 dev wgmesh-test0",
			]
		);
	}
}
