// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use wgmesh_common::AllowedIps;
use wgmesh_store::{ConsulConfig, Namespace};
use wgmesh_wireguard::{probe, InterfaceError};

/// Self-organizing WireGuard mesh over a shared coordination store
#[derive(Parser, Debug, Clone)]
#[command(name = "wgmesh", version)]
pub struct Args {
	/// Coordination store backend
	#[arg(long, env = "WGMESH_BACKEND", value_enum, default_value_t = Backend::Consul)]
	pub backend: Backend,

	/// Coordination store address
	#[arg(long, env = "WGMESH_CS_ADDR", default_value = "127.0.0.1:8500")]
	pub cs_addr: String,

	/// Coordination store ACL token
	#[arg(long, env = "WGMESH_CS_TOKEN", hide_env_values = true)]
	pub cs_token: Option<String>,

	/// Prefix in the KV store under which mesh state is kept
	#[arg(long, env = "WGMESH_CS_KV_PREFIX", default_value = "wgmesh")]
	pub cs_kv_prefix: String,

	/// Give up waiting for the join lock after this many seconds (waits forever when unset)
	#[arg(long, env = "WGMESH_CS_LOCK_TIMEOUT_SECS")]
	pub cs_lock_timeout_secs: Option<u64>,

	/// WireGuard config folder
	#[arg(long, env = "WGMESH_WG_CONFIG_FOLDER", default_value = "/etc/wireguard")]
	pub wg_config_folder: PathBuf,

	/// Act as a relay for the whole range (requires --wg-range)
	#[arg(long, env = "WGMESH_WG_RELAY")]
	pub wg_relay: bool,

	/// WireGuard interface name
	#[arg(long, env = "WGMESH_WG_IF_NAME", default_value = "wg0")]
	pub wg_if_name: String,

	/// Tunnel CIDR to allocate from; ignored for allocation when --wg-ip is set
	#[arg(long, env = "WGMESH_WG_RANGE")]
	pub wg_range: Option<IpNet>,

	/// Fixed tunnel IP; when unset an unused IP is picked from --wg-range
	#[arg(long, env = "WGMESH_WG_IP")]
	pub wg_ip: Option<IpAddr>,

	/// WireGuard listen port
	#[arg(long, env = "WGMESH_WG_PORT", default_value_t = 51820)]
	pub wg_port: u16,

	/// Network interface whose address is used as the endpoint IP
	#[arg(long, env = "WGMESH_WG_ENDPOINT_IF_NAME")]
	pub wg_endpoint_if_name: Option<String>,

	/// Endpoint IP other peers connect to
	#[arg(long, env = "WGMESH_WG_ENDPOINT_IP")]
	pub wg_endpoint_ip: Option<IpAddr>,

	/// Extra allowed IPs advertised for this node (comma separated CIDRs)
	#[arg(long, env = "WGMESH_WG_ALLOWED_IPS")]
	pub wg_allowed_ips: Option<AllowedIps>,

	/// Command run after the interface is up
	#[arg(long, env = "WGMESH_WG_POST_UP")]
	pub wg_post_up: Option<String>,

	/// Command run after the interface is down
	#[arg(long, env = "WGMESH_WG_POST_DOWN")]
	pub wg_post_down: Option<String>,

	/// Remove peers whose node left the cluster
	#[arg(long, env = "WGMESH_GC_ENABLE")]
	pub gc_enable: bool,

	/// Log level used when RUST_LOG is not set
	#[arg(long, env = "WGMESH_LOG_LEVEL", default_value = "info")]
	pub log_level: String,

	/// Log output format
	#[arg(long, env = "WGMESH_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
	pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
	Consul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
	Pretty,
	Json,
}

/// How the node obtains its tunnel address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// Operator-fixed address that is validated against the store.
	Pet { ip: IpAddr },
	/// Address reclaimed by endpoint or allocated from the range.
	Cattle { range: IpNet },
}

/// Fully resolved node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
	pub namespace: Namespace,
	pub interface_name: String,
	pub config_folder: PathBuf,
	pub key_folder: PathBuf,
	pub role: Role,
	pub range: Option<IpNet>,
	pub relay: bool,
	pub listen_port: u16,
	pub endpoint_ip: IpAddr,
	pub extra_allowed_ips: Vec<IpNet>,
	pub post_up: Option<String>,
	pub post_down: Option<String>,
	pub gc_enable: bool,
}

impl NodeConfig {
	/// Value recorded as the holder of the join lock.
	pub fn identity(&self) -> String {
		self.endpoint_ip.to_string()
	}
}

/// Host interface lookups needed while resolving configuration.
pub trait HostProbe {
	fn interface_address(&self, name: &str) -> Result<IpNet, InterfaceError>;
	fn interface_exists(&self, name: &str) -> Result<bool, InterfaceError>;
}

/// [`HostProbe`] over the real network interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
	fn interface_address(&self, name: &str) -> Result<IpNet, InterfaceError> {
		probe::interface_address(name)
	}

	fn interface_exists(&self, name: &str) -> Result<bool, InterfaceError> {
		probe::is_interface_up(name)
	}
}

impl Args {
	pub fn resolve(&self, host: &dyn HostProbe) -> Result<NodeConfig, ConfigError> {
		if self.wg_ip.is_none() && self.wg_range.is_none() {
			return Err(ConfigError::MissingAddress);
		}
		if self.wg_relay && self.wg_range.is_none() {
			return Err(ConfigError::RelayWithoutRange);
		}

		let endpoint_ip = match (self.wg_endpoint_ip, self.wg_endpoint_if_name.as_deref()) {
			(Some(ip), _) => ip,
			(None, Some(name)) => {
				info!(interface = %name, "--wg-endpoint-ip is not set, resolving it from interface");
				let ip = host
					.interface_address(name)
					.map_err(|source| ConfigError::EndpointLookup {
						name: name.to_string(),
						source,
					})?
					.addr();
				info!(%ip, "using endpoint IP");
				ip
			}
			(None, None) => return Err(ConfigError::MissingEndpoint),
		};

		let ip = match self.wg_ip {
			Some(ip) => Some(ip),
			None => self.running_interface_ip(host)?,
		};

		let role = match (ip, self.wg_range) {
			(Some(ip), _) => Role::Pet { ip },
			(None, Some(range)) => Role::Cattle { range },
			(None, None) => return Err(ConfigError::MissingAddress),
		};

		if let (Role::Pet { ip }, Some(range), true) = (role, self.wg_range, self.wg_relay) {
			if ip.is_ipv4() != range.addr().is_ipv4() {
				return Err(ConfigError::FamilyMismatch { ip, range });
			}
		}

		Ok(NodeConfig {
			namespace: Namespace::new(&self.cs_kv_prefix, &self.wg_if_name),
			interface_name: self.wg_if_name.clone(),
			config_folder: self.wg_config_folder.clone(),
			key_folder: self.wg_config_folder.join(&self.wg_if_name),
			role,
			range: self.wg_range.map(|r| r.trunc()),
			relay: self.wg_relay,
			listen_port: self.wg_port,
			endpoint_ip,
			extra_allowed_ips: self
				.wg_allowed_ips
				.as_ref()
				.map(|a| a.as_slice().to_vec())
				.unwrap_or_default(),
			post_up: self.wg_post_up.clone().filter(|s| !s.is_empty()),
			post_down: self.wg_post_down.clone().filter(|s| !s.is_empty()),
			gc_enable: self.gc_enable,
		})
	}

	/// A restarted node keeps the address its interface is already running with.
	fn running_interface_ip(&self, host: &dyn HostProbe) -> Result<Option<IpAddr>, ConfigError> {
		let name = &self.wg_if_name;
		let probe_err = |source| ConfigError::InterfaceProbe {
			name: name.clone(),
			source,
		};

		if !host.interface_exists(name).map_err(probe_err)? {
			return Ok(None);
		}
		match host.interface_address(name) {
			Ok(net) => {
				info!(interface = %name, ip = %net.addr(), "adopting address of running interface");
				Ok(Some(net.addr()))
			}
			Err(InterfaceError::NoAddress(_)) => Ok(None),
			Err(source) => Err(probe_err(source)),
		}
	}

	pub fn consul_config(&self) -> ConsulConfig {
		let mut config = ConsulConfig::new(self.cs_addr.clone());
		config.token = self.cs_token.clone().filter(|t| !t.is_empty());
		config.lock_timeout = self.cs_lock_timeout_secs.map(Duration::from_secs);
		config
	}
}
