// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Startup critical section: claim a tunnel address under the namespace lock,
//! bring the interface up and publish this node's peer record.

use crate::config::{NodeConfig, Role};
use crate::error::JoinError;
use crate::lock::NamespaceLock;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use wgmesh_common::{
	allocate_from_range, find_by_endpoint, find_by_ip, get_or_create_keypair, host_net,
	AllocationError, AllowedIps, Interface, Peer,
};
use wgmesh_store::CoordinationStore;
use wgmesh_wireguard::InterfaceManager;

/// Outcome of the address decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
	pub ip: IpAddr,
	/// Existing record this node is taking back over, if any.
	pub reused: Option<Peer>,
	/// Address-less record registered for this endpoint, to be replaced.
	pub displaced: Option<Peer>,
}

/// Picks the tunnel address for a node with `endpoint_ip` given the current
/// peer set.
pub fn decide(
	role: &Role,
	endpoint_ip: IpAddr,
	peers: &[Peer],
) -> Result<Decision, AllocationError> {
	match *role {
		Role::Pet { ip } => match find_by_ip(peers, ip) {
			Some(owner) => match owner.endpoint_ip {
				None => Err(AllocationError::IpOwnedByNonEndpointPeer { ip }),
				Some(endpoint) if endpoint != endpoint_ip => {
					Err(AllocationError::IpOwnedByOtherServer { ip, endpoint })
				}
				Some(_) => Ok(Decision {
					ip,
					reused: Some(owner.clone()),
					displaced: None,
				}),
			},
			None => match find_by_endpoint(peers, endpoint_ip) {
				Some(other) => Err(AllocationError::EndpointAlreadyRegistered {
					endpoint: endpoint_ip,
					ip: other.ip,
				}),
				None => Ok(Decision {
					ip,
					reused: None,
					displaced: None,
				}),
			},
		},
		Role::Cattle { range } => match find_by_endpoint(peers, endpoint_ip) {
			Some(owner) => match owner.ip {
				Some(ip) => Ok(Decision {
					ip,
					reused: Some(owner.clone()),
					displaced: None,
				}),
				None => Ok(Decision {
					ip: allocate_from_range(range, peers)?,
					reused: None,
					displaced: Some(owner.clone()),
				}),
			},
			None => Ok(Decision {
				ip: allocate_from_range(range, peers)?,
				reused: None,
				displaced: None,
			}),
		},
	}
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct Joined {
	pub interface: Interface,
	/// This node's record as published.
	pub record: Peer,
	/// Remote peers the interface was configured with.
	pub peers: Vec<Peer>,
}

pub struct JoinProtocol {
	store: Arc<dyn CoordinationStore>,
	manager: Arc<dyn InterfaceManager>,
	config: NodeConfig,
}

impl JoinProtocol {
	pub fn new(
		store: Arc<dyn CoordinationStore>,
		manager: Arc<dyn InterfaceManager>,
		config: NodeConfig,
	) -> Self {
		Self {
			store,
			manager,
			config,
		}
	}

	/// Runs the critical section once. The lock is released whatever the
	/// outcome; nothing already done is rolled back on failure.
	#[instrument(skip(self), fields(namespace = %self.config.namespace, endpoint = %self.config.endpoint_ip))]
	pub async fn run(&self) -> Result<Joined, JoinError> {
		let lock = NamespaceLock::acquire(
			self.store.clone(),
			&self.config.namespace,
			&self.config.identity(),
		)
		.await?;

		let result = self.critical_section().await;

		if let Err(e) = lock.release().await {
			warn!(error = %e, "failed to release namespace lock");
		}
		result
	}

	async fn critical_section(&self) -> Result<Joined, JoinError> {
		let config = &self.config;
		let peers = self.store.get_peers(&config.namespace).await?;
		debug!(peers = peers.len(), "read peer set");

		let decision = decide(&config.role, config.endpoint_ip, &peers)?;
		match &decision.reused {
			Some(_) => info!(ip = %decision.ip, "reusing registered tunnel IP"),
			None => info!(ip = %decision.ip, "claiming tunnel IP"),
		}

		let keypair = get_or_create_keypair(&config.key_folder).await?;
		let interface = Interface {
			name: config.interface_name.clone(),
			address: self.interface_address(decision.ip),
			listen_port: config.listen_port,
			keypair,
			post_up: config.post_up.clone(),
			post_down: config.post_down.clone(),
		};

		let node = self.store.local_node().await?;
		let record = Peer {
			public_key: *interface.public_key(),
			ip: Some(decision.ip),
			endpoint_ip: Some(config.endpoint_ip),
			endpoint_port: config.listen_port,
			allowed_ips: self.own_allowed_ips(decision.ip),
			node: Some(node),
		};

		// A reused record under another key is this node's own, written before
		// its key file was lost. An address-less record at this endpoint goes
		// too, unless another node owns it.
		let displaced = decision
			.displaced
			.iter()
			.filter(|p| p.node.is_none() || p.node == record.node);
		let stale: Vec<&Peer> = decision
			.reused
			.iter()
			.chain(displaced)
			.filter(|p| p.public_key != record.public_key)
			.collect();
		let kept = decision
			.displaced
			.as_ref()
			.filter(|p| p.public_key != record.public_key && !stale.contains(p));
		if let Some(kept) = kept {
			warn!(
				key = %kept.public_key,
				owner = ?kept.node,
				"endpoint also registered without a tunnel IP by another node, leaving it"
			);
		}

		let remote: Vec<Peer> = peers
			.iter()
			.filter(|p| p.public_key != record.public_key)
			.filter(|p| !stale.iter().any(|s| s.public_key == p.public_key))
			.cloned()
			.collect();

		self.manager.configure(&interface, &remote).await?;

		for stale in stale {
			warn!(stale_key = %stale.public_key, "replacing stale record registered for this endpoint");
			self.store
				.delete_peer(&config.namespace, &stale.public_key)
				.await?;
		}

		if peers.contains(&record) {
			debug!("peer record unchanged, not republishing");
		} else {
			self.store
				.put_peer(&config.namespace, &interface, &record)
				.await?;
			info!(ip = %decision.ip, "published peer record");
		}

		Ok(Joined {
			interface,
			record,
			peers: remote,
		})
	}

	fn interface_address(&self, ip: IpAddr) -> IpNet {
		match (self.config.relay, self.config.range) {
			(true, Some(range)) => IpNet::new(ip, range.prefix_len()).unwrap_or_else(|_| host_net(ip)),
			_ => host_net(ip),
		}
	}

	fn own_allowed_ips(&self, ip: IpAddr) -> AllowedIps {
		let mut nets = self.config.extra_allowed_ips.clone();
		nets.push(host_net(ip));
		if self.config.relay {
			nets.extend(self.config.range);
		}
		AllowedIps::new(nets)
	}
}
