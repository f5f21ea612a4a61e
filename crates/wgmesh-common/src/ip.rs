// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tunnel address bookkeeping over a mesh's peer set.
//!
//! Peer sets are mesh sized, so lookups are plain linear scans and allocation
//! walks the range in ascending order. Nothing here touches the store.

use crate::peer::Peer;
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
	#[error("tunnel IP {ip} is already used by another client")]
	IpOwnedByNonEndpointPeer { ip: IpAddr },

	#[error("tunnel IP {ip} is already used by another server {endpoint}")]
	IpOwnedByOtherServer { ip: IpAddr, endpoint: IpAddr },

	#[error("endpoint IP {endpoint} is already registered {}", registered_as(.ip))]
	EndpointAlreadyRegistered {
		endpoint: IpAddr,
		ip: Option<IpAddr>,
	},

	#[error("all IPs in {range} are used")]
	RangeExhausted { range: IpNet },
}

pub type Result<T> = std::result::Result<T, AllocationError>;

fn registered_as(ip: &Option<IpAddr>) -> String {
	match ip {
		Some(ip) => format!("with another tunnel IP {ip}"),
		None => "without a tunnel IP".to_string(),
	}
}

pub fn find_by_ip(peers: &[Peer], ip: IpAddr) -> Option<&Peer> {
	peers.iter().find(|p| p.ip == Some(ip))
}

pub fn find_by_endpoint(peers: &[Peer], endpoint_ip: IpAddr) -> Option<&Peer> {
	peers.iter().find(|p| p.has_same_endpoint_ip(endpoint_ip))
}

/// Host addresses of `range` in ascending order, without the network address
/// (and without the IPv4 broadcast address for prefixes shorter than /31).
pub fn candidate_hosts(range: IpNet) -> impl Iterator<Item = IpAddr> {
	let network = range.network();
	range.hosts().filter(move |ip| *ip != network)
}

/// Returns the lowest host address in `range` that no peer holds.
pub fn allocate_from_range(range: IpNet, peers: &[Peer]) -> Result<IpAddr> {
	candidate_hosts(range)
		.find(|ip| find_by_ip(peers, *ip).is_none())
		.ok_or(AllocationError::RangeExhausted { range })
}

/// Single-address route for `ip`: `/32` for IPv4, `/128` for IPv6.
pub fn host_net(ip: IpAddr) -> IpNet {
	IpNet::from(ip)
}
