// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lookups against the host's network interfaces.

use crate::error::{InterfaceError, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use nix::ifaddrs::{getifaddrs, InterfaceAddress};
use tracing::debug;

/// First address assigned to interface `name`, IPv4 preferred, with the
/// prefix length of its netmask.
pub fn interface_address(name: &str) -> Result<IpNet> {
	let mut v6 = None;
	for ifaddr in getifaddrs()?.filter(|a| a.interface_name == name) {
		match to_net(&ifaddr) {
			Some(net @ IpNet::V4(_)) => {
				debug!(interface = %name, address = %net, "resolved interface address");
				return Ok(net);
			}
			Some(net @ IpNet::V6(_)) if v6.is_none() => v6 = Some(net),
			_ => {}
		}
	}
	v6.ok_or_else(|| InterfaceError::NoAddress(name.to_string()))
}

/// Whether an interface called `name` exists on this host.
pub fn is_interface_up(name: &str) -> Result<bool> {
	Ok(getifaddrs()?.any(|a| a.interface_name == name))
}

fn to_net(ifaddr: &InterfaceAddress) -> Option<IpNet> {
	let address = ifaddr.address.as_ref()?;
	let netmask = ifaddr.netmask.as_ref();

	if let Some(sin) = address.as_sockaddr_in() {
		let ip = sin.ip();
		let prefix = netmask
			.and_then(|m| m.as_sockaddr_in())
			.and_then(|m| ipnet::ipv4_mask_to_prefix(m.ip()).ok())
			.unwrap_or(32);
		return Ipv4Net::new(ip, prefix).ok().map(IpNet::V4);
	}
	if let Some(sin6) = address.as_sockaddr_in6() {
		let ip = sin6.ip();
		let prefix = netmask
			.and_then(|m| m.as_sockaddr_in6())
			.and_then(|m| ipnet::ipv6_mask_to_prefix(m.ip()).ok())
			.unwrap_or(128);
		return Ipv6Net::new(ip, prefix).ok().map(IpNet::V6);
	}
	None
}
