// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard configuration text.
//!
//! Two dialects are produced: the wg-quick file persisted on disk (with
//! `Address` and hook commands) and the plain wg(8) form that `wg syncconf`
//! accepts, which only knows keys, ports, routes and endpoints.

use std::fmt::Write;
use wgmesh_common::{Interface, Peer};
use zeroize::Zeroizing;

/// Renders the wg-quick configuration for `interface` and every peer except
/// the interface's own record.
pub fn render_wg_quick(interface: &Interface, peers: &[Peer]) -> Zeroizing<String> {
	let mut out = Zeroizing::new(String::new());
	let private_key = interface.keypair.private_key().to_base64();

	out.push_str("[Interface]\n");
	push_line(&mut out, "Address", &interface.address);
	push_line(&mut out, "ListenPort", &interface.listen_port);
	push_line(&mut out, "PrivateKey", &*private_key);
	if let Some(cmd) = interface.post_up.as_deref().filter(|c| !c.is_empty()) {
		push_line(&mut out, "PostUp", &cmd);
	}
	if let Some(cmd) = interface.post_down.as_deref().filter(|c| !c.is_empty()) {
		push_line(&mut out, "PostDown", &cmd);
	}

	push_peers(&mut out, interface, peers);
	out
}

/// Renders the wg(8) configuration `wg syncconf` applies to a running device.
pub fn render_syncconf(interface: &Interface, peers: &[Peer]) -> Zeroizing<String> {
	let mut out = Zeroizing::new(String::new());
	let private_key = interface.keypair.private_key().to_base64();

	out.push_str("[Interface]\n");
	push_line(&mut out, "ListenPort", &interface.listen_port);
	push_line(&mut out, "PrivateKey", &*private_key);

	push_peers(&mut out, interface, peers);
	out
}

/// The peers `interface` should be configured with, in stable key order.
pub fn remote_peers<'a>(interface: &Interface, peers: &'a [Peer]) -> Vec<&'a Peer> {
	let mut remote: Vec<&Peer> = peers
		.iter()
		.filter(|p| p.public_key != *interface.public_key())
		.collect();
	remote.sort_by_key(|p| p.public_key);
	remote
}

fn push_peers(out: &mut String, interface: &Interface, peers: &[Peer]) {
	for peer in remote_peers(interface, peers) {
		out.push_str("\n[Peer]\n");
		push_line(out, "PublicKey", &peer.public_key);
		if !peer.allowed_ips.is_empty() {
			push_line(out, "AllowedIPs", &peer.allowed_ips);
		}
		if let Some(endpoint) = peer.endpoint() {
			push_line(out, "Endpoint", &endpoint);
		}
	}
}

fn push_line(out: &mut String, key: &str, value: &dyn std::fmt::Display) {
	// Writing into a String cannot fail.
	let _ = writeln!(out, "{key} = {value}");
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_common::WgKeyPair;

	fn interface() -> Interface {
		Interface {
			name: "wg0".to_string(),
			address: "10.0.0.1/32".parse().unwrap(),
			listen_port: 51820,
			keypair: WgKeyPair::generate(),
			post_up: Some("iptables -A FORWARD -i wg0 -j ACCEPT".to_string()),
			post_down: Some(String::new()),
		}
	}

	fn peer(ip: &str, endpoint: Option<&str>) -> Peer {
		Peer {
			public_key: *WgKeyPair::generate().public_key(),
			ip: Some(ip.parse().unwrap()),
			endpoint_ip: endpoint.map(|e| e.parse().unwrap()),
			endpoint_port: 51820,
			allowed_ips: format!("{ip}/32").parse().unwrap(),
			node: None,
		}
	}

	#[test]
	fn wg_quick_has_interface_section_and_hooks() {
		let iface = interface();
		let text = render_wg_quick(&iface, &[]);

		assert!(text.starts_with("[Interface]\n"));
		assert!(text.contains("Address = 10.0.0.1/32\n"));
		assert!(text.contains("ListenPort = 51820\n"));
		assert!(text.contains(&format!(
			"PrivateKey = {}\n",
			*iface.keypair.private_key().to_base64()
		)));
		assert!(text.contains("PostUp = iptables -A FORWARD -i wg0 -j ACCEPT\n"));
		assert!(!text.contains("PostDown"));
		assert!(!text.contains("[Peer]"));
	}

	#[test]
	fn own_record_is_not_rendered_as_peer() {
		let iface = interface();
		let own = Peer {
			public_key: *iface.public_key(),
			..peer("10.0.0.1", Some("1.1.1.1"))
		};
		let other = peer("10.0.0.2", Some("2.2.2.2"));

		let text = render_wg_quick(&iface, &[own, other.clone()]);
		assert_eq!(text.matches("[Peer]").count(), 1);
		assert!(text.contains(&format!("PublicKey = {}\n", other.public_key)));
		assert!(text.contains("AllowedIPs = 10.0.0.2/32\n"));
		assert!(text.contains("Endpoint = 2.2.2.2:51820\n"));
	}

	#[test]
	fn peer_without_endpoint_has_no_endpoint_line() {
		let iface = interface();
		let text = render_wg_quick(&iface, &[peer("10.0.0.9", None)]);
		assert!(text.contains("AllowedIPs = 10.0.0.9/32\n"));
		assert!(!text.contains("Endpoint"));
	}

	#[test]
	fn syncconf_omits_wg_quick_only_keys() {
		let iface = interface();
		let text = render_syncconf(&iface, &[peer("10.0.0.2", Some("2.2.2.2"))]);
		assert!(!text.contains("Address"));
		assert!(!text.contains("PostUp"));
		assert!(text.contains("ListenPort = 51820\n"));
		assert!(text.contains("[Peer]\n"));
	}

	#[test]
	fn peer_order_is_stable() {
		let iface = interface();
		let a = peer("10.0.0.2", Some("2.2.2.2"));
		let b = peer("10.0.0.3", Some("3.3.3.3"));
		assert_eq!(
			*render_syncconf(&iface, &[a.clone(), b.clone()]),
			*render_syncconf(&iface, &[b, a])
		);
	}
}
