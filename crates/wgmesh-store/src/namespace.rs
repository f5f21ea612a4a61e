// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use wgmesh_common::WgPublicKey;

/// Store prefix that isolates one mesh: `<kv-prefix>/<interface-name>`.
///
/// Layout below the prefix:
/// - `lock` guards the join critical section
/// - `peers/<hex public key>` holds one JSON peer record per node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
	prefix: String,
}

impl Namespace {
	pub fn new(kv_prefix: &str, interface_name: &str) -> Self {
		let kv_prefix = kv_prefix.trim_matches('/');
		Self {
			prefix: format!("{kv_prefix}/{interface_name}"),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.prefix
	}

	pub fn lock_key(&self) -> String {
		format!("{}/lock", self.prefix)
	}

	pub fn peers_prefix(&self) -> String {
		format!("{}/peers/", self.prefix)
	}

	pub fn peer_key(&self, public_key: &WgPublicKey) -> String {
		format!("{}{}", self.peers_prefix(), public_key.to_hex())
	}
}

impl fmt::Display for Namespace {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.prefix)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wgmesh_common::WgKeyPair;

	#[test]
	fn keys_live_under_prefix() {
		let ns = Namespace::new("drop-mesh/", "wg0");
		assert_eq!(ns.as_str(), "drop-mesh/wg0");
		assert_eq!(ns.lock_key(), "drop-mesh/wg0/lock");
		assert_eq!(ns.peers_prefix(), "drop-mesh/wg0/peers/");

		let key = *WgKeyPair::generate().public_key();
		let peer_key = ns.peer_key(&key);
		assert!(peer_key.starts_with("drop-mesh/wg0/peers/"));
		assert!(!peer_key["drop-mesh/wg0/peers/".len()..].contains('/'));
	}

	#[test]
	fn interfaces_are_isolated() {
		let a = Namespace::new("drop-mesh", "wg0");
		let b = Namespace::new("drop-mesh", "wg1");
		assert_ne!(a, b);
		assert!(!b.peers_prefix().starts_with(&a.peers_prefix()));
	}
}
