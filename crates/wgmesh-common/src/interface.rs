// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::{WgKeyPair, WgPublicKey};
use ipnet::IpNet;
use std::net::IpAddr;

/// The local node's WireGuard interface, fixed once the node has joined.
#[derive(Debug, Clone)]
pub struct Interface {
	pub name: String,
	pub address: IpNet,
	pub listen_port: u16,
	pub keypair: WgKeyPair,
	pub post_up: Option<String>,
	pub post_down: Option<String>,
}

impl Interface {
	pub fn ip(&self) -> IpAddr {
		self.address.addr()
	}

	pub fn public_key(&self) -> &WgPublicKey {
		self.keypair.public_key()
	}
}
