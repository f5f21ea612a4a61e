// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;

/// CIDR routes a peer accepts traffic for. Stored as a comma-joined string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedIps(Vec<IpNet>);

impl AllowedIps {
	/// Builds a sorted, de-duplicated route list.
	pub fn new(mut nets: Vec<IpNet>) -> Self {
		nets.sort_by_key(|n| n.to_string());
		nets.dedup();
		Self(nets)
	}

	pub fn as_slice(&self) -> &[IpNet] {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Display for AllowedIps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let joined: Vec<String> = self.0.iter().map(|n| n.to_string()).collect();
		f.write_str(&joined.join(","))
	}
}

impl std::str::FromStr for AllowedIps {
	type Err = ipnet::AddrParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let nets = s
			.split(',')
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.map(str::parse)
			.collect::<Result<Vec<IpNet>, _>>()?;
		Ok(Self::new(nets))
	}
}

impl Serialize for AllowedIps {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for AllowedIps {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// One mesh member as published in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub ip: Option<IpAddr>,
	#[serde(default)]
	pub endpoint_ip: Option<IpAddr>,
	#[serde(default)]
	pub endpoint_port: u16,
	#[serde(default)]
	pub allowed_ips: AllowedIps,
	/// Membership name of the node that owns this record. Placeholder records
	/// written by operators have no owner and are never garbage collected.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub node: Option<String>,
}

impl Peer {
	/// A record without an endpoint reserves an address for a device that is
	/// not a mesh node.
	pub fn is_endpoint_defined(&self) -> bool {
		self.endpoint_ip.is_some()
	}

	pub fn has_same_endpoint_ip(&self, endpoint_ip: IpAddr) -> bool {
		self.endpoint_ip == Some(endpoint_ip)
	}

	pub fn endpoint(&self) -> Option<std::net::SocketAddr> {
		self
			.endpoint_ip
			.map(|ip| std::net::SocketAddr::new(ip, self.endpoint_port))
	}
}
