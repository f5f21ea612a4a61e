// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;
use wgmesh_common::{AllocationError, KeyFileError};
use wgmesh_store::StoreError;
use wgmesh_wireguard::InterfaceError;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("--wg-range and --wg-ip are not set, need to set at least one of them")]
	MissingAddress,

	#[error("you must set --wg-range in relay mode")]
	RelayWithoutRange,

	#[error("you must set either --wg-endpoint-if-name or --wg-endpoint-ip")]
	MissingEndpoint,

	#[error("failed to resolve endpoint IP from interface {name}: {source}")]
	EndpointLookup {
		name: String,
		#[source]
		source: InterfaceError,
	},

	#[error("failed to inspect interface {name}: {source}")]
	InterfaceProbe {
		name: String,
		#[source]
		source: InterfaceError,
	},

	#[error("tunnel IP {ip} and range {range} are different address families")]
	FamilyMismatch {
		ip: std::net::IpAddr,
		range: ipnet::IpNet,
	},
}

#[derive(Debug, Error)]
pub enum JoinError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Allocation(#[from] AllocationError),

	#[error("key pair: {0}")]
	Keys(#[from] KeyFileError),

	#[error(transparent)]
	Interface(#[from] InterfaceError),
}

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("join failed: {0}")]
	Join(#[from] JoinError),

	#[error("coordination store error: {0}")]
	Store(#[from] StoreError),

	#[error("background task failed: {0}")]
	Task(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
