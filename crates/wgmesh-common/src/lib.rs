// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod interface;
pub mod ip;
pub mod keys;
pub mod keys_file;
pub mod peer;

pub use interface::Interface;
pub use ip::{
	allocate_from_range, candidate_hosts, find_by_endpoint, find_by_ip, host_net, AllocationError,
};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use keys_file::{get_or_create_keypair, load_wg_key_from_file, save_wg_keys, KeyFileError};
pub use peer::{AllowedIps, Peer};
