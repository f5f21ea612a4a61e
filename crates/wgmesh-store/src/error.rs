// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("coordination store unavailable: {0}")]
	Unavailable(String),

	#[error("timed out after {waited:?} waiting for lock {key}")]
	LockTimeout { key: String, waited: Duration },

	#[error("coordination store returned {status} for {path}: {message}")]
	Status {
		status: u16,
		path: String,
		message: String,
	},

	#[error("invalid store address: {0}")]
	Address(#[from] url::ParseError),

	#[error("malformed record at {key}: {reason}")]
	Decode { key: String, reason: String },

	#[error("refusing to write record for {peer}: it does not belong to local interface {interface}")]
	ForeignRecord { peer: String, interface: String },
}

impl From<reqwest::Error> for StoreError {
	fn from(e: reqwest::Error) -> Self {
		StoreError::Unavailable(e.to_string())
	}
}

pub type Result<T> = std::result::Result<T, StoreError>;
