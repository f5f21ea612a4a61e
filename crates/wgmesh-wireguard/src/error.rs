// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterfaceError {
	#[error("failed to write WireGuard config {path}: {source}")]
	ConfigWrite {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("{tool} not found in PATH")]
	ToolNotInstalled { tool: String },

	#[error("{cmd} {} failed: {stderr}", .args.join(" "))]
	CommandFailed {
		cmd: String,
		args: Vec<String>,
		stderr: String,
	},

	#[error("failed to list network interfaces: {0}")]
	Probe(#[from] nix::Error),

	#[error("network interface {0} doesn't exist or doesn't have any IP address")]
	NoAddress(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InterfaceError>;
