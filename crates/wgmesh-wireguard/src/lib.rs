// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local WireGuard device management for wgmesh.

pub mod error;
pub mod manager;
pub mod probe;
pub mod render;

pub use error::{InterfaceError, Result};
pub use manager::{InterfaceManager, WgQuickManager};
pub use render::{remote_peers, render_syncconf, render_wg_quick};
