// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Coordination store abstraction for wgmesh and its adapters.

pub mod consul;
pub mod error;
pub mod memory;
pub mod namespace;
pub mod store;

pub use consul::{ConsulConfig, ConsulStore};
pub use error::{Result, StoreError};
pub use memory::{MemoryStore, NodeView};
pub use namespace::Namespace;
pub use store::{CoordinationStore, LockHandle, MembershipStream, PeerStream};
