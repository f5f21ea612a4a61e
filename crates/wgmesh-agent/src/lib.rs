// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wgmesh node agent: joins a WireGuard mesh through a coordination store
//! and keeps the local interface in step with it.

pub mod config;
pub mod daemon;
pub mod error;
pub mod gc;
pub mod join;
pub mod lock;
pub mod reconcile;
pub mod state;

pub use config::{Args, Backend, HostProbe, LogFormat, NodeConfig, Role, SystemProbe};
pub use daemon::MeshDaemon;
pub use error::{ConfigError, DaemonError, JoinError, Result};
pub use gc::{stale_records, MembershipGc};
pub use join::{decide, Decision, JoinProtocol, Joined};
pub use lock::NamespaceLock;
pub use reconcile::KvReconciler;
pub use state::{AppliedConfig, MeshState};
