// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use tracing::{debug, warn};
use wgmesh_store::{CoordinationStore, LockHandle, Namespace, StoreError};

/// A held namespace lock.
///
/// Call [`NamespaceLock::release`] on every path. If the guard is dropped
/// while still held (cancelled future, panic) the unlock is spawned onto the
/// current runtime instead.
pub struct NamespaceLock {
	store: Arc<dyn CoordinationStore>,
	handle: Option<LockHandle>,
}

impl NamespaceLock {
	pub async fn acquire(
		store: Arc<dyn CoordinationStore>,
		namespace: &Namespace,
		identity: &str,
	) -> Result<Self, StoreError> {
		let handle = store.lock(namespace, identity).await?;
		debug!(key = %handle.key, "namespace lock held");
		Ok(Self {
			store,
			handle: Some(handle),
		})
	}

	pub async fn release(mut self) -> Result<(), StoreError> {
		match self.handle.take() {
			Some(handle) => self.store.unlock(&handle).await,
			None => Ok(()),
		}
	}
}

impl Drop for NamespaceLock {
	fn drop(&mut self) {
		let Some(handle) = self.handle.take() else {
			return;
		};
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			warn!(key = %handle.key, "namespace lock dropped outside a runtime, leaving it to expire");
			return;
		};
		warn!(key = %handle.key, "namespace lock dropped while held, releasing in background");
		let store = self.store.clone();
		runtime.spawn(async move {
			if let Err(e) = store.unlock(&handle).await {
				warn!(error = %e, key = %handle.key, "background lock release failed");
			}
		});
	}
}
