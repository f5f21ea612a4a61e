// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Consul adapter for [`CoordinationStore`].
//!
//! - Locks are Consul sessions (TTL, `release` behaviour) acquiring the
//!   namespace lock key; the session is renewed in the background until
//!   [`CoordinationStore::unlock`].
//! - Peer records are JSON values under the namespace peers prefix.
//! - Watches are blocking queries on the peers prefix and on the catalog
//!   node list.

use crate::error::{Result, StoreError};
use crate::namespace::Namespace;
use crate::store::{check_owner, CoordinationStore, LockHandle, MembershipStream, PeerStream};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;
use wgmesh_common::{Interface, Peer, WgPublicKey};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConsulConfig {
	/// `host:port` or a full `http(s)://` URL.
	pub address: String,
	pub token: Option<String>,
	/// `None` waits for the join lock indefinitely.
	pub lock_timeout: Option<Duration>,
	pub session_ttl: Duration,
	/// Upper bound of a single blocking query.
	pub wait_time: Duration,
}

impl ConsulConfig {
	pub fn new(address: impl Into<String>) -> Self {
		Self {
			address: address.into(),
			token: None,
			lock_timeout: None,
			session_ttl: Duration::from_secs(15),
			wait_time: Duration::from_secs(300),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
	key: String,
	#[serde(default)]
	value: Option<String>,
	#[serde(default)]
	session: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
	name: &'a str,
	#[serde(rename = "TTL")]
	ttl: String,
	behavior: &'a str,
	lock_delay: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
	#[serde(rename = "ID")]
	id: String,
}

#[derive(Debug, Deserialize)]
struct CatalogNode {
	#[serde(rename = "Node")]
	node: String,
}

#[derive(Debug, Deserialize)]
struct AgentSelf {
	#[serde(rename = "Config")]
	config: AgentConfig,
}

#[derive(Debug, Deserialize)]
struct AgentConfig {
	#[serde(rename = "NodeName")]
	node_name: String,
}

fn parse_address(address: &str) -> Result<Url> {
	if address.contains("://") {
		Ok(Url::parse(address)?)
	} else {
		Ok(Url::parse(&format!("http://{address}"))?)
	}
}

fn consul_index(resp: &Response) -> u64 {
	resp
		.headers()
		.get(INDEX_HEADER)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse().ok())
		.unwrap_or(0)
}

fn decode_peers(entries: Vec<KvEntry>) -> Vec<Peer> {
	entries
		.into_iter()
		.filter_map(|entry| {
			let value = entry.value?;
			let decoded = STANDARD
				.decode(value.as_bytes())
				.map_err(|e| e.to_string())
				.and_then(|raw| serde_json::from_slice::<Peer>(&raw).map_err(|e| e.to_string()));
			match decoded {
				Ok(peer) => Some(peer),
				Err(reason) => {
					warn!(key = %entry.key, %reason, "skipping malformed peer record");
					None
				}
			}
		})
		.collect()
}

fn retry_delay(failures: u32) -> Duration {
	let exp = Duration::from_secs(1u64 << failures.min(5));
	exp.min(MAX_RETRY_DELAY) + Duration::from_millis(fastrand::u64(0..500))
}

/// Low-level HTTP calls. Cheap to clone into watch streams and renewal tasks.
#[derive(Clone)]
struct ConsulClient {
	http: Client,
	base: Url,
	token: Option<String>,
	wait_time: Duration,
}

impl ConsulClient {
	fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
		let url = self.base.join(path)?;
		let mut req = self.http.request(method, url).timeout(REQUEST_TIMEOUT);
		if let Some(token) = &self.token {
			req = req.header(TOKEN_HEADER, token);
		}
		Ok(req)
	}

	fn blocking(&self, req: RequestBuilder, index: u64, wait: Duration) -> RequestBuilder {
		// Consul adds up to wait/16 of jitter to the server-side wait.
		let timeout = wait + wait / 16 + REQUEST_TIMEOUT;
		req
			.query(&[
				("index", index.to_string()),
				("wait", format!("{}ms", wait.as_millis().max(1))),
			])
			.timeout(timeout)
	}

	/// Sends `req`; any status other than success or 404 is an error.
	async fn send(&self, req: RequestBuilder, path: &str) -> Result<Response> {
		let resp = req.send().await?;
		let status = resp.status();
		if status.is_success() || status == StatusCode::NOT_FOUND {
			return Ok(resp);
		}
		let message = resp.text().await.unwrap_or_default();
		Err(StoreError::Status {
			status: status.as_u16(),
			path: path.to_string(),
			message,
		})
	}

	async fn json<T: serde::de::DeserializeOwned>(resp: Response, key: &str) -> Result<T> {
		let body = resp.bytes().await?;
		serde_json::from_slice(&body).map_err(|e| StoreError::Decode {
			key: key.to_string(),
			reason: e.to_string(),
		})
	}

	async fn list_peers(&self, prefix: &str, index: Option<u64>) -> Result<(Vec<Peer>, u64)> {
		let path = format!("/v1/kv/{prefix}");
		let mut req = self.request(Method::GET, &path)?.query(&[("recurse", "true")]);
		if let Some(index) = index {
			req = self.blocking(req, index, self.wait_time);
		}
		let resp = self.send(req, &path).await?;
		let index = consul_index(&resp);
		if resp.status() == StatusCode::NOT_FOUND {
			return Ok((Vec::new(), index));
		}
		let entries: Vec<KvEntry> = Self::json(resp, prefix).await?;
		Ok((decode_peers(entries), index))
	}

	async fn put_json(&self, key: &str, body: Vec<u8>, query: &[(&str, &str)]) -> Result<bool> {
		let path = format!("/v1/kv/{key}");
		let req = self.request(Method::PUT, &path)?.query(query).body(body);
		let resp = self.send(req, &path).await?;
		if resp.status() == StatusCode::NOT_FOUND {
			return Err(StoreError::Status {
				status: 404,
				path,
				message: "not found".to_string(),
			});
		}
		Self::json(resp, key).await
	}

	async fn delete(&self, key: &str) -> Result<()> {
		let path = format!("/v1/kv/{key}");
		let req = self.request(Method::DELETE, &path)?;
		self.send(req, &path).await?;
		Ok(())
	}

	async fn create_session(&self, identity: &str, ttl: Duration) -> Result<String> {
		let path = "/v1/session/create";
		let name = format!("wgmesh join lock ({identity})");
		let req = self.request(Method::PUT, path)?.json(&SessionRequest {
			name: &name,
			ttl: format!("{}s", ttl.as_secs().max(10)),
			behavior: "release",
			lock_delay: "0s",
		});
		let resp = self.send(req, path).await?;
		let session: SessionResponse = Self::json(resp, path).await?;
		Ok(session.id)
	}

	/// Returns `false` once the session no longer exists.
	async fn renew_session(&self, session: &str) -> Result<bool> {
		let path = format!("/v1/session/renew/{session}");
		let req = self.request(Method::PUT, &path)?;
		let resp = self.send(req, &path).await?;
		Ok(resp.status() != StatusCode::NOT_FOUND)
	}

	async fn destroy_session(&self, session: &str) -> Result<()> {
		let path = format!("/v1/session/destroy/{session}");
		let req = self.request(Method::PUT, &path)?;
		self.send(req, &path).await?;
		Ok(())
	}

	async fn acquire(&self, key: &str, session: &str, identity: &str) -> Result<bool> {
		self
			.put_json(key, identity.as_bytes().to_vec(), &[("acquire", session)])
			.await
	}

	async fn release(&self, key: &str, session: &str) -> Result<bool> {
		self.put_json(key, Vec::new(), &[("release", session)]).await
	}

	/// Blocks until the lock key changes or `wait` elapses.
	async fn wait_for_lock_change(&self, key: &str, index: u64, wait: Duration) -> Result<u64> {
		let path = format!("/v1/kv/{key}");
		let req = self.blocking(self.request(Method::GET, &path)?, index, wait);
		let resp = self.send(req, &path).await?;
		let next = consul_index(&resp);
		if resp.status() != StatusCode::NOT_FOUND {
			let entries: Vec<KvEntry> = Self::json(resp, key).await?;
			let holder = entries.first().and_then(|e| e.session.as_deref());
			trace!(%key, ?holder, "lock key state");
		}
		Ok(next)
	}

	async fn catalog_nodes(&self, index: Option<u64>) -> Result<(BTreeSet<String>, u64)> {
		let path = "/v1/catalog/nodes";
		let mut req = self.request(Method::GET, path)?;
		if let Some(index) = index {
			req = self.blocking(req, index, self.wait_time);
		}
		let resp = self.send(req, path).await?;
		let index = consul_index(&resp);
		let nodes: Vec<CatalogNode> = Self::json(resp, path).await?;
		Ok((nodes.into_iter().map(|n| n.node).collect(), index))
	}

	async fn agent_self(&self) -> Result<String> {
		let path = "/v1/agent/self";
		let req = self.request(Method::GET, path)?;
		let resp = self.send(req, path).await?;
		let agent: AgentSelf = Self::json(resp, path).await?;
		Ok(agent.config.node_name)
	}
}

struct WatchState<T, F> {
	fetch: F,
	index: u64,
	pending: Option<T>,
	failures: u32,
}

/// Turns a blocking query into a stream: yields `initial`, then a value
/// each time the Consul index moves. Errors are yielded and retried with
/// backoff.
fn blocking_watch<T, F, Fut>(initial: T, index: u64, fetch: F) -> futures::stream::BoxStream<'static, Result<T>>
where
	T: Send + 'static,
	F: Fn(u64) -> Fut + Send + 'static,
	Fut: Future<Output = Result<(T, u64)>> + Send + 'static,
{
	let state = WatchState {
		fetch,
		index,
		pending: Some(initial),
		failures: 0,
	};

	futures::stream::unfold(state, |mut state| async move {
		if let Some(value) = state.pending.take() {
			return Some((Ok(value), state));
		}
		if state.failures > 0 {
			tokio::time::sleep(retry_delay(state.failures)).await;
		}
		loop {
			match (state.fetch)(state.index).await {
				Ok((value, index)) => {
					state.failures = 0;
					if index == state.index {
						continue;
					}
					// A lower index means the server state was reset; start over.
					state.index = if index < state.index { 0 } else { index };
					return Some((Ok(value), state));
				}
				Err(e) => {
					state.failures = state.failures.saturating_add(1);
					return Some((Err(e), state));
				}
			}
		}
	})
	.boxed()
}

pub struct ConsulStore {
	client: ConsulClient,
	session_ttl: Duration,
	lock_timeout: Option<Duration>,
	renewals: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConsulStore {
	pub fn new(config: ConsulConfig) -> Result<Self> {
		let base = parse_address(&config.address)?;
		let http = Client::builder()
			.user_agent(concat!("wgmesh/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self {
			client: ConsulClient {
				http,
				base,
				token: config.token,
				wait_time: config.wait_time,
			},
			session_ttl: config.session_ttl,
			lock_timeout: config.lock_timeout,
			renewals: Mutex::new(HashMap::new()),
		})
	}

	async fn acquire_with_session(&self, key: &str, session: &str, identity: &str) -> Result<()> {
		let started = Instant::now();
		let mut index = 0;

		loop {
			if self.client.acquire(key, session, identity).await? {
				return Ok(());
			}

			let wait = match self.lock_timeout {
				Some(timeout) => {
					let waited = started.elapsed();
					if waited >= timeout {
						return Err(StoreError::LockTimeout {
							key: key.to_string(),
							waited,
						});
					}
					(timeout - waited).min(self.client.wait_time)
				}
				None => self.client.wait_time,
			};

			debug!(%key, "mesh lock held by another node, waiting");
			let next = self.client.wait_for_lock_change(key, index, wait).await?;
			index = if next < index { 0 } else { next };
		}
	}

	fn spawn_renewal(&self, session: String) -> JoinHandle<()> {
		let client = self.client.clone();
		let period = self.session_ttl / 2;

		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				match client.renew_session(&session).await {
					Ok(true) => trace!(%session, "renewed lock session"),
					Ok(false) => {
						error!(%session, "lock session expired while held");
						break;
					}
					Err(e) => warn!(error = %e, %session, "failed to renew lock session"),
				}
			}
		})
	}

	fn renewals(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
		self.renewals.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for ConsulStore {
	fn drop(&mut self) {
		for (_, renewal) in self.renewals().drain() {
			renewal.abort();
		}
	}
}

impl std::fmt::Debug for ConsulStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConsulStore")
			.field("address", &self.client.base.as_str())
			.field("has_token", &self.client.token.is_some())
			.field("lock_timeout", &self.lock_timeout)
			.finish()
	}
}

#[async_trait]
impl CoordinationStore for ConsulStore {
	#[instrument(skip(self), fields(%namespace))]
	async fn lock(&self, namespace: &Namespace, identity: &str) -> Result<LockHandle> {
		let key = namespace.lock_key();
		let session = self.client.create_session(identity, self.session_ttl).await?;

		if let Err(e) = self.acquire_with_session(&key, &session, identity).await {
			if let Err(destroy_err) = self.client.destroy_session(&session).await {
				warn!(error = %destroy_err, %session, "failed to destroy lock session");
			}
			return Err(e);
		}

		let renewal = self.spawn_renewal(session.clone());
		self.renewals().insert(session.clone(), renewal);
		info!(%key, "acquired mesh lock");

		Ok(LockHandle {
			key,
			token: session,
		})
	}

	#[instrument(skip(self), fields(key = %handle.key))]
	async fn unlock(&self, handle: &LockHandle) -> Result<()> {
		let renewal = self.renewals().remove(&handle.token);
		let Some(renewal) = renewal else {
			debug!("lock already released");
			return Ok(());
		};
		renewal.abort();

		let released = self.client.release(&handle.key, &handle.token).await;
		// Destroying the session releases the lock as well, so do it regardless.
		let destroyed = self.client.destroy_session(&handle.token).await;
		released?;
		destroyed?;

		info!("released mesh lock");
		Ok(())
	}

	#[instrument(skip(self), fields(%namespace))]
	async fn get_peers(&self, namespace: &Namespace) -> Result<Vec<Peer>> {
		let (peers, _) = self.client.list_peers(&namespace.peers_prefix(), None).await?;
		debug!(count = peers.len(), "fetched peers");
		Ok(peers)
	}

	#[instrument(skip(self, interface, peer), fields(%namespace, public_key = %peer.public_key))]
	async fn put_peer(
		&self,
		namespace: &Namespace,
		interface: &Interface,
		peer: &Peer,
	) -> Result<()> {
		check_owner(interface, peer)?;
		let key = namespace.peer_key(&peer.public_key);
		let body = serde_json::to_vec(peer).map_err(|e| StoreError::Decode {
			key: key.clone(),
			reason: e.to_string(),
		})?;

		if !self.client.put_json(&key, body, &[]).await? {
			return Err(StoreError::Status {
				status: 200,
				path: key,
				message: "write was not applied".to_string(),
			});
		}
		debug!("published peer record");
		Ok(())
	}

	#[instrument(skip(self), fields(%namespace, %public_key))]
	async fn delete_peer(&self, namespace: &Namespace, public_key: &WgPublicKey) -> Result<()> {
		self.client.delete(&namespace.peer_key(public_key)).await
	}

	#[instrument(skip(self), fields(%namespace))]
	async fn watch_kv(&self, namespace: &Namespace) -> Result<PeerStream> {
		let prefix = namespace.peers_prefix();
		let (initial, index) = self.client.list_peers(&prefix, None).await?;
		let client = self.client.clone();

		Ok(blocking_watch(initial, index, move |index| {
			let client = client.clone();
			let prefix = prefix.clone();
			async move { client.list_peers(&prefix, Some(index)).await }
		}))
	}

	#[instrument(skip(self))]
	async fn watch_membership(&self) -> Result<MembershipStream> {
		let (initial, index) = self.client.catalog_nodes(None).await?;
		let client = self.client.clone();

		Ok(blocking_watch(initial, index, move |index| {
			let client = client.clone();
			async move { client.catalog_nodes(Some(index)).await }
		}))
	}

	async fn local_node(&self) -> Result<String> {
		self.client.agent_self().await
	}
}
