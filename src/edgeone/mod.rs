// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! EdgeOne IP validation.
//!
//! [`Validator`] answers "does this IP belong to the EdgeOne network" by
//! consulting the TEO API through a TTL-bounded LRU cache. Concurrent
//! lookups for the same IP collapse onto a single API call whose result
//! fans out to every waiter.

mod client;

pub use client::TeoClient;

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Config {
    pub secret_id: String,
    pub secret_key: String,
    pub api_endpoint: String,
    pub region: String,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub timeout: Duration,
}

/// Errors are cloneable so one API failure can fan out to every lookup
/// waiting on the same IP.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("missing EdgeOne SecretId or SecretKey")]
    MissingCredentials,
    #[error("EdgeOne API request failed: {0}")]
    Request(#[source] Arc<reqwest::Error>),
    #[error("failed to encode EdgeOne API request: {0}")]
    Encode(#[source] Arc<serde_json::Error>),
    #[error("EdgeOne API error {code}: {message}")]
    Api { code: String, message: String },
    #[error("EdgeOne lookup interrupted")]
    Interrupted,
}

/// Answers whether an IP belongs to the EdgeOne edge network.
#[async_trait]
pub trait EdgeOneValidator: Send + Sync {
    async fn is_edgeone_ip(&self, ip: IpAddr) -> Result<bool, Error>;
}

struct CacheEntry {
    is_edge: bool,
    inserted_at: Instant,
}

struct Inner {
    cache: LruCache<String, CacheEntry>,
    in_flight: HashMap<String, broadcast::Sender<Result<bool, Error>>>,
}

enum Role {
    Hit(bool),
    Follower(broadcast::Receiver<Result<bool, Error>>),
    Leader(broadcast::Sender<Result<bool, Error>>),
}

/// Caching validator over an upstream authority.
///
/// Lookups canonicalize the IP (IPv4-in-IPv6 is unmapped), short-circuit
/// addresses that cannot be part of a public edge network, and otherwise
/// consult the cache. At most one authority call per key is in flight
/// process-wide; results are admitted to the cache only on success, so a
/// failing authority is retried by the next lookup.
pub struct Validator {
    inner: Arc<Mutex<Inner>>,
    authority: Arc<dyn EdgeOneValidator>,
    ttl: Duration,
}

impl Validator {
    pub fn new(config: Config) -> Result<Self, Error> {
        let cache_size = config.cache_size;
        let ttl = config.cache_ttl;
        let client = TeoClient::new(&config)?;
        Ok(Self::with_authority(Arc::new(client), cache_size, ttl))
    }

    /// Wraps an arbitrary authority, used directly by tests.
    pub fn with_authority(
        authority: Arc<dyn EdgeOneValidator>,
        cache_size: usize,
        ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                cache: LruCache::new(capacity),
                in_flight: HashMap::new(),
            })),
            authority,
            ttl,
        }
    }

    async fn lookup(&self, ip: IpAddr) -> Result<bool, Error> {
        let ip = canonical_ip(ip);
        if !is_public_unicast(&ip) {
            return Ok(false);
        }
        let key = ip.to_string();

        let role = {
            let mut inner = lock(&self.inner);
            let cached = inner
                .cache
                .get(&key)
                .map(|entry| (entry.is_edge, entry.inserted_at.elapsed()));
            match cached {
                Some((is_edge, age)) if age < self.ttl => Role::Hit(is_edge),
                Some(_) => {
                    inner.cache.pop(&key);
                    Self::join_or_lead(&mut inner, &key)
                }
                None => Self::join_or_lead(&mut inner, &key),
            }
        };

        match role {
            Role::Hit(is_edge) => Ok(is_edge),
            Role::Follower(mut rx) => match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(Error::Interrupted),
            },
            Role::Leader(tx) => {
                let authority = Arc::clone(&self.authority);
                let inner = Arc::clone(&self.inner);
                // The call runs detached so a cancelled caller neither aborts
                // it nor loses the cache write; later lookups still benefit.
                let call = tokio::spawn(async move {
                    let result = authority.is_edgeone_ip(ip).await;
                    let mut inner = lock(&inner);
                    if let Ok(is_edge) = &result {
                        inner.cache.put(
                            key.clone(),
                            CacheEntry {
                                is_edge: *is_edge,
                                inserted_at: Instant::now(),
                            },
                        );
                    }
                    inner.in_flight.remove(&key);
                    drop(inner);
                    let _ = tx.send(result.clone());
                    result
                });
                match call.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Interrupted),
                }
            }
        }
    }

    fn join_or_lead(inner: &mut Inner, key: &str) -> Role {
        if let Some(tx) = inner.in_flight.get(key) {
            debug!(ip = key, "joining in-flight EdgeOne lookup");
            Role::Follower(tx.subscribe())
        } else {
            let (tx, _) = broadcast::channel(1);
            inner.in_flight.insert(key.to_string(), tx.clone());
            Role::Leader(tx)
        }
    }
}

#[async_trait]
impl EdgeOneValidator for Validator {
    async fn is_edgeone_ip(&self, ip: IpAddr) -> Result<bool, Error> {
        self.lookup(ip).await
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unmaps IPv4-in-IPv6 addresses so both spellings share one cache key.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Whether the address is globally routable unicast. Edge nodes live on
/// public addresses, so everything else skips the authority entirely.
fn is_public_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
                || v4.is_private())
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique local, fe80::/10 link local.
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_unspecified()
                || v6.is_loopback()
                || v6.is_multicast()
                || unique_local
                || link_local)
        }
    }
}
