use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::swap::ColorPair;

/// External key/value client contract, used for user-id mapping lookups.
/// Keys are the big-endian bytes of an FNV-1a digest.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// External object store contract for segment shards.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

/// Plain HTTP object store: shards are fetched as
/// `GET <endpoint>/<bucket>/<key>`. Credentials come from configuration and
/// are forwarded as basic auth when present.
pub struct HttpObjectStore {
    http: reqwest::Client,
    config: ObjectStoreConfig,
}

impl HttpObjectStore {
    pub fn new(config: ObjectStoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.bucket,
            key
        );

        let mut request = self.http.get(&url);
        if !self.config.access_key.is_empty() {
            request = request.basic_auth(&self.config.access_key, Some(&self.config.secret_key));
        }

        let response = request.send().await.with_context(|| format!("get {url}"))?;
        if !response.status().is_success() {
            bail!("{url}: {}", response.status());
        }

        Ok(response.bytes().await.context("read shard body")?.to_vec())
    }
}

type KvMap = RwLock<HashMap<Vec<u8>, Vec<u8>>>;

/// In-memory double-buffered store. Reads route to one buffer while inserts
/// land in the other; `rotate` flips the roles, drains in-flight readers and
/// clears the retired buffer. Stands in for the external client in tests and
/// single-node deployments.
#[derive(Default)]
pub struct MemoryKv {
    pair: ColorPair<KvMap>,
}

impl Default for ColorPair<KvMap> {
    fn default() -> Self {
        ColorPair::new(RwLock::new(HashMap::new()), RwLock::new(HashMap::new()))
    }
}

impl MemoryKv {
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.pair.write().write().insert(key, value);
    }

    /// Makes pending inserts visible and retires the previous read buffer.
    pub fn rotate(&self) {
        let retired = self.pair.swap();
        retired.write().clear();
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let slot = self.pair.read();
        let found = slot.read().get(key).cloned();
        Ok(found)
    }
}
