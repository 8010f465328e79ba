//! Read-mostly user-to-segments index. Lookups are answered from an
//! immutable snapshot swapped in by a background refresher; a miss on a
//! not-yet-covered segment id only enqueues that id for the next refresh,
//! it never blocks the caller on I/O.
//!
//! Shards are daily gzip files named `<YYYY-MM-DD>/<segment_id>.gz`, each a
//! newline-delimited list of raw user identifiers. Identifiers are bucketed
//! by their 64-bit FNV-1a digest.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{Days, Utc};
use core_types::{fnv1a64, ObjectStore};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Default)]
pub struct SegmentIndex {
    users: HashMap<u64, HashSet<i64>>,
    list: HashSet<i64>,
}

impl SegmentIndex {
    fn covers(&self, want: &[i64]) -> bool {
        want.iter().all(|id| self.list.contains(id))
    }

    fn add_shard(&mut self, id: i64, reader: impl Read) {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else {
                break;
            };
            let uid = fnv1a64(line.as_bytes());
            self.users.entry(uid).or_default().insert(id);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegmentCacheConfig {
    /// How many days of shards to fold into one snapshot.
    pub days: u32,
    /// Local shard cache; downloaded shards are written here.
    pub cache_dir: PathBuf,
    pub refresh_period: Duration,
}

impl Default for SegmentCacheConfig {
    fn default() -> Self {
        Self {
            days: 60,
            cache_dir: PathBuf::from("./segments"),
            refresh_period: Duration::from_secs(15 * 60),
        }
    }
}

pub struct SegmentCache {
    config: SegmentCacheConfig,
    store: Arc<dyn ObjectStore>,
    data: ArcSwap<SegmentIndex>,
    pending: Mutex<HashSet<i64>>,
    started: AtomicBool,
    stop: watch::Sender<bool>,
}

impl SegmentCache {
    pub fn new(config: SegmentCacheConfig, store: Arc<dyn ObjectStore>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            store,
            data: ArcSwap::from_pointee(SegmentIndex::default()),
            pending: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
            stop,
        }
    }

    /// Segments `uid` belongs to, out of the currently covered set. Ids in
    /// `want` that the snapshot does not cover are queued for the refresher;
    /// the current snapshot still answers the call.
    pub fn segments(self: &Arc<Self>, uid: u64, want: &[i64]) -> Option<HashSet<i64>> {
        let snapshot = self.data.load();
        if !snapshot.covers(want) {
            self.request(want);
        }
        snapshot.users.get(&uid).cloned()
    }

    /// Stops the refresher; lookups keep serving the last snapshot.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    fn request(self: &Arc<Self>, want: &[i64]) {
        let mut pending = self.pending.lock();
        pending.extend(want.iter().copied());

        if !self.started.swap(true, Ordering::AcqRel) {
            let cache = self.clone();
            let mut stop = self.stop.subscribe();
            tokio::spawn(async move {
                loop {
                    cache.refresh().await;
                    tokio::select! {
                        _ = tokio::time::sleep(cache.config.refresh_period) => {}
                        _ = stop.changed() => return,
                    }
                }
            });
        }
    }

    async fn refresh(&self) {
        let list: Vec<i64> = self.pending.lock().iter().copied().collect();

        let mut index = SegmentIndex::default();
        let mut date = Utc::now().date_naive();
        for _ in 0..self.config.days {
            for id in &list {
                let name = format!("{}/{id}.gz", date.format("%Y-%m-%d"));
                let Some(body) = self.read_shard(&name).await else {
                    continue;
                };
                index.add_shard(*id, GzDecoder::new(body.as_slice()));
            }
            let Some(previous) = date.checked_sub_days(Days::new(1)) else {
                break;
            };
            date = previous;
        }

        index.list = list.into_iter().collect();
        metrics::gauge!("segments.users").set(index.users.len() as f64);
        metrics::gauge!("segments.covered").set(index.list.len() as f64);
        self.data.store(Arc::new(index));
    }

    /// Local cache first, then the object store; downloads are written back
    /// to the local cache. A missing or failing shard is skipped.
    async fn read_shard(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.config.cache_dir.join(name);
        if let Ok(body) = std::fs::read(&path) {
            if !body.is_empty() {
                return Some(body);
            }
        }

        let body = match self.store.download(name).await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(%name, %err, "shard fetch failed");
                metrics::counter!("segments.fetch_failed").increment(1);
                return None;
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                tracing::warn!(?parent, %err, "cannot create shard cache dir");
            }
        }
        if let Err(err) = std::fs::write(&path, &body) {
            tracing::warn!(?path, %err, "cannot write shard cache file");
        }

        Some(body)
    }
}
