//! Bidder fleet management: descriptors are discovered from a glob pattern,
//! reloaded every minute, and paired with per-agent pacing state that
//! survives reloads. The request hot path touches nothing but an `ArcSwap`
//! load and a few atomics.

mod filters;
mod pacing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use core_types::{usd_1m, Agent};
use infra_sched::{CancelHandle, Every};

pub use filters::{build_filter_table, FilterTable, Rules};
pub use pacing::{sampling_ema, Pacing};

/// A loaded agent: immutable descriptor plus its live pacing window.
pub struct Bidder {
    pub descriptor: Agent,
    raw: Vec<u8>,
    pacing: Arc<ArcSwap<Pacing>>,
}

impl Bidder {
    fn new(descriptor: Agent, raw: Vec<u8>) -> Self {
        Self {
            descriptor,
            raw,
            pacing: Arc::new(ArcSwap::from_pointee(Pacing::default())),
        }
    }

    pub fn label(&self) -> &str {
        self.descriptor.label()
    }

    /// Raw descriptor file bytes, as pushed to the configuration sink.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn pacing(&self) -> Arc<Pacing> {
        self.pacing.load_full()
    }

    /// Installs a pacing window directly; reload computes windows itself,
    /// this is for wiring tests and manual overrides.
    pub fn set_pacing(&self, pacing: Pacing) {
        self.pacing.store(Arc::new(pacing));
    }

    /// Closes the current window and opens the next one: derives qps from
    /// the observed request count, re-targets the bid rate from `pace` and
    /// `price`, and smooths the sampling probability.
    pub fn update(&self, now: Instant) {
        let prev = self.pacing.load();

        let dt = now.saturating_duration_since(prev.timestamp).as_secs_f64();
        let observed = prev.requests.load(std::sync::atomic::Ordering::Relaxed);
        let qps = if dt > 0.0 { observed as f64 / dt } else { 0.0 };

        let mut allowance = 0.0;
        let mut sampling = 1.0;
        let mut bps = 0.0;
        if let Some(params) = &self.descriptor.params {
            let pace = usd_1m(&params.pace) as f64;
            let price = usd_1m(&params.price) as f64;
            if price != 0.0 {
                // Target bids per second at half-minute granularity.
                bps = pace / price / 60.0 / 2.0;
                sampling = if bps >= qps { 1.0 } else { bps / qps };
                allowance = bps * dt;
            }
        }

        let ema = sampling_ema(prev.sampling, sampling);

        let label = self.label().to_string();
        metrics::gauge!("pacer.bps", "agent" => label.clone()).set(bps);
        metrics::gauge!("pacer.qps", "agent" => label.clone()).set(qps);
        metrics::gauge!("pacer.sampling", "agent" => label).set(ema);

        self.pacing
            .store(Arc::new(Pacing::window(allowance as i64, now, qps, ema)));
    }

    /// One bid attempt. Wait-free: a snapshot load, two atomics and a
    /// uniform draw. Returns the `(price, priority)` strings on success.
    pub fn bid(&self) -> Option<(String, String)> {
        let pacing = self.pacing.load();
        pacing.note_request();

        if pacing.sampling < rand::random::<f64>() {
            metrics::counter!("pacer.random_no_bid", "agent" => self.label().to_string())
                .increment(1);
            return None;
        }

        if !pacing.consume_bid() {
            metrics::counter!("pacer.no_bid", "agent" => self.label().to_string()).increment(1);
            return None;
        }

        let params = self.descriptor.params.as_ref()?;
        metrics::counter!("pacer.bid", "agent" => self.label().to_string()).increment(1);
        Some((params.price.clone(), params.priority.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct BiddersConfig {
    /// Glob pattern matching one descriptor JSON file per agent.
    pub pattern: String,
    /// Configuration sink base URL; `None` disables the push.
    pub sink_url: Option<String>,
    /// Namespace prefix for sink agent paths.
    pub namespace: String,
    pub reload_period: Duration,
}

impl Default for BiddersConfig {
    fn default() -> Self {
        Self {
            pattern: "configs/bidders/*.json".to_string(),
            sink_url: None,
            namespace: "bidders".to_string(),
            reload_period: Duration::from_secs(60),
        }
    }
}

pub struct Bidders {
    config: BiddersConfig,
    http: reqwest::Client,
    state: ArcSwap<HashMap<String, Arc<Bidder>>>,
    reload_mu: tokio::sync::Mutex<()>,
}

impl Bidders {
    pub fn new(config: BiddersConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            state: ArcSwap::from_pointee(HashMap::new()),
            reload_mu: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads the fleet once (a bad pattern is fatal) and schedules the
    /// periodic reload.
    pub async fn start(self: &Arc<Self>) -> Result<CancelHandle> {
        self.reload().await?;

        let bidders = self.clone();
        let handle = infra_sched::periodic(Every::new(self.config.reload_period), move || {
            let bidders = bidders.clone();
            async move {
                if let Err(err) = bidders.reload().await {
                    tracing::warn!(%err, "bidder reload failed");
                }
            }
        });

        Ok(handle)
    }

    /// Resolves ids to bidders, preserving positions; unknown ids yield
    /// `None`. Callers depend on the alignment for tie-break indexing.
    pub fn bidders(&self, ids: &[String]) -> Vec<Option<Arc<Bidder>>> {
        let state = self.state.load();
        ids.iter().map(|id| state.get(id).cloned()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<Arc<Bidder>> {
        self.state.load().values().cloned().collect()
    }

    pub async fn reload(&self) -> Result<()> {
        let _serial = self.reload_mu.lock().await;

        tracing::debug!(pattern = %self.config.pattern, "checking configurations");
        let parsed = import(&self.config.pattern)?;
        if parsed.is_empty() {
            tracing::warn!(pattern = %self.config.pattern, "no descriptor files found");
            return Ok(());
        }

        let last = self.state.load_full();
        let now = Instant::now();
        let mut next = HashMap::with_capacity(parsed.len());

        for (descriptor, raw) in parsed {
            let id = descriptor.id.to_string();
            let bidder = match last.get(&id) {
                Some(old) => {
                    // Same id: the pacing window survives the reload.
                    let bidder = Bidder {
                        descriptor,
                        raw,
                        pacing: old.pacing.clone(),
                    };
                    bidder.update(now);
                    bidder
                }
                None => {
                    let bidder = Bidder::new(descriptor, raw);
                    self.push_to_sink(&bidder);
                    bidder
                }
            };
            next.insert(id, Arc::new(bidder));
        }

        metrics::gauge!("bidders.loaded").set(next.len() as f64);
        self.state.store(Arc::new(next));
        Ok(())
    }

    /// Best-effort push of a new agent's raw descriptor to the
    /// configuration sink: three attempts, linear back-off, failures logged
    /// and dropped.
    fn push_to_sink(&self, bidder: &Bidder) {
        let Some(sink) = &self.config.sink_url else {
            return;
        };

        let url = format!(
            "{}/v1/agents/{}.{}/config",
            sink.trim_end_matches('/'),
            self.config.namespace,
            bidder.label()
        );
        let body = bidder.raw.to_vec();
        let http = self.http.clone();

        tokio::spawn(async move {
            let mut delay = Duration::from_secs(1);
            for _ in 0..3 {
                tokio::time::sleep(delay).await;
                delay += Duration::from_secs(1);

                match http
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.clone())
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => return,
                    Ok(response) => {
                        tracing::warn!(%url, status = %response.status(), "config sink rejected agent");
                    }
                    Err(err) => {
                        tracing::warn!(%url, %err, "config sink push failed");
                    }
                }
            }
        });
    }
}

fn import(pattern: &str) -> Result<Vec<(Agent, Vec<u8>)>> {
    let mut out = Vec::new();
    for entry in glob::glob(pattern).context("bad descriptor pattern")? {
        let path = entry.context("descriptor path")?;
        let raw = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let descriptor: Agent = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse: {}", path.display()))?;
        out.push((descriptor, raw));
    }
    Ok(out)
}
