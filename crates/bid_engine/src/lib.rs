//! OpenRTB bid endpoint. Parses the request body, resolves candidate
//! bidders from the `creative-ids` extension, asks each one's pacer for a
//! quote, picks the winner by the string ordering the upstream exchange
//! expects, and renders the single-seat response. Every failure mode after
//! the socket read degrades to 204 No Content.

use std::sync::Arc;

use async_trait::async_trait;
use auction_server::{full, status, Body, Handler};
use bidder_registry::{Bidder, Bidders};
use core_types::{extract, fnv1a64, try_usd_1m, Components, KvStore};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use risk_engine::RiskClient;
use serde_json::Value;

#[cfg(feature = "segment-filter")]
use segment_cache::SegmentCache;

pub struct Exchange {
    bidders: Arc<Bidders>,
    risk: Option<Arc<RiskClient>>,
    user_ids: Option<Arc<dyn KvStore>>,
    #[cfg(feature = "segment-filter")]
    segments: Option<Arc<SegmentCache>>,
}

impl Exchange {
    pub fn new(bidders: Arc<Bidders>) -> Self {
        Self {
            bidders,
            risk: None,
            user_ids: None,
            #[cfg(feature = "segment-filter")]
            segments: None,
        }
    }

    pub fn with_risk(mut self, risk: Arc<RiskClient>) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_user_ids(mut self, user_ids: Arc<dyn KvStore>) -> Self {
        self.user_ids = Some(user_ids);
        self
    }

    #[cfg(feature = "segment-filter")]
    pub fn with_segments(mut self, segments: Arc<SegmentCache>) -> Self {
        self.segments = Some(segments);
        self
    }

    async fn auction(&self, body: &[u8]) -> Response<Body> {
        let Ok(value) = serde_json::from_slice::<Value>(body) else {
            metrics::counter!("auction.bad_json").increment(1);
            return status(StatusCode::NO_CONTENT);
        };
        let value = Arc::new(value);

        let Some(imp_id) = extract(&value, &["imp", "0", "id"]).and_then(Value::as_str) else {
            metrics::counter!("auction.missing_imp_id").increment(1);
            return status(StatusCode::NO_CONTENT);
        };

        let Some(allowed) = extract(&value, &["imp", "0", "ext", "creative-ids"])
            .and_then(Value::as_object)
        else {
            metrics::counter!("auction.missing_creative_ids").increment(1);
            return status(StatusCode::NO_CONTENT);
        };

        // Candidate order is the key order of the extension object; the
        // tie-break below resolves toward earlier entries.
        let ids: Vec<String> = allowed.keys().cloned().collect();
        let creatives: Vec<Vec<String>> = allowed
            .values()
            .map(|list| {
                list.as_array()
                    .map(|items| items.iter().filter_map(scalar_string).collect())
                    .unwrap_or_default()
            })
            .collect();

        if ids.is_empty() {
            metrics::counter!("auction.no_allowed_bidders").increment(1);
            return status(StatusCode::NO_CONTENT);
        }

        let mut candidates = self.bidders.bidders(&ids);
        self.filter(&value, &mut candidates).await;

        let mut best: Option<(usize, String, String)> = None;
        for (i, bidder) in candidates.iter().enumerate() {
            let Some(bidder) = bidder else {
                continue;
            };
            let Some((price, priority)) = bidder.bid() else {
                continue;
            };

            let replace = match &best {
                None => true,
                Some((_, best_price, best_priority)) => beats(
                    (priority.as_str(), price.as_str()),
                    (best_priority.as_str(), best_price.as_str()),
                ),
            };
            if replace {
                best = Some((i, price, priority));
            }
        }

        let Some((winner, price, priority)) = best else {
            metrics::counter!("auction.no_bid").increment(1);
            return status(StatusCode::NO_CONTENT);
        };

        let Some(money) = try_usd_1m(&price) else {
            metrics::counter!("auction.bad_price").increment(1);
            return status(StatusCode::NO_CONTENT);
        };
        let cpm = money as f64 / 1000.0;

        let bidder = candidates[winner].as_ref().expect("winner resolved");
        if self.vetoed_by_risk(bidder, &value).await {
            metrics::counter!("auction.risk_veto").increment(1);
            return status(StatusCode::NO_CONTENT);
        }

        let Some(crid) = creatives[winner].first() else {
            metrics::counter!("auction.no_creative").increment(1);
            return status(StatusCode::NO_CONTENT);
        };

        let body = format!(
            r#"{{"seatbid":[{{"bid":[{{"impid":"{imp_id}","price":{cpm:.6},"crid":"{crid}","ext":{{"priority":{priority},"external-id":{id}}}}}]}}]}}"#,
            id = ids[winner],
        );

        metrics::counter!("auction.responded").increment(1);
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full(body))
            .expect("static response headers")
    }

    /// Side-service filters. The id-db lookup resolves the exchange-scoped
    /// user id; candidate pruning on segment membership is compiled in only
    /// when the `segment-filter` feature is enabled, and filters never
    /// reorder candidates.
    async fn filter(&self, value: &Arc<Value>, candidates: &mut [Option<Arc<Bidder>>]) {
        let Some(user_ids) = &self.user_ids else {
            return;
        };

        let Some(exchange) = extract(value, &["ext", "exchange"]).and_then(Value::as_str) else {
            return;
        };
        let prefix = match exchange {
            "adaptv" => "ap",
            _ => return,
        };

        let Some(user_id) = extract(value, &["user", "id"]).and_then(Value::as_str) else {
            return;
        };

        let key = fnv1a64(format!("{prefix}:{user_id}").as_bytes()).to_be_bytes();
        let mapped = match user_ids.get(&key).await {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(%err, "id-db lookup failed");
                metrics::counter!("auction.iddb_error").increment(1);
                return;
            }
        };

        let Some(mapped) = mapped else {
            metrics::counter!("auction.iddb_miss").increment(1);
            return;
        };

        let Some(uid) = std::str::from_utf8(&mapped)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            metrics::counter!("auction.iddb_bad_value").increment(1);
            return;
        };

        metrics::counter!("auction.iddb_hit").increment(1);
        self.segment_filter(uid, candidates);
    }

    #[cfg(feature = "segment-filter")]
    fn segment_filter(&self, uid: u64, candidates: &mut [Option<Arc<Bidder>>]) {
        let Some(cache) = &self.segments else {
            return;
        };

        let want: Vec<i64> = candidates
            .iter()
            .flatten()
            .filter_map(|b| b.descriptor.params.as_ref())
            .filter_map(|p| p.segments.as_ref())
            .flat_map(|s| s.ids.iter().copied())
            .collect();
        if want.is_empty() {
            return;
        }

        let membership = cache.segments(uid, &want);

        for slot in candidates.iter_mut() {
            let Some(bidder) = slot else {
                continue;
            };
            let Some(spec) = bidder
                .descriptor
                .params
                .as_ref()
                .and_then(|p| p.segments.as_ref())
            else {
                continue;
            };
            if spec.ids.is_empty() {
                continue;
            }

            let keep = match &membership {
                None => !spec.required,
                Some(found) => spec.ids.iter().any(|id| found.contains(id)),
            };
            if !keep {
                *slot = None;
            }
        }
    }

    #[cfg(not(feature = "segment-filter"))]
    fn segment_filter(&self, _uid: u64, _candidates: &mut [Option<Arc<Bidder>>]) {}

    /// True when the winner carries a risk augmenter and the scored request
    /// exceeds its threshold. Scoring failures never veto.
    async fn vetoed_by_risk(&self, bidder: &Arc<Bidder>, value: &Arc<Value>) -> bool {
        let Some(risk) = &self.risk else {
            return false;
        };
        let Some(augmenter) = bidder
            .descriptor
            .augmenters
            .as_ref()
            .and_then(|a| a.forensiq.as_ref())
        else {
            return false;
        };

        let mut components = Components::default();
        components.attach("fields", value.clone());

        let request = match risk.new_request(&components) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(%err, "risk request not prepared");
                return false;
            }
        };

        if let Err(err) = risk.process(&mut components, &request).await {
            tracing::debug!(%err, "risk check failed");
            return false;
        }

        let score = risk.risk_score(&components).unwrap_or(0.0);
        metrics::histogram!("auction.risk_score").record(score);
        score > augmenter.config.risk_score
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// String ordering on unpadded decimal integers: longer wins, equal length
/// compares lexicographically. Priority decides; price breaks priority
/// ties. Strict, so full ties keep the incumbent.
fn beats(candidate: (&str, &str), best: (&str, &str)) -> bool {
    let (priority, price) = candidate;
    let (best_priority, best_price) = best;

    if priority.len() != best_priority.len() {
        return priority.len() > best_priority.len();
    }
    if priority != best_priority {
        return priority > best_priority;
    }
    if price.len() != best_price.len() {
        return price.len() > best_price.len();
    }
    price > best_price
}

#[async_trait]
impl Handler for Exchange {
    async fn serve(&self, req: Request<Incoming>) -> Response<Body> {
        let Ok(collected) = req.into_body().collect().await else {
            metrics::counter!("auction.body_read_failed").increment(1);
            return status(StatusCode::NO_CONTENT);
        };
        self.auction(&collected.to_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auction_server::{Server, ServerConfig};
    use bidder_registry::{BiddersConfig, Pacing};
    use core_types::MemoryKv;
    use risk_engine::RiskConfig;
    use std::collections::HashMap;
    use std::future::IntoFuture;
    use std::path::PathBuf;
    use std::time::Instant;

    const SAMPLE: &str = r#"{
      "app": {"bundle": "com.cleanmaster.mguard", "name": "clean+master+(300x250)"},
      "at": 2,
      "device": {
        "devicetype": 4,
        "ip": "172.56.16.226",
        "ua": "Mozilla/5.0+(Linux;+Android+5.1.1)"
      },
      "ext": {"exchange": "publisher", "price": 5000, "videotype": "instream"},
      "id": "0a97fa93-ab2c-de6c-d6d3-96dc50052d16",
      "imp": [
        {
          "ext": {"creative-ids": {"5162210": [5162210]}, "external-ids": [5162210]},
          "id": "1",
          "video": {"pos": 0}
        }
      ],
      "tmax": 79,
      "user": {"geo": {"country": "US", "metro": "618"}}
    }"#;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bidengine-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn descriptor(id: i64, priority: i64, price: &str, risk_threshold: Option<f64>) -> String {
        let augmentations = match risk_threshold {
            Some(threshold) => format!(
                r#","augmentations": {{"forensiq": {{"required": true, "config": {{"riskScore": {threshold}}}}}}}"#
            ),
            None => String::new(),
        };
        format!(
            r#"{{"account": ["agent{id}"], "externalId": {id}, "bidProbability": 1.0,
                "creatives": [{{"id": {id}}}]{augmentations},
                "ext": {{"budget": "0USD/1M", "pace": "600000USD/1M", "price": "{price}", "priority": {priority}}}}}"#
        )
    }

    async fn registry_with(tag: &str, descriptors: &[String]) -> Arc<Bidders> {
        let dir = scratch_dir(tag);
        for (i, body) in descriptors.iter().enumerate() {
            std::fs::write(dir.join(format!("agent{i}.json")), body).unwrap();
        }
        let bidders = Arc::new(Bidders::new(BiddersConfig {
            pattern: dir.join("*.json").to_string_lossy().into_owned(),
            ..BiddersConfig::default()
        }));
        bidders.reload().await.expect("load agents");
        bidders
    }

    fn open_window(bidders: &Bidders, id: &str, bids: i64, sampling: f64) {
        let resolved = bidders.bidders(&[id.to_string()]);
        let bidder = resolved[0].as_ref().expect("agent loaded");
        bidder.set_pacing(Pacing::window(bids, Instant::now(), 0.0, sampling));
    }

    async fn serve_exchange(exchange: Exchange) -> Arc<Server> {
        let server = Arc::new(Server::new(
            ServerConfig::new("127.0.0.1:0".parse().unwrap(), "bid-test"),
            Arc::new(exchange),
        ));
        server.start().await.expect("start");
        server
    }

    #[test]
    fn tie_break_follows_length_then_lexicographic() {
        // Longer priority wins regardless of price.
        assert!(beats(("10", "5000"), ("9", "5000")));
        assert!(!beats(("9", "5000"), ("10", "5000")));
        // Equal priority: larger price wins.
        assert!(beats(("10", "5000"), ("10", "4999")));
        assert!(!beats(("10", "4999"), ("10", "5000")));
        // Longer price beats lexicographically-larger shorter one.
        assert!(beats(("10", "10000"), ("10", "9999")));
        // Full tie keeps the incumbent.
        assert!(!beats(("10", "5000"), ("10", "5000")));
    }

    #[tokio::test]
    async fn happy_bid_renders_the_exact_seatbid() {
        let bidders = registry_with(
            "happy",
            &[descriptor(5162210, 1, "5000USD/1M", None)],
        )
        .await;
        open_window(&bidders, "5162210", 10, 1.0);

        let server = serve_exchange(Exchange::new(bidders)).await;
        let response = reqwest::Client::new()
            .post(server.url())
            .body(SAMPLE)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(
            response.text().await.unwrap(),
            r#"{"seatbid":[{"bid":[{"impid":"1","price":5.000000,"crid":"5162210","ext":{"priority":1,"external-id":5162210}}]}]}"#
        );
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_candidates_is_204() {
        let bidders = registry_with("empty", &[descriptor(1, 1, "5000USD/1M", None)]).await;
        let server = serve_exchange(Exchange::new(bidders)).await;

        let body = SAMPLE.replace(r#"{"5162210": [5162210]}"#, "{}");
        let response = reqwest::Client::new()
            .post(server.url())
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn paced_out_agent_is_204() {
        let bidders = registry_with(
            "paced",
            &[descriptor(5162210, 1, "5000USD/1M", None)],
        )
        .await;
        open_window(&bidders, "5162210", 0, 0.0);

        let server = serve_exchange(Exchange::new(bidders)).await;
        let response = reqwest::Client::new()
            .post(server.url())
            .body(SAMPLE)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_bodies_are_204() {
        let bidders = registry_with("bad", &[descriptor(1, 1, "5000USD/1M", None)]).await;
        let server = serve_exchange(Exchange::new(bidders)).await;
        let client = reqwest::Client::new();

        for body in ["not json", r#"{"imp": []}"#, r#"{"imp": [{"ext": {}}]}"#] {
            let response = client.post(server.url()).body(body).send().await.unwrap();
            assert_eq!(response.status(), 204, "body: {body}");
        }
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn higher_priority_width_wins_the_auction() {
        let bidders = registry_with(
            "tiebreak",
            &[
                descriptor(101, 9, "5000USD/1M", None),
                descriptor(102, 10, "5000USD/1M", None),
            ],
        )
        .await;
        open_window(&bidders, "101", 10, 1.0);
        open_window(&bidders, "102", 10, 1.0);

        let server = serve_exchange(Exchange::new(bidders)).await;
        let body = SAMPLE.replace(
            r#"{"5162210": [5162210]}"#,
            r#"{"101": [101], "102": [102]}"#,
        );
        let response = reqwest::Client::new()
            .post(server.url())
            .body(body)
            .send()
            .await
            .unwrap();
        let text = response.text().await.unwrap();
        assert!(text.contains(r#""external-id":102"#), "got {text}");
        server.close().await.unwrap();
    }

    async fn risk_service(score: f64) -> std::net::SocketAddr {
        let router = axum::Router::new()
            .route("/ready", axum::routing::get(|| async { "1" }))
            .route(
                "/check",
                axum::routing::get(move || async move {
                    format!(r#"{{"suspect":false,"timeMs":1,"riskScore":{score}}}"#)
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    fn risk_client(addr: std::net::SocketAddr) -> Arc<RiskClient> {
        Arc::new(RiskClient::new(RiskConfig {
            base_url: format!("http://{addr}"),
            client_key: "test-key".to_string(),
            fields: HashMap::from([
                ("ip".to_string(), vec!["device".to_string(), "ip".to_string()]),
                ("ua".to_string(), vec!["device".to_string(), "ua".to_string()]),
                ("seller".to_string(), vec!["ext".to_string(), "exchange".to_string()]),
            ]),
            caching: true,
            ..RiskConfig::default()
        }))
    }

    #[tokio::test]
    async fn risky_traffic_is_vetoed() {
        let addr = risk_service(80.0).await;
        let risk = risk_client(addr);
        risk.health_check().await.expect("risk service healthy");

        let bidders = registry_with(
            "veto",
            &[descriptor(5162210, 1, "5000USD/1M", Some(65.0))],
        )
        .await;
        open_window(&bidders, "5162210", 10, 1.0);

        let server = serve_exchange(Exchange::new(bidders).with_risk(risk)).await;
        let response = reqwest::Client::new()
            .post(server.url())
            .body(SAMPLE)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn low_risk_traffic_still_bids() {
        let addr = risk_service(20.0).await;
        let risk = risk_client(addr);
        risk.health_check().await.expect("risk service healthy");

        let bidders = registry_with(
            "lowrisk",
            &[descriptor(5162210, 1, "5000USD/1M", Some(65.0))],
        )
        .await;
        open_window(&bidders, "5162210", 10, 1.0);

        let server = serve_exchange(Exchange::new(bidders).with_risk(risk)).await;
        let response = reqwest::Client::new()
            .post(server.url())
            .body(SAMPLE)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        server.close().await.unwrap();
    }

    #[cfg(feature = "segment-filter")]
    #[tokio::test]
    async fn uncovered_required_segment_filters_the_candidate() {
        use segment_cache::{SegmentCache, SegmentCacheConfig};

        struct NoStore;

        #[async_trait]
        impl core_types::ObjectStore for NoStore {
            async fn download(&self, key: &str) -> anyhow::Result<Vec<u8>> {
                anyhow::bail!("offline: {key}")
            }
        }

        let kv = Arc::new(MemoryKv::default());
        kv.insert(fnv1a64(b"ap:user-77").to_be_bytes().to_vec(), b"4242".to_vec());
        kv.rotate();

        let dir = scratch_dir("segfilter");
        std::fs::write(
            dir.join("agent.json"),
            r#"{"account": ["cohort"], "externalId": 5162210,
                "creatives": [{"id": 5162210}],
                "ext": {"pace": "600000USD/1M", "price": "5000USD/1M", "priority": 1,
                        "segments": {"required": true, "ids": [9]}}}"#,
        )
        .unwrap();
        let bidders = Arc::new(Bidders::new(BiddersConfig {
            pattern: dir.join("*.json").to_string_lossy().into_owned(),
            ..BiddersConfig::default()
        }));
        bidders.reload().await.expect("load agents");
        open_window(&bidders, "5162210", 10, 1.0);

        let cache = Arc::new(SegmentCache::new(
            SegmentCacheConfig::default(),
            Arc::new(NoStore),
        ));
        let exchange = Exchange::new(bidders)
            .with_user_ids(kv)
            .with_segments(cache);
        let server = serve_exchange(exchange).await;

        let body = SAMPLE
            .replace(r#""exchange": "publisher""#, r#""exchange": "adaptv""#)
            .replace(r#""user": {"geo""#, r#""user": {"id": "user-77", "geo""#);
        let response = reqwest::Client::new()
            .post(server.url())
            .body(body)
            .send()
            .await
            .unwrap();

        // The snapshot does not cover segment 9 and membership is required.
        assert_eq!(response.status(), 204);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn id_db_lookup_does_not_disturb_the_auction() {
        let kv = Arc::new(MemoryKv::default());
        let key = fnv1a64(b"ap:user-77").to_be_bytes().to_vec();
        kv.insert(key, b"4242".to_vec());
        kv.rotate();

        let bidders = registry_with(
            "iddb",
            &[descriptor(5162210, 1, "5000USD/1M", None)],
        )
        .await;
        open_window(&bidders, "5162210", 10, 1.0);

        let server = serve_exchange(Exchange::new(bidders).with_user_ids(kv)).await;
        let body = SAMPLE
            .replace(r#""exchange": "publisher""#, r#""exchange": "adaptv""#)
            .replace(
                r#""user": {"geo""#,
                r#""user": {"id": "user-77", "geo""#,
            );
        let response = reqwest::Client::new()
            .post(server.url())
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        server.close().await.unwrap();
    }
}
