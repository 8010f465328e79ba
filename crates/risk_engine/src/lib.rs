//! Client for the traffic risk-scoring service. A request is prepared by
//! extracting configured fields from the bid request's JSON, then issued as
//! a health-gated GET against the service's `/check` endpoint. Responses are
//! cached by canonical query string; entries live until the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use core_types::{extract, Components};
use health_client::{ClientError, HealthClient, HealthConfig};
use infra_sched::CancelHandle;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("no field extractor component")]
    NoExtractor,
    #[error("request is missing required fields")]
    MissingFields,
    #[error("risk service is unavailable")]
    Unavailable,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("bad response: {0}")]
    BadResponse(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub base_url: String,
    pub client_key: String,
    /// Service criteria name to JSON path in the source component,
    /// e.g. `ip -> ["device", "ip"]`.
    pub fields: HashMap<String, Vec<String>>,
    /// Component holding the JSON to extract fields from.
    pub source: String,
    /// Component name under which the parsed response is attached.
    pub target: String,
    pub caching: bool,
    pub health: HealthConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_url: "http://api.forensiq.com".to_string(),
            client_key: String::new(),
            fields: HashMap::new(),
            source: "fields".to_string(),
            target: "forensiq".to_string(),
            caching: false,
            health: HealthConfig::default(),
        }
    }
}

/// A prepared `/check` call: the canonical (sorted, encoded) query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    query: String,
}

pub struct RiskClient {
    config: RiskConfig,
    http: Arc<HealthClient>,
    cache: RwLock<HashMap<String, Arc<Value>>>,
}

impl RiskClient {
    pub fn new(config: RiskConfig) -> Self {
        let http = Arc::new(HealthClient::new(config.health.clone()));
        Self {
            config,
            http,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Starts the periodic probe of the service's `/ready` endpoint.
    pub fn start(self: &Arc<Self>) -> CancelHandle {
        self.http.monitor(format!("{}/ready", self.config.base_url))
    }

    pub fn ready(&self) -> bool {
        self.http.ready()
    }

    pub async fn health_check(&self) -> Result<(), ClientError> {
        self.http
            .health_check(&format!("{}/ready", self.config.base_url))
            .await
    }

    /// Builds the query from the request's source component. Fails when the
    /// component is missing or any of `ck`, `rt`, `ip`, `seller` comes up
    /// empty.
    pub fn new_request(&self, components: &Components) -> Result<CheckRequest, RiskError> {
        let fields = components
            .component(&self.config.source)
            .ok_or(RiskError::NoExtractor)?;

        let mut args: BTreeMap<String, String> = BTreeMap::new();
        args.insert("ck".to_string(), self.config.client_key.clone());
        args.insert("output".to_string(), "json".to_string());
        args.insert("rt".to_string(), "display".to_string());

        for (key, path) in &self.config.fields {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            let Some(item) = extract(fields, &segments) else {
                continue;
            };
            let Some(text) = scalar_to_string(item) else {
                continue;
            };
            args.insert(key.clone(), text);
        }

        for required in ["ck", "rt", "ip", "seller"] {
            if args.get(required).map(String::is_empty).unwrap_or(true) {
                return Err(RiskError::MissingFields);
            }
        }

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &args {
            serializer.append_pair(key, value);
        }

        Ok(CheckRequest {
            query: serializer.finish(),
        })
    }

    /// Issues the call (or serves it from cache) and attaches the parsed
    /// response to the request under the target component name.
    pub async fn process(
        &self,
        components: &mut Components,
        request: &CheckRequest,
    ) -> Result<(), RiskError> {
        if !self.http.ready() {
            metrics::counter!("risk.not_ready").increment(1);
            return Err(RiskError::Unavailable);
        }

        let cached = if self.config.caching {
            self.cache.read().get(&request.query).cloned()
        } else {
            None
        };

        let value = match cached {
            Some(value) => {
                metrics::counter!("risk.cache_hit").increment(1);
                value
            }
            None => {
                let url = format!("{}/check?{}", self.config.base_url, request.query);
                let response = self.http.get(&url).await?;
                let value = Arc::new(response.json::<Value>().await?);
                if self.config.caching {
                    self.cache.write().insert(request.query.clone(), value.clone());
                }
                value
            }
        };

        components.attach(self.config.target.clone(), value);
        Ok(())
    }

    /// Reads the `riskScore` field from an attached response.
    pub fn risk_score(&self, components: &Components) -> Option<f64> {
        let response = components.component(&self.config.target)?;
        extract(response, &["riskScore"]).and_then(Value::as_f64)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    fn client_for(addr: SocketAddr, caching: bool) -> RiskClient {
        RiskClient::new(RiskConfig {
            base_url: format!("http://{addr}"),
            client_key: "0123456789".to_string(),
            fields: HashMap::from([
                ("ip".to_string(), vec!["ip4".to_string()]),
                ("seller".to_string(), vec!["pubid".to_string()]),
            ]),
            caching,
            ..RiskConfig::default()
        })
    }

    fn check_router(hits: Arc<AtomicUsize>) -> axum::Router {
        axum::Router::new()
            .route("/ready", axum::routing::get(|| async { "1" }))
            .route(
                "/check",
                axum::routing::get(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async { r#"{"suspect":true,"timeMs":1,"riskScore":65}"# }
                }),
            )
    }

    #[tokio::test]
    async fn prepare_validates_required_fields() {
        let addr = serve(check_router(Arc::new(AtomicUsize::new(0)))).await;
        let client = client_for(addr, false);

        // No source component attached yet.
        let mut components = Components::default();
        assert!(matches!(
            client.new_request(&components),
            Err(RiskError::NoExtractor)
        ));

        // Component present but missing the seller field.
        components.attach("fields", Arc::new(json!({"ip4": "1.2.3.4"})));
        assert!(matches!(
            client.new_request(&components),
            Err(RiskError::MissingFields)
        ));

        components.attach("fields", Arc::new(json!({"ip4": "1.2.3.4", "pubid": "1234"})));
        let request = client.new_request(&components).expect("prepared");
        assert_eq!(
            request.query,
            "ck=0123456789&ip=1.2.3.4&output=json&rt=display&seller=1234"
        );
    }

    #[tokio::test]
    async fn process_gates_on_readiness() {
        let addr = serve(check_router(Arc::new(AtomicUsize::new(0)))).await;
        let client = client_for(addr, false);

        let mut components = Components::default();
        components.attach("fields", Arc::new(json!({"ip4": "1.2.3.4", "pubid": "1234"})));
        let request = client.new_request(&components).expect("prepared");

        assert!(matches!(
            client.process(&mut components, &request).await,
            Err(RiskError::Unavailable)
        ));

        client.health_check().await.expect("healthy");
        client
            .process(&mut components, &request)
            .await
            .expect("processed");
        assert_eq!(client.risk_score(&components), Some(65.0));
    }

    #[tokio::test]
    async fn cache_suppresses_repeat_queries() {
        let hits = Arc::new(AtomicUsize::new(0));
        let addr = serve(check_router(hits.clone())).await;
        let client = client_for(addr, true);
        client.health_check().await.expect("healthy");

        let mut components = Components::default();
        components.attach("fields", Arc::new(json!({"ip4": "1.2.3.4", "pubid": "1234"})));
        let request = client.new_request(&components).expect("prepared");

        client.process(&mut components, &request).await.expect("first");
        client.process(&mut components, &request).await.expect("second");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
