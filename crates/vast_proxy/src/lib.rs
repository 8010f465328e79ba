//! Bounded fan-out proxy for VAST traffic. Requests are forwarded to one of
//! a round-robin set of upstreams with a strict wall-clock deadline; any
//! failure, rejection or timeout degrades to the canonical empty VAST
//! document so the caller always gets a well-formed 200.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use auction_server::{full, Body, BoxError, Handler};
use core_types::new_uuid;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};

pub const EMPTY_VAST: &str = r#"<VAST xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="vast.xsd" version="2.0"/>"#;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Comma-separated upstream base URLs.
    pub upstreams: String,
    pub deadline: Duration,
    pub max_in_flight: i64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstreams: String::new(),
            deadline: Duration::from_millis(50),
            max_in_flight: 32,
        }
    }
}

enum ParamKind {
    Text,
    Number,
    Ip,
}

/// Fixed allow-list; anything else on the query string is dropped.
fn parameter_kind(name: &str) -> Option<ParamKind> {
    match name {
        "width" | "height" | "lat" | "lon" | "price" => Some(ParamKind::Number),
        "ip" => Some(ParamKind::Ip),
        "ua" | "devicetype" | "lang" | "pageurl" | "app_storeurl" | "app_bundle" | "appName"
        | "videotype" | "deviceid" | "partner" | "userid" | "pubid" | "referurl" | "idfa"
        | "idfa_md5" | "idfa_sha1" | "aid" | "aid_md5" | "aid_sha1" => Some(ParamKind::Text),
        _ => None,
    }
}

fn valid(kind: &ParamKind, value: &str) -> bool {
    match kind {
        ParamKind::Text => true,
        ParamKind::Number => value.parse::<f64>().is_ok(),
        ParamKind::Ip => value.parse::<IpAddr>().is_ok(),
    }
}

/// Strict percent-encoding check; every '%' must introduce two hex digits.
fn percent_ok(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

pub struct VastProxy {
    upstreams: Vec<String>,
    deadline: Duration,
    max_in_flight: i64,
    http: reqwest::Client,
    inflight: Arc<AtomicI64>,
    next: AtomicU64,
}

impl VastProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            upstreams: config
                .upstreams
                .split(',')
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
            deadline: config.deadline,
            max_in_flight: config.max_in_flight,
            http: reqwest::Client::builder()
                .pool_max_idle_per_host(1024)
                .build()
                .expect("proxy http client"),
            inflight: Arc::new(AtomicI64::new(0)),
            next: AtomicU64::new(0),
        }
    }

    fn vast() -> Response<Body> {
        Response::builder()
            .status(200)
            .header("content-type", "application/xml")
            .header("content-length", EMPTY_VAST.len())
            .body(full(EMPTY_VAST))
            .expect("static vast response")
    }

    fn pick_upstream(&self) -> Option<&str> {
        match self.upstreams.len() {
            0 => None,
            1 => Some(&self.upstreams[0]),
            n => {
                let turn = self.next.fetch_add(1, Ordering::Relaxed) + 1;
                Some(&self.upstreams[(turn % n as u64) as usize])
            }
        }
    }

    /// Rebuilds the query string: allow-listed, validated, single-valued
    /// parameters only, plus a fresh request id. `None` means the raw query
    /// did not even percent-decode.
    fn shape_query(raw: &str) -> Option<String> {
        if !percent_ok(raw) {
            return None;
        }

        let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            seen.entry(name.into_owned()).or_default().push(value.into_owned());
        }

        let mut keep: BTreeMap<String, String> = BTreeMap::new();
        for (name, values) in seen {
            let Some(kind) = parameter_kind(&name) else {
                continue;
            };
            if values.len() != 1 || values[0].is_empty() || !valid(&kind, &values[0]) {
                continue;
            }
            keep.insert(name, values.into_iter().next().expect("one value"));
        }
        keep.insert("id".to_string(), new_uuid());

        let mut out = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &keep {
            out.append_pair(name, value);
        }
        Some(out.finish())
    }
}

#[async_trait]
impl Handler for VastProxy {
    async fn serve(&self, req: Request<Incoming>) -> Response<Body> {
        let Some(upstream) = self.pick_upstream() else {
            metrics::counter!("proxy.no_upstream").increment(1);
            return Self::vast();
        };

        let Some(query) = Self::shape_query(req.uri().query().unwrap_or("")) else {
            metrics::counter!("proxy.bad_query").increment(1);
            return Self::vast();
        };

        let url = format!("{}{}?{}", upstream, req.uri().path(), query);

        let admitted = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        if admitted > self.max_in_flight {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!("proxy.too_many_in_flight").increment(1);
            return Self::vast();
        }

        let request = self.http.get(&url).send();
        let inflight = self.inflight.clone();
        let mut upstream_task = tokio::spawn(async move {
            let result = request.await;
            // The slot frees once response headers (or the error) arrive;
            // body consumption is the caller's business.
            inflight.fetch_sub(1, Ordering::AcqRel);
            result
        });

        tokio::select! {
            joined = &mut upstream_task => {
                let response = match joined {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        tracing::debug!(%err, "upstream failed");
                        metrics::counter!("proxy.upstream_failed").increment(1);
                        return Self::vast();
                    }
                    Err(err) => {
                        tracing::warn!(%err, "upstream task failed");
                        return Self::vast();
                    }
                };

                let mut builder = Response::builder().status(200);
                for (name, value) in response.headers() {
                    if name == "connection" || name == "transfer-encoding" {
                        continue;
                    }
                    builder = builder.header(name, value);
                }

                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map(Frame::data).map_err(|e| Box::new(e) as BoxError));
                match builder.body(BodyExt::boxed(StreamBody::new(stream))) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!(%err, "bad upstream headers");
                        Self::vast()
                    }
                }
            }
            _ = tokio::time::sleep(self.deadline) => {
                metrics::counter!("proxy.timeout").increment(1);
                // Detached drain: consume the eventual response so the
                // upstream socket returns to the pool.
                tokio::spawn(async move {
                    let Ok(Ok(response)) = upstream_task.await else {
                        return;
                    };
                    let mut body = response.bytes_stream();
                    while let Some(chunk) = body.next().await {
                        if chunk.is_err() {
                            break;
                        }
                    }
                });
                Self::vast()
            }
        }
    }
}
