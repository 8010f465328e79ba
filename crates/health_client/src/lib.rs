//! HTTP client wrapper that tracks the health of a single remote service.
//! A periodic probe of the service's `/ready` endpoint refills a "good"
//! counter; request failures drain it. Callers check `ready()` before
//! spending a network round-trip on an endpoint that is known to be down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use infra_sched::CancelHandle;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("too many requests in flight")]
    TooManyInFlight,
    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Number of request failures tolerated before the endpoint is treated
    /// as unavailable. Refilled by each successful health check.
    pub fail_count: i64,
    /// Maximum concurrent requests; 0 means unlimited.
    pub max_in_flight: i64,
    pub check_period: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fail_count: 10,
            max_in_flight: 0,
            check_period: Duration::from_secs(10),
        }
    }
}

pub struct HealthClient {
    http: reqwest::Client,
    config: HealthConfig,
    good: AtomicI64,
    inflight: AtomicI64,
}

impl HealthClient {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            good: AtomicI64::new(0),
            inflight: AtomicI64::new(0),
        }
    }

    /// Snapshot of the known endpoint status.
    pub fn ready(&self) -> bool {
        self.good.load(Ordering::Acquire) > 0
    }

    /// Starts the periodic probe. The endpoint stays unavailable until the
    /// first successful check.
    pub fn monitor(self: &Arc<Self>, url: String) -> CancelHandle {
        let client = self.clone();
        infra_sched::tick(self.config.check_period, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                if let Err(err) = client.health_check(&url).await {
                    tracing::warn!(%url, %err, "health check failed");
                }
            }
        })
    }

    /// Probes `url`; healthy means HTTP 200 with a body starting with '1'.
    pub async fn health_check(&self, url: &str) -> Result<(), ClientError> {
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(err) => {
                self.good.store(0, Ordering::Release);
                return Err(err.into());
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(err) => {
                self.good.store(0, Ordering::Release);
                return Err(err.into());
            }
        };

        if status != reqwest::StatusCode::OK || body.first() != Some(&b'1') {
            self.good.store(0, Ordering::Release);
            return Err(ClientError::Status(status));
        }

        self.good.store(self.config.fail_count, Ordering::Release);
        Ok(())
    }

    /// GET with in-flight admission and failure accounting. A failed request
    /// drains one unit of "good"; the endpoint flips unavailable at zero.
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, ClientError> {
        let _permit = if self.config.max_in_flight != 0 {
            let permit = InFlight::enter(&self.inflight);
            if permit.count >= self.config.max_in_flight {
                metrics::counter!("client.rejected_in_flight").increment(1);
                return Err(ClientError::TooManyInFlight);
            }
            Some(permit)
        } else {
            None
        };

        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(err) => {
                self.good.fetch_sub(1, Ordering::AcqRel);
                metrics::counter!("client.network_error").increment(1);
                return Err(err.into());
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::NO_CONTENT {
            self.good.fetch_sub(1, Ordering::AcqRel);
            metrics::counter!("client.bad_status").increment(1);
            return Err(ClientError::Status(status));
        }

        Ok(response)
    }
}

struct InFlight<'a> {
    counter: &'a AtomicI64,
    count: i64,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicI64) -> Self {
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        Self { counter, count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::IntoFuture;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    async fn serve(router: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router).into_future());
        addr
    }

    #[tokio::test]
    async fn ready_flips_with_health_checks() {
        // First probe sees "0", second sees "1", mirroring a service that
        // comes up between checks.
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = hits.clone();
        let router = axum::Router::new().route(
            "/ready",
            axum::routing::get(move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                async move { format!("{n}") }
            }),
        );
        let addr = serve(router).await;
        let url = format!("http://{addr}/ready");

        let client = HealthClient::new(HealthConfig::default());
        assert!(!client.ready());

        assert!(client.health_check(&url).await.is_err());
        assert!(!client.ready());

        client.health_check(&url).await.expect("second check");
        assert!(client.ready());
    }

    #[tokio::test]
    async fn failures_drain_readiness() {
        let router = axum::Router::new()
            .route("/ready", axum::routing::get(|| async { "1" }))
            .route(
                "/boom",
                axum::routing::get(|| async { axum::http::StatusCode::BAD_GATEWAY }),
            );
        let addr = serve(router).await;

        let client = HealthClient::new(HealthConfig {
            fail_count: 2,
            ..HealthConfig::default()
        });
        client
            .health_check(&format!("http://{addr}/ready"))
            .await
            .expect("healthy");
        assert!(client.ready());

        let boom = format!("http://{addr}/boom");
        assert!(matches!(
            client.get(&boom).await,
            Err(ClientError::Status(_))
        ));
        assert!(client.ready());

        assert!(client.get(&boom).await.is_err());
        assert!(!client.ready());
    }

    #[tokio::test]
    async fn in_flight_ceiling_rejects() {
        let router = axum::Router::new().route(
            "/slow",
            axum::routing::get(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                "ok"
            }),
        );
        let addr = serve(router).await;
        let url = format!("http://{addr}/slow");

        let client = Arc::new(HealthClient::new(HealthConfig {
            max_in_flight: 2,
            ..HealthConfig::default()
        }));

        let slow = {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move { client.get(&url).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One slot is taken; a cap of 2 admits nothing further.
        assert!(matches!(
            client.get(&url).await,
            Err(ClientError::TooManyInFlight)
        ));

        slow.await.unwrap().expect("slow request succeeds");
        client.get(&url).await.expect("slot released");
    }
}
