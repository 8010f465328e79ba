//! Connection-tracking HTTP server with graceful shutdown. Every accepted
//! connection is recorded in a ledger with its last observed lifecycle
//! phase; closing the server stops the accept loop, hard-closes connections
//! that are idle or never got a request, lets active ones drain, and waits
//! on the remainder up to a deadline. The built-in `GET /ready` route
//! reports 200 while the server accepts traffic.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use infra_sched::CancelHandle;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::Instrument;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = BoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|e| match e {}).boxed()
}

pub fn empty() -> Body {
    Empty::new().map_err(|e| match e {}).boxed()
}

pub fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(empty());
    *response.status_mut() = code;
    response
}

/// Request handler attached to a server. `shutdown` runs once after the
/// last connection drains.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(&self, req: Request<Incoming>) -> Response<Body>;

    async fn shutdown(&self) {}
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("timeout closing after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnPhase {
    New,
    Active,
    Idle,
    Closed,
    Hijacked,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Name of the serving span; shows up on every request's trace.
    pub name: String,
    pub close_timeout: Duration,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
            close_timeout: Duration::from_secs(60),
        }
    }
}

struct ConnState {
    phase: ConnPhase,
    abort: Option<tokio::task::AbortHandle>,
}

struct ConnTracker {
    seq: AtomicU64,
    count: AtomicI64,
    ledger: DashMap<u64, ConnState>,
    drained: Notify,
}

impl ConnTracker {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            count: AtomicI64::new(0),
            ledger: DashMap::new(),
            drained: Notify::new(),
        }
    }

    fn open(&self) -> u64 {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::AcqRel);
        self.ledger.insert(
            id,
            ConnState {
                phase: ConnPhase::New,
                abort: None,
            },
        );
        id
    }

    fn set_phase(&self, id: u64, phase: ConnPhase) {
        if let Some(mut entry) = self.ledger.get_mut(&id) {
            entry.phase = phase;
        }
    }

    fn set_abort(&self, id: u64, abort: tokio::task::AbortHandle) {
        if let Some(mut entry) = self.ledger.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    fn finish(&self, id: u64) {
        if self.ledger.remove(&id).is_none() {
            return;
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Removes the connection from the ledger even when its task is aborted.
struct ConnGuard {
    tracker: Arc<ConnTracker>,
    id: u64,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.tracker.set_phase(self.id, ConnPhase::Closed);
        self.tracker.finish(self.id);
    }
}

pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    ready: AtomicI64,
    conns: Arc<ConnTracker>,
    shutdown: watch::Sender<bool>,
    bound: OnceLock<SocketAddr>,
    tick: parking_lot::Mutex<Option<CancelHandle>>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn Handler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            handler,
            ready: AtomicI64::new(0),
            conns: Arc::new(ConnTracker::new()),
            shutdown,
            bound: OnceLock::new(),
            tick: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the listener, starts accepting and flips the ready flag.
    /// Panics when called on a server that is already running.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .with_context(|| format!("bind {}", self.config.addr))?;
        let addr = listener.local_addr().context("local addr")?;
        let _ = self.bound.set(addr);

        let server = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => server.accept(stream),
                            Err(err) => tracing::warn!(%err, "accept failed"),
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        let name = self.config.name.clone();
        let conns = self.conns.clone();
        let server = self.clone();
        *self.tick.lock() = Some(infra_sched::tick(Duration::from_secs(1), move || {
            let name = name.clone();
            let count = conns.count.load(Ordering::Acquire) as f64;
            let ready = server.ready.load(Ordering::Acquire) as f64;
            async move {
                metrics::gauge!("server.connections", "server" => name.clone()).set(count);
                metrics::gauge!("server.ready", "server" => name).set(ready);
            }
        }));

        if self.ready.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire).is_err() {
            panic!("server is already ready to serve requests");
        }

        tracing::info!(server = %self.config.name, %addr, "listening");
        Ok(())
    }

    /// Address the listener actually bound; useful with port 0.
    pub fn url(&self) -> String {
        match self.bound.get() {
            Some(addr) => format!("http://{addr}"),
            None => String::new(),
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream) {
        let id = self.conns.open();
        let guard = ConnGuard {
            tracker: self.conns.clone(),
            id,
        };
        let server = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            server.serve_connection(stream, id).await;
        });
        self.conns.set_abort(id, task.abort_handle());
    }

    async fn serve_connection(self: &Arc<Self>, stream: TcpStream, id: u64) {
        let io = TokioIo::new(stream);

        let server = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let server = server.clone();
            async move {
                server.conns.set_phase(id, ConnPhase::Active);
                let response = server.route(req).await;
                server.conns.set_phase(id, ConnPhase::Idle);
                Ok::<_, Infallible>(response)
            }
        });

        let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    tracing::debug!(%err, "connection ended");
                }
            }
            _ = shutdown.changed() => {
                // Finish the request in flight, then close instead of
                // waiting for the next one.
                conn.as_mut().graceful_shutdown();
                let _ = conn.as_mut().await;
            }
        }
    }

    async fn route(&self, req: Request<Incoming>) -> Response<Body> {
        if self.ready.load(Ordering::Acquire) == 0 {
            let mut response = Response::new(full("server is closed"));
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return response;
        }

        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let span =
            tracing::info_span!("request", server = %self.config.name, id = %request_id);

        if req.method() == Method::GET && req.uri().path() == "/ready" {
            return status(StatusCode::OK);
        }

        self.handler.serve(req).instrument(span).await
    }

    /// Graceful shutdown: idempotent; returns `CloseError::Timeout` when
    /// active connections outlive the deadline (the process keeps running).
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.ready.compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Ok(());
        }

        // Stops the accept loop and turns off keep-alive on live connections.
        let _ = self.shutdown.send(true);

        for entry in self.conns.ledger.iter() {
            if matches!(entry.phase, ConnPhase::New | ConnPhase::Idle) {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
            }
        }

        let drained =
            tokio::time::timeout(self.config.close_timeout, self.conns.wait_drained()).await;

        if let Some(tick) = self.tick.lock().take() {
            tick.cancel();
        }

        match drained {
            Ok(()) => {
                self.handler.shutdown().await;
                tracing::info!(server = %self.config.name, "closed");
                Ok(())
            }
            Err(_) => Err(CloseError::Timeout(self.config.close_timeout)),
        }
    }
}
