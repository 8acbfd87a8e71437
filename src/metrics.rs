use crate::common::{full, ProxyBody, ResponseBuilder};
use crate::dispatcher::Strategy;
use crate::error::ProxyError;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const NAMESPACE: &str = "swagger_helper";

/// Proxy counters, cheap to clone and shared by every request task.
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    forwarded: IntCounterVec,
    failures: IntCounterVec,
    tunnels_active: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, ProxyError> {
        let registry = Registry::new();

        let forwarded = IntCounterVec::new(
            Opts::new("requests_forwarded_total", "Requests handed to a forwarder").namespace(NAMESPACE),
            &["strategy"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("upstream_failures_total", "Requests that ended with an origin error").namespace(NAMESPACE),
            &["strategy"],
        )?;
        let tunnels_active = IntGauge::with_opts(
            Opts::new("tunnels_active", "Raw tunnels currently relaying bytes").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(forwarded.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(tunnels_active.clone()))?;

        Ok(Self {
            registry,
            forwarded,
            failures,
            tunnels_active,
        })
    }

    pub fn record_forward(&self, strategy: Strategy) {
        self.forwarded.with_label_values(&[strategy.as_str()]).inc();
    }

    pub fn record_failure(&self, strategy: Strategy) {
        self.failures.with_label_values(&[strategy.as_str()]).inc();
    }

    pub fn forwarded(&self, strategy: Strategy) -> u64 {
        self.forwarded.with_label_values(&[strategy.as_str()]).get()
    }

    pub fn failures(&self, strategy: Strategy) -> u64 {
        self.failures.with_label_values(&[strategy.as_str()]).get()
    }

    /// Marks a tunnel as live until the returned guard is dropped.
    pub fn tunnel_opened(&self) -> TunnelGuard {
        self.tunnels_active.inc();
        TunnelGuard {
            gauge: self.tunnels_active.clone(),
        }
    }

    pub fn tunnels_active(&self) -> i64 {
        self.tunnels_active.get()
    }

    pub fn encode(&self) -> Result<String, ProxyError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ProxyError::Http(e.to_string()))
    }
}

pub struct TunnelGuard {
    gauge: IntGauge,
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Optional side listener exposing `/metrics` and `/health`.
pub struct MonitoringServer {
    addr: SocketAddr,
    metrics: ProxyMetrics,
}

impl MonitoringServer {
    pub fn new(addr: SocketAddr, metrics: ProxyMetrics) -> Self {
        Self { addr, metrics }
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        log::info!("Monitoring server listening on http://{}", self.addr);

        let metrics = Arc::new(self.metrics);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Monitoring accept error: {}", e);
                    continue;
                }
            };
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(err) = ServerBuilder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let metrics = metrics.clone();
                            async move { Ok::<_, Infallible>(route(&metrics, req)) }
                        }),
                    )
                    .await
                {
                    log::error!("Monitoring connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

fn route(metrics: &ProxyMetrics, req: Request<Incoming>) -> Response<ProxyBody> {
    match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(payload) => {
                let mut response = Response::new(full(payload));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                response
            }
            Err(e) => {
                log::error!("Failed to encode Prometheus metrics: {}", e);
                ResponseBuilder::internal_server_error()
            }
        },
        "/health" => {
            let payload = json!({
                "status": "healthy",
                "timestamp": current_timestamp(),
                "tunnels_active": metrics.tunnels_active(),
            });
            let mut response = Response::new(full(payload.to_string()));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        _ => ResponseBuilder::not_found(),
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
