//! Request classification and target selection for proxied paths.

use crate::common::{boxed, BoxError, ProxyBody, ResponseBuilder};
use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::http_forward::HttpForwarder;
use crate::metrics::ProxyMetrics;
use crate::rewrite::RewriteRules;
use crate::tunnel::TunnelForwarder;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, HOST, ORIGIN, REFERER, UPGRADE};
use hyper::{Request, Response, Uri};
use log::{debug, error, warn};
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A backend origin. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    url: Url,
    name: Option<String>,
}

impl ProxyTarget {
    pub fn new(url: Url, name: Option<String>) -> Result<Self, ProxyError> {
        if url.host_str().is_none() {
            return Err(ProxyError::Config(format!("Backend URL has no host: {}", url)));
        }
        if url.port_or_known_default().is_none() {
            return Err(ProxyError::Config(format!("Backend URL has no usable port: {}", url)));
        }
        Ok(Self { url, name })
    }

    pub fn parse(url: &str, name: Option<String>) -> Result<Self, ProxyError> {
        Self::new(Url::parse(url)?, name)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// `host[:port]` as it should appear in an outbound `Host` header.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Host and port for opening a transport connection.
    pub fn connect_addr(&self) -> (String, u16) {
        let host = match self.url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => String::new(),
        };
        (host, self.url.port_or_known_default().unwrap_or(80))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.url.scheme(), "https" | "wss")
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) if !name.is_empty() => write!(f, "{}({})", name, self.url),
            _ => write!(f, "{}", self.url),
        }
    }
}

/// Picks the origin for a request. Implementations must be cheap and
/// side-effect free apart from their own bookkeeping.
pub trait TargetSelector: Send + Sync {
    fn select(&self, uri: &Uri, headers: &HeaderMap) -> Arc<ProxyTarget>;
}

/// The degenerate policy: every request goes to the one configured origin.
pub struct SingleTarget {
    target: Arc<ProxyTarget>,
}

impl SingleTarget {
    pub fn new(target: ProxyTarget) -> Self {
        Self {
            target: Arc::new(target),
        }
    }
}

impl TargetSelector for SingleTarget {
    fn select(&self, _uri: &Uri, _headers: &HeaderMap) -> Arc<ProxyTarget> {
        self.target.clone()
    }
}

/// Transport used for a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Ordinary request/response exchange.
    Http,
    /// Raw bidirectional byte relay after an upgrade handshake.
    Tunnel,
}

impl Strategy {
    /// A request is a stream upgrade when `Connection` lists the `upgrade`
    /// token and an `Upgrade` protocol is named. `Accept` plays no part, so
    /// `text/event-stream` requests are ordinary.
    pub fn classify(headers: &HeaderMap) -> Self {
        let connection_upgrade = headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

        let upgrade_protocol = headers
            .get(UPGRADE)
            .and_then(|value| value.to_str().ok())
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);

        if connection_upgrade && upgrade_protocol {
            Strategy::Tunnel
        } else {
            Strategy::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Http => "http",
            Strategy::Tunnel => "tunnel",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub target: Arc<ProxyTarget>,
    pub strategy: Strategy,
}

pub struct Dispatcher {
    prefix_strip: RewriteRules,
    rules: RewriteRules,
    selector: Box<dyn TargetSelector>,
    http: HttpForwarder,
    tunnel: TunnelForwarder,
    metrics: ProxyMetrics,
}

impl Dispatcher {
    pub fn new(settings: &ProxySettings, metrics: ProxyMetrics) -> Result<Self, ProxyError> {
        let target = ProxyTarget::parse(&settings.target, settings.name.clone())?;
        let prefix_rule = settings.prefix_rule();
        let prefix_strip = RewriteRules::compile([(prefix_rule.pattern, prefix_rule.replacement)])?;
        let rules = RewriteRules::compile(
            settings
                .rewrites
                .iter()
                .map(|rule| (rule.pattern.clone(), rule.replacement.clone())),
        )?;
        let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);

        Ok(Self {
            prefix_strip,
            rules,
            selector: Box::new(SingleTarget::new(target)),
            http: HttpForwarder::new(connect_timeout, settings.verify_certs)?,
            tunnel: TunnelForwarder::new(
                connect_timeout,
                settings.max_header_size,
                settings.verify_certs,
                metrics.clone(),
            )?,
            metrics,
        })
    }

    /// Swaps the target selection policy.
    pub fn with_selector(mut self, selector: Box<dyn TargetSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Rewrites the request path in place, normalizes identity headers for
    /// the chosen target and decides which forwarder owns the request.
    pub fn route<B>(&self, req: &mut Request<B>) -> Route {
        let target = self.selector.select(req.uri(), req.headers());

        let rewritten = self.rewrite_path(req.uri().path());
        if let Some(path) = rewritten {
            let path = if path.is_empty() { "/" } else { path.as_str() };
            let path_and_query = match req.uri().query() {
                Some(query) => format!("{}?{}", path, query),
                None => path.to_string(),
            };
            match path_and_query.parse::<Uri>() {
                Ok(uri) => *req.uri_mut() = uri,
                Err(e) => warn!("Rewritten path '{}' is not a valid URI: {}", path_and_query, e),
            }
        }

        let headers = req.headers_mut();
        match HeaderValue::from_str(&target.host_header()) {
            Ok(host) => {
                headers.insert(HOST, host);
            }
            Err(e) => warn!("Cannot use '{}' as Host header: {}", target.host_header(), e),
        }
        headers.remove(ORIGIN);
        headers.remove(REFERER);

        Route {
            strategy: Strategy::classify(req.headers()),
            target,
        }
    }

    /// Strips the public prefix, then applies the first matching user rule to
    /// what is left. Returns `None` when neither stage changed the path.
    pub fn rewrite_path(&self, path: &str) -> Option<String> {
        let stripped = self.prefix_strip.apply(path);
        match self.rules.apply(&stripped) {
            Cow::Owned(path) => Some(path),
            Cow::Borrowed(path) if matches!(stripped, Cow::Owned(_)) => Some(path.to_string()),
            Cow::Borrowed(_) => None,
        }
    }

    /// Routes one request to exactly one forwarder and turns any failure into
    /// a client-visible status.
    pub async fn dispatch<B>(&self, mut req: Request<B>, client_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let route = self.route(&mut req);
        debug!(
            "{} {} -> {} via {}",
            req.method(),
            req.uri(),
            route.target,
            route.strategy.as_str()
        );
        self.metrics.record_forward(route.strategy);

        let result = match route.strategy {
            Strategy::Tunnel => self.tunnel.forward(req, route.target.clone()).await,
            Strategy::Http => {
                self.http
                    .forward(req.map(boxed), &route.target, Some(client_addr.ip()))
                    .await
            }
        };

        match result {
            Ok(response) => response,
            Err(err) => {
                self.metrics.record_failure(route.strategy);
                error!("{}", err);
                ResponseBuilder::from_error(&err)
            }
        }
    }
}
