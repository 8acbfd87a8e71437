use crate::common::{boxed, ProxyBody, TlsConfig};
use crate::dispatcher::ProxyTarget;
use crate::error::ProxyError;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::Duration;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards ordinary request/response exchanges. Bodies stream through in
/// both directions without being collected.
pub struct HttpForwarder {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration, verify_certs: bool) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));
        http.set_nodelay(true);

        let tls = TlsConfig::client_connector(verify_certs)?;
        let https = HttpsConnector::from((http, tls));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https);

        Ok(Self { client })
    }

    /// Sends `req` to `target`. Transport failures come back as
    /// [`ProxyError::Upstream`] carrying the target identity.
    pub async fn forward(
        &self,
        mut req: Request<ProxyBody>,
        target: &ProxyTarget,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = build_target_uri(target, req.uri())?;
        *req.uri_mut() = target_uri;

        let headers = req.headers_mut();
        remove_hop_by_hop_headers(headers);
        if let Some(ip) = client_ip {
            append_forwarded_for(headers, ip);
        }

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::upstream(target.to_string(), error_chain(&e)))?;

        let mut response = response.map(boxed);
        remove_hop_by_hop_headers(response.headers_mut());
        Ok(response)
    }
}

/// Joins the target's base path with the request path using exactly one
/// slash, and merges the two query strings.
pub fn build_target_uri(target: &ProxyTarget, uri: &Uri) -> Result<Uri, ProxyError> {
    let url = target.url();
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => other,
    };

    let path = join_paths(url.path(), uri.path());
    let query = match (url.query().filter(|q| !q.is_empty()), uri.query().filter(|q| !q.is_empty())) {
        (Some(base), Some(extra)) => format!("?{}&{}", base, extra),
        (Some(q), None) | (None, Some(q)) => format!("?{}", q),
        (None, None) => String::new(),
    };

    format!("{}://{}{}{}", scheme, target.host_header(), path, query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::Http(format!("Invalid target URI: {}", e)))
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Strips hop-by-hop headers, including any named in `Connection`.
fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

/// Flattens an error and its sources into one line for the log.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(url: &str) -> ProxyTarget {
        ProxyTarget::parse(url, None).unwrap()
    }

    #[test]
    fn test_target_uri_building() {
        let uri: Uri = "/v2/users?page=2".parse().unwrap();
        let built = build_target_uri(&target("http://backend.example.com"), &uri).unwrap();
        assert_eq!(built.to_string(), "http://backend.example.com/v2/users?page=2");

        let built = build_target_uri(&target("http://backend:3000/api?key=1"), &uri).unwrap();
        assert_eq!(built.to_string(), "http://backend:3000/api/v2/users?key=1&page=2");

        let built = build_target_uri(&target("wss://backend/base/"), &"/socket".parse().unwrap()).unwrap();
        assert_eq!(built.to_string(), "https://backend/base/socket");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/a"), "/a");
        assert_eq!(join_paths("/api", "/a"), "/api/a");
        assert_eq!(join_paths("/api/", "a"), "/api/a");
        assert_eq!(join_paths("/api", "a"), "/api/a");
    }

    #[test]
    fn test_hop_by_hop_removal() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-session-hint"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        remove_hop_by_hop_headers(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-session-hint").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert_eq!(headers["accept"], "text/event-stream");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, "10.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1");
        append_forwarded_for(&mut headers, "127.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1, 127.0.0.1");
    }
}
