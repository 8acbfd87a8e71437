use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::json;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every request and response crossing the front door.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Boxes any body whose error converts into [`BoxError`].
pub fn boxed<B>(body: B) -> ProxyBody
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// JSON error body in the shape `{"message": "..."}`.
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let payload = json!({ "message": message }).to_string();
        let mut response = Response::new(full(payload));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        response
    }

    /// Client-facing response for a terminal request error. Only the status
    /// reason is exposed; transport details stay in the log.
    pub fn from_error(err: &ProxyError) -> Response<ProxyBody> {
        let status = err.status_code();
        Self::error(status, status.canonical_reason().unwrap_or("Error"))
    }

    pub fn not_found() -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn method_not_allowed(allow: &'static str) -> Response<ProxyBody> {
        let mut response = Self::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(hyper::header::ALLOW, HeaderValue::from_static(allow));
        response
    }

    pub fn internal_server_error() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }
}

/// TLS settings for connections to the backend origin.
pub struct TlsConfig;

impl TlsConfig {
    /// Builds the client-side connector used by both forwarders. With
    /// `verify_certs` off, self-signed and mismatched certificates are accepted.
    pub fn client_connector(verify_certs: bool) -> Result<tokio_native_tls::TlsConnector, ProxyError> {
        let connector = tokio_native_tls::native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(!verify_certs)
            .danger_accept_invalid_hostnames(!verify_certs)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS connector: {}", e)))?;
        Ok(tokio_native_tls::TlsConnector::from(connector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_error_hides_transport_detail() {
        let err = ProxyError::upstream("http://backend:3000/", "tcp connect error: Connection refused");
        let response = ResponseBuilder::from_error(&err);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(body, r#"{"message":"Service Unavailable"}"#);
        assert!(!body.contains("refused"));
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let response = ResponseBuilder::method_not_allowed("GET, HEAD");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()["allow"], "GET, HEAD");
    }
}
