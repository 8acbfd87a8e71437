use crate::common::{full, ProxyBody, ResponseBuilder};
use crate::error::ProxyError;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Method, Response, StatusCode};
use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};

/// Template for 404 Not Found error page
const HTML_404_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
    <h1>404 Not Found</h1>
    <p>The requested resource was not found on this server.</p>
</body>
</html>"#;

const INDEX_FILE: &str = "index.html";

/// Serves the bundled UI from one directory.
#[derive(Clone)]
pub struct StaticFileHandler {
    root_path: PathBuf,
}

impl StaticFileHandler {
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let root_dir = root_dir.as_ref();
        let root_path = root_dir.canonicalize().map_err(|e| {
            ProxyError::Config(format!("Invalid UI directory '{}': {}", root_dir.display(), e))
        })?;
        Ok(Self { root_path })
    }

    pub async fn handle_request(&self, method: &Method, path: &str) -> Result<Response<ProxyBody>, ProxyError> {
        if method != Method::GET && method != Method::HEAD {
            return Ok(ResponseBuilder::method_not_allowed("GET, HEAD"));
        }
        let is_head = method == Method::HEAD;

        let file_path = match self.resolve_file_path(path).await {
            Some(file_path) => file_path,
            None => return Ok(not_found_response()),
        };

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(not_found_response()),
        };

        if metadata.is_dir() {
            let index_path = file_path.join(INDEX_FILE);
            return match tokio::fs::metadata(&index_path).await {
                Ok(index) if index.is_file() => self.handle_file(&index_path, index, is_head).await,
                _ => Ok(not_found_response()),
            };
        }

        self.handle_file(&file_path, metadata, is_head).await
    }

    /// Maps a request path onto the UI directory. Returns `None` for paths
    /// that do not exist or escape the root.
    pub async fn resolve_file_path(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        let relative = decoded.trim_start_matches('/');

        let requested = if relative.is_empty() {
            self.root_path.clone()
        } else {
            self.root_path.join(relative)
        };

        let resolved = tokio::fs::canonicalize(&requested).await.ok()?;
        if resolved.starts_with(&self.root_path) {
            Some(resolved)
        } else {
            log::warn!("Rejected path outside UI directory: {}", path);
            None
        }
    }

    async fn handle_file(
        &self,
        file_path: &Path,
        metadata: std::fs::Metadata,
        is_head: bool,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        if !metadata.is_file() {
            return Ok(not_found_response());
        }

        let mime_type = guess_mime_type(file_path);

        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, mime_type)
            .header(CONTENT_LENGTH, metadata.len().to_string())
            .header(CACHE_CONTROL, "public, max-age=3600");

        let builder = match metadata.modified() {
            Ok(modified) => builder.header(LAST_MODIFIED, httpdate::fmt_http_date(modified)),
            Err(_) => builder,
        };

        let body = if is_head {
            full(Vec::new())
        } else {
            let contents = tokio::fs::read(file_path)
                .await
                .map_err(|e| ProxyError::Http(format!("Cannot read file: {}", e)))?;
            full(contents)
        };

        builder.body(body).map_err(|e| ProxyError::Http(e.to_string()))
    }
}

/// Generates a 404 Not Found response
fn not_found_response() -> Response<ProxyBody> {
    let mut response = Response::new(full(HTML_404_TEMPLATE));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

fn guess_mime_type(file_path: &Path) -> String {
    let mime = mime_guess::from_path(file_path).first_or_octet_stream();

    // Add charset for text-based MIME types
    let mime_str = mime.as_ref();
    if mime_str.starts_with("text/") || mime_str == "application/json" || mime_str == "application/xml" {
        format!("{}; charset=utf-8", mime_str)
    } else {
        mime_str.to_string()
    }
}
