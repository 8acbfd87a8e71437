use crate::common::{full, ProxyBody};
use crate::error::ProxyError;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;
use log::warn;
use serde_json::Value;
use std::path::PathBuf;

/// The API description served to the UI. Read from disk on every request so
/// edits show up without a restart.
pub struct Manifest {
    path: PathBuf,
    /// Set in proxy mode: the base path the UI should call through.
    proxy_base_path: Option<String>,
}

impl Manifest {
    pub fn new(path: PathBuf, proxy_base_path: Option<String>) -> Self {
        Self {
            path,
            proxy_base_path,
        }
    }

    pub async fn load(&self) -> Result<Vec<u8>, ProxyError> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            ProxyError::Manifest(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        match &self.proxy_base_path {
            Some(base_path) => Ok(patch_document(&data, base_path).unwrap_or_else(|e| {
                warn!("Serving {} unpatched: {}", self.path.display(), e);
                data
            })),
            None => Ok(data),
        }
    }

    pub async fn response(&self) -> Result<Response<ProxyBody>, ProxyError> {
        let data = self.load().await?;
        let mut response = Response::new(full(data));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        );
        Ok(response)
    }
}

/// Points the document at the proxy: `host` becomes empty so the UI uses its
/// own origin, and `basePath` becomes the proxy prefix.
pub fn patch_document(data: &[u8], base_path: &str) -> Result<Vec<u8>, ProxyError> {
    let mut document: Value = serde_json::from_slice(data)
        .map_err(|e| ProxyError::Manifest(format!("invalid JSON: {}", e)))?;

    let object = document
        .as_object_mut()
        .ok_or_else(|| ProxyError::Manifest("document is not a JSON object".to_string()))?;
    object.insert("host".to_string(), Value::String(String::new()));
    object.insert("basePath".to_string(), Value::String(base_path.to_string()));

    serde_json::to_vec(&document).map_err(|e| ProxyError::Manifest(e.to_string()))
}
