use crate::common::{BoxError, ProxyBody, ResponseBuilder};
use crate::config::{Config, MANIFEST_PATH};
use crate::dispatcher::Dispatcher;
use crate::error::ProxyError;
use crate::manifest::Manifest;
use crate::metrics::ProxyMetrics;
use crate::static_files::StaticFileHandler;
use bytes::Bytes;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Routes every request on the public listener: the manifest, the proxied
/// prefix, or the UI bundle.
pub struct FrontDoor {
    manifest: Manifest,
    static_files: Option<StaticFileHandler>,
    dispatcher: Option<Dispatcher>,
    prefix: String,
}

impl FrontDoor {
    pub fn new(
        manifest: Manifest,
        static_files: Option<StaticFileHandler>,
        dispatcher: Option<Dispatcher>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            manifest,
            static_files,
            dispatcher,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config, metrics: ProxyMetrics) -> Result<Self, ProxyError> {
        let (dispatcher, prefix, base_path) = match &config.proxy {
            Some(settings) => {
                let dispatcher = Dispatcher::new(settings, metrics)?;
                let prefix = settings.prefix.trim_end_matches('/').to_string();
                (Some(dispatcher), prefix.clone(), Some(prefix))
            }
            None => (None, String::new(), None),
        };

        let static_files = match StaticFileHandler::new(&config.ui_dir) {
            Ok(handler) => Some(handler),
            Err(e) => {
                warn!("UI bundle disabled: {}", e);
                None
            }
        };

        let manifest = Manifest::new(config.manifest_path.clone(), base_path);
        Ok(Self::new(manifest, static_files, dispatcher, prefix))
    }

    fn is_proxied(&self, path: &str) -> bool {
        self.dispatcher.is_some()
            && !self.prefix.is_empty()
            && path
                .strip_prefix(self.prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }

    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();

        if self.is_proxied(&path) {
            if let Some(dispatcher) = &self.dispatcher {
                return dispatcher.dispatch(req, remote_addr).await;
            }
        }

        if path == MANIFEST_PATH && req.method() == Method::GET {
            return match self.manifest.response().await {
                Ok(response) => response,
                Err(e) => {
                    error!("{}", e);
                    ResponseBuilder::from_error(&e)
                }
            };
        }

        let Some(static_files) = &self.static_files else {
            return ResponseBuilder::not_found();
        };
        match static_files.handle_request(req.method(), &path).await {
            Ok(response) => response,
            Err(e) => {
                error!("Static file error for {}: {}", path, e);
                ResponseBuilder::from_error(&e)
            }
        }
    }
}

pub struct ProxyServer {
    listener: TcpListener,
    front_door: Arc<FrontDoor>,
}

impl ProxyServer {
    /// Binds the public listener. A bind failure is fatal to startup.
    pub async fn bind(addr: SocketAddr, front_door: FrontDoor) -> Result<Self, ProxyError> {
        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(&addr).await?;
        Ok(Self {
            listener,
            front_door: Arc::new(front_door),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!("http server started on {}", self.local_addr()?);
        serve(self.listener, self.front_door).await
    }
}

/// Accept loop. Each connection gets its own task, and upgrades are enabled
/// so the tunnel can take the socket over after the 101 response.
pub async fn serve(listener: TcpListener, front_door: Arc<FrontDoor>) -> Result<(), ProxyError> {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Accept error: {}", e);
                continue;
            }
        };
        debug!("Accepted connection from {}", remote_addr);

        let front_door = front_door.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let front_door = front_door.clone();
                async move { Ok::<_, Infallible>(front_door.handle(req, remote_addr).await) }
            });

            if let Err(err) = ServerBuilder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("Connection from {} ended with error: {}", remote_addr, err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::empty;
    use crate::config::ProxySettings;
    use http_body_util::BodyExt;
    use hyper::StatusCode;
    use std::io::Write;

    fn remote() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 50000))
    }

    fn front_door(proxy: Option<ProxySettings>) -> (FrontDoor, tempfile::NamedTempFile, tempfile::TempDir) {
        let mut manifest = tempfile::NamedTempFile::new().unwrap();
        manifest
            .write_all(br#"{"swagger":"2.0","host":"api:8080","basePath":"/v1"}"#)
            .unwrap();
        let ui = tempfile::tempdir().unwrap();
        std::fs::write(ui.path().join("index.html"), "ui").unwrap();

        let config = Config {
            manifest_path: manifest.path().to_path_buf(),
            ui_dir: ui.path().to_path_buf(),
            proxy,
            ..Config::default()
        };
        let door = FrontDoor::from_config(&config, ProxyMetrics::new().unwrap()).unwrap();
        (door, manifest, ui)
    }

    fn get(uri: &str) -> Request<ProxyBody> {
        Request::builder().uri(uri).body(empty()).unwrap()
    }

    #[test]
    fn test_prefix_matching() {
        let (door, _m, _u) = front_door(Some(ProxySettings::new("http://127.0.0.1:9")));
        assert!(door.is_proxied("/backend-api"));
        assert!(door.is_proxied("/backend-api/users"));
        assert!(!door.is_proxied("/backend-apis"));
        assert!(!door.is_proxied("/swagger.json"));

        let (door, _m, _u) = front_door(None);
        assert!(!door.is_proxied("/backend-api/users"));
    }

    #[tokio::test]
    async fn test_manifest_patched_only_in_proxy_mode() {
        let (door, _m, _u) = front_door(None);
        let body = door.handle(get("/swagger.json"), remote()).await.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["host"], "api:8080");

        let (door, _m, _u) = front_door(Some(ProxySettings::new("http://127.0.0.1:9")));
        let response = door.handle(get("/swagger.json"), remote()).await;
        assert_eq!(response.headers()["content-type"], "application/json; charset=UTF-8");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["host"], "");
        assert_eq!(value["basePath"], "/backend-api");
    }

    #[tokio::test]
    async fn test_prefix_served_statically_without_proxy() {
        let (door, _m, _u) = front_door(None);
        let response = door.handle(get("/backend-api/users"), remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = door.handle(get("/"), remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_internal_error() {
        let ui = tempfile::tempdir().unwrap();
        let config = Config {
            manifest_path: "/nonexistent/swagger.json".into(),
            ui_dir: ui.path().to_path_buf(),
            ..Config::default()
        };
        let door = FrontDoor::from_config(&config, ProxyMetrics::new().unwrap()).unwrap();
        let response = door.handle(get("/swagger.json"), remote()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
