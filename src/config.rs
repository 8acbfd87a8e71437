use crate::error::ProxyError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:1323";
pub const DEFAULT_PROXY_PREFIX: &str = "/backend-api";
pub const DEFAULT_UI_DIR: &str = "./swagger-ui";
pub const MANIFEST_PATH: &str = "/swagger.json";

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 1323))
}

fn default_prefix() -> String {
    DEFAULT_PROXY_PREFIX.to_string()
}

fn default_ui_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UI_DIR)
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_header_size() -> usize {
    16 * 1024 // 16KB limit on the origin's upgrade response head
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some("info".to_string()),
            format: LogFormat::Text,
        }
    }
}

/// One `(pattern, template)` rewrite rule as written by the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewriteRuleConfig {
    pub pattern: String,
    pub replacement: String,
}

impl RewriteRuleConfig {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    /// Parses the CLI form `PATTERN=TEMPLATE`.
    pub fn parse(rule: &str) -> Result<Self, ProxyError> {
        let (pattern, replacement) = rule.split_once('=').ok_or_else(|| {
            ProxyError::Config(format!(
                "Invalid rewrite specification: '{}'. Use format 'PATTERN=TEMPLATE'",
                rule
            ))
        })?;
        Ok(Self::new(pattern.trim(), replacement.trim()))
    }
}

/// Backend settings that turn proxy mode on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Absolute URL of the backend origin.
    pub target: String,
    /// Optional label used in diagnostics.
    #[serde(default)]
    pub name: Option<String>,
    /// Public path prefix routed to the backend.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Rules applied to the path left after the prefix strip, in this order.
    #[serde(default)]
    pub rewrites: Vec<RewriteRuleConfig>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Verify backend TLS certificates.
    #[serde(default)]
    pub verify_certs: bool,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl ProxySettings {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            name: None,
            prefix: default_prefix(),
            rewrites: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
            verify_certs: false,
            max_header_size: default_max_header_size(),
        }
    }

    /// The built-in rule that removes the public prefix. It runs before,
    /// and separately from, the user rules.
    pub fn prefix_rule(&self) -> RewriteRuleConfig {
        let prefix = self.prefix.trim_end_matches('/');
        RewriteRuleConfig::new(format!("^{}/*", prefix), "/$1")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Manifest document served at `/swagger.json`.
    pub manifest_path: PathBuf,
    #[serde(default = "default_ui_dir")]
    pub ui_dir: PathBuf,
    #[serde(default)]
    pub proxy: Option<ProxySettings>,
    #[serde(default)]
    pub monitor_addr: Option<SocketAddr>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            manifest_path: PathBuf::from("swagger.json"),
            ui_dir: default_ui_dir(),
            proxy: None,
            monitor_addr: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy.is_some()
    }

    /// Checks everything that can be checked before binding.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.manifest_path.as_os_str().is_empty() {
            return Err(ProxyError::Config("Manifest file path is required".to_string()));
        }

        if let Some(proxy) = &self.proxy {
            let url = url::Url::parse(&proxy.target)?;
            match url.scheme() {
                "http" | "https" | "ws" | "wss" => {}
                other => {
                    return Err(ProxyError::Config(format!(
                        "Unsupported backend scheme '{}' in {}",
                        other, proxy.target
                    )));
                }
            }
            if url.host_str().is_none() {
                return Err(ProxyError::Config(format!(
                    "Backend URL has no host: {}",
                    proxy.target
                )));
            }
            if !proxy.prefix.starts_with('/') || proxy.prefix.trim_end_matches('/').is_empty() {
                return Err(ProxyError::Config(format!(
                    "Proxy prefix must start with '/' and not be the root: '{}'",
                    proxy.prefix
                )));
            }
            if proxy.connect_timeout_secs == 0 {
                return Err(ProxyError::Config("Connect timeout must be at least 1 second".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_addr() {
        let config = Config::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert!(!config.proxy_enabled());
    }

    #[test]
    fn test_prefix_rule() {
        let mut proxy = ProxySettings::new("http://backend:3000");
        assert_eq!(proxy.prefix_rule(), RewriteRuleConfig::new("^/backend-api/*", "/$1"));

        proxy.prefix = "/api/".to_string();
        assert_eq!(proxy.prefix_rule().pattern, "^/api/*");
    }

    #[test]
    fn test_rewrite_spec_parsing() {
        let rule = RewriteRuleConfig::parse("/old=/new").unwrap();
        assert_eq!(rule, RewriteRuleConfig::new("/old", "/new"));
        assert!(RewriteRuleConfig::parse("/old").is_err());
    }

    #[test]
    fn test_validate_backend_url() {
        let mut config = Config::default();
        config.proxy = Some(ProxySettings::new("http://127.0.0.1:8080"));
        assert!(config.validate().is_ok());

        config.proxy = Some(ProxySettings::new("not a url"));
        assert!(config.validate().is_err());

        config.proxy = Some(ProxySettings::new("ftp://files.example.com"));
        assert!(config.validate().is_err());

        let mut proxy = ProxySettings::new("http://127.0.0.1:8080");
        proxy.prefix = "/".to_string();
        config.proxy = Some(proxy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_round_trip_defaults() {
        let json = r#"{
            "manifest_path": "api.json",
            "proxy": { "target": "http://backend:3000" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, default_listen_addr());
        let proxy = config.proxy.unwrap();
        assert_eq!(proxy.prefix, "/backend-api");
        assert_eq!(proxy.connect_timeout_secs, 10);
        assert!(!proxy.verify_certs);
    }
}
