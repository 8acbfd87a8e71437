pub mod common;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod http_forward;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod proxy;
pub mod rewrite;
pub mod static_files;
pub mod tunnel;

pub use config::{Config, ProxySettings};
pub use dispatcher::{Dispatcher, ProxyTarget, Strategy, TargetSelector};
pub use error::ProxyError;
pub use proxy::{FrontDoor, ProxyServer};
pub use rewrite::RewriteRules;
