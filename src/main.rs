use clap::Parser;
use log::{error, info};
use std::path::{Path, PathBuf};
use swagger_helper::config::{Config, LoggingConfig, ProxySettings, RewriteRuleConfig};
use swagger_helper::logging;
use swagger_helper::metrics::{MonitoringServer, ProxyMetrics};
use swagger_helper::proxy::{FrontDoor, ProxyServer};
use tokio::signal;

const BANNER: &str = r#"

	╔══╗─────────────╔╗╔╗
	║══╬╦╦╦═╗╔═╦═╦═╦╦╣╚╝╠═╦╗╔═╦═╦╦╗
	╠══║║║║╬╚╣╬║╬║╩╣╔╣╔╗║╩╣╚╣╬║╩╣╔╝
	╚══╩══╩══╬╗╠╗╠═╩╝╚╝╚╩═╩═╣╔╩═╩╝
	─────────╚═╩═╝──────────╚╝
"#;

#[derive(Parser)]
#[clap(
    name = "SwaggerHelper",
    version,
    about = "Serves a Swagger UI for an API document and proxies its calls to the backend"
)]
struct Args {
    #[clap(short = 'L', long, value_name = "ADDR", help = "Bind address (default: 127.0.0.1:1323)")]
    listen: Option<String>,

    #[clap(short = 'F', long, value_name = "FILE", help = "Swagger API document served at /swagger.json")]
    apifile: Option<PathBuf>,

    #[clap(short = 'S', long, value_name = "URL", help = "Backend origin; enables proxy mode (e.g., http://backend:3000)")]
    serverroot: Option<String>,

    #[clap(long, value_name = "NAME", help = "Label for the backend in log messages")]
    name: Option<String>,

    #[clap(long, value_name = "DIR", help = "Directory holding the Swagger UI bundle (default: ./swagger-ui)")]
    ui_dir: Option<PathBuf>,

    #[clap(long, value_name = "PATH", help = "Path prefix forwarded to the backend (default: /backend-api)")]
    prefix: Option<String>,

    #[clap(long, value_name = "PATTERN=TEMPLATE", help = "Extra path rewrite applied after the prefix strip, can be used multiple times")]
    rewrite: Vec<String>,

    #[clap(long, value_name = "SECONDS", help = "Backend connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, help = "Verify backend TLS certificates")]
    verify_certs: bool,

    #[clap(long, value_name = "ADDR", help = "Serve /metrics and /health on this address")]
    monitor_listen: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error, off")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Handle generate-config flag
    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        create_config_from_args(&args)?
    };

    // Command-line logging flags win over the file
    let mut logging_config = config.logging.take().unwrap_or_default();
    if let Some(level) = &args.log_level {
        logging_config.level = Some(level.clone());
    }
    if let Some(format) = &args.log_format {
        logging_config.format = logging::parse_log_format(format)?;
    }
    logging::init(&logging_config)?;
    config.logging = Some(logging_config);

    config.validate()?;

    let metrics = ProxyMetrics::new()?;
    let front_door = FrontDoor::from_config(&config, metrics.clone())?;

    match &config.proxy {
        Some(proxy) => info!(
            "Proxy mode: {}/* -> {}",
            proxy.prefix.trim_end_matches('/'),
            proxy.target
        ),
        None => info!("Proxy mode off, serving the API document unchanged"),
    }

    if let Some(monitor_addr) = config.monitor_addr {
        let monitor = MonitoringServer::new(monitor_addr, metrics);
        tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                error!("Monitoring server error: {}", e);
            }
        });
    }

    let server = ProxyServer::bind(config.listen_addr, front_door).await?;
    println!("{}", BANNER);

    let server_handle = tokio::spawn(server.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("SwaggerHelper stopped");
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut proxy = ProxySettings::new("http://backend.example.com:3000");
    proxy.name = Some("backend".to_string());
    proxy
        .rewrites
        .push(RewriteRuleConfig::new("/v1/*", "/api/v1/$1"));

    let config = Config {
        manifest_path: PathBuf::from("swagger.json"),
        proxy: Some(proxy),
        logging: Some(LoggingConfig::default()),
        ..Config::default()
    };
    config.to_file(file_path)
}

fn create_config_from_args(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let manifest_path = args
        .apifile
        .clone()
        .ok_or("Missing required argument: -F/--apifile <FILE>")?;

    let mut config = Config {
        manifest_path,
        ..Config::default()
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if let Some(ui_dir) = &args.ui_dir {
        config.ui_dir = ui_dir.clone();
    }
    if let Some(monitor) = &args.monitor_listen {
        config.monitor_addr = Some(monitor.parse()?);
    }

    // An empty server root leaves proxy mode off
    if let Some(target) = args.serverroot.as_deref().filter(|t| !t.is_empty()) {
        let mut proxy = ProxySettings::new(target);
        proxy.name = args.name.clone();
        if let Some(prefix) = &args.prefix {
            proxy.prefix = prefix.clone();
        }
        if let Some(timeout) = args.connect_timeout {
            proxy.connect_timeout_secs = timeout;
        }
        proxy.verify_certs = args.verify_certs;
        for rule in &args.rewrite {
            proxy.rewrites.push(RewriteRuleConfig::parse(rule)?);
        }
        config.proxy = Some(proxy);
    } else if !args.rewrite.is_empty() || args.prefix.is_some() {
        return Err("--rewrite and --prefix require -S/--serverroot".into());
    }

    Ok(config)
}
