//! Tapwire CLI - A TLS-intercepting CONNECT proxy

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tapwire::store::FileStore;
use tapwire::{CertificateAuthority, Config, ProxyServer};

#[derive(Parser)]
#[command(name = "tapwire")]
#[command(about = "A TLS-intercepting CONNECT proxy that captures selected HTTPS exchanges")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Proxy bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Certificate download bind address (overrides config)
        #[arg(long)]
        cert_bind: Option<String>,

        /// Directory holding the root key and certificate (overrides config)
        #[arg(long)]
        store_dir: Option<PathBuf>,

        /// Log level (error, warn, info, debug, trace; overrides config)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Write the root certificate to a file or stdout
    ExportCa {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the root key and certificate (overrides config)
        #[arg(long)]
        store_dir: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Write DER instead of PEM
        #[arg(long)]
        der: bool,
    },

    /// Replace the root certificate with a new one
    RegenerateCa {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the root key and certificate (overrides config)
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> tapwire::Result<Config> {
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            Config::from_file(path)
        }
        None => {
            tracing::info!("Using default configuration");
            Config::parse("")
        }
    }
}

fn open_ca(cfg: &Config) -> tapwire::Result<CertificateAuthority> {
    let store = match &cfg.store.dir {
        Some(dir) => FileStore::open(dir)?,
        None => FileStore::open_default()?,
    };
    CertificateAuthority::ensure(Arc::new(store))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            cert_bind,
            store_dir,
            log_level,
        } => {
            // Peek at the config for the log level before logging is up.
            let mut cfg = match &config {
                Some(path) => Config::from_file(path)?,
                None => Config::parse("")?,
            };
            init_logging(log_level.as_deref().unwrap_or(&cfg.logging.level));
            if let Some(path) = &config {
                tracing::info!(path = %path.display(), "Loaded configuration");
            }

            // Apply CLI overrides
            if let Some(addr) = bind {
                cfg.proxy.bind_address = addr;
            }
            if let Some(addr) = cert_bind {
                cfg.proxy.certificate_address = addr;
            }
            if let Some(dir) = store_dir {
                cfg.store.dir = Some(dir);
            }
            cfg.validate()?;

            let server = ProxyServer::new(cfg)?;
            let root = server.ca().root();
            tracing::info!(fingerprint = %root.fingerprint(), "Root certificate ready");
            tracing::info!("Starting proxy server...");

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::ExportCa {
            config,
            store_dir,
            out,
            der,
        } => {
            init_logging("warn");
            let mut cfg = load_config(config.as_ref())?;
            if let Some(dir) = store_dir {
                cfg.store.dir = Some(dir);
            }

            let ca = open_ca(&cfg)?;
            let root = ca.root();
            let bytes = if der {
                root.cert_der().to_vec()
            } else {
                root.cert_pem().into_bytes()
            };

            match out {
                Some(path) => {
                    std::fs::write(&path, &bytes)?;
                    println!("Root certificate written to {}", path.display());
                    println!("  SHA-256 fingerprint: {}", root.fingerprint());
                    println!();
                    println!("To trust the CA on Ubuntu/Debian:");
                    println!(
                        "  sudo cp {} /usr/local/share/ca-certificates/tapwire.crt",
                        path.display()
                    );
                    println!("  sudo update-ca-certificates");
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
        }

        Commands::RegenerateCa { config, store_dir } => {
            init_logging("info");
            let mut cfg = load_config(config.as_ref())?;
            if let Some(dir) = store_dir {
                cfg.store.dir = Some(dir);
            }

            let ca = open_ca(&cfg)?;
            let old = ca.root();
            let new = ca.regenerate_root()?;

            println!("Root certificate regenerated.");
            println!();
            println!("  Previous fingerprint: {}", old.fingerprint());
            println!("  New fingerprint:      {}", new.fingerprint());
            println!();
            println!("Clients must trust the new certificate; run `tapwire export-ca` to get it.");
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Bind address: {}", cfg.proxy.bind_address);
            println!("  Certificate address: {}", cfg.proxy.certificate_address);
            println!("  Intercept: {:?}", cfg.proxy.intercept);
            println!("  Connect timeout: {}s", cfg.proxy.connect_timeout_secs);
            println!("  Max body bytes: {}", cfg.proxy.max_body_bytes);
            println!(
                "  Store: {}",
                cfg.store
                    .dir
                    .as_ref()
                    .map(|d| d.display().to_string())
                    .unwrap_or_else(|| "(platform default)".to_string())
            );
            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Capture log: {}",
                cfg.logging
                    .capture_log
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "disabled".to_string())
            );
            println!("  Targets: {}", cfg.targets.len());

            if !cfg.targets.is_empty() {
                println!();
                println!("Targets:");
                for (i, target) in cfg.targets.iter().enumerate() {
                    println!(
                        "  {}. {} capture={} notify={}",
                        i + 1,
                        target.host,
                        target.capture,
                        target.notify
                    );
                    for path in &target.paths {
                        let shown = if path.path.is_empty() { "*" } else { path.path.as_str() };
                        println!(
                            "       {} capture={} notify={}",
                            shown, path.capture, path.notify
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
