//! Stevedore: container image build & instance supervision.
//!
//! This is the application entry point. It initializes tracing, loads the
//! build/runtime descriptor from TOML, opens the image store, and dispatches
//! to the requested operation: build an image, run or supervise an instance,
//! issue a one-shot liveness probe, or inspect the store.

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stevedore::build::Builder;
use stevedore::config::{
    AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_EXPOSED_PORT, DEFAULT_HEALTH_PATH,
    DEFAULT_LOG_FILTER, DEFAULT_LOG_FORMAT, PROBE_TIMEOUT_SECS,
};
use stevedore::exec::ShellRunner;
use stevedore::image::{ImageManifest, ImageStore, StoreError};
use stevedore::probe::{HttpProber, ProbeOutcome, Prober, Supervisor, SupervisorVerdict};
use stevedore::runtime::Launcher;

/// Stevedore: build container images and supervise running instances
#[derive(Parser, Debug)]
#[command(name = "stevedore", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "stevedore=debug")
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Build an image from the configured context and print its digest
    Build,
    /// Launch an instance and wait for the service process to exit
    Run {
        /// Image digest or prefix (defaults to the newest image)
        #[arg(long)]
        image: Option<String>,
    },
    /// Launch an instance and probe it until a terminal verdict
    Supervise {
        /// Image digest or prefix (defaults to the newest image)
        #[arg(long)]
        image: Option<String>,
    },
    /// Issue one liveness check, exiting non-zero on failure
    Probe {
        /// Port to probe (default: 8080)
        #[arg(long)]
        port: Option<u16>,
        /// Path to probe (default: /health)
        #[arg(long)]
        path: Option<String>,
        /// Seconds before the attempt is declared failed (default: 10)
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
    /// List images in the store
    Images,
    /// Print an image manifest as JSON
    Inspect {
        /// Image digest or prefix (defaults to the newest image)
        image: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    // The one-shot probe runs inside the instance, where no config file is
    // expected; everything it needs arrives as flags or defaults
    if let CliCommand::Probe {
        port,
        path,
        timeout_seconds,
    } = &args.command
    {
        init_tracing(&log_filter, DEFAULT_LOG_FORMAT);

        let prober = HttpProber::new(
            port.unwrap_or(DEFAULT_EXPOSED_PORT),
            path.as_deref().unwrap_or(DEFAULT_HEALTH_PATH),
            Duration::from_secs(timeout_seconds.unwrap_or(PROBE_TIMEOUT_SECS)),
        )?;

        match prober.check().await {
            ProbeOutcome::Pass { status } => {
                tracing::info!(status, url = prober.url(), "Probe passed");
                return Ok(());
            }
            ProbeOutcome::Fail { reason } => {
                tracing::error!(reason = %reason, url = prober.url(), "Probe failed");
                std::process::exit(1);
            }
        }
    }

    // Load configuration
    let config = AppConfig::load(&args.config)?;
    init_tracing(&log_filter, &config.logging.format);
    tracing::info!(
        base = %config.image.base,
        store = %config.image.store,
        "Loaded configuration"
    );

    let store = ImageStore::open(&config.image.store)?;

    match args.command {
        CliCommand::Build => {
            let runner = ShellRunner;
            let manifest = Builder::new(&config, &store, &runner).build()?;
            println!("{}", manifest.digest);
        }

        CliCommand::Run { image } => {
            let manifest = resolve_image(&store, image.as_deref())?;
            let mut instance = Launcher::new(&store).launch(&manifest).await?;
            let status = instance.wait().await?;
            tracing::info!(%status, "Service process exited");
            if !status.success() {
                std::process::exit(status.code().unwrap_or(1));
            }
        }

        CliCommand::Supervise { image } => {
            let manifest = resolve_image(&store, image.as_deref())?;
            let prober = HttpProber::for_manifest(&manifest)?;
            tracing::info!(url = prober.url(), "Liveness probe configured");

            let mut instance = Launcher::new(&store).launch(&manifest).await?;
            let verdict = Supervisor::new(prober, &manifest.healthcheck)
                .run(&mut instance)
                .await;

            match verdict {
                SupervisorVerdict::Unhealthy => {
                    tracing::error!(instance_id = %instance.id, "Instance declared unhealthy");
                    std::process::exit(1);
                }
                SupervisorVerdict::ProcessExited(status) => {
                    if !status.map(|s| s.success()).unwrap_or(false) {
                        std::process::exit(status.and_then(|s| s.code()).unwrap_or(1));
                    }
                }
                SupervisorVerdict::ShutdownRequested => {}
            }
        }

        CliCommand::Images => {
            for manifest in store.list()? {
                println!(
                    "{}  {}  {}",
                    manifest.short_digest(),
                    manifest.created.format("%Y-%m-%d %H:%M:%S"),
                    manifest.base
                );
            }
        }

        CliCommand::Inspect { image } => {
            let manifest = resolve_image(&store, image.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }

        CliCommand::Probe { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Resolve an image by digest prefix, falling back to the newest image.
fn resolve_image(store: &ImageStore, digest: Option<&str>) -> Result<ImageManifest, StoreError> {
    match digest {
        Some(digest) => store.load(digest),
        None => store.latest(),
    }
}

/// Initialize the tracing subscriber with the configured filter and format.
fn init_tracing(filter: &str, format: &str) {
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter));

    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
