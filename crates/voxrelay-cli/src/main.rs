use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxrelay_core::config::{Config, LoggingConfig};
use voxrelay_gateway::{GatewayState, SessionServices};
use voxrelay_media::SpeechClient;
use voxrelay_media::http::HttpSpeechProvider;

#[derive(Parser)]
#[command(
    name = "voxrelay",
    about = "Real-time voice conversation relay: speech in, reply audio out",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Query a running relay's health endpoint
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

/// Build the tracing subscriber from the `logging` section. `RUST_LOG` wins
/// over everything; `--verbose` raises the default level to debug.
fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let mut directives = vec![level];
    directives.extend(logging.filters.iter().cloned());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives.join(",")));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(config: Config, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(bind) = bind {
        config.gateway.get_or_insert_with(Default::default).bind = Some(bind);
    }
    let port = port.unwrap_or_else(|| config.gateway_port());

    let speech_config = config.speech();
    let provider = Arc::new(HttpSpeechProvider::from_config(&speech_config));
    let speech = SpeechClient::from_config(provider, &speech_config)?;
    let reply = voxrelay_reply::build_generator(&config.reply())?;
    tracing::info!(
        speech = speech.provider_id(),
        reply = reply.id(),
        "Providers ready"
    );

    let services = SessionServices::new(Arc::new(speech), reply);
    let state = GatewayState::new(Arc::new(config), services);

    #[cfg(feature = "metrics")]
    let state = match voxrelay_gateway::metrics::install_prometheus_recorder() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            tracing::warn!(%e, "Prometheus recorder unavailable, /metrics disabled");
            state
        }
    };

    tracing::info!("Starting voxrelay on port {port}");
    voxrelay_gateway::start_gateway(Arc::new(state), port).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => serve(config, port, bind).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                println!("Config: {}", config_path.display());
                for w in &warnings {
                    println!("  warning: {w}");
                }
                for e in &errors {
                    println!("  error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s)", errors.len());
                }
                println!("Config OK ({} warning(s))", warnings.len());
            }
        },
        Commands::Status => {
            println!("voxrelay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            let port = config.gateway_port();
            println!("Gateway port: {port}");
            match reqwest::get(format!("http://127.0.0.1:{port}/health")).await {
                Ok(resp) => {
                    let body: serde_json::Value = resp.json().await?;
                    println!(
                        "Status: running (sessions: {}, uptime: {}s)",
                        body["sessions"], body["uptime_secs"]
                    );
                }
                Err(_) => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
