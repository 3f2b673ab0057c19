use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xpanel::AppContext;
use xpanel::jobs;
use xpanel::services::{Actor, SyncOutcome};
use xpanel::services::server_service::RegisterServer;
use xpanel::settings::Settings;
use xpanel::xray::{provision, stats};

#[derive(Parser)]
#[command(name = "xpanel")]
#[command(about = "Xray-core management panel", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the stored configuration, run Xray and the background jobs
    Serve,
    /// Xray binary tools
    Xray {
        #[command(subcommand)]
        subcommand: XrayCommands,
    },
    /// Stored configuration tools
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommands,
    },
    /// Anomaly detection tools
    Ai {
        #[command(subcommand)]
        subcommand: AiCommands,
    },
    /// Client share links
    Client {
        #[command(subcommand)]
        subcommand: ClientCommands,
    },
    /// Slave node management
    Server {
        #[command(subcommand)]
        subcommand: ServerCommands,
    },
    /// Host and panel summary
    Status,
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Print the import URI of a client
    Link { id: i64 },
    /// Print the base64 subscription body of a client
    Subscription {
        id: i64,
        /// Print links and usage as JSON instead
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Registered nodes
    List,
    /// Register a node and print its API secret
    Register {
        name: String,
        hostname: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        country: Option<String>,
    },
    /// Probe every node once
    Health,
    /// Push a node's inbounds to it
    Sync { id: i64 },
}

#[derive(Subcommand)]
enum XrayCommands {
    /// Print the installed Xray version
    Version,
    /// Validate a configuration file with the Xray binary
    Test {
        /// Defaults to the canonical config path
        path: Option<PathBuf>,
    },
    /// Install the latest Xray release at the configured binary path
    Download,
    /// Query the stats endpoint of a running Xray
    Stats,
    /// Zero a client's counters in the running Xray
    ResetStats { email: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Copy the deployed file into the backups directory
    Backup,
    /// Print the configuration the database currently describes
    Show,
    /// Rewrite the config file from the active stored configuration
    Sync,
    /// Re-activate a stored configuration by id
    Apply { id: i64 },
}

#[derive(Subcommand)]
enum AiCommands {
    /// Train a new model from recent traffic
    Train,
    /// Run one detection pass
    Detect,
    /// Anomaly counts for the last 7 days
    Stats,
    /// Latest recorded anomalies
    List,
    /// Mark an anomaly as handled
    Resolve {
        id: i64,
        #[arg(long, default_value = "cli")]
        by: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn context(settings: Settings) -> Result<AppContext> {
    let pool = xpanel_db::connect(&settings.database_url).await?;
    Ok(AppContext::new(pool, settings)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.settings.log_dir)
        .with_context(|| format!("Failed to create log dir {}", cli.settings.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&cli.settings.log_dir, "xpanel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "xpanel=debug,xpanel_db=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    match cli.command {
        Commands::Serve => serve(cli.settings).await?,
        Commands::Xray { subcommand } => {
            let ctx = context(cli.settings).await?;
            match subcommand {
                XrayCommands::Version => println!("{}", ctx.xray.version().await?),
                XrayCommands::Test { path } => {
                    let path = path.unwrap_or_else(|| ctx.settings.xray_config_path.clone());
                    println!("{}", ctx.xray.test_config(&path).await?);
                }
                XrayCommands::Download => {
                    let installed = provision::install_latest(&ctx.settings.xray_bin_path).await?;
                    println!("Installed Xray {} at {} (sha256 {})", installed.version, installed.path.display(), installed.sha256);
                }
                XrayCommands::Stats => print_json(&ctx.stats.get_all_stats().await?)?,
                XrayCommands::ResetStats { email } => print_json(&ctx.stats.reset_stats(&email).await?)?,
            }
        }
        Commands::Config { subcommand } => {
            let ctx = context(cli.settings).await?;
            match subcommand {
                ConfigCommands::Backup => println!("{}", ctx.store.backup().await?.display()),
                ConfigCommands::Show => print_json(&ctx.sync.render().await?)?,
                ConfigCommands::Sync => match ctx.store.sync_from_db().await? {
                    Some(record) => println!("Wrote configuration #{} to {}", record.id, ctx.store.config_path().display()),
                    None => println!("No active configuration stored"),
                },
                ConfigCommands::Apply { id } => {
                    let record = ctx.store.apply(id, ctx.xray.as_ref()).await?;
                    println!("Configuration #{} is active", record.id);
                }
            }
        }
        Commands::Ai { subcommand } => {
            let ctx = context(cli.settings).await?;
            match subcommand {
                AiCommands::Train => match ctx.detector.train_model().await? {
                    Some(model) => println!("Trained model {} ({})", model.id, model.version),
                    None => println!("Not enough traffic samples to train yet"),
                },
                AiCommands::Detect => {
                    ctx.detector.initialize().await?;
                    print_json(&ctx.detector.detect_anomalies().await)?;
                }
                AiCommands::Stats => print_json(&ctx.detector.get_anomaly_stats().await?)?,
                AiCommands::List => print_json(&ctx.detector.list_anomalies().await?)?,
                AiCommands::Resolve { id, by, notes } => {
                    let anomaly = ctx.detector.resolve_anomaly(id, &by, notes.as_deref()).await?;
                    println!("Anomaly #{} resolved by {}", anomaly.id, by);
                }
            }
        }
        Commands::Client { subcommand } => {
            let ctx = context(cli.settings).await?;
            let operator = Actor::admin(0);
            match subcommand {
                ClientCommands::Link { id } => println!("{}", ctx.clients.share_link(&operator, id).await?),
                ClientCommands::Subscription { id, json } => {
                    let subscription = ctx.clients.subscription(&operator, id).await?;
                    if json {
                        print_json(&subscription)?;
                    } else {
                        println!("{}", subscription.body);
                    }
                }
            }
        }
        Commands::Server { subcommand } => {
            let ctx = context(cli.settings).await?;
            match subcommand {
                ServerCommands::List => print_json(&ctx.servers.list_servers().await?)?,
                ServerCommands::Register { name, hostname, port, country } => {
                    let registered = ctx
                        .servers
                        .register_server(RegisterServer {
                            name,
                            hostname,
                            port,
                            server_type: None,
                            max_clients: None,
                            country,
                            city: None,
                            notes: None,
                        })
                        .await?;
                    println!("Server #{} registered, API secret: {}", registered.server.id, registered.api_secret);
                }
                ServerCommands::Health => print_json(&ctx.servers.health_check_all().await?)?,
                ServerCommands::Sync { id } => {
                    let version = ctx.servers.sync_config_to_server(id).await?;
                    println!("Server #{} synced at version {}", id, version);
                }
            }
        }
        Commands::Status => {
            let ctx = context(cli.settings).await?;
            let inbounds = ctx.sync.render().await?;
            let model = ctx.detector.model_info().await?;
            print_json(&serde_json::json!({
                "system": stats::system_stats(),
                "inbounds": inbounds["inbounds"].as_array().map(|a| a.len()).unwrap_or(0),
                "model": model,
            }))?;
        }
    }

    Ok(())
}

async fn serve(settings: Settings) -> Result<()> {
    info!("🚀 Starting xpanel");
    let ctx = context(settings).await?;

    if let Err(e) = ctx.detector.initialize().await {
        warn!("⚠️ Anomaly detector not ready: {}", e);
    }

    let deployed = match ctx.store.sync_from_db().await? {
        Some(_) => true,
        None => matches!(ctx.sync.resync().await, Ok(SyncOutcome::Deployed(_))),
    };
    if deployed {
        match ctx.xray.start().await {
            Ok(status) => info!("✅ Xray running (pid {:?})", status.pid),
            Err(e) => error!("💥 Failed to start Xray: {}", e),
        }
    } else {
        warn!("⚠️ Nothing to serve yet, Xray stays stopped until an inbound is created");
    }

    info!("📊 Polling Xray stats at {}", ctx.stats.endpoint());
    let handles = jobs::spawn_all(&ctx);

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("🛑 Shutting down");
    for handle in handles {
        handle.abort();
    }
    if let Err(e) = ctx.xray.stop().await {
        error!("Failed to stop Xray cleanly: {}", e);
    }
    Ok(())
}
