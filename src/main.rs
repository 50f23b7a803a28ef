mod app;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "gowa",
    version,
    about = "Self-hosted WhatsApp multi-device gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to a worker config file (TOML); environment
    /// variables override it.
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker: device registry, event pipeline, and device API on
    /// one port.
    Rest {
        #[arg(long, env = "GOWA_PORT", default_value_t = 3000)]
        port: u16,
    },
    /// Run the admin control plane over the supervisory daemon.
    Admin,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,gowa=debug".into());

    // Workers under the supervisor log to their captured stdout/stderr;
    // GOWA_LOG_DIR adds a rolling file for bare-metal runs.
    let _appender_guard = match std::env::var("GOWA_LOG_DIR").ok().filter(|d| !d.is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gowa.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    match cli.command {
        Commands::Rest { port } => app::run_worker(cli.config.as_deref(), port).await,
        Commands::Admin => app::run_admin().await,
    }
}
