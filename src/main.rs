use std::path::Path;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stevedore::config::{Config, ConfigOverrides, build_state};
use stevedore::server::create_router;

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(about = "A Git LFS server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Config file path (default: ./stevedore.toml or
        /// /etc/stevedore/stevedore.toml)
        #[arg(long, short)]
        config: Option<String>,

        /// Host to bind to (default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (default: 8080)
        #[arg(long, short)]
        port: Option<u16>,

        /// Public base URL for external access (e.g., "https://lfs.example.com").
        /// Used for generating action URLs. If not set, URLs are derived from
        /// request headers.
        #[arg(long)]
        public_base_url: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("stevedore=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            public_base_url,
        } => {
            let overrides = ConfigOverrides {
                host,
                port,
                public_base_url,
            };
            let config_path = config.as_deref().map(Path::new);
            let config = Config::load_with_overrides(config_path, overrides)?;
            run_server(config)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn run_server(config: Config) -> anyhow::Result<()> {
    let addr = config.socket_addr()?;
    let state = build_state(&config).await?;
    let app = create_router(state);

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
