use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use therabook_backend::{connect_pool, Config};
use therabook_gateway::{PgSitemapSource, SitemapBuilder};
use therabook_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "therabook")]
#[command(about = "Therabook service command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web service (default).
    Serve,
    /// Render the sitemap to stdout.
    Sitemap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let pool = connect_pool(&config).await?;
            let state = AppState::from_backend(&config, pool)?;
            therabook_web::serve(&config, state).await?;
        }
        Commands::Sitemap => {
            let pool = connect_pool(&config).await?;
            let builder = SitemapBuilder::new(
                Arc::new(PgSitemapSource::new(pool)),
                config.site_base_url.clone(),
            );
            println!("{}", builder.build().await);
        }
    }

    Ok(())
}
