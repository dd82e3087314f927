mod api;
mod config;
mod db;
mod restore;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Aggregation service for absolutelyright counters.
#[derive(Parser, Debug)]
#[command(name = "absolutelyright-server", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "absolutelyright-server.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Load a by-workstation JSON dump into the database
    Restore {
        /// Dump file, as returned by GET /api/by-workstation
        #[arg(default_value = "backups/database.json")]
        file: PathBuf,

        /// Merge into existing rows instead of clearing the table first
        #[arg(long)]
        keep_existing: bool,

        /// Restore into the prompt-words table
        #[arg(long)]
        prompt_words: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("absolutelyright_server=info")),
        )
        .init();

    let mut cfg = config::ServerConfig::load(&cli.config)?;
    cfg.apply_env(|key| std::env::var(key).ok());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(cfg).await,
        Command::Restore {
            file,
            keep_existing,
            prompt_words,
        } => {
            let table = if prompt_words {
                &db::PROMPT_WORD_COUNTS
            } else {
                &db::DAY_COUNTS
            };
            run_restore(&cfg.database_path(), table, &file, keep_existing)
        }
    }
}

fn run_restore(
    db_path: &Path,
    table: &db::CounterTable,
    file: &Path,
    keep_existing: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let dump = restore::load_dump(file)?;
    println!("Loading backup from {}", file.display());
    println!("Found {} workstations", dump.len());

    let mut conn = db::open_or_create(db_path)?;
    let summary = restore::restore(&mut conn, table, &dump, keep_existing)?;
    println!("{summary}");
    Ok(())
}

async fn serve(cfg: config::ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = cfg.database_path();
    // Create the schema up front so a bad path fails at startup.
    db::open_or_create(&db_path)?;
    tracing::info!(path = %db_path.display(), "database ready");
    if cfg.server.secret.is_none() {
        tracing::warn!("no ABSOLUTELYRIGHT_SECRET set, uploads are unauthenticated");
    }

    let state = api::AppState {
        db_path,
        secret: cfg.server.secret.clone(),
    };
    let app = api::router(state, Some(&cfg.server.static_dir));

    let addr = format!("{}:{}", cfg.server.bind, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("absolutelyright-server listening on {local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
