mod backfill;
mod config;
mod extract;
mod patterns;
mod scan;
mod signals;
mod store;
mod upload;
mod watch;
mod workstation;

use clap::{Parser, Subcommand};
use config::{CliOverrides, Config, ConfigError};
use std::path::PathBuf;
use upload::UploadClient;

/// Watches AI coding assistant session logs, counts phrase patterns per day,
/// and pushes the totals to an aggregation server.
#[derive(Parser, Debug)]
#[command(name = "absolutelyright", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "absolutelyright.toml", global = true)]
    config: PathBuf,

    /// Debug logging (per-pass scan stats, upload details)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch session logs and keep the counters (and server) up to date
    Watch {
        /// Tracker to run (repeatable; default: every enabled tracker)
        #[arg(long = "tracker", value_name = "NAME")]
        trackers: Vec<String>,

        /// Server base URL to upload to
        #[arg(long, value_name = "URL")]
        upload: Option<String>,

        /// Shared secret sent with uploads
        #[arg(long)]
        secret: Option<String>,
    },
    /// Count every historical message from scratch
    Backfill {
        #[arg(long, value_name = "NAME", default_value = "absolutely-right")]
        tracker: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Server base URL to upload every counted day to
        #[arg(long, value_name = "URL")]
        upload: Option<String>,

        #[arg(long)]
        secret: Option<String>,
    },
    /// Print the resolved configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "absolutelyright=debug"
    } else {
        "absolutelyright=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = Config::load(&cli.config)?;
    config.apply_env(|key| std::env::var(key).ok());

    match cli.command {
        Command::Watch {
            trackers,
            upload,
            secret,
        } => {
            config.apply_cli_overrides(&CliOverrides { upload, secret });
            config.expand_paths();
            run_watch(&config, &trackers).await
        }
        Command::Backfill {
            tracker,
            json,
            upload,
            secret,
        } => {
            config.apply_cli_overrides(&CliOverrides { upload, secret });
            config.expand_paths();
            run_backfill(&config, &tracker, json).await
        }
        Command::Config => {
            config.expand_paths();
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

async fn run_watch(config: &Config, names: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let selected = config.select_trackers(names)?;
    if selected.is_empty() {
        return Err(ConfigError::Invalid("no trackers enabled".to_string()).into());
    }

    let workstation_id = workstation::resolve(
        |key| std::env::var(key).ok(),
        config.watch.workstation_id.as_deref(),
    );

    // Open every store before spawning so a locked directory fails fast.
    let mut trackers = Vec::with_capacity(selected.len());
    for tracker_config in selected {
        if tracker_config.patterns.is_empty() {
            tracing::warn!(tracker = %tracker_config.name, "tracker has no patterns, counting totals only");
        }
        let client = UploadClient::for_tracker(&tracker_config, &config.upload, &workstation_id)?;
        trackers.push(watch::Tracker::new(tracker_config, &config.watch, client)?);
    }

    println!(
        "Watching {} every {}s as '{}'",
        config.watch.projects_dir.display(),
        config.watch.poll_interval_secs,
        workstation_id
    );
    for tracker in &trackers {
        let uploads = match config.upload.endpoint {
            Some(ref url) if tracker.uploads_enabled() => format!("uploading to {url}"),
            _ => "local only".to_string(),
        };
        println!(
            "  {} -> {} ({uploads})",
            tracker.name(),
            tracker.store().dir().display()
        );
    }

    let shutdown = signals::Shutdown::install();
    let mut tasks = tokio::task::JoinSet::new();
    for tracker in trackers {
        tasks.spawn(tracker.run(shutdown.clone()));
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "tracker failed");
                failed += 1;
            }
            Err(e) => {
                tracing::error!(error = %e, "tracker task panicked");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("{failed} tracker(s) exited with errors").into());
    }
    Ok(())
}

async fn run_backfill(
    config: &Config,
    name: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = config
        .tracker(name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownTracker(name.to_string()))?;

    if !json {
        println!("Scanning {} for '{}'...", config.watch.projects_dir.display(), tracker.name);
    }
    let report = backfill::backfill(&tracker, &config.watch.projects_dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else if report.is_empty() {
        println!("No data found.");
    } else {
        print!("{}", report.render_table());
    }

    let workstation_id = workstation::resolve(
        |key| std::env::var(key).ok(),
        config.watch.workstation_id.as_deref(),
    );
    if let Some(mut client) = UploadClient::for_tracker(&tracker, &config.upload, &workstation_id)? {
        let summary = backfill::upload_report(&report, &mut client).await;
        if json {
            eprintln!("{summary}");
        } else {
            println!("{summary}");
        }
        if summary.unauthorized {
            return Err("server rejected the secret".into());
        }
    }

    Ok(())
}
