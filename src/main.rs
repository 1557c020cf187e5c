use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;

use gleaner::config::Config;
use gleaner::health::{self, Health};
use gleaner::poll::{self, Fetcher, ProxyPool};
use gleaner::storage::{Database, StorageError};

/// Get the config directory path (~/.config/gleaner/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("gleaner");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(name = "gleaner", about = "Feed aggregation engine: polls sources, dedups entries, tracks health")]
struct Args {
    /// Database file (defaults to ~/.config/gleaner/gleaner.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Config file (defaults to ~/.config/gleaner/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a feed source
    Add {
        feed_url: String,

        /// Display name (otherwise backfilled from the feed itself)
        #[arg(long)]
        name: Option<String>,

        /// Site URL the feed belongs to
        #[arg(long)]
        site_url: Option<String>,

        /// Poll interval in seconds (defaults to the configured default)
        #[arg(long)]
        interval_secs: Option<i64>,
    },
    /// Register a proxy candidate for Cloudflare-blocked fetches
    AddProxy { address: String },
    /// List sources with health and unread counts
    List,
    /// Poll due sources until interrupted
    Run {
        /// Run a single poll pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    let config_path = args
        .config
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    let db_path = args.db.unwrap_or_else(|| config_dir.join("gleaner.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StorageError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of gleaner appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    match args.command {
        Command::Add {
            feed_url,
            name,
            site_url,
            interval_secs,
        } => {
            let interval = interval_secs.unwrap_or(config.default_interval_secs);
            let id = db
                .add_source(&feed_url, name.as_deref(), site_url.as_deref(), interval)
                .await
                .context("Failed to register source")?;
            println!("Registered source {} ({})", id, feed_url);
        }

        Command::AddProxy { address } => {
            db.add_proxy(&address)
                .await
                .context("Failed to register proxy")?;
            println!("Registered proxy {}", address);
        }

        Command::List => {
            let now = chrono::Utc::now().timestamp();
            let sources = db.list_sources().await?;
            if sources.is_empty() {
                println!("No sources registered. Add one with: gleaner add <feed-url>");
                return Ok(());
            }
            for source in sources {
                let unread = db.source_unread_count(source.id).await?;
                let name = health::display_name(
                    source.name.as_deref(),
                    source.site_url.as_deref(),
                    &source.feed_url,
                );
                let state = match health::health(
                    source.live,
                    source.last_success,
                    source.last_change,
                    now,
                ) {
                    Health::Suspended => "suspended".to_string(),
                    Health::NeverSucceeded => "never polled".to_string(),
                    Health::Aging { days } => format!("{}d since change", days),
                };
                println!("{:>5}  {:>6} unread  [{}]  {}", source.id, unread, state, name);
            }
        }

        Command::Run { once } => {
            let fetcher = Fetcher::new(&config).context("Failed to build HTTP client")?;
            let proxy_addresses = db
                .list_proxies()
                .await?
                .into_iter()
                .map(|p| p.address)
                .collect();
            let proxies = ProxyPool::new(proxy_addresses);

            if once {
                let now = chrono::Utc::now().timestamp();
                let outcomes =
                    poll::poll_due_sources(&db, &fetcher, &proxies, &config, now, None).await?;
                let ok = outcomes.iter().filter(|o| o.result.is_ok()).count();
                let new_posts: usize = outcomes
                    .iter()
                    .filter_map(|o| o.result.as_ref().ok())
                    .map(|s| s.new_posts)
                    .sum();
                println!(
                    "Polled {} sources: {} ok, {} failed, {} new posts",
                    outcomes.len(),
                    ok,
                    outcomes.len() - ok,
                    new_posts
                );
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let _ = shutdown_tx.send(true);
                    }
                });
                poll::run(db, fetcher, proxies, config, shutdown_rx).await?;
                println!("Goodbye!");
            }
        }
    }

    Ok(())
}
