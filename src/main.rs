use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::ops::ControlFlow;
use std::path::PathBuf;

use feedline::app::{format_feed_line, format_item_lines, App, FeedListing, Update};
use feedline::config::Config;
use feedline::feed::Transport;
use feedline::storage::{AddFeedOutcome, Database, DatabaseError};

/// Get the config directory path (~/.config/feedline/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedline"))
}

/// Listing width; `COLUMNS` when the shell exports it.
fn output_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|c| c.parse().ok())
        .filter(|&w: &usize| w >= 20)
        .unwrap_or(80)
}

#[derive(Parser, Debug)]
#[command(name = "feedline", version, about = "Find, store and refresh RSS/Atom feeds")]
struct Args {
    /// Config file (default: ~/.config/feedline/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the feed behind a URL and subscribe to it
    Add {
        /// Feed URL or any page that links to one; the scheme may be omitted
        url: String,
    },
    /// Fetch new items for one feed or all feeds
    Refresh {
        #[arg(required_unless_present = "all")]
        feed_id: Option<i64>,
        #[arg(long, conflicts_with = "feed_id")]
        all: bool,
    },
    /// List subscribed feeds
    Feeds {
        #[arg(long)]
        json: bool,
    },
    /// List stored items of a feed, newest first
    Items {
        feed_id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Unsubscribe and delete stored items
    Remove { feed_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access to the directory holding the database
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.database_path(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedline appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    let transport = Transport::new(&config.user_agent, config.request_timeout())
        .context("Failed to build HTTP client")?;
    let mut app = App::new(
        db,
        transport,
        config.host_policy(),
        config.refresh_settings(),
    );

    match args.command {
        Command::Add { url } => add(&mut app, &url).await,
        Command::Refresh { feed_id, all } => refresh(&mut app, feed_id, all).await,
        Command::Feeds { json } => list_feeds(&app, json).await,
        Command::Items { feed_id, json } => list_items(&app, feed_id, json).await,
        Command::Remove { feed_id } => {
            if app.db.delete_feed(feed_id).await? {
                println!("Removed feed {}", feed_id);
                Ok(())
            } else {
                anyhow::bail!("No feed with id {}", feed_id)
            }
        }
    }
}

async fn add(app: &mut App, url: &str) -> Result<()> {
    if app.add_feed(url).is_none() {
        anyhow::bail!("URL is empty");
    }

    let mut failure = None;
    app.run_until(|update| {
        match update {
            Update::Status(message) => println!("{}", message),
            Update::FeedAdded { outcome, feed } => match outcome {
                AddFeedOutcome::Added(id) => println!("Added feed {}: {}", id, feed.title),
                AddFeedOutcome::Existing(id) => {
                    println!("Already subscribed as feed {}: {}", id, feed.title)
                }
            },
            Update::AddFailed(message) => failure = Some(message.clone()),
            _ => {}
        }
        if update.ends_add() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .await;

    match failure {
        Some(message) => anyhow::bail!(message),
        None => Ok(()),
    }
}

async fn refresh(app: &mut App, feed_id: Option<i64>, all: bool) -> Result<()> {
    if all {
        let ids = app
            .refresh_all()
            .await
            .context("Failed to list feeds")?;
        if ids.is_empty() {
            println!("No feeds to refresh");
            return Ok(());
        }
    } else if let Some(feed_id) = feed_id {
        app.refresh(feed_id);
    }

    let mut failed = 0usize;
    app.drain_refreshes(|update| match update {
        Update::ItemsStored { feed_id, count } => {
            tracing::debug!(feed_id, count, "Batch stored");
        }
        Update::RefreshComplete { feed_id, summary } => {
            let note = if summary.capped { " (limit reached)" } else { "" };
            println!("Feed {}: {} items{}", feed_id, summary.items, note);
        }
        Update::RefreshFailed { feed_id, error } => {
            failed += 1;
            eprintln!("Feed {}: {}", feed_id, error);
        }
        _ => {}
    })
    .await;

    if failed > 0 {
        anyhow::bail!("{} feed(s) failed to refresh", failed);
    }
    Ok(())
}

async fn list_feeds(app: &App, json: bool) -> Result<()> {
    let feeds = app.feeds().await.context("Failed to load feeds")?;
    let mut counts = Vec::with_capacity(feeds.len());
    for feed in &feeds {
        counts.push(app.db.count_items(feed.id).await?);
    }

    if json {
        let listing: Vec<FeedListing<'_>> = feeds
            .iter()
            .zip(&counts)
            .map(|(feed, &items)| FeedListing { feed, items })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if feeds.is_empty() {
        println!("No feeds yet. Add one with: feedline add <url>");
    }
    let width = output_width();
    for (feed, items) in feeds.iter().zip(counts) {
        println!("{}", format_feed_line(feed, items, width));
    }
    Ok(())
}

async fn list_items(app: &App, feed_id: i64, json: bool) -> Result<()> {
    if app.db.get_feed(feed_id).await?.is_none() {
        anyhow::bail!("No feed with id {}", feed_id);
    }
    let items = app.items(feed_id).await.context("Failed to load items")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    let width = output_width();
    for item in &items {
        println!("{}", format_item_lines(item, width));
    }
    Ok(())
}
