//! changewatch CLI
//!
//! Runs the alert dispatch engine against newline-delimited change events
//! read from stdin or a file, with rules loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use changewatch::feed::{ndjson_events, pump};
use changewatch::service::notifier_from_config;
use changewatch::{
    AlertDeps, AlertRule, AlertService, ConfigError, FeedHub, InMemoryLeaseStore, InMemoryRuleStore,
    WatchConfig, WatchError, WatchResult,
};

/// Dispatch change-feed alerts to a notification endpoint.
#[derive(Debug, Parser)]
#[command(name = "changewatch", version)]
struct Cli {
    /// JSON file holding an array of alert rules.
    #[arg(long, env = "CHANGEWATCH_RULES")]
    rules: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long, env = "CHANGEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Notification service base URL. Overrides the config file.
    #[arg(long, env = "CHANGEWATCH_NOTIFY_URL")]
    notify_url: Option<String>,

    /// Read change events from this file instead of stdin.
    #[arg(long)]
    events: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("error: failed to install logger: {err}");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        tracing::error!(error = %err, "changewatch failed");
        std::process::exit(exit_code(&err));
    }
}

/// 2 for bad configuration, 75 (`EX_TEMPFAIL`) when a rerun may succeed.
fn exit_code(err: &WatchError) -> i32 {
    if err.is_config() {
        2
    } else if err.is_retryable() {
        75
    } else {
        1
    }
}

fn load_rules(path: &Path) -> WatchResult<Vec<AlertRule>> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|e| {
        WatchError::from(ConfigError::InvalidValue {
            key: "rules".to_string(),
            message: e.to_string(),
        })
    })
}

async fn run(cli: Cli) -> WatchResult<()> {
    let mut cfg = match &cli.config {
        Some(path) => WatchConfig::load(path)?,
        None => WatchConfig::default(),
    };
    if let Some(url) = cli.notify_url {
        cfg.notify_base_url = Some(url);
    }

    let rules = load_rules(&cli.rules)?;
    tracing::info!(count = rules.len(), path = %cli.rules.display(), "loaded rules");

    let feed = Arc::new(FeedHub::new());
    let service = AlertService::start(
        &cfg,
        AlertDeps {
            feed: Arc::clone(&feed) as Arc<dyn changewatch::ChangeFeed>,
            leases: Arc::new(InMemoryLeaseStore::new()),
            rules: Arc::new(InMemoryRuleStore::with_rules(rules)),
            notifier: Arc::new(notifier_from_config(&cfg)?),
        },
    )
    .await?;

    let pumped = match &cli.events {
        Some(path) => {
            let file = tokio::fs::File::open(path).await.map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            pump(&feed, ndjson_events(file)).await
        }
        None => pump(&feed, ndjson_events(tokio::io::stdin())).await,
    };

    service.drained().await;
    let stats = service.stats();
    service.shutdown().await;

    tracing::info!(
        received = stats.received,
        delivered = stats.delivered,
        render_failures = stats.render_failures,
        delivery_failures = stats.delivery_failures,
        "done"
    );
    pumped.map(|_| ()).map_err(WatchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use changewatch::FeedError;

    #[test]
    fn exit_codes_separate_config_and_transient_failures() {
        assert_eq!(exit_code(&WatchError::from(ConfigError::FeedDisabled)), 2);
        assert_eq!(exit_code(&WatchError::from(FeedError::Source("cursor lost".into()))), 75);
        assert_eq!(exit_code(&WatchError::from(FeedError::Closed)), 1);
    }
}
