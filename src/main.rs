//! TF2 Arbitrage - Main Entry Point
//!
//! Runs the feed-to-execution pipeline against the live marketplace or the
//! paper venue, and reports ledger status.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tf2_arbitrage::config::{Config, CurrencyConfig};
use tf2_arbitrage::ledger::{Ledger, SqliteLedgerStore};
use tf2_arbitrage::market::{
    CurrencyClient, FeedConnection, MarketplaceClient, PaperVenue, SkuResolver, SourceId,
    TradingVenue,
};
use tf2_arbitrage::pricing::{FeedNormalizer, KeyPrice, PriceCache};
use tf2_arbitrage::strategy::{
    ArbitragePipeline, ExecutionCoordinator, ExecutionOutcome, FeeSchedule, OpportunityDetector,
    RetryPolicy,
};
use tf2_arbitrage::utils::format_price;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Capacity of each feed's update channel
const FEED_CHANNEL_CAPACITY: usize = 1024;

/// How often the main loop logs pipeline status
const STATUS_LOG_INTERVAL_SECS: i64 = 60;

/// TF2 Arbitrage CLI
#[derive(Parser)]
#[command(name = "tf2-arbitrage")]
#[command(version, about = "Cross-marketplace price arbitrage for TF2 items")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the arbitrage engine (default)
    Run {
        /// Trade against the paper venue instead of the marketplace
        #[arg(long)]
        paper: bool,
    },

    /// Show ledger summary and unresolved compensation failures
    Status {
        /// Path to SQLite ledger (default: data/ledger.db)
        #[arg(short, long, default_value = "data/ledger.db")]
        db: String,

        /// Show every compensation failure in detail
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => show_status(&db, verbose),
        Some(Commands::Run { paper }) => run(paper).await,
        None => run(false).await,
    }
}

async fn run(paper: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              TF2 Arbitrage v{}                          ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    let venue: Arc<dyn TradingVenue> = if paper {
        info!("📝 PAPER TRADING MODE - orders are simulated");
        Arc::new(PaperVenue::new())
    } else {
        anyhow::ensure!(
            !config.marketplace.api_key.is_empty() && !config.marketplace.api_secret.is_empty(),
            "marketplace credentials are required for live trading (use --paper to simulate)"
        );
        warn!("⚠️  LIVE TRADING MODE - real items and metal at risk!");
        Arc::new(MarketplaceClient::new(
            &config.marketplace,
            config.execution.call_timeout(),
        )?)
    };

    let store = SqliteLedgerStore::open(&config.ledger.path)
        .with_context(|| format!("Failed to open ledger at {}", config.ledger.path))?;
    let ledger = Arc::new(Ledger::open(Arc::new(store))?);
    info!("📂 [LEDGER] Opened {}", config.ledger.path);

    let cache = Arc::new(PriceCache::new());
    let resolver = Arc::new(SkuResolver::new(config.items.aliases.clone()));
    let key_price = Arc::new(KeyPrice::new(config.currency.key_price_ref));
    let key_refresh = if config.currency.refresh_enabled() {
        let client = CurrencyClient::new(&config.currency, config.execution.call_timeout())?;
        Some(client.spawn_refresh(key_price.clone(), config.currency.refresh_interval()))
    } else {
        None
    };
    let normalizer = Arc::new(FeedNormalizer::new(resolver, key_price.clone()));
    let detector = Arc::new(OpportunityDetector::new(
        cache.clone(),
        FeeSchedule::from(&config.fees),
        config.detection.clone(),
    ));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        venue,
        ledger,
        cache.clone(),
        RetryPolicy::from(&config.execution),
    ));

    // Finish whatever a previous run left mid-flight before taking new work
    let recovered = coordinator.recover().await?;
    if !recovered.is_empty() {
        info!("♻️  [RECOVERY] Resumed {} attempt(s)", recovered.len());
        for outcome in &recovered {
            log_outcome(outcome, key_price.get());
        }
    }

    let pipeline = ArbitragePipeline::new(normalizer, cache.clone(), detector, coordinator.clone());
    let detection = pipeline.spawn_detection();

    for feed in &config.feeds {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        pipeline.spawn_ingestion(SourceId::new(feed.source.as_str()), rx);
        tokio::spawn(FeedConnection::new(feed.source.as_str(), feed.url.as_str()).run(tx));
    }
    if config.feeds.is_empty() {
        warn!("⚠️  No feeds configured; nothing will be detected");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    info!("🚀 Pipeline running with {} feed(s)", config.feeds.len());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let mut last_status_log = Utc::now();
    let mut halt_reported = false;

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if coordinator.is_halted() && !halt_reported {
            error!("🚨 Execution halted; new attempts are refused until the ledger recovers");
            halt_reported = true;
        } else if !coordinator.is_halted() {
            halt_reported = false;
        }

        if (Utc::now() - last_status_log).num_seconds() >= STATUS_LOG_INTERVAL_SECS {
            let stats = pipeline.stats();
            info!(
                "📊 [STATUS] Items: {} | Quotes: {} applied, {} stale, {} dropped | Opportunities: {} | Re-evaluated: {} | In flight: {} | Key: {} ref",
                cache.item_count(),
                stats.quotes_applied,
                stats.quotes_stale,
                stats.quotes_dropped,
                stats.opportunities,
                stats.reevaluations,
                coordinator.in_flight_count(),
                key_price.get()
            );
            last_status_log = Utc::now();
        }
    }

    pipeline.shutdown();
    if let Some(refresh) = key_refresh {
        refresh.abort();
    }
    if let Err(e) = detection.await {
        warn!("Detection task ended abnormally: {}", e);
    }

    // Let dispatched attempts reach a terminal state before exiting
    while coordinator.in_flight_count() > 0 {
        info!(
            "⏳ Waiting for {} in-flight attempt(s)",
            coordinator.in_flight_count()
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        if coordinator.is_halted() {
            warn!("Ledger halted with attempts in flight; they will be recovered on restart");
            break;
        }
    }

    info!("👋 Shutdown complete");
    Ok(())
}

fn log_outcome(outcome: &ExecutionOutcome, key_price_ref: Decimal) {
    match outcome {
        ExecutionOutcome::Settled {
            attempt_id,
            realized_profit,
        } => info!(
            "   ✅ {} settled, profit {}",
            attempt_id,
            format_price(*realized_profit, key_price_ref)
        ),
        ExecutionOutcome::Failed {
            attempt_id,
            reason,
            compensated,
        } => warn!(
            "   ❌ {} failed ({}), compensated: {}",
            attempt_id, reason, compensated
        ),
        ExecutionOutcome::Cancelled { attempt_id } => info!("   ⏹️  {} cancelled", attempt_id),
        ExecutionOutcome::AlreadyInFlight { attempt_id } => {
            info!("   ⏭️  {} already in flight", attempt_id)
        }
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "tf2-arbitrage.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    let filter = EnvFilter::from_default_env()
        .add_directive("tf2_arbitrage=debug".parse()?)
        .add_directive(Level::INFO.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE);

    // Structured output for log shippers
    if std::env::var("TF2ARB_LOG_JSON").unwrap_or_default() == "true" {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Min Net Profit: {} ref",
        config.detection.min_net_profit
    );
    info!("   Staleness: {}s", config.detection.staleness_secs);
    info!(
        "   Default Fees: {} ref + {}",
        config.fees.default.flat, config.fees.default.rate
    );
    for (source, fees) in &config.fees.sources {
        info!("   Fees [{}]: {} ref + {}", source, fees.flat, fees.rate);
    }
    info!(
        "   Retries: {} attempts, backoff {}-{}ms, timeout {}s",
        config.execution.max_attempts,
        config.execution.initial_backoff_ms,
        config.execution.max_backoff_ms,
        config.execution.call_timeout_secs
    );
    info!("   Key Price: {} ref", config.currency.key_price_ref);
    if config.currency.refresh_enabled() {
        info!(
            "   Key Price Refresh: {} every {}s",
            config.currency.refresh_url, config.currency.refresh_secs
        );
    }
    info!("   Ledger: {}", config.ledger.path);
}

/// Print the ledger summary.
fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    use std::path::Path;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              TF2 ARBITRAGE STATUS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Ledger not found: {}", db_path);
        println!("   The engine has not been started yet, or the ledger path is incorrect.");
        return Ok(());
    }

    let ledger = Ledger::open(Arc::new(SqliteLedgerStore::open(db_path)?))?;
    let summary = ledger.summary()?;
    let key_price_ref = Config::load()
        .map(|config| config.currency.key_price_ref)
        .unwrap_or_else(|_| CurrencyConfig::default().key_price_ref);

    println!("\n📊 Attempts");
    println!("   ├─ Total:            {}", summary.attempts);
    println!("   ├─ Settled:          {}", summary.settled);
    println!("   ├─ Failed:           {}", summary.failed);
    println!("   ├─ Compensated:      {}", summary.compensated);
    println!("   └─ Open:             {}", summary.open);

    println!(
        "\n💰 Realized Profit:     {}",
        format_price(summary.realized_profit, key_price_ref)
    );

    if summary.compensation_failures.is_empty() {
        println!("\n✅ No unresolved compensation failures");
        return Ok(());
    }

    println!(
        "\n🚨 Compensation Failures ({}) - bought items still held",
        summary.compensation_failures.len()
    );
    for attempt in &summary.compensation_failures {
        let opp = &attempt.opportunity;
        println!("   ┌─ {} ({})", opp.item, attempt.id);
        println!(
            "   ├─ Bought on {} @ {} ref",
            opp.buy_source,
            attempt
                .buy_fill
                .as_ref()
                .map(|fill| fill.price)
                .unwrap_or(opp.buy_price)
        );
        if verbose {
            println!("   ├─ Intended sell:  {} @ {} ref", opp.sell_source, opp.sell_price);
            println!("   ├─ Calls:          {}", attempt.attempts);
            if let Some(error) = &attempt.last_error {
                println!("   ├─ Last error:     {}", error);
            }
        }
        println!(
            "   └─ Failed at:      {}",
            attempt
                .completed_at
                .unwrap_or(attempt.started_at)
                .format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}
