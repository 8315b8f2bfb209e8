use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use futuresbot::api::stream::TradeStream;
use futuresbot::api::{BinanceFuturesClient, Exchange, PaperExchange};
use futuresbot::config::BotConfig;
use futuresbot::execution::TradingBot;
use futuresbot::strategy::classifier::RemoteClassifier;

/// Single-symbol USDⓈ-M futures trading bot
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Trade against the in-process paper exchange
    #[arg(long)]
    paper: bool,

    /// Log filter, e.g. "info" or "futuresbot=debug" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Seed for the paper exchange random walk
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging(args.log_level.as_deref());

    let mut config = BotConfig::load(args.config.as_deref())?;
    if args.seed.is_some() {
        config.paper.seed = args.seed;
    }

    tracing::info!("🚀 futuresbot starting");
    tracing::info!(
        symbol = %config.trading.symbol,
        interval = %config.trading.interval,
        leverage = config.trading.leverage,
        take_profit_pct = config.exits.take_profit_pct,
        stop_loss_pct = config.exits.stop_loss_pct,
        classifier = ?config.classifier.mode,
        paper = args.paper,
        "Configuration loaded"
    );

    let exchange = create_exchange(&config, args.paper)?;
    let mut bot = TradingBot::new(config.clone(), exchange);

    if let Some(classifier) = RemoteClassifier::from_config(&config.classifier)? {
        bot = bot.with_classifier(Box::new(classifier));
    }

    let (stream_shutdown_tx, stream_shutdown_rx) = watch::channel(false);
    let stream_task = if config.exchange.use_trade_stream && !args.paper {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = TradeStream::new(&config.exchange.ws_url, &config.trading.symbol);
        tracing::info!(url = stream.url(), "Trade stream enabled");
        bot = bot.with_feed_events(events_rx);
        Some(tokio::spawn(stream.run(events_tx, stream_shutdown_rx)))
    } else {
        None
    };

    bot.initialize()
        .await
        .context("Failed to initialize trading bot")?;

    let handle = bot.handle();
    let status = handle.start();
    tracing::info!(
        state = %status.state,
        equity = status.equity,
        "Bot running, press Ctrl+C to stop"
    );

    let mut control = tokio::spawn(bot.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            handle.shutdown();
            control
                .await
                .context("Control task panicked")?
                .context("Control loop failed")?;
        }
        result = &mut control => {
            tracing::error!("Control loop exited unexpectedly");
            result.context("Control task panicked")?.context("Control loop failed")?;
        }
    }

    stream_shutdown_tx.send_replace(true);
    if let Some(task) = stream_task {
        let _ = task.await;
    }

    let status = handle.status();
    tracing::info!(
        state = %status.state,
        equity = status.equity,
        realized_pnl = status.realized_pnl,
        "👋 futuresbot stopped"
    );
    Ok(())
}

fn setup_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("futuresbot=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_exchange(config: &BotConfig, paper: bool) -> Result<Arc<dyn Exchange>> {
    if paper {
        tracing::info!(
            seed = ?config.paper.seed,
            equity = config.paper.initial_equity,
            "Using paper exchange"
        );
        return Ok(Arc::new(PaperExchange::new(
            config.paper.clone(),
            &config.trading.interval,
        )));
    }

    let client = BinanceFuturesClient::new(&config.exchange)
        .context("Failed to create Binance client")?;
    if !client.has_credentials() {
        anyhow::bail!("BINANCE_API_KEY and BINANCE_API_SECRET are required (or pass --paper)");
    }
    Ok(Arc::new(client))
}
