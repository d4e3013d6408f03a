//! CLI entry point: `fairbot live` trades on Bitfinex with credentials
//! from the environment; `fairbot replay` runs the same pipeline over a
//! historical candle database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fairbot::config::Config;
use fairbot::engine::{self, EngineParams};
use fairbot::exchange::{Bitfinex, Exchange, ExchangeRef, ReplayExchange};
use fairbot::history;
use fairbot::models::{Currency, ExchangePair};
use fairbot::runtime::ThreadManager;

#[derive(Parser)]
#[command(name = "fairbot", about = "Kalman market-making engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Trade live on Bitfinex (requires BITFINEX_API_KEY / BITFINEX_SECRET).
    Live {
        #[arg(long, default_value = "fairbot.toml")]
        config: PathBuf,
    },
    /// Replay a historical candle database through the pipeline.
    Replay {
        #[arg(long, default_value = "fairbot.toml")]
        config: PathBuf,
        /// Path to the sqlite candle store.
        #[arg(long)]
        data: PathBuf,
    },
}

fn main() {
    let _ = dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Live { config } => run_live(&config),
        Command::Replay { config, data } => run_replay(&config, &data),
    };
    if let Err(e) = outcome {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn engine_params(config: &Config) -> EngineParams {
    EngineParams {
        beat_interval_ms: config.beat_interval_ms,
        signal_window: config.signals.window_size,
        baskets: config.baskets(),
        kalman: config.kalman.clone(),
        execution: config.execution.clone(),
    }
}

fn run_live(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let pairs = config.trading_pairs()?;
    let thread_manager = ThreadManager::new();

    let bitfinex = Arc::new(Bitfinex::new(thread_manager.clone())?);
    info!(pairs = ?config.pairs, "warming up from Bitfinex candles");
    let warmup = bitfinex.warmup_frames(&pairs, config.warmup_ticks)?;

    let exchanges = vec![(bitfinex as ExchangeRef, pairs)];
    engine::build_and_attach(
        &thread_manager,
        engine_params(&config),
        exchanges,
        &warmup,
        None,
    )?;
    thread_manager.run()
}

fn run_replay(config_path: &std::path::Path, data: &std::path::Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let pairs = config.trading_pairs()?;
    let source = config.replay.source_exchange.clone();

    let universe: Vec<ExchangePair> = pairs
        .iter()
        .map(|pair| ExchangePair::new(source.as_str(), pair.clone()))
        .collect();
    let frames = history::load_frames(data, &universe, None)?;
    if frames.len() <= config.warmup_ticks {
        anyhow::bail!(
            "candle store has {} frames, need more than warmup_ticks = {}",
            frames.len(),
            config.warmup_ticks
        );
    }
    let (warmup, live) = frames.split_at(config.warmup_ticks);
    if let Some((first, last)) = history::time_range(data)? {
        info!(%first, %last, "candle store covers");
    }
    info!(
        warmup = warmup.len(),
        replay = live.len(),
        "replaying candle store {}",
        data.display()
    );

    let thread_manager = ThreadManager::new();
    let replay = Arc::new(ReplayExchange::new(
        thread_manager.clone(),
        source,
        pairs.clone(),
        live.to_vec(),
        fairbot::models::Fees {
            maker: config.replay.maker_fee,
            taker: config.replay.taker_fee,
        },
        config.replay.half_spread,
    ));
    if config.replay.quote_deposit > 0.0 {
        let quotes: std::collections::BTreeSet<Currency> =
            pairs.iter().map(|pair| pair.quote().clone()).collect();
        for quote in quotes {
            replay.deposit(quote, config.replay.quote_deposit);
        }
    }

    let exchanges = vec![(replay.clone() as ExchangeRef, pairs)];
    let executor = engine::build_and_attach(
        &thread_manager,
        engine_params(&config),
        exchanges,
        warmup,
        Some(replay.clone()),
    )?;
    thread_manager.run().context("replay run")?;

    let submitted = executor.submitted();
    info!(
        orders = submitted.len(),
        balances = ?replay.balances(),
        "replay finished"
    );
    Ok(())
}
