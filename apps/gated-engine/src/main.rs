//! Gated Engine Binary
//!
//! Runs the engine in the mode named by the configuration.
//!
//! # Usage
//!
//! ```bash
//! gated-engine [config.yaml] [bars.jsonl]
//! ```
//!
//! - `backtest`: replays the bar file deterministically and prints the
//!   report as JSON.
//! - `paper` / `live`: streams the bar file through the live loop against
//!   the configured broker until the file ends or Ctrl+C.
//!
//! Without a config argument `config.yaml` is used when present, defaults
//! otherwise. `RUST_LOG` overrides the configured log level.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gated_engine::audit::{AuditTarget, ChannelAuditSink, SharedAuditSink};
use gated_engine::broker::create_broker;
use gated_engine::config::{Config, EngineMode, load_config};
use gated_engine::observability::{init_logging, init_metrics};
use gated_engine::safety::KillSwitch;
use gated_engine::scheduler::{BacktestScheduler, LiveScheduler, ReplayFeed, load_bars_jsonl};
use gated_engine::strategy::SmaCrossStrategy;
use gated_engine::EngineContext;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Config file used when none is given.
const DEFAULT_CONFIG: &str = "config.yaml";

/// Bar file used when none is given.
const DEFAULT_BARS: &str = "bars.jsonl";

/// How long to wait for queued audit events to be written on exit.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next();
    let bars_path = args.next().unwrap_or_else(|| DEFAULT_BARS.to_string());

    let config = match config_path.as_deref() {
        Some(path) => load_config(Some(path))?,
        None if Path::new(DEFAULT_CONFIG).exists() => load_config(None)?,
        None => Config::default(),
    };

    init_logging(&config.observability.logging)?;
    init_metrics(&config.observability.metrics)?;

    tracing::info!(
        mode = %config.engine.mode,
        base_currency = %config.engine.base_currency,
        initial_cash = %config.engine.initial_cash,
        bars = %bars_path,
        "Starting gated engine"
    );

    let loaded = load_bars_jsonl(&bars_path)?;
    if !loaded.rejected.is_empty() {
        tracing::warn!(count = loaded.rejected.len(), "Bar lines rejected while loading");
    }

    let target = config
        .observability
        .audit_log
        .as_ref()
        .map_or(AuditTarget::Tracing, |path| AuditTarget::JsonLines(path.into()));
    let (sink, audit_task) = ChannelAuditSink::spawn(target);
    let audit: SharedAuditSink = Arc::new(sink);
    let strategy = Box::new(SmaCrossStrategy::default());

    match config.engine.mode {
        EngineMode::Backtest => {
            let kill_switch = KillSwitch::in_memory(audit.clone());
            let ctx = EngineContext::new(config, kill_switch, audit.clone());
            let report = BacktestScheduler::new(&ctx, strategy)?
                .run(&loaded.bars)
                .context("backtest failed")?;
            println!("{}", report.to_json()?);
        }
        EngineMode::Paper | EngineMode::Live => {
            let ctx = EngineContext::open(config, audit.clone());
            if ctx.kill_switch().is_tripped() {
                tracing::warn!(
                    reason = ctx.kill_switch().state().trip_reason.as_deref().unwrap_or("unknown"),
                    "Kill switch is tripped; no orders will be submitted until reset"
                );
            }
            let engine = &ctx.config().engine;
            let broker = create_broker(&ctx.config().broker, &engine.base_currency, engine.initial_cash);

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            let scheduler = LiveScheduler::new(&ctx, strategy, ctx.resilient(broker), cancel)?;
            let mut feed = ReplayFeed::new(loaded.bars).with_pace(ctx.config().live.fill_poll_interval());
            let summary = scheduler.run(&mut feed).await.context("live loop failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    // The writer task ends once the last sink handle is gone.
    drop(audit);
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit_task).await.is_err() {
        tracing::warn!("Audit writer did not drain in time");
    }

    tracing::info!("Gated engine stopped");
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler could not be installed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler could not be installed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }

    token.cancel();
}
