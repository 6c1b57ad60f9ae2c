//! Exchange Stream Binary
//!
//! Watches the order books of a few spot symbols and logs the top of book.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin exchange-stream
//! ```
//!
//! # Environment Variables
//!
//! - `EXG_EXCHANGE`: okx | bybit (default: okx)
//! - `EXG_SYMBOLS`: Comma-separated unified symbols (default: BTC/USDT)
//! - `EXG_WATCH_DEPTH`: Order book depth to request (default: 5)
//! - `EXG_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `EXG_LOG_FORMAT`: text | json (default: text)
//! - `EXG_API_KEY` / `EXG_API_SECRET` / `EXG_API_PASSPHRASE`: credentials of
//!   the default account, needed for private streams only
//! - `RUST_LOG`: Log filter (default: `exchange_stream=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use exchange_stream::infrastructure::config::RunSettings;
use exchange_stream::infrastructure::metrics;
use exchange_stream::{
    BookSide, BybitProtocol, EngineConfig, ExchangeProtocol, OkxProtocol, StaticMarketCatalog,
    StreamEngine, TelemetryConfig, WatchOptions, init_telemetry,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How often book statistics are logged.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        bail!("failed to install rustls crypto provider");
    }

    load_dotenv();
    init_telemetry(&TelemetryConfig::from_env()).context("installing tracing subscriber")?;

    let run = RunSettings::from_env();
    let config = EngineConfig::from_env().context("loading engine configuration")?;
    tracing::info!(
        exchange = %run.exchange,
        symbols = ?run.symbols,
        depth = run.depth,
        metrics_port = run.metrics_port,
        accounts = config.accounts.len(),
        "Configuration loaded"
    );

    if run.metrics_port != 0 {
        metrics::install_exporter(run.metrics_port).context("installing metrics exporter")?;
    }

    let (protocol, separator): (Arc<dyn ExchangeProtocol>, &str) = match run.exchange.as_str() {
        "okx" => (Arc::new(OkxProtocol::new()), "-"),
        "bybit" => (Arc::new(BybitProtocol::new()), ""),
        other => bail!("unsupported exchange: {other}"),
    };
    let markets = Arc::new(StaticMarketCatalog::spot(&run.symbols, separator));
    let engine = StreamEngine::new(protocol, markets, config);

    let symbols: Vec<&str> = run.symbols.iter().map(String::as_str).collect();
    let options = WatchOptions::default().with_depth(run.depth);
    let books = engine
        .watch_order_books(&symbols, &options)
        .await
        .context("watching order books")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(await_shutdown(shutdown.clone()));

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    let mut updates: u64 = 0;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            book = books.recv() => {
                let Some(book) = book else {
                    tracing::warn!("Order book stream closed");
                    break;
                };
                updates += 1;
                tracing::debug!(
                    symbol = book.symbol(),
                    best_bid = ?book.best_bid().map(|l| l.price),
                    best_ask = ?book.best_ask().map(|l| l.price),
                    bids = book.len(BookSide::Bid),
                    asks = book.len(BookSide::Ask),
                    "Book update"
                );
            }
            _ = report.tick() => {
                for symbol in &symbols {
                    if let Some(book) = engine.order_book(symbol) {
                        tracing::info!(
                            symbol,
                            best_bid = ?book.best_bid().map(|l| l.price),
                            best_ask = ?book.best_ask().map(|l| l.price),
                            updates,
                            "Top of book"
                        );
                    }
                }
                let dropped = books.dropped();
                if dropped > 0 {
                    tracing::warn!(dropped, "Consumer is falling behind");
                }
            }
        }
    }

    if let Err(e) = engine.unwatch_order_books(&symbols, &options).await {
        tracing::warn!(error = %e, "Unwatch failed during shutdown");
    }
    engine.close();
    tracing::info!(updates, "Shutdown complete");
    Ok(())
}

/// Load `.env` from the working directory or the nearest ancestor that has one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    let Ok(cwd) = std::env::current_dir() else {
        return;
    };
    for dir in cwd.ancestors().skip(1) {
        let path = dir.join(".env");
        if path.is_file() {
            let _ = dotenvy::from_path(&path);
            return;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl+C");
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
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
