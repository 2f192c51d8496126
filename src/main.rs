use anyhow::{Context, Result};
use axum::middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{Level, error, info, warn};

use ctk_rewards::{
    AuditSink, DatabasePool, EvmLedger, InMemoryLedger, RewardIssuer,
    api::{RewardApiState, ThrottleState, create_router, security_headers_middleware},
    config::{LedgerMode, RewardConfig, sanitize_for_logging},
    run_confirmation_loop,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RewardConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {:#}", e);
        eprintln!("Please check the REWARD_* environment variables.");
        e
    })?;

    init_logging(&config)?;

    info!("Starting CTK reward issuance service");
    info!(
        mode = ?config.ledger.mode,
        rpc_url = %sanitize_for_logging(&config.ledger.rpc_url),
        custodial = %config.ledger.custodial_address,
        symbol = %config.reward.symbol,
        "Ledger settings"
    );

    let audit = connect_database(&config).await.map(|db| db as Arc<dyn AuditSink>);

    // The ledger client moves into the issuer; only its serializer can submit.
    let settings = config.issuer_settings();
    let (issuer, worker) = match config.ledger.mode {
        LedgerMode::Memory => {
            warn!("Using the in-memory ledger: balances and transfers are lost on restart");
            let ledger = InMemoryLedger::new(
                config.ledger.custodial_address.clone(),
                config.ledger.memory_initial_balance,
            );
            RewardIssuer::start(Arc::new(ledger), settings, audit)
        }
        LedgerMode::Evm => {
            let ledger = EvmLedger::new(config.evm_ledger_config()).context("Failed to create EVM ledger client")?;
            RewardIssuer::start(Arc::new(ledger), settings, audit)
        }
    };
    let issuer = Arc::new(issuer);

    let confirmations = tokio::spawn(run_confirmation_loop(
        issuer.reporter(),
        config.confirmation_interval(),
    ));

    let throttle = ThrottleState::new(config.security.rate_limit_per_minute);
    let cleanup = {
        let throttle = throttle.throttle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                throttle.cleanup();
            }
        })
    };

    let app = create_router(
        RewardApiState {
            issuer: issuer.clone(),
            reward_amount: config.reward.amount,
            symbol: config.reward.symbol.clone(),
            decimals: config.reward.decimals,
        },
        throttle,
    )
    .layer(middleware::from_fn(security_headers_middleware))
    .layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind_addr, e))?;

    info!("Reward service listening on {}", bind_addr);
    info!(
        "Reward: {} base units per grant, rate limit {}/min per requester",
        config.reward.amount, config.security.rate_limit_per_minute
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped, draining transfer queue");
    confirmations.abort();
    cleanup.abort();

    // Dropping the last issuer handle closes the queue; the worker finishes what is queued.
    drop(issuer);
    let drain = Duration::from_secs(config.queue.timeout_secs);
    if tokio::time::timeout(drain, worker).await.is_err() {
        warn!(timeout_secs = drain.as_secs(), "Transfer queue did not drain before shutdown");
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(config: &RewardConfig) -> Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

/// Connect the audit database if one is configured. Auditing is best-effort,
/// so a failure here is logged and the service runs without it.
async fn connect_database(config: &RewardConfig) -> Option<Arc<DatabasePool>> {
    let url = config.database.url.as_deref()?;

    let db = match DatabasePool::new(url, config.database.max_connections).await {
        Ok(db) => db,
        Err(e) => {
            error!(url = %sanitize_for_logging(url), error = %e, "Audit database unavailable, continuing without it");
            return None;
        }
    };

    if let Err(e) = db.init_schema().await {
        error!(error = %e, "Failed to initialize audit schema, continuing without it");
        return None;
    }

    info!("Transfer audit trail enabled");
    Some(Arc::new(db))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
