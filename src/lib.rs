//! Garage Billing - job, approval and invoicing server for a vehicle repair
//! shop.
//!
//! Domain modules own the SQLite reads and writes; `web` renders them as
//! server-side HTML pages behind a cookie session.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod activity;
pub mod approvals;
pub mod auth;
pub mod billing;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod export;
pub mod inventory;
pub mod jobs;
pub mod vehicles;
pub mod web;
pub mod workflow;

use config::AppConfig;

// ============================================================================
// App entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Initialize structured logging (console + rolling file)
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,garage_billing_lib=debug"));

    let log_dir = diagnostics::get_log_dir(&config.data_dir);
    diagnostics::prune_old_logs(&log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Starting Garage Billing v{}", env!("CARGO_PKG_VERSION"));

    let db = db::init(&config.data_dir).context("failed to initialize database")?;

    match config.admin_credentials() {
        Some((username, password)) => {
            auth::bootstrap_director(&db, username, password)
                .context("failed to create the bootstrap director")?;
        }
        None => {
            let users = auth::list_users(&db).context("failed to read users")?;
            if users.is_empty() {
                warn!(
                    "no users exist; set GARAGE_ADMIN_USER and GARAGE_ADMIN_PASSWORD to create a director"
                );
            }
        }
    }

    let state = web::AppState::new(Arc::new(db));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime
        .block_on(web::serve(config.bind_addr, state))
        .with_context(|| format!("server on {} stopped", config.bind_addr))?;

    // `_guard` flushes the file writer when dropped here.
    Ok(())
}
