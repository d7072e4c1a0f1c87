use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use paylock_server::config::{CashoutPolicy, MonitorConfig};
use paylock_server::db;
use paylock_server::logging;
use paylock_server::rails::{LogNotifier, UnavailableRates, UnconfiguredRail};
use paylock_server::services::auto_cashout::AutoCashoutMonitor;
use paylock_server::services::expiry_processor::ExpiryProcessor;
use paylock_server::services::outbox::OutboxWorker;
use paylock_server::services::reconciler::WebhookReconciler;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "paylock.db".to_string());
    let pool = db::init_pool(&database_url)?;
    {
        let mut conn = pool.get().context("Failed to get DB connection")?;
        db::init_schema(&mut conn)?;
    }
    info!(database_url = %database_url, "database ready");

    let monitor_config = MonitorConfig::from_env();
    let cashout_policy = CashoutPolicy::from_env();

    // Default wiring declines withdrawals and reports rates unavailable;
    // real providers are plugged in behind these traits.
    let rail = Arc::new(UnconfiguredRail);
    let rates = Arc::new(UnavailableRates);
    let notifier = Arc::new(LogNotifier);

    let cashout_monitor = Arc::new(AutoCashoutMonitor::new(
        pool.clone(),
        rail,
        cashout_policy,
        monitor_config.clone(),
    ));
    let expiry_processor = Arc::new(ExpiryProcessor::new(pool.clone(), monitor_config.clone()));
    let reconciler = Arc::new(WebhookReconciler::new(
        pool.clone(),
        rates,
        monitor_config.clone(),
    ));
    let outbox = Arc::new(OutboxWorker::new(pool, notifier, monitor_config));

    tokio::spawn(cashout_monitor.start_monitoring());
    tokio::spawn(expiry_processor.start_monitoring());
    tokio::spawn(reconciler.start_monitoring());
    tokio::spawn(outbox.start_monitoring());

    info!("coordination engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
