//! Remit Background Worker
//!
//! Handles scheduled jobs including:
//! - Submission sweep: dispatch staged/retrying transactions (every minute)
//! - Billing invariant checks (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use remit_billing::{BillingService, InvariantChecker, SubmitResult};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a submission sweep
fn log_submit_results(results: &[SubmitResult]) {
    let submitted = results
        .iter()
        .filter(|r| matches!(r, SubmitResult::Submitted { .. }))
        .count();
    let retrying = results
        .iter()
        .filter(|r| matches!(r, SubmitResult::Failed { gave_up: false, .. }))
        .count();
    let gave_up = results
        .iter()
        .filter(|r| matches!(r, SubmitResult::Failed { gave_up: true, .. }))
        .count();

    info!(
        submitted = submitted,
        retrying = retrying,
        gave_up = gave_up,
        "Submission sweep complete"
    );

    // Log individual failures
    for result in results {
        if let SubmitResult::Failed {
            transaction_id,
            error,
            gave_up,
        } = result
        {
            if *gave_up {
                error!(
                    transaction_id = %transaction_id,
                    error = %error,
                    "Transaction exhausted its retry budget"
                );
            } else {
                warn!(
                    transaction_id = %transaction_id,
                    error = %error,
                    "Dispatch failed, will retry"
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Remit Worker");

    // Create database pool and apply migrations
    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without gateway credentials there is nothing to dispatch.
            warn!(error = %e, "Failed to create billing service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Submission sweep every minute
    // Picks up staged and retrying transactions and dispatches them
    let submit_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = submit_billing.clone();
            Box::pin(async move {
                let results = billing.dispatcher.submit_due().await;
                if !results.is_empty() {
                    log_submit_results(&results);
                }
            })
        })?)
        .await?;
    info!("Scheduled: Submission sweep (every minute)");

    // Job 2: Billing invariant checks (hourly)
    let invariant_checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "Billing invariants healthy"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to run invariant checks");
                    }
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Remit Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
