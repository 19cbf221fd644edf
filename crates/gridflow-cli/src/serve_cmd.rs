//! `gridflow serve`: run the Task Scheduler, Task Callback Router, and
//! Worker Liveness Manager consumer/sweep loops in-process against a real
//! bus and database, until interrupted.
//!
//! A `CancellationToken` is threaded into every long-running loop; the
//! first Ctrl+C cancels it for a graceful drain, a second forces immediate
//! exit rather than waiting for in-flight work to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use gridflow_bus::{nats::NatsBus, EventBus};
use gridflow_cache::fs::FsResultCache;
use gridflow_cache::ResultBlobStore;
use gridflow_core::{streams, CallbackRouter, LivenessManager, PgFlowCatalog, Scheduler, SchedulerConfig};

/// Root directory for the dev/test filesystem result cache when no other
/// `ResultBlobStore` is configured.
pub const CACHE_ROOT_ENV: &str = "GRIDFLOW_CACHE_ROOT";
const DEFAULT_CACHE_ROOT: &str = "./result_cache";

/// Run the scheduler/callback/liveness consumer loops until Ctrl+C.
pub async fn run_serve(pool: PgPool, bus_url: &str, config: SchedulerConfig) -> Result<()> {
    let bus: Arc<dyn EventBus> = Arc::new(
        NatsBus::connect(bus_url)
            .await
            .with_context(|| format!("failed to connect to bus at {bus_url}"))?,
    );

    streams::ensure_topology(bus.as_ref(), config.ack_wait, config.max_deliver)
        .await
        .context("failed to provision bus topology")?;

    let cache_root =
        std::env::var(CACHE_ROOT_ENV).unwrap_or_else(|_| DEFAULT_CACHE_ROOT.to_string());
    let cache: Arc<dyn ResultBlobStore> = Arc::new(FsResultCache::new(cache_root));

    let catalog = Arc::new(PgFlowCatalog::new(pool.clone()));

    let scheduler = Scheduler::new(pool.clone(), bus.clone(), catalog, config.clone());
    let callback = CallbackRouter::new(pool.clone(), bus.clone(), cache);
    let liveness = LivenessManager::new(pool.clone(), bus, config);

    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    println!("gridflow serve: scheduler, callback router, and liveness manager running.");
    println!("Press Ctrl+C to shut down (press again to force exit).");

    let _ = tokio::join!(
        run_logged(scheduler.run_request_consumer(cancel.clone()), "request consumer"),
        run_logged(scheduler.run_execute_consumer(cancel.clone()), "execute consumer"),
        run_logged(scheduler.run_cancel_consumer(cancel.clone()), "cancel consumer"),
        run_logged(callback.run_consumer(cancel.clone()), "callback consumer"),
        run_logged(liveness.run_heartbeat_consumer(cancel.clone()), "heartbeat consumer"),
        scheduler.run_progress_sweep(cancel.clone()),
        liveness.run_sweep(cancel.clone()),
    );

    println!("gridflow serve: shut down.");
    Ok(())
}

async fn run_logged(fut: impl std::future::Future<Output = gridflow_core::Result<()>>, name: &str) {
    if let Err(err) = fut.await {
        tracing::error!(loop_name = name, error = %err, "consumer loop exited with an error");
    }
}

/// First Ctrl+C cancels `cancel` for a graceful drain; a second force-exits.
fn spawn_shutdown_handler(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}
