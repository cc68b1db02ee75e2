use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{signal, sync::mpsc, time::Duration};
use tracing::{error, info};

use vehicle_reminder_notifier::{
    api,
    apns::ApnsProvider,
    config::{self, ProviderKind},
    db::{self, PgStore},
    delivery::DeliveryService,
    expo::ExpoProvider,
    generator::NotificationGenerator,
    history::HistoryService,
    logging,
    provider::Provider,
    scheduler::{self, LocalScheduler, TokioTimerPlatform},
    store::VehicleSource,
};

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async {
        // Initialize logging first thing
        logging::setup_logging();

        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        info!("Starting vehicle reminder notification service");

        let config = config::Config::from_env()?;

        let db_pool = db::init_db_pool(&config.database_url, config.database_max_connections).await?;
        let store = Arc::new(PgStore::new(db_pool));

        let provider = Arc::new(match config.provider {
            ProviderKind::Expo => Provider::Expo(ExpoProvider::new(
                config.expo_push_url.clone(),
                config.expo_access_token.clone(),
            )?),
            ProviderKind::Apns => {
                let apns = config
                    .apns
                    .as_ref()
                    .context("APNs provider selected without APNs configuration")?;
                Provider::Apns(ApnsProvider::new(apns)?)
            }
        });
        info!(provider = ?config.provider, "Push provider initialized");

        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            provider,
            config.delivery.clone(),
            config.local_offset,
        ));

        // Fired local timers flow back into push delivery
        let (fired_sender, fired_receiver) = mpsc::channel(1000);
        let platform = Arc::new(TokioTimerPlatform::new(fired_sender));
        let local_scheduler = Arc::new(LocalScheduler::new(
            store.clone(),
            store.clone(),
            platform,
            config.scheduler.clone(),
            config.local_offset,
        ));
        local_scheduler.init();
        // Timers do not survive a restart; re-arm every live reminder before generating new ones
        if let Err(e) = local_scheduler.restore_pending().await {
            error!("Error restoring pending reminders: {:#}", e);
        }

        let dispatcher_handle = tokio::spawn(scheduler::run_fire_dispatcher(
            fired_receiver,
            delivery.clone(),
        ));

        // Stale token sweep
        let cleanup_delivery = delivery.clone();
        let max_idle_days = config.token_max_idle_days;
        let cleanup_interval = config.token_cleanup_interval_secs.max(1);
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
            loop {
                interval.tick().await;
                if let Err(e) = cleanup_delivery.cleanup_old_tokens(max_idle_days).await {
                    error!("Error during push token cleanup: {:#}", e);
                }
            }
        });

        let api_state = Arc::new(api::ApiState {
            store: store.clone(),
            generator: NotificationGenerator::new(store.clone(), store.clone(), config.generator.clone())
                .with_local_offset(config.local_offset),
            scheduler: local_scheduler.clone(),
            delivery: delivery.clone(),
            history: HistoryService::new(store.clone()),
            token_max_idle_days: config.token_max_idle_days,
        });

        // Periodic reminder generation for every user with a vehicle
        let generation_state = api_state.clone();
        let generation_interval = config.generation_interval_secs.max(1);
        let generation_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(generation_interval));
            loop {
                interval.tick().await;
                let users = match generation_state.store.users_with_vehicles().await {
                    Ok(users) => users,
                    Err(e) => {
                        error!("Error listing users for reminder generation: {:#}", e);
                        continue;
                    }
                };

                let mut scheduled = 0;
                for user_id in users {
                    match generation_state.refresh_reminders(user_id).await {
                        Ok(outcome) => scheduled += outcome.scheduled.len(),
                        Err(e) => error!(user_id = %user_id, "Error refreshing reminders: {:#}", e),
                    }
                }
                info!(scheduled, "Reminder generation pass finished");
            }
        });

        let api_router = api::create_api_router(api_state);
        let addr = config.api_bind_address.clone();
        let api_handle = tokio::spawn(async move {
            info!("Starting API server on {}", addr);

            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to bind API server to {}: {}", addr, e);
                    return;
                }
            };
            if let Err(e) = axum::serve(listener, api_router).await {
                error!("API server error: {}", e);
            }
        });

        // Handle graceful shutdown
        signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
        info!("Received shutdown signal, shutting down gracefully");

        api_handle.abort();
        generation_handle.abort();
        cleanup_handle.abort();
        local_scheduler.shutdown().await;
        // Pending timers are gone, so no new fires can reach the dispatcher
        dispatcher_handle.abort();

        let _ = tokio::join!(api_handle, generation_handle, cleanup_handle, dispatcher_handle);

        info!("Shutdown complete");
        Ok(())
    })
}
