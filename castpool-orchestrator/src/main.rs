use castpool_common::bus::{CHANNEL_ALERTS, CHANNEL_POOL_EVENTS};
use castpool_orchestrator::alerts::{AlertSink, LogAlertSink, RedisAlertSink};
use castpool_orchestrator::events::EventBus;
use castpool_orchestrator::health_monitor::{HealthMonitor, HealthMonitorConfig};
use castpool_orchestrator::maintenance_job::{self, MaintenanceJob};
use castpool_orchestrator::pool_manager::{PoolManager, TransitionConfig};
use castpool_orchestrator::provider_manager::ProviderManager;
use castpool_orchestrator::redis_store::RedisStore;
use castpool_orchestrator::resource_client::{HttpServiceProbe, ResourceClient};
use castpool_orchestrator::routes::{self, AppState};
use castpool_orchestrator::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env();
    tracing::info!(
        provider = %settings.provider,
        region = %settings.region,
        prefix = %settings.store_prefix,
        "castpool orchestrator starting"
    );

    let provider = ProviderManager::get_provider(&settings).expect("no usable cloud provider configured");
    let probe = HttpServiceProbe::new().expect("failed to build HTTP probe client");
    let transition = TransitionConfig::default();
    let client = Arc::new(
        ResourceClient::from_settings(provider, Arc::new(probe), &settings)
            .with_poll_interval(transition.poll_interval),
    );

    let redis_client = redis::Client::open(settings.redis_url.clone()).expect("invalid REDIS_URL");
    let store = RedisStore::connect(&redis_client, &settings.store_prefix)
        .await
        .expect("failed to connect to Redis");
    println!("✅ Connected to Redis");

    let events = EventBus::default();
    events.forward_to_redis(
        redis_client.clone(),
        format!("{}:{}", settings.store_prefix, CHANNEL_POOL_EVENTS),
        "castpool-orchestrator".to_string(),
    );
    let alerts: Arc<dyn AlertSink> = match settings.alert_sink.as_str() {
        "log" => Arc::new(LogAlertSink),
        _ => Arc::new(RedisAlertSink::new(
            redis_client.clone(),
            format!("{}:{}", settings.store_prefix, CHANNEL_ALERTS),
        )),
    };

    let pool = PoolManager::new(client.clone(), Arc::new(store), events.clone(), transition);
    match pool.initialize_pool().await {
        Ok(status) => tracing::info!(total = status.counts.total, "pool ready"),
        // Keep serving: the maintenance job retries reconciliation every period.
        Err(e) => tracing::error!(error = %e, "initial pool sync failed"),
    }

    // health monitor
    let monitor = HealthMonitor::new(
        pool.clone(),
        client.clone(),
        alerts.clone(),
        events.clone(),
        HealthMonitorConfig::default(),
    );
    monitor.start();

    // job-maintenance (reconcile + warm pool + idle)
    let job = Arc::new(MaintenanceJob::new(pool.clone(), alerts, events));
    tokio::spawn(async move {
        maintenance_job::run(job, MAINTENANCE_PERIOD).await;
    });

    let app = routes::create_router(AppState::new(pool.clone(), monitor.clone()));
    let listener = tokio::net::TcpListener::bind(&settings.http_bind)
        .await
        .expect("failed to bind HTTP listener");
    println!("Castpool orchestrator listening on {}", settings.http_bind);

    let shutdown_pool = pool.clone();
    let shutdown_monitor = monitor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            shutdown_monitor.stop();
            shutdown_pool.tasks().shutdown();
        })
        .await
        .expect("HTTP server failed");
}
