use anyhow::{bail, Context, Result};
use mqtt_relay::api::{start_api_server, AppState};
use mqtt_relay::aws::{load_sdk_config, S3ObjectStore, SnsNotifications, SqsQueue};
use mqtt_relay::notifier::{provision_topic, subscribe_email};
use mqtt_relay::store::resolve_bucket;
use mqtt_relay::{Config, DurableStore, Notifier, QueueConsumer, Relay, StoreTarget, SystemClock};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const USAGE: &str = "usage: mqtt-relay [serve|provision|topology]";

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let mode = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());

    match mode.as_str() {
        "serve" => serve(config).await,
        "provision" => provision(config).await,
        "topology" => print_topology(config).await,
        other => bail!("unknown mode '{}', {}", other, USAGE),
    }
}

/// Run the queue consumer and invoke API until a shutdown signal arrives
async fn serve(config: Config) -> Result<()> {
    info!(
        service = %config.service.name,
        "Starting MQTT relay"
    );

    config
        .topology
        .validate(&config.store, &config.queue)
        .context("Deployment topology violates the relay contract")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let sdk_config = load_sdk_config(&config.aws).await;
    let clock = Arc::new(SystemClock);

    let store = Arc::new(
        DurableStore::new(
            Arc::new(S3ObjectStore::new(&sdk_config, &config.aws)),
            &config.store,
            clock.clone(),
        )
        .await,
    );

    let notifier = Arc::new(
        Notifier::new(
            Arc::new(SnsNotifications::new(&sdk_config)),
            &config.alerts,
            clock,
        )
        .await,
    );

    let relay = Arc::new(Relay::new(store, notifier, config.alerts.failure_policy));
    let shutdown = CancellationToken::new();

    // Spawn queue consumer task
    let consumer_handle = match config.queue.url.clone() {
        Some(queue_url) => {
            let consumer = QueueConsumer::new(
                Arc::new(SqsQueue::new(&sdk_config, queue_url, config.aws.region.clone())),
                relay.clone(),
                config.queue.clone(),
                shutdown.clone(),
            );

            Some(tokio::spawn(async move {
                if let Err(e) = consumer.run().await {
                    error!(error = %e, "Queue consumer error");
                }
            }))
        }
        None => {
            warn!("No queue URL configured, relaying through the invoke API only");
            None
        }
    };

    // Spawn API server task
    let api_state = AppState { relay };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("MQTT relay started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down MQTT relay");

    shutdown.cancel();
    if let Some(handle) = consumer_handle {
        // In-flight messages finish before the consumer observes cancellation
        if let Err(e) = handle.await {
            error!(error = %e, "Queue consumer task failed");
        }
    }
    api_handle.abort();

    info!("MQTT relay stopped");

    Ok(())
}

/// Create the alert topic if it is missing and subscribe the operator address
async fn provision(config: Config) -> Result<()> {
    let sdk_config = load_sdk_config(&config.aws).await;
    let api = SnsNotifications::new(&sdk_config);

    let topic_arn = provision_topic(&api, &config.alerts.topic_name)
        .await
        .context("Failed to provision alert topic")?;

    match config.topology.email.target.as_deref() {
        Some(address) => subscribe_email(&api, &topic_arn, address)
            .await
            .context("Failed to subscribe alert email")?,
        None => info!("No alert email configured, skipping subscription"),
    }

    println!("{}", topic_arn);
    Ok(())
}

/// Validate the deployment topology and print it with the derived crawler values
async fn print_topology(config: Config) -> Result<()> {
    config
        .topology
        .validate(&config.store, &config.queue)
        .context("Deployment topology violates the relay contract")?;

    let bucket = match config.store.bucket.clone() {
        Some(bucket) => Some(bucket),
        None => {
            let sdk_config = load_sdk_config(&config.aws).await;
            let api = S3ObjectStore::new(&sdk_config, &config.aws);
            match resolve_bucket(&api, &config.store).await {
                StoreTarget::Bucket(bucket) => Some(bucket),
                StoreTarget::Unresolved => None,
            }
        }
    };

    let crawler_target = bucket
        .as_deref()
        .map(|bucket| config.topology.crawler.target(bucket, &config.store));

    let report = serde_json::json!({
        "source_topic": config.topology.routing_rule.source_topic(),
        "bucket": bucket,
        "crawler_target": crawler_target,
        "crawler_interval_secs": config.topology.crawler.interval().map(|d| d.as_secs()),
        "topology": config.topology,
    });

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to render topology")?
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
