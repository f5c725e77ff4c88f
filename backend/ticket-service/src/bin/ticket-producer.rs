use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use ticket_service::config::ServiceConfig;
use ticket_service::monitoring::{self, Readiness, ReadinessProbe};
use ticket_service::{producer_loop, shutdown, telemetry};
use ticket_stream::{KafkaLogProducer, Publisher, StreamConfig, StreamMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    info!("Starting ticket-producer");

    let stream_config = StreamConfig::from_env().context("Failed to load stream configuration")?;
    stream_config
        .validate()
        .context("Invalid stream configuration")?;
    let service_config =
        ServiceConfig::from_env().context("Failed to load service configuration")?;
    service_config.validate()?;

    info!(
        brokers = %stream_config.kafka_brokers,
        topic = %stream_config.kafka_topic,
        rate_per_sec = service_config.produce_rate_per_sec,
        "Configuration loaded"
    );

    let registry = prometheus::default_registry().clone();
    let metrics = StreamMetrics::new(&registry, &service_config.metrics_namespace)
        .context("Failed to create stream metrics")?;

    let readiness = ReadinessProbe::default();
    let server = monitoring::start(service_config.metrics_port, registry, readiness.clone())
        .context("Failed to bind monitoring server")?;
    let server_handle = server.handle();
    actix_web::rt::spawn(server);

    let producer = KafkaLogProducer::new(&stream_config).context("Failed to create producer")?;
    let publisher =
        Publisher::new(Arc::new(producer), &stream_config.kafka_topic).with_metrics(metrics);
    readiness.set(Readiness::Ready);

    let shutdown = CancellationToken::new();
    shutdown::cancel_on_signal(shutdown.clone());

    let stats = producer_loop::run(
        &publisher,
        &stream_config.publish_retry(),
        service_config.produce_interval(),
        service_config.order_key_cardinality,
        shutdown,
    )
    .await;

    readiness.set(Readiness::NotReady);
    if let Err(e) = publisher.flush(FLUSH_TIMEOUT).await {
        warn!(error = %e, "Producer flush incomplete at shutdown");
    }
    server_handle.stop(true).await;

    info!(
        published = stats.published,
        failed = stats.failed,
        "ticket-producer stopped"
    );
    Ok(())
}
