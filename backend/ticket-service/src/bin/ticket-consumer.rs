use anyhow::{Context, Result};
use ticket_service::config::ServiceConfig;
use ticket_service::consumer_loop::ConsumerLoop;
use ticket_service::monitoring::{self, ReadinessProbe};
use ticket_service::ticket::TicketHandler;
use ticket_service::{shutdown, telemetry};
use ticket_stream::{IdempotentHandler, KafkaGroupConsumer, StreamConfig, StreamMetrics};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[actix_web::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    info!("Starting ticket-consumer");

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
        group_id = %stream_config.kafka_group_id,
        commit_policy = ?stream_config.commit_policy,
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

    let shutdown = CancellationToken::new();
    shutdown::cancel_on_signal(shutdown.clone());

    let handler = IdempotentHandler::new(TicketHandler).with_metrics(metrics.clone());
    let consumer_loop = ConsumerLoop {
        topic: &stream_config.kafka_topic,
        member: stream_config.member_config(),
        backoff: service_config.reconnect_backoff(),
        readiness,
        metrics: Some(metrics),
    };

    let result = consumer_loop
        .run(|| KafkaGroupConsumer::new(&stream_config), &handler, shutdown)
        .await;

    server_handle.stop(true).await;
    result.context("Consumer failed")?;

    info!("ticket-consumer stopped");
    Ok(())
}
