//! HTTP endpoints for scraping and orchestration probes.
//!
//! - `GET /metrics`: prometheus text format
//! - `GET /health`: liveness, always `OK` while the process serves requests
//! - `GET /ready`: 200 once the process can do its work, 503 otherwise

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use parking_lot::RwLock;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;
use ticket_stream::MemberState;
use tokio::sync::watch;

/// What readiness is currently derived from.
#[derive(Debug, Clone)]
pub enum Readiness {
    NotReady,
    Ready,
    /// Ready while the group member holds partitions
    Member(watch::Receiver<MemberState>),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        match self {
            Readiness::NotReady => false,
            Readiness::Ready => true,
            Readiness::Member(state) => state.borrow().is_ready(),
        }
    }
}

/// Shared, swappable readiness source. Each consume attempt installs the
/// signal of its own member.
#[derive(Clone)]
pub struct ReadinessProbe {
    current: Arc<RwLock<Readiness>>,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            current: Arc::new(RwLock::new(Readiness::NotReady)),
        }
    }
}

impl ReadinessProbe {
    pub fn set(&self, readiness: Readiness) {
        *self.current.write() = readiness;
    }

    pub fn is_ready(&self) -> bool {
        self.current.read().is_ready()
    }
}

pub struct MonitoringState {
    pub registry: Registry,
    pub readiness: ReadinessProbe,
}

async fn metrics(state: web::Data<MonitoringState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

async fn ready(state: web::Data<MonitoringState>) -> HttpResponse {
    if state.readiness.is_ready() {
        HttpResponse::Ok().body("READY")
    } else {
        HttpResponse::ServiceUnavailable().body("NOT READY")
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics))
        .route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready));
}

/// Bind the monitoring server. The returned server must be spawned and is
/// stopped through its handle; it does not react to process signals itself.
pub fn start(port: u16, registry: Registry, readiness: ReadinessProbe) -> std::io::Result<Server> {
    let state = web::Data::new(MonitoringState {
        registry,
        readiness,
    });

    tracing::info!("Starting monitoring server on 0.0.0.0:{}", port);

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();
    Ok(server)
}
