use std::net::SocketAddr;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio::time::Duration;

pub use elasticsearch_operator::{self, telemetry, ControllerConfig, Metrics, State};
use telemetry::TelemetryConfig;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Only manage Clusters in this namespace
    #[arg(long = "namespace", env = "WATCH_NAMESPACE", value_name = "NAMESPACE")]
    namespace: Option<String>,

    #[arg(long = "workers", env = "WORKERS", default_value_t = 1)]
    workers: usize,

    #[arg(long = "max-retries", env = "MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    #[arg(
        long = "cache-sync-timeout-secs",
        env = "CACHE_SYNC_TIMEOUT_SECS",
        default_value_t = 60
    )]
    cache_sync_timeout_secs: u64,

    /// Re-apply derived objects that no longer match their Cluster
    #[arg(
        long = "drift-correction",
        env = "DRIFT_CORRECTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    drift_correction: bool,

    #[arg(long = "listen", env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Log filter directives, used when RUST_LOG is unset
    #[arg(long = "log-filter", env = "LOG_FILTER", default_value = "info")]
    log_filter: String,

    #[arg(long = "log-json", env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// OTLP collector to export spans to
    #[arg(long = "otlp-endpoint", env = "OPENTELEMETRY_ENDPOINT_URL")]
    otlp_endpoint: Option<String>,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();

    telemetry::init(&TelemetryConfig {
        default_filter: args.log_filter,
        json: args.log_json,
        otlp_endpoint: args.otlp_endpoint,
        ..TelemetryConfig::default()
    })?;

    let config = ControllerConfig {
        namespace: args.namespace,
        workers: args.workers,
        max_retries: args.max_retries,
        cache_sync_timeout: Duration::from_secs(args.cache_sync_timeout_secs),
        drift_correction: args.drift_correction,
    };

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let controller_metrics = Metrics::default().register(&state.registry)?;
    let client = kube::Client::try_default().await?;

    // Start web server
    let server_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(args.listen)?
    .shutdown_timeout(5)
    .disable_signals()
    .run();
    let server_handle = server.handle();
    let server = tokio::spawn(server);

    let result = elasticsearch_operator::run(client, controller_metrics, state, config).await;

    server_handle.stop(true).await;
    server.await??;
    Ok(result?)
}
