use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use queuedesk::coordinator::{CallOutcome, CreateTokenRequest};
use queuedesk::events::RoomHub;
use queuedesk::store::postgres::PgStore;
use queuedesk::store::redis_queue::RedisQueue;
use queuedesk::store::{ConnectionState, FastStore, Stores};
use queuedesk::{api, cli, config, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "queuedesk"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "queuedesk=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Resync) => {
            let state = connect(cfg, false).await?;
            let report = state.resync.resync().await?;
            println!(
                "Resynchronized {} counter queue(s), {} pending token(s); today's sequence at {}.",
                report.counters, report.tokens, report.daily_sequence
            );
            Ok(())
        }
        Some(cli::Commands::Counters) => {
            let state = connect(cfg, false).await?;
            print_counters(&state).await
        }
        Some(cli::Commands::Token { command }) => {
            let state = connect(cfg, false).await?;
            handle_token_command(command, &state).await
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Open both stores and build the shared state. Redis being down is not
/// fatal: the connection flag starts cleared and lifecycle writes fail fast.
async fn connect(cfg: config::Config, migrate: bool) -> anyhow::Result<AppState> {
    tracing::info!("Connecting to database...");
    let db = Arc::new(
        PgStore::connect(&cfg.database_url, cfg.store_timeout())
            .await
            .context("failed to connect to Postgres")?,
    );
    if migrate {
        tracing::info!("Running migrations...");
        db.migrate().await.context("failed to run migrations")?;
    }

    tracing::info!("Connecting to Redis...");
    let connection = ConnectionState::new(false);
    let fast = Arc::new(RedisQueue::new(&cfg.redis_url, connection.clone(), cfg.store_timeout())?);
    match fast.ping().await {
        Ok(()) => {
            connection.mark_connected();
        }
        Err(e) => tracing::warn!(error = %e, "Redis unreachable at startup, queue operations suspended"),
    }

    let stores = Stores::new(db.clone(), db, fast, connection);
    let hub = RoomHub::new(cfg.event_capacity);
    Ok(AppState::new(stores, hub, cfg))
}

async fn run_server(cfg: config::Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);
    let frontend_url = cfg.frontend_url.clone();
    let watchdog_every = cfg.watchdog_interval();

    let state = Arc::new(connect(cfg, true).await?);
    let stores = state.coordinator.stores().clone();

    if stores.connection.is_connected() {
        match state.resync.resync().await {
            Ok(report) => tracing::info!(
                counters = report.counters,
                tokens = report.tokens,
                daily_sequence = report.daily_sequence,
                "Initial queue resync complete"
            ),
            Err(e) => tracing::error!(error = %e, "Initial queue resync failed, continuing"),
        }
    }

    jobs::watchdog::spawn(stores.fast, stores.connection, state.resync.clone(), watchdog_every);
    tracing::info!(every_secs = watchdog_every.as_secs(), "Fast-store watchdog started");

    let app = api::app(state.clone())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer({
            use axum::http::{HeaderName, Method};
            use tower_http::cors::AllowOrigin;
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == frontend_url
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("x-request-id"),
                ])
                .allow_credentials(true)
        })
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("QueueDesk listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with server logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn print_counters(state: &AppState) -> anyhow::Result<()> {
    let views = state.coordinator.counters_overview().await?;
    if views.is_empty() {
        println!("No counters configured.");
        return Ok(());
    }
    println!(
        "{:<6} {:<20} {:<8} {:<8} {:<14}",
        "ID", "NAME", "OPEN", "WAITING", "SERVING"
    );
    for v in views {
        println!(
            "{:<6} {:<20} {:<8} {:<8} {:<14}",
            v.counter.counter_id,
            v.counter.name,
            v.counter.is_open,
            v.queue.len(),
            v.current.map(|t| t.display_number).unwrap_or_else(|| "-".into())
        );
    }
    Ok(())
}

async fn handle_token_command(cmd: cli::TokenCommands, state: &AppState) -> anyhow::Result<()> {
    let coordinator = &state.coordinator;
    match cmd {
        cli::TokenCommands::Create {
            service_id,
            service,
            counter_id,
        } => {
            let token = coordinator
                .create_token(CreateTokenRequest {
                    service_id,
                    service,
                    counter_id,
                })
                .await?;
            println!(
                "Token issued:\n  Number:   {}\n  ID:       {}\n  Service:  {}\n  Counter:  {}",
                token.display_number, token.token_id, token.service_name, token.counter_name
            );
        }
        cli::TokenCommands::Next { counter_id } => match coordinator.call_next(counter_id).await? {
            CallOutcome::Called(token) => println!(
                "Now serving {} ({}) at {}",
                token.summary.display_number, token.summary.token_id, token.summary.counter_name
            ),
            CallOutcome::Empty => println!("No tokens in queue."),
        },
        cli::TokenCommands::Serve { token_id } => {
            let record = coordinator.serve(&token_id).await?;
            println!("Token {} served.", record.display_number);
        }
        cli::TokenCommands::Skip { token_id } => {
            let outcome = coordinator.skip(&token_id).await?;
            println!(
                "Token {} skipped (skip count {}).",
                outcome.token.display_number, outcome.token.skip_count
            );
            if let Some(warning) = outcome.warning {
                eprintln!("Warning: {}", warning);
            }
        }
        cli::TokenCommands::Recall {
            token_id,
            counter_id,
        } => {
            let token = coordinator.recall(&token_id, counter_id).await?;
            println!(
                "Recalled {} to {}.",
                token.summary.display_number, token.summary.counter_name
            );
        }
    }
    Ok(())
}
