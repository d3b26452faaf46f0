use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proctor_session::driver::{self, DriverCommand};
use proctor_session::{
    metrics, open_store, Config, HttpAssessmentClient, RemoteApis, SessionEvent, SessionRuntime,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the event stream
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "proctor_session=debug".into());

    // OpenTelemetry export only when an endpoint is configured
    let otel_layer = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        Ok(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_telemetry(endpoint)?)),
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    tracing::info!("Starting proctored session runtime");

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        "Configuration loaded for environment: {:?}",
        std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string())
    );

    let token = std::env::var("SESSION_TOKEN").context("SESSION_TOKEN must be set")?;

    let local = open_store(&config.storage).await?;
    let client = Arc::new(HttpAssessmentClient::new(&config.api)?);
    let apis = RemoteApis::from_backend(client);

    let runtime = SessionRuntime::connect(config, token, apis, local)
        .await
        .context("Failed to connect to session")?;

    let mut events = runtime.subscribe();
    if let Err(e) = runtime.start().await {
        tracing::error!("Failed to start session: {}", e);
    }
    runtime.spawn_background();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));

    // Already finished sessions never emit a terminal event again
    let mut finished = runtime.terminal_status().is_some();
    if finished {
        tracing::info!("Session is already {:?}", runtime.status());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !finished {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    finished = matches!(
                        event,
                        SessionEvent::SessionTerminated { .. } | SessionEvent::Fatal { .. }
                    );
                    let _ = out_tx.send(event.to_json());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event stream lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let _ = out_tx.send(handle_line(&runtime, &line).await);
                }
                None => {
                    tracing::info!("Input closed, checkpointing drafts");
                    runtime.checkpoint().await;
                    break;
                }
            },
        }
    }

    runtime.shutdown();

    if std::env::var("METRICS_DUMP").map(|v| v == "1").unwrap_or(false) {
        match metrics::render_metrics() {
            Ok(text) => eprintln!("{}", text),
            Err(e) => tracing::warn!("Failed to render metrics: {}", e),
        }
    }

    drop(out_tx);
    writer.await?;

    shutdown_telemetry();
    Ok(())
}

async fn handle_line(runtime: &SessionRuntime, line: &str) -> String {
    let result = match DriverCommand::parse(line) {
        Ok(command) => driver::apply(runtime, command).await,
        Err(e) => Err(e),
    };
    let response = match result {
        Ok(body) => serde_json::json!({ "type": "response", "ok": true, "body": body }),
        Err(e) => serde_json::json!({
            "type": "response",
            "ok": false,
            "error": e.to_string(),
            "kind": e.kind(),
        }),
    };
    response.to_string()
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            break;
        }
    }
}

fn init_telemetry(otlp_endpoint: String) -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(otlp_endpoint)
        .build()
        .context("Failed to create OTLP exporter")?;

    let resource = Resource::builder_empty()
        .with_service_name("proctor-session")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer("proctor-session");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(tracer)
}

fn shutdown_telemetry() {
    tracing::info!("Shutting down OpenTelemetry");
    // In opentelemetry 0.31, shutdown is handled by dropping the provider
}
