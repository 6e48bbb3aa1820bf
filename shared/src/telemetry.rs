use anyhow::Result;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::{
    resource::{SERVICE_NAME, SERVICE_VERSION},
    SCHEMA_URL,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::get_optional_env;

pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub environment: String,
    pub service_version: String,
    pub json_logs: bool,
}

impl TelemetryConfig {
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            environment: get_optional_env("OTEL_DEPLOYMENT_ENVIRONMENT", "development"),
            service_version: get_optional_env("SERVICE_VERSION", env!("CARGO_PKG_VERSION")),
            json_logs: get_optional_env("LOG_FORMAT", "json") != "pretty",
        }
    }
}

fn build_tracer_provider(config: &TelemetryConfig) -> Result<TracerProvider> {
    let resource = Resource::from_schema_url(
        [
            KeyValue::new(SERVICE_NAME, config.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
            KeyValue::new("deployment.environment", config.environment.clone()),
        ],
        SCHEMA_URL,
    );

    let builder = TracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default());

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(10))
                .build()?;
            builder
                .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
                .build()
        }
        None => builder.build(),
    };

    Ok(provider)
}

/// Installs the global subscriber: an OpenTelemetry layer (exporting only when
/// an OTLP endpoint is configured) plus a fmt layer filtered by `RUST_LOG`.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let tracer_provider = build_tracer_provider(&config)?;
    global::set_tracer_provider(tracer_provider.clone());

    let tracer = tracer_provider.tracer(config.service_name.clone());
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("sqlx=warn".parse()?)
        .add_directive("hyper=info".parse()?)
        .add_directive("reqwest=info".parse()?)
        .add_directive("tower_http=info".parse()?);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false);
    let fmt_layer = if config.json_logs {
        fmt_layer.json().with_filter(env_filter).boxed()
    } else {
        fmt_layer.pretty().with_filter(env_filter).boxed()
    };

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(fmt_layer)
        .init();

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        otlp_endpoint = ?config.otlp_endpoint,
        "Telemetry initialized"
    );

    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::info!("Shutting down telemetry");
    global::shutdown_tracer_provider();
}

pub mod middleware {
    use axum::{extract::Request, middleware::Next, response::Response};
    use opentelemetry::{
        global,
        trace::{SpanKind, TraceContextExt, Tracer},
        Context,
    };
    use opentelemetry_http::HeaderExtractor;
    use tracing::Instrument;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    /// Opens a server span per request, continuing any trace context the
    /// caller (e.g. the Pub/Sub push endpoint) propagated in headers.
    pub async fn trace_layer(mut request: Request, next: Next) -> Response {
        let parent_context = global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor(request.headers()))
        });

        let tracer = global::tracer("txmail-http");
        let span_builder = tracer
            .span_builder(format!("{} {}", request.method(), request.uri().path()))
            .with_kind(SpanKind::Server);
        let otel_span = tracer.build_with_context(span_builder, &parent_context);
        let context = Context::current_with_span(otel_span);

        let tracing_span = tracing::info_span!(
            "http_request",
            method = %request.method(),
            path = %request.uri().path(),
        );
        tracing_span.set_parent(context.clone());

        let request_id = context.span().span_context().trace_id().to_string();
        request.extensions_mut().insert(request_id.clone());

        let started = std::time::Instant::now();
        let response = next.run(request).instrument(tracing_span.clone()).await;

        tracing_span.in_scope(|| {
            tracing::info!(
                status = response.status().as_u16(),
                request_id = %request_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request completed"
            );
        });

        response
    }
}

pub mod http_client {
    use axum::http::HeaderMap;
    use opentelemetry::global;
    use opentelemetry_http::HeaderInjector;
    use reqwest::RequestBuilder;
    use tracing::Span;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    /// Propagates the current span's trace context to downstream services.
    pub trait RequestBuilderExt {
        fn with_trace_context(self) -> Self;
    }

    impl RequestBuilderExt for RequestBuilder {
        fn with_trace_context(mut self) -> Self {
            let context = Span::current().context();
            let mut headers = HeaderMap::new();
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&context, &mut HeaderInjector(&mut headers));
            });

            for (key, value) in headers.iter() {
                self = self.header(key.clone(), value.clone());
            }
            self
        }
    }
}
