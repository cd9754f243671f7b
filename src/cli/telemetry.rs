use anyhow::{anyhow, Context, Result};
use base64ct::{Base64, Encoding};
use once_cell::sync::OnceCell;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{SdkTracerProvider, Tracer},
    Resource,
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{debug, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use ulid::Ulid;
use url::Url;

use crate::cli::commands::logging::LogFormat;

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where spans go, read from `OTEL_EXPORTER_OTLP_ENDPOINT` and `OTEL_EXPORTER_OTLP_HEADERS`.
struct Collector {
    endpoint: String,
    tls_domain: Option<String>,
    metadata: MetadataMap,
}

impl Collector {
    fn from_env() -> Result<Option<Self>> {
        let Ok(endpoint) = var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
            return Ok(None);
        };
        let headers = var("OTEL_EXPORTER_OTLP_HEADERS").unwrap_or_default();
        Self::new(&endpoint, &headers).map(Some)
    }

    /// Schemeless endpoints are treated as TLS.
    fn new(endpoint: &str, headers: &str) -> Result<Self> {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint.trim_end_matches('/'))
        };
        let parsed = Url::parse(&endpoint)
            .with_context(|| format!("invalid collector endpoint {endpoint}"))?;
        let tls_domain = (parsed.scheme() == "https")
            .then(|| parsed.host_str().map(str::to_string))
            .flatten();

        Ok(Self {
            endpoint,
            tls_domain,
            metadata: metadata_from_headers(headers)?,
        })
    }
}

/// `key=value` pairs separated by commas; pairs without `=` are skipped. Keys ending in `-bin`
/// carry base64 values and become binary metadata.
fn metadata_from_headers(headers: &str) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::new();
    for (key, value) in headers
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim()))
    {
        if key.ends_with("-bin") {
            let bytes = Base64::decode_vec(value)
                .map_err(|e| anyhow!("failed to base64-decode value for key {key}: {e}"))?;
            let key = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                .map_err(|e| anyhow!("invalid binary metadata key {key}: {e}"))?;
            metadata.insert_bin(key, MetadataValue::from_bytes(&bytes));
        } else {
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|e| anyhow!("invalid metadata value for key {key}: {e}"))?;
            let key = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                .map_err(|e| anyhow!("invalid metadata key {key}: {e}"))?;
            metadata.insert(key, value);
        }
    }
    Ok(metadata)
}

fn tracer(collector: Collector) -> Result<Tracer> {
    let mut exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&collector.endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT)
        .with_metadata(collector.metadata);
    if let Some(domain) = collector.tls_domain {
        exporter = exporter.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain)
                .with_native_roots(),
        );
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter.build()?)
        .with_resource(
            Resource::builder_empty()
                .with_attributes([
                    KeyValue::new("service.name", env!("CARGO_PKG_NAME")),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.instance.id", Ulid::new().to_string()),
                ])
                .build(),
        )
        .build();

    if TRACER_PROVIDER.set(provider.clone()).is_err() {
        warn!("Tracer provider already installed");
    }
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(provider.tracer(env!("CARGO_PKG_NAME")))
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer().with_target(false);
    match format {
        LogFormat::Pretty => layer
            .with_file(false)
            .with_line_number(false)
            .pretty()
            .boxed(),
        LogFormat::Json => layer.json().flatten_event(true).boxed(),
    }
}

fn env_filter(verbosity_level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(verbosity_level.into())
        .from_env_lossy();
    for directive in ["hyper=error", "tokio=error", "sqlx=warn", "opentelemetry_sdk=warn"] {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. Spans are also exported over OTLP/gRPC when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// # Errors
///
/// Returns an error if the collector settings are invalid or a subscriber is already set.
pub fn init(verbosity_level: Option<Level>, format: LogFormat) -> Result<()> {
    let filter = env_filter(verbosity_level.unwrap_or(Level::ERROR))?;
    let otel = Collector::from_env()?
        .map(tracer)
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let subscriber = Registry::default()
        .with(fmt_layer(format))
        .with(otel)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Flush and stop the span exporter, if one was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("Shutting down tracer provider");
        if let Err(err) = provider.shutdown() {
            warn!("Failed to flush spans on shutdown: {err}");
        }
    }
}
