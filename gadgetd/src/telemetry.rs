//! OpenTelemetry metrics export module
//!
//! Exports tracer manager counters to an OpenTelemetry Collector.
//!
//! ## OTLP Endpoint Priority
//! 1. `OTEL_EXPORTER_OTLP_ENDPOINT` environment variable
//! 2. `otel_exporter_otlp_endpoint` from the settings file
//! 3. Not set: metrics are disabled and every `record_*` helper is a no-op

use anyhow::{Context, Result};
use log::info;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::event::GadgetKind;

/// Metric export interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

/// Global metrics handle
static METRICS: OnceLock<GadgetMetrics> = OnceLock::new();

/// Global MeterProvider for graceful shutdown
static METER_PROVIDER: OnceLock<SdkMeterProvider> = OnceLock::new();

/// Installed probe filters (for ObservableGauge callback)
static INSTALLED_PROBES: AtomicU64 = AtomicU64::new(0);

/// gadgetd metrics collection
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
pub struct GadgetMetrics {
    pub attributed_events: Counter<u64>,
    pub unattributed_events: Counter<u64>,
    pub malformed_events: Counter<u64>,
    pub dropped_deliveries: Counter<u64>,
    pub probe_installs: Counter<u64>,
    pub probe_uninstalls: Counter<u64>,
    pub sessions_created: Counter<u64>,
}

impl GadgetMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            attributed_events: meter
                .u64_counter("attributed_events")
                .with_description("Events resolved to a known container")
                .with_unit("events")
                .build(),
            unattributed_events: meter
                .u64_counter("unattributed_events")
                .with_description("Events whose mount namespace is not registered")
                .with_unit("events")
                .build(),
            malformed_events: meter
                .u64_counter("malformed_events")
                .with_description("Kernel records that could not be decoded")
                .with_unit("events")
                .build(),
            dropped_deliveries: meter
                .u64_counter("dropped_deliveries")
                .with_description("Events evicted from a full session buffer")
                .with_unit("events")
                .build(),
            probe_installs: meter
                .u64_counter("probe_installs")
                .with_description("Namespace probe filters installed")
                .with_unit("probes")
                .build(),
            probe_uninstalls: meter
                .u64_counter("probe_uninstalls")
                .with_description("Namespace probe filters removed")
                .with_unit("probes")
                .build(),
            sessions_created: meter
                .u64_counter("sessions_created")
                .with_description("Tracer sessions created")
                .with_unit("sessions")
                .build(),
        }
    }
}

/// Priority:
/// 1. OTEL_EXPORTER_OTLP_ENDPOINT environment variable
/// 2. The configured fallback
fn get_otlp_endpoint(fallback: Option<&str>) -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .filter(|e| !e.is_empty())
        .or_else(|| fallback.filter(|e| !e.is_empty()).map(str::to_string))?;

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}

/// Initialize OpenTelemetry metrics provider
///
/// Configures metrics export to OTLP Collector via gRPC.
/// Skips initialization if no endpoint is configured.
pub fn init_metrics(configured_endpoint: Option<&str>) -> Result<()> {
    let endpoint = match get_otlp_endpoint(configured_endpoint) {
        Some(ep) => ep,
        None => {
            info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metrics export disabled.");
            return Ok(());
        }
    };

    info!("Initializing OpenTelemetry metrics exporter");
    info!("OTLP endpoint: {}", endpoint);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
        .build();

    let resource = Resource::default().merge(&Resource::new(vec![
        KeyValue::new("service.name", "gadgetd"),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ]));

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    let _ = METER_PROVIDER.set(provider);

    let meter = global::meter("gadgetd");

    let _installed_probes_gauge = meter
        .u64_observable_gauge("installed_probes")
        .with_description("Number of mount namespaces with an installed probe filter")
        .with_unit("probes")
        .with_callback(|observer| {
            observer.observe(INSTALLED_PROBES.load(Ordering::Relaxed), &[]);
        })
        .build();

    let _ = METRICS.set(GadgetMetrics::new(&meter));

    info!("OpenTelemetry metrics initialized successfully");
    Ok(())
}

pub fn metrics() -> Option<&'static GadgetMetrics> {
    METRICS.get()
}

pub fn record_attributed_event(kind: GadgetKind) {
    if let Some(m) = metrics() {
        m.attributed_events
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

pub fn record_unattributed_event() {
    if let Some(m) = metrics() {
        m.unattributed_events.add(1, &[]);
    }
}

pub fn record_malformed_event() {
    if let Some(m) = metrics() {
        m.malformed_events.add(1, &[]);
    }
}

pub fn record_delivery_dropped() {
    if let Some(m) = metrics() {
        m.dropped_deliveries.add(1, &[]);
    }
}

pub fn record_probe_installed() {
    INSTALLED_PROBES.fetch_add(1, Ordering::Relaxed);
    if let Some(m) = metrics() {
        m.probe_installs.add(1, &[]);
    }
}

pub fn record_probe_uninstalled() {
    // Saturating: a failed uninstall is still counted as gone.
    let _ = INSTALLED_PROBES.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
        Some(n.saturating_sub(1))
    });
    if let Some(m) = metrics() {
        m.probe_uninstalls.add(1, &[]);
    }
}

pub fn record_session_created(kind: GadgetKind) {
    if let Some(m) = metrics() {
        m.sessions_created
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

/// Shutdown OpenTelemetry (graceful shutdown)
/// Flushes pending metrics and shuts down the MeterProvider
pub fn shutdown_metrics() {
    info!("Shutting down OpenTelemetry metrics...");
    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            log::warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}
