use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

/// Keeps the exporters alive.  Dropping the guard flushes whatever spans and metrics are still
/// buffered, which matters for a process that exits as soon as its run is done.
#[derive(Debug, Default)]
pub struct OtelGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Some(tracer_provider) = self.tracer_provider.take() {
            if let Err(err) = tracer_provider.shutdown() {
                eprintln!("could not flush spans: {err}");
            }
        }
        if let Some(meter_provider) = self.meter_provider.take() {
            if let Err(err) = meter_provider.shutdown() {
                eprintln!("could not flush metrics: {err}");
            }
        }
    }
}

/// Install the global subscriber.  Logs always go to stdout in bunyan format; spans and metrics
/// are exported over OTLP only when `otel_endpoint` is set.  Must be called from within a tokio
/// runtime.
pub fn init_otel_tracing(service_name: &str, otel_endpoint: Option<&str>) -> OtelGuard {
    let mut guard = OtelGuard::default();
    let exporter_layer = match otel_endpoint {
        Some(otel_endpoint) => match build_exporters(service_name, otel_endpoint) {
            Ok((tracer_provider, meter_provider)) => {
                let tracer = tracer_provider.tracer(service_name.to_string());
                global::set_meter_provider(meter_provider.clone());
                guard.tracer_provider = Some(tracer_provider);
                guard.meter_provider = Some(meter_provider);
                // Export everything at INFO and above.  The backend filters at its end.
                Some(
                    tracing_opentelemetry::OpenTelemetryLayer::new(tracer)
                        .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
                )
            }
            Err(err) => {
                eprintln!("not exporting to {otel_endpoint}: {err}");
                None
            }
        },
        None => None,
    };
    let stdout_layer = BunyanFormattingLayer::new(service_name.to_string(), std::io::stdout)
        .with_filter(tracing_subscriber::filter::LevelFilter::INFO);
    // Everything from burst_load passes the global filter; other crates only report errors.
    let global_layer = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or("error,burst_load=trace".to_string()),
    );

    let subscriber = tracing_subscriber::registry()
        .with(global_layer)
        .with(stdout_layer)
        .with(exporter_layer);
    global::set_text_map_propagator(TraceContextPropagator::new());
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("could not set global subscriber for {service_name}: {err}");
        return guard;
    }
    tracing::info!(
        service_name,
        otel_endpoint = otel_endpoint.unwrap_or("none"),
        "registered subscriber"
    );

    // Add panics to tracing
    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();

        #[allow(clippy::manual_map)]
        let payload = if let Some(s) = payload.downcast_ref::<&str>() {
            Some(&**s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Some(s.as_str())
        } else {
            None
        };

        tracing::error!(
            panic.payload = payload,
            panic.location = panic_info.location().map(|l| l.to_string()),
            panic.backtrace = tracing::field::display(std::backtrace::Backtrace::capture()),
            "A panic occurred"
        );

        prev_hook(panic_info);
    }));
    guard
}

fn build_exporters(
    service_name: &str,
    otel_endpoint: &str,
) -> Result<(TracerProvider, SdkMeterProvider), Box<dyn std::error::Error>> {
    let resource = opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
        "service.name",
        service_name.to_string(),
    )]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otel_endpoint)
        .build()?;
    let trace_config = opentelemetry_sdk::trace::Config::default().with_resource(resource.clone());
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(trace_config)
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(
            std::env::var("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT")
                .unwrap_or(otel_endpoint.to_string()),
        )
        .build()?;
    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        metric_exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .build();
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();
    Ok((tracer_provider, meter_provider))
}
