use std::fmt::Write;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::error::OTelSdkError;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;

/// Push exporter keeping the last collected metrics rendered in Prometheus text format.
///
/// Registered in a `PeriodicReader`; the `/metrics` endpoint serves the last snapshot.
#[derive(Clone, Default)]
pub struct PrometheusExporter {
    snapshot: Arc<Mutex<Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<String> {
        lock(&self.snapshot).clone()
    }

    fn render(metrics: &ResourceMetrics) -> String {
        let mut out = String::new();
        for scope in metrics.scope_metrics() {
            for metric in scope.metrics() {
                let name = format!("{}_{}", scope.scope().name(), metric.name());
                let _ = writeln!(out, "# HELP {name} {}", metric.description());
                match metric.data() {
                    AggregatedMetrics::F64(data) => render_data(&mut out, &name, data, |v| v),
                    AggregatedMetrics::U64(data) => {
                        render_data(&mut out, &name, data, |v| v as f64)
                    }
                    AggregatedMetrics::I64(data) => {
                        render_data(&mut out, &name, data, |v| v as f64)
                    }
                }
            }
        }
        let _ = writeln!(out, "# EOF");
        out
    }
}

fn render_data<T: Copy>(out: &mut String, name: &str, data: &MetricData<T>, to_f64: fn(T) -> f64) {
    match data {
        MetricData::Sum(sum) => {
            let _ = writeln!(out, "# TYPE {name} counter");
            for point in sum.data_points() {
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}{labels} {}", to_f64(point.value()));
            }
        }
        MetricData::Gauge(gauge) => {
            let _ = writeln!(out, "# TYPE {name} gauge");
            for point in gauge.data_points() {
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}{labels} {}", to_f64(point.value()));
            }
        }
        MetricData::Histogram(histogram) => {
            let _ = writeln!(out, "# TYPE {name} histogram");
            for point in histogram.data_points() {
                let bounds: Vec<f64> = point.bounds().collect();
                let mut cumulative = 0u64;
                for (i, count) in point.bucket_counts().enumerate() {
                    cumulative += count;
                    let le = bounds
                        .get(i)
                        .map_or_else(|| "+Inf".to_string(), |b| b.to_string());
                    let labels = format_labels(point.attributes(), Some(&le));
                    let _ = writeln!(out, "{name}_bucket{labels} {cumulative}");
                }
                let labels = format_labels(point.attributes(), None);
                let _ = writeln!(out, "{name}_sum{labels} {}", to_f64(point.sum()));
                let _ = writeln!(out, "{name}_count{labels} {}", point.count());
            }
        }
        MetricData::ExponentialHistogram(_) => {}
    }
}

/// Render attributes as Prometheus labels, with an optional histogram `le` label last.
fn format_labels<'a>(attrs: impl Iterator<Item = &'a KeyValue>, le: Option<&str>) -> String {
    let mut labels: Vec<String> = attrs
        .map(|kv| format!("{}=\"{}\"", kv.key.as_str(), kv.value))
        .collect();
    if let Some(le) = le {
        labels.push(format!("le=\"{le}\""));
    }
    if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels.join(","))
    }
}

impl PushMetricExporter for PrometheusExporter {
    async fn export(&self, metrics: &ResourceMetrics) -> Result<(), OTelSdkError> {
        *lock(&self.snapshot) = Some(Self::render(metrics));
        Ok(())
    }

    fn force_flush(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> Result<(), OTelSdkError> {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

static GLOBAL_EXPORTER: OnceLock<PrometheusExporter> = OnceLock::new();

/// Register the exporter served by [`format_prometheus_metrics`]. Only the first call wins.
pub fn set_global_exporter(exporter: PrometheusExporter) {
    let _ = GLOBAL_EXPORTER.set(exporter);
}

pub fn format_prometheus_metrics() -> Result<String, String> {
    GLOBAL_EXPORTER
        .get()
        .ok_or_else(|| "prometheus exporter not initialized".to_string())?
        .snapshot()
        .ok_or_else(|| "no metrics collected yet".to_string())
}

#[cfg(test)]
mod tests {
    use super::{PrometheusExporter, format_labels};

    use opentelemetry::KeyValue;
    use opentelemetry::metrics::{Meter, MeterProvider};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

    fn provider() -> (SdkMeterProvider, PrometheusExporter, Meter) {
        let exporter = PrometheusExporter::new();
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(std::time::Duration::from_millis(50))
            .build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let meter = provider.meter("pixop");
        (provider, exporter, meter)
    }

    async fn wait_for_export() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_counter_and_gauge_export() {
        let (_provider, exporter, meter) = provider();
        meter
            .u64_counter("reconcile_operations")
            .with_description("Total number of reconcile operations")
            .build()
            .add(3, &[KeyValue::new("controller", "service-account")]);
        meter
            .i64_gauge("ready")
            .build()
            .record(1, &[KeyValue::new("controller", "service-account")]);

        wait_for_export().await;

        let text = exporter.snapshot().expect("metrics exported");
        assert!(text.contains("# TYPE pixop_reconcile_operations counter"));
        assert!(text.contains(r#"pixop_reconcile_operations{controller="service-account"} 3"#));
        assert!(text.contains("# TYPE pixop_ready gauge"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[tokio::test]
    async fn test_histogram_export() {
        let (_provider, exporter, meter) = provider();
        let histogram = meter
            .f64_histogram("reconcile_duration_seconds")
            .with_boundaries(vec![0.5, 1.0])
            .build();
        histogram.record(0.2, &[]);
        histogram.record(0.7, &[]);

        wait_for_export().await;

        let text = exporter.snapshot().expect("metrics exported");
        assert!(text.contains(r#"pixop_reconcile_duration_seconds_bucket{le="0.5"} 1"#));
        assert!(text.contains(r#"pixop_reconcile_duration_seconds_bucket{le="+Inf"} 2"#));
        assert!(text.contains("pixop_reconcile_duration_seconds_count 2"));
    }

    #[test]
    fn test_format_labels() {
        let empty: [KeyValue; 0] = [];
        assert_eq!(format_labels(empty.iter(), None), "");
        let attrs = [KeyValue::new("a", "1"), KeyValue::new("b", "2")];
        assert_eq!(format_labels(attrs.iter(), None), r#"{a="1",b="2"}"#);
        assert_eq!(
            format_labels(attrs.iter(), Some("+Inf")),
            r#"{a="1",b="2",le="+Inf"}"#
        );
    }
}
