use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::{KeyValue, trace::TraceId};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(meter: &Meter, controller_names: &[&'static str]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, meter))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();

        Self { controllers }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    controller: String,
    pub reconcile: ReconcileMetrics,
    status_update_errors: Counter<u64>,
    status_conflicts: Counter<u64>,
    identity_requests: Counter<u64>,
    triggered: Counter<u64>,
    ready: Gauge<i64>,
}

impl ControllerMetrics {
    pub fn new(controller: &str, meter: &Meter) -> Self {
        let reconcile = ReconcileMetrics::new(meter);

        let status_update_errors = meter
            .u64_counter("status_update_errors")
            .with_description(
                "Number of errors that occurred during update operations to status subresources",
            )
            .build();

        let status_conflicts = meter
            .u64_counter("status_update_conflicts")
            .with_description("Number of status updates rejected because of a stale resourceVersion")
            .build();

        let identity_requests = meter
            .u64_counter("identity_requests")
            .with_description("Number of requests sent to the identity service by operation and result")
            .build();

        let triggered = meter
            .u64_counter("triggered")
            .with_description("Number of times a watched Kubernetes object triggered a reconcile")
            .build();

        let ready = meter
            .i64_gauge("ready")
            .with_description("1 when the controller is ready to reconcile resources, 0 otherwise")
            .build();

        Self {
            controller: controller.to_string(),
            reconcile,
            status_update_errors,
            status_conflicts,
            identity_requests,
            triggered,
            ready,
        }
    }

    fn controller_label(&self) -> KeyValue {
        KeyValue::new("controller", self.controller.clone())
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile.failures.add(1, &[self.controller_label()]);
    }

    pub fn reconcile_count_and_measure(&self, _trace_id: &TraceId) -> ReconcileMeasurer {
        self.reconcile.operations.add(1, &[self.controller_label()]);
        ReconcileMeasurer {
            start: Instant::now(),
            controller: self.controller.clone(),
            metric: self.reconcile.duration.clone(),
        }
    }

    pub fn status_update_errors_inc(&self) {
        self.status_update_errors.add(1, &[self.controller_label()]);
    }

    pub fn status_conflicts_inc(&self) {
        self.status_conflicts.add(1, &[self.controller_label()]);
    }

    pub fn identity_request_inc(&self, operation: &'static str, success: bool) {
        self.identity_requests.add(
            1,
            &[
                self.controller_label(),
                KeyValue::new("operation", operation),
                KeyValue::new("result", if success { "success" } else { "error" }),
            ],
        );
    }

    pub fn triggered_inc(&self, triggered_by: &str) {
        self.triggered.add(
            1,
            &[
                self.controller_label(),
                KeyValue::new("triggered_by", triggered_by.to_string()),
            ],
        );
    }

    pub fn ready_set(&self, status: i64) {
        self.ready.record(status, &[self.controller_label()]);
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub operations: Counter<u64>,
    pub failures: Counter<u64>,
    pub duration: Histogram<f64>,
}

impl ReconcileMetrics {
    pub fn new(meter: &Meter) -> Self {
        let operations = meter
            .u64_counter("reconcile_operations")
            .with_description("Total number of reconcile operations")
            .build();

        let failures = meter
            .u64_counter("reconcile_failures")
            .with_description("Number of errors that occurred during reconcile operations")
            .build();

        let duration = meter
            .f64_histogram("reconcile_duration_seconds")
            .with_description("Histogram of reconcile operations")
            .with_boundaries(vec![0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0])
            .build();

        Self {
            operations,
            failures,
            duration,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: Histogram<f64>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.record(
            duration,
            &[KeyValue::new("controller", self.controller.clone())],
        );
    }
}
