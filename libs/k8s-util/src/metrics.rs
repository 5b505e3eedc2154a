use crate::url::template_path;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use http::{Request, Response};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tower::{Layer, Service};

/// Tower layer counting and timing the requests sent by the Kubernetes client
#[derive(Clone)]
pub struct MetricsLayer {
    request_count: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl MetricsLayer {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_count: meter
                .u64_counter("kubernetes_client_http_requests_total")
                .with_description("Total number of HTTP requests sent to the Kubernetes API")
                .build(),
            request_duration: meter
                .f64_histogram("kubernetes_client_http_request_duration_seconds")
                .with_description("Kubernetes API request duration in seconds")
                .with_boundaries(vec![0.05, 0.1, 0.5, 1.0, 5.0])
                .build(),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            request_count: self.request_count.clone(),
            request_duration: self.request_duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    request_count: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let endpoint = template_path(req.uri().path());
        let method = req.method().as_str().to_string();
        MetricsFuture {
            future: self.inner.call(req),
            labels: vec![
                KeyValue::new("method", method),
                KeyValue::new("endpoint", endpoint),
            ],
            start: Instant::now(),
            request_count: self.request_count.clone(),
            request_duration: self.request_duration.clone(),
        }
    }
}

#[pin_project::pin_project]
pub struct MetricsFuture<F> {
    #[pin]
    future: F,
    labels: Vec<KeyValue>,
    start: Instant,
    request_count: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl<F, ResBody, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.future.poll(cx);

        if let Poll::Ready(result) = &poll_result {
            let status = match result {
                Ok(response) => response.status().as_str().to_string(),
                Err(_) => "error".to_string(),
            };
            let mut count_labels = this.labels.clone();
            count_labels.push(KeyValue::new("status", status));
            this.request_count.add(1, &count_labels);
            this.request_duration
                .record(this.start.elapsed().as_secs_f64(), this.labels);
        }

        poll_result
    }
}
