use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::Result;
use kube::{Client, Config, client::ConfigExt};
use opentelemetry::metrics::Meter;
use tower::{BoxError, ServiceBuilder};
use tracing::debug;

/// Build a Kubernetes client whose requests are recorded by [`MetricsLayer`].
pub async fn new_client_with_metrics(config: Config, meter: &Meter) -> Result<Client> {
    debug!(msg = "building Kubernetes client", cluster_url = %config.cluster_url);
    let https = config.rustls_https_connector()?;
    let service = ServiceBuilder::new()
        .layer(MetricsLayer::new(meter))
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .map_err(BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, config.default_namespace))
}
