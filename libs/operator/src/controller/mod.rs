pub mod context;

use self::context::Context;

use crate::metrics;
use crate::prometheus_exporter;

use pixop_k8s_util::error::{Error, Result};
use pixop_k8s_util::types::short_type_name;
use pixop_platform_client::IdentityClient;

use std::fmt::Debug;
use std::sync::Arc;

use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::Lookup;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::error;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const OPERATOR_NAME: &str = "pixop";

pub type ControllerId = &'static str;

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<metrics::Metrics>,
    /// Identity service client shared by every controller
    identity: Arc<dyn IdentityClient>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(metrics: metrics::Metrics, identity: Arc<dyn IdentityClient>) -> Self {
        Self {
            metrics: Arc::new(metrics),
            identity,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        prometheus_exporter::format_prometheus_metrics().map_err(|e| {
            Error::FormattingError(format!("failed to export metrics: {e}"), std::fmt::Error)
        })
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all CONTROLLER_IDs have to be registered")
                .clone(),
            Recorder::new(client, controller_id.into()),
            self.identity.clone(),
        )
    }
}

/// Exit the process if `K` cannot be listed, the controller would fail on every watch otherwise.
pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    // safe unwrap: all resources in the operator are namespace scoped resources
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
