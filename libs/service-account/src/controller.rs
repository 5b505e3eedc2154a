use crate::crd::PixoServiceAccount;
use crate::reconcile::{
    managed_secrets_selector, reconcile_service_account, referenced_service_account,
};

use pixop_k8s_util::error::Error;
use pixop_operator::backoff_reconciler;
use pixop_operator::controller::{ControllerId, State, check_api_queryable};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::{info, trace};

pub const CONTROLLER_ID: ControllerId = "service-account";

/// Initialize the service account controller
pub async fn run(state: State, client: Client) {
    let service_account = check_api_queryable::<PixoServiceAccount>(client.clone()).await;
    let secret = check_api_queryable::<Secret>(client.clone()).await;
    let deployment = check_api_queryable::<Deployment>(client.clone()).await;

    let ctx = Arc::new(state.to_context::<PixoServiceAccount>(client, CONTROLLER_ID));
    let metrics = ctx.metrics.clone();

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    // TODO: watcher::Config::default().streaming_lists() when stabilized in K8s
    // https://kubernetes.io/docs/reference/using-api/api-concepts/#streaming-lists
    let service_account_controller =
        Controller::new(service_account, watcher::Config::default().any_semantic())
            // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
            .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
            .owns(
                secret,
                watcher::Config::default().labels(&managed_secrets_selector()),
            )
            .watches(
                deployment,
                watcher::Config::default().any_semantic(),
                move |deployment: Deployment| {
                    let name = referenced_service_account(&deployment)?.to_string();
                    let namespace = deployment.namespace()?;
                    trace!(
                        msg = "deployment triggered reconcile",
                        deployment = deployment.name_any(),
                        %namespace,
                        %name,
                    );
                    metrics.triggered_inc("Deployment");
                    Some(ObjectRef::<PixoServiceAccount>::new(&name).within(&namespace))
                },
            )
            .shutdown_on_signal()
            .run(
                backoff_reconciler!(reconcile_service_account),
                |_obj, _error: &Error, _ctx| unreachable!(),
                ctx.clone(),
            )
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(1);
    service_account_controller.await;
    ctx.metrics.ready_set(0);
}
