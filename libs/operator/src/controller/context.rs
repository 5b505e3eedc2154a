use super::{ControllerId, DEFAULT_RECONCILE_INTERVAL};

use crate::metrics::ControllerMetrics;

use pixop_k8s_util::error::{Error, Result};
use pixop_k8s_util::retry::is_not_found;
use pixop_platform_client::IdentityClient;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{Lookup, ObjectRef};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

// Context for our reconciler
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// State of the error backoff policy per object
    error_backoff_cache: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
    /// Event recorder
    pub recorder: Recorder,
    /// Identity service client
    pub identity: Arc<dyn IdentityClient>,
}

impl<K> Context<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        identity: Arc<dyn IdentityClient>,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            recorder,
            identity,
            error_backoff_cache: Arc::default(),
        }
    }
}

impl<K> Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    /// Publish a Warning event on `obj`. Failing to publish is logged, never returned.
    pub async fn publish_warning(&self, obj: &K, reason: &str, action: &str, note: String) {
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            warn!(msg = format!("failed to publish {reason} event"), %e);
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Return next duration of the backoff policy for the given object
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_cache.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RECONCILE_INTERVAL)
            .without_max_times()
            .build();
        let duration = backoff.next().unwrap_or(DEFAULT_RECONCILE_INTERVAL);
        self.error_backoff_cache
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(
            msg = "recreate backoff policy",
            namespace = obj_ref.namespace.as_deref(),
            name = obj_ref.name,
        );
        duration
    }

    /// Reset the backoff policy for the given object
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_cache.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(
                msg = "reset backoff policy",
                namespace = obj_ref.namespace.as_deref(),
                name = obj_ref.name
            );
            self.error_backoff_cache.write().await.remove(&obj_ref);
        }
    }
}

/// Write operations on namespaced objects derived from a custom resource
#[allow(async_fn_in_trait)]
pub trait KubeOperations {
    /// Server-side apply `obj` in its namespace, forcing ownership of the applied fields.
    async fn kube_patch<T>(&self, client: Client, obj: T, field_manager: &str) -> Result<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + Debug;

    /// Delete `name` of kind `T` in `namespace`. Missing objects are not an error.
    async fn kube_delete<T>(&self, client: Client, namespace: &str, name: &str) -> Result<()>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + DeserializeOwned
            + Clone
            + Debug;
}

impl<K> KubeOperations for K
where
    K: Resource + ResourceExt,
{
    async fn kube_patch<T>(&self, client: Client, obj: T, field_manager: &str) -> Result<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + Debug,
    {
        let name = obj.name_any();
        let namespace = ResourceExt::namespace(&obj)
            .or_else(|| ResourceExt::namespace(self))
            .ok_or_else(|| Error::MissingData(format!("missing namespace for {name}")))?;
        let kind = T::kind(&());
        trace!(msg = format!("patching {kind}"), %namespace, %name);
        let api = Api::<T>::namespaced(client, &namespace);
        api.patch(
            &name,
            &PatchParams::apply(field_manager).force(),
            &Patch::Apply(&obj),
        )
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to patch {kind} {namespace}/{name}"),
                Box::new(e),
            )
        })
    }

    async fn kube_delete<T>(&self, client: Client, namespace: &str, name: &str) -> Result<()>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + DeserializeOwned
            + Clone
            + Debug,
    {
        let kind = T::kind(&());
        let api = Api::<T>::namespaced(client, namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(msg = format!("deleted {kind}"), %namespace, %name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                trace!(msg = format!("{kind} already deleted"), %namespace, %name);
                Ok(())
            }
            Err(e) => Err(Error::KubeError(
                format!("failed to delete {kind} {namespace}/{name}"),
                Box::new(e),
            )),
        }
    }
}
