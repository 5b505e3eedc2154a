use super::SERVICE_ACCOUNT_FINALIZER;

use crate::crd::PixoServiceAccount;

use pixop_k8s_util::error::{Error, Result};
use pixop_operator::controller::context::Context;

use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::debug;

#[allow(async_fn_in_trait)]
pub trait FinalizerExt {
    fn has_finalizer(&self) -> bool;

    /// Add the finalizer if missing. A no-op when already present.
    async fn ensure_finalizer(&self, ctx: &Context<PixoServiceAccount>) -> Result<()>;

    /// Remove the finalizer, letting the API server delete the object.
    async fn release_finalizer(&self, ctx: &Context<PixoServiceAccount>) -> Result<()>;
}

impl FinalizerExt for PixoServiceAccount {
    fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == SERVICE_ACCOUNT_FINALIZER)
    }

    async fn ensure_finalizer(&self, ctx: &Context<PixoServiceAccount>) -> Result<()> {
        if self.has_finalizer() {
            return Ok(());
        }
        debug!(msg = "adding finalizer");
        self.patch_finalizers(ctx, add_finalizer_ops(self.finalizers()))
            .await
    }

    async fn release_finalizer(&self, ctx: &Context<PixoServiceAccount>) -> Result<()> {
        match remove_finalizer_ops(self.finalizers()) {
            Some(ops) => {
                debug!(msg = "removing finalizer");
                self.patch_finalizers(ctx, ops).await
            }
            None => Ok(()),
        }
    }
}

impl PixoServiceAccount {
    async fn patch_finalizers(&self, ctx: &Context<PixoServiceAccount>, ops: Value) -> Result<()> {
        let patch: json_patch::Patch = serde_json::from_value(ops).map_err(|e| {
            Error::SerializationError("failed to build finalizer patch".to_string(), e)
        })?;
        let api = Api::<PixoServiceAccount>::namespaced(ctx.client.clone(), &self.get_namespace());
        api.patch(
            &self.name_any(),
            &PatchParams::default(),
            &Patch::Json::<()>(patch),
        )
        .await
        .map_err(|e| Error::KubeError("failed to patch finalizers".to_string(), Box::new(e)))?;
        Ok(())
    }
}

/// JSON patch appending the finalizer. The `test` op makes the patch fail if the list changed
/// since it was read.
fn add_finalizer_ops(current: &[String]) -> Value {
    if current.is_empty() {
        json!([
            {"op": "test", "path": "/metadata/finalizers", "value": null},
            {"op": "add", "path": "/metadata/finalizers", "value": [SERVICE_ACCOUNT_FINALIZER]},
        ])
    } else {
        json!([
            {"op": "test", "path": "/metadata/finalizers", "value": current},
            {"op": "add", "path": "/metadata/finalizers/-", "value": SERVICE_ACCOUNT_FINALIZER},
        ])
    }
}

fn remove_finalizer_ops(current: &[String]) -> Option<Value> {
    let index = current
        .iter()
        .position(|f| f == SERVICE_ACCOUNT_FINALIZER)?;
    let path = format!("/metadata/finalizers/{index}");
    Some(json!([
        {"op": "test", "path": path, "value": SERVICE_ACCOUNT_FINALIZER},
        {"op": "remove", "path": path},
    ]))
}
