use crate::crd::{PixoServiceAccount, PixoServiceAccountStatus};

use pixop_k8s_util::error::{Error, Result};
use pixop_k8s_util::resources::merge_patch_diff;
use pixop_k8s_util::retry::{is_conflict, retry_on_conflict};
use pixop_operator::controller::context::Context;
use pixop_platform_client::User;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use serde_json::{Value, json};
use tracing::{debug, trace};

/// What a reconcile pass learned about the remote state, merged into the status on report.
#[derive(Debug, Default)]
pub struct Observation {
    pub user: Option<User>,
    /// `Some(None)` clears the recorded key.
    pub api_key_id: Option<Option<i64>>,
}

#[allow(async_fn_in_trait)]
pub trait StatusExt {
    /// Status after merging `observation` and `last_error`, `None` when nothing changed. The
    /// generation is only marked observed when `last_error` is empty.
    fn next_status(
        &self,
        observation: &Observation,
        last_error: &str,
        now: &Time,
    ) -> Option<PixoServiceAccountStatus>;

    /// Merge-patch the status subresource. The patch is computed against a fresh read and
    /// carries its resourceVersion; conflicts re-read and retry.
    async fn report_status(
        &self,
        ctx: &Context<PixoServiceAccount>,
        observation: &Observation,
        error: Option<&Error>,
    ) -> Result<()>;
}

impl StatusExt for PixoServiceAccount {
    fn next_status(
        &self,
        observation: &Observation,
        last_error: &str,
        now: &Time,
    ) -> Option<PixoServiceAccountStatus> {
        let current = self.status.clone().unwrap_or_default();
        let mut status = current.clone();
        if let Some(user) = &observation.user {
            status.external_user_id = Some(user.id);
            status.username = Some(user.username.clone());
            status.first_name = Some(user.first_name.clone());
            status.last_name = Some(user.last_name.clone());
            status.role = Some(user.role.clone());
            status.organization_id = Some(user.org_id);
        }
        if let Some(api_key_id) = observation.api_key_id {
            status.api_key_id = api_key_id;
        }
        status.last_error = last_error.to_string();
        if last_error.is_empty() {
            status.observed_generation = self.metadata.generation;
        }
        if status.created_at.is_none() && status.external_user_id.is_some() {
            status.created_at = Some(now.clone());
        }
        if status == current {
            return None;
        }
        status.updated_at = Some(now.clone());
        Some(status)
    }

    async fn report_status(
        &self,
        ctx: &Context<PixoServiceAccount>,
        observation: &Observation,
        error: Option<&Error>,
    ) -> Result<()> {
        let namespace = self.get_namespace();
        let name = self.name_any();
        let last_error = error.map(|e| e.to_string()).unwrap_or_default();
        let api = Api::<PixoServiceAccount>::namespaced(ctx.client.clone(), &namespace);

        let (api, name, last_error) = (&api, name.as_str(), last_error.as_str());
        retry_on_conflict(move || async move {
            let current = api.get_opt(name).await.map_err(|e| {
                Error::KubeError(format!("failed to get {name}"), Box::new(e))
            })?;
            let Some(current) = current else {
                debug!(msg = "service account gone before status update");
                return Ok(());
            };
            let now = Time(Timestamp::now());
            let Some(status) = current.next_status(observation, last_error, &now) else {
                trace!(msg = "status unchanged");
                return Ok(());
            };
            let patch = status_patch(&current, &status)?;
            trace!(msg = "patching status", %patch);
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| {
                    if is_conflict(&e) {
                        debug!(msg = "status update conflict");
                        ctx.metrics.status_conflicts_inc();
                    }
                    Error::KubeError(format!("failed to patch status of {name}"), Box::new(e))
                })?;
            Ok(())
        })
        .await
    }
}

/// Merge patch holding only the changed status keys, pinned to the resourceVersion it was
/// computed from.
fn status_patch(current: &PixoServiceAccount, status: &PixoServiceAccountStatus) -> Result<Value> {
    let to_value = |s: &PixoServiceAccountStatus| {
        serde_json::to_value(s)
            .map_err(|e| Error::SerializationError("failed to serialize status".to_string(), e))
    };
    let before = to_value(&current.status.clone().unwrap_or_default())?;
    let after = to_value(status)?;
    Ok(json!({
        "metadata": {"resourceVersion": current.resource_version()},
        "status": merge_patch_diff(&before, &after),
    }))
}
