mod finalizer;
mod identity;
mod secret;
mod status;
mod workload;

pub use self::secret::managed_secrets_selector;
pub use self::workload::referenced_service_account;

use self::finalizer::FinalizerExt;
use self::identity::IdentityExt;
use self::secret::SecretExt;
use self::status::{Observation, StatusExt};
use self::workload::WorkloadExt;

use crate::crd::PixoServiceAccount;

use pixop_k8s_util::error::{Error, Result};
use pixop_operator::controller::DEFAULT_RECONCILE_INTERVAL;
use pixop_operator::controller::context::{Context, KubeOperations};
use pixop_operator::telemetry;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::Api;
use kube::runtime::controller::Action;
use tracing::{Span, debug, field, info, instrument, trace, warn};

pub static SERVICE_ACCOUNT_FIELD_MANAGER: &str = "pixoserviceaccounts.platform.pixovr.com";
pub static SERVICE_ACCOUNT_FINALIZER: &str = "serviceaccount.platform.pixovr.com";

const PLATFORM_ERROR_REASON: &str = "PlatformError";

#[instrument(skip(ctx, service_account))]
pub async fn reconcile_service_account(
    service_account: Arc<PixoServiceAccount>,
    ctx: Arc<Context<PixoServiceAccount>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure(&trace_id);

    // the cached object may be stale, every decision below is taken on a fresh read
    let namespace = service_account.get_namespace();
    let name = service_account.name_any();
    let api = Api::<PixoServiceAccount>::namespaced(ctx.client.clone(), &namespace);
    let current = api.get_opt(&name).await.map_err(|e| {
        Error::KubeError(
            format!("failed to get service account {namespace}/{name}"),
            Box::new(e),
        )
    })?;
    let Some(service_account) = current else {
        debug!(msg = "service account not found");
        return Ok(Action::await_change());
    };

    if service_account.metadata.deletion_timestamp.is_some() {
        service_account.cleanup(&ctx).await
    } else {
        service_account.reconcile(&ctx).await
    }
}

impl PixoServiceAccount {
    async fn reconcile(&self, ctx: &Context<PixoServiceAccount>) -> Result<Action> {
        info!(msg = "reconciling service account");
        let mut observation = Observation::default();
        match self.apply(ctx, &mut observation).await {
            Ok(()) => {
                self.report_status(ctx, &observation, None)
                    .await
                    .inspect_err(|e| {
                        debug!(msg = "failed to update status", %e);
                        ctx.metrics.status_update_errors_inc();
                    })?;
                Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
            }
            Err(e) => Err(self.report_failure(ctx, &observation, e).await),
        }
    }

    async fn apply(
        &self,
        ctx: &Context<PixoServiceAccount>,
        observation: &mut Observation,
    ) -> Result<()> {
        self.ensure_finalizer(ctx).await?;

        // a missing secret needs a new password, set in the same user write as the spec fields
        let secret = self.get_auth_secret(ctx).await?;
        let ensured = self.ensure_user(ctx, secret.is_none()).await?;
        observation.user = Some(ensured.user.clone());

        if secret.is_none() {
            self.issue_credentials(ctx, ensured, observation).await?;
        } else {
            trace!(msg = "credential secret already exists");
        }

        self.inject_credentials(ctx).await
    }

    async fn cleanup(&self, ctx: &Context<PixoServiceAccount>) -> Result<Action> {
        if !self.has_finalizer() {
            debug!(msg = "finalizer already released");
            return Ok(Action::await_change());
        }
        info!(msg = "tearing down service account");
        let mut observation = Observation::default();
        match self.release(ctx, &mut observation).await {
            Ok(()) => Ok(Action::await_change()),
            Err(e) => Err(self.report_failure(ctx, &observation, e).await),
        }
    }

    async fn release(
        &self,
        ctx: &Context<PixoServiceAccount>,
        observation: &mut Observation,
    ) -> Result<()> {
        let api_key_id = self.recorded_api_key_id(ctx).await?;
        self.teardown(ctx, api_key_id, observation).await?;
        self.kube_delete::<Secret>(
            ctx.client.clone(),
            &self.get_namespace(),
            &self.auth_secret_name(),
        )
        .await?;
        self.release_finalizer(ctx).await
    }

    /// Record `error` in the status and return it. A failing status update is logged, the
    /// original error is kept.
    async fn report_failure(
        &self,
        ctx: &Context<PixoServiceAccount>,
        observation: &Observation,
        error: Error,
    ) -> Error {
        if error.is_platform_error() {
            ctx.publish_warning(
                self,
                PLATFORM_ERROR_REASON,
                "PlatformRequest",
                error.to_string(),
            )
            .await;
        }
        if let Err(e) = self.report_status(ctx, observation, Some(&error)).await {
            warn!(msg = "failed to record error in status", %e);
            ctx.metrics.status_update_errors_inc();
        }
        error
    }
}
