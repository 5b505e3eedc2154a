use super::SERVICE_ACCOUNT_FIELD_MANAGER;
use super::identity::{EnsuredUser, IdentityExt, track};
use super::status::Observation;

use crate::controller::CONTROLLER_ID;
use crate::crd::PixoServiceAccount;

use pixop_k8s_util::error::{Error, Result};
use pixop_k8s_util::types::parse_label;
use pixop_operator::controller::context::{Context, KubeOperations};
use pixop_operator::controller::{INSTANCE_LABEL, MANAGED_BY_LABEL, NAME_LABEL, OPERATOR_NAME};
use pixop_platform_client::{ApiKey, User};

use std::collections::BTreeMap;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::api::{Api, ObjectMeta, Resource};
use tracing::{debug, info, trace};

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const API_KEY_KEY: &str = "api-key";

pub const SERVICE_ACCOUNT_LABEL: &str = "platform.pixovr.com/service-account-name";
pub const API_KEY_ID_LABEL: &str = "platform.pixovr.com/api-key-id";
pub const USER_ID_LABEL: &str = "platform.pixovr.com/user-id";
pub const USERNAME_LABEL: &str = "platform.pixovr.com/username";

static LABELS: LazyLock<BTreeMap<String, String>> = LazyLock::new(|| {
    BTreeMap::from([
        (NAME_LABEL.to_string(), "pixo-service-account".to_string()),
        (
            MANAGED_BY_LABEL.to_string(),
            format!("{OPERATOR_NAME}-{CONTROLLER_ID}"),
        ),
    ])
});

/// Label selector matching every credential secret written by this controller.
pub fn managed_secrets_selector() -> String {
    LABELS
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[allow(async_fn_in_trait)]
pub trait SecretExt {
    fn generate_auth_secret(&self, user: &User, password: &str, api_key: &ApiKey) -> Secret;

    async fn get_auth_secret(&self, ctx: &Context<PixoServiceAccount>) -> Result<Option<Secret>>;

    /// API key to revoke on teardown: the recorded one. The secret label is only consulted
    /// while the status has not recorded the user yet, a key cleared after that is gone.
    async fn recorded_api_key_id(&self, ctx: &Context<PixoServiceAccount>) -> Result<Option<i64>>;

    /// Issue an API key for `ensured` and store the credentials in the auth secret.
    ///
    /// A key still recorded in the status is revoked first. `ensured` must carry the password
    /// set in this pass, since a previous one cannot be read back.
    async fn issue_credentials(
        &self,
        ctx: &Context<PixoServiceAccount>,
        ensured: EnsuredUser,
        observation: &mut Observation,
    ) -> Result<Secret>;
}

impl SecretExt for PixoServiceAccount {
    fn generate_auth_secret(&self, user: &User, password: &str, api_key: &ApiKey) -> Secret {
        let labels = LABELS
            .clone()
            .into_iter()
            .chain([
                (INSTANCE_LABEL.to_string(), self.name_any()),
                (SERVICE_ACCOUNT_LABEL.to_string(), self.name_any()),
                (API_KEY_ID_LABEL.to_string(), api_key.id.to_string()),
                (USER_ID_LABEL.to_string(), user.id.to_string()),
                (USERNAME_LABEL.to_string(), user.username.clone()),
            ])
            .collect();
        Secret {
            metadata: ObjectMeta {
                name: Some(self.auth_secret_name()),
                namespace: Some(self.get_namespace()),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from([
                (USERNAME_KEY.to_string(), user.username.clone()),
                (PASSWORD_KEY.to_string(), password.to_string()),
                (API_KEY_KEY.to_string(), api_key.key.clone()),
            ])),
            ..Secret::default()
        }
    }

    async fn get_auth_secret(&self, ctx: &Context<PixoServiceAccount>) -> Result<Option<Secret>> {
        let name = self.auth_secret_name();
        Api::<Secret>::namespaced(ctx.client.clone(), &self.get_namespace())
            .get_opt(&name)
            .await
            .map_err(|e| Error::KubeError(format!("failed to get secret {name}"), Box::new(e)))
    }

    async fn recorded_api_key_id(&self, ctx: &Context<PixoServiceAccount>) -> Result<Option<i64>> {
        let status = self.status.as_ref();
        if let Some(id) = status.and_then(|s| s.api_key_id) {
            return Ok(Some(id));
        }
        if status.and_then(|s| s.external_user_id).is_some() {
            trace!(msg = "no api key recorded");
            return Ok(None);
        }
        let secret = self.get_auth_secret(ctx).await?;
        Ok(secret.and_then(|s| parse_label(s.metadata.labels.as_ref(), API_KEY_ID_LABEL)))
    }

    async fn issue_credentials(
        &self,
        ctx: &Context<PixoServiceAccount>,
        ensured: EnsuredUser,
        observation: &mut Observation,
    ) -> Result<Secret> {
        if let Some(stale) = self.status.as_ref().and_then(|s| s.api_key_id) {
            debug!(msg = "revoking api key without credential secret", api_key_id = stale);
            self.revoke_api_key(ctx, stale).await?;
            observation.api_key_id = Some(None);
        }

        let EnsuredUser { user, password } = ensured;
        let password = password.ok_or_else(|| {
            Error::MissingData(format!("no password set for user {}", user.id))
        })?;

        let api_key = track(ctx, "create_api_key", ctx.identity.create_api_key(user.id))
            .await
            .map_err(|e| {
                Error::PlatformClientError(
                    format!("failed to create api key for user {}", user.id),
                    Box::new(e),
                )
            })?;
        observation.api_key_id = Some(Some(api_key.id));
        info!(msg = "issued api key", api_key_id = api_key.id, user_id = user.id);

        let secret = self.generate_auth_secret(&user, &password, &api_key);
        self.kube_patch(ctx.client.clone(), secret, SERVICE_ACCOUNT_FIELD_MANAGER)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::{
        API_KEY_ID_LABEL, API_KEY_KEY, PASSWORD_KEY, SecretExt, USER_ID_LABEL, USERNAME_KEY,
        USERNAME_LABEL, managed_secrets_selector,
    };

    use crate::crd::PixoServiceAccount;

    use pixop_operator::controller::{INSTANCE_LABEL, MANAGED_BY_LABEL};
    use pixop_platform_client::{ApiKey, User};

    use kube::ResourceExt;

    #[test]
    fn test_generate_auth_secret() {
        let sa = PixoServiceAccount::test();
        let user = User {
            id: 9,
            ..sa.desired_user(None)
        };
        let api_key = ApiKey {
            id: 42,
            key: "secret-key".to_string(),
            user_id: 9,
        };

        let secret = sa.generate_auth_secret(&user, "pw!", &api_key);

        assert_eq!(secret.name_any(), "alice-auth");
        assert_eq!(secret.namespace().as_deref(), Some("default"));
        let data = secret.string_data.unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[USERNAME_KEY], "alice");
        assert_eq!(data[PASSWORD_KEY], "pw!");
        assert_eq!(data[API_KEY_KEY], "secret-key");

        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels[API_KEY_ID_LABEL], "42");
        assert_eq!(labels[USER_ID_LABEL], "9");
        assert_eq!(labels[USERNAME_LABEL], "alice");
        assert_eq!(labels[INSTANCE_LABEL], "alice");
        assert_eq!(labels[MANAGED_BY_LABEL], "pixop-service-account");

        let owner = &secret.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "PixoServiceAccount");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_managed_secrets_selector() {
        assert_eq!(
            managed_secrets_selector(),
            "app.kubernetes.io/managed-by=pixop-service-account,app.kubernetes.io/name=pixo-service-account"
        );
    }
}
