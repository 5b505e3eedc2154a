use super::secret::{API_KEY_KEY, PASSWORD_KEY};

use crate::crd::PixoServiceAccount;

use pixop_k8s_util::error::{Error, Result};
use pixop_k8s_util::resources::upsert_env_vars;
use pixop_operator::controller::context::Context;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector};
use kube::ResourceExt;
use kube::api::{Api, ListParams, PostParams};
use tracing::{debug, info};

/// Deployments carrying this annotation get the credentials of the named service account.
pub const SERVICE_ACCOUNT_ANNOTATION: &str = "platform/service-account-name";

pub const USERNAME_ENV: &str = "PIXO_USERNAME";
pub const PASSWORD_ENV: &str = "PIXO_PASSWORD";
pub const API_KEY_ENV: &str = "PIXO_API_KEY";

/// Name of the service account a deployment asks credentials from.
pub fn referenced_service_account(deployment: &Deployment) -> Option<&str> {
    deployment
        .annotations()
        .get(SERVICE_ACCOUNT_ANNOTATION)
        .map(String::as_str)
}

fn secret_env_var(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

/// Upsert the credential variables into every container. Returns `true` if anything changed.
fn inject_into(deployment: &mut Deployment, vars: &[EnvVar]) -> bool {
    let Some(pod_spec) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
    else {
        return false;
    };
    pod_spec
        .containers
        .iter_mut()
        .fold(false, |changed, container| {
            upsert_env_vars(container, vars) || changed
        })
}

#[allow(async_fn_in_trait)]
pub trait WorkloadExt {
    fn credential_env_vars(&self) -> Vec<EnvVar>;

    /// Inject credentials into the annotated deployments of the namespace. Deployments are only
    /// written when their containers changed.
    async fn inject_credentials(&self, ctx: &Context<PixoServiceAccount>) -> Result<()>;
}

impl WorkloadExt for PixoServiceAccount {
    fn credential_env_vars(&self) -> Vec<EnvVar> {
        let secret_name = self.auth_secret_name();
        vec![
            EnvVar {
                name: USERNAME_ENV.to_string(),
                value: Some(self.name_any()),
                ..EnvVar::default()
            },
            secret_env_var(PASSWORD_ENV, &secret_name, PASSWORD_KEY),
            secret_env_var(API_KEY_ENV, &secret_name, API_KEY_KEY),
        ]
    }

    async fn inject_credentials(&self, ctx: &Context<PixoServiceAccount>) -> Result<()> {
        let namespace = self.get_namespace();
        let name = self.name_any();
        let api = Api::<Deployment>::namespaced(ctx.client.clone(), &namespace);
        let deployments = api.list(&ListParams::default()).await.map_err(|e| {
            Error::KubeError(
                format!("failed to list deployments in {namespace}"),
                Box::new(e),
            )
        })?;

        let vars = self.credential_env_vars();
        for mut deployment in deployments
            .items
            .into_iter()
            .filter(|d| referenced_service_account(d) == Some(name.as_str()))
        {
            let deployment_name = deployment.name_any();
            if !inject_into(&mut deployment, &vars) {
                debug!(msg = "deployment credentials up to date", deployment = deployment_name);
                continue;
            }
            api.replace(&deployment_name, &PostParams::default(), &deployment)
                .await
                .map_err(|e| {
                    Error::KubeError(
                        format!("failed to update deployment {namespace}/{deployment_name}"),
                        Box::new(e),
                    )
                })?;
            info!(msg = "injected credentials", deployment = deployment_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{
        API_KEY_ENV, PASSWORD_ENV, USERNAME_ENV, WorkloadExt, inject_into,
        referenced_service_account,
    };

    use crate::crd::PixoServiceAccount;
    use crate::reconcile::test::deployment;

    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    fn env_names(deployment: &Deployment, container: usize) -> Vec<String> {
        deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[container]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn test_referenced_service_account() {
        assert_eq!(
            referenced_service_account(&deployment("web", Some("alice"), json!([]))),
            Some("alice")
        );
        assert_eq!(
            referenced_service_account(&deployment("web", None, json!([]))),
            None
        );
    }

    #[test]
    fn test_credential_env_vars() {
        let vars = PixoServiceAccount::test().credential_env_vars();
        assert_eq!(vars[0].name, USERNAME_ENV);
        assert_eq!(vars[0].value.as_deref(), Some("alice"));
        let password = vars[1].value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(vars[1].name, PASSWORD_ENV);
        assert_eq!(password.name, "alice-auth");
        assert_eq!(password.key, "password");
        let api_key = vars[2].value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(vars[2].name, API_KEY_ENV);
        assert_eq!(api_key.key, "api-key");
    }

    #[test]
    fn test_inject_into_every_container() {
        let vars = PixoServiceAccount::test().credential_env_vars();
        let mut d = deployment(
            "web",
            Some("alice"),
            json!([{"name": "LOG_LEVEL", "value": "debug"}]),
        );

        assert!(inject_into(&mut d, &vars));
        assert_eq!(
            env_names(&d, 0),
            vec!["LOG_LEVEL", USERNAME_ENV, PASSWORD_ENV, API_KEY_ENV]
        );
        assert_eq!(
            env_names(&d, 1),
            vec!["LOG_LEVEL", USERNAME_ENV, PASSWORD_ENV, API_KEY_ENV]
        );

        assert!(!inject_into(&mut d, &vars));
    }

    #[test]
    fn test_inject_into_fully_injected_deployment_is_noop() {
        let sa = PixoServiceAccount::test();
        let vars = sa.credential_env_vars();
        let mut d = deployment("web", Some("alice"), serde_json::to_value(&vars).unwrap());

        assert!(!inject_into(&mut d, &vars));
        assert_eq!(env_names(&d, 1), vec![USERNAME_ENV, PASSWORD_ENV, API_KEY_ENV]);
    }

    #[test]
    fn test_inject_replaces_in_place() {
        let vars = PixoServiceAccount::test().credential_env_vars();
        let mut d = deployment(
            "web",
            Some("alice"),
            json!([
                {"name": "PIXO_USERNAME", "value": "bob"},
                {"name": "LOG_LEVEL", "value": "debug"},
            ]),
        );

        assert!(inject_into(&mut d, &vars));
        assert_eq!(
            env_names(&d, 0),
            vec![USERNAME_ENV, "LOG_LEVEL", PASSWORD_ENV, API_KEY_ENV]
        );
        let env = d.spec.unwrap().template.spec.unwrap().containers.remove(0).env.unwrap();
        assert_eq!(env[0].value.as_deref(), Some("alice"));
    }
}
