use super::status::Observation;

use crate::crd::PixoServiceAccount;

use pixop_k8s_util::error::{Error, Result};
use pixop_operator::controller::context::Context;
use pixop_platform_client::{ClientError, User};

use std::future::Future;

use kube::ResourceExt;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info};

const PASSWORD_LENGTH: usize = 24;

/// Platform user after `ensure_user`. `password` is only known when it was just set.
#[derive(Debug)]
pub struct EnsuredUser {
    pub user: User,
    pub password: Option<String>,
}

/// Initial password: random alphanumeric characters followed by `!`.
pub fn generate_password() -> String {
    let mut password: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect();
    password.push('!');
    password
}

/// Run an identity service request, counting it by operation and result.
pub(super) async fn track<T, F>(
    ctx: &Context<PixoServiceAccount>,
    operation: &'static str,
    request: F,
) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    let result = request.await;
    ctx.metrics.identity_request_inc(operation, result.is_ok());
    result
}

fn platform_error(context: String) -> impl FnOnce(ClientError) -> Error {
    move |e| Error::PlatformClientError(context, Box::new(e))
}

#[allow(async_fn_in_trait)]
pub trait IdentityExt {
    /// Create the platform user or converge its fields with the spec. With `reset_password` an
    /// existing user also gets a new password, sent in the same update as any field changes.
    async fn ensure_user(
        &self,
        ctx: &Context<PixoServiceAccount>,
        reset_password: bool,
    ) -> Result<EnsuredUser>;

    /// Delete the API key, tolerating a key that no longer exists.
    async fn revoke_api_key(&self, ctx: &Context<PixoServiceAccount>, id: i64) -> Result<()>;

    /// Delete the API key and then the user. The user is kept when the key deletion fails.
    async fn teardown(
        &self,
        ctx: &Context<PixoServiceAccount>,
        api_key_id: Option<i64>,
        observation: &mut Observation,
    ) -> Result<()>;
}

impl IdentityExt for PixoServiceAccount {
    async fn ensure_user(
        &self,
        ctx: &Context<PixoServiceAccount>,
        reset_password: bool,
    ) -> Result<EnsuredUser> {
        let username = self.name_any();
        let existing = track(
            ctx,
            "get_user",
            ctx.identity.get_user_by_username(&username),
        )
        .await
        .map_err(platform_error(format!("failed to get user {username}")))?;

        match existing {
            None => {
                let password = generate_password();
                let user = track(
                    ctx,
                    "create_user",
                    ctx.identity
                        .create_user(&self.desired_user(Some(password.clone()))),
                )
                .await
                .map_err(platform_error(format!("failed to create user {username}")))?;
                info!(msg = "created platform user", user_id = user.id);
                Ok(EnsuredUser {
                    user,
                    password: Some(password),
                })
            }
            Some(existing) if reset_password || self.differs_from(&existing) => {
                let password = reset_password.then(generate_password);
                let desired = User {
                    id: existing.id,
                    ..self.desired_user(password.clone())
                };
                let user = track(ctx, "update_user", ctx.identity.update_user(&desired))
                    .await
                    .map_err(platform_error(format!(
                        "failed to update user {username}"
                    )))?;
                info!(
                    msg = "updated platform user",
                    user_id = user.id,
                    password_reset = reset_password
                );
                Ok(EnsuredUser { user, password })
            }
            Some(existing) => {
                debug!(msg = "platform user up to date", user_id = existing.id);
                Ok(EnsuredUser {
                    user: existing,
                    password: None,
                })
            }
        }
    }

    async fn revoke_api_key(&self, ctx: &Context<PixoServiceAccount>, id: i64) -> Result<()> {
        match track(ctx, "delete_api_key", ctx.identity.delete_api_key(id)).await {
            Ok(()) => {
                info!(msg = "deleted api key", api_key_id = id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(msg = "api key already deleted", api_key_id = id);
                Ok(())
            }
            Err(e) => Err(Error::PlatformClientError(
                format!("failed to delete api key {id}"),
                Box::new(e),
            )),
        }
    }

    async fn teardown(
        &self,
        ctx: &Context<PixoServiceAccount>,
        api_key_id: Option<i64>,
        observation: &mut Observation,
    ) -> Result<()> {
        if let Some(id) = api_key_id {
            self.revoke_api_key(ctx, id).await?;
            observation.api_key_id = Some(None);
        }

        let recorded_user_id = self.status.as_ref().and_then(|s| s.external_user_id);
        let user_id = match recorded_user_id {
            Some(id) => Some(id),
            None => {
                let username = self.name_any();
                track(
                    ctx,
                    "get_user",
                    ctx.identity.get_user_by_username(&username),
                )
                .await
                .map_err(platform_error(format!("failed to get user {username}")))?
                .map(|u| u.id)
            }
        };
        let Some(id) = user_id else {
            debug!(msg = "no platform user to delete");
            return Ok(());
        };
        match track(ctx, "delete_user", ctx.identity.delete_user(id)).await {
            Ok(()) => {
                info!(msg = "deleted platform user", user_id = id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(msg = "platform user already deleted", user_id = id);
                Ok(())
            }
            Err(e) => Err(Error::PlatformClientError(
                format!("failed to delete user {id}"),
                Box::new(e),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{IdentityExt, PASSWORD_LENGTH, generate_password};

    use crate::reconcile::status::Observation;
    use crate::reconcile::test::{MockIdentityClient, get_test_context};

    use crate::crd::{PixoServiceAccount, PixoServiceAccountStatus};

    use pixop_platform_client::User;

    #[test]
    fn test_generate_password() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LENGTH + 1);
        assert!(password.ends_with('!'));
        assert!(
            password[..PASSWORD_LENGTH]
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        );
        assert_ne!(password, generate_password());
    }

    #[tokio::test]
    async fn test_ensure_user_creates_missing_user() {
        let identity = MockIdentityClient::default();
        let (ctx, _fakeserver) = get_test_context(identity.clone());

        let ensured = PixoServiceAccount::test().ensure_user(&ctx, false).await.unwrap();

        assert_eq!(ensured.user.id, 9);
        assert!(ensured.password.is_some());
        assert_eq!(
            identity.calls(),
            vec!["get_user_by_username:alice", "create_user:alice"]
        );
        let created = identity.user("alice").unwrap();
        assert_eq!(created.role, "admin");
        assert_eq!(created.org_id, 7);
        assert_eq!(created.password, ensured.password);
    }

    #[tokio::test]
    async fn test_ensure_user_single_field_diff() {
        let identity = MockIdentityClient::default();
        let mut existing = PixoServiceAccount::test().desired_user(None);
        existing.id = 9;
        existing.role = "viewer".to_string();
        identity.insert_user(existing);
        let (ctx, _fakeserver) = get_test_context(identity.clone());

        let ensured = PixoServiceAccount::test().ensure_user(&ctx, false).await.unwrap();

        assert!(ensured.password.is_none());
        assert_eq!(
            identity.calls(),
            vec!["get_user_by_username:alice", "update_user:alice"]
        );
        let updated = identity.user("alice").unwrap();
        assert_eq!(updated.id, 9);
        assert_eq!(updated.role, "admin");
        assert_eq!(updated.first_name, "Alice");
        assert_eq!(updated.last_name, "Liddell");
        assert_eq!(updated.org_id, 7);
        assert_eq!(updated.password, None);
    }

    #[tokio::test]
    async fn test_ensure_user_without_changes() {
        let identity = MockIdentityClient::default();
        identity.insert_user(PixoServiceAccount::test().desired_user(None));
        let (ctx, _fakeserver) = get_test_context(identity.clone());

        PixoServiceAccount::test().ensure_user(&ctx, false).await.unwrap();

        assert_eq!(identity.calls(), vec!["get_user_by_username:alice"]);
    }

    #[tokio::test]
    async fn test_ensure_user_resets_password_with_field_diff() {
        let identity = MockIdentityClient::default();
        let mut existing = PixoServiceAccount::test().desired_user(None);
        existing.id = 9;
        existing.role = "viewer".to_string();
        identity.insert_user(existing);
        let (ctx, _fakeserver) = get_test_context(identity.clone());

        let ensured = PixoServiceAccount::test().ensure_user(&ctx, true).await.unwrap();

        assert_eq!(
            identity.calls(),
            vec!["get_user_by_username:alice", "update_user:alice"]
        );
        let updated = identity.user("alice").unwrap();
        assert_eq!(updated.role, "admin");
        assert!(ensured.password.is_some());
        assert_eq!(updated.password, ensured.password);
    }

    #[tokio::test]
    async fn test_ensure_user_resets_password_of_unchanged_user() {
        let identity = MockIdentityClient::default();
        identity.insert_user(User {
            id: 9,
            ..PixoServiceAccount::test().desired_user(None)
        });
        let (ctx, _fakeserver) = get_test_context(identity.clone());

        let ensured = PixoServiceAccount::test().ensure_user(&ctx, true).await.unwrap();

        assert_eq!(ensured.user.id, 9);
        assert_eq!(
            identity.calls(),
            vec!["get_user_by_username:alice", "update_user:alice"]
        );
        assert_eq!(identity.user("alice").unwrap().password, ensured.password);
    }

    #[tokio::test]
    async fn test_teardown_tolerates_not_found() {
        let identity = MockIdentityClient::default();
        let (ctx, _fakeserver) = get_test_context(identity.clone());
        let sa = PixoServiceAccount::test().with_status(PixoServiceAccountStatus {
            external_user_id: Some(9),
            api_key_id: Some(42),
            ..Default::default()
        });
        let mut observation = Observation::default();

        sa.teardown(&ctx, Some(42), &mut observation).await.unwrap();

        assert_eq!(identity.calls(), vec!["delete_api_key:42", "delete_user:9"]);
        assert_eq!(observation.api_key_id, Some(None));
    }

    #[tokio::test]
    async fn test_teardown_looks_up_unrecorded_user() {
        let identity = MockIdentityClient::default();
        let mut existing = PixoServiceAccount::test().desired_user(None);
        existing.id = 11;
        identity.insert_user(existing);
        let (ctx, _fakeserver) = get_test_context(identity.clone());
        let mut observation = Observation::default();

        PixoServiceAccount::test()
            .teardown(&ctx, None, &mut observation)
            .await
            .unwrap();

        assert_eq!(
            identity.calls(),
            vec!["get_user_by_username:alice", "delete_user:11"]
        );
        assert_eq!(observation.api_key_id, None);
        assert!(identity.user("alice").is_none());
    }

    #[tokio::test]
    async fn test_teardown_keeps_user_when_key_deletion_fails() {
        let identity = MockIdentityClient::default().failing_delete_api_key();
        let (ctx, _fakeserver) = get_test_context(identity.clone());
        let sa = PixoServiceAccount::test().with_status(PixoServiceAccountStatus {
            external_user_id: Some(9),
            api_key_id: Some(42),
            ..Default::default()
        });
        let mut observation = Observation::default();

        let err = sa
            .teardown(&ctx, Some(42), &mut observation)
            .await
            .unwrap_err();

        assert!(err.is_platform_error());
        assert!(err.to_string().starts_with("failed to delete api key 42"));
        assert_eq!(identity.calls(), vec!["delete_api_key:42"]);
        assert_eq!(observation.api_key_id, None);
    }
}
