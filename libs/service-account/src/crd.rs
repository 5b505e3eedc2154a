use pixop_platform_client::User;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A service account represents a non-human user of the Pixo platform. The operator creates the
/// user in the platform, issues an API key for it and stores the credentials in the
/// `{{ name }}-auth` secret. Deployments annotated with
/// `platform/service-account-name: {{ name }}` get the credentials injected as environment
/// variables.
///
/// The resource name is the platform username.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    category = "pixo",
    group = "platform.pixovr.com",
    version = "v1",
    kind = "PixoServiceAccount",
    plural = "pixoserviceaccounts",
    singular = "pixoserviceaccount",
    shortname = "psa",
    namespaced,
    status = "PixoServiceAccountStatus",
    doc = r#"The Pixo service account custom resource definition (CRD) defines a service account in the Pixo platform."#,
    printcolumn = r#"{"name":"User ID","type":"integer","jsonPath":".status.externalUserID"}"#,
    printcolumn = r#"{"name":"Role","type":"string","jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"Org","type":"integer","jsonPath":".spec.organizationID"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.lastError","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct PixoServiceAccountSpec {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    /// Platform role of the user. Example: "admin"
    #[serde(default)]
    pub role: String,
    /// Platform organization the user belongs to.
    #[serde(rename = "organizationID", default)]
    pub organization_id: i64,
}

/// Most recently observed state of the service account. Written only by the operator.
///
/// Every field is always serialized, unset values as `null`, so a merge patch computed between
/// two statuses can clear fields.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PixoServiceAccountStatus {
    #[serde(rename = "externalUserID", default)]
    pub external_user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "organizationID", default)]
    pub organization_id: Option<i64>,
    #[serde(rename = "apiKeyID", default)]
    pub api_key_id: Option<i64>,
    /// Message of the last failed operation, empty when it succeeded.
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub created_at: Option<Time>,
    #[serde(default)]
    pub updated_at: Option<Time>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl PixoServiceAccount {
    #[inline]
    pub fn get_namespace(&self) -> String {
        // safe unwrap: service account is namespaced scoped
        self.namespace().unwrap()
    }

    #[inline]
    pub fn auth_secret_name(&self) -> String {
        format!("{}-auth", self.name_any())
    }

    /// Platform user matching the spec. `id` is left unset.
    pub fn desired_user(&self, password: Option<String>) -> User {
        User {
            id: 0,
            username: self.name_any(),
            password,
            first_name: self.spec.first_name.clone(),
            last_name: self.spec.last_name.clone(),
            role: self.spec.role.clone(),
            org_id: self.spec.organization_id,
        }
    }

    /// True if any field managed by the spec differs from `user`.
    pub fn differs_from(&self, user: &User) -> bool {
        self.spec.first_name != user.first_name
            || self.spec.last_name != user.last_name
            || self.spec.role != user.role
            || self.spec.organization_id != user.org_id
    }
}

#[cfg(test)]
mod test {
    use super::{PixoServiceAccount, PixoServiceAccountStatus};

    use pixop_platform_client::User;

    use kube::CustomResourceExt;
    use serde_json::json;

    fn alice() -> PixoServiceAccount {
        let mut sa = PixoServiceAccount::new(
            "alice",
            serde_json::from_value(json!({
                "firstName": "Alice",
                "lastName": "Liddell",
                "role": "admin",
                "organizationID": 7,
            }))
            .unwrap(),
        );
        sa.metadata.namespace = Some("default".to_string());
        sa
    }

    #[test]
    fn test_crd_identity() {
        let crd = PixoServiceAccount::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("pixoserviceaccounts.platform.pixovr.com")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_auth_secret_name() {
        assert_eq!(alice().auth_secret_name(), "alice-auth");
    }

    #[test]
    fn test_desired_user() {
        let user = alice().desired_user(Some("pw".to_string()));
        assert_eq!(user.username, "alice");
        assert_eq!(user.role, "admin");
        assert_eq!(user.org_id, 7);
        assert_eq!(user.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_differs_from_single_field() {
        let sa = alice();
        let mut user = sa.desired_user(None);
        user.id = 9;
        assert!(!sa.differs_from(&user));

        user.role = "viewer".to_string();
        assert!(sa.differs_from(&user));
    }

    #[test]
    fn test_differs_from_ignores_password_and_id() {
        let sa = alice();
        let user = User {
            id: 12,
            password: Some("other".to_string()),
            ..sa.desired_user(None)
        };
        assert!(!sa.differs_from(&user));
    }

    #[test]
    fn test_status_serializes_every_field() {
        let value = serde_json::to_value(PixoServiceAccountStatus::default()).unwrap();
        assert_eq!(
            value,
            json!({
                "externalUserID": null,
                "username": null,
                "firstName": null,
                "lastName": null,
                "role": null,
                "organizationID": null,
                "apiKeyID": null,
                "lastError": "",
                "createdAt": null,
                "updatedAt": null,
                "observedGeneration": null,
            })
        );
    }

    #[test]
    fn test_status_deserializes_partial_object() {
        let status: PixoServiceAccountStatus =
            serde_json::from_value(json!({"externalUserID": 9, "apiKeyID": 42})).unwrap();
        assert_eq!(status.external_user_id, Some(9));
        assert_eq!(status.api_key_id, Some(42));
        assert_eq!(status.last_error, "");
    }
}
