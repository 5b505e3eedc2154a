//! Client for the Pixo platform identity service.
//!
//! The operator only depends on [`IdentityClient`]; [`PlatformClient`] is the REST implementation
//! used at runtime.

mod client;
mod error;
mod types;

pub use self::client::{PlatformClient, PlatformClientConfig};
pub use self::error::{ClientError, Result};
pub use self::types::{ApiKey, User};

use async_trait::async_trait;

/// Operations the operator needs from the identity service.
///
/// Deletes report [`ClientError::NotFound`] when the remote object does not exist, callers decide
/// whether that is an error.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn create_user(&self, user: &User) -> Result<User>;

    async fn update_user(&self, user: &User) -> Result<User>;

    async fn delete_user(&self, id: i64) -> Result<()>;

    async fn create_api_key(&self, user_id: i64) -> Result<ApiKey>;

    async fn delete_api_key(&self, id: i64) -> Result<()>;
}
