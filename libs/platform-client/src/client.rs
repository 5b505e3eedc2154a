use crate::IdentityClient;
use crate::error::{ClientError, Result};
use crate::types::{ApiKey, CreateApiKeyRequest, User};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

const USERS_PATH: &[&str] = &["v2", "users"];
const API_KEYS_PATH: &[&str] = &["v2", "api-keys"];

#[derive(clap::Args, Clone, Debug)]
pub struct PlatformClientConfig {
    /// Base URL of the Pixo platform API. Example: "https://primary.api.pixovr.com"
    #[arg(long = "platform-url", env = "PIXO_PLATFORM_URL")]
    pub url: String,

    /// Bearer token used to authenticate against the Pixo platform API
    #[arg(long = "platform-token", env = "PIXO_PLATFORM_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Timeout in seconds for each request to the Pixo platform API
    #[arg(long = "platform-timeout-seconds", default_value_t = 10, env = "PIXO_PLATFORM_TIMEOUT_SECONDS")]
    pub timeout_seconds: u64,
}

/// REST implementation of [`IdentityClient`].
#[derive(Clone)]
pub struct PlatformClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl PlatformClient {
    pub fn new(config: &PlatformClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url).map_err(|e| {
            ClientError::UrlParseError(format!("failed to parse {}", config.url), e)
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(config.url.clone()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("pixop/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Request(config.url.clone(), e))?;
        debug!(msg = "platform client configured", url = %base_url);
        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, prefix: &[&str], segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(prefix)
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let endpoint = url.path().to_string();
        trace!(msg = "platform request", %method, %endpoint);
        let mut request = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Request(endpoint.clone(), e))?;
        check_status(endpoint, response).await
    }
}

async fn check_status(endpoint: String, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(endpoint));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Http {
            status: status.as_u16(),
            endpoint,
            body,
        });
    }
    Ok(response)
}

async fn parse_body<T: DeserializeOwned>(endpoint: &str, response: reqwest::Response) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::Request(endpoint.to_string(), e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::InvalidResponse(endpoint.to_string(), e))
}

fn to_body<T: serde::Serialize>(endpoint: &Url, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| ClientError::InvalidResponse(endpoint.path().to_string(), e))
}

#[async_trait]
impl IdentityClient for PlatformClient {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let url = self.endpoint(USERS_PATH, &["username", username])?;
        let endpoint = url.path().to_string();
        match self.send(Method::GET, url, None).await {
            Ok(response) => parse_body(&endpoint, response).await.map(Some),
            Err(ClientError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_user(&self, user: &User) -> Result<User> {
        let url = self.endpoint(USERS_PATH, &[])?;
        let endpoint = url.path().to_string();
        let body = to_body(&url, user)?;
        let response = self.send(Method::POST, url, Some(body)).await?;
        parse_body(&endpoint, response).await
    }

    async fn update_user(&self, user: &User) -> Result<User> {
        let id = user.id.to_string();
        let url = self.endpoint(USERS_PATH, &[&id])?;
        let endpoint = url.path().to_string();
        let body = to_body(&url, user)?;
        let response = self.send(Method::PUT, url, Some(body)).await?;
        parse_body(&endpoint, response).await
    }

    async fn delete_user(&self, id: i64) -> Result<()> {
        let url = self.endpoint(USERS_PATH, &[&id.to_string()])?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }

    async fn create_api_key(&self, user_id: i64) -> Result<ApiKey> {
        let url = self.endpoint(API_KEYS_PATH, &[])?;
        let endpoint = url.path().to_string();
        let body = to_body(&url, &CreateApiKeyRequest { user_id })?;
        let response = self.send(Method::POST, url, Some(body)).await?;
        parse_body(&endpoint, response).await
    }

    async fn delete_api_key(&self, id: i64) -> Result<()> {
        let url = self.endpoint(API_KEYS_PATH, &[&id.to_string()])?;
        self.send(Method::DELETE, url, None).await.map(|_| ())
    }
}
