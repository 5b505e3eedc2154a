use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected status {status} from {endpoint}: {body}")]
    Http {
        status: u16,
        endpoint: String,
        body: String,
    },

    #[error("request to {0} failed: {1}")]
    Request(String, #[source] reqwest::Error),

    #[error("invalid response from {0}: {1}")]
    InvalidResponse(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    UrlParseError(String, #[source] url::ParseError),

    #[error("invalid platform url: {0}")]
    InvalidBaseUrl(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
