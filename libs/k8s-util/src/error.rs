use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    // Boxing this error because the size can be large
    PlatformClientError(
        String,
        #[source] Box<pixop_platform_client::ClientError>,
    ),

    #[error("{0}: {1}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}")]
    MissingData(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),
}

impl Error {
    /// True when the error came from the identity service rather than from Kubernetes.
    pub fn is_platform_error(&self) -> bool {
        matches!(self, Error::PlatformClientError(_, _))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
