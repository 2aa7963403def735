use thiserror::Error;

#[derive(Error, Debug)]
pub enum NasError {
    #[error("request to NAS failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("NAS returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse NAS response: {0}")]
    Parse(String),

    #[error("unexpected response from NAS: {0}")]
    Unexpected(String),

    #[error("invalid NAS endpoint: {0}")]
    InvalidEndpoint(String),
}

impl NasError {
    /// True when the NAS answered 404 for the addressed object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NasError::Status { status: 404, .. })
    }

    /// True when the NAS answered at all, but refused the request.
    pub fn is_rejected(&self) -> bool {
        matches!(self, NasError::Status { .. })
    }
}

impl From<serde_json::Error> for NasError {
    fn from(e: serde_json::Error) -> Self {
        NasError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NasError>;
