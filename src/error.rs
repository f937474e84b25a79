use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid index name: {0}")]
    NameInvalid(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("index not found")]
    NotFound,
    #[error("index engine is closed")]
    Closed,
    #[error("fast store error: {0}")]
    Kv(String),
    #[error("durable store error: {0}")]
    Durable(String),
    #[error("corrupt bitmap for key {0}")]
    CorruptBitmap(String),
    #[error("reindex failed: {0}")]
    ReindexFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for IndexError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for IndexError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<postgres::Error> for IndexError {
    fn from(err: postgres::Error) -> Self {
        Self::Durable(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for IndexError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) | Self::NameInvalid(_) | Self::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Closed
            | Self::Kv(_)
            | Self::Durable(_)
            | Self::CorruptBitmap(_)
            | Self::ReindexFailed(_)
            | Self::Io(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
