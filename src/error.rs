//! Unified error type and result alias.

use axum::response::IntoResponse;
use thiserror::Error;

/// Unified error type.
///
/// Parsing and geometry errors are detected before any I/O and carry no
/// wrapped source. I/O-adjacent variants wrap an [`anyhow::Error`] so
/// context chains survive into the logs.
///
/// The wrapped errors inside are strictly internal. The client will
/// not see any messages or details.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range size descriptor. User error; maps to
    /// a not-found response at the boundary.
    #[error("invalid size descriptor {0:?}")]
    InvalidDescriptor(String),

    /// Image bytes are not one of the whitelisted formats (JPEG, PNG, GIF).
    #[error("unsupported image format")]
    UnsupportedFormat,

    /// Image bytes are corrupt or otherwise undecodable.
    #[error("image decode failed: {0}")]
    Decode(#[source] anyhow::Error),

    /// Missing required width/height for the resolved scale mode.
    #[error("width or height missing for scale mode")]
    InvalidDimensions,

    /// I/O failure while fetching, encoding or storing a derivative.
    #[error("derivative generation failed: {0}")]
    GenerationFailed(#[source] anyhow::Error),

    /// No record, or the request was determined to be unsatisfiable.
    #[error("not found: {0}")]
    NotFound(#[source] anyhow::Error),

    /// 500 Internal Server Error
    #[error("internal error: {0}")]
    Internal(
        #[from]
        #[source]
        anyhow::Error,
    ),
}

impl IntoResponse for Error {
    /// Render as an Axum response using hard-coded &'static str JSON bodies.
    ///
    /// Any failure in the derivative path surfaces as a not-found response;
    /// only genuinely internal faults get a 500. Details stay in the logs.
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        match self {
            Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, r#"{"status":500}"#)
                    .into_response()
            }
            _ => (StatusCode::NOT_FOUND, r#"{"status":404}"#).into_response(),
        }
    }
}

// Allow free conversion of an [`std::io::Error`] into an [`Error`]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::NotFound(anyhow::anyhow!(e))
    }
}

/// Unified Result. You can return this type directly in an
/// Axum endpoint handler. It will return valid JSON responses
/// when there is an error with the correct status code.
pub type Result<T> = std::result::Result<T, Error>;
