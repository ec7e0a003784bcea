//! Structured error codes returned by the registry handler.
//!
//! These are the wire-level errors of the distribution API. They travel as a
//! JSON envelope (`{"errors": [...]}`) inside HTTP responses and are turned
//! into [`crate::RegistryError`] values by [`crate::error::normalize`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes defined by the distribution API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    NameInvalid,
    NameUnknown,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
    #[serde(rename = "TOOMANYREQUESTS")]
    TooManyRequests,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            ErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            ErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::NameInvalid => "NAME_INVALID",
            ErrorCode::NameUnknown => "NAME_UNKNOWN",
            ErrorCode::SizeInvalid => "SIZE_INVALID",
            ErrorCode::TagInvalid => "TAG_INVALID",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Denied => "DENIED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::TooManyRequests => "TOOMANYREQUESTS",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// HTTP status the handler answers with for this code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BlobUnknown
            | ErrorCode::BlobUploadUnknown
            | ErrorCode::ManifestUnknown
            | ErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            ErrorCode::BlobUploadInvalid
            | ErrorCode::DigestInvalid
            | ErrorCode::ManifestBlobUnknown
            | ErrorCode::ManifestInvalid
            | ErrorCode::NameInvalid
            | ErrorCode::SizeInvalid
            | ErrorCode::TagInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Denied => StatusCode::FORBIDDEN,
            ErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single coded error, as found in an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CodedError {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl CodedError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Every error carried by one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodedErrors {
    pub errors: Vec<CodedError>,
}

impl CodedErrors {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl From<CodedError> for CodedErrors {
    fn from(error: CodedError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl FromIterator<CodedError> for CodedErrors {
    fn from_iter<T: IntoIterator<Item = CodedError>>(iter: T) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for CodedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("<nil>"),
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "errors:")?;
                for error in many {
                    write!(f, " {error};")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CodedErrors {}

impl IntoResponse for CodedError {
    fn into_response(self) -> Response {
        CodedErrors::from(self).into_response()
    }
}

impl IntoResponse for CodedErrors {
    fn into_response(self) -> Response {
        let status = self
            .errors
            .first()
            .map(|e| e.code.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        (status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_unknown_codes() {
        let body = r#"{"errors":[{"code":"SOMETHING_NEW","message":"m"},{"code":"BLOB_UNKNOWN","message":"gone","detail":{"digest":"sha256:00"}}]}"#;
        let errors: CodedErrors = serde_json::from_str(body).unwrap();

        assert_eq!(errors.len(), 2);
        assert_eq!(errors.errors[0].code, ErrorCode::Unknown);
        assert_eq!(errors.errors[1].code, ErrorCode::BlobUnknown);
        assert_eq!(
            errors.errors[1].detail.as_ref().unwrap()["digest"],
            "sha256:00"
        );
    }

    #[test]
    fn status_follows_first_error() {
        let response = CodedErrors::from_iter([
            CodedError::new(ErrorCode::ManifestUnknown, "missing"),
            CodedError::new(ErrorCode::Unknown, "other"),
        ])
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
