use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use crate::api::UploadError;
use crate::token::VerifyError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("invalid config: {0}")]
    Config(Cow<'static, str>),
    #[error("{0}")]
    InvalidRequest(Cow<'static, str>),
    #[error("user {0} not found")]
    UserNotFound(Box<str>),
    #[error("no id token in request")]
    MissingToken,
}

impl Error {
    pub(crate) fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn to_response_parts(&self) -> (StatusCode, Cow<'static, str>) {
        match self {
            // don't give any detail on why a token failed to validate
            Self::Verify(_) => (StatusCode::UNAUTHORIZED, Cow::Borrowed("invalid id token")),
            Self::MissingToken => (StatusCode::UNAUTHORIZED, Cow::Borrowed("missing id token")),
            Self::InvalidRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            Self::UserNotFound(_) => (StatusCode::NOT_FOUND, Cow::Borrowed("user not found")),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Cow::Borrowed("internal server error"),
            ),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        self.to_response_parts().into_response()
    }
}

/// A non-successful response from the identity toolkit, or the certificate endpoint.
#[derive(Debug)]
pub struct StatusError {
    url: reqwest::Url,
    status: StatusCode,
    content: StatusErrorKind,
}

#[derive(Debug)]
enum StatusErrorKind {
    Json(serde_json::Value),
    Text(Bytes),
    Empty,
}

impl StatusError {
    pub fn new_from(url: reqwest::Url, status: StatusCode, content: Bytes) -> Self {
        let content = if content.is_empty() {
            StatusErrorKind::Empty
        } else if content.starts_with(b"{") || content.starts_with(b"[") {
            match serde_json::from_slice(&content) {
                Ok(json) => StatusErrorKind::Json(json),
                // fall back to raw text so we don't lose the error message
                Err(_) => StatusErrorKind::Text(content),
            }
        } else {
            StatusErrorKind::Text(content)
        };

        Self {
            url,
            status,
            content,
        }
    }

    pub(crate) async fn from_response(response: reqwest::Response) -> crate::Result<Self> {
        let url = response.url().clone();
        let status = response.status();
        let bytes = response.bytes().await?;
        Ok(Self::new_from(url, status, bytes))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    /// The most likely human readable message in the response body, if any.
    pub fn message(&self) -> Option<&str> {
        match self.content {
            StatusErrorKind::Json(ref json) => extract_json_message(json),
            StatusErrorKind::Text(ref text) => std::str::from_utf8(text).ok(),
            StatusErrorKind::Empty => None,
        }
    }
}

fn extract_json_message(json: &serde_json::Value) -> Option<&str> {
    fn get_map_string<'a>(
        map: &'a serde_json::Map<String, serde_json::Value>,
        key: &str,
    ) -> Option<&'a str> {
        match map.get(key)? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Object(nested) => get_map_string(nested, "message"),
            _ => None,
        }
    }

    match json {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Array(values) => values.iter().find_map(extract_json_message),
        serde_json::Value::Object(map) => {
            // google apis nest the message under "error"
            get_map_string(map, "error").or_else(|| get_map_string(map, "message"))
        }
        _ => None,
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.url, self.status)?;

        match self.message() {
            Some(message) => write!(f, ": {message}"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for StatusError {}
