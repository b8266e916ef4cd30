use thiserror::Error;

use crate::command::StompCommand;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("header line too long: {0}")]
    HeaderTooLong(usize),
    #[error("too many headers: {0}")]
    TooManyHeaders(usize),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame body is not NUL-terminated")]
    MissingNull,
    #[error("unexpected data after frame")]
    TrailingData,
    #[error("{0} frames cannot carry a body")]
    BodyNotAllowed(StompCommand),
    #[error("header {0:?} cannot be represented in a {1} frame")]
    UnencodableHeader(String, StompCommand),
    #[error("missing required header {0}")]
    MissingHeader(&'static str),
    #[error("unsupported content type {0:?}")]
    UnsupportedContentType(String),
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("json body error: {0}")]
    Json(#[from] serde_json::Error),
}
