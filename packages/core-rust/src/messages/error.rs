//! Caller-visible error codes and the error payload carried by responses.
//!
//! Numbering follows JSON-RPC 2.0. The table is stable across versions;
//! new codes may be added, existing ones never change meaning.

use serde::{Deserialize, Serialize};

/// Stable error code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The frame could not be decoded at all.
    ParseError,
    /// The frame decoded but is not a well-formed request.
    InvalidRequest,
    /// The resource exists but has no such method or property.
    MethodNotFound,
    /// The method rejected its arguments (arity or type mismatch).
    InvalidParams,
    /// The host failed to encode its own response.
    InternalJsonRpcError,
    /// The invoked method failed.
    InternalServerError,
    /// The resource identifier does not name a live object.
    ResourceNotFound,
}

impl ErrorCode {
    /// All codes, in table order.
    pub const ALL: [ErrorCode; 7] = [
        ErrorCode::ParseError,
        ErrorCode::InvalidRequest,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidParams,
        ErrorCode::InternalJsonRpcError,
        ErrorCode::InternalServerError,
        ErrorCode::ResourceNotFound,
    ];

    /// Numeric wire value.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalJsonRpcError => -32603,
            ErrorCode::InternalServerError => -32000,
            ErrorCode::ResourceNotFound => -32004,
        }
    }

    /// Looks up a code by its numeric wire value.
    #[must_use]
    pub fn from_code(code: i32) -> Option<ErrorCode> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Symbolic name, e.g. `"METHOD_NOT_FOUND"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InternalJsonRpcError => "INTERNAL_JSON_RPC_ERROR",
            ErrorCode::InternalServerError => "INTERNAL_SERVER_ERROR",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: Some(message.into()),
        }
    }

    /// The symbolic code, if the numeric value is in the table.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.kind().map_or("UNKNOWN_ERROR", ErrorCode::as_str);
        match &self.message {
            Some(msg) => write!(f, "{name} ({}): {msg}", self.code),
            None => write!(f, "{name} ({})", self.code),
        }
    }
}
