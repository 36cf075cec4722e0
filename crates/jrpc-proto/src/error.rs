//! Error types for the jrpc-proto crate.
//!
//! Every failure the registry and codec can report is an [`Error`] tagged with
//! an [`ErrorKind`], so callers can turn it into a wire error without losing
//! the parameter index, field name or type detail in the message.

use std::fmt;

use crate::protocol::RpcError;

/// Kinds of failure shared by the registry, the codec and the transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A command is already registered under the method name.
    DuplicateMethod,
    /// Usage flags outside the recognized bit set were supplied.
    InvalidUsageFlags,
    /// The command is not a named structure, or a parameter has the wrong type.
    InvalidType,
    /// Embedded (flattened) fields cannot be decoded positionally.
    EmbeddedType,
    /// Non-public fields cannot be decoded.
    UnexportedField,
    /// The field type has no JSON representation.
    UnsupportedFieldType,
    /// A required field follows an optional one.
    NonOptionalField,
    /// A required field declares a default value.
    NonOptionalDefault,
    /// A default value does not parse into the field type.
    MismatchedDefault,
    /// No command is registered under the method name.
    UnregisteredMethod,
    /// The parameter count is outside the accepted range.
    WrongNumberOfParams,
    /// No handler is bound to the method.
    MethodNotFound,
    /// The request envelope is malformed.
    ParseError,
    /// The client session has already disconnected.
    ClientQuit,
}

impl ErrorKind {
    /// Returns whether this kind can only be raised while registering a command.
    #[must_use]
    pub fn is_registration(self) -> bool {
        matches!(
            self,
            Self::DuplicateMethod
                | Self::InvalidUsageFlags
                | Self::EmbeddedType
                | Self::UnexportedField
                | Self::UnsupportedFieldType
                | Self::NonOptionalField
                | Self::NonOptionalDefault
                | Self::MismatchedDefault
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DuplicateMethod => "ErrDuplicateMethod",
            Self::InvalidUsageFlags => "ErrInvalidUsageFlags",
            Self::InvalidType => "ErrInvalidType",
            Self::EmbeddedType => "ErrEmbeddedType",
            Self::UnexportedField => "ErrUnexportedField",
            Self::UnsupportedFieldType => "ErrUnsupportedFieldType",
            Self::NonOptionalField => "ErrNonOptionalField",
            Self::NonOptionalDefault => "ErrNonOptionalDefault",
            Self::MismatchedDefault => "ErrMismatchedDefault",
            Self::UnregisteredMethod => "ErrUnregisteredMethod",
            Self::WrongNumberOfParams => "ErrNumParams",
            Self::MethodNotFound => "ErrMethodNotFound",
            Self::ParseError => "ErrParse",
            Self::ClientQuit => "ErrClientQuit",
        };
        f.write_str(name)
    }
}

/// Structured error carrying a kind and a human readable description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn client_quit() -> Self {
        Self::new(ErrorKind::ClientQuit, "client quit")
    }
}

impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        match err.kind {
            ErrorKind::UnregisteredMethod | ErrorKind::MethodNotFound => {
                RpcError::method_not_found()
            }
            ErrorKind::ParseError => RpcError::parse_error(err.message),
            ErrorKind::ClientQuit => RpcError::internal_error(err.message),
            _ => RpcError::invalid_params(err.message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};

    #[test]
    fn test_error_display_is_message() {
        let err = Error::new(
            ErrorKind::DuplicateMethod,
            "method \"getblock\" is already registered",
        );
        assert_eq!(err.to_string(), "method \"getblock\" is already registered");
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::WrongNumberOfParams.to_string(), "ErrNumParams");
        assert_eq!(ErrorKind::ClientQuit.to_string(), "ErrClientQuit");
    }

    #[test]
    fn test_registration_kinds() {
        assert!(ErrorKind::NonOptionalField.is_registration());
        assert!(ErrorKind::MismatchedDefault.is_registration());
        assert!(!ErrorKind::WrongNumberOfParams.is_registration());
        assert!(!ErrorKind::ClientQuit.is_registration());
    }

    #[test]
    fn test_unregistered_method_maps_to_method_not_found() {
        let rpc: RpcError =
            Error::new(ErrorKind::UnregisteredMethod, "\"nope\" is not registered").into();
        assert_eq!(rpc.code, METHOD_NOT_FOUND);
        assert_eq!(rpc.message, "Method not found");
    }

    #[test]
    fn test_codec_errors_map_to_invalid_params() {
        let rpc: RpcError = Error::new(
            ErrorKind::InvalidType,
            "parameter #1 'hash' must be type string (got number)",
        )
        .into();
        assert_eq!(rpc.code, INVALID_PARAMS);
        assert!(rpc.message.contains("parameter #1 'hash'"));
    }

    #[test]
    fn test_parse_error_maps_to_parse_code() {
        let rpc: RpcError = Error::new(ErrorKind::ParseError, "expected value").into();
        assert_eq!(rpc.code, PARSE_ERROR);
        assert!(rpc.message.contains("expected value"));
    }

    #[test]
    fn test_client_quit() {
        let err = Error::client_quit();
        assert_eq!(err.kind, ErrorKind::ClientQuit);
        assert_eq!(err.to_string(), "client quit");

        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, INTERNAL_ERROR);
    }

    #[test]
    fn test_method_not_found_maps_to_method_not_found() {
        let rpc: RpcError =
            Error::new(ErrorKind::MethodNotFound, "no handler for \"nope\"").into();
        assert_eq!(rpc.code, METHOD_NOT_FOUND);
    }
}
