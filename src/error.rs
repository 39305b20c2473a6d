//! Error types for the PostgreSQL protocol client.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = std::result::Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error on the transport. Fatal to the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected message for the current phase of a request.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported authentication method or failed authentication exchange.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server answered with an ErrorResponse.
    #[error("{0}")]
    Server(ServerError),

    /// Malformed message: bad length, missing terminator, column count mismatch.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A value could not be converted by the type registry.
    #[error("Type error: {0}")]
    Type(String),

    /// Invalid connection configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection is closed or was left unusable by an earlier fatal error.
    #[error("Connection is closed")]
    ConnectionClosed,
}

impl PgError {
    /// Whether the connection can still be used after this error.
    ///
    /// Only server errors are recoverable; everything else leaves the
    /// message stream in an unknown position.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PgError::Server(_))
    }

    /// The server error, if this is one.
    pub fn as_server(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(e)
    }
}

// ============================================================================
// Server Error
// ============================================================================

/// Field codes of ErrorResponse and NoticeResponse messages.
pub mod field {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NONLOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const INTERNAL_POSITION: u8 = b'p';
    pub const INTERNAL_QUERY: u8 = b'q';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const DATA_TYPE: u8 = b'd';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// Display order and names of the known fields.
const FIELD_NAMES: &[(u8, &str)] = &[
    (field::SEVERITY, "Severity"),
    (field::SEVERITY_NONLOCALIZED, "SeverityNonLocalized"),
    (field::CODE, "Code"),
    (field::MESSAGE, "Message"),
    (field::DETAIL, "Detail"),
    (field::HINT, "Hint"),
    (field::POSITION, "Position"),
    (field::INTERNAL_POSITION, "InternalPosition"),
    (field::INTERNAL_QUERY, "InternalQuery"),
    (field::WHERE, "Where"),
    (field::SCHEMA, "Schema"),
    (field::TABLE, "Table"),
    (field::COLUMN, "Column"),
    (field::DATA_TYPE, "DataType"),
    (field::CONSTRAINT, "Constraint"),
    (field::FILE, "File"),
    (field::LINE, "Line"),
    (field::ROUTINE, "Routine"),
];

/// A decoded ErrorResponse (or NoticeResponse) field map.
///
/// Receiving one does not terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerError {
    fields: HashMap<u8, String>,
}

impl ServerError {
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self { fields }
    }

    /// Raw access to a field by its single-byte code.
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(|s| s.as_str())
    }

    pub fn fields(&self) -> &HashMap<u8, String> {
        &self.fields
    }

    pub fn severity(&self) -> &str {
        self.field(field::SEVERITY).unwrap_or_default()
    }

    /// SQLSTATE code, e.g. `42P01`.
    pub fn code(&self) -> &str {
        self.field(field::CODE).unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.field(field::MESSAGE).unwrap_or_default()
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(field::DETAIL)
    }

    pub fn hint(&self) -> Option<&str> {
        self.field(field::HINT)
    }

    pub fn position(&self) -> Option<&str> {
        self.field(field::POSITION)
    }

    pub fn internal_position(&self) -> Option<&str> {
        self.field(field::INTERNAL_POSITION)
    }

    pub fn where_(&self) -> Option<&str> {
        self.field(field::WHERE)
    }

    pub fn file(&self) -> Option<&str> {
        self.field(field::FILE)
    }

    pub fn line(&self) -> Option<&str> {
        self.field(field::LINE)
    }

    pub fn routine(&self) -> Option<&str> {
        self.field(field::ROUTINE)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write_pair = |f: &mut fmt::Formatter<'_>, name: &str, value: &str| {
            if !first {
                f.write_str(" - ")?;
            }
            first = false;
            write!(f, "{}: ({})", name, value)
        };

        for (code, name) in FIELD_NAMES {
            if let Some(value) = self.fields.get(code) {
                write_pair(f, name, value)?;
            }
        }

        let mut unknown: Vec<_> = self
            .fields
            .iter()
            .filter(|(code, _)| !FIELD_NAMES.iter().any(|(known, _)| known == *code))
            .collect();
        unknown.sort_by_key(|(code, _)| **code);
        for (code, value) in unknown {
            write_pair(f, &(*code as char).to_string(), value)?;
        }

        Ok(())
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerError {
        let mut fields = HashMap::new();
        fields.insert(b'M', "relation \"foo\" does not exist".to_string());
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "42P01".to_string());
        ServerError::new(fields)
    }

    #[test]
    fn test_server_error_accessors() {
        let err = sample();
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42P01");
        assert_eq!(err.message(), "relation \"foo\" does not exist");
        assert_eq!(err.detail(), None);
    }

    #[test]
    fn test_server_error_display_is_ordered() {
        let err = sample();
        assert_eq!(
            err.to_string(),
            "Severity: (ERROR) - Code: (42P01) - Message: (relation \"foo\" does not exist)"
        );
    }

    #[test]
    fn test_unknown_fields_are_rendered_last() {
        let mut fields = HashMap::new();
        fields.insert(b'Z', "zz".to_string());
        fields.insert(b'S', "FATAL".to_string());
        let err = ServerError::new(fields);
        assert_eq!(err.to_string(), "Severity: (FATAL) - Z: (zz)");
    }

    #[test]
    fn test_only_server_errors_are_recoverable() {
        assert!(PgError::Server(sample()).is_recoverable());
        assert!(!PgError::Protocol("x".into()).is_recoverable());
        assert!(!PgError::ConnectionClosed.is_recoverable());
    }
}
