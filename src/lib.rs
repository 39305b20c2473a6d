//! PostgreSQL frontend/backend protocol (v3) client.
//!
//! Architecture:
//! - `buffer`: big-endian integers and NUL-terminated strings
//! - `protocol`: frontend message encoding, backend message decoding
//! - `scanner`: background task framing backend messages off the socket
//! - `notify`: bounded LISTEN/NOTIFY queue
//! - `stream`: `PgStream`, one typed send per frontend message
//! - `connection`: startup state machine, simple and extended queries
//! - `statement`, `rows`, `transaction`: request-level handles
//! - `types`: OIDs, values, and the text-format type registry
//! - `config`: URL parsing and the connection factory

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod rows;
mod scanner;
pub mod scram;
pub mod statement;
pub mod stream;
pub mod transaction;
pub mod types;


pub use config::{Config, ConnectionFactory};
pub use connection::{BackendKey, Connection};
pub use error::{PgError, PgResult, ServerError};
pub use notify::{Notifications, OverflowPolicy};
pub use protocol::{CommandTag, FieldDescription, Notification, TransactionStatus};
pub use rows::{Row, Rows, SimpleQueryResult};
pub use statement::{PreparedStatement, SharedColumns, Statement};
pub use stream::{PgStream, Transport};
pub use transaction::Transaction;
pub use types::{Oid, PgValue, TypeRegistry};
