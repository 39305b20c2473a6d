//! Prepared statements.
//!
//! This module provides:
//! - `PreparedStatement`: the server-side description of a parsed statement
//! - `Statement`: a prepared statement bound to its connection

use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;
use crate::error::{PgError, PgResult};
use crate::protocol::FieldDescription;
use crate::rows::Rows;
use crate::types::{Oid, PgValue};

/// Shared column descriptions, handed to every row of a result.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement that has been parsed and described by the server.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result columns (from RowDescription); empty when the statement
    /// returns no rows
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    pub fn set_columns(&mut self, columns: Vec<FieldDescription>) {
        self.columns = Arc::new(columns);
    }

    /// Number of parameters the statement expects.
    pub fn num_input(&self) -> usize {
        self.param_types.len()
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Text-encode `args`, checking them against the parameter count.
    pub(crate) fn encode_args(&self, args: &[PgValue]) -> PgResult<Vec<Option<String>>> {
        if args.len() != self.num_input() {
            return Err(PgError::Protocol(format!(
                "statement expects {} arguments, got {}",
                self.num_input(),
                args.len()
            )));
        }
        Ok(args.iter().map(PgValue::to_text).collect())
    }
}

// ============================================================================
// Statement
// ============================================================================

/// A prepared statement borrowed together with its connection.
pub struct Statement<'c> {
    conn: &'c mut Connection,
    prepared: PreparedStatement,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(conn: &'c mut Connection, prepared: PreparedStatement) -> Self {
        Self { conn, prepared }
    }

    pub fn name(&self) -> &str {
        &self.prepared.name
    }

    pub fn sql(&self) -> &str {
        &self.prepared.query
    }

    pub fn num_input(&self) -> usize {
        self.prepared.num_input()
    }

    pub fn param_types(&self) -> &[Oid] {
        &self.prepared.param_types
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.prepared.columns
    }

    /// Execute and return the number of affected rows.
    pub async fn exec(&mut self, args: &[PgValue]) -> PgResult<u64> {
        let mut rows = self.query(args).await?;
        while rows.next().await?.is_some() {}
        Ok(rows.rows_affected())
    }

    /// Execute and stream the result rows.
    pub async fn query(&mut self, args: &[PgValue]) -> PgResult<Rows<'_>> {
        let bound = self.prepared.encode_args(args)?;
        self.conn.ready().await?;
        self.conn.start_portal(&self.prepared.name, &bound).await?;
        Ok(Rows::new(self.conn, Arc::clone(&self.prepared.columns)))
    }

    /// Deallocate the statement on the server.
    pub async fn close(self) -> PgResult<()> {
        self.conn.close_statement(&self.prepared.name).await
    }

    /// Detach from the connection, keeping the description.
    ///
    /// Re-attach with [`Connection::statement`] on the same connection.
    pub fn into_prepared(self) -> PreparedStatement {
        debug!(statement = %self.prepared.name, "statement detached");
        self.prepared
    }
}

impl std::fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Format;

    fn int_column(name: &str) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: Format::Text,
        }
    }

    #[test]
    fn test_prepared_statement_description() {
        let mut stmt = PreparedStatement::new("s1".into(), "SELECT $1::int".into());
        assert!(!stmt.returns_rows());
        assert_eq!(stmt.num_input(), 0);

        stmt.set_param_types(vec![Oid::INT4]);
        stmt.set_columns(vec![int_column("int4")]);
        assert!(stmt.returns_rows());
        assert_eq!(stmt.num_input(), 1);
        assert_eq!(stmt.columns[0].name, "int4");
    }

    #[test]
    fn test_encode_args_checks_count() {
        let mut stmt = PreparedStatement::new(String::new(), "SELECT $1, $2".into());
        stmt.set_param_types(vec![Oid::UNSPECIFIED, Oid::UNSPECIFIED]);

        let err = stmt.encode_args(&[PgValue::Int4(1)]).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));

        let bound = stmt
            .encode_args(&[PgValue::Int4(1), PgValue::Null])
            .unwrap();
        assert_eq!(bound, vec![Some("1".to_string()), None]);
    }
}
