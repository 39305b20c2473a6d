//! Result rows.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::error::{PgError, PgResult};
use crate::protocol::{CommandTag, FieldDescription, Message};
use crate::statement::SharedColumns;
use crate::types::{PgValue, TypeRegistry};

// ============================================================================
// Row
// ============================================================================

/// One data row. Values stay in their text wire form until asked for.
#[derive(Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Option<Bytes>>,
    types: Arc<TypeRegistry>,
}

impl Row {
    /// Fails when the value count differs from the column count.
    pub(crate) fn new(
        columns: SharedColumns,
        values: Vec<Option<Bytes>>,
        types: Arc<TypeRegistry>,
    ) -> PgResult<Self> {
        if values.len() != columns.len() {
            return Err(PgError::Decode(format!(
                "data row has {} values but the row description has {} columns",
                values.len(),
                columns.len()
            )));
        }
        Ok(Self {
            columns,
            values,
            types,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// Position of the first column called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn check(&self, idx: usize) -> PgResult<()> {
        if idx >= self.values.len() {
            return Err(PgError::Type(format!(
                "column index {} out of range ({} columns)",
                idx,
                self.values.len()
            )));
        }
        Ok(())
    }

    /// Raw wire bytes; `None` for SQL NULL.
    pub fn get_raw(&self, idx: usize) -> PgResult<Option<&[u8]>> {
        self.check(idx)?;
        Ok(self.values[idx].as_deref())
    }

    /// Value as text; `None` for SQL NULL.
    pub fn get_str(&self, idx: usize) -> PgResult<Option<&str>> {
        match self.get_raw(idx)? {
            Some(raw) => std::str::from_utf8(raw)
                .map(Some)
                .map_err(|e| PgError::Type(format!("column {} is not valid UTF-8: {}", idx, e))),
            None => Ok(None),
        }
    }

    /// Value decoded by the connection's type registry.
    pub fn get(&self, idx: usize) -> PgResult<PgValue> {
        let raw = self.get_raw(idx)?;
        self.types.decode(self.columns[idx].type_oid, raw)
    }

    pub fn get_by_name(&self, name: &str) -> PgResult<PgValue> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| PgError::Type(format!("no column named {}", name)))?;
        self.get(idx)
    }

    /// Decode every column.
    pub fn values(&self) -> PgResult<Vec<PgValue>> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (col, value) in self.columns.iter().zip(&self.values) {
            map.entry(&col.name, &value.as_deref().map(String::from_utf8_lossy));
        }
        map.finish()
    }
}

// ============================================================================
// Rows
// ============================================================================

/// Streaming result of an extended-protocol execution.
///
/// Borrows the connection until dropped. Dropping before the end leaves the
/// rest of the response to be skipped by the next request.
pub struct Rows<'c> {
    conn: &'c mut Connection,
    columns: SharedColumns,
    done: bool,
    completed: u32,
    rows_affected: u64,
    tag: Option<CommandTag>,
    suspended: bool,
}

impl<'c> Rows<'c> {
    pub(crate) fn new(conn: &'c mut Connection, columns: SharedColumns) -> Self {
        Self {
            conn,
            columns,
            done: false,
            completed: 0,
            rows_affected: 0,
            tag: None,
            suspended: false,
        }
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// Next row, or `None` at the end of the result.
    ///
    /// Keeps returning `None` once the end was reached. A server error is
    /// returned after the connection is back at a request boundary.
    pub async fn next(&mut self) -> PgResult<Option<Row>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let msg = match self.conn.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };

            match msg {
                Message::DataRow { values } => {
                    let types = Arc::clone(self.conn.types());
                    return Row::new(Arc::clone(&self.columns), values, types).map(Some);
                }
                Message::CommandComplete { tag } => {
                    self.completed += 1;
                    self.rows_affected += tag.rows_affected();
                    self.tag = Some(tag);
                }
                Message::PortalSuspended => self.suspended = true,
                Message::EmptyQueryResponse => {}
                Message::ErrorResponse(e) => {
                    self.done = true;
                    self.conn.drain_until_ready().await?;
                    return Err(e.into());
                }
                Message::ReadyForQuery { status } => {
                    self.conn.set_transaction_status(status);
                    self.done = true;
                    return Ok(None);
                }
                other => {
                    self.done = true;
                    return Err(self.conn.unexpected("row fetch", &other));
                }
            }
        }
    }

    /// Rows affected as reported by the command tags seen so far.
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Tag of the most recent CommandComplete.
    pub fn command_tag(&self) -> Option<&CommandTag> {
        self.tag.as_ref()
    }

    /// Number of CommandComplete messages seen.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Whether the portal stopped at its row limit.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Skip the remaining rows.
    pub async fn close(mut self) -> PgResult<()> {
        while self.next().await?.is_some() {}
        Ok(())
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.needs_drain = true;
        }
    }
}

// ============================================================================
// Simple query result
// ============================================================================

/// Result of one statement of a simple query.
#[derive(Debug, Default)]
pub struct SimpleQueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// `None` for an empty query.
    pub tag: Option<CommandTag>,
}

impl SimpleQueryResult {
    pub fn rows_affected(&self) -> u64 {
        self.tag.as_ref().map_or(0, CommandTag::rows_affected)
    }
}
