//! Transaction handle.

use tracing::debug;

use crate::connection::Connection;
use crate::error::PgResult;
use crate::rows::{Rows, SimpleQueryResult};
use crate::statement::Statement;
use crate::types::PgValue;

/// An open transaction started by [`Connection::begin`].
///
/// Dropping it without [`commit`](Transaction::commit) or
/// [`rollback`](Transaction::rollback) queues a ROLLBACK that runs before the
/// connection's next request.
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(conn: &'c mut Connection) -> Self {
        debug!("transaction started");
        Self {
            conn,
            finished: false,
        }
    }

    pub async fn exec(&mut self, sql: &str, args: &[PgValue]) -> PgResult<u64> {
        self.conn.exec(sql, args).await
    }

    pub async fn query(&mut self, sql: &str, args: &[PgValue]) -> PgResult<Rows<'_>> {
        self.conn.query(sql, args).await
    }

    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<SimpleQueryResult>> {
        self.conn.simple_query(sql).await
    }

    pub async fn prepare(&mut self, sql: &str) -> PgResult<Statement<'_>> {
        self.conn.prepare(sql).await
    }

    pub async fn commit(mut self) -> PgResult<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> PgResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&mut self, command: &str) -> PgResult<()> {
        self.finished = true;
        self.conn.ready().await?;
        self.conn.simple_exec(command).await?;
        debug!(command, "transaction finished");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("transaction dropped while open, rollback deferred");
            self.conn.pending_rollback = true;
        }
    }
}
