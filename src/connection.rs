//! Driver connection.
//!
//! This module provides the connection type that handles:
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended query protocols
//! - Recovery of the message stream after abandoned results and server errors

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PgError, PgResult};
use crate::notify::{self, Notifications, OverflowPolicy};
use crate::protocol::{Message, Target, TransactionStatus};
use crate::rows::{Row, Rows, SimpleQueryResult};
use crate::scram::{self, ScramClient};
use crate::statement::{PreparedStatement, Statement};
use crate::stream::{PgStream, Transport};
use crate::transaction::Transaction;
use crate::types::{Oid, PgValue, TypeRegistry};

/// Process id and secret key used to cancel requests out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

// ============================================================================
// Startup
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupState {
    Connecting,
    AwaitingAuth,
    AwaitingBackendData,
    Ready,
    Failed,
}

struct Startup<'a> {
    state: StartupState,
    user: &'a str,
    password: Option<&'a str>,
    scram: Option<ScramClient>,
    scram_verified: bool,
}

impl Startup<'_> {
    fn advance(&mut self, next: StartupState) {
        debug!(from = ?self.state, to = ?next, "startup state");
        self.state = next;
    }

    fn password(&self) -> PgResult<&str> {
        self.password
            .ok_or_else(|| PgError::Auth("password required but none configured".to_string()))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
///
/// Every request takes `&mut self`, so at most one request is in flight and
/// a result set borrows the connection until it is dropped.
pub struct Connection {
    stream: PgStream,
    types: Arc<TypeRegistry>,
    /// Session parameters reported through ParameterStatus
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKey>,
    transaction_status: TransactionStatus,
    /// A result set was dropped before its ReadyForQuery arrived.
    pub(crate) needs_drain: bool,
    /// A transaction was dropped without commit or rollback.
    pub(crate) pending_rollback: bool,
    broken: bool,
    closed: bool,
    next_statement_id: u32,
}

impl Connection {
    /// Run the startup handshake over `transport`.
    ///
    /// `params` are sent verbatim in the startup packet and must include
    /// `user`. `password` answers cleartext, MD5, and SCRAM requests.
    pub async fn connect<T: Transport>(
        transport: T,
        params: &[(String, String)],
        password: Option<&str>,
    ) -> PgResult<Self> {
        let stream = PgStream::new(transport, notify::DEFAULT_CAPACITY, OverflowPolicy::default());
        Self::handshake(stream, params, password, Arc::new(TypeRegistry::default())).await
    }

    pub(crate) async fn handshake(
        stream: PgStream,
        params: &[(String, String)],
        password: Option<&str>,
        types: Arc<TypeRegistry>,
    ) -> PgResult<Self> {
        let user = params
            .iter()
            .find(|(k, _)| k == "user")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| PgError::Config("startup parameters must include user".to_string()))?;

        let mut conn = Self {
            stream,
            types,
            parameters: HashMap::new(),
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
            needs_drain: false,
            pending_rollback: false,
            broken: false,
            closed: false,
            next_statement_id: 0,
        };

        let mut startup = Startup {
            state: StartupState::Connecting,
            user,
            password,
            scram: None,
            scram_verified: false,
        };

        match conn.startup(&mut startup, params).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                debug!(error = %e, "startup failed");
                startup.advance(StartupState::Failed);
                Err(e)
            }
        }
    }

    async fn startup(&mut self, s: &mut Startup<'_>, params: &[(String, String)]) -> PgResult<()> {
        self.stream.startup(params).await?;
        s.advance(StartupState::AwaitingAuth);

        loop {
            let msg = self.recv().await?;

            match (s.state, msg) {
                (StartupState::AwaitingAuth, Message::AuthenticationOk) => {
                    if s.scram.is_some() && !s.scram_verified {
                        return Err(PgError::Auth(
                            "server finished SCRAM without a signature".to_string(),
                        ));
                    }
                    s.advance(StartupState::AwaitingBackendData);
                }
                (StartupState::AwaitingAuth, Message::AuthenticationCleartextPassword) => {
                    let password = s.password()?;
                    self.stream.password(password).await?;
                }
                (StartupState::AwaitingAuth, Message::AuthenticationMd5Password { salt }) => {
                    let password = s.password()?;
                    self.stream.password_md5(&salt, s.user, password).await?;
                }
                (StartupState::AwaitingAuth, Message::AuthenticationSasl { mechanisms }) => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramClient::new(s.user, s.password()?);
                    self.stream
                        .sasl_initial_response(scram::MECHANISM, &client.client_first_message())
                        .await?;
                    s.scram = Some(client);
                }
                (StartupState::AwaitingAuth, Message::AuthenticationSaslContinue { data }) => {
                    let client = s
                        .scram
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL challenge without SASL start".to_string()))?;
                    let response = client.process_server_first(&data)?;
                    self.stream.sasl_response(&response).await?;
                }
                (StartupState::AwaitingAuth, Message::AuthenticationSaslFinal { data }) => {
                    let client = s
                        .scram
                        .as_ref()
                        .ok_or_else(|| PgError::Protocol("SASL final without SASL start".to_string()))?;
                    client.verify_server_final(&data)?;
                    s.scram_verified = true;
                }
                (StartupState::AwaitingAuth, Message::AuthenticationOther { code }) => {
                    return Err(PgError::Auth(format!(
                        "unsupported authentication method (code {})",
                        code
                    )));
                }
                (_, Message::BackendKeyData {
                    process_id,
                    secret_key,
                }) => {
                    self.backend_key = Some(BackendKey {
                        process_id,
                        secret_key,
                    });
                }
                (StartupState::AwaitingBackendData, Message::ReadyForQuery { status }) => {
                    self.transaction_status = status;
                    s.advance(StartupState::Ready);
                    return Ok(());
                }
                (_, Message::ErrorResponse(e)) => return Err(e.into()),
                (_, other) => return Err(self.unexpected("startup", &other)),
            }
        }
    }

    // ========================================================================
    // Simple query protocol
    // ========================================================================

    /// Execute a command and return the number of affected rows.
    ///
    /// Without arguments the SQL goes through the simple query protocol and
    /// may hold several statements; the counts of all of them are summed.
    /// With arguments it is run as an unnamed prepared statement.
    pub async fn exec(&mut self, sql: &str, args: &[PgValue]) -> PgResult<u64> {
        if !args.is_empty() {
            let mut rows = self.query(sql, args).await?;
            while rows.next().await?.is_some() {}
            return Ok(rows.rows_affected());
        }

        self.ready().await?;
        self.simple_exec(sql).await
    }

    /// Run `sql` through the simple query protocol, keeping one result per
    /// statement.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<SimpleQueryResult>> {
        self.ready().await?;
        self.stream.simple_query(sql).await?;

        let mut results = Vec::new();
        let mut current = SimpleQueryResult::default();
        let mut failure: Option<PgError> = None;

        loop {
            match self.recv().await? {
                Message::RowDescription { fields } => {
                    current.columns = Arc::new(fields);
                }
                Message::DataRow { values } => {
                    if failure.is_none() {
                        match Row::new(Arc::clone(&current.columns), values, Arc::clone(&self.types)) {
                            Ok(row) => current.rows.push(row),
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                Message::CommandComplete { tag } => {
                    current.tag = Some(tag);
                    results.push(std::mem::take(&mut current));
                }
                Message::EmptyQueryResponse => {
                    results.push(std::mem::take(&mut current));
                }
                Message::ErrorResponse(e) => {
                    failure.get_or_insert(e.into());
                }
                Message::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(self.unexpected("simple query", &other)),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Simple query without the readiness check, for internal commands.
    pub(crate) async fn simple_exec(&mut self, sql: &str) -> PgResult<u64> {
        self.stream.simple_query(sql).await?;

        let mut affected = 0u64;
        let mut error = None;

        loop {
            match self.recv().await? {
                Message::CommandComplete { tag } => affected += tag.rows_affected(),
                Message::ErrorResponse(e) => error = Some(e),
                Message::RowDescription { .. } | Message::DataRow { .. } | Message::EmptyQueryResponse => {}
                Message::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(self.unexpected("simple query", &other)),
            }
        }

        match error {
            Some(e) => Err(e.into()),
            None => Ok(affected),
        }
    }

    // ========================================================================
    // Extended query protocol
    // ========================================================================

    /// Run a row-returning query through the unnamed statement.
    pub async fn query(&mut self, sql: &str, args: &[PgValue]) -> PgResult<Rows<'_>> {
        self.ready().await?;
        let stmt = self.prepare_inner("", sql, &[]).await?;
        let bound = stmt.encode_args(args)?;
        self.start_portal(&stmt.name, &bound).await?;
        Ok(Rows::new(self, Arc::clone(&stmt.columns)))
    }

    /// Prepare `sql` under a generated statement name.
    pub async fn prepare(&mut self, sql: &str) -> PgResult<Statement<'_>> {
        self.prepare_typed(sql, &[]).await
    }

    /// Prepare with explicit parameter types; `Oid::UNSPECIFIED` lets the
    /// server infer a position.
    pub async fn prepare_typed(&mut self, sql: &str, param_types: &[Oid]) -> PgResult<Statement<'_>> {
        self.ready().await?;
        self.next_statement_id += 1;
        let name = format!("__pqwire_{}", self.next_statement_id);
        let stmt = self.prepare_inner(&name, sql, param_types).await?;
        Ok(Statement::new(self, stmt))
    }

    /// Prepare `sql` under `name`. An empty name is the unnamed statement,
    /// which the next [`Connection::query`] replaces.
    pub async fn prepare_named(&mut self, name: &str, sql: &str) -> PgResult<Statement<'_>> {
        self.ready().await?;
        let stmt = self.prepare_inner(name, sql, &[]).await?;
        Ok(Statement::new(self, stmt))
    }

    /// Re-attach a statement prepared earlier on this connection.
    pub fn statement(&mut self, prepared: PreparedStatement) -> Statement<'_> {
        Statement::new(self, prepared)
    }

    /// Parse + Sync, then Describe + Sync.
    async fn prepare_inner(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<PreparedStatement> {
        self.stream.parse(name, sql, param_types).await?;
        self.stream.sync().await?;

        let mut error = None;
        loop {
            match self.recv().await? {
                Message::ParseComplete => {}
                Message::ErrorResponse(e) => error = Some(e),
                Message::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(self.unexpected("parse", &other)),
            }
        }
        if let Some(e) = error {
            return Err(e.into());
        }

        self.stream.describe(Target::Statement, name).await?;
        self.stream.sync().await?;

        let mut stmt = PreparedStatement::new(name.to_string(), sql.to_string());
        let mut error = None;
        loop {
            match self.recv().await? {
                Message::ParameterDescription { type_oids } => stmt.set_param_types(type_oids),
                Message::RowDescription { fields } => stmt.set_columns(fields),
                Message::NoData => {}
                Message::ErrorResponse(e) => error = Some(e),
                Message::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(self.unexpected("describe", &other)),
            }
        }
        if let Some(e) = error {
            return Err(e.into());
        }

        debug!(
            statement = name,
            params = stmt.param_types.len(),
            columns = stmt.columns.len(),
            "statement prepared"
        );
        Ok(stmt)
    }

    /// Bind + Execute + Sync on the unnamed portal; returns once BindComplete
    /// arrived, leaving the rows to the caller.
    pub(crate) async fn start_portal(&mut self, statement: &str, args: &[Option<String>]) -> PgResult<()> {
        self.stream.bind("", statement, args).await?;
        self.stream.execute("", 0).await?;
        self.stream.sync().await?;

        match self.recv().await? {
            Message::BindComplete => Ok(()),
            Message::ErrorResponse(e) => {
                self.drain_until_ready().await?;
                Err(e.into())
            }
            other => Err(self.unexpected("bind", &other)),
        }
    }

    /// Close + Sync for a prepared statement.
    pub(crate) async fn close_statement(&mut self, name: &str) -> PgResult<()> {
        self.ready().await?;
        self.stream.close(Target::Statement, name).await?;
        self.stream.sync().await?;

        let mut error = None;
        loop {
            match self.recv().await? {
                Message::CloseComplete => {}
                Message::ErrorResponse(e) => error = Some(e),
                Message::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                other => return Err(self.unexpected("close", &other)),
            }
        }

        match error {
            Some(e) => Err(e.into()),
            None => {
                debug!(statement = name, "statement closed");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Transactions and session state
    // ========================================================================

    /// Start a transaction. Dropping it without commit rolls it back before
    /// the next command.
    pub async fn begin(&mut self) -> PgResult<Transaction<'_>> {
        self.ready().await?;
        self.simple_exec("BEGIN").await?;
        Ok(Transaction::new(self))
    }

    /// Handle to the LISTEN/NOTIFY feed.
    pub fn notifications(&self) -> Notifications {
        self.stream.notifications().clone()
    }

    /// A session parameter reported by the server, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Transaction status from the most recent ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a fatal error left the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.broken || self.stream.is_broken()
    }

    /// Send Terminate. Further calls fail with [`PgError::ConnectionClosed`].
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.is_broken() {
            return Ok(());
        }
        self.stream.terminate().await
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Bring the stream back to a request boundary before a new request.
    pub(crate) async fn ready(&mut self) -> PgResult<()> {
        if self.closed || self.is_broken() {
            return Err(PgError::ConnectionClosed);
        }
        if self.needs_drain {
            debug!("draining abandoned result set");
            self.drain_until_ready().await?;
            self.needs_drain = false;
        }
        if self.pending_rollback {
            self.pending_rollback = false;
            debug!("rolling back abandoned transaction");
            self.simple_exec("ROLLBACK").await?;
        }
        Ok(())
    }

    /// Next backend message of the current request.
    ///
    /// ParameterStatus may arrive in any phase; it updates the session
    /// parameters and is never returned.
    pub(crate) async fn recv(&mut self) -> PgResult<Message> {
        loop {
            match self.stream.next().await {
                Ok(Some(Message::ParameterStatus { name, value })) => {
                    debug!(%name, %value, "session parameter");
                    self.parameters.insert(name, value);
                }
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {
                    self.broken = true;
                    return Err(PgError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    )));
                }
                Err(e) => {
                    self.broken = true;
                    return Err(e);
                }
            }
        }
    }

    /// Skip everything up to and including ReadyForQuery.
    pub(crate) async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let Message::ReadyForQuery { status } = self.recv().await? {
                self.transaction_status = status;
                return Ok(());
            }
        }
    }

    pub(crate) fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
    }

    /// Mark the connection broken and describe the stray message.
    pub(crate) fn unexpected(&mut self, phase: &str, msg: &Message) -> PgError {
        self.broken = true;
        debug!(phase, tag = %(msg.tag() as char), "unexpected message, connection is broken");
        PgError::Protocol(format!(
            "unexpected message ({}) during {}",
            msg.tag() as char,
            phase
        ))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend_key", &self.backend_key)
            .field("transaction_status", &self.transaction_status)
            .field("closed", &self.closed)
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}
