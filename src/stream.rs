//! Protocol-level connection: typed frontend sends and the backend message feed.
//!
//! `PgStream` knows nothing about request phases. It encodes one frontend
//! message per call and hands back decoded backend messages in arrival order.
//! Sequencing is the job of [`crate::Connection`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{PgError, PgResult};
use crate::notify::{self, Notifications, OverflowPolicy};
use crate::protocol::*;
use crate::scanner::{self, ScanItem};
use crate::types::Oid;

/// Any byte stream a connection can run over: TCP, TLS, Unix socket, or an
/// in-memory duplex in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type Writer = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// The server closed the stream cleanly.
    Ended,
    /// A transport error was seen; nothing more can be sent or received.
    Broken,
}

/// Framed, demultiplexed PostgreSQL connection.
pub struct PgStream {
    writer: Writer,
    messages: mpsc::Receiver<ScanItem>,
    notifications: Notifications,
    scanner: JoinHandle<()>,
    state: State,
}

impl PgStream {
    /// Split `transport` and start the scanner on its read half.
    pub fn new<T: Transport>(transport: T, notify_capacity: usize, overflow: OverflowPolicy) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let (tx, rx) = mpsc::channel(1);
        let (notify_tx, notifications) = notify::channel(notify_capacity, overflow);

        let scanner = scanner::spawn(read_half, tx, notify_tx);
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        Self {
            writer: BufWriter::new(write_half),
            messages: rx,
            notifications,
            scanner,
            state: State::Open,
        }
    }

    /// Handle to the notification feed of this connection.
    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    /// Whether a transport failure has made the stream unusable.
    pub fn is_broken(&self) -> bool {
        self.state == State::Broken
    }

    // ========================================================================
    // Send side
    // ========================================================================

    pub async fn startup(&mut self, params: &[(String, String)]) -> PgResult<()> {
        self.send(&StartupMessage { params }).await
    }

    /// Answer a cleartext password request.
    pub async fn password(&mut self, password: &str) -> PgResult<()> {
        self.send(&PasswordMessage { password }).await
    }

    /// Answer an MD5 password request with the salted hash.
    pub async fn password_md5(&mut self, salt: &[u8; 4], user: &str, password: &str) -> PgResult<()> {
        let hashed = md5_password(user, password, salt);
        self.send(&PasswordMessage { password: &hashed }).await
    }

    pub async fn sasl_initial_response(&mut self, mechanism: &str, data: &[u8]) -> PgResult<()> {
        self.send(&SaslInitialResponseMessage { mechanism, data }).await
    }

    pub async fn sasl_response(&mut self, data: &[u8]) -> PgResult<()> {
        self.send(&SaslResponseMessage { data }).await
    }

    pub async fn simple_query(&mut self, query: &str) -> PgResult<()> {
        self.send(&QueryMessage { query }).await
    }

    pub async fn parse(&mut self, name: &str, query: &str, param_types: &[Oid]) -> PgResult<()> {
        check_param_count(param_types.len())?;
        self.send(&ParseMessage {
            name,
            query,
            param_types,
        })
        .await
    }

    /// Bind text-format arguments; `None` binds SQL NULL.
    pub async fn bind(&mut self, portal: &str, statement: &str, params: &[Option<String>]) -> PgResult<()> {
        check_param_count(params.len())?;
        self.send(&BindMessage {
            portal,
            statement,
            params,
        })
        .await
    }

    /// Run a bound portal. `max_rows` of 0 means no limit.
    pub async fn execute(&mut self, portal: &str, max_rows: i32) -> PgResult<()> {
        self.send(&ExecuteMessage { portal, max_rows }).await
    }

    pub async fn describe(&mut self, target: Target, name: &str) -> PgResult<()> {
        self.send(&DescribeMessage { target, name }).await
    }

    pub async fn sync(&mut self) -> PgResult<()> {
        self.send(&SyncMessage).await
    }

    pub async fn flush(&mut self) -> PgResult<()> {
        self.send(&FlushMessage).await
    }

    pub async fn close(&mut self, target: Target, name: &str) -> PgResult<()> {
        self.send(&CloseMessage { target, name }).await
    }

    pub async fn terminate(&mut self) -> PgResult<()> {
        self.send(&TerminateMessage).await
    }

    async fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        if self.state == State::Broken {
            return Err(PgError::ConnectionClosed);
        }

        let encoded = msg.encode()?;

        trace!(
            tag = %M::TAG.map(char::from).unwrap_or('-'),
            length = encoded.len(),
            "-> frontend"
        );

        let result = async {
            self.writer.write_all(&encoded).await?;
            self.writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.state = State::Broken;
            PgError::Io(e)
        })
    }

    // ========================================================================
    // Receive side
    // ========================================================================

    /// Next backend message.
    ///
    /// `Ok(None)` once the server closed the stream cleanly. After a
    /// transport error every call fails with [`PgError::ConnectionClosed`].
    pub async fn next(&mut self) -> PgResult<Option<Message>> {
        match self.state {
            State::Broken => return Err(PgError::ConnectionClosed),
            State::Ended => return Ok(None),
            State::Open => {}
        }

        match self.messages.recv().await {
            Some(Ok(raw)) => raw.decode().map(Some),
            Some(Err(e)) => {
                self.state = State::Broken;
                Err(e)
            }
            None => {
                self.state = State::Ended;
                Ok(None)
            }
        }
    }
}

impl Drop for PgStream {
    fn drop(&mut self) {
        self.scanner.abort();
    }
}

impl std::fmt::Debug for PgStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStream")
            .field("state", &self.state)
            .field("notifications", &self.notifications)
            .finish_non_exhaustive()
    }
}

fn check_param_count(n: usize) -> PgResult<()> {
    if n > i16::MAX as usize {
        return Err(PgError::Protocol(format!(
            "too many parameters: {} (max {})",
            n,
            i16::MAX
        )));
    }
    Ok(())
}

/// Salted MD5 password response: `"md5" + hex(md5(hex(md5(password + user)) + salt))`.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());

    let mut outer = hex::encode(inner.0).into_bytes();
    outer.extend_from_slice(salt);

    format!("md5{}", hex::encode(md5::compute(&outer).0))
}
