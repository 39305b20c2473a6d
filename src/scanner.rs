//! Background reader that frames backend messages and splits them by kind.
//!
//! One scanner task runs per connection and owns the read half of the
//! transport. Notices go to the log, notifications go to the notification
//! queue, and everything else is forwarded in order on the primary channel.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{PgResult, ServerError};
use crate::notify::NotificationSender;
use crate::protocol::{tag, Header, Message, RawMessage};

/// Items on the primary channel. An `Err` is always the last item.
pub(crate) type ScanItem = PgResult<RawMessage>;

/// Start the scanner task for `reader`.
pub(crate) fn spawn<R>(
    reader: R,
    messages: mpsc::Sender<ScanItem>,
    notifications: NotificationSender,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let scanner = Scanner {
        reader,
        messages,
        notifications,
    };
    tokio::spawn(scanner.run())
}

struct Scanner<R> {
    reader: R,
    messages: mpsc::Sender<ScanItem>,
    notifications: NotificationSender,
}

impl<R: AsyncRead + Unpin> Scanner<R> {
    async fn run(mut self) {
        match self.scan().await {
            Ok(()) => debug!("scanner reached end of stream"),
            Err(e) => {
                debug!(error = %e, "scanner stopped");
                let _ = self.messages.send(Err(e)).await;
            }
        }
        self.notifications.finish();
    }

    async fn scan(&mut self) -> PgResult<()> {
        while let Some(msg) = self.read_message().await? {
            match msg.header.tag {
                tag::NOTICE_RESPONSE => log_notice(msg),
                tag::NOTIFICATION_RESPONSE => match msg.decode() {
                    Ok(Message::NotificationResponse(n)) => self.notifications.send(n).await,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "dropping malformed notification"),
                },
                _ => {
                    if self.messages.send(Ok(msg)).await.is_err() {
                        debug!("primary channel closed, scanner exiting");
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Read one framed message; `None` on EOF at a message boundary.
    async fn read_message(&mut self) -> PgResult<Option<RawMessage>> {
        let mut raw = [0u8; Header::SIZE];
        if self.reader.read(&mut raw[..1]).await? == 0 {
            return Ok(None);
        }
        self.reader.read_exact(&mut raw[1..]).await?;
        let header = Header::parse(raw)?;

        let mut body = BytesMut::zeroed(header.body_len());
        self.reader.read_exact(&mut body).await?;

        trace!(tag = %(header.tag as char), length = header.length, "<- backend");
        Ok(Some(RawMessage {
            header,
            body: body.freeze(),
        }))
    }
}

fn log_notice(msg: RawMessage) {
    match msg.decode() {
        Ok(Message::NoticeResponse(notice)) => emit_notice(&notice),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "dropping malformed notice"),
    }
}

fn emit_notice(notice: &ServerError) {
    if notice.severity() == "WARNING" {
        warn!(code = notice.code(), "{}", notice.message());
    } else {
        info!(
            severity = notice.severity(),
            code = notice.code(),
            "{}",
            notice.message()
        );
    }
}
