//! One SSE client: a response sink with serialized, immediately flushed
//! writes and a single-shot close tied to a cancellation token.

use std::{
    io::{self, Write},
    sync::Arc,
    thread,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, Once, RwLock};
use serde::Serialize;

use crate::{
    error::{Error, Result},
    sse::{event::Event, token::CancelToken},
};

/// Response head for an event stream. The host server owns the status
/// line; this block disables caching and proxy buffering and is written
/// verbatim on upgrade.
const STREAM_HEADERS: &[u8] = b"Content-Type: text/event-stream\r\n\
    Cache-Control: no-cache\r\n\
    Connection: keep-alive\r\n\
    X-Accel-Buffering: no\r\n\r\n";

/// An active Server-Sent Events connection.
///
/// Clones share the connection. Sends are serialized and flushed
/// immediately so events reach the client without sitting in a buffer.
/// Closing is idempotent and also happens automatically when the
/// cancellation token supplied at upgrade fires.
#[derive(Clone)]
pub struct SseConnection {
    inner: Arc<SseInner>,
}

struct SseInner {
    writer: Mutex<Box<dyn Write + Send>>,
    token: CancelToken,
    closed: RwLock<bool>,
    close_latch: Once,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
}

impl std::fmt::Debug for SseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SseConnection {
    /// Upgrade a response sink to an event stream.
    ///
    /// Writes the stream headers and the initial `: connected` comment,
    /// then flushes. A sink that reports flushing as unsupported fails the
    /// upgrade with [`Error::NoFlusher`].
    pub fn upgrade<W: Write + Send + 'static>(writer: W) -> Result<SseConnection> {
        SseConnection::upgrade_with_token(writer, CancelToken::new())
    }

    /// [`SseConnection::upgrade`] with a caller-supplied cancellation
    /// token. When the token fires, a watcher closes the connection
    /// exactly once.
    pub fn upgrade_with_token<W: Write + Send + 'static>(
        writer: W,
        token: CancelToken,
    ) -> Result<SseConnection> {
        let mut writer: Box<dyn Write + Send> = Box::new(writer);

        writer.write_all(STREAM_HEADERS)?;
        writer.write_all(b": connected\n\n")?;
        writer.flush().map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported {
                Error::NoFlusher
            } else {
                Error::Io(e)
            }
        })?;

        let (done_tx, done_rx) = bounded(0);
        let connection = SseConnection {
            inner: Arc::new(SseInner {
                writer: Mutex::new(writer),
                token: token.clone(),
                closed: RwLock::new(false),
                close_latch: Once::new(),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        };

        let watcher = connection.clone();
        thread::spawn(move || {
            token.wait();
            let _ = watcher.close();
        });

        Ok(connection)
    }

    /// Send one event.
    pub fn send(&self, event: &Event) -> Result<()> {
        self.write_record(event.to_string().as_bytes())
    }

    /// Send a data-only event.
    pub fn send_data(&self, data: &str) -> Result<()> {
        self.send(&Event::new(data))
    }

    /// Serialize a value to JSON and send it as a data-only event.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send_data(&serde_json::to_string(value)?)
    }

    /// Send a comment, e.g. as a keep-alive.
    pub fn send_comment(&self, text: &str) -> Result<()> {
        self.write_record(Event::comment(text).as_bytes())
    }

    fn write_record(&self, record: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock();

        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        writer.write_all(record)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the connection: latch, cancel the token and drop the done
    /// sender. Safe to call any number of times; only the first has
    /// effect.
    pub fn close(&self) -> Result<()> {
        self.inner.close_latch.call_once(|| {
            *self.inner.closed.write() = true;
            self.inner.token.cancel();
            *self.inner.done_tx.lock() = None;
        });
        Ok(())
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.read()
    }

    /// The cancellation token tied to this connection.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.token
    }

    /// A receiver that becomes disconnected when the connection closes.
    /// Blocking on `recv()` is the way to park a thread until shutdown.
    pub fn done(&self) -> Receiver<()> {
        self.inner.done_rx.clone()
    }

    /// Identity key for hub membership.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SharedBuf;
    use std::time::Duration;

    #[test]
    fn upgrade_writes_headers_and_connected_comment() {
        let out = SharedBuf::new();
        let _conn = SseConnection::upgrade(out.clone()).unwrap();

        let expected = [
            &b"Content-Type: text/event-stream\r\n\
               Cache-Control: no-cache\r\n\
               Connection: keep-alive\r\n\
               X-Accel-Buffering: no\r\n\r\n"[..],
            b": connected\n\n",
        ]
        .concat();
        assert_eq!(out.contents(), expected);
    }

    #[test]
    fn sends_are_flushed_in_order() {
        let out = SharedBuf::new();
        let conn = SseConnection::upgrade(out.clone()).unwrap();
        let base = out.contents().len();

        conn.send(&Event::new("one").with_id("1")).unwrap();
        conn.send_data("two").unwrap();
        conn.send_comment("hb").unwrap();

        let written = out.contents()[base..].to_vec();
        assert_eq!(
            String::from_utf8(written).unwrap(),
            "id: 1\ndata: one\n\ndata: two\n\n: hb\n\n"
        );
    }

    #[test]
    fn send_json_emits_data_event() {
        #[derive(Serialize)]
        struct Status {
            ok: bool,
        }

        let out = SharedBuf::new();
        let conn = SseConnection::upgrade(out.clone()).unwrap();
        let base = out.contents().len();

        conn.send_json(&Status { ok: true }).unwrap();
        assert_eq!(&out.contents()[base..], "data: {\"ok\":true}\n\n".as_bytes());
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_sends() {
        let out = SharedBuf::new();
        let conn = SseConnection::upgrade(out.clone()).unwrap();

        conn.close().unwrap();
        conn.close().unwrap();

        assert!(conn.is_closed());
        assert!(conn.cancel_token().is_cancelled());
        assert!(matches!(conn.send_data("late").unwrap_err(), Error::ConnectionClosed));
    }

    #[test]
    fn done_disconnects_on_close() {
        let conn = SseConnection::upgrade(SharedBuf::new()).unwrap();
        let done = conn.done();

        assert!(done.try_recv().is_err());
        conn.close().unwrap();
        assert!(done.recv().is_err(), "sender dropped on close");
    }

    #[test]
    fn cancellation_token_closes_exactly_once() {
        let token = CancelToken::new();
        let conn = SseConnection::upgrade_with_token(SharedBuf::new(), token.clone()).unwrap();
        let done = conn.done();

        token.cancel();
        assert!(done.recv_timeout(Duration::from_secs(5)).is_err());
        assert!(conn.is_closed());
    }

    #[test]
    fn failed_send_surfaces_io_error() {
        let out = SharedBuf::new();
        let conn = SseConnection::upgrade(out.clone()).unwrap();
        out.break_pipe();

        assert!(matches!(conn.send_data("x").unwrap_err(), Error::Io(_)));
    }
}
