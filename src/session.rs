//! Connection session: ownership of one TCP connection to a debuggee host.
//!
//! The session appends inbound bytes to a receive buffer, slices complete
//! frames off the front, and demultiplexes them: response frames complete
//! the pending request they are correlated to by request id, unsolicited
//! frames surface on the notice channel. A heartbeat frame is sent on a
//! fixed interval; a connection-wide idle timer tears the session down when
//! the peer stops producing frames entirely.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::muted_error;
use crate::proto::codec::Header;
use crate::proto::{Message, StackFrame, HEADER_LEN};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DEBUG_PORT: u16 = 14088;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Unsolicited traffic surfaced to the session owner.
#[derive(Debug)]
pub enum Notice {
    /// Host accepted the session; the application-level handshake is done.
    Accepted,
    /// Host refused the session.
    Denied,
    /// New call-stack snapshot, replacing any previous one wholesale.
    StackUpdate {
        exec_space: String,
        frames: Vec<StackFrame>,
    },
    /// The session died on its own: EOF, read error, malformed frame,
    /// idle timeout or a failed heartbeat write. Not emitted for a locally
    /// initiated [`Session::close`].
    Closed(Error),
}

struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Message, Error>>>>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

/// Handle to one live connection. Cheap to clone; the connection is torn
/// down when [`Session::close`] is called or the read loop dies.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Open a TCP connection to `host:port` and spawn the read loop and the
    /// heartbeat timer. A connect failure never leaves a half-open session
    /// behind.
    pub async fn connect(
        host: &str,
        port: u16,
        config: &SessionConfig,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> Result<Session, Error> {
        let addr = format!("{host}:{port}");
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                Error::Connect(
                    addr.clone(),
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                )
            })?
            .map_err(|e| Error::Connect(addr.clone(), e))?;
        muted_error!(stream.set_nodelay(true), "set_nodelay:");
        log::info!(target: "session", "connected to debuggee host at {addr}");

        let (reader, writer) = stream.into_split();
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            reader,
            inner.clone(),
            notices.clone(),
            config.idle_timeout,
        ));
        tokio::spawn(heartbeat_loop(
            inner.clone(),
            notices,
            config.heartbeat_interval,
        ));

        Ok(Session { inner })
    }

    /// Tear the session down. Idempotent. Pending requests are resolved
    /// with [`Error::ConnectionClosed`]; no `Closed` notice is emitted.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Send a frame without expecting any response.
    pub async fn send(&self, msg: &Message) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        write_frame(&self.inner, msg).await
    }

    /// Allocate a fresh request id, send the frame built from it and await
    /// the correlated response. Resolves with [`Error::Request`] on a
    /// `FailureResponse` and [`Error::ConnectionClosed`] when the session is
    /// torn down while the request is in flight.
    pub async fn request(&self, build: impl FnOnce(u32) -> Message) -> Result<Message, Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        // The id counter starts at zero and is incremented before use.
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let msg = build(id);
        if let Err(e) = write_frame(&self.inner, &msg).await {
            let mut pending = self.inner.pending.lock().await;
            pending.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped at teardown: no response will ever arrive.
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

async fn write_frame(inner: &Inner, msg: &Message) -> Result<(), Error> {
    let frame = msg.encode();
    let mut writer = inner.writer.lock().await;
    writer.write_all(&frame).await?;
    Ok(())
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inner: Arc<Inner>,
    notices: mpsc::UnboundedSender<Notice>,
    idle_timeout: Duration,
) {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let idle = time::sleep(idle_timeout);
    tokio::pin!(idle);

    let reason: Option<Error> = loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            _ = &mut idle => break Some(Error::IdleTimeout(idle_timeout)),
            res = reader.read_buf(&mut buf) => match res {
                Ok(0) => break Some(Error::ConnectionClosed),
                Ok(_) => match drain_frames(&inner, &notices, &mut buf).await {
                    Ok(0) => {}
                    Ok(_) => idle.as_mut().reset(Instant::now() + idle_timeout),
                    Err(e) => break Some(e),
                },
                Err(e) => break Some(Error::IO(e)),
            }
        }
    };

    inner.shutdown.cancel();

    // Pending callbacks are discarded, never invoked: dropping the senders
    // resolves every in-flight `request` with `ConnectionClosed`.
    let pending = {
        let mut guard = inner.pending.lock().await;
        std::mem::take(&mut *guard)
    };
    drop(pending);

    let _ = inner.writer.lock().await.shutdown().await;

    if let Some(err) = reason {
        log::warn!(target: "session", "session closed: {err:#}");
        let _ = notices.send(Notice::Closed(err));
    } else {
        log::info!(target: "session", "session closed");
    }
}

/// Consume every complete frame buffered so far. Returns the number of
/// frames processed; a partial frame at the tail stays buffered until more
/// bytes arrive.
async fn drain_frames(
    inner: &Inner,
    notices: &mpsc::UnboundedSender<Notice>,
    buf: &mut BytesMut,
) -> Result<usize, Error> {
    let mut processed = 0;
    while buf.len() >= HEADER_LEN {
        let header = Header::decode(&buf[..HEADER_LEN])?;
        let total_len = header.total_len as usize;
        if buf.len() < total_len {
            break;
        }
        let frame = buf.split_to(total_len);
        let msg = Message::decode(header.message_type, &frame[HEADER_LEN..])?;
        dispatch(inner, notices, msg).await;
        processed += 1;
    }
    Ok(processed)
}

async fn dispatch(inner: &Inner, notices: &mpsc::UnboundedSender<Notice>, msg: Message) {
    log::trace!(target: "session", "frame received: {:?}", msg.message_type());
    match msg {
        // Peer keep-alive, nothing to do beyond resetting the idle timer.
        Message::Heartbeat => {}
        Message::AcceptConnection => {
            let _ = notices.send(Notice::Accepted);
        }
        Message::DenyConnection => {
            let _ = notices.send(Notice::Denied);
        }
        Message::UpdateCallStack { exec_space, frames } => {
            let _ = notices.send(Notice::StackUpdate { exec_space, frames });
        }
        Message::FailureResponse { request_id, reason } => {
            complete(inner, request_id, Err(Error::Request(reason))).await;
        }
        other => match other.request_id() {
            Some(request_id) => complete(inner, request_id, Ok(other)).await,
            None => {
                log::warn!(
                    target: "session",
                    "unexpected client-bound frame {:?}, dropped",
                    other.message_type()
                );
            }
        },
    }
}

async fn complete(inner: &Inner, request_id: u32, result: Result<Message, Error>) {
    let tx = {
        let mut pending = inner.pending.lock().await;
        pending.remove(&request_id)
    };
    match tx {
        Some(tx) => {
            let _ = tx.send(result);
        }
        // Stale response, e.g. the owner is already gone. Drop silently.
        None => log::debug!(target: "session", "response for unknown request {request_id}, dropped"),
    }
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    notices: mpsc::UnboundedSender<Notice>,
    interval: Duration,
) {
    let mut tick = time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = write_frame(&inner, &Message::Heartbeat).await {
                    // Skip the notice when the failure is our own teardown
                    // closing the writer underneath the in-flight write.
                    if !inner.shutdown.is_cancelled() {
                        log::warn!(target: "session", "heartbeat failed: {e:#}");
                        let _ = notices.send(Notice::Closed(e));
                    }
                    inner.shutdown.cancel();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_heartbeat_write_failure_surfaces_as_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(30),
        };
        let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
        let (session, accepted) = tokio::join!(
            Session::connect("127.0.0.1", port, &config, notice_tx),
            listener.accept()
        );
        let session = session.unwrap();
        let _peer = accepted.unwrap();

        // Break the write half while the peer stays silent but alive, so
        // the next heartbeat write fails without the read side noticing.
        session.inner.writer.lock().await.shutdown().await.unwrap();

        let notice = time::timeout(Duration::from_secs(5), notice_rx.recv())
            .await
            .expect("no teardown notice within the timeout")
            .expect("notice channel closed without a teardown notice");
        assert!(matches!(notice, Notice::Closed(_)));
        assert!(session.is_closed());
    }
}
