//! The tether server.
//!
//! Owns one child on a PTY and serves a single client at a time over a
//! Unix socket. [`Session`] holds the state; this module only moves bytes
//! between it, the socket and the PTY.

mod buffer;
mod ere;
mod lifecycle;
mod matcher;
mod pending;
mod session;

pub use buffer::{OutputBuffer, RAW_CAPACITY, RETAIN_BYTES, StreamOffset};
pub use lifecycle::{DEFAULT_TIMEOUT, ExitReason, Policies, Snapshot, evaluate};
pub use matcher::{Captures, MatchEnd, Matcher, PatternError};
pub use pending::{PassError, PendingOp};
pub use session::{Dispatch, ExitFlag, Session};

use crate::codec::{HEADER_SIZE, Tag, Tlv};
use crate::protocol::{ErrorCode, Reply};
use crate::pty::{ChildPty, PtyProcess};
use crate::transport::{self, MAX_FRAME_SIZE, TransportError};
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Loop wake-up interval when nothing else happens.
const TICK: Duration = Duration::from_millis(10);

/// Longest a single reply may take to reach the client.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest a new connection may take to say `HELLO`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decoded frames buffered between the reader task and the loop.
const INBOX_DEPTH: usize = 16;

// a full raw buffer must fit in one OUTPUT frame
const _: () = assert!(RAW_CAPACITY + 2 * HEADER_SIZE <= MAX_FRAME_SIZE);

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] io::Error),

    #[error("sockpath in use: {}", .0.display())]
    InUse(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

/// Bind and listen on `path`, owner-only.
///
/// Refuses symlinks and paths a live server answers on; a stale socket
/// or regular file is replaced.
pub fn bind(path: &Path) -> Result<std::os::unix::net::UnixListener, ServerError> {
    if is_server_running(path) {
        return Err(ServerError::InUse(path.to_path_buf()));
    }

    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_type().is_symlink() {
            return Err(ServerError::Bind(io::Error::other(
                "socket path is a symlink - possible security attack",
            )));
        }
        if metadata.file_type().is_socket() || metadata.file_type().is_file() {
            std::fs::remove_file(path).ok();
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path).map_err(ServerError::Bind)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(ServerError::Io)?;
    listener.set_nonblocking(true).map_err(ServerError::Io)?;
    Ok(listener)
}

/// Check if a server is running by trying to connect.
#[must_use]
pub fn is_server_running(socket_path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(socket_path).is_ok()
}

/// The attached client.
struct Connection {
    writer: OwnedWriteHalf,
    inbox: mpsc::Receiver<Result<Tlv, TransportError>>,
    reader: JoinHandle<()>,
    /// Set until the client has said `HELLO`.
    hello_by: Option<Instant>,
}

impl Connection {
    /// Start reading frames from `stream` in a task of their own.
    fn open(stream: UnixStream, now: Instant) -> Self {
        let (mut reader, writer) = stream.into_split();
        let (tx, inbox) = mpsc::channel(INBOX_DEPTH);
        let reader = tokio::spawn(async move {
            loop {
                let msg = transport::recv(&mut reader).await;
                let done = msg.is_err();
                if tx.send(msg).await.is_err() || done {
                    break;
                }
            }
        });
        Self {
            writer,
            inbox,
            reader,
            hello_by: Some(now + HANDSHAKE_TIMEOUT),
        }
    }

    const fn greeted(&self) -> bool {
        self.hello_by.is_none()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum Wake {
    Accept(io::Result<UnixStream>),
    Pty(io::Result<usize>),
    Message(Option<Result<Tlv, TransportError>>),
    Tick,
}

async fn next_message(conn: &mut Option<Connection>) -> Option<Result<Tlv, TransportError>> {
    match conn {
        Some(conn) => conn.inbox.recv().await,
        None => std::future::pending().await,
    }
}

async fn deliver(writer: &mut OwnedWriteHalf, replies: &[Reply]) -> Result<(), TransportError> {
    for reply in replies {
        let msg = reply.to_tlv();
        debug!(tag = msg.tag.get(), "sending reply");
        timeout(SEND_TIMEOUT, transport::send(writer, &msg))
            .await
            .map_err(|_| TransportError::Io(io::Error::from(io::ErrorKind::TimedOut)))??;
    }
    Ok(())
}

/// One session's server.
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    session: Session<PtyProcess>,
}

impl Server {
    /// Wrap a listener from [`bind`]. Must be called inside a runtime.
    pub fn new(
        socket_path: PathBuf,
        listener: std::os::unix::net::UnixListener,
        session: Session<PtyProcess>,
    ) -> Result<Self, ServerError> {
        let listener = UnixListener::from_std(listener).map_err(ServerError::Io)?;
        Ok(Self {
            socket_path,
            listener,
            session,
        })
    }

    /// Serve until a lifetime policy ends the session, then remove the socket.
    pub async fn run(mut self) -> Result<ExitReason, ServerError> {
        info!(path = ?self.socket_path, pid = self.session.pty().pid(), "server listening");
        let reason = self.serve().await;
        std::fs::remove_file(&self.socket_path).ok();
        info!(%reason, "server shut down");
        Ok(reason)
    }

    async fn serve(&mut self) -> ExitReason {
        let mut conn: Option<Connection> = None;
        let mut buf = vec![0u8; RAW_CAPACITY];

        loop {
            if let Some(reason) = self.session.tick(Instant::now()) {
                return reason;
            }

            let accepting = conn.is_none();
            let spare = self.session.spare().min(buf.len());
            let reading = self.session.pty().is_open() && spare > 0;

            let wake = tokio::select! {
                res = self.listener.accept(), if accepting => Wake::Accept(res.map(|(stream, _)| stream)),
                res = self.session.pty().read(&mut buf[..spare]), if reading => Wake::Pty(res),
                msg = next_message(&mut conn) => Wake::Message(msg),
                () = tokio::time::sleep(TICK) => Wake::Tick,
            };

            let now = Instant::now();
            match wake {
                Wake::Accept(Ok(stream)) => {
                    debug!("client connected, waiting for HELLO");
                    conn = Some(Connection::open(stream, now));
                }
                Wake::Accept(Err(e)) => warn!(error = %e, "accept failed"),
                Wake::Pty(Ok(0)) => self.session.pty_closed(),
                Wake::Pty(Ok(n)) => {
                    debug!(bytes = n, "read from PTY");
                    self.session.ingest(&buf[..n]);
                }
                Wake::Pty(Err(e)) => {
                    if e.raw_os_error() != Some(libc::EIO) {
                        warn!(error = %e, "PTY read failed");
                    }
                    self.session.pty_closed();
                }
                Wake::Message(Some(Ok(msg))) => {
                    debug!(tag = msg.tag.get(), "received message");
                    if let Some(c) = conn.as_mut() {
                        let greeting = !c.greeted();
                        let dispatch = if greeting {
                            self.greet(&msg, now)
                        } else {
                            self.session.handle_message(&msg, now)
                        };
                        let sent = deliver(&mut c.writer, &dispatch.replies).await;
                        if let Err(e) = &sent {
                            debug!(error = %e, "reply failed");
                        }
                        if dispatch.hangup || sent.is_err() {
                            self.hang_up(&mut conn, now);
                        } else if greeting {
                            c.hello_by = None;
                            self.session.connect(now);
                        }
                    }
                }
                Wake::Message(Some(Err(TransportError::Closed)) | None) => {
                    self.hang_up(&mut conn, now);
                }
                Wake::Message(Some(Err(e))) => {
                    warn!(error = %e, "dropping client");
                    self.hang_up(&mut conn, now);
                }
                Wake::Tick => {}
            }

            let now = Instant::now();
            if conn
                .as_ref()
                .and_then(|c| c.hello_by)
                .is_some_and(|deadline| now >= deadline)
            {
                debug!("handshake timed out");
                self.hang_up(&mut conn, now);
            }

            let replies = self.session.pump(now);
            if !replies.is_empty()
                && let Some(c) = conn.as_mut().filter(|c| c.greeted())
                && let Err(e) = deliver(&mut c.writer, &replies).await
            {
                debug!(error = %e, "forwarding failed, dropping client");
                self.hang_up(&mut conn, Instant::now());
            }

            self.session.settle();
        }
    }

    /// Answer the first frame of a connection, which must be `HELLO`.
    fn greet(&mut self, msg: &Tlv, now: Instant) -> Dispatch {
        if msg.tag == Tag::HELLO {
            self.session.handle_message(msg, now)
        } else {
            Dispatch {
                replies: vec![Reply::error(ErrorCode::Protocol, "expected HELLO")],
                hangup: true,
            }
        }
    }

    /// Drop the connection. Only a greeted client counts as a disconnect.
    fn hang_up(&mut self, conn: &mut Option<Connection>, now: Instant) {
        match conn.take() {
            Some(c) if c.greeted() => self.session.disconnect(now),
            Some(_) => self.session.touch(now),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_sets_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("s.sock");
        let _listener = bind(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(is_server_running(&path));
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let _listener = bind(&path).unwrap();
        assert!(matches!(bind(&path), Err(ServerError::InUse(_))));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        drop(bind(&path).unwrap());
        assert!(path.exists());
        assert!(!is_server_running(&path));
        assert!(bind(&path).is_ok());
    }

    #[test]
    fn test_bind_refuses_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"").unwrap();
        let path = dir.path().join("s.sock");
        std::os::unix::fs::symlink(&target, &path).unwrap();
        assert!(matches!(bind(&path), Err(ServerError::Bind(_))));
        assert!(target.exists());
    }
}
