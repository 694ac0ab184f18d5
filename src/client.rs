//! Client for communicating with a tether server.
//!
//! Every command is one connection: `HELLO`, a single request, the replies
//! it produces, then the `DISCONN` handshake.

#![allow(unsafe_code)] // getuid() call

use crate::protocol::{ErrorCode, PROTOCOL_VERSION, ProtocolError, Reply, Request, SessionInfo};
use crate::transport::{self, TransportError};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("bad reply: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{message}")]
    Server { code: ErrorCode, message: String },

    #[error("unexpected reply: {0}")]
    Unexpected(String),

    #[error("failed to write output: {0}")]
    Output(#[source] std::io::Error),
}

impl ClientError {
    /// Process exit status class for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Connect { .. } => ErrorCode::General,
            Self::Transport(_) | Self::Protocol(_) | Self::Unexpected(_) => ErrorCode::Protocol,
            Self::Server { code, .. } => *code,
            Self::Output(_) => ErrorCode::System,
        }
    }
}

/// Get the default socket path for the tether server.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("tether.sock")
    } else {
        // Fallback to /tmp/tether-$UID.sock
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/tether-{uid}.sock"))
    }
}

/// Map a raw wait status to a shell-style exit code.
#[must_use]
pub fn exit_code_for_status(status: i32) -> u8 {
    if libc::WIFEXITED(status) {
        u8::try_from(libc::WEXITSTATUS(status) & 0xff).unwrap_or(255)
    } else if libc::WIFSIGNALED(status) {
        u8::try_from(128 + libc::WTERMSIG(status)).unwrap_or(255)
    } else {
        255
    }
}

/// How a request finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ack,
    Matched,
    Eof,
    Exited { status: i32 },
    /// A streamed operation ended with an error; already past the point
    /// of being worth a message, only the exit code matters.
    Failed(ErrorCode),
    Text(Vec<u8>),
    Info(SessionInfo),
    /// The user left an interactive session.
    Detached,
}

impl Completion {
    /// Process exit code for this outcome.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Exited { status } => exit_code_for_status(*status),
            Self::Failed(code) => code.exit_status(),
            _ => 0,
        }
    }
}

/// A connected, greeted client.
pub struct Client {
    pub(crate) reader: OwnedReadHalf,
    pub(crate) writer: OwnedWriteHalf,
}

impl Client {
    /// Connect to the server at `socket_path` and say hello.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: socket_path.to_path_buf(),
                source,
            })?;
        debug!(path = ?socket_path, "connected to server");
        Self::from_stream(stream).await
    }

    /// Greet the server over an already-connected stream.
    pub async fn from_stream(stream: UnixStream) -> Result<Self, ClientError> {
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer };
        client
            .send(&Request::Hello {
                version: Some(PROTOCOL_VERSION),
            })
            .await?;
        match client.recv().await? {
            Reply::Hello { version } if version == PROTOCOL_VERSION => Ok(client),
            Reply::Hello { version } => Err(ClientError::Server {
                code: ErrorCode::Protocol,
                message: format!("server speaks protocol version {version}"),
            }),
            Reply::Error { code, message } => Err(ClientError::Server { code, message }),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), ClientError> {
        transport::send(&mut self.writer, &request.to_tlv()).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Reply, ClientError> {
        let msg = transport::recv(&mut self.reader).await?;
        Ok(Reply::from_tlv(&msg)?)
    }

    /// Send `request` and wait for it to finish, copying `OUTPUT` to `out`.
    ///
    /// Errors replied to a streamed operation become
    /// [`Completion::Failed`]; errors to any other request are returned.
    /// The connection is closed with the `DISCONN` handshake either way.
    pub async fn run(
        mut self,
        request: &Request,
        out: &mut dyn Write,
    ) -> Result<Completion, ClientError> {
        let passing = matches!(request, Request::Pass(_));
        self.send(request).await?;

        let completion = loop {
            match self.recv().await? {
                Reply::Output(data) => emit(out, &data)?,
                Reply::Ack => break Completion::Ack,
                Reply::Matched => break Completion::Matched,
                Reply::Eof => break Completion::Eof,
                Reply::Exited { status } => break Completion::Exited { status },
                Reply::ExpectOutText(text) => break Completion::Text(text),
                Reply::Info(info) => break Completion::Info(info),
                Reply::Error { code, .. } if passing => break Completion::Failed(code),
                Reply::Error { code, message } => {
                    return Err(ClientError::Server { code, message });
                }
                other => return Err(ClientError::Unexpected(format!("{other:?}"))),
            }
        };

        self.disconnect(out).await?;
        Ok(completion)
    }

    /// Say goodbye, printing any output that was still on its way.
    pub async fn disconnect(mut self, out: &mut dyn Write) -> Result<(), ClientError> {
        self.send(&Request::Disconnect).await?;
        loop {
            match self.recv().await {
                Ok(Reply::Disconnect) | Err(ClientError::Transport(TransportError::Closed)) => {
                    return Ok(());
                }
                Ok(Reply::Output(data)) => emit(out, &data)?,
                Ok(other) => debug!(?other, "ignoring reply while disconnecting"),
                Err(e) => return Err(e),
            }
        }
    }
}

fn emit(out: &mut dyn Write, data: &[u8]) -> Result<(), ClientError> {
    out.write_all(data)
        .and_then(|()| out.flush())
        .map_err(ClientError::Output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExpectFlags, PassRequest, Subcommand};

    /// Serve one scripted exchange: answer `HELLO`, then for each request
    /// send the listed replies.
    fn fake_server(stream: UnixStream, script: Vec<Vec<Reply>>) -> tokio::task::JoinHandle<Vec<Request>> {
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.into_split();
            let hello = transport::recv(&mut reader).await.unwrap();
            assert_eq!(
                Request::from_tlv(&hello).unwrap(),
                Request::Hello {
                    version: Some(PROTOCOL_VERSION)
                }
            );
            transport::send(&mut writer, &Reply::Hello { version: PROTOCOL_VERSION }.to_tlv())
                .await
                .unwrap();

            let mut seen = Vec::new();
            for replies in script {
                let msg = transport::recv(&mut reader).await.unwrap();
                seen.push(Request::from_tlv(&msg).unwrap());
                for reply in replies {
                    transport::send(&mut writer, &reply.to_tlv()).await.unwrap();
                }
            }
            seen
        })
    }

    fn expect(pattern: &str) -> Request {
        Request::Pass(PassRequest {
            subcommand: Subcommand::Expect,
            flags: ExpectFlags::EXACT,
            pattern: Some(pattern.as_bytes().to_vec()),
            timeout: None,
            lookback: None,
        })
    }

    #[test]
    fn test_default_socket_path() {
        let path = default_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name == "tether.sock" || name.starts_with("tether-"));
    }

    #[test]
    fn test_exit_code_for_status() {
        assert_eq!(exit_code_for_status(0), 0);
        assert_eq!(exit_code_for_status(3 << 8), 3);
        assert_eq!(exit_code_for_status(9), 137);
        assert_eq!(exit_code_for_status(15 | 0x80), 143);
        // stopped, not exited
        assert_eq!(exit_code_for_status(0x137f), 255);
    }

    #[test]
    fn test_completion_exit_codes() {
        assert_eq!(Completion::Matched.exit_code(), 0);
        assert_eq!(Completion::Failed(ErrorCode::Timeout).exit_code(), 207);
        assert_eq!(Completion::Exited { status: 1 << 8 }.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_expect_prints_output_and_late_output() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = fake_server(
            theirs,
            vec![
                vec![Reply::Output(b"login: ".to_vec()), Reply::Matched],
                vec![Reply::Output(b"late".to_vec()), Reply::Disconnect],
            ],
        );

        let client = Client::from_stream(ours).await.unwrap();
        let mut out = Vec::new();
        let done = client.run(&expect("login:"), &mut out).await.unwrap();
        assert_eq!(done, Completion::Matched);
        assert_eq!(out, b"login: late");

        let seen = server.await.unwrap();
        assert_eq!(seen[1], Request::Disconnect);
    }

    #[tokio::test]
    async fn test_pass_error_is_completion() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let _server = fake_server(
            theirs,
            vec![
                vec![Reply::error(ErrorCode::Timeout, "expect timed out")],
                vec![Reply::Disconnect],
            ],
        );
        let client = Client::from_stream(ours).await.unwrap();
        let done = client.run(&expect("x"), &mut Vec::new()).await.unwrap();
        assert_eq!(done, Completion::Failed(ErrorCode::Timeout));
    }

    #[tokio::test]
    async fn test_request_error_is_returned() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let _server = fake_server(
            theirs,
            vec![vec![Reply::error(ErrorCode::Usage, "index must be in range 0-9")]],
        );
        let client = Client::from_stream(ours).await.unwrap();
        let err = client
            .run(&Request::ExpectOut { index: 12 }, &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Usage);
        assert_eq!(err.to_string(), "index must be in range 0-9");
    }

    #[tokio::test]
    async fn test_server_closing_ends_disconnect() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let server = fake_server(theirs, vec![vec![Reply::Ack], vec![]]);
        let client = Client::from_stream(ours).await.unwrap();
        let done = client.run(&Request::Close, &mut Vec::new()).await.unwrap();
        assert_eq!(done, Completion::Ack);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_refused() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (mut reader, mut writer) = theirs.into_split();
            transport::recv(&mut reader).await.unwrap();
            let reply = Reply::error(ErrorCode::Protocol, "protocol version mismatch");
            transport::send(&mut writer, &reply.to_tlv()).await.unwrap();
        });
        let err = Client::from_stream(ours).await.err().unwrap();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }
}
