//! Harness for testing a live session.
//!
//! Runs a real server with a real PTY child inside the test's runtime:
//!
//! ```ignore
//! let session = TestSession::spawn(&["sh"]).await?;
//! session.send("echo hello\r").await?;
//! session.expect_exact("hello", 5).await?;
//! ```

use crate::client::{Client, ClientError, Completion};
use crate::protocol::{ExpectFlags, PassRequest, Request, Subcommand};
use crate::pty::{self, SpawnOptions};
use crate::server::{self, ExitFlag, ExitReason, Policies, Server, ServerError, Session};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Errors from the test harness.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("request failed: {0}")]
    Client(#[from] ClientError),

    #[error("server error: {0}")]
    Server(String),
}

/// The result of one client command: how it ended and what it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub completion: Completion,
    pub output: Vec<u8>,
}

impl Outcome {
    /// Printed output, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// A server on a unique socket, serving one child.
pub struct TestSession {
    socket_path: PathBuf,
    server: Option<JoinHandle<Result<ExitReason, ServerError>>>,
}

impl TestSession {
    /// Spawn `cmd` with default policies.
    pub async fn spawn(cmd: &[&str]) -> Result<Self, TestError> {
        Self::spawn_with(cmd, Policies::default()).await
    }

    /// Spawn `cmd` with the given policies.
    pub async fn spawn_with(cmd: &[&str], policies: Policies) -> Result<Self, TestError> {
        let socket_path = Self::unique_socket_path();
        let listener = server::bind(&socket_path).map_err(|e| TestError::SpawnFailed(e.to_string()))?;

        let exit_flag = ExitFlag::register().map_err(|e| TestError::SpawnFailed(e.to_string()))?;
        let cmd: Vec<String> = cmd.iter().map(ToString::to_string).collect();
        let opts = SpawnOptions {
            winsize: Some((24, 80)),
            ..SpawnOptions::default()
        };
        let pty = pty::spawn(&cmd, &opts).map_err(|e| TestError::SpawnFailed(e.to_string()))?;

        let session = Session::new(pty, policies, exit_flag, Instant::now());
        let server = Server::new(socket_path.clone(), listener, session)
            .map_err(|e| TestError::SpawnFailed(e.to_string()))?;
        let handle = tokio::spawn(server.run());

        Ok(Self {
            socket_path,
            server: Some(handle),
        })
    }

    fn unique_socket_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        std::env::temp_dir().join(format!("tether-test-{pid}-{id}.sock"))
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a greeted connection.
    pub async fn connect(&self) -> Result<Client, TestError> {
        Ok(Client::connect(&self.socket_path).await?)
    }

    /// Run one request on a fresh connection, like a client command does.
    pub async fn run(&self, request: &Request) -> Result<Outcome, TestError> {
        let client = self.connect().await?;
        let mut output = Vec::new();
        let completion = client.run(request, &mut output).await?;
        Ok(Outcome { completion, output })
    }

    pub async fn send(&self, data: &str) -> Result<Outcome, TestError> {
        self.run(&Request::Send(data.as_bytes().to_vec())).await
    }

    /// Expect `text` literally within `timeout` seconds.
    pub async fn expect_exact(&self, text: &str, timeout: i32) -> Result<Outcome, TestError> {
        self.expect(ExpectFlags::EXACT, Some(text), timeout).await
    }

    /// Expect a regex within `timeout` seconds.
    pub async fn expect_re(&self, re: &str, timeout: i32) -> Result<Outcome, TestError> {
        self.expect(ExpectFlags::ERE, Some(re), timeout).await
    }

    pub async fn expect(
        &self,
        flags: ExpectFlags,
        pattern: Option<&str>,
        timeout: i32,
    ) -> Result<Outcome, TestError> {
        self.run(&Request::Pass(PassRequest {
            subcommand: Subcommand::Expect,
            flags,
            pattern: pattern.map(|p| p.as_bytes().to_vec()),
            timeout: Some(timeout),
            lookback: None,
        }))
        .await
    }

    /// Wait for the child to exit.
    pub async fn wait(&self) -> Result<Outcome, TestError> {
        self.run(&Request::Pass(PassRequest {
            subcommand: Subcommand::Wait,
            flags: ExpectFlags::EXIT,
            pattern: None,
            timeout: Some(-1),
            lookback: None,
        }))
        .await
    }

    /// Wait up to `limit` for the server to shut down on its own.
    pub async fn finished(mut self, limit: Duration) -> Result<ExitReason, TestError> {
        let Some(handle) = self.server.take() else {
            return Err(TestError::Server("server already collected".into()));
        };
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(Ok(reason))) => Ok(reason),
            Ok(Ok(Err(e))) => Err(TestError::Server(e.to_string())),
            Ok(Err(e)) => Err(TestError::Server(e.to_string())),
            Err(_) => Err(TestError::Timeout),
        }
    }
}

impl Drop for TestSession {
    fn drop(&mut self) {
        if let Some(handle) = self.server.take() {
            handle.abort();
        }
        std::fs::remove_file(&self.socket_path).ok();
    }
}
