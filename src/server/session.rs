//! Session state machine.
//!
//! Owns the child, its output buffer and the single client connection's
//! pending operation. The server event loop feeds it PTY data, decoded
//! messages and clock ticks; it answers with the replies to send. Nothing
//! here does socket I/O, so the whole protocol can be driven from tests.

use super::buffer::OutputBuffer;
use super::lifecycle::{self, ExitReason, Policies, Snapshot};
use super::matcher::Captures;
use super::pending::PendingOp;
use crate::codec::{Tag, Tlv};
use crate::protocol::{
    CAPTURE_REGISTERS, ErrorCode, ExpectFlags, PROTOCOL_VERSION, ProtocolError, Reply, Request,
    SessionInfo, Settings, Subcommand,
};
use crate::pty::ChildPty;
use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Set by the SIGCHLD handler, cleared when the session looks at the child.
#[derive(Debug, Clone)]
pub struct ExitFlag(Arc<AtomicBool>);

impl Default for ExitFlag {
    /// Starts raised so the child is checked once at startup.
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl ExitFlag {
    /// Create a flag raised on every SIGCHLD.
    ///
    /// Must run before the child is forked so no exit goes unnoticed.
    pub fn register() -> io::Result<Self> {
        let flag = Self::default();
        signal_hook::flag::register(signal_hook::consts::SIGCHLD, Arc::clone(&flag.0))?;
        Ok(flag)
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// What the server should do after handling one client message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub replies: Vec<Reply>,
    /// Close the connection after sending the replies.
    pub hangup: bool,
}

impl Dispatch {
    fn none() -> Self {
        Self::default()
    }

    fn reply(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            hangup: false,
        }
    }

    fn hangup(reply: Reply) -> Self {
        Self {
            replies: vec![reply],
            hangup: true,
        }
    }
}

/// Child process, output buffer and connection state of one server.
#[derive(Debug)]
pub struct Session<P> {
    pty: P,
    policies: Policies,
    exit_flag: ExitFlag,
    spawned_at: Instant,
    last_active: Instant,
    /// Raw wait status, seen but not yet reaped.
    exit_status: Option<i32>,
    exited_at: Option<Instant>,
    waited: bool,
    output: OutputBuffer,
    captures: Captures,
    connected: bool,
    pending: Option<PendingOp>,
    /// Loop iterations that saw the child dead with the master open.
    close_strikes: u8,
    logfile: Option<File>,
}

impl<P: ChildPty> Session<P> {
    pub fn new(pty: P, policies: Policies, exit_flag: ExitFlag, now: Instant) -> Self {
        Self {
            pty,
            policies,
            exit_flag,
            spawned_at: now,
            last_active: now,
            exit_status: None,
            exited_at: None,
            waited: false,
            output: OutputBuffer::new(),
            captures: Captures::default(),
            connected: false,
            pending: None,
            close_strikes: 0,
            logfile: None,
        }
    }

    /// Copy every byte read from the PTY to `file`.
    #[must_use]
    pub fn with_logfile(mut self, file: File) -> Self {
        self.logfile = Some(file);
        self
    }

    #[must_use]
    pub const fn pty(&self) -> &P {
        &self.pty
    }

    #[must_use]
    pub const fn policies(&self) -> &Policies {
        &self.policies
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub const fn is_waited(&self) -> bool {
        self.waited
    }

    /// Room for the next PTY read.
    #[must_use]
    pub const fn spare(&self) -> usize {
        self.output.spare()
    }

    #[must_use]
    pub const fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// The loop keeps running until the exit status has been delivered
    /// and the client that got it has gone.
    #[must_use]
    pub const fn keep_running(&self) -> bool {
        !self.waited || self.connected
    }

    pub fn connect(&mut self, now: Instant) {
        if self.connected {
            warn!("bug: new connection while one is active, dropping the old one");
        }
        self.connected = true;
        self.pending = None;
        self.last_active = now;
        debug!("client connected");
    }

    pub fn disconnect(&mut self, now: Instant) {
        if self.pending.take().is_some() {
            debug!("pending operation dropped with its connection");
        }
        self.connected = false;
        self.last_active = now;
        debug!("client disconnected");
    }

    /// Handshake failed before the connection was established.
    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    /// Append data read from the PTY.
    pub fn ingest(&mut self, bytes: &[u8]) {
        if let Some(file) = self.logfile.as_mut()
            && let Err(e) = file.write_all(bytes)
        {
            debug!(error = %e, "logfile write failed");
        }
        self.output.append(bytes);
    }

    /// The PTY reported end of file; every slave handle is gone.
    pub fn pty_closed(&mut self) {
        debug!(pid = self.pty.pid(), "PTY reached end of file");
        self.pty.close();
    }

    /// Handle one decoded message from the client.
    pub fn handle_message(&mut self, msg: &Tlv, now: Instant) -> Dispatch {
        self.last_active = now;
        match Request::from_tlv(msg) {
            Ok(req) => self.handle_request(req, now),
            Err(ProtocolError::UnexpectedTag(tag)) => {
                warn!(tag, "bug: unexpected message from client, ignored");
                Dispatch::none()
            }
            Err(e) if msg.tag == Tag::HELLO => {
                Dispatch::hangup(Reply::error(ErrorCode::Protocol, e.to_string()))
            }
            Err(e) => Dispatch::reply(Reply::error(ErrorCode::Usage, e.to_string())),
        }
    }

    /// Handle one typed request.
    pub fn handle_request(&mut self, req: Request, now: Instant) -> Dispatch {
        self.last_active = now;
        match req {
            Request::Hello { version } => {
                if version == Some(PROTOCOL_VERSION) {
                    Dispatch::reply(Reply::Hello {
                        version: PROTOCOL_VERSION,
                    })
                } else {
                    warn!(?version, "client protocol version mismatch");
                    Dispatch::hangup(Reply::error(
                        ErrorCode::Protocol,
                        format!(
                            "protocol version mismatch: client {}, server {PROTOCOL_VERSION}",
                            version.map_or_else(|| "none".to_string(), |v| v.to_string())
                        ),
                    ))
                }
            }
            Request::Disconnect => Dispatch::hangup(Reply::Disconnect),
            Request::Pass(pass) => {
                if self.pending.is_some() {
                    return Dispatch::reply(Reply::error(
                        ErrorCode::Usage,
                        "another operation is in progress",
                    ));
                }
                let has_pattern = pass.pattern.is_some();
                match PendingOp::install(pass, self.policies.default_timeout, now) {
                    Ok(op) => {
                        if has_pattern {
                            self.captures.clear();
                        }
                        debug!(subcommand = ?op.subcommand, timeout = op.timeout, "operation installed");
                        self.pending = Some(op);
                        Dispatch::none()
                    }
                    Err(e) => Dispatch::reply(Reply::error(ErrorCode::Usage, e.to_string())),
                }
            }
            Request::Send(data) => {
                self.write_child(&data);
                Dispatch::reply(Reply::Ack)
            }
            Request::Input(data) => {
                self.write_child(&data);
                Dispatch::none()
            }
            Request::Winch { rows, cols } => {
                self.resize(rows, cols);
                Dispatch::none()
            }
            Request::Close => {
                self.pty.close();
                Dispatch::reply(Reply::Ack)
            }
            Request::Kill { signal } => match self.pty.signal(signal) {
                Ok(()) => Dispatch::reply(Reply::Ack),
                Err(errno) => {
                    Dispatch::reply(Reply::error(ErrorCode::System, format!("kill: {}", errno.desc())))
                }
            },
            Request::Set(settings) => {
                self.apply(&settings);
                Dispatch::reply(Reply::Ack)
            }
            Request::Info => Dispatch::reply(Reply::Info(self.info())),
            Request::ExpectOut { index } => match usize::try_from(index) {
                Ok(i) if i < CAPTURE_REGISTERS => Dispatch::reply(Reply::ExpectOutText(
                    self.captures.get(i).unwrap_or_default().to_vec(),
                )),
                _ => Dispatch::reply(Reply::error(
                    ErrorCode::Usage,
                    "index must be in range 0-9",
                )),
            },
        }
    }

    fn write_child(&self, data: &[u8]) {
        if !self.pty.is_open() {
            debug!(len = data.len(), "PTY closed, input dropped");
            return;
        }
        match self.pty.write(data) {
            Ok(n) if n < data.len() => {
                warn!(written = n, len = data.len(), "short write to PTY, rest dropped");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "write to PTY failed"),
        }
    }

    fn resize(&self, rows: u16, cols: u16) {
        if !self.pty.is_open() {
            return;
        }
        match self.pty.window_size() {
            Ok(current) if current == (rows, cols) => {
                debug!(rows, cols, "window size unchanged");
            }
            _ => {
                if let Err(e) = self.pty.resize(rows, cols) {
                    debug!(error = %e, "resize failed");
                }
            }
        }
    }

    fn apply(&mut self, settings: &Settings) {
        if let Some(v) = settings.autowait {
            self.policies.autowait = v;
        }
        if let Some(v) = settings.nonblock {
            self.policies.nonblock = v;
        }
        if let Some(v) = settings.timeout {
            self.policies.default_timeout = v;
        }
        if let Some(v) = settings.ttl {
            self.policies.ttl = v;
        }
        if let Some(v) = settings.idle {
            self.policies.idle = v;
        }
        debug!(policies = ?self.policies, "settings updated");
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            pid: self.pty.pid(),
            ppid: i32::try_from(std::process::id()).unwrap_or(-1),
            pts_name: self.pty.pts_name().to_string(),
            timeout: self.policies.default_timeout,
            autowait: self.policies.autowait,
            nonblock: self.policies.nonblock,
            ttl: self.policies.ttl,
            idle: self.policies.idle,
            zombie_idle: self.policies.zombie_idle,
        }
    }

    /// Record the child's exit if SIGCHLD was seen. Does not reap.
    fn observe_child(&mut self, now: Instant) {
        if self.exit_status.is_some() || self.waited || !self.exit_flag.take() {
            return;
        }
        match self.pty.peek_exit() {
            Ok(Some(status)) => {
                info!(pid = self.pty.pid(), status, "child exited");
                self.exit_status = Some(status);
                self.exited_at = Some(now);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "checking child status failed"),
        }
    }

    /// Start-of-iteration checks: child exit, close-on-exit and the
    /// lifetime policies.
    pub fn tick(&mut self, now: Instant) -> Option<ExitReason> {
        self.observe_child(now);

        if self.policies.close_on_exit && self.exited_at.is_some() && self.pty.is_open() {
            // the child's last output may still be in flight on the first pass
            self.close_strikes = self.close_strikes.saturating_add(1);
            if self.close_strikes > 1 {
                info!("child exited, closing PTY");
                self.pty.close();
            }
        }

        lifecycle::evaluate(&self.policies, &self.snapshot(), now)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            spawned_at: self.spawned_at,
            last_active: self.last_active,
            exited_at: self.exited_at,
            waited: self.waited,
            pty_open: self.pty.is_open(),
            connected: self.connected,
        }
    }

    /// End-of-iteration bookkeeping: drop unattended output in nonblock
    /// mode and evict old data.
    pub fn settle(&mut self) {
        if self.policies.nonblock && !self.connected {
            self.output.mark_sent();
        }
        self.output.evict_old();
    }

    /// Advance the pending operation.
    ///
    /// Forwards new output, then tries the pattern, then checks for end of
    /// file and the timeout. Returns the replies to send; at most one of
    /// them is terminal, and the operation is gone once it has been sent.
    pub fn pump(&mut self, now: Instant) -> Vec<Reply> {
        let mut replies = Vec::new();
        if !self.connected {
            return replies;
        }
        let Some(op) = self.pending.as_mut() else {
            return replies;
        };

        let start = op
            .take_lookback()
            .map_or_else(|| self.output.sent(), |lines| self.output.lookback_start(lines));
        let chunk = self.output.slice_from(start);
        if !chunk.is_empty() {
            replies.push(Reply::Output(chunk.to_vec()));
            self.output.mark_sent();
        }

        if let Some(matcher) = op.matcher.as_ref() {
            self.output.fold_expect();
            let view = self.output.expect_view();
            if (!view.is_empty() || self.pty.is_open())
                && let Some(end) = matcher.find(view, &mut self.captures)
            {
                self.output.consume_expect(end.0);
                replies.push(Reply::Matched);
                self.pending = None;
                return replies;
            }
        } else if op.subcommand != Subcommand::Expect {
            self.output.discard_expect();
        }

        if !self.pty.is_open() && self.output.unsent().is_empty() {
            if op.flags.contains(ExpectFlags::EOF) {
                self.output.discard_expect();
                replies.push(Reply::Eof);
                self.pending = None;
                return replies;
            }
            if op.flags.contains(ExpectFlags::EXIT) {
                if self.waited {
                    replies.push(Reply::error(ErrorCode::Exited, "child already waited"));
                    self.pending = None;
                    return replies;
                }
                if let Some(seen) = self.exit_status {
                    let status = match self.pty.reap() {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(error = %e, "reaping child failed");
                            seen
                        }
                    };
                    info!(status, "exit status delivered");
                    self.waited = true;
                    replies.push(Reply::Exited { status });
                    self.pending = None;
                    return replies;
                }
            } else {
                replies.push(Reply::error(ErrorCode::Eof, "PTY closed"));
                self.pending = None;
                return replies;
            }
        }

        if op.timed_out(now) {
            replies.push(Reply::error(ErrorCode::Timeout, "expect timed out"));
            self.pending = None;
        }
        replies
    }
}
