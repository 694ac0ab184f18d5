//! PTY creation and management.
//!
//! Provides helpers for spawning a process in a pseudo-terminal and for
//! controlling it afterwards.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::{ForkResult, Pid, execvp, fork, setsid};
use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::debug;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to register PTY with the reactor: {0}")]
    Register(#[source] io::Error),

    #[error("command is empty")]
    EmptyCommand,

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] std::ffi::NulError),
}

/// Operations the session needs from its child and PTY master.
///
/// Implemented by [`PtyProcess`]; tests substitute a scripted fake.
pub trait ChildPty {
    fn pid(&self) -> i32;

    fn pts_name(&self) -> &str;

    /// Whether the master side is still open.
    fn is_open(&self) -> bool;

    /// Write to the child's input. Returns bytes written.
    fn write(&self, data: &[u8]) -> io::Result<usize>;

    /// Current window size as `(rows, cols)`.
    fn window_size(&self) -> io::Result<(u16, u16)>;

    fn resize(&self, rows: u16, cols: u16) -> io::Result<()>;

    fn signal(&self, signal: i32) -> Result<(), Errno>;

    /// Close the master side. Idempotent.
    fn close(&mut self);

    /// Raw wait status if the child has exited, without reaping it.
    fn peek_exit(&self) -> io::Result<Option<i32>>;

    /// Reap the exited child and return its raw wait status.
    fn reap(&mut self) -> io::Result<i32>;
}

/// Options applied to the child before `exec`.
#[derive(Debug, Default, Clone)]
pub struct SpawnOptions {
    /// Ignore SIGHUP in the child.
    pub nohup: bool,
    /// Value for `TERM`.
    pub term: Option<String>,
    /// Initial window size; left to the system default when absent.
    pub winsize: Option<(u16, u16)>,
    /// Environment variables removed from the child's environment.
    pub unset_env: Vec<String>,
}

/// A child process running on a PTY.
pub struct PtyProcess {
    master: Option<AsyncFd<OwnedFd>>,
    pid: Pid,
    pts_name: String,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("pts_name", &self.pts_name)
            .field("open", &self.master.is_some())
            .finish()
    }
}

/// Encode a wait status the way the kernel reports it.
fn raw_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some((code & 0xff) << 8),
        WaitStatus::Signaled(_, sig, core) => Some(sig as i32 | if core { 0x80 } else { 0 }),
        _ => None,
    }
}

impl PtyProcess {
    /// Read from the master, waiting for readiness.
    ///
    /// `Ok(0)` and `EIO` both mean every slave handle is closed. Pending
    /// forever once the master is closed. Cancel safe.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(master) = &self.master else {
            return std::future::pending().await;
        };
        loop {
            let mut guard = master.readable().await?;
            match guard.try_io(|fd| nix::unistd::read(fd.get_ref(), buf).map_err(io::Error::from)) {
                Ok(result) => return result,
                Err(_would_block) => {}
            }
        }
    }

    fn raw_master(&self) -> Option<i32> {
        self.master.as_ref().map(AsRawFd::as_raw_fd)
    }
}

impl ChildPty for PtyProcess {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn pts_name(&self) -> &str {
        &self.pts_name
    }

    fn is_open(&self) -> bool {
        self.master.is_some()
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        nix::unistd::write(master.get_ref(), data).map_err(io::Error::from)
    }

    fn window_size(&self) -> io::Result<(u16, u16)> {
        let fd = self
            .raw_master()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let mut ws = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is an open PTY master and ws is a valid winsize
        let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &raw mut ws) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((ws.ws_row, ws.ws_col))
    }

    fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let fd = self
            .raw_master()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let ws = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // TIOCSWINSZ ioctl
        let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &raw const ws) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn signal(&self, sig: i32) -> Result<(), Errno> {
        let sig = Signal::try_from(sig)?;
        signal::kill(self.pid, sig)
    }

    fn close(&mut self) {
        if self.master.take().is_some() {
            debug!(pid = %self.pid, "closed PTY master");
        }
    }

    fn peek_exit(&self) -> io::Result<Option<i32>> {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pid), flags) {
            Ok(status) => Ok(raw_status(status)),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    fn reap(&mut self) -> io::Result<i32> {
        loop {
            let status = waitpid(self.pid, None).map_err(io::Error::from)?;
            if let Some(raw) = raw_status(status) {
                return Ok(raw);
            }
        }
    }
}

fn to_cstrings(cmd: &[String]) -> Result<Vec<CString>, PtyError> {
    cmd.iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()
        .map_err(PtyError::InvalidCommand)
}

/// Spawn a command in a new PTY.
///
/// Must be called from within a tokio runtime; the master is registered
/// with its reactor.
pub fn spawn(cmd: &[String], opts: &SpawnOptions) -> Result<PtyProcess, PtyError> {
    if cmd.is_empty() {
        return Err(PtyError::EmptyCommand);
    }
    let args = to_cstrings(cmd)?;

    let winsize = opts.winsize.map(|(rows, cols)| Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    });

    // Open a new PTY pair
    let OpenptyResult { master, slave } =
        openpty(winsize.as_ref(), None).map_err(PtyError::OpenPty)?;
    let pts_name = nix::unistd::ttyname(&slave)
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    // Fork the process
    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            // Parent: close slave, keep master
            drop(slave);

            // Set master to non-blocking mode for async I/O
            let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
            let mut flags = OFlag::from_bits_retain(flags);
            flags.insert(OFlag::O_NONBLOCK);
            fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

            let master = AsyncFd::new(master).map_err(PtyError::Register)?;
            debug!(pid = %child, %pts_name, "spawned child on PTY");
            Ok(PtyProcess {
                master: Some(master),
                pid: child,
                pts_name,
            })
        }
        ForkResult::Child => {
            drop(master);
            exec_child(&slave, &args, opts)
        }
    }
}

/// Child side of [`spawn`]: set up the terminal and exec. Never returns.
fn exec_child(slave: &OwnedFd, args: &[CString], opts: &SpawnOptions) -> ! {
    fn fail(what: &str, err: &dyn std::fmt::Display) -> ! {
        eprintln!("tether: {what}: {err}");
        // SAFETY: terminating the forked child without running parent state destructors
        unsafe { libc::_exit(127) }
    }

    if let Err(e) = setsid() {
        fail("setsid", &e);
    }

    // Set the slave as the controlling terminal
    let slave_fd = slave.as_raw_fd();
    unsafe {
        if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
            libc::_exit(127);
        }
        if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
            || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
        {
            libc::_exit(127);
        }
        if slave_fd > 2 {
            libc::close(slave_fd);
        }
    }

    // SAFETY: single-threaded child between fork and exec
    unsafe {
        // The Rust runtime ignores SIGPIPE; the child expects the default.
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigDfl);
        let _ = signal::signal(Signal::SIGCHLD, SigHandler::SigDfl);
        if opts.nohup {
            let _ = signal::signal(Signal::SIGHUP, SigHandler::SigIgn);
        }

        for key in &opts.unset_env {
            std::env::remove_var(key);
        }
        if let Some(term) = &opts.term {
            std::env::set_var("TERM", term);
        }
    }

    match execvp(&args[0], args) {
        Err(e) => fail(&args[0].to_string_lossy(), &e),
        Ok(never) => match never {},
    }
}

/// Current window size of the terminal on `fd`, if it is one.
#[must_use]
pub fn terminal_size(fd: i32) -> Option<(u16, u16)> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: ws is a valid winsize for TIOCGWINSZ to fill
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &raw mut ws) };
    if result == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        Some((ws.ws_row, ws.ws_col))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn read_all(pty: &PtyProcess) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), pty.read(&mut buf)).await {
                Ok(Ok(0) | Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
            }
        }
        out
    }

    fn wait_for_exit(pty: &PtyProcess) -> i32 {
        for _ in 0..500 {
            if let Some(status) = pty.peek_exit().unwrap() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("child did not exit");
    }

    #[tokio::test]
    async fn test_spawn_echo() {
        let mut pty = spawn(&sh("echo hello"), &SpawnOptions::default()).unwrap();
        let out = read_all(&pty).await;
        assert!(String::from_utf8_lossy(&out).contains("hello"));
        assert_eq!(wait_for_exit(&pty), 0);
        assert_eq!(pty.reap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exit_status_encoding() {
        let mut pty = spawn(&sh("exit 42"), &SpawnOptions::default()).unwrap();
        let status = wait_for_exit(&pty);
        assert_eq!(status >> 8, 42);
        // peeking does not reap
        assert_eq!(pty.peek_exit().unwrap(), Some(status));
        assert_eq!(pty.reap().unwrap(), status);
    }

    #[tokio::test]
    async fn test_signal_status() {
        let mut pty = spawn(&["sleep".into(), "30".into()], &SpawnOptions::default()).unwrap();
        assert_eq!(pty.peek_exit().unwrap(), None);
        pty.signal(libc::SIGKILL).unwrap();
        let status = wait_for_exit(&pty);
        assert_eq!(status & 0x7f, libc::SIGKILL);
        pty.reap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_empty_command() {
        let result = spawn(&[], &SpawnOptions::default());
        assert!(matches!(result, Err(PtyError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_resize_and_term() {
        let opts = SpawnOptions {
            term: Some("vt100".into()),
            winsize: Some((30, 100)),
            ..SpawnOptions::default()
        };
        let mut pty = spawn(&sh("echo TERM=$TERM; sleep 1"), &opts).unwrap();
        assert_eq!(pty.window_size().unwrap(), (30, 100));
        pty.resize(40, 120).unwrap();
        assert_eq!(pty.window_size().unwrap(), (40, 120));
        assert!(pty.pts_name().starts_with("/dev/"));

        let out = read_all(&pty).await;
        assert!(String::from_utf8_lossy(&out).contains("TERM=vt100"));
        pty.close();
        assert!(!pty.is_open());
        assert!(pty.write(b"x").is_err());
        wait_for_exit(&pty);
        pty.reap().unwrap();
    }
}
