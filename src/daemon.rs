//! Detaching the server from the invoking terminal.
//!
//! # Safety
//!
//! Forking is only sound before any runtime threads exist; callers run
//! this from a plain `main` before building the tokio runtime.

#![allow(unsafe_code)]

use nix::unistd::{ForkResult, fork, setsid};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use tracing::debug;

/// Fork into the background and start a new session.
///
/// The parent exits with status 0. In the child, stdio is pointed at
/// `/dev/null` unless `keep_stdio` is set.
pub fn daemonize(keep_stdio: bool) -> io::Result<()> {
    // SAFETY: called before any other thread is started
    match unsafe { fork() }.map_err(io::Error::from)? {
        ForkResult::Parent { child } => {
            debug!(%child, "server forked into background");
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    setsid().map_err(io::Error::from)?;
    if !keep_stdio {
        redirect_stdio()?;
    }
    Ok(())
}

fn redirect_stdio() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = null.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid for the duration of the call
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
