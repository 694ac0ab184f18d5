//! Interactive mode.
//!
//! Bridges the user's terminal to the child: keystrokes go out as `INPUT`,
//! `OUTPUT` is written to stdout, and window size changes follow the
//! local terminal. `Ctrl-]` detaches unless disabled.

use crate::client::{Client, ClientError, Completion};
use crate::protocol::{ExpectFlags, PassRequest, Reply, Request, Subcommand};
use crate::pty::terminal_size;
use crate::transport::{self, TransportError};
use std::os::fd::{AsFd, OwnedFd};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;

/// The detach key, `Ctrl-]`.
pub const DETACH_KEY: u8 = 0x1d;

/// Errors during interactive mode.
#[derive(Debug, Error)]
pub enum InteractError {
    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("stdin is not a terminal")]
    NotATty,

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("connection lost")]
    ConnectionLost,
}

impl From<TransportError> for InteractError {
    fn from(e: TransportError) -> Self {
        Self::Client(ClientError::Transport(e))
    }
}

/// Options for [`run_interact`].
#[derive(Debug, Clone, Default)]
pub struct InteractConfig {
    /// Replay this many lines of earlier output first.
    pub lookback: Option<i32>,
    /// Ignore the detach key.
    pub no_detach: bool,
}

/// Saved terminal state for restoration.
struct TerminalState {
    original_termios: nix::sys::termios::Termios,
    stdin_fd: OwnedFd,
}

impl TerminalState {
    /// Save current terminal state and switch to raw mode.
    fn enter_raw_mode() -> Result<Self, InteractError> {
        use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices};

        let stdin = std::io::stdin();
        let stdin_borrowed = stdin.as_fd();
        if !nix::unistd::isatty(stdin_borrowed).unwrap_or(false) {
            return Err(InteractError::NotATty);
        }

        let original_termios = termios::tcgetattr(stdin_borrowed).map_err(InteractError::GetTermios)?;
        let mut raw = original_termios.clone();
        raw.input_flags.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON,
        );
        raw.output_flags.remove(OutputFlags::OPOST);
        raw.local_flags.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(stdin_borrowed, SetArg::TCSAFLUSH, &raw).map_err(InteractError::SetTermios)?;

        let stdin_fd = stdin_borrowed.try_clone_to_owned().map_err(InteractError::Io)?;
        Ok(Self {
            original_termios,
            stdin_fd,
        })
    }

    fn restore(&self) -> Result<(), InteractError> {
        use nix::sys::termios::{self, SetArg};
        termios::tcsetattr(&self.stdin_fd, SetArg::TCSAFLUSH, &self.original_termios)
            .map_err(InteractError::SetTermios)
    }
}

impl Drop for TerminalState {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            eprintln!("Warning: failed to restore terminal: {e}");
        }
    }
}

/// Split `input` at the detach key. Returns the bytes to forward and
/// whether the key was seen.
#[must_use]
pub fn scan_detach(input: &[u8], enabled: bool) -> (&[u8], bool) {
    if !enabled {
        return (input, false);
    }
    match input.iter().position(|&b| b == DETACH_KEY) {
        Some(i) => (&input[..i], true),
        None => (input, false),
    }
}

fn stdin_size() -> Option<(u16, u16)> {
    terminal_size(libc::STDIN_FILENO)
}

async fn send(writer: &mut OwnedWriteHalf, request: &Request) -> Result<(), InteractError> {
    transport::send(writer, &request.to_tlv()).await?;
    Ok(())
}

/// Run interactive mode until the child exits, the session ends or the
/// user detaches.
///
/// Requires stdin to be a terminal.
pub async fn run_interact(client: Client, config: InteractConfig) -> Result<Completion, InteractError> {
    use tokio::signal::unix::{SignalKind, signal};

    let terminal = TerminalState::enter_raw_mode()?;
    let Client { mut reader, mut writer } = client;

    let mut current_size = stdin_size();
    if let Some((rows, cols)) = current_size {
        send(&mut writer, &Request::Winch { rows, cols }).await?;
    }
    send(
        &mut writer,
        &Request::Pass(PassRequest {
            subcommand: Subcommand::Interact,
            flags: ExpectFlags::EXIT,
            pattern: None,
            timeout: Some(-1),
            lookback: config.lookback,
        }),
    )
    .await?;

    // recv is not cancel safe; read replies on their own task
    let (tx, mut replies) = mpsc::channel(16);
    let reader_task = tokio::spawn(async move {
        loop {
            let msg = transport::recv(&mut reader).await;
            let done = msg.is_err();
            if tx.send(msg).await.is_err() || done {
                break;
            }
        }
    });

    let mut sigwinch = signal(SignalKind::window_change()).map_err(InteractError::Io)?;
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut input_buf = [0u8; 1024];

    let outcome = loop {
        tokio::select! {
            _ = sigwinch.recv() => {
                let size = stdin_size();
                if let Some((rows, cols)) = size
                    && size != current_size
                {
                    current_size = size;
                    debug!(rows, cols, "terminal resized");
                    send(&mut writer, &Request::Winch { rows, cols }).await?;
                }
            }

            result = stdin.read(&mut input_buf) => {
                let n = result.map_err(InteractError::Io)?;
                if n == 0 {
                    debug!("EOF on stdin, detaching");
                    break None;
                }
                let (data, detach) = scan_detach(&input_buf[..n], !config.no_detach);
                if !data.is_empty() {
                    send(&mut writer, &Request::Input(data.to_vec())).await?;
                }
                if detach {
                    debug!("detach key pressed");
                    break None;
                }
            }

            msg = replies.recv() => {
                let Some(msg) = msg else {
                    return Err(InteractError::ConnectionLost);
                };
                let reply = Reply::from_tlv(&msg?).map_err(ClientError::from)?;
                match reply {
                    Reply::Output(data) => {
                        stdout.write_all(&data).await.map_err(InteractError::Io)?;
                        stdout.flush().await.map_err(InteractError::Io)?;
                    }
                    Reply::Exited { status } => break Some(Completion::Exited { status }),
                    Reply::Eof => break Some(Completion::Eof),
                    Reply::Error { code, .. } => break Some(Completion::Failed(code)),
                    other => debug!(?other, "ignoring reply during interact"),
                }
            }
        }
    };

    // finish with the DISCONN handshake, still printing late output
    send(&mut writer, &Request::Disconnect).await?;
    while let Some(msg) = replies.recv().await {
        match msg.map(|m| Reply::from_tlv(&m)) {
            Ok(Ok(Reply::Output(data))) => {
                stdout.write_all(&data).await.map_err(InteractError::Io)?;
                stdout.flush().await.map_err(InteractError::Io)?;
            }
            Ok(Ok(Reply::Disconnect)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    reader_task.abort();
    drop(terminal);

    Ok(outcome.unwrap_or(Completion::Detached))
}
