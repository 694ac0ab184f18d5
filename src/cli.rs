//! Command-line interface for tether.
//!
//! Parsing lives here together with the translation of parsed arguments
//! into protocol requests, so both can be tested without a server.

use crate::escape::{EscapeError, unescape};
use crate::glob::{GlobError, glob_to_regex};
use crate::protocol::{ExpectFlags, PassRequest, Request, SessionInfo, Settings, Subcommand};
use crate::transport::MAX_SEND_SIZE;
use clap::{Args, Parser};
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable naming the socket, also removed from the child.
pub const SOCKET_ENV: &str = "TETHER_SOCKET";

/// Bad arguments found after parsing.
#[derive(Debug, Error)]
pub enum UsageError {
    #[error("{0}")]
    Escape(#[from] EscapeError),

    #[error("bad glob: {0}")]
    Glob(#[from] GlobError),

    #[error("pattern must not contain NUL")]
    Nul,

    #[error("pattern is not valid UTF-8 after unescaping")]
    Encoding,

    #[error("send: data length must be <= {MAX_SEND_SIZE}, got {0}")]
    TooLarge(usize),

    #[error("send: invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("send: environment variable {0} is not set")]
    MissingEnv(String),

    #[error("send: cannot read {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("set: nothing to set")]
    NothingToSet,

    #[error("--term cannot be empty")]
    EmptyTerm,
}

/// Control an interactive program from the shell.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about)]
pub struct Cli {
    /// Path to the Unix socket.
    #[arg(long, global = true, env = SOCKET_ENV, value_name = "PATH")]
    pub sock: Option<PathBuf>,

    /// Log debug output to stderr; `spawn` stays in the foreground.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Start a server running COMMAND on a new PTY.
    #[command(visible_alias = "sp")]
    Spawn(SpawnArgs),

    /// Wait for output matching a pattern.
    #[command(visible_aliases = ["exp", "ex", "x"])]
    Expect(ExpectArgs),

    /// Send data to the child.
    #[command(visible_alias = "s")]
    Send(SendArgs),

    /// Connect the terminal to the child.
    #[command(visible_alias = "i")]
    Interact {
        /// Show the last N lines of earlier output first.
        #[arg(long, value_name = "N")]
        lookback: Option<i32>,

        /// Do not detach on Ctrl-].
        #[arg(long)]
        no_detach: bool,
    },

    /// Wait for the child to exit; exits with its status.
    #[command(visible_alias = "w")]
    Wait,

    /// Print text saved by the last successful expect.
    #[command(name = "expect-out", visible_aliases = ["expect_out", "out"])]
    ExpectOut {
        /// 0 for the whole match, 1-9 for subexpressions.
        #[arg(long, short, default_value_t = 0)]
        index: i32,
    },

    /// Close the child's PTY.
    #[command(visible_alias = "c")]
    Close,

    /// Send a signal to the child.
    #[command(visible_alias = "k")]
    Kill {
        /// Signal name (TERM, SIGTERM, term) or number.
        #[arg(long, short, default_value = "TERM", value_parser = parse_signal)]
        signal: i32,
    },

    /// Change session parameters.
    Set(SetArgs),

    /// Show session parameters.
    Get(GetArgs),

    /// Check which error an exit code stands for.
    #[command(visible_aliases = ["chk", "ck"])]
    Chkerr {
        /// Exit code of an earlier command.
        #[arg(long, value_name = "NUM")]
        errno: i32,

        /// Error class to compare with.
        #[arg(long = "is", value_enum)]
        is: ErrorClass,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ErrorClass {
    Eof,
    Timeout,
}

#[derive(Debug, Args)]
pub struct SpawnArgs {
    /// Exit the server as soon as the child exits.
    #[arg(long)]
    pub autowait: bool,

    /// Close the PTY once the child has exited.
    #[arg(long, visible_alias = "cloexit")]
    pub close_on_exit: bool,

    /// Discard output while no client is connected.
    #[arg(long)]
    pub discard: bool,

    /// Copy all child output to FILE.
    #[arg(long, visible_alias = "logf", value_name = "FILE")]
    pub logfile: Option<PathBuf>,

    /// Append to the log file instead of truncating it.
    #[arg(long, requires = "logfile")]
    pub append: bool,

    /// Make the child ignore SIGHUP.
    #[arg(long)]
    pub nohup: bool,

    /// Value of TERM for the child.
    #[arg(long, short = 'T')]
    pub term: Option<String>,

    /// Default expect timeout in seconds.
    #[arg(long, short = 't', default_value_t = crate::server::DEFAULT_TIMEOUT, allow_negative_numbers = true)]
    pub timeout: i32,

    /// Exit the server after N seconds; 0 disables.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub ttl: i32,

    /// Exit the server after N idle seconds; 0 disables.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub idle: i32,

    /// Exit N seconds after the child exits and nobody waits for it.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub zombie_idle: i32,

    /// Command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

impl SpawnArgs {
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.term.as_deref() == Some("") {
            return Err(UsageError::EmptyTerm);
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("mode").multiple(false)))]
pub struct ExpectArgs {
    /// Match the exact string.
    #[arg(long, short = 'e', group = "mode")]
    pub exact: Option<String>,

    /// Match a glob pattern.
    #[arg(long, group = "mode")]
    pub glob: Option<String>,

    /// Match an extended regular expression.
    #[arg(long, group = "mode")]
    pub re: Option<String>,

    /// Wait for end of file.
    #[arg(long, group = "mode")]
    pub eof: bool,

    /// Ignore case.
    #[arg(long, short = 'i')]
    pub icase: bool,

    /// Decode C-style escapes in the pattern.
    #[arg(long, short = 'c')]
    pub cstring: bool,

    /// Show the last N lines of earlier output first.
    #[arg(long, value_name = "N")]
    pub lookback: Option<i32>,

    /// Seconds to wait; negative waits forever.
    #[arg(long, short = 't', allow_negative_numbers = true)]
    pub timeout: Option<i32>,

    /// Do not save subexpression matches.
    #[arg(long)]
    pub nosub: bool,
}

impl ExpectArgs {
    fn pattern(&self, raw: &str) -> Result<Vec<u8>, UsageError> {
        let bytes = if self.cstring {
            unescape(raw)?
        } else {
            raw.as_bytes().to_vec()
        };
        if bytes.contains(&0) {
            return Err(UsageError::Nul);
        }
        Ok(bytes)
    }

    /// Build the `PASS` request. Without a mode this peeks at whatever
    /// output is already there.
    pub fn request(&self) -> Result<Request, UsageError> {
        let mut flags = ExpectFlags::empty();
        let mut timeout = self.timeout;
        let pattern = if let Some(exact) = &self.exact {
            flags |= ExpectFlags::EXACT;
            Some(self.pattern(exact)?)
        } else if let Some(glob) = &self.glob {
            flags |= ExpectFlags::ERE;
            let glob = String::from_utf8(self.pattern(glob)?).map_err(|_| UsageError::Encoding)?;
            Some(glob_to_regex(&glob)?.into_bytes())
        } else if let Some(re) = &self.re {
            flags |= ExpectFlags::ERE;
            Some(self.pattern(re)?)
        } else if self.eof {
            flags |= ExpectFlags::EOF;
            None
        } else {
            flags |= ExpectFlags::ERE;
            timeout = timeout.or(Some(0));
            Some(b".*".to_vec())
        };

        if self.icase {
            flags |= ExpectFlags::ICASE;
        }
        if self.nosub {
            flags |= ExpectFlags::NOSUB;
        }
        Ok(Request::Pass(PassRequest {
            subcommand: Subcommand::Expect,
            flags,
            pattern,
            timeout,
            lookback: self.lookback,
        }))
    }
}

#[derive(Debug, Args)]
#[command(group(clap::ArgGroup::new("source").multiple(false)))]
pub struct SendArgs {
    /// Data to send.
    #[arg(group = "source", allow_hyphen_values = true)]
    pub data: Option<String>,

    /// Read the data from FILE.
    #[arg(long, short = 'f', group = "source", value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Take the data from environment variable VAR.
    #[arg(long, group = "source", value_name = "VAR")]
    pub env: Option<String>,

    /// Decode C-style escapes.
    #[arg(long, short = 'c', conflicts_with = "hex")]
    pub cstring: bool,

    /// The data is hex encoded.
    #[arg(long, conflicts_with = "file")]
    pub hex: bool,

    /// Append a carriage return.
    #[arg(long, visible_alias = "cr")]
    pub enter: bool,
}

impl SendArgs {
    /// The bytes to write to the child.
    pub fn payload(&self) -> Result<Vec<u8>, UsageError> {
        let mut data = if let Some(path) = &self.file {
            std::fs::read(path).map_err(|source| UsageError::File {
                path: path.clone(),
                source,
            })?
        } else {
            let text = match &self.env {
                Some(var) => std::env::var(var).map_err(|_| UsageError::MissingEnv(var.clone()))?,
                None => self.data.clone().unwrap_or_default(),
            };
            if self.hex {
                hex::decode(text.trim())?
            } else if self.cstring {
                unescape(&text)?
            } else {
                text.into_bytes()
            }
        };
        if self.enter {
            data.push(b'\r');
        }
        if data.len() > MAX_SEND_SIZE {
            return Err(UsageError::TooLarge(data.len()));
        }
        Ok(data)
    }
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Exit the server as soon as the child exits.
    #[arg(long, value_name = "FLAG", value_parser = parse_flag)]
    pub autowait: Option<bool>,

    /// Discard output while no client is connected.
    #[arg(long, value_name = "FLAG", value_parser = parse_flag)]
    pub discard: Option<bool>,

    /// Default expect timeout in seconds.
    #[arg(long, short = 't', allow_negative_numbers = true)]
    pub timeout: Option<i32>,

    /// Server lifetime in seconds; 0 disables.
    #[arg(long, allow_negative_numbers = true)]
    pub ttl: Option<i32>,

    /// Idle limit in seconds; 0 disables.
    #[arg(long, allow_negative_numbers = true)]
    pub idle: Option<i32>,
}

impl SetArgs {
    pub fn request(&self) -> Result<Request, UsageError> {
        let settings = Settings {
            autowait: self.autowait,
            nonblock: self.discard,
            timeout: self.timeout,
            ttl: self.ttl.map(|n| n.max(0)),
            idle: self.idle.map(|n| n.max(0)),
        };
        if settings.is_empty() {
            return Err(UsageError::NothingToSet);
        }
        Ok(Request::Set(settings))
    }
}

#[derive(Debug, Args)]
#[allow(clippy::struct_excessive_bools)] // one switch per field
pub struct GetArgs {
    /// Show everything, labelled (the default).
    #[arg(long, short = 'a')]
    pub all: bool,

    #[arg(long)]
    pub autowait: bool,

    #[arg(long)]
    pub discard: bool,

    /// Child PID.
    #[arg(long)]
    pub pid: bool,

    /// Server PID.
    #[arg(long)]
    pub ppid: bool,

    /// Child's terminal device.
    #[arg(long)]
    pub tty: bool,

    #[arg(long)]
    pub timeout: bool,

    #[arg(long)]
    pub ttl: bool,

    #[arg(long)]
    pub idle: bool,

    /// Print JSON.
    #[arg(long)]
    pub json: bool,
}

impl GetArgs {
    const fn any_field(&self) -> bool {
        self.autowait
            || self.discard
            || self.pid
            || self.ppid
            || self.tty
            || self.timeout
            || self.ttl
            || self.idle
    }

    /// Format `info` as requested.
    pub fn render(&self, info: &SessionInfo) -> Result<String, serde_json::Error> {
        if self.json {
            let mut out = serde_json::to_string_pretty(info)?;
            out.push('\n');
            return Ok(out);
        }

        let all = self.all || !self.any_field();
        let label = |text: &'static str| if all { text } else { "" };
        let mut out = String::new();
        let mut line = |wanted: bool, name: &'static str, value: &dyn std::fmt::Display| {
            if all || wanted {
                let _ = writeln!(out, "{}{value}", label(name));
            }
        };
        line(self.tty, "       TTY: ", &info.pts_name);
        line(self.pid, " Child PID: ", &info.pid);
        line(self.ppid, "Parent PID: ", &info.ppid);
        line(self.ttl, "       TTL: ", &info.ttl);
        line(self.idle, "      Idle: ", &info.idle);
        line(self.timeout, "   Timeout: ", &info.timeout);
        line(self.autowait, "  Autowait: ", &u8::from(info.autowait));
        line(self.discard, "  Nonblock: ", &u8::from(info.nonblock));
        Ok(out)
    }
}

/// Parse a boolean setting: `1`/`0`, `on`/`off`, `true`/`false`, `yes`/`no`.
pub fn parse_flag(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(format!("invalid flag '{s}', expected 0/1/on/off")),
    }
}

/// Parse a signal name (with or without `SIG`, any case) or number.
pub fn parse_signal(s: &str) -> Result<i32, String> {
    if let Ok(n) = s.parse::<i32>() {
        return Ok(n);
    }
    let upper = s.to_ascii_uppercase();
    let name = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match name {
        "CONT" => libc::SIGCONT,
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "KILL" => libc::SIGKILL,
        "QUIT" => libc::SIGQUIT,
        "STOP" => libc::SIGSTOP,
        "TERM" => libc::SIGTERM,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        _ => return Err(format!("unknown signal: {s}")),
    };
    Ok(signal)
}
