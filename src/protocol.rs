//! Protocol types for client-server IPC.
//!
//! Clients and the session server exchange framed message trees (see
//! [`crate::codec`] and [`crate::transport`]). This module gives the tags
//! their meaning and converts between trees and typed [`Request`] /
//! [`Reply`] values.

use crate::codec::{Tag, Tlv};
use serde::Serialize;
use thiserror::Error;

/// Protocol version exchanged in `HELLO`.
pub const PROTOCOL_VERSION: i32 = 1;

/// Number of capture registers kept by the server.
pub const CAPTURE_REGISTERS: usize = 10;

// Tag numbers. Requests, replies and struct members live in separate ranges.
impl Tag {
    // client -> server
    pub const HELLO: Self = Self::from_raw(1);
    pub const DISCONN: Self = Self::from_raw(2);
    pub const PASS: Self = Self::from_raw(3);
    pub const WINCH: Self = Self::from_raw(4);
    pub const SEND: Self = Self::from_raw(5);
    pub const INPUT: Self = Self::from_raw(6);
    pub const EXPOUT: Self = Self::from_raw(7);
    pub const CLOSE: Self = Self::from_raw(8);
    pub const KILL: Self = Self::from_raw(9);
    pub const SET: Self = Self::from_raw(10);
    /// Query from the client; the reply reuses the tag.
    pub const INFO: Self = Self::from_raw(11);

    // server -> client
    pub const ACK: Self = Self::from_raw(32);
    pub const OUTPUT: Self = Self::from_raw(33);
    pub const MATCHED: Self = Self::from_raw(34);
    pub const EOF: Self = Self::from_raw(35);
    pub const EXITED: Self = Self::from_raw(36);
    pub const ERROR: Self = Self::from_raw(37);
    pub const EXPOUT_TEXT: Self = Self::from_raw(38);

    // struct members
    pub const VERSION: Self = Self::from_raw(64);
    pub const PASS_SUBCMD: Self = Self::from_raw(65);
    pub const EXP_FLAGS: Self = Self::from_raw(66);
    pub const PATTERN: Self = Self::from_raw(67);
    pub const EXP_TIMEOUT: Self = Self::from_raw(68);
    pub const LOOKBACK: Self = Self::from_raw(69);
    pub const ERROR_CODE: Self = Self::from_raw(70);
    pub const ERROR_MSG: Self = Self::from_raw(71);
    pub const WINSIZE_ROW: Self = Self::from_raw(72);
    pub const WINSIZE_COL: Self = Self::from_raw(73);
    pub const PID: Self = Self::from_raw(74);
    pub const PPID: Self = Self::from_raw(75);
    pub const PTSNAME: Self = Self::from_raw(76);
    pub const AUTOWAIT: Self = Self::from_raw(77);
    pub const NONBLOCK: Self = Self::from_raw(78);
    pub const TTL: Self = Self::from_raw(79);
    pub const IDLE: Self = Self::from_raw(80);
    pub const ZOMBIE_IDLE: Self = Self::from_raw(81);

    /// Whether only a server may send this top-level tag.
    #[must_use]
    pub const fn is_server_only(self) -> bool {
        matches!(self.get(), 32..=38)
    }
}

/// Errors converting a message tree to a typed message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected message tag {0}")]
    UnexpectedTag(u32),

    #[error("message {msg} is missing field {field}")]
    MissingField { msg: &'static str, field: &'static str },

    #[error("message {0} has the wrong value type")]
    WrongType(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: i32 },
}

/// Process exit codes and wire error codes.
///
/// Values are stable: scripts compare exit statuses against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    General = 201,
    Usage = 202,
    NoTty = 203,
    System = 204,
    Protocol = 205,
    Eof = 206,
    Timeout = 207,
    Exited = 208,
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            201 => Some(Self::General),
            202 => Some(Self::Usage),
            203 => Some(Self::NoTty),
            204 => Some(Self::System),
            205 => Some(Self::Protocol),
            206 => Some(Self::Eof),
            207 => Some(Self::Timeout),
            208 => Some(Self::Exited),
            _ => None,
        }
    }

    /// Symbolic name shown in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::General => "ERROR_GENERAL",
            Self::Usage => "ERROR_USAGE",
            Self::NoTty => "ERROR_NOTTY",
            Self::System => "ERROR_SYS",
            Self::Protocol => "ERROR_PROTO",
            Self::Eof => "ERROR_EOF",
            Self::Timeout => "ERROR_TIMEOUT",
            Self::Exited => "ERROR_EXITED",
        }
    }

    /// The code as a process exit status.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // all codes fit in u8
    pub const fn exit_status(self) -> u8 {
        self as i32 as u8
    }
}

/// Pattern-match and termination flags of a `PASS` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpectFlags(i32);

impl ExpectFlags {
    pub const EXACT: Self = Self(0x01);
    pub const GLOB: Self = Self(0x02);
    pub const ERE: Self = Self(0x04);
    pub const EOF: Self = Self(0x08);
    pub const EXIT: Self = Self(0x10);
    pub const ICASE: Self = Self(0x20);
    pub const NOSUB: Self = Self(0x40);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// How many of the mutually exclusive match modes are set.
    #[must_use]
    pub const fn mode_count(self) -> u32 {
        (self.0 & (Self::EXACT.0 | Self::GLOB.0 | Self::ERE.0 | Self::EOF.0)).count_ones()
    }
}

impl std::ops::BitOr for ExpectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for ExpectFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What a `PASS` request waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcommand {
    Expect = 1,
    Interact = 2,
    Wait = 3,
}

impl Subcommand {
    const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Expect),
            2 => Some(Self::Interact),
            3 => Some(Self::Wait),
            _ => None,
        }
    }
}

/// A streamed operation request: expect, interact or wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRequest {
    pub subcommand: Subcommand,
    pub flags: ExpectFlags,
    pub pattern: Option<Vec<u8>>,
    /// Seconds; negative waits forever, zero checks once.
    pub timeout: Option<i32>,
    pub lookback: Option<i32>,
}

/// Runtime-adjustable session parameters. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub autowait: Option<bool>,
    pub nonblock: Option<bool>,
    pub timeout: Option<i32>,
    pub ttl: Option<i32>,
    pub idle: Option<i32>,
}

impl Settings {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.autowait.is_none()
            && self.nonblock.is_none()
            && self.timeout.is_none()
            && self.ttl.is_none()
            && self.idle.is_none()
    }
}

/// Session parameters reported by `INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pts_name: String,
    pub timeout: i32,
    pub autowait: bool,
    pub nonblock: bool,
    pub ttl: i32,
    pub idle: i32,
    pub zombie_idle: i32,
}

/// Requests from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Handshake. `None` when the client omitted its version.
    Hello { version: Option<i32> },
    Disconnect,
    Pass(PassRequest),
    /// Write to the PTY and acknowledge.
    Send(Vec<u8>),
    /// Write to the PTY without acknowledgement (interact keystrokes).
    Input(Vec<u8>),
    Winch { rows: u16, cols: u16 },
    Close,
    Kill { signal: i32 },
    Set(Settings),
    Info,
    ExpectOut { index: i32 },
}

/// Replies and stream messages from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Hello { version: i32 },
    Disconnect,
    Ack,
    Output(Vec<u8>),
    Matched,
    Eof,
    /// Raw wait status of the child.
    Exited { status: i32 },
    Error { code: ErrorCode, message: String },
    ExpectOutText(Vec<u8>),
    Info(SessionInfo),
}

impl Reply {
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Whether this reply ends a pending `PASS` operation.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::Eof | Self::Exited { .. } | Self::Error { .. }
        )
    }
}

fn field<'a>(msg: &'a Tlv, tag: Tag, name: &'static str, field: &'static str) -> Result<&'a Tlv, ProtocolError> {
    msg.child(tag)
        .ok_or(ProtocolError::MissingField { msg: name, field })
}

fn int_field(msg: &Tlv, tag: Tag, name: &'static str, field_name: &'static str) -> Result<i32, ProtocolError> {
    field(msg, tag, name, field_name)?
        .as_int()
        .ok_or(ProtocolError::WrongType(field_name))
}

fn opt_int(msg: &Tlv, tag: Tag, name: &'static str) -> Result<Option<i32>, ProtocolError> {
    msg.child(tag)
        .map(|t| t.as_int().ok_or(ProtocolError::WrongType(name)))
        .transpose()
}

fn opt_bool(msg: &Tlv, tag: Tag, name: &'static str) -> Result<Option<bool>, ProtocolError> {
    msg.child(tag)
        .map(|t| t.as_bool().ok_or(ProtocolError::WrongType(name)))
        .transpose()
}

fn bool_field(msg: &Tlv, tag: Tag, name: &'static str, field_name: &'static str) -> Result<bool, ProtocolError> {
    field(msg, tag, name, field_name)?
        .as_bool()
        .ok_or(ProtocolError::WrongType(field_name))
}

fn winsize_field(msg: &Tlv, tag: Tag, field_name: &'static str) -> Result<u16, ProtocolError> {
    let value = int_field(msg, tag, "WINCH", field_name)?;
    u16::try_from(value).map_err(|_| ProtocolError::InvalidValue {
        field: field_name,
        value,
    })
}

fn bytes_of(msg: &Tlv, name: &'static str) -> Result<Vec<u8>, ProtocolError> {
    msg.as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or(ProtocolError::WrongType(name))
}

impl Request {
    /// Encode for the wire.
    #[must_use]
    pub fn to_tlv(&self) -> Tlv {
        match self {
            Self::Hello { version } => Tlv::structure(Tag::HELLO)
                .with_opt(version.map(|v| Tlv::int(Tag::VERSION, v))),
            Self::Disconnect => Tlv::structure(Tag::DISCONN),
            Self::Pass(pass) => Tlv::structure(Tag::PASS)
                .with(Tlv::int(Tag::PASS_SUBCMD, pass.subcommand as i32))
                .with(Tlv::int(Tag::EXP_FLAGS, pass.flags.bits()))
                .with_opt(pass.pattern.as_ref().map(|p| Tlv::text(Tag::PATTERN, p.clone())))
                .with_opt(pass.timeout.map(|t| Tlv::int(Tag::EXP_TIMEOUT, t)))
                .with_opt(pass.lookback.map(|n| Tlv::int(Tag::LOOKBACK, n))),
            Self::Send(data) => Tlv::raw(Tag::SEND, data.clone()),
            Self::Input(data) => Tlv::raw(Tag::INPUT, data.clone()),
            Self::Winch { rows, cols } => Tlv::structure(Tag::WINCH)
                .with(Tlv::int(Tag::WINSIZE_ROW, i32::from(*rows)))
                .with(Tlv::int(Tag::WINSIZE_COL, i32::from(*cols))),
            Self::Close => Tlv::structure(Tag::CLOSE),
            Self::Kill { signal } => Tlv::int(Tag::KILL, *signal),
            Self::Set(settings) => Tlv::structure(Tag::SET)
                .with_opt(settings.autowait.map(|v| Tlv::bool(Tag::AUTOWAIT, v)))
                .with_opt(settings.nonblock.map(|v| Tlv::bool(Tag::NONBLOCK, v)))
                .with_opt(settings.timeout.map(|v| Tlv::int(Tag::EXP_TIMEOUT, v)))
                .with_opt(settings.ttl.map(|v| Tlv::int(Tag::TTL, v)))
                .with_opt(settings.idle.map(|v| Tlv::int(Tag::IDLE, v))),
            Self::Info => Tlv::structure(Tag::INFO),
            Self::ExpectOut { index } => Tlv::int(Tag::EXPOUT, *index),
        }
    }

    /// Decode a message received by the server.
    pub fn from_tlv(msg: &Tlv) -> Result<Self, ProtocolError> {
        match msg.tag {
            Tag::HELLO => Ok(Self::Hello {
                version: opt_int(msg, Tag::VERSION, "VERSION")?,
            }),
            Tag::DISCONN => Ok(Self::Disconnect),
            Tag::PASS => {
                let code = int_field(msg, Tag::PASS_SUBCMD, "PASS", "PASS_SUBCMD")?;
                let subcommand = Subcommand::from_code(code).ok_or(ProtocolError::InvalidValue {
                    field: "PASS_SUBCMD",
                    value: code,
                })?;
                let flags = ExpectFlags::from_bits(int_field(msg, Tag::EXP_FLAGS, "PASS", "EXP_FLAGS")?);
                let pattern = msg
                    .child(Tag::PATTERN)
                    .map(|t| bytes_of(t, "PATTERN"))
                    .transpose()?;
                Ok(Self::Pass(PassRequest {
                    subcommand,
                    flags,
                    pattern,
                    timeout: opt_int(msg, Tag::EXP_TIMEOUT, "EXP_TIMEOUT")?,
                    lookback: opt_int(msg, Tag::LOOKBACK, "LOOKBACK")?,
                }))
            }
            Tag::SEND => Ok(Self::Send(bytes_of(msg, "SEND")?)),
            Tag::INPUT => Ok(Self::Input(bytes_of(msg, "INPUT")?)),
            Tag::WINCH => Ok(Self::Winch {
                rows: winsize_field(msg, Tag::WINSIZE_ROW, "WINSIZE_ROW")?,
                cols: winsize_field(msg, Tag::WINSIZE_COL, "WINSIZE_COL")?,
            }),
            Tag::CLOSE => Ok(Self::Close),
            Tag::KILL => Ok(Self::Kill {
                signal: msg.as_int().ok_or(ProtocolError::WrongType("KILL"))?,
            }),
            Tag::SET => Ok(Self::Set(Settings {
                autowait: opt_bool(msg, Tag::AUTOWAIT, "AUTOWAIT")?,
                nonblock: opt_bool(msg, Tag::NONBLOCK, "NONBLOCK")?,
                timeout: opt_int(msg, Tag::EXP_TIMEOUT, "EXP_TIMEOUT")?,
                ttl: opt_int(msg, Tag::TTL, "TTL")?,
                idle: opt_int(msg, Tag::IDLE, "IDLE")?,
            })),
            Tag::INFO => Ok(Self::Info),
            Tag::EXPOUT => Ok(Self::ExpectOut {
                index: msg.as_int().ok_or(ProtocolError::WrongType("EXPOUT"))?,
            }),
            other => Err(ProtocolError::UnexpectedTag(other.get())),
        }
    }
}

impl Reply {
    /// Encode for the wire.
    #[must_use]
    pub fn to_tlv(&self) -> Tlv {
        match self {
            Self::Hello { version } => {
                Tlv::structure(Tag::HELLO).with(Tlv::int(Tag::VERSION, *version))
            }
            Self::Disconnect => Tlv::structure(Tag::DISCONN),
            Self::Ack => Tlv::structure(Tag::ACK),
            Self::Output(data) => Tlv::raw(Tag::OUTPUT, data.clone()),
            Self::Matched => Tlv::structure(Tag::MATCHED),
            Self::Eof => Tlv::structure(Tag::EOF),
            Self::Exited { status } => Tlv::int(Tag::EXITED, *status),
            Self::Error { code, message } => Tlv::structure(Tag::ERROR)
                .with(Tlv::int(Tag::ERROR_CODE, code.code()))
                .with(Tlv::text(Tag::ERROR_MSG, message.as_bytes())),
            Self::ExpectOutText(text) => Tlv::text(Tag::EXPOUT_TEXT, text.clone()),
            Self::Info(info) => Tlv::structure(Tag::INFO)
                .with(Tlv::int(Tag::PID, info.pid))
                .with(Tlv::int(Tag::PPID, info.ppid))
                .with(Tlv::text(Tag::PTSNAME, info.pts_name.as_bytes()))
                .with(Tlv::int(Tag::EXP_TIMEOUT, info.timeout))
                .with(Tlv::bool(Tag::AUTOWAIT, info.autowait))
                .with(Tlv::bool(Tag::NONBLOCK, info.nonblock))
                .with(Tlv::int(Tag::TTL, info.ttl))
                .with(Tlv::int(Tag::IDLE, info.idle))
                .with(Tlv::int(Tag::ZOMBIE_IDLE, info.zombie_idle)),
        }
    }

    /// Decode a message received by a client.
    pub fn from_tlv(msg: &Tlv) -> Result<Self, ProtocolError> {
        match msg.tag {
            Tag::HELLO => Ok(Self::Hello {
                version: int_field(msg, Tag::VERSION, "HELLO", "VERSION")?,
            }),
            Tag::DISCONN => Ok(Self::Disconnect),
            Tag::ACK => Ok(Self::Ack),
            Tag::OUTPUT => Ok(Self::Output(bytes_of(msg, "OUTPUT")?)),
            Tag::MATCHED => Ok(Self::Matched),
            Tag::EOF => Ok(Self::Eof),
            Tag::EXITED => Ok(Self::Exited {
                status: msg.as_int().ok_or(ProtocolError::WrongType("EXITED"))?,
            }),
            Tag::ERROR => {
                let value = int_field(msg, Tag::ERROR_CODE, "ERROR", "ERROR_CODE")?;
                let code = ErrorCode::from_code(value).ok_or(ProtocolError::InvalidValue {
                    field: "ERROR_CODE",
                    value,
                })?;
                let message = field(msg, Tag::ERROR_MSG, "ERROR", "ERROR_MSG")?
                    .as_bytes()
                    .ok_or(ProtocolError::WrongType("ERROR_MSG"))?;
                Ok(Self::Error {
                    code,
                    message: String::from_utf8_lossy(message).into_owned(),
                })
            }
            Tag::EXPOUT_TEXT => Ok(Self::ExpectOutText(bytes_of(msg, "EXPOUT_TEXT")?)),
            Tag::INFO => {
                let pts = field(msg, Tag::PTSNAME, "INFO", "PTSNAME")?
                    .as_bytes()
                    .ok_or(ProtocolError::WrongType("PTSNAME"))?;
                Ok(Self::Info(SessionInfo {
                    pid: int_field(msg, Tag::PID, "INFO", "PID")?,
                    ppid: int_field(msg, Tag::PPID, "INFO", "PPID")?,
                    pts_name: String::from_utf8_lossy(pts).into_owned(),
                    timeout: int_field(msg, Tag::EXP_TIMEOUT, "INFO", "EXP_TIMEOUT")?,
                    autowait: bool_field(msg, Tag::AUTOWAIT, "INFO", "AUTOWAIT")?,
                    nonblock: bool_field(msg, Tag::NONBLOCK, "INFO", "NONBLOCK")?,
                    ttl: int_field(msg, Tag::TTL, "INFO", "TTL")?,
                    idle: int_field(msg, Tag::IDLE, "INFO", "IDLE")?,
                    zombie_idle: int_field(msg, Tag::ZOMBIE_IDLE, "INFO", "ZOMBIE_IDLE")?,
                }))
            }
            other => Err(ProtocolError::UnexpectedTag(other.get())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn wire_round_trip(msg: &Tlv) -> Tlv {
        let bytes = msg.encode(usize::MAX).unwrap();
        codec::decode_message(&bytes).unwrap()
    }

    #[test]
    fn test_pass_request() {
        let req = Request::Pass(PassRequest {
            subcommand: Subcommand::Expect,
            flags: ExpectFlags::ERE | ExpectFlags::ICASE,
            pattern: Some(b"foo(bar)".to_vec()),
            timeout: Some(-1),
            lookback: None,
        });
        let decoded = Request::from_tlv(&wire_round_trip(&req.to_tlv())).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_pass_missing_subcommand() {
        let msg = Tlv::structure(Tag::PASS).with(Tlv::int(Tag::EXP_FLAGS, 0));
        assert_eq!(
            Request::from_tlv(&msg).unwrap_err(),
            ProtocolError::MissingField {
                msg: "PASS",
                field: "PASS_SUBCMD"
            }
        );
    }

    #[test]
    fn test_pass_unknown_subcommand() {
        let msg = Tlv::structure(Tag::PASS)
            .with(Tlv::int(Tag::PASS_SUBCMD, 9))
            .with(Tlv::int(Tag::EXP_FLAGS, 0));
        assert!(matches!(
            Request::from_tlv(&msg),
            Err(ProtocolError::InvalidValue { value: 9, .. })
        ));
    }

    #[test]
    fn test_ill_typed_field() {
        let msg = Tlv::structure(Tag::SET).with(Tlv::int(Tag::AUTOWAIT, 1));
        assert_eq!(
            Request::from_tlv(&msg).unwrap_err(),
            ProtocolError::WrongType("AUTOWAIT")
        );
    }

    #[test]
    fn test_hello_without_version() {
        let msg = Tlv::structure(Tag::HELLO);
        assert_eq!(
            Request::from_tlv(&msg).unwrap(),
            Request::Hello { version: None }
        );
    }

    #[test]
    fn test_server_tags_rejected_as_requests() {
        for tag in [Tag::ACK, Tag::OUTPUT, Tag::EXITED, Tag::EXPOUT_TEXT] {
            assert!(tag.is_server_only());
            let msg = Tlv::structure(tag);
            assert_eq!(
                Request::from_tlv(&msg).unwrap_err(),
                ProtocolError::UnexpectedTag(tag.get())
            );
        }
        assert!(!Tag::INFO.is_server_only());
    }

    #[test]
    fn test_winch_out_of_range() {
        let msg = Tlv::structure(Tag::WINCH)
            .with(Tlv::int(Tag::WINSIZE_ROW, -1))
            .with(Tlv::int(Tag::WINSIZE_COL, 80));
        assert!(matches!(
            Request::from_tlv(&msg),
            Err(ProtocolError::InvalidValue { field: "WINSIZE_ROW", .. })
        ));
    }

    #[test]
    fn test_replies_round_trip() {
        let info = SessionInfo {
            pid: 100,
            ppid: 99,
            pts_name: "/dev/pts/3".into(),
            timeout: 10,
            autowait: false,
            nonblock: true,
            ttl: 0,
            idle: 60,
            zombie_idle: -1,
        };
        for reply in [
            Reply::Hello { version: PROTOCOL_VERSION },
            Reply::Ack,
            Reply::Output(b"\x00abc\r\n".to_vec()),
            Reply::Exited { status: 0x0200 },
            Reply::error(ErrorCode::Timeout, "expect timed out"),
            Reply::ExpectOutText(Vec::new()),
            Reply::Info(info),
        ] {
            let decoded = Reply::from_tlv(&wire_round_trip(&reply.to_tlv())).unwrap();
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn test_terminal_replies() {
        assert!(Reply::Matched.is_terminal());
        assert!(Reply::error(ErrorCode::Eof, "PTY closed").is_terminal());
        assert!(!Reply::Output(vec![1]).is_terminal());
        assert!(!Reply::Ack.is_terminal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::Eof.code(), 206);
        assert_eq!(ErrorCode::Timeout.exit_status(), 207);
        assert_eq!(ErrorCode::from_code(208), Some(ErrorCode::Exited));
        assert_eq!(ErrorCode::from_code(200), None);
    }

    #[test]
    fn test_flag_modes() {
        assert_eq!(ExpectFlags::EXIT.mode_count(), 0);
        assert_eq!((ExpectFlags::ERE | ExpectFlags::ICASE).mode_count(), 1);
        assert_eq!((ExpectFlags::ERE | ExpectFlags::EXACT).mode_count(), 2);
        assert!((ExpectFlags::ERE | ExpectFlags::NOSUB).contains(ExpectFlags::NOSUB));
    }
}
