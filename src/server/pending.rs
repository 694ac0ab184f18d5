//! The outstanding expect / interact / wait operation of a connection.

use super::matcher::{Matcher, PatternError};
use crate::protocol::{ExpectFlags, PassRequest, Subcommand};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a `PASS` request was refused.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("only one of exact, glob, regex or eof may be given")]
    ConflictingModes,

    #[error("expect needs a pattern or eof")]
    NothingToExpect,

    #[error("{0}")]
    Pattern(#[from] PatternError),
}

/// An installed `PASS` request.
#[derive(Debug)]
pub struct PendingOp {
    pub subcommand: Subcommand,
    pub flags: ExpectFlags,
    pub matcher: Option<Matcher>,
    /// Seconds; negative never expires, zero expires at the first check.
    pub timeout: i32,
    lookback: Option<usize>,
    started: Instant,
}

impl PendingOp {
    /// Validate a request and compile its pattern.
    pub fn install(req: PassRequest, default_timeout: i32, now: Instant) -> Result<Self, PassError> {
        if req.flags.mode_count() > 1 {
            return Err(PassError::ConflictingModes);
        }
        let matcher = req
            .pattern
            .as_deref()
            .map(|p| Matcher::compile(p, req.flags))
            .transpose()?;
        if req.subcommand == Subcommand::Expect
            && matcher.is_none()
            && !req.flags.contains(ExpectFlags::EOF)
        {
            return Err(PassError::NothingToExpect);
        }

        Ok(Self {
            subcommand: req.subcommand,
            flags: req.flags,
            matcher,
            timeout: req.timeout.unwrap_or(default_timeout),
            lookback: req
                .lookback
                .and_then(|n| usize::try_from(n).ok())
                .filter(|&n| n > 0),
            started: now,
        })
    }

    /// The lookback line count, handed out once.
    pub const fn take_lookback(&mut self) -> Option<usize> {
        self.lookback.take()
    }

    #[must_use]
    pub fn timed_out(&self, now: Instant) -> bool {
        match u64::try_from(self.timeout) {
            Err(_) => false,
            Ok(0) => true,
            Ok(secs) => now.saturating_duration_since(self.started) > Duration::from_secs(secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect(flags: ExpectFlags, pattern: Option<&str>) -> PassRequest {
        PassRequest {
            subcommand: Subcommand::Expect,
            flags,
            pattern: pattern.map(|p| p.as_bytes().to_vec()),
            timeout: None,
            lookback: None,
        }
    }

    #[test]
    fn test_default_timeout_applies() {
        let now = Instant::now();
        let op = PendingOp::install(expect(ExpectFlags::EXACT, Some("x")), 10, now).unwrap();
        assert_eq!(op.timeout, 10);
        assert!(!op.timed_out(now + Duration::from_secs(10)));
        assert!(op.timed_out(now + Duration::from_millis(10_001)));
    }

    #[test]
    fn test_zero_and_negative_timeouts() {
        let now = Instant::now();
        let mut req = expect(ExpectFlags::EOF, None);
        req.timeout = Some(0);
        assert!(PendingOp::install(req.clone(), 10, now).unwrap().timed_out(now));
        req.timeout = Some(-1);
        let op = PendingOp::install(req, 10, now).unwrap();
        assert!(!op.timed_out(now + Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_lookback_taken_once() {
        let mut req = expect(ExpectFlags::EXACT, Some("x"));
        req.lookback = Some(3);
        let mut op = PendingOp::install(req, 10, Instant::now()).unwrap();
        assert_eq!(op.take_lookback(), Some(3));
        assert_eq!(op.take_lookback(), None);
    }

    #[test]
    fn test_non_positive_lookback_ignored() {
        let mut req = expect(ExpectFlags::EXACT, Some("x"));
        req.lookback = Some(-2);
        let mut op = PendingOp::install(req, 10, Instant::now()).unwrap();
        assert_eq!(op.take_lookback(), None);
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let now = Instant::now();
        assert!(matches!(
            PendingOp::install(expect(ExpectFlags::EXACT | ExpectFlags::ERE, Some("x")), 10, now),
            Err(PassError::ConflictingModes)
        ));
        assert!(matches!(
            PendingOp::install(expect(ExpectFlags::ICASE, None), 10, now),
            Err(PassError::NothingToExpect)
        ));
        assert!(matches!(
            PendingOp::install(expect(ExpectFlags::ERE, Some("(")), 10, now),
            Err(PassError::Pattern(_))
        ));
    }

    #[test]
    fn test_wait_without_pattern() {
        let req = PassRequest {
            subcommand: Subcommand::Wait,
            flags: ExpectFlags::EXIT,
            pattern: None,
            timeout: Some(-1),
            lookback: None,
        };
        let op = PendingOp::install(req, 10, Instant::now()).unwrap();
        assert!(op.matcher.is_none());
    }
}
