//! POSIX extended regular expressions from the C library.
//!
//! `regcomp`/`regexec` give leftmost-longest matching and backreferences.
//! The subject is passed as a C string, so matching stops at the first NUL.

#![allow(unsafe_code)]

use crate::protocol::CAPTURE_REGISTERS;
use std::ffi::{CStr, CString, c_int};
use std::fmt;
use std::mem::MaybeUninit;
use std::ops::Range;
use thiserror::Error;
use tracing::warn;

/// A pattern `regcomp` refused, with its message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EreError(String);

/// Spans of the whole match and each group; `None` where a group did not
/// take part.
pub type Spans = [Option<Range<usize>>; CAPTURE_REGISTERS];

/// A compiled extended regex.
pub struct Ere {
    raw: Box<libc::regex_t>,
    pattern: String,
}

// SAFETY: the compiled program is heap state owned by this value alone and
// freed once in `drop`. POSIX requires `regexec` to be thread-safe on a
// shared, already compiled pattern.
unsafe impl Send for Ere {}
unsafe impl Sync for Ere {}

impl Ere {
    pub fn compile(pattern: &[u8], ignore_case: bool) -> Result<Self, EreError> {
        let source =
            CString::new(pattern).map_err(|_| EreError("pattern contains a NUL byte".into()))?;
        let mut flags = libc::REG_EXTENDED;
        if ignore_case {
            flags |= libc::REG_ICASE;
        }

        let mut raw = Box::new(MaybeUninit::<libc::regex_t>::uninit());
        // SAFETY: `raw` is storage for one regex_t and `source` is NUL-terminated.
        let code = unsafe { libc::regcomp(raw.as_mut_ptr(), source.as_ptr(), flags) };
        if code != 0 {
            return Err(EreError(describe(code)));
        }
        // SAFETY: regcomp returned 0, so it initialized the struct.
        let raw = unsafe { raw.assume_init() };

        Ok(Self {
            raw,
            pattern: String::from_utf8_lossy(pattern).into_owned(),
        })
    }

    /// Search `haystack` for the leftmost-longest match.
    #[must_use]
    pub fn exec(&self, haystack: &[u8]) -> Option<Spans> {
        let mut subject = Vec::with_capacity(haystack.len() + 1);
        subject.extend_from_slice(haystack);
        subject.push(0);

        let mut slots = [libc::regmatch_t { rm_so: -1, rm_eo: -1 }; CAPTURE_REGISTERS];
        // SAFETY: `subject` is NUL-terminated and `slots` holds `slots.len()` entries.
        let code = unsafe {
            libc::regexec(
                &raw const *self.raw,
                subject.as_ptr().cast(),
                slots.len(),
                slots.as_mut_ptr(),
                0,
            )
        };
        if code != 0 {
            if code != libc::REG_NOMATCH {
                warn!(pattern = %self.pattern, error = %describe(code), "regexec failed");
            }
            return None;
        }

        Some(slots.map(|m| {
            let start = usize::try_from(m.rm_so).ok()?;
            let end = usize::try_from(m.rm_eo).ok()?;
            Some(start..end)
        }))
    }
}

impl Drop for Ere {
    fn drop(&mut self) {
        // SAFETY: compiled by regcomp in `compile` and freed only here.
        unsafe { libc::regfree(&raw mut *self.raw) };
    }
}

impl fmt::Debug for Ere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ere").field("pattern", &self.pattern).finish()
    }
}

fn describe(code: c_int) -> String {
    let mut buf = [0u8; 128];
    // SAFETY: regerror writes at most `buf.len()` bytes, NUL included, and
    // does not read the pattern argument.
    unsafe { libc::regerror(code, std::ptr::null(), buf.as_mut_ptr().cast(), buf.len()) };
    CStr::from_bytes_until_nul(&buf).map_or_else(
        |_| format!("regex error {code}"),
        |s| s.to_string_lossy().into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(pattern: &str, haystack: &str) -> Option<Spans> {
        Ere::compile(pattern.as_bytes(), false).unwrap().exec(haystack.as_bytes())
    }

    #[test]
    fn test_backreference() {
        let m = spans(r"(ab)\1", "xxababyy").unwrap();
        assert_eq!(m[0], Some(2..6));
        assert_eq!(m[1], Some(2..4));
        assert!(spans(r"(ab)\1", "abac").is_none());
    }

    #[test]
    fn test_leftmost_longest() {
        let m = spans("(a|ab)", "abc").unwrap();
        assert_eq!(m[0], Some(0..2));
        assert_eq!(m[1], Some(0..2));
    }

    #[test]
    fn test_unused_groups_are_none() {
        let m = spans("(x)|(y)", "y").unwrap();
        assert_eq!(m[1], None);
        assert_eq!(m[2], Some(0..1));
        assert_eq!(m[9], None);
    }

    #[test]
    fn test_stops_at_nul() {
        let re = Ere::compile(b"b", false).unwrap();
        assert!(re.exec(b"a\0b").is_none());
    }

    #[test]
    fn test_compile_error_message() {
        let err = Ere::compile(b"a(", false).unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(Ere::compile(b"a\0", false).is_err());
    }
}
