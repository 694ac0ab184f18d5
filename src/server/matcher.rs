//! Pattern matching against the expect view.

use super::ere::{Ere, EreError};
use crate::protocol::{CAPTURE_REGISTERS, ExpectFlags};
use thiserror::Error;

/// Why a pattern could not be installed.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern contains a NUL byte")]
    Nul,

    #[error("invalid regex: {0}")]
    Regex(#[source] EreError),

    #[error("glob patterns must be translated by the client")]
    Glob,

    #[error("no match mode given for pattern")]
    NoMode,
}

/// Saved match text: the whole match in slot 0 and groups in 1-9.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures([Option<Vec<u8>>; CAPTURE_REGISTERS]);

impl Captures {
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.0.get(index).and_then(Option::as_deref)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn set(&mut self, index: usize, text: Option<Vec<u8>>) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = text;
        }
    }
}

/// A compiled pattern from a `PASS` request.
#[derive(Debug)]
pub enum Matcher {
    Exact { pattern: Vec<u8>, ignore_case: bool },
    Regex { regex: Ere, capture: bool },
}

/// Where a successful match ended in the haystack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchEnd(pub usize);

impl Matcher {
    /// Compile `pattern` for the match mode named in `flags`.
    pub fn compile(pattern: &[u8], flags: ExpectFlags) -> Result<Self, PatternError> {
        if pattern.contains(&0) {
            return Err(PatternError::Nul);
        }
        let ignore_case = flags.contains(ExpectFlags::ICASE);

        if flags.contains(ExpectFlags::EXACT) {
            return Ok(Self::Exact {
                pattern: pattern.to_vec(),
                ignore_case,
            });
        }
        if flags.contains(ExpectFlags::GLOB) {
            return Err(PatternError::Glob);
        }
        if !flags.contains(ExpectFlags::ERE) {
            return Err(PatternError::NoMode);
        }

        let regex = Ere::compile(pattern, ignore_case).map_err(PatternError::Regex)?;
        Ok(Self::Regex {
            regex,
            capture: !flags.contains(ExpectFlags::NOSUB),
        })
    }

    /// Search `haystack`, updating `captures` on success.
    ///
    /// An exact match stores the literal pattern in slot 0 and clears the
    /// rest. A regex match replaces every slot unless captures are disabled.
    pub fn find(&self, haystack: &[u8], captures: &mut Captures) -> Option<MatchEnd> {
        match self {
            Self::Exact {
                pattern,
                ignore_case,
            } => {
                let start = find_literal(haystack, pattern, *ignore_case)?;
                captures.clear();
                captures.set(0, Some(pattern.clone()));
                Some(MatchEnd(start + pattern.len()))
            }
            Self::Regex { regex, capture } => {
                let spans = regex.exec(haystack)?;
                let end = spans[0].as_ref().map_or(0, |whole| whole.end);
                if *capture {
                    for (index, span) in spans.into_iter().enumerate() {
                        let text = span.and_then(|r| haystack.get(r)).map(<[u8]>::to_vec);
                        captures.set(index, text);
                    }
                }
                Some(MatchEnd(end))
            }
        }
    }
}

fn find_literal(haystack: &[u8], needle: &[u8], ignore_case: bool) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| {
        if ignore_case {
            window.eq_ignore_ascii_case(needle)
        } else {
            window == needle
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex(pattern: &str) -> Matcher {
        Matcher::compile(pattern.as_bytes(), ExpectFlags::ERE).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let m = Matcher::compile(b"ell", ExpectFlags::EXACT).unwrap();
        let mut caps = Captures::default();
        assert_eq!(m.find(b"hello", &mut caps), Some(MatchEnd(4)));
        assert_eq!(caps.get(0), Some(&b"ell"[..]));
        assert_eq!(caps.get(1), None);
    }

    #[test]
    fn test_exact_ignore_case() {
        let m = Matcher::compile(b"PASSWORD:", ExpectFlags::EXACT | ExpectFlags::ICASE).unwrap();
        let mut caps = Captures::default();
        assert_eq!(m.find(b"Password: ", &mut caps), Some(MatchEnd(9)));
        // slot 0 holds the pattern, not the matched text
        assert_eq!(caps.get(0), Some(&b"PASSWORD:"[..]));
    }

    #[test]
    fn test_exact_no_match_keeps_captures() {
        let m = Matcher::compile(b"zzz", ExpectFlags::EXACT).unwrap();
        let mut caps = Captures::default();
        caps.set(3, Some(b"kept".to_vec()));
        assert_eq!(m.find(b"abc", &mut caps), None);
        assert_eq!(caps.get(3), Some(&b"kept"[..]));
    }

    #[test]
    fn test_regex_captures() {
        let m = regex("a(bc)d(ef)g");
        let mut caps = Captures::default();
        assert_eq!(m.find(b"xxabcdefgyy", &mut caps), Some(MatchEnd(9)));
        assert_eq!(caps.get(0), Some(&b"abcdefg"[..]));
        assert_eq!(caps.get(1), Some(&b"bc"[..]));
        assert_eq!(caps.get(2), Some(&b"ef"[..]));
        assert_eq!(caps.get(3), None);
    }

    #[test]
    fn test_regex_replaces_old_captures() {
        let m = regex("(x)|(y)");
        let mut caps = Captures::default();
        m.find(b"x", &mut caps);
        assert_eq!(caps.get(1), Some(&b"x"[..]));
        m.find(b"y", &mut caps);
        assert_eq!(caps.get(1), None);
        assert_eq!(caps.get(2), Some(&b"y"[..]));
    }

    #[test]
    fn test_regex_nosub_leaves_captures() {
        let m = Matcher::compile(b"(b)", ExpectFlags::ERE | ExpectFlags::NOSUB).unwrap();
        let mut caps = Captures::default();
        caps.set(0, Some(b"previous".to_vec()));
        assert_eq!(m.find(b"abc", &mut caps), Some(MatchEnd(2)));
        assert_eq!(caps.get(0), Some(&b"previous"[..]));
    }

    #[test]
    fn test_regex_backreference() {
        let m = regex(r"(ab)\1");
        let mut caps = Captures::default();
        assert_eq!(m.find(b"xxababyy", &mut caps), Some(MatchEnd(6)));
        assert_eq!(caps.get(0), Some(&b"abab"[..]));
        assert_eq!(caps.get(1), Some(&b"ab"[..]));
    }

    #[test]
    fn test_regex_alternation_takes_longest() {
        let m = regex("(a|ab)");
        let mut caps = Captures::default();
        assert_eq!(m.find(b"abc", &mut caps), Some(MatchEnd(2)));
        assert_eq!(caps.get(0), Some(&b"ab"[..]));
        assert_eq!(caps.get(1), Some(&b"ab"[..]));
    }

    #[test]
    fn test_regex_dot_matches_newline() {
        let m = regex("a.b");
        let mut caps = Captures::default();
        assert!(m.find(b"a\nb", &mut caps).is_some());
    }

    #[test]
    fn test_regex_on_non_utf8_haystack() {
        let m = regex("ok");
        let mut caps = Captures::default();
        assert_eq!(m.find(b"\xff\xfeok", &mut caps), Some(MatchEnd(4)));
    }

    #[test]
    fn test_regex_ignore_case() {
        let m = Matcher::compile(b"^login", ExpectFlags::ERE | ExpectFlags::ICASE).unwrap();
        let mut caps = Captures::default();
        assert!(m.find(b"LOGIN: ", &mut caps).is_some());
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            Matcher::compile(b"a(", ExpectFlags::ERE),
            Err(PatternError::Regex(_))
        ));
        assert!(matches!(
            Matcher::compile(b"a\0b", ExpectFlags::EXACT),
            Err(PatternError::Nul)
        ));
        assert!(matches!(
            Matcher::compile(b"*.txt", ExpectFlags::GLOB),
            Err(PatternError::Glob)
        ));
        assert!(matches!(
            Matcher::compile(b"x", ExpectFlags::EOF),
            Err(PatternError::NoMode)
        ));
    }
}
