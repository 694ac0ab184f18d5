//! Glob pattern translation.
//!
//! `expect --glob` patterns are turned into POSIX extended regexes on the
//! client; the server only ever sees the translated form.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GlobError {
    #[error("unterminated bracket expression")]
    Unterminated,

    #[error("unmatched ']'")]
    StrayBracket,

    #[error("trailing backslash")]
    TrailingBackslash,

    #[error("'\\{0}' does not escape a glob character")]
    BadEscape(char),

    #[error("character classes are not supported in brackets")]
    CharacterClass,
}

const GLOB_SPECIAL: &[char] = &['*', '?', '[', ']', '\\'];

const ERE_SPECIAL: &[char] = &[
    '.', '[', ']', '(', ')', '*', '+', '?', '{', '}', '|', '^', '$', '\\',
];

fn push_literal(out: &mut String, c: char) {
    if ERE_SPECIAL.contains(&c) {
        out.push('\\');
    }
    out.push(c);
}

/// Translate a glob into an unanchored regex.
///
/// `*` and `?` become `.*` and `.`; brackets keep their members, with `!`
/// or `^` negating and a leading `]` taken literally. A leading `^` and a
/// trailing `$` stay anchors. Everything else matches itself.
pub fn glob_to_regex(glob: &str) -> Result<String, GlobError> {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::with_capacity(glob.len() * 2);
    let mut i = 0;

    if chars.first() == Some(&'^') {
        out.push('^');
        i = 1;
    }
    let anchored_end = chars.len() > i && chars.last() == Some(&'$');
    let end = if anchored_end { chars.len() - 1 } else { chars.len() };

    while i < end {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                let Some(&next) = chars.get(i + 1) else {
                    return Err(GlobError::TrailingBackslash);
                };
                if i + 1 >= end && anchored_end {
                    // the final '$' was escaped
                    return Err(GlobError::BadEscape(next));
                }
                if !GLOB_SPECIAL.contains(&next) {
                    return Err(GlobError::BadEscape(next));
                }
                push_literal(&mut out, next);
                i += 1;
            }
            ']' => return Err(GlobError::StrayBracket),
            '[' => i = bracket(&chars[..end], i, &mut out)?,
            c => push_literal(&mut out, c),
        }
        i += 1;
    }

    if anchored_end {
        out.push('$');
    }
    Ok(out)
}

/// Translate the bracket expression opening at `start`. Returns the index
/// of its closing `]`. Members are copied as is: inside brackets a POSIX
/// regex has no escapes.
fn bracket(chars: &[char], start: usize, out: &mut String) -> Result<usize, GlobError> {
    let mut i = start + 1;
    out.push('[');
    if matches!(chars.get(i), Some('!' | '^')) {
        out.push('^');
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        out.push(']');
        i += 1;
    }

    loop {
        match chars.get(i) {
            None => return Err(GlobError::Unterminated),
            Some(']') => {
                out.push(']');
                return Ok(i);
            }
            Some('[') if matches!(chars.get(i + 1), Some(':' | '.' | '=')) => {
                return Err(GlobError::CharacterClass);
            }
            Some(&c) => out.push(c),
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExpectFlags;
    use crate::server::{Captures, Matcher};

    fn compile(glob: &str) -> Matcher {
        let re = glob_to_regex(glob).unwrap_or_else(|e| panic!("{glob}: {e}"));
        Matcher::compile(re.as_bytes(), ExpectFlags::ERE)
            .unwrap_or_else(|e| panic!("{glob} -> {re}: {e}"))
    }

    fn matches(glob: &str, text: &str) -> bool {
        compile(glob).find(text.as_bytes(), &mut Captures::default()).is_some()
    }

    #[test]
    fn test_accepted_patterns_compile() {
        for glob in [
            "",
            "^$",
            "^foo$",
            "^foo",
            "foo$",
            "123?456*789",
            ".+|^$<>(){}",
            "[]]",
            "[Pp]assword",
            "[^]]",
            "[!]]",
            "[a-z]",
            "[a-z]\\]",
        ] {
            compile(glob);
        }
    }

    #[test]
    fn test_rejected_patterns() {
        for glob in [
            "[",
            "[a-z",
            "[a-z]]",
            "]",
            "\\",
            "\\^",
            "\\x",
            "[[:digit:]]",
            "[[.cC.]]",
            "[[=o=]]",
        ] {
            assert!(glob_to_regex(glob).is_err(), "{glob} should be rejected");
        }
    }

    #[test]
    fn test_translation() {
        assert_eq!(glob_to_regex("a*b?c").unwrap(), "a.*b.c");
        assert_eq!(glob_to_regex("^foo$").unwrap(), "^foo$");
        assert_eq!(glob_to_regex("[!]]").unwrap(), "[^]]");
        assert_eq!(glob_to_regex("a.b(c)").unwrap(), r"a\.b\(c\)");
    }

    #[test]
    fn test_wildcards() {
        assert!(matches("123?456*789", "xx123a456bbb789yy"));
        assert!(!matches("123?456*789", "123456789"));
        assert!(matches("[Pp]assword:", "Password: "));
        assert!(matches("[Pp]assword:", "password:"));
    }

    #[test]
    fn test_unanchored_unless_asked() {
        assert!(matches("foo", "a foo b"));
        assert!(!matches("^foo", "a foo"));
        assert!(!matches("foo$", "foo bar"));
        assert!(matches("foo$", "bar foo"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        assert!(matches(".+|^$<>(){}", "x.+|^$<>(){}"));
        assert!(!matches(".+|^$<>(){}", "ab"));
    }

    #[test]
    fn test_brackets() {
        assert!(matches("[]]", "]"));
        assert!(matches("[^]]", "a"));
        assert!(!matches("^[^]]$", "]"));
        assert!(matches("[a-z]\\]", "q]"));
        assert!(!matches("^[!a-c]$", "b"));
        assert!(matches("^[\\]$", "\\"));
    }

    #[test]
    fn test_escaped_wildcards() {
        assert!(matches("a\\*b", "a*b"));
        assert!(!matches("a\\*b", "aab"));
        assert!(matches("\\?", "?"));
    }
}
