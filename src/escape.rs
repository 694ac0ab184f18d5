//! C-style backslash escapes for `--cstring` arguments.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscapeError {
    #[error("invalid control escape '\\c' at offset {0}")]
    Control(usize),

    #[error("'\\x' without hex digits at offset {0}")]
    Hex(usize),
}

fn octal(b: u8) -> Option<u32> {
    matches!(b, b'0'..=b'7').then(|| u32::from(b - b'0'))
}

fn hex(b: u8) -> Option<u8> {
    char::from(b)
        .to_digit(16)
        .and_then(|d| u8::try_from(d).ok())
}

/// Decode backslash escapes.
///
/// Understands `\\ \a \b \e \E \f \n \r \t \v`, `\cX` for control
/// characters, `\xH`, `\xHH` and one to three octal digits. An unknown
/// escape stands for the escaped character and a trailing backslash is
/// kept as is.
pub fn unescape(input: &str) -> Result<Vec<u8>, EscapeError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let Some(&code) = bytes.get(i + 1) else {
            out.push(b'\\');
            break;
        };
        let at = |n: usize| bytes.get(i + n).copied();

        let (byte, len) = match code {
            b'\\' => (b'\\', 2),
            b'a' => (0x07, 2),
            b'b' => (0x08, 2),
            b'e' | b'E' => (0x1b, 2),
            b'f' => (0x0c, 2),
            b'n' => (b'\n', 2),
            b'r' => (b'\r', 2),
            b't' => (b'\t', 2),
            b'v' => (0x0b, 2),
            b'c' => {
                let c = at(2).map(|c| c.to_ascii_uppercase());
                match c {
                    Some(c @ b'A'..=b'_') => (c - b'A' + 1, 3),
                    _ => return Err(EscapeError::Control(i)),
                }
            }
            b'x' => {
                let hi = at(2).and_then(hex).ok_or(EscapeError::Hex(i))?;
                match at(3).and_then(hex) {
                    Some(lo) => (hi << 4 | lo, 4),
                    None => (hi, 3),
                }
            }
            b'0'..=b'7' => {
                let d1 = u32::from(code - b'0');
                match (at(2).and_then(octal), at(3).and_then(octal)) {
                    (Some(d2), Some(d3)) if d1 * 64 + d2 * 8 + d3 <= 0xff => {
                        (octal_byte(d1 * 64 + d2 * 8 + d3), 4)
                    }
                    (Some(d2), _) => (octal_byte(d1 * 8 + d2), 3),
                    (None, _) => (octal_byte(d1), 2),
                }
            }
            other => (other, 2),
        };
        out.push(byte);
        i += len;
    }
    Ok(out)
}

fn octal_byte(value: u32) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_escapes() {
        assert_eq!(
            unescape(r"\\\a\b\e\E\f\n\r\t\v").unwrap(),
            b"\\\x07\x08\x1b\x1b\x0c\n\r\t\x0b"
        );
    }

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(unescape("hello world").unwrap(), b"hello world");
        assert_eq!(unescape("").unwrap(), b"");
    }

    #[test]
    fn test_control() {
        assert_eq!(unescape(r"\cc").unwrap(), [0x03]);
        assert_eq!(unescape(r"\cC").unwrap(), [0x03]);
        assert_eq!(unescape(r"\c[").unwrap(), [0x1b]);
        assert_eq!(unescape(r"\c_").unwrap(), [0x1f]);
        assert_eq!(unescape(r"\c@"), Err(EscapeError::Control(0)));
        assert_eq!(unescape(r"ab\c"), Err(EscapeError::Control(2)));
    }

    #[test]
    fn test_hex() {
        assert_eq!(unescape(r"\x41").unwrap(), b"A");
        assert_eq!(unescape(r"\x4g").unwrap(), b"\x04g");
        assert_eq!(unescape(r"\xfF").unwrap(), [0xff]);
        assert_eq!(unescape(r"\xz"), Err(EscapeError::Hex(0)));
        assert_eq!(unescape(r"\x"), Err(EscapeError::Hex(0)));
    }

    #[test]
    fn test_octal() {
        assert_eq!(unescape(r"\0").unwrap(), [0]);
        assert_eq!(unescape(r"\12").unwrap(), b"\n");
        assert_eq!(unescape(r"\101").unwrap(), b"A");
        assert_eq!(unescape(r"\377").unwrap(), [0xff]);
        // over 0xff: two digits, the third is literal
        assert_eq!(unescape(r"\400").unwrap(), b"\x200");
        assert_eq!(unescape(r"\18").unwrap(), b"\x018");
    }

    #[test]
    fn test_unknown_and_trailing() {
        assert_eq!(unescape(r"\q\'").unwrap(), b"q'");
        assert_eq!(unescape("abc\\").unwrap(), b"abc\\");
    }
}
