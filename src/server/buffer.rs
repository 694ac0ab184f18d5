//! Output buffer for PTY data.
//!
//! Keeps two views of the child's output:
//!
//! - the *raw* view, every byte read from the PTY, with a cursor marking
//!   what has already been forwarded to a client;
//! - the *expect* view, the same bytes with NULs removed, which patterns
//!   are matched against and which shrinks as matches consume it.
//!
//! Both are addressed by [`StreamOffset`], the position in the
//! conceptually unbounded stream of PTY output. Old data is evicted from
//! the front so memory stays bounded.

// Buffer indices are bounded by RAW_CAPACITY
#![allow(clippy::cast_possible_truncation)]

/// Raw buffer size; PTY reads stop while it is full.
pub const RAW_CAPACITY: usize = 16 * 1024;

/// Already-forwarded raw bytes, and expect bytes, retained for lookback and matching.
pub const RETAIN_BYTES: usize = 8 * 1024;

/// Position in the PTY output stream, counted from the first byte ever read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamOffset(u64);

impl StreamOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    const fn advance(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }

    /// Bytes from `earlier` to `self`.
    #[must_use]
    const fn since(self, earlier: Self) -> usize {
        (self.0 - earlier.0) as usize
    }
}

/// Raw and expect views of PTY output.
#[derive(Debug)]
pub struct OutputBuffer {
    /// Bytes `[base, total)` of the stream.
    raw: Vec<u8>,
    base: StreamOffset,
    sent: StreamOffset,
    /// Raw bytes before this offset have been copied into `expect`.
    folded: StreamOffset,
    expect: Vec<u8>,
    capacity: usize,
    retain: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limits(RAW_CAPACITY, RETAIN_BYTES)
    }

    #[must_use]
    pub const fn with_limits(capacity: usize, retain: usize) -> Self {
        Self {
            raw: Vec::new(),
            base: StreamOffset::ZERO,
            sent: StreamOffset::ZERO,
            folded: StreamOffset::ZERO,
            expect: Vec::new(),
            capacity,
            retain,
        }
    }

    /// Offset one past the last byte read.
    #[must_use]
    pub const fn total(&self) -> StreamOffset {
        self.base.advance(self.raw.len())
    }

    /// Offset of the oldest retained raw byte.
    #[must_use]
    pub const fn low_watermark(&self) -> StreamOffset {
        self.base
    }

    #[must_use]
    pub const fn sent(&self) -> StreamOffset {
        self.sent
    }

    /// Free space in the raw buffer.
    #[must_use]
    pub const fn spare(&self) -> usize {
        self.capacity.saturating_sub(self.raw.len())
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.raw.extend_from_slice(bytes);
    }

    /// Raw bytes not yet forwarded.
    #[must_use]
    pub fn unsent(&self) -> &[u8] {
        self.slice_from(self.sent)
    }

    /// Raw bytes from `start` to the end. `start` is clamped to the retained range.
    #[must_use]
    pub fn slice_from(&self, start: StreamOffset) -> &[u8] {
        let start = start.clamp(self.base, self.total());
        &self.raw[start.since(self.base)..]
    }

    /// Mark everything read so far as forwarded.
    pub const fn mark_sent(&mut self) {
        self.sent = self.total();
    }

    /// Copy raw bytes not yet folded into the expect view, dropping NULs.
    pub fn fold_expect(&mut self) {
        if self.folded < self.base {
            // evicted before it was ever folded; restart at what is left
            self.expect.clear();
            self.folded = self.base;
        }
        let start = self.folded.since(self.base);
        self.expect
            .extend(self.raw[start..].iter().copied().filter(|&b| b != 0));
        self.folded = self.total();
    }

    #[must_use]
    pub fn expect_view(&self) -> &[u8] {
        &self.expect
    }

    /// Drop the first `n` bytes of the expect view.
    pub fn consume_expect(&mut self, n: usize) {
        let n = n.min(self.expect.len());
        self.expect.drain(..n);
    }

    /// Forget the expect view and everything read so far.
    pub fn discard_expect(&mut self) {
        self.expect.clear();
        self.folded = self.total();
    }

    /// Where forwarding should start to show the last `lines` lines.
    ///
    /// When the last byte is a newline it does not count as the start of an
    /// empty line. With too few newlines retained, output starts at the first
    /// retained byte if nothing was ever evicted, otherwise just after the
    /// first retained newline so a partial line is never shown. The result
    /// is never later than the start of the line holding the sent cursor.
    #[must_use]
    pub fn lookback_start(&self, lines: usize) -> StreamOffset {
        if lines == 0 {
            return self.sent;
        }
        let raw = &self.raw;
        let sent = self.sent.since(self.base);
        let from_start = self.base == StreamOffset::ZERO;

        let mut want = lines;
        if raw.last() == Some(&b'\n') {
            want += 1;
        }

        let mut newlines = 0;
        let mut found = None;
        for (i, &b) in raw.iter().enumerate().rev() {
            if b == b'\n' {
                newlines += 1;
                if newlines >= want {
                    found = Some(i);
                    break;
                }
            }
        }

        let index = match found {
            _ if newlines == 0 => 0,
            None if from_start => 0,
            None => match raw.iter().position(|&b| b == b'\n') {
                Some(first) if first < sent => first + 1,
                _ => sent,
            },
            Some(nl) if nl < sent => nl + 1,
            Some(_) => match raw[..sent].iter().rposition(|&b| b == b'\n') {
                Some(nl) => nl + 1,
                None if from_start => 0,
                None => sent,
            },
        };
        self.base.advance(index)
    }

    /// Apply the retention limits to forwarded raw data and the expect view.
    pub fn evict_old(&mut self) {
        let old = self.sent.since(self.base);
        if old > self.retain {
            let drop = old - self.retain;
            self.raw.drain(..drop);
            self.base = self.base.advance(drop);
        }
        if self.expect.len() > self.retain {
            let drop = self.expect.len() - self.retain;
            self.expect.drain(..drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(data: &[u8]) -> OutputBuffer {
        let mut buf = OutputBuffer::new();
        buf.append(data);
        buf
    }

    #[test]
    fn test_append_and_unsent() {
        let mut buf = buffer_with(b"hello");
        assert_eq!(buf.unsent(), b"hello");
        assert_eq!(buf.total().get(), 5);
        buf.mark_sent();
        assert!(buf.unsent().is_empty());
        buf.append(b" world");
        assert_eq!(buf.unsent(), b" world");
    }

    #[test]
    fn test_spare() {
        let mut buf = OutputBuffer::with_limits(10, 4);
        buf.append(b"123456");
        assert_eq!(buf.spare(), 4);
        buf.append(b"7890");
        assert_eq!(buf.spare(), 0);
    }

    #[test]
    fn test_fold_strips_nul() {
        let mut buf = buffer_with(b"a\0b\0\0c");
        buf.fold_expect();
        assert_eq!(buf.expect_view(), b"abc");
        // folding twice does not duplicate
        buf.fold_expect();
        assert_eq!(buf.expect_view(), b"abc");
        buf.append(b"\0d");
        buf.fold_expect();
        assert_eq!(buf.expect_view(), b"abcd");
    }

    #[test]
    fn test_consume_and_discard() {
        let mut buf = buffer_with(b"abcdef");
        buf.fold_expect();
        buf.consume_expect(4);
        assert_eq!(buf.expect_view(), b"ef");
        buf.consume_expect(10);
        assert!(buf.expect_view().is_empty());

        buf.append(b"xyz");
        buf.discard_expect();
        buf.fold_expect();
        assert!(buf.expect_view().is_empty());
    }

    #[test]
    fn test_evict_keeps_unsent() {
        let mut buf = OutputBuffer::with_limits(64, 4);
        buf.append(b"0123456789");
        buf.mark_sent();
        buf.append(b"abc");
        buf.evict_old();
        assert_eq!(buf.low_watermark().get(), 6);
        assert_eq!(buf.slice_from(StreamOffset::ZERO), b"6789abc");
        assert_eq!(buf.unsent(), b"abc");
        assert!(buf.sent() >= buf.low_watermark());
    }

    #[test]
    fn test_evict_expect_view() {
        let mut buf = OutputBuffer::with_limits(64, 4);
        buf.append(b"0123456789");
        buf.fold_expect();
        buf.evict_old();
        assert_eq!(buf.expect_view(), b"6789");
    }

    #[test]
    fn test_fold_after_eviction_restarts() {
        let mut buf = OutputBuffer::with_limits(64, 2);
        buf.append(b"old-data");
        buf.mark_sent();
        buf.evict_old();
        assert_eq!(buf.low_watermark().get(), 6);
        buf.fold_expect();
        assert_eq!(buf.expect_view(), b"ta");
    }

    #[test]
    fn test_lookback_zero_is_sent_cursor() {
        let mut buf = buffer_with(b"a\nb\n");
        buf.mark_sent();
        assert_eq!(buf.lookback_start(0), buf.sent());
    }

    #[test]
    fn test_lookback_trailing_newline() {
        // like `tail -n 1`: the trailing newline does not start a line
        let mut buf = buffer_with(b"foo\nbar\n");
        buf.mark_sent();
        assert_eq!(buf.slice_from(buf.lookback_start(1)), b"bar\n");

        let mut buf = buffer_with(b"foo\nbar");
        buf.mark_sent();
        assert_eq!(buf.slice_from(buf.lookback_start(1)), b"bar");
    }

    #[test]
    fn test_lookback_no_newlines() {
        let mut buf = buffer_with(b"$ ");
        buf.mark_sent();
        assert_eq!(buf.lookback_start(3), StreamOffset::ZERO);
    }

    #[test]
    fn test_lookback_too_few_lines_from_start() {
        let mut buf = buffer_with(b"one\ntwo\n$ ");
        buf.mark_sent();
        assert_eq!(buf.lookback_start(10), StreamOffset::ZERO);
    }

    #[test]
    fn test_lookback_too_few_lines_after_eviction() {
        let mut buf = OutputBuffer::with_limits(64, 9);
        buf.append(b"xxxx-partial\nline\n$ ");
        buf.mark_sent();
        buf.evict_old();
        assert!(buf.low_watermark() > StreamOffset::ZERO);
        // the partial first line is skipped
        assert_eq!(buf.slice_from(buf.lookback_start(10)), b"line\n$ ");
    }

    #[test]
    fn test_lookback_includes_unsent() {
        let mut buf = buffer_with(b"a\nb\nc");
        buf.mark_sent();
        buf.append(b"d\ne\n");
        // two lines back lands before the sent cursor
        assert_eq!(buf.slice_from(buf.lookback_start(2)), b"cd\ne\n");
    }

    #[test]
    fn test_lookback_never_after_sent_line_start() {
        let mut buf = buffer_with(b"a\nb");
        buf.mark_sent();
        buf.append(b"c\nd\ne\n");
        // one line back is in unsent data; start from the line holding the cursor
        assert_eq!(buf.slice_from(buf.lookback_start(1)), b"bc\nd\ne\n");
    }
}
