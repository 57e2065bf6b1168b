// SPDX-License-Identifier: Apache-2.0

//! Byte-oriented line framing.
//!
//! Splits a buffer on `\n`, dropping a `\r` that directly precedes the newline. The splitter
//! owns no state beyond its cursor: a caller that stops in the middle of a line simply hands
//! the unread bytes back on the next read.

const NEW_LINE: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Position of a single line inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSpan {
    /// Index of the first byte of the line
    pub offset: usize,
    /// Length of the line content, excluding `\n` and a preceding `\r`
    pub length: usize,
    /// False for a trailing segment with no newline yet
    pub terminated: bool,
    /// Bytes consumed by this span, delimiter included
    pub consumed: usize,
}

impl LineSpan {
    /// Index one past the delimiter, i.e. where the next line begins.
    pub fn end(&self) -> usize {
        self.offset + self.consumed
    }
}

/// Lazy iterator over the lines of a buffer.
///
/// Yields at most `max_lines` terminated spans. A trailing unterminated span is only produced
/// when the line budget was not exhausted first.
pub struct LineSplitter<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> LineSplitter<'a> {
    pub fn new(buf: &'a [u8], max_lines: usize) -> Self {
        Self {
            buf,
            pos: 0,
            remaining: max_lines,
        }
    }

    /// Bytes of the buffer not yet covered by a yielded span.
    pub fn unread(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

impl Iterator for LineSplitter<'_> {
    type Item = LineSpan;

    fn next(&mut self) -> Option<LineSpan> {
        if self.remaining == 0 || self.pos >= self.buf.len() {
            return None;
        }

        let start = self.pos;
        let rest = &self.buf[start..];
        match rest.iter().position(|&b| b == NEW_LINE) {
            Some(idx) => {
                let mut length = idx;
                if length > 0 && rest[length - 1] == CARRIAGE_RETURN {
                    length -= 1;
                }
                self.pos = start + idx + 1;
                self.remaining -= 1;
                Some(LineSpan {
                    offset: start,
                    length,
                    terminated: true,
                    consumed: idx + 1,
                })
            }
            None => {
                self.pos = self.buf.len();
                Some(LineSpan {
                    offset: start,
                    length: rest.len(),
                    terminated: false,
                    consumed: rest.len(),
                })
            }
        }
    }
}
