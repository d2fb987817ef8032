//! Byte-level text input for the scanner.
//!
//! [`BinaryDetectingReader`] decorates any byte source and fails the read
//! as soon as a buffer contains a control byte that never appears in text.
//! [`WordReader`] sits on top of it and yields whitespace-delimited words
//! while tracking the byte offset, so a scan can stop after a bounded
//! amount of work and resume from the same place later.

use std::{
    collections::VecDeque,
    fmt,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    ops::Range,
};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Sentinel carried inside an [`io::Error`] when binary content is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryContentDetected;

impl fmt::Display for BinaryContentDetected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("binary content detected")
    }
}

impl std::error::Error for BinaryContentDetected {}

/// Whether an I/O error was raised by [`BinaryDetectingReader`].
pub fn is_binary_content(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<BinaryContentDetected>())
}

/// Control bytes outside the printable and whitespace ranges. Bell through
/// carriage return and escape are allowed.
pub fn is_disallowed_control(byte: u8) -> bool {
    byte < 0x07 || (0x0E..0x1B).contains(&byte) || (0x1C..0x20).contains(&byte)
}

/// Read decorator that rejects binary data.
///
/// # Examples
///
/// ```
/// use std::io::Read;
/// use localdocs::text_reader::{BinaryDetectingReader, is_binary_content};
///
/// let mut text = BinaryDetectingReader::new(&b"plain text\n"[..]);
/// let mut out = String::new();
/// text.read_to_string(&mut out).unwrap();
/// assert_eq!(out, "plain text\n");
///
/// let mut binary = BinaryDetectingReader::new(&b"ELF\x00\x01"[..]);
/// let err = binary.read_to_end(&mut Vec::new()).unwrap_err();
/// assert!(is_binary_content(&err));
/// ```
pub struct BinaryDetectingReader<R> {
    inner: R,
}

impl<R> BinaryDetectingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for BinaryDetectingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if buf[..n].iter().copied().any(is_disallowed_control) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                BinaryContentDetected,
            ));
        }
        Ok(n)
    }
}

/// Whitespace-delimited word stream over a seekable byte source.
///
/// Words are separated by any Unicode whitespace, including no-break and
/// ideographic spaces.
pub struct WordReader<R> {
    inner: BufReader<BinaryDetectingReader<R>>,
    /// Bytes consumed from `inner`.
    offset: u64,
    /// End of the last word handed out.
    position: u64,
    /// Words split from the current token, with their end offsets.
    pending: VecDeque<(String, u64)>,
}

impl<R: Read + Seek> WordReader<R> {
    /// Open a word stream starting at byte `start`.
    ///
    /// The byte-order mark is always sniffed from the beginning of the
    /// source, so resuming at a non-zero offset still skips it correctly.
    pub fn open(mut source: R, start: u64) -> io::Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; 3];
        let mut filled = 0;
        while filled < head.len() {
            let n = source.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let bom_len = if filled == 3 && head == UTF8_BOM { 3 } else { 0 };

        let position = start.max(bom_len);
        source.seek(SeekFrom::Start(position))?;

        Ok(Self {
            inner: BufReader::new(BinaryDetectingReader::new(source)),
            offset: position,
            position,
            pending: VecDeque::new(),
        })
    }

    /// Byte offset just past the last consumed word.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the stream has nothing left but whitespace.
    pub fn at_end(&mut self) -> io::Result<bool> {
        if !self.pending.is_empty() {
            return Ok(false);
        }
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Ok(true);
            }
            let skip = buf.iter().take_while(|&&b| is_token_break(b)).count();
            if skip < buf.len() {
                self.inner.consume(skip);
                self.offset += skip as u64;
                self.position = self.offset;
                return Ok(false);
            }
            let len = buf.len();
            self.inner.consume(len);
            self.offset += len as u64;
            self.position = self.offset;
        }
    }

    /// The next word, or `None` at end of stream. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn next_word(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some((word, end)) = self.pending.pop_front() {
                self.position = end;
                return Ok(Some(word));
            }
            let Some((start, token)) = self.next_token()? else {
                return Ok(None);
            };
            for range in split_words(&token) {
                let end = start + range.end as u64;
                let word = String::from_utf8_lossy(&token[range]).into_owned();
                self.pending.push_back((word, end));
            }
        }
    }

    /// The next run of bytes between ASCII whitespace, with its offset.
    fn next_token(&mut self) -> io::Result<Option<(u64, Vec<u8>)>> {
        let mut token = Vec::new();
        let mut start = self.offset;
        loop {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                break;
            }

            let mut consumed = 0;
            let mut complete = false;
            for &byte in buf {
                if is_token_break(byte) {
                    if !token.is_empty() {
                        complete = true;
                        break;
                    }
                } else {
                    if token.is_empty() {
                        start = self.offset + consumed as u64;
                    }
                    token.push(byte);
                }
                consumed += 1;
            }

            self.inner.consume(consumed);
            self.offset += consumed as u64;
            if complete {
                break;
            }
        }

        Ok((!token.is_empty()).then_some((start, token)))
    }
}

fn is_token_break(byte: u8) -> bool {
    byte.is_ascii_whitespace() || byte == 0x0B
}

/// Length of the UTF-8 encoded whitespace character at the start of
/// `bytes`.
fn space_len(bytes: &[u8]) -> Option<usize> {
    match bytes {
        [b, ..] if is_token_break(*b) => Some(1),
        [0xC2, 0x85 | 0xA0, ..] => Some(2),
        [0xE1, 0x9A, 0x80, ..]
        | [0xE2, 0x80, 0x80..=0x8A | 0xA8 | 0xA9 | 0xAF, ..]
        | [0xE2, 0x81, 0x9F, ..]
        | [0xE3, 0x80, 0x80, ..] => Some(3),
        _ => None,
    }
}

/// Byte ranges of the words in `token`, split on non-ASCII whitespace.
fn split_words(token: &[u8]) -> Vec<Range<usize>> {
    let mut words = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < token.len() {
        match space_len(&token[i..]) {
            Some(len) => {
                if start < i {
                    words.push(start..i);
                }
                i += len;
                start = i;
            }
            None => i += 1,
        }
    }
    if start < token.len() {
        words.push(start..token.len());
    }
    words
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn words(data: &[u8], start: u64) -> Vec<String> {
        let mut reader = WordReader::open(Cursor::new(data.to_vec()), start)
            .unwrap();
        let mut out = Vec::new();
        while let Some(w) = reader.next_word().unwrap() {
            out.push(w);
        }
        out
    }

    #[test]
    fn control_byte_ranges() {
        for byte in [0x00, 0x01, 0x06, 0x0E, 0x1A, 0x1C, 0x1F] {
            assert!(is_disallowed_control(byte), "{byte:#04x}");
        }
        for byte in [0x07, 0x09, 0x0A, 0x0D, 0x1B, 0x20, b'a', 0xC3] {
            assert!(!is_disallowed_control(byte), "{byte:#04x}");
        }
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            words(b"  hello\tworld\n\nagain  ", 0),
            vec!["hello", "world", "again"]
        );
        assert!(words(b"", 0).is_empty());
        assert!(words(b" \n\t", 0).is_empty());
    }

    #[test]
    fn tracks_position_for_resume() {
        let data = b"alpha beta gamma";
        let mut reader =
            WordReader::open(Cursor::new(data.to_vec()), 0).unwrap();
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("alpha"));
        let resume_at = reader.position();
        assert_eq!(resume_at, 5);

        assert_eq!(words(data, resume_at), vec!["beta", "gamma"]);
    }

    #[test]
    fn bom_is_skipped_at_start_and_on_resume() {
        let mut data = UTF8_BOM.to_vec();
        data.extend_from_slice(b"one two");

        assert_eq!(words(&data, 0), vec!["one", "two"]);
        assert_eq!(words(&data, 1), vec!["one", "two"]);
        assert_eq!(words(&data, 6), vec!["two"]);
    }

    #[test]
    fn binary_content_fails_with_sentinel() {
        let mut reader =
            WordReader::open(Cursor::new(b"text\x00more".to_vec()), 0).unwrap();
        let err = reader.next_word().unwrap_err();
        assert!(is_binary_content(&err));

        let other = io::Error::new(io::ErrorKind::InvalidData, "other");
        assert!(!is_binary_content(&other));
    }

    #[test]
    fn at_end_skips_trailing_whitespace() {
        let mut reader =
            WordReader::open(Cursor::new(b"word   \n".to_vec()), 0).unwrap();
        assert!(!reader.at_end().unwrap());
        reader.next_word().unwrap();
        assert!(reader.at_end().unwrap());
    }

    #[test]
    fn splits_on_unicode_whitespace() {
        let text = "one\u{a0}two\u{3000}three\u{2009}four\u{a0}\u{a0} five";
        assert_eq!(
            words(text.as_bytes(), 0),
            vec!["one", "two", "three", "four", "five"]
        );
        assert!(words("\u{a0}\u{3000}".as_bytes(), 0).is_empty());
        assert_eq!(
            words("na\u{ef}ve caf\u{e9}".as_bytes(), 0),
            vec!["na\u{ef}ve", "caf\u{e9}"]
        );
    }

    #[test]
    fn resumes_between_words_of_one_token() {
        let data = "alpha\u{a0}beta gamma".as_bytes();
        let mut reader =
            WordReader::open(Cursor::new(data.to_vec()), 0).unwrap();
        assert_eq!(reader.next_word().unwrap().as_deref(), Some("alpha"));
        assert_eq!(reader.position(), 5);
        assert!(!reader.at_end().unwrap());

        assert_eq!(words(data, reader.position()), vec!["beta", "gamma"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(words(b"caf\xE9 ok", 0), vec!["caf\u{FFFD}", "ok"]);
    }
}
