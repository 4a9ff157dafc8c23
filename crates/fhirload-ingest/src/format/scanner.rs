//! Byte-level structural scanner for JSON text.
//!
//! The scanner never materializes values it is asked to skip; it only tracks
//! nesting and string state. Values it captures are returned as raw bytes
//! for `serde_json` to parse.

use std::io::{self, BufRead};

#[derive(Debug)]
pub(crate) enum ScanError {
    Io(io::Error),
    Eof,
    Unexpected { found: u8, expected: &'static str },
}

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl ScanError {
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Io(err) => err.to_string(),
            Self::Eof => "unexpected end of input".to_string(),
            Self::Unexpected { found, expected } => {
                format!("expected {expected}, found {:?}", char::from(*found))
            }
        }
    }
}

pub(crate) type ScanResult<T> = Result<T, ScanError>;

const BOM: &[u8] = b"\xEF\xBB\xBF";

pub(crate) struct JsonScanner<R> {
    reader: R,
    offset: u64,
    newlines: u64,
}

impl<R: BufRead> JsonScanner<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            newlines: 0,
        }
    }

    /// Bytes consumed so far.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Line breaks consumed so far.
    pub(crate) fn newlines(&self) -> u64 {
        self.newlines
    }

    pub(crate) fn peek(&mut self) -> io::Result<Option<u8>> {
        Ok(self.reader.fill_buf()?.first().copied())
    }

    fn bump(&mut self) -> io::Result<Option<u8>> {
        let byte = self.peek()?;
        if let Some(b) = byte {
            self.reader.consume(1);
            self.offset += 1;
            if b == b'\n' {
                self.newlines += 1;
            }
        }
        Ok(byte)
    }

    fn next_byte(&mut self) -> ScanResult<u8> {
        self.bump()?.ok_or(ScanError::Eof)
    }

    /// Consumes a leading UTF-8 byte order mark, if any.
    pub(crate) fn skip_bom(&mut self) -> io::Result<()> {
        let buf = self.reader.fill_buf()?;
        if buf.starts_with(BOM) {
            self.reader.consume(BOM.len());
            self.offset += BOM.len() as u64;
        }
        Ok(())
    }

    /// Skips whitespace and returns the next byte without consuming it.
    pub(crate) fn skip_ws(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.peek()? {
                Some(b' ' | b'\t' | b'\n' | b'\r') => {
                    self.bump()?;
                }
                other => return Ok(other),
            }
        }
    }

    /// Skips whitespace, then consumes `expected`.
    pub(crate) fn expect(&mut self, expected: u8, what: &'static str) -> ScanResult<()> {
        match self.skip_ws()? {
            None => Err(ScanError::Eof),
            Some(b) if b == expected => {
                self.bump()?;
                Ok(())
            }
            Some(found) => Err(ScanError::Unexpected {
                found,
                expected: what,
            }),
        }
    }

    /// Consumes `expected` if it is the next non-whitespace byte.
    pub(crate) fn eat(&mut self, expected: u8) -> io::Result<bool> {
        if self.skip_ws()? == Some(expected) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads a string token and returns its decoded value.
    pub(crate) fn read_string(&mut self) -> ScanResult<String> {
        self.skip_ws()?;
        let mut raw = Vec::new();
        self.string_into(Some(&mut raw))?;
        serde_json::from_slice(&raw).map_err(|_| ScanError::Unexpected {
            found: b'"',
            expected: "a valid string",
        })
    }

    /// Skips one value of any type.
    pub(crate) fn skip_value(&mut self) -> ScanResult<()> {
        self.value_into(None)
    }

    /// Copies the raw bytes of one value into `out`.
    pub(crate) fn capture_value(&mut self, out: &mut Vec<u8>) -> ScanResult<()> {
        self.value_into(Some(out))
    }

    fn string_into(&mut self, mut out: Option<&mut Vec<u8>>) -> ScanResult<()> {
        let open = self.next_byte()?;
        if open != b'"' {
            return Err(ScanError::Unexpected {
                found: open,
                expected: "a string",
            });
        }
        push(&mut out, open);

        let mut escaped = false;
        loop {
            let b = self.next_byte()?;
            push(&mut out, b);
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => return Ok(()),
                _ => {}
            }
        }
    }

    fn value_into(&mut self, mut out: Option<&mut Vec<u8>>) -> ScanResult<()> {
        let first = self.skip_ws()?.ok_or(ScanError::Eof)?;
        match first {
            b'"' => self.string_into(out),
            b'{' | b'[' => {
                let mut closers = Vec::new();
                loop {
                    match self.peek()?.ok_or(ScanError::Eof)? {
                        b'"' => self.string_into(out.as_deref_mut())?,
                        b => {
                            self.bump()?;
                            push(&mut out, b);
                            match b {
                                b'{' => closers.push(b'}'),
                                b'[' => closers.push(b']'),
                                b'}' | b']' => {
                                    if closers.pop() != Some(b) {
                                        return Err(ScanError::Unexpected {
                                            found: b,
                                            expected: "a matching bracket",
                                        });
                                    }
                                    if closers.is_empty() {
                                        return Ok(());
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
            b'}' | b']' | b',' | b':' => Err(ScanError::Unexpected {
                found: first,
                expected: "a value",
            }),
            _ => {
                // Scalars end at the next delimiter or at end of input.
                while let Some(b) = self.peek()? {
                    if matches!(b, b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                        break;
                    }
                    self.bump()?;
                    push(&mut out, b);
                }
                Ok(())
            }
        }
    }
}

fn push(out: &mut Option<&mut Vec<u8>>, byte: u8) {
    if let Some(out) = out {
        out.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scanner(text: &str) -> JsonScanner<Cursor<&[u8]>> {
        JsonScanner::new(Cursor::new(text.as_bytes()))
    }

    #[test]
    fn test_capture_nested_value() {
        let mut s = scanner(r#"  {"a": [1, {"b": "}]\""}], "c": null} tail"#);
        let mut out = Vec::new();
        s.capture_value(&mut out).unwrap();
        assert_eq!(out, br#"{"a": [1, {"b": "}]\""}], "c": null}"#);
        assert_eq!(s.skip_ws().unwrap(), Some(b't'));
    }

    #[test]
    fn test_read_string_decodes_escapes() {
        let mut s = scanner(r#""Bundle""#);
        assert_eq!(s.read_string().unwrap(), "Bundle");
    }

    #[test]
    fn test_mismatched_brackets() {
        let mut s = scanner("[1, 2}");
        assert!(matches!(
            s.skip_value(),
            Err(ScanError::Unexpected { found: b'}', .. })
        ));
    }

    #[test]
    fn test_eof_inside_value() {
        let mut s = scanner(r#"{"a": "unterminated"#);
        assert!(matches!(s.skip_value(), Err(ScanError::Eof)));
    }

    #[test]
    fn test_offsets_and_newlines() {
        let mut s = scanner("\u{feff}\n {}");
        s.skip_bom().unwrap();
        assert_eq!(s.offset(), 3);
        s.skip_value().unwrap();
        assert_eq!(s.offset(), 7);
        assert_eq!(s.newlines(), 1);
    }
}
