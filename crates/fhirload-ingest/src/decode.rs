//! Streaming decoding of sources into records.
//!
//! A [`RecordStream`] owns the open file and its decompressor and yields
//! one `Result<Record, DecodeError>` per unit, whatever the shape. Nothing
//! beyond the current unit is held in memory.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, Read};
use std::path::{Path, PathBuf};

use fhirload_storage::Record;
use serde_json::Value;

use crate::error::{DecodeError, DecodeErrorKind, FormatError};
use crate::format::{self, Format, Input, JsonScanner, ScanError, Shape};

/// Where a source came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Named on the command line.
    Local,
    /// Materialized from a Bulk Data manifest entry.
    Downloaded { resource_type: String, url: String },
}

/// A local file to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub path: PathBuf,
    pub origin: SourceOrigin,
}

impl Source {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: SourceOrigin::Local,
        }
    }

    pub fn downloaded(
        path: impl Into<PathBuf>,
        resource_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            origin: SourceOrigin::Downloaded {
                resource_type: resource_type.into(),
                url: url.into(),
            },
        }
    }

    /// Opens the file and detects its format.
    ///
    /// # Errors
    ///
    /// See [`RecordStream::open`].
    pub fn open(&self) -> Result<RecordStream, FormatError> {
        RecordStream::open(&self.path)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

enum Body {
    Single {
        scanner: JsonScanner<Input>,
        done: bool,
    },
    Lines {
        input: Input,
        line: u64,
        offset: u64,
        buf: Vec<u8>,
        done: bool,
    },
    Envelope {
        scanner: JsonScanner<Input>,
        state: EnvelopeState,
        ordinal: u64,
        buf: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnvelopeState {
    Start,
    /// Between keys of the Bundle object.
    Keys { first: bool },
    /// Inside the `entry` array.
    Entries { first: bool },
    Done,
}

/// Lazy, forward-only sequence of records from one source.
///
/// After a structural error in a Bundle or a read error the stream ends;
/// per-unit errors (invalid JSON on one line, an entry without a
/// `resourceType`) are yielded and decoding continues with the next unit.
pub struct RecordStream {
    format: Format,
    body: Body,
    skipped_entries: u64,
}

impl RecordStream {
    /// Opens `path`, detects its format and positions the stream at the
    /// first unit.
    ///
    /// # Errors
    ///
    /// Returns `FormatError::Io` if the file cannot be read and
    /// `FormatError::Unrecognized` if its content matches no shape.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    /// Detects the format of an arbitrary byte stream.
    ///
    /// # Errors
    ///
    /// See [`RecordStream::open`].
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Result<Self, FormatError> {
        let (format, input) = format::detect(reader)?;
        let body = match format.shape {
            Shape::Single => Body::Single {
                scanner: JsonScanner::new(input),
                done: false,
            },
            Shape::LineDelimited => Body::Lines {
                input,
                line: 0,
                offset: 0,
                buf: Vec::new(),
                done: false,
            },
            Shape::Envelope => Body::Envelope {
                scanner: JsonScanner::new(input),
                state: EnvelopeState::Start,
                ordinal: 0,
                buf: Vec::new(),
            },
        };

        Ok(Self {
            format,
            body,
            skipped_entries: 0,
        })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Bundle entries without a `resource`, skipped so far.
    pub fn skipped_entries(&self) -> u64 {
        self.skipped_entries
    }

    /// Ordinal of the unit most recently read: line number, entry number,
    /// or `1` for a single document.
    pub fn unit(&self) -> u64 {
        match &self.body {
            Body::Single { done, .. } => u64::from(*done),
            Body::Lines { line, .. } => *line,
            Body::Envelope { ordinal, .. } => *ordinal,
        }
    }
}

impl fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStream")
            .field("format", &self.format)
            .field("skipped_entries", &self.skipped_entries)
            .finish_non_exhaustive()
    }
}

fn to_record(unit: u64, offset: u64, bytes: &[u8]) -> Result<Record, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::new(unit, offset, e))?;
    Record::from_value(value).map_err(|e| DecodeError::new(unit, offset, e))
}

fn scan_error(unit: u64, offset: u64, err: ScanError) -> DecodeError {
    let kind = match err {
        ScanError::Io(err) => DecodeErrorKind::Io(err),
        ScanError::Eof => DecodeErrorKind::UnexpectedEof,
        err @ ScanError::Unexpected { .. } => DecodeErrorKind::Syntax {
            message: err.describe(),
        },
    };
    DecodeError::new(unit, offset, kind)
}

fn next_single(scanner: &mut JsonScanner<Input>) -> Result<Record, DecodeError> {
    scanner.skip_bom().map_err(|e| DecodeError::new(1, 0, e))?;
    scanner.skip_ws().map_err(|e| DecodeError::new(1, 0, e))?;
    let start = scanner.offset();

    let mut buf = Vec::new();
    scanner
        .capture_value(&mut buf)
        .map_err(|e| scan_error(1, start, e))?;

    match scanner.skip_ws() {
        Ok(None) => to_record(1, start, &buf),
        Ok(Some(_)) => Err(DecodeError::new(1, start, DecodeErrorKind::TrailingData)),
        Err(e) => Err(DecodeError::new(1, start, e)),
    }
}

fn next_line(
    input: &mut Input,
    line: &mut u64,
    offset: &mut u64,
    buf: &mut Vec<u8>,
) -> Option<Result<Record, DecodeError>> {
    loop {
        buf.clear();
        let start = *offset;
        let read = match input.read_until(b'\n', buf) {
            Ok(0) => return None,
            Ok(n) => n,
            Err(e) => return Some(Err(DecodeError::new(*line + 1, start, e))),
        };
        *line += 1;
        *offset += read as u64;

        let mut text = buf.trim_ascii();
        if *line == 1 {
            text = text.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(text);
        }
        if text.is_empty() {
            continue;
        }
        return Some(to_record(*line, start, text));
    }
}

impl Body {
    fn next_envelope(
        scanner: &mut JsonScanner<Input>,
        state: &mut EnvelopeState,
        ordinal: &mut u64,
        buf: &mut Vec<u8>,
        skipped: &mut u64,
    ) -> Option<Result<Record, DecodeError>> {
        loop {
            let step = match *state {
                EnvelopeState::Done => return None,
                EnvelopeState::Start => scanner
                    .skip_bom()
                    .map_err(ScanError::from)
                    .and_then(|()| scanner.expect(b'{', "'{'"))
                    .map(|()| {
                        *state = EnvelopeState::Keys { first: true };
                        None
                    }),
                EnvelopeState::Keys { first } => Self::bundle_key(scanner, state, first),
                EnvelopeState::Entries { first } => {
                    Self::entry(scanner, state, first, ordinal, buf, skipped)
                }
            };

            match step {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(err) => {
                    *state = EnvelopeState::Done;
                    return Some(Err(scan_error(*ordinal + 1, scanner.offset(), err)));
                }
            }
        }
    }

    /// Advances over one key of the Bundle object, entering `entry` arrays.
    fn bundle_key(
        scanner: &mut JsonScanner<Input>,
        state: &mut EnvelopeState,
        first: bool,
    ) -> Result<Option<Result<Record, DecodeError>>, ScanError> {
        if scanner.eat(b'}')? {
            *state = EnvelopeState::Done;
            return match scanner.skip_ws()? {
                None => Ok(None),
                Some(_) => Ok(Some(Err(DecodeError::new(
                    0,
                    scanner.offset(),
                    DecodeErrorKind::TrailingData,
                )))),
            };
        }
        if !first {
            scanner.expect(b',', "',' or '}'")?;
        }
        let key = scanner.read_string()?;
        scanner.expect(b':', "':'")?;

        if key == "entry" && scanner.skip_ws()? == Some(b'[') {
            scanner.expect(b'[', "'['")?;
            *state = EnvelopeState::Entries { first: true };
        } else {
            scanner.skip_value()?;
            *state = EnvelopeState::Keys { first: false };
        }
        Ok(None)
    }

    /// Reads one element of the `entry` array.
    fn entry(
        scanner: &mut JsonScanner<Input>,
        state: &mut EnvelopeState,
        first: bool,
        ordinal: &mut u64,
        buf: &mut Vec<u8>,
        skipped: &mut u64,
    ) -> Result<Option<Result<Record, DecodeError>>, ScanError> {
        if scanner.eat(b']')? {
            *state = EnvelopeState::Keys { first: false };
            return Ok(None);
        }
        if !first {
            scanner.expect(b',', "',' or ']'")?;
        }
        *state = EnvelopeState::Entries { first: false };

        scanner.skip_ws()?;
        let start = scanner.offset();
        buf.clear();
        scanner.capture_value(buf)?;
        *ordinal += 1;

        let mut entry: Value = match serde_json::from_slice(buf) {
            Ok(entry) => entry,
            Err(e) => return Ok(Some(Err(DecodeError::new(*ordinal, start, e)))),
        };

        match entry.get_mut("resource").map(Value::take) {
            None | Some(Value::Null) => {
                *skipped += 1;
                Ok(None)
            }
            Some(resource) => Ok(Some(
                Record::from_value(resource).map_err(|e| DecodeError::new(*ordinal, start, e)),
            )),
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.body {
            Body::Single { scanner, done } => {
                if *done {
                    return None;
                }
                *done = true;
                Some(next_single(scanner))
            }
            Body::Lines {
                input,
                line,
                offset,
                buf,
                done,
            } => {
                if *done {
                    return None;
                }
                let item = next_line(input, line, offset, buf);
                match &item {
                    None => *done = true,
                    Some(Err(err)) if matches!(err.kind, DecodeErrorKind::Io(_)) => *done = true,
                    Some(_) => {}
                }
                item
            }
            Body::Envelope {
                scanner,
                state,
                ordinal,
                buf,
            } => Body::next_envelope(scanner, state, ordinal, buf, &mut self.skipped_entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(text: &str) -> RecordStream {
        RecordStream::from_reader(Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    fn ids(stream: RecordStream) -> Vec<String> {
        stream
            .map(|item| item.unwrap().id().unwrap_or("-").to_string())
            .collect()
    }

    #[test]
    fn test_single_document() {
        let stream = decode("{\n  \"resourceType\": \"Patient\",\n  \"id\": \"p1\"\n}\n");
        assert_eq!(stream.format().shape, Shape::Single);
        assert_eq!(ids(stream), vec!["p1"]);
    }

    #[test]
    fn test_single_document_with_truncation_fails() {
        // A complete object followed by whitespace is sniffed as single,
        // so truncate inside to get a pretty-printed partial document.
        let mut stream = decode("{\n  \"resourceType\": \"Patient\",\n  \"id\": \"p1\"\n");
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::UnexpectedEof));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_ndjson_lines_and_blank_lines() {
        let text = "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n\n{\"resourceType\":\"Observation\",\"id\":\"b\"}\r\n{\"resourceType\":\"Patient\",\"id\":\"c\"}";
        let stream = decode(text);
        assert_eq!(stream.format().shape, Shape::LineDelimited);
        assert_eq!(ids(stream), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ndjson_bad_line_reports_unit_and_continues() {
        let text = "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n{\"resourceType\":\n{\"id\":\"x\"}\n{\"resourceType\":\"Patient\",\"id\":\"d\"}\n";
        let items: Vec<_> = decode(text).collect();
        assert_eq!(items.len(), 4);
        assert!(items[0].is_ok());

        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.unit, 2);
        assert_eq!(err.offset, 36);
        assert!(matches!(err.kind, DecodeErrorKind::Json(_)));

        let err = items[2].as_ref().unwrap_err();
        assert_eq!(err.unit, 3);
        assert!(matches!(err.kind, DecodeErrorKind::Record(_)));

        assert_eq!(items[3].as_ref().unwrap().id(), Some("d"));
    }

    #[test]
    fn test_bundle_entries() {
        let text = r#"{
          "resourceType": "Bundle",
          "type": "transaction",
          "meta": {"tag": [{"code": "x"}]},
          "entry": [
            {"fullUrl": "urn:uuid:1", "resource": {"resourceType": "Patient", "id": "p1"}},
            {"request": {"method": "DELETE", "url": "Patient/old"}},
            {"resource": {"resourceType": "Observation", "id": "o1"}, "request": {"method": "POST"}}
          ],
          "signature": null
        }"#;
        let mut stream = decode(text);
        assert_eq!(stream.format().shape, Shape::Envelope);

        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.reference(), "Patient/p1");
        let second = stream.next().unwrap().unwrap();
        assert_eq!(second.reference(), "Observation/o1");
        assert!(stream.next().is_none());
        assert_eq!(stream.skipped_entries(), 1);
    }

    #[test]
    fn test_bundle_entry_error_keeps_ordinal() {
        let text = r#"{"resourceType":"Bundle","entry":[{"resource":{"resourceType":"Patient","id":"a"}},{"resource":{"id":"b"}},{"resource":{"resourceType":"Patient","id":"c"}}]}"#;
        let items: Vec<_> = decode(text).collect();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_ref().unwrap_err().unit, 2);
        assert_eq!(items[2].as_ref().unwrap().id(), Some("c"));
    }

    #[test]
    fn test_bundle_structural_error_ends_stream() {
        let text = r#"{"resourceType":"Bundle","entry":[{"resource":{"resourceType":"Patient","id":"a"}} {"resource":{}}]}"#;
        let mut stream = decode(text);
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::Syntax { .. }));
        assert!(err.is_fatal());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_fatal_errors_are_the_ones_that_end_the_stream() {
        let items: Vec<_> = decode("{\"resourceType\":\"Patient\",\"id\":\"a\"}\n{broken\n").collect();
        assert!(!items[1].as_ref().unwrap_err().is_fatal());

        let mut stream = decode(r#"{"resourceType":"Bundle","entry":[{"resource":{"resourceType":"Patient","id":"a"}},{"resource":{"resourceType":"Pat"#);
        assert!(stream.next().unwrap().is_ok());
        let err = stream.next().unwrap().unwrap_err();
        assert!(matches!(err.kind, DecodeErrorKind::UnexpectedEof));
        assert!(err.is_fatal());
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_open_missing_file() {
        let err = RecordStream::open("/definitely/not/here.ndjson").unwrap_err();
        assert!(matches!(err, FormatError::Io(_)));
    }
}
