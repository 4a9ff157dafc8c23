//! Compression and payload-shape detection.
//!
//! Detection looks at a bounded head of the stream: the first two raw bytes
//! for gzip, then up to [`SNIFF_WINDOW`] decompressed bytes for the shape.
//! The head is replayed in front of the remaining stream, so nothing is
//! lost and nothing beyond the window is buffered.

mod scanner;

use std::fmt;
use std::io::{BufRead, BufReader, Cursor, Read};

use flate2::bufread::MultiGzDecoder;
use serde::Serialize;

use crate::error::FormatError;

pub(crate) use scanner::{JsonScanner, ScanError};

/// Maximum number of decompressed bytes inspected to classify a stream.
pub const SNIFF_WINDOW: usize = 64 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Byte-level encoding of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
}

/// How resources are laid out in the (decompressed) stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// One resource per document.
    Single,
    /// One resource per line (NDJSON).
    LineDelimited,
    /// A Bundle whose `entry[].resource` values are the records.
    Envelope,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "json"),
            Self::LineDelimited => write!(f, "ndjson"),
            Self::Envelope => write!(f, "bundle"),
        }
    }
}

/// Detected compression and shape of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Format {
    pub compression: Compression,
    pub shape: Shape,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compression {
            Compression::None => write!(f, "{}", self.shape),
            Compression::Gzip => write!(f, "{}+gzip", self.shape),
        }
    }
}

/// A buffered, decompressed stream that starts at the first byte.
pub type Input = Box<dyn BufRead + Send>;

/// Returns `Gzip` if the raw head starts with the gzip magic bytes.
pub fn detect_compression(head: &[u8]) -> Compression {
    if head.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else {
        Compression::None
    }
}

#[derive(Debug, Default)]
struct Outline {
    complete: bool,
    is_bundle: bool,
    has_entry: bool,
    newline_inside: bool,
}

impl Outline {
    fn is_envelope(&self) -> bool {
        self.is_bundle && self.has_entry
    }
}

/// Walks the keys of the first top-level object, skipping their values.
fn walk_first_object<R: BufRead>(
    scanner: &mut JsonScanner<R>,
    outline: &mut Outline,
) -> Result<(), ScanError> {
    scanner.expect(b'{', "'{'")?;
    let mut first = true;
    loop {
        if scanner.eat(b'}')? {
            return Ok(());
        }
        if !first {
            scanner.expect(b',', "',' or '}'")?;
        }
        let key = scanner.read_string()?;
        scanner.expect(b':', "':'")?;
        if key == "resourceType" && scanner.skip_ws()? == Some(b'"') {
            outline.is_bundle = scanner.read_string()? == "Bundle";
        } else {
            if key == "entry" {
                outline.has_entry = true;
            }
            scanner.skip_value()?;
        }
        first = false;
    }
}

/// Classifies the decompressed head of a stream.
///
/// # Errors
///
/// Returns `FormatError::Unrecognized` for empty input, input that does not
/// start with a JSON object, and heads that match none of the shapes.
pub fn sniff_shape(head: &[u8]) -> Result<Shape, FormatError> {
    let mut scanner = JsonScanner::new(Cursor::new(head));
    scanner.skip_bom()?;

    match scanner.skip_ws()? {
        None => return Err(FormatError::unrecognized("empty input")),
        Some(b'{') => {}
        Some(other) => {
            return Err(FormatError::unrecognized(format!(
                "input starts with {:?}, expected a JSON object",
                char::from(other)
            )));
        }
    }

    let newlines_before = scanner.newlines();
    let mut outline = Outline::default();
    match walk_first_object(&mut scanner, &mut outline) {
        Ok(()) => outline.complete = true,
        Err(ScanError::Eof) => {}
        Err(ScanError::Io(err)) => return Err(err.into()),
        Err(err @ ScanError::Unexpected { .. }) => {
            return Err(FormatError::unrecognized(format!(
                "invalid JSON at byte {}: {}",
                scanner.offset(),
                err.describe()
            )));
        }
    }
    outline.newline_inside = scanner.newlines() > newlines_before;

    if !outline.complete {
        return Ok(if outline.is_envelope() {
            Shape::Envelope
        } else if outline.newline_inside {
            Shape::Single
        } else {
            Shape::LineDelimited
        });
    }

    let newlines_after = scanner.newlines();
    let next = scanner.skip_ws()?;
    let line_break = scanner.newlines() > newlines_after;

    match next {
        Some(b'{') if line_break => Ok(Shape::LineDelimited),
        _ if outline.is_envelope() => Ok(Shape::Envelope),
        None => Ok(Shape::Single),
        Some(_) => Err(FormatError::unrecognized(format!(
            "unexpected data after the first object at byte {}",
            scanner.offset()
        ))),
    }
}

/// Detects compression and shape, returning a decompressed stream that
/// replays the inspected head.
///
/// # Errors
///
/// Returns `FormatError::Io` if reading or decompressing the head fails,
/// and `FormatError::Unrecognized` if the shape cannot be determined.
pub fn detect<R: Read + Send + 'static>(reader: R) -> Result<(Format, Input), FormatError> {
    let mut raw = BufReader::new(reader);
    let compression = detect_compression(raw.fill_buf()?);

    let mut decoded: Box<dyn Read + Send> = match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(raw)),
        Compression::None => Box::new(raw),
    };

    let mut head = Vec::with_capacity(SNIFF_WINDOW);
    (&mut decoded)
        .take(SNIFF_WINDOW as u64)
        .read_to_end(&mut head)?;

    let shape = sniff_shape(&head)?;
    let input: Input = Box::new(BufReader::with_capacity(
        SNIFF_WINDOW,
        Cursor::new(head).chain(decoded),
    ));

    Ok((Format { compression, shape }, input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn shape(text: &str) -> Result<Shape, FormatError> {
        sniff_shape(text.as_bytes())
    }

    #[test]
    fn test_single_resource() {
        assert_eq!(
            shape("{\n  \"resourceType\": \"Patient\",\n  \"id\": \"p1\"\n}\n").unwrap(),
            Shape::Single
        );
        assert_eq!(
            shape(r#"{"resourceType":"Patient"}"#).unwrap(),
            Shape::Single
        );
    }

    #[test]
    fn test_ndjson() {
        let text = "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n{\"resourceType\":\"Patient\",\"id\":\"b\"}\n";
        assert_eq!(shape(text).unwrap(), Shape::LineDelimited);
    }

    #[test]
    fn test_ndjson_of_bundles_is_line_delimited() {
        let text = "{\"resourceType\":\"Bundle\",\"entry\":[]}\n{\"resourceType\":\"Bundle\",\"entry\":[]}\n";
        assert_eq!(shape(text).unwrap(), Shape::LineDelimited);
    }

    #[test]
    fn test_bundle() {
        let text = r#"{"resourceType": "Bundle", "type": "transaction", "entry": [{"resource": {"resourceType": "Patient"}}]}"#;
        assert_eq!(shape(text).unwrap(), Shape::Envelope);
    }

    #[test]
    fn test_bundle_without_entries_is_single() {
        let text = r#"{"resourceType": "Bundle", "type": "searchset", "total": 0}"#;
        assert_eq!(shape(text).unwrap(), Shape::Single);
    }

    #[test]
    fn test_truncated_heads() {
        // Pretty-printed document larger than the window.
        assert_eq!(
            shape("{\n  \"resourceType\": \"Patient\",\n  \"name\": [").unwrap(),
            Shape::Single
        );
        // One long line larger than the window.
        assert_eq!(
            shape(r#"{"resourceType":"Observation","valueString":"abc"#).unwrap(),
            Shape::LineDelimited
        );
        // Large bundle: entry seen before the window ends.
        assert_eq!(
            shape("{\n\"resourceType\":\"Bundle\",\n\"entry\":[{\"resource\":").unwrap(),
            Shape::Envelope
        );
    }

    #[test]
    fn test_unrecognized() {
        assert!(shape("").unwrap_err().is_unrecognized());
        assert!(shape("   \n").unwrap_err().is_unrecognized());
        assert!(shape("[1, 2]").unwrap_err().is_unrecognized());
        assert!(shape("name,gender\nx,y\n").unwrap_err().is_unrecognized());
        assert!(shape("{} {}").unwrap_err().is_unrecognized());
        assert!(shape("{\"a\" 1}").unwrap_err().is_unrecognized());
    }

    #[test]
    fn test_bom_is_skipped() {
        assert_eq!(
            shape("\u{feff}{\"resourceType\":\"Patient\"}").unwrap(),
            Shape::Single
        );
    }

    #[test]
    fn test_detect_gzip_replays_head() {
        let text = "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n{\"resourceType\":\"Patient\",\"id\":\"b\"}\n";
        let mut encoder = GzEncoder::new(Vec::new(), Level::default());
        encoder.write_all(text.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let (format, mut input) = detect(Cursor::new(compressed)).unwrap();
        assert_eq!(
            format,
            Format {
                compression: Compression::Gzip,
                shape: Shape::LineDelimited
            }
        );
        assert_eq!(format.to_string(), "ndjson+gzip");

        let mut replayed = String::new();
        input.read_to_string(&mut replayed).unwrap();
        assert_eq!(replayed, text);
    }

    #[test]
    fn test_detect_plain_beyond_window() {
        let filler = "x".repeat(SNIFF_WINDOW * 2);
        let text = format!("{{\"resourceType\":\"Basic\",\"id\":\"{filler}\"}}\n");

        let (format, mut input) = detect(Cursor::new(text.clone().into_bytes())).unwrap();
        assert_eq!(format.compression, Compression::None);
        assert_eq!(format.shape, Shape::LineDelimited);

        let mut replayed = String::new();
        input.read_to_string(&mut replayed).unwrap();
        assert_eq!(replayed.len(), text.len());
    }
}
