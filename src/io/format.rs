//! Format and compression detection.
//!
//! Detection is extension-first, falling back to content sniffing only when the
//! name says nothing. A declared format or compression always wins over both.

use super::compression::DynRead;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Record encodings the decoders understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// One JSON object per line.
    Jsonl,
    /// A whole JSON document: an array of objects or a single object.
    Json,
    Csv,
    Parquet,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jsonl => "jsonl",
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        })
    }
}

/// Byte-level wrapping around the encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Every codec, in detection order.
    pub const ALL: [Self; 2] = [Self::Gzip, Self::Zstd];

    #[must_use]
    pub fn codec_name(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
        }
    }

    /// Lowercase file suffixes, leading dot included.
    #[must_use]
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Gzip => &[".gz", ".gzip"],
            Self::Zstd => &[".zst", ".zstd"],
        }
    }

    #[must_use]
    pub fn magic_bytes(self) -> &'static [u8] {
        match self {
            Self::None => &[],
            Self::Gzip => &[0x1f, 0x8b],
            Self::Zstd => &[0x28, 0xb5, 0x2f, 0xfd],
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codec_name().unwrap_or("plain"))
    }
}

/// A resolved `(format, compression)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Detected {
    pub format: Format,
    pub compression: Compression,
    /// CSV delimiter implied by the name (`.tsv`).
    pub delimiter: u8,
}

impl fmt::Display for Detected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compression {
            Compression::None => write!(f, "{}", self.format),
            c => write!(f, "{}+{}", self.format, c),
        }
    }
}

/// Split a trailing compression suffix off `name`.
#[must_use]
pub fn split_compression(name: &str) -> (&str, Compression) {
    let lower = name.to_ascii_lowercase();
    for compression in Compression::ALL {
        if let Some(suffix) = compression.extensions().iter().find(|s| lower.ends_with(*s)) {
            return (&name[..name.len() - suffix.len()], compression);
        }
    }
    (name, Compression::None)
}

/// Detect format and compression from a file name or object key.
///
/// Returns `None` for the format when the extension is not recognized.
#[must_use]
pub fn detect_name(name: &str) -> (Option<Format>, Compression, u8) {
    let (stem, compression) = split_compression(name);
    let lower = stem.to_ascii_lowercase();
    let (format, delimiter) = if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
        (Some(Format::Jsonl), b',')
    } else if lower.ends_with(".json") {
        (Some(Format::Json), b',')
    } else if lower.ends_with(".tsv") {
        (Some(Format::Csv), b'\t')
    } else if lower.ends_with(".csv") {
        (Some(Format::Csv), b',')
    } else if lower.ends_with(".parquet") {
        (Some(Format::Parquet), b',')
    } else {
        (None, b',')
    };
    (format, compression, delimiter)
}

/// Guess compression from leading magic bytes.
#[must_use]
pub fn sniff_compression(head: &[u8]) -> Compression {
    Compression::ALL
        .into_iter()
        .find(|c| head.starts_with(c.magic_bytes()))
        .unwrap_or_default()
}

/// Guess the encoding of (already decompressed) leading bytes.
#[must_use]
pub fn sniff_format(head: &[u8]) -> Format {
    if head.starts_with(b"PAR1") {
        return Format::Parquet;
    }
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    match trimmed.as_bytes().first() {
        Some(b'[') => Format::Json,
        Some(b'{') => {
            if looks_line_delimited(trimmed) {
                Format::Jsonl
            } else {
                Format::Json
            }
        }
        _ => Format::Csv,
    }
}

/// True when the first line is a complete JSON object and more content follows.
///
/// Files named `.json` are frequently line-delimited exports; this tells the two
/// apart without reading the whole file.
#[must_use]
pub fn looks_line_delimited(text: &str) -> bool {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(first) = lines.next() else {
        return false;
    };
    let first_is_object = serde_json::from_str::<serde_json::Value>(first)
        .map(|v| v.is_object())
        .unwrap_or(false);
    first_is_object && lines.next().is_some()
}

/// Bytes read from the head of a file for sniffing.
pub const SNIFF_LEN: usize = 64 * 1024;

/// Detect a local file's format and compression.
///
/// # Errors
/// Returns an error if the file has to be sniffed and cannot be read.
pub fn detect_file(
    path: &Path,
    declared_format: Option<Format>,
    declared_compression: Option<Compression>,
) -> anyhow::Result<Detected> {
    use anyhow::Context;
    detect_source(
        &path.to_string_lossy(),
        declared_format,
        declared_compression,
        |compression| {
            let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            read_head(Box::new(f), compression)
                .with_context(|| format!("read head of {}", path.display()))
        },
    )
}

/// Detect the format and compression of any named byte source.
///
/// `declared_format` and `declared_compression` win. Otherwise the name is
/// used, and `head` (the first bytes, decompressed with the given codec) fills
/// in whatever the name left open. A `.json` name is re-checked for
/// line-delimited content.
///
/// # Errors
/// Returns whatever `head` returns when the content has to be sniffed.
pub fn detect_source(
    name: &str,
    declared_format: Option<Format>,
    declared_compression: Option<Compression>,
    head: impl Fn(Compression) -> anyhow::Result<Vec<u8>>,
) -> anyhow::Result<Detected> {
    let (name_format, name_compression, delimiter) = detect_name(name);
    let mut compression = declared_compression.unwrap_or(name_compression);

    if let Some(format) = declared_format {
        return Ok(Detected {
            format,
            compression,
            delimiter,
        });
    }
    if let Some(format @ (Format::Jsonl | Format::Csv | Format::Parquet)) = name_format {
        return Ok(Detected {
            format,
            compression,
            delimiter,
        });
    }

    // Json by name, or unknown: look at the content.
    let mut bytes = head(compression)?;
    if declared_compression.is_none() && compression == Compression::None {
        let sniffed = sniff_compression(&bytes);
        if sniffed != Compression::None {
            compression = sniffed;
            bytes = head(compression)?;
        }
    }
    Ok(Detected {
        format: refine(name_format, &bytes),
        compression,
        delimiter,
    })
}

fn refine(by_name: Option<Format>, head: &[u8]) -> Format {
    match by_name {
        Some(Format::Json) => {
            let text = String::from_utf8_lossy(head);
            if looks_line_delimited(text.trim_start_matches('\u{feff}').trim_start()) {
                Format::Jsonl
            } else {
                Format::Json
            }
        }
        Some(other) => other,
        None => sniff_format(head),
    }
}

/// Read up to [`SNIFF_LEN`] decompressed bytes from the start of `reader`.
///
/// # Errors
/// Fails if the codec cannot be set up on the stream.
pub fn read_head(reader: DynRead, compression: Compression) -> anyhow::Result<Vec<u8>> {
    let rdr = super::compression::wrap_reader(reader, compression)?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    // A truncated compressed stream still gives a usable head.
    let _ = rdr.take(SNIFF_LEN as u64).read_to_end(&mut head);
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_formats() {
        assert_eq!(detect_name("a/b.jsonl").0, Some(Format::Jsonl));
        assert_eq!(detect_name("a/b.NDJSON").0, Some(Format::Jsonl));
        assert_eq!(detect_name("b.json.gz"), (Some(Format::Json), Compression::Gzip, b','));
        assert_eq!(detect_name("b.tsv"), (Some(Format::Csv), Compression::None, b'\t'));
        assert_eq!(detect_name("x.parquet.zst").1, Compression::Zstd);
        assert_eq!(detect_name("README").0, None);
    }

    #[test]
    fn sniffing() {
        assert_eq!(sniff_format(b"PAR1...."), Format::Parquet);
        assert_eq!(sniff_format(b"  [{\"a\":1}]"), Format::Json);
        assert_eq!(sniff_format(b"{\"a\":1}\n{\"a\":2}\n"), Format::Jsonl);
        assert_eq!(sniff_format(b"{\n \"a\": 1\n}"), Format::Json);
        assert_eq!(sniff_format(b"id,name\n1,x\n"), Format::Csv);
        assert_eq!(sniff_compression(&[0x1f, 0x8b, 8]), Compression::Gzip);
        assert_eq!(sniff_compression(&[0x28, 0xb5, 0x2f, 0xfd, 0]), Compression::Zstd);
        assert_eq!(sniff_compression(b"{}"), Compression::None);
    }
}
