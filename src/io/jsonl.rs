//! Line-delimited JSON decoding.
//!
//! - Empty and whitespace-only lines are skipped.
//! - A UTF-8 byte order mark on the first line is ignored.
//! - A line that is not valid UTF-8, or not a JSON object, is a decode error,
//!   handled per policy.
//! - Positions reported to the [`DecodeContext`] are 1-based line numbers.

use super::DecodeContext;
use crate::error::{IngestError, Result};
use crate::record::{Record, into_record};
#[cfg(feature = "parallel-io")]
use rayon::prelude::*;
use std::io::BufRead;

const BOM: &[u8] = b"\xef\xbb\xbf";

/// Stream records from `reader` into `sink`, one line at a time.
///
/// Lines are framed as bytes, so a line that is not valid UTF-8 is a decode
/// error at that line rather than a read failure.
///
/// # Errors
/// Returns read failures and decode failures the policy escalates.
pub fn decode<R: BufRead>(
    mut reader: R,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    let mut buf = Vec::new();
    let mut line_no: u64 = 0;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| IngestError::io(ctx.source_name(), e))?;
        if n == 0 {
            return Ok(());
        }
        line_no += 1;
        let bytes = if line_no == 1 {
            buf.strip_prefix(BOM).unwrap_or(&buf)
        } else {
            &buf[..]
        };
        match parse_bytes(bytes) {
            None => {}
            Some(Ok(record)) => {
                if !sink(record) {
                    return Ok(());
                }
            }
            Some(Err(msg)) => ctx.reject(line_no, msg)?,
        }
    }
}

/// Decode a whole in-memory JSONL document, parsing lines in parallel.
///
/// Order is preserved; bad lines go through `ctx` in line order so policy
/// outcomes match the streaming decoder exactly.
///
/// # Errors
/// Returns the first decode failure the policy escalates.
pub fn decode_bytes(bytes: &[u8], ctx: &mut DecodeContext) -> Result<Vec<Record>> {
    let bytes = bytes.strip_prefix(BOM).unwrap_or(bytes);
    let lines: Vec<&[u8]> = bytes.split(|b| *b == b'\n').collect();

    #[cfg(feature = "parallel-io")]
    let parsed: Vec<Option<std::result::Result<Record, String>>> =
        lines.par_iter().map(|l| parse_bytes(l)).collect();
    #[cfg(not(feature = "parallel-io"))]
    let parsed: Vec<Option<std::result::Result<Record, String>>> =
        lines.iter().map(|l| parse_bytes(l)).collect();

    let mut out = Vec::with_capacity(parsed.len());
    for (i, item) in parsed.into_iter().enumerate() {
        match item {
            None => {}
            Some(Ok(record)) => out.push(record),
            Some(Err(msg)) => ctx.reject(i as u64 + 1, msg)?,
        }
    }
    Ok(out)
}

/// [`decode_bytes`] for text already known to be UTF-8.
///
/// # Errors
/// As for [`decode_bytes`].
pub fn decode_str(text: &str, ctx: &mut DecodeContext) -> Result<Vec<Record>> {
    decode_bytes(text.as_bytes(), ctx)
}

fn parse_bytes(line: &[u8]) -> Option<std::result::Result<Record, String>> {
    match std::str::from_utf8(line) {
        Ok(text) => parse_line(text),
        Err(e) => Some(Err(format!("invalid UTF-8: {e}"))),
    }
}

/// `None` for blank lines.
fn parse_line(line: &str) -> Option<std::result::Result<Record, String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<serde_json::Value>(trimmed)
            .map_err(|e| format!("invalid JSON: {e}"))
            .and_then(into_record),
    )
}

/// True if the first non-blank line of `text` is a JSON object. Later lines
/// are left to the decode policy.
pub(crate) fn is_jsonl(text: &str) -> bool {
    text.trim_start_matches('\u{feff}')
        .lines()
        .find_map(parse_line)
        .is_some_and(|first| first.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecodePolicy;
    use std::io::Cursor;

    #[test]
    fn streaming_and_parallel_agree() {
        let text = "{\"a\":1}\n\n{\"a\":2}\nnot json\n{\"a\":3}\n";
        let mut ctx = DecodeContext::new("mem", DecodePolicy::Skip { max_errors: 5 });
        let mut streamed = Vec::new();
        decode(Cursor::new(text), &mut ctx, &mut |r| {
            streamed.push(r);
            true
        })
        .unwrap();
        let mut ctx2 = DecodeContext::new("mem", DecodePolicy::Skip { max_errors: 5 });
        let whole = decode_str(text, &mut ctx2).unwrap();
        assert_eq!(streamed, whole);
        assert_eq!(streamed.len(), 3);
        assert_eq!(ctx.skipped(), 1);
        assert_eq!(ctx2.skipped(), 1);
    }

    #[test]
    fn strict_reports_line_number() {
        let mut ctx = DecodeContext::new("mem", DecodePolicy::Strict);
        let err = decode(Cursor::new("{}\n[1]\n"), &mut ctx, &mut |_| true).unwrap_err();
        assert!(matches!(err, IngestError::Decode { position: 2, .. }));
    }

    #[test]
    fn sink_refusal_stops_reading() {
        let mut ctx = DecodeContext::new("mem", DecodePolicy::Strict);
        let mut n = 0;
        decode(Cursor::new("{}\n{}\n{}\n"), &mut ctx, &mut |_| {
            n += 1;
            false
        })
        .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn crlf_and_bom_are_tolerated() {
        let bytes = b"\xef\xbb\xbf{\"a\":1}\r\n{\"a\":2}\r\n";
        let mut ctx = DecodeContext::new("mem", DecodePolicy::Strict);
        assert_eq!(decode_bytes(bytes, &mut ctx).unwrap().len(), 2);
        let mut n = 0;
        decode(Cursor::new(&bytes[..]), &mut ctx, &mut |_| {
            n += 1;
            true
        })
        .unwrap();
        assert_eq!(n, 2);
    }
}
