//! Input decoding: format detection, decompression and the per-format decoders.
//!
//! Every decoder has the same shape: it reads from a byte source, hands each
//! record to a sink closure in source order, and reports bad records to a
//! [`DecodeContext`] that applies the configured [`DecodePolicy`]. A sink
//! returning `false` means the consumer has gone away; decoders stop reading
//! and return `Ok(())`.

pub mod cloud;
pub mod compression;
pub mod csv;
pub mod format;
pub mod glob;
pub mod json;
pub mod jsonl;
pub mod parquet;

use crate::config::DecodePolicy;
use crate::error::{IngestError, Result};
use crate::record::Record;
use compression::DynRead;
use format::{Detected, Format};
use std::io::{BufReader, Read};
use tracing::warn;

/// Tracks decode failures for one input against the policy.
#[derive(Debug, Clone)]
pub struct DecodeContext {
    source_name: String,
    policy: DecodePolicy,
    skipped: u64,
}

impl DecodeContext {
    pub fn new(source_name: impl Into<String>, policy: DecodePolicy) -> Self {
        Self {
            source_name: source_name.into(),
            policy,
            skipped: 0,
        }
    }

    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Records skipped so far.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Report a bad record at `position` (1-based line/row/element).
    ///
    /// # Errors
    /// Returns [`IngestError::Decode`] when the policy says the input fails.
    pub fn reject(&mut self, position: u64, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        let fail = || IngestError::Decode {
            source_name: self.source_name.clone(),
            position,
            message: message.clone(),
        };
        match self.policy {
            DecodePolicy::Strict => Err(fail()),
            DecodePolicy::Skip { max_errors } => {
                self.skipped += 1;
                if self.skipped > max_errors {
                    return Err(fail());
                }
                warn!(source = %self.source_name, position, %message, "skipping undecodable record");
                Ok(())
            }
        }
    }
}

/// Decode any supported format from a reader that is already decompressed.
///
/// Parquet needs random access, so a Parquet stream is buffered whole first.
///
/// # Errors
/// Returns I/O failures and whatever the decode policy escalates.
pub fn decode_reader(
    reader: DynRead,
    detected: Detected,
    ctx: &mut DecodeContext,
    sink: &mut dyn FnMut(Record) -> bool,
) -> Result<()> {
    match detected.format {
        Format::Jsonl => jsonl::decode(BufReader::with_capacity(256 * 1024, reader), ctx, sink),
        Format::Json => json::decode(BufReader::with_capacity(256 * 1024, reader), ctx, sink),
        Format::Csv => csv::decode(reader, detected.delimiter, ctx, sink),
        Format::Parquet => {
            let mut buf = Vec::new();
            let mut reader = reader;
            reader
                .read_to_end(&mut buf)
                .map_err(|e| IngestError::io(ctx.source_name(), e))?;
            parquet::decode_bytes(bytes::Bytes::from(buf), ctx, sink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_policy_fails_first_error() {
        let mut ctx = DecodeContext::new("t", DecodePolicy::Strict);
        assert!(matches!(
            ctx.reject(3, "bad"),
            Err(IngestError::Decode { position: 3, .. })
        ));
    }

    #[test]
    fn skip_policy_counts_until_limit() {
        let mut ctx = DecodeContext::new("t", DecodePolicy::Skip { max_errors: 2 });
        ctx.reject(1, "a").unwrap();
        ctx.reject(2, "b").unwrap();
        assert!(ctx.reject(3, "c").is_err());
        assert_eq!(ctx.skipped(), 3);
    }
}
