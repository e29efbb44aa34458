//! Compression codecs for input decoding and request bodies.
//!
//! - **Gzip** (`.gz`, `.gzip`) via `flate2`, always available; the dispatcher
//!   also uses it for `Content-Encoding: gzip` bodies.
//! - **Zstd** (`.zst`, `.zstd`) via `zstd` (feature: `compression-zstd`).
//!
//! Which codec applies is decided in [`format`](super::format) from the
//! suffixes and magic bytes listed on [`Compression`]; this module only wraps
//! streams. Readers and writers are `Send` so decoders can run on the blocking
//! pool.

use crate::io::format::{Compression, split_compression};
use anyhow::Result;
#[cfg(feature = "compression-zstd")]
use anyhow::Context;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub type DynRead = Box<dyn Read + Send>;
pub type DynWrite = Box<dyn Write + Send>;

/// Wrap `reader` with the decoder for an already-decided `compression`.
///
/// # Errors
/// Fails if the codec is not compiled in or refuses the stream header.
pub fn wrap_reader(reader: DynRead, compression: Compression) -> Result<DynRead> {
    match compression {
        Compression::None => Ok(reader),
        // Multi-member streams are common in concatenated exports.
        Compression::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
        #[cfg(feature = "compression-zstd")]
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .context("wrap reader with zstd codec")?;
            Ok(Box::new(decoder))
        }
        #[cfg(not(feature = "compression-zstd"))]
        Compression::Zstd => anyhow::bail!("zstd support is not compiled into this build"),
    }
}

/// Wrap `writer` with the encoder for `compression`.
///
/// # Errors
/// Fails if the codec is not compiled in or cannot initialize.
pub fn wrap_writer(writer: DynWrite, compression: Compression) -> Result<DynWrite> {
    match compression {
        Compression::None => Ok(Box::new(BufWriter::new(writer))),
        Compression::Gzip => Ok(Box::new(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::default(),
        ))),
        #[cfg(feature = "compression-zstd")]
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(writer, 3)
                .context("wrap writer with zstd codec")?;
            Ok(Box::new(encoder.auto_finish()))
        }
        #[cfg(not(feature = "compression-zstd"))]
        Compression::Zstd => anyhow::bail!("zstd support is not compiled into this build"),
    }
}

/// Wrap `writer` with the encoder its file name asks for (`events.jsonl.gz`).
///
/// # Errors
/// As for [`wrap_writer`].
pub fn writer_for_path(writer: DynWrite, path: impl AsRef<Path>) -> Result<DynWrite> {
    let name = path.as_ref().to_string_lossy();
    wrap_writer(writer, split_compression(&name).1)
}

/// Gzip a request body.
///
/// # Errors
/// Only fails on allocation-level I/O errors from the encoder.
pub fn gzip_bytes(data: &[u8], level: u32) -> std::io::Result<Vec<u8>> {
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;
    let mut enc = GzEncoder::new(
        Vec::with_capacity(data.len() / 4),
        Level::new(level.min(9)),
    );
    enc.write_all(data)?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn gzip_body_decodes() {
        let body = br#"[{"event":"a"}]"#;
        let gz = gzip_bytes(body, 6).unwrap();
        let mut out = String::new();
        wrap_reader(Box::new(Cursor::new(gz)), Compression::Gzip)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out.as_bytes(), body);
    }

    #[test]
    fn plain_passes_through() {
        let mut out = String::new();
        wrap_reader(Box::new(Cursor::new(b"hello".to_vec())), Compression::None)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "hello");
    }
}
