//! Compression back-ends.
//!
//! The block processor treats compression as a pure function:
//! `compress(in) -> bytes`. Whether the result is actually used (versus the
//! original, uncompressed bytes) is decided by the worker (see
//! [`crate::worker`]), which is also where `DONT_COMPRESS` and
//! all-zero/sparse blocks short-circuit this module entirely.

use std::io::{Cursor, Read};

#[cfg(feature = "gzip")]
use flate2::{read::ZlibEncoder, Compression};
use tracing::instrument;
#[cfg(feature = "xz")]
use xz2::{read::XzEncoder, stream::LzmaOptions};

use crate::error::SqfsBuildError;

/// Compression algorithm identifier. Mirrors the on-disk `compression_id`
/// field of the SquashFS-family superblock, though writing that field is
/// the external superblock writer's responsibility, not the core's.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[rustfmt::skip]
pub enum Compressor {
    None      = 0,
    Gzip      = 1,
    Lzma      = 2,
    Lzo       = 3,
    #[default]
    Xz        = 4,
    Lz4       = 5,
    Zstd      = 6,
}

/// Per-compressor tuning knobs. `None` in [`CompressionOptions`] means
/// "use the compressor's default".
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CompressionOptions {
    Gzip(Gzip),
    Lzo(Lzo),
    Xz(Xz),
    Lz4(Lz4),
    Zstd(Zstd),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Gzip {
    pub compression_level: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Lzo {
    pub compression_level: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Xz {
    pub dictionary_size: u32,
    pub preset: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Lz4 {
    pub high_compression: bool,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Zstd {
    pub compression_level: i32,
}

/// Stateless-per-call compressor instance. One is owned by each worker
/// thread (see [`crate::worker::Worker`]); cheap to construct, so the
/// pool just clones one per thread rather than sharing it.
#[derive(Debug, Clone, Copy)]
pub struct BlockCompressor {
    pub id: Compressor,
    pub options: Option<CompressionOptions>,
}

impl BlockCompressor {
    pub fn new(id: Compressor, options: Option<CompressionOptions>) -> Self {
        Self { id, options }
    }

    /// Compress `input`, writing into `scratch` and returning the number
    /// of bytes written. `scratch` is reused across calls by the worker
    /// that owns it; this function only ever grows it, never shrinks its
    /// capacity.
    #[instrument(skip_all)]
    pub fn compress(&self, input: &[u8], scratch: &mut Vec<u8>) -> Result<usize, SqfsBuildError> {
        scratch.clear();
        match (self.id, self.options) {
            #[cfg(feature = "gzip")]
            (Compressor::Gzip, option) => {
                let level = match option {
                    Some(CompressionOptions::Gzip(g)) => g.compression_level,
                    _ => 9,
                };
                let mut encoder = ZlibEncoder::new(Cursor::new(input), Compression::new(level));
                encoder
                    .read_to_end(scratch)
                    .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?;
                Ok(scratch.len())
            }
            #[cfg(feature = "xz")]
            (Compressor::Xz, option) => {
                let (dict_size, preset) = match option {
                    Some(CompressionOptions::Xz(x)) => (x.dictionary_size, x.preset),
                    _ => (input.len().max(4096) as u32, 6),
                };
                let mut opts = LzmaOptions::new_preset(preset)
                    .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?;
                opts.dict_size(dict_size);
                let mut encoder = XzEncoder::new_stream(
                    Cursor::new(input),
                    xz2::stream::Stream::new_lzma_encoder(&opts)
                        .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?,
                );
                encoder
                    .read_to_end(scratch)
                    .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?;
                Ok(scratch.len())
            }
            #[cfg(feature = "lzo")]
            (Compressor::Lzo, _) => {
                let mut lzo = rust_lzo::LZOContext::new();
                let mut buf = vec![0u8; rust_lzo::worst_compress(input.len())];
                let error = lzo.compress(input, &mut buf);
                if error != rust_lzo::LZOError::OK {
                    return Err(SqfsBuildError::Compressor(format!("{error:?}")));
                }
                scratch.extend_from_slice(&buf);
                Ok(scratch.len())
            }
            #[cfg(feature = "zstd")]
            (Compressor::Zstd, option) => {
                let level = match option {
                    Some(CompressionOptions::Zstd(z)) => z.compression_level,
                    _ => 3,
                };
                let mut encoder = zstd::bulk::Compressor::new(level)
                    .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?;
                let compressed = encoder
                    .compress(input)
                    .map_err(|e| SqfsBuildError::Compressor(e.to_string()))?;
                scratch.extend_from_slice(&compressed);
                Ok(scratch.len())
            }
            #[cfg(feature = "lz4")]
            (Compressor::Lz4, _) => {
                let compressed = lz4_flex::block::compress(input);
                scratch.extend_from_slice(&compressed);
                Ok(scratch.len())
            }
            (Compressor::None, _) => {
                scratch.extend_from_slice(input);
                Ok(scratch.len())
            }
            (other, _) => Err(SqfsBuildError::UnsupportedCompressor(other)),
        }
    }
}
