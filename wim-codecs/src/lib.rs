//! Compression codecs for the WIM archive format.
//!
//! This crate implements the three block compression formats that appear in
//! WIM resources: XPRESS, LZX and LZMS. Each codec transforms one whole
//! chunk (up to the format's maximum block size) at a time; chunking,
//! resource framing and checksums are the concern of the `wim` crate.
//!
//! The decoders deliberately treat a truncated bitstream as an endless run
//! of zero bits instead of failing. Well-formed input is never affected, and
//! corrupt input is caught by the SHA-1 verification one layer up; the only
//! hard decode errors are structural ones (invalid prefix codes, matches
//! reaching outside the window, output overruns).
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

#[cfg(feature = "log")]
#[macro_use(trace)]
extern crate log;

#[cfg(not(feature = "log"))]
#[macro_use]
mod macros {
    macro_rules! trace {
        ($($tt:tt)*) => {
            let _ = if false {
                let _ = ::std::format_args!($($tt)*);
            };
        };
    }
}

pub mod bits;
pub mod huffman;
pub mod lzms;
pub mod lzx;
pub mod xpress;

use std::fmt;

/// An error raised by a decompressor on structurally invalid input.
///
/// The compressed data did not describe a valid block: a prefix code was
/// over-subscribed, a match referenced data before the window start, or the
/// decoded items did not fill the output exactly.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CorruptError;

impl fmt::Debug for CorruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("CorruptError")
    }
}

impl fmt::Display for CorruptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("compressed data is invalid")
    }
}

impl std::error::Error for CorruptError {}

pub type Result<T, E = CorruptError> = std::result::Result<T, E>;

/// The compression format of a WIM resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Xpress,
    Lzx,
    Lzms,
}

impl Format {
    /// Check whether `size` is a block (chunk) size the format supports.
    ///
    /// All formats require power-of-two block sizes. XPRESS offsets are
    /// 16-bit so blocks top out at 64KiB; LZX windows range from 32KiB to
    /// 2MiB; LZMS accepts anything from 32KiB up to 1GiB.
    #[must_use]
    pub fn is_valid_block_size(self, size: u32) -> bool {
        if !size.is_power_of_two() {
            return false;
        }
        let order = size.trailing_zeros();
        match self {
            Format::Xpress => (12..=16).contains(&order),
            Format::Lzx => (15..=21).contains(&order),
            Format::Lzms => (15..=30).contains(&order),
        }
    }

    /// The default chunk size the `wim` crate uses for this format.
    #[must_use]
    pub fn default_block_size(self) -> u32 {
        match self {
            Format::Xpress => 1 << 15,
            Format::Lzx => 1 << 15,
            Format::Lzms => 1 << 17,
        }
    }
}

/// A compressor for one format, reusable across blocks.
///
/// Compressors keep their match-finder allocations between calls, so one
/// instance should be used for a whole resource (or one per worker thread).
#[derive(Debug)]
pub enum Compressor {
    Xpress(xpress::XpressCompressor),
    Lzx(lzx::LzxCompressor),
    Lzms(lzms::LzmsCompressor),
}

impl Compressor {
    /// Create a compressor able to compress blocks of up to `max_block_size`
    /// bytes. Returns `None` if the size is not valid for the format.
    pub fn new(format: Format, max_block_size: u32) -> Option<Self> {
        if !format.is_valid_block_size(max_block_size) {
            return None;
        }
        Some(match format {
            Format::Xpress => Compressor::Xpress(xpress::XpressCompressor::new(max_block_size)),
            Format::Lzx => Compressor::Lzx(lzx::LzxCompressor::new(max_block_size)),
            Format::Lzms => Compressor::Lzms(lzms::LzmsCompressor::new(max_block_size)?),
        })
    }

    /// The format this compressor produces.
    #[must_use]
    pub fn format(&self) -> Format {
        match self {
            Compressor::Xpress(_) => Format::Xpress,
            Compressor::Lzx(_) => Format::Lzx,
            Compressor::Lzms(_) => Format::Lzms,
        }
    }

    /// Compress one block. Returns the compressed bytes, or `None` when the
    /// result would not be strictly smaller than the input, in which case
    /// the caller must store the block uncompressed.
    pub fn compress(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        match self {
            Compressor::Xpress(c) => c.compress(data),
            Compressor::Lzx(c) => c.compress(data),
            Compressor::Lzms(c) => c.compress(data),
        }
    }
}

/// A decompressor for one format, reusable across blocks.
#[derive(Debug)]
pub enum Decompressor {
    Xpress(xpress::XpressDecompressor),
    Lzx(lzx::LzxDecompressor),
    Lzms(lzms::LzmsDecompressor),
}

impl Decompressor {
    /// Create a decompressor for blocks of up to `max_block_size` bytes.
    /// Returns `None` if the size is not valid for the format.
    pub fn new(format: Format, max_block_size: u32) -> Option<Self> {
        if !format.is_valid_block_size(max_block_size) {
            return None;
        }
        Some(match format {
            Format::Xpress => {
                Decompressor::Xpress(xpress::XpressDecompressor::new(max_block_size))
            }
            Format::Lzx => Decompressor::Lzx(lzx::LzxDecompressor::new(max_block_size)?),
            Format::Lzms => Decompressor::Lzms(lzms::LzmsDecompressor::new(max_block_size)?),
        })
    }

    /// Decompress one block into `out`, which must be sized to the exact
    /// uncompressed length recorded by the container.
    pub fn decompress(&mut self, data: &[u8], out: &mut [u8]) -> Result<()> {
        match self {
            Decompressor::Xpress(d) => d.decompress(data, out),
            Decompressor::Lzx(d) => d.decompress(data, out),
            Decompressor::Lzms(d) => d.decompress(data, out),
        }
    }
}
