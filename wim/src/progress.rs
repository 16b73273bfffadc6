//! Progress reporting.
//!
//! Long operations report progress through a callback registered on the
//! [`Wim`][crate::Wim] handle. The callback is invoked synchronously; a
//! slow callback slows the operation. Returning [`ProgressAction::Abort`]
//! cancels the operation at the next safe point, which surfaces as an
//! `AbortedByProgress` error.

use std::path::Path;

/// What the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressAction {
    #[default]
    Continue,
    Abort,
}

/// One progress message.
#[derive(Debug)]
#[non_exhaustive]
pub enum Progress<'a> {
    ScanBegin {
        source: &'a str,
    },
    ScanDentry {
        path: &'a str,
    },
    ScanEnd {
        entries: u64,
    },
    /// Blob data being written; byte counts are uncompressed and
    /// monotonically nondecreasing per write.
    WriteStreams {
        total_bytes: u64,
        completed_bytes: u64,
        total_streams: u64,
        completed_streams: u64,
    },
    VerifyIntegrity {
        total_chunks: u64,
        completed_chunks: u64,
    },
    CalcIntegrity {
        total_chunks: u64,
        completed_chunks: u64,
    },
    ExtractImageBegin {
        image: u32,
        target: &'a Path,
    },
    ExtractStreams {
        total_bytes: u64,
        completed_bytes: u64,
    },
    ExtractDentry {
        path: &'a str,
    },
    ExtractTimestamps,
    ExtractImageEnd {
        image: u32,
    },
    Rename {
        from: &'a Path,
        to: &'a Path,
    },
    SplitBeginPart {
        part_number: u16,
        total_parts: u16,
    },
    SplitEndPart {
        part_number: u16,
        total_parts: u16,
        bytes: u64,
    },
    UpdateBeginCommand {
        command: &'a str,
    },
    UpdateEndCommand {
        command: &'a str,
    },
}

/// The registered callback type.
pub type ProgressFn = dyn FnMut(&Progress<'_>) -> ProgressAction + Send;
