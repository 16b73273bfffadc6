//! A library for reading, modifying and writing WIM (Windows Imaging
//! Format) archives.
//!
//! A WIM stores one or more filesystem snapshots ("images") that share a
//! single deduplicated pool of file data: every distinct byte sequence is
//! kept at most once, keyed by its SHA-1. Images are cheap; data is shared.
//!
//! ## Examples
//!
//! ```no_run
//! use wim::{CompressionType, Images, MemTreeSource, OpenFlags, Wim, WriteFlags};
//!
//! # fn work() -> wim::Result<()> {
//! // Build a new LZX-compressed WIM with one image.
//! let mut w = Wim::create(CompressionType::Lzx)?;
//! let mut source = MemTreeSource::new();
//! source.add_file("readme.txt", b"hello\n".to_vec());
//! w.add_image(&mut source, "Base")?;
//! w.write("out.wim", Images::All, WriteFlags::default(), 1)?;
//!
//! // Reopen it and append another image in place.
//! let mut w = Wim::open("out.wim", OpenFlags::default().write_access())?;
//! let mut more = MemTreeSource::new();
//! more.add_file("notes.txt", b"hi\n".to_vec());
//! w.add_image(&mut more, "Plus")?;
//! w.overwrite(WriteFlags::default(), 1)?;
//! # Ok(()) }
//! ```
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

#[cfg(feature = "log")]
#[macro_use(trace, debug)]
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

    macro_rules! debug {
        ($($tt:tt)*) => {
            trace!($($tt)*)
        };
    }
}

mod error;

pub mod blob;
pub mod header;
pub mod integrity;
pub mod metadata;
pub mod progress;
pub mod resource;
pub mod scan;
pub mod xml;

mod compress;
mod export;
mod extract;
mod split;
mod wim;
mod write;

pub use blob::Sha1Hash;
pub use export::ExportFlags;
pub use split::join;
pub use error::{Error, ErrorKind, Result};
pub use header::CompressionType;
pub use metadata::{Dentry, Image, NamedStream, StreamRef};
pub use progress::{Progress, ProgressAction};
pub use scan::{DirTreeSource, MemTreeSource, StreamData, StreamSpec, TreeEntry, TreeSource};
pub use wim::{IterEntry, Wim};

use error::ErrorInner;

/// Selects which image(s) an operation applies to. Image indices are
/// 1-based, as in the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Images {
    All,
    One(u32),
}

impl From<u32> for Images {
    fn from(index: u32) -> Self {
        Images::One(index)
    }
}

macro_rules! flag_type {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$fmeta:meta])* $setter:ident => $const:ident = $bit:expr,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(u32);

        impl $name {
            $( pub const $const: $name = $name($bit); )*

            #[must_use]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            $(
                $(#[$fmeta])*
                #[must_use]
                pub fn $setter(self) -> Self {
                    Self(self.0 | $bit)
                }
            )*
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}
pub(crate) use flag_type;

flag_type! {
    /// Flags for [`Wim::open`].
    OpenFlags {
        /// Verify the integrity table while opening; fail with
        /// [`ErrorKind::Integrity`] on any mismatch.
        check_integrity => CHECK_INTEGRITY = 0x1,
        /// Allow opening one part of a spanned set.
        split_ok => SPLIT_OK = 0x2,
        /// Require the file to be writable, failing early otherwise.
        write_access => WRITE_ACCESS = 0x4,
    }
}

flag_type! {
    /// Flags for the write family ([`Wim::write`], [`Wim::overwrite`],
    /// [`Wim::write_to_fd`]).
    WriteFlags {
        /// Write (or update) an integrity table.
        check_integrity => CHECK_INTEGRITY = 0x00000001,
        /// Drop any existing integrity table.
        no_check_integrity => NO_CHECK_INTEGRITY = 0x00000002,
        /// Produce a pipable WIM.
        pipable => PIPABLE = 0x00000004,
        /// Convert a pipable WIM back to the normal layout.
        not_pipable => NOT_PIPABLE = 0x00000008,
        /// Recompress every blob even when raw copy would be possible.
        recompress => RECOMPRESS = 0x00000010,
        /// `fsync` the output before finishing (and before any rename).
        fsync => FSYNC = 0x00000020,
        /// Force a full rebuild instead of an in-place append.
        rebuild => REBUILD = 0x00000040,
        /// Keep unreferenced data when overwriting in place.
        soft_delete => SOFT_DELETE = 0x00000080,
        /// Write even if the WIM is marked read-only.
        ignore_readonly => IGNORE_READONLY = 0x00000100,
        /// Trust the existing blob reference counts instead of walking
        /// every image.
        streams_ok => STREAMS_OK = 0x00000200,
        /// Keep the GUID instead of generating a fresh one.
        retain_guid => RETAIN_GUID = 0x00000800,
        /// Pack blobs into solid resources.
        solid => SOLID = 0x00001000,
        /// Report a progress message when each source file's data is fully
        /// written.
        send_done_with_file => SEND_DONE_WITH_FILE = 0x00002000,
        /// Do not reorder blobs for solid compression.
        no_solid_sort => NO_SOLID_SORT = 0x00004000,
        /// Compact in place instead of appending or rebuilding. May
        /// destroy the file on failure; explicit opt-in only.
        unsafe_compact => UNSAFE_COMPACT = 0x00008000,
        /// Drop blobs whose data lives in a different WIM file.
        skip_external_wims => SKIP_EXTERNAL_WIMS = 0x00010000,
    }
}

impl WriteFlags {
    /// Enforce mutual exclusions and the `unsafe_compact` implications.
    pub(crate) fn validated(mut self) -> Result<Self> {
        if self.contains(Self::CHECK_INTEGRITY) && self.contains(Self::NO_CHECK_INTEGRITY) {
            return Err(ErrorInner::InvalidParam("check_integrity conflicts with no_check_integrity").into());
        }
        if self.contains(Self::PIPABLE) && self.contains(Self::NOT_PIPABLE) {
            return Err(ErrorInner::InvalidParam("pipable conflicts with not_pipable").into());
        }
        if self.contains(Self::PIPABLE) && self.contains(Self::SOLID) {
            return Err(ErrorInner::InvalidParam("solid pipable WIMs are not supported").into());
        }
        if self.contains(Self::UNSAFE_COMPACT) {
            if self.contains(Self::RECOMPRESS) {
                return Err(
                    ErrorInner::InvalidParam("unsafe_compact conflicts with recompress").into(),
                );
            }
            self = self.soft_delete().no_solid_sort();
            self.0 &= !Self::REBUILD.0;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_flag_rules() {
        assert!(WriteFlags::default()
            .check_integrity()
            .no_check_integrity()
            .validated()
            .is_err());
        assert!(WriteFlags::default().pipable().not_pipable().validated().is_err());
        assert!(WriteFlags::default()
            .unsafe_compact()
            .recompress()
            .validated()
            .is_err());

        let f = WriteFlags::default()
            .unsafe_compact()
            .rebuild()
            .validated()
            .unwrap();
        assert!(f.contains(WriteFlags::SOFT_DELETE));
        assert!(f.contains(WriteFlags::NO_SOLID_SORT));
        assert!(!f.contains(WriteFlags::REBUILD));
    }
}
