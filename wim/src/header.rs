//! The on-disk WIM header and resource headers.
//!
//! A WIM file starts with a fixed 208-byte header carrying the format
//! version, flags, GUID, spanned-set part numbers, the image count, and
//! embedded resource headers locating the blob table, the XML data and the
//! optional integrity table. Pipable WIMs use a different magic and write a
//! second, authoritative copy of the header at the end of the file.

use std::fmt;

use zerocopy::{little_endian as le, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{ErrorInner, Result};

/// Magic bytes of a normal (seekable) WIM.
pub const WIM_MAGIC: [u8; 8] = *b"MSWIM\0\0\0";
/// Magic bytes of a pipable WIM. Deliberately distinct: pipable layout is
/// incompatible with normal readers.
pub const PIPABLE_WIM_MAGIC: [u8; 8] = *b"WLPWM\0\0\0";

/// Format version of classic compressed/uncompressed WIMs.
pub const WIM_VERSION_DEFAULT: u32 = 0x10d00;
/// Format version that additionally allows solid resources.
pub const WIM_VERSION_SOLID: u32 = 0xe00;

pub const HEADER_SIZE: u64 = size_of::<HeaderDisk>() as u64;
pub const GUID_LEN: usize = 16;

/// Header flag bits.
pub mod hdr_flags {
    pub const COMPRESSION: u32 = 0x00000002;
    pub const READONLY: u32 = 0x00000004;
    pub const SPANNED: u32 = 0x00000008;
    pub const RESOURCE_ONLY: u32 = 0x00000010;
    pub const METADATA_ONLY: u32 = 0x00000020;
    pub const WRITE_IN_PROGRESS: u32 = 0x00000040;
    pub const RP_FIX: u32 = 0x00000080;
    pub const COMPRESS_XPRESS: u32 = 0x00020000;
    pub const COMPRESS_LZX: u32 = 0x00040000;
    pub const COMPRESS_LZMS: u32 = 0x00080000;

    pub const COMPRESS_MASK: u32 = COMPRESS_XPRESS | COMPRESS_LZX | COMPRESS_LZMS;
}

/// Resource header flag bits.
pub mod res_flags {
    pub const FREE: u8 = 0x01;
    pub const METADATA: u8 = 0x02;
    pub const COMPRESSED: u8 = 0x04;
    pub const SPANNED: u8 = 0x08;
    pub const SOLID: u8 = 0x10;
}

/// The compression format of a WIM's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionType {
    #[default]
    None,
    Xpress,
    Lzx,
    Lzms,
}

impl CompressionType {
    /// The chunk size used when the caller does not pick one.
    #[must_use]
    pub fn default_chunk_size(self) -> u32 {
        match self {
            CompressionType::None => 1 << 15,
            CompressionType::Xpress => wim_codecs::Format::Xpress.default_block_size(),
            CompressionType::Lzx => wim_codecs::Format::Lzx.default_block_size(),
            CompressionType::Lzms => wim_codecs::Format::Lzms.default_block_size(),
        }
    }

    /// Check a chunk size against the format's supported set.
    #[must_use]
    pub fn is_valid_chunk_size(self, chunk_size: u32) -> bool {
        match self.codec_format() {
            None => chunk_size.is_power_of_two() && chunk_size >= 512,
            Some(format) => format.is_valid_block_size(chunk_size),
        }
    }

    pub(crate) fn codec_format(self) -> Option<wim_codecs::Format> {
        match self {
            CompressionType::None => None,
            CompressionType::Xpress => Some(wim_codecs::Format::Xpress),
            CompressionType::Lzx => Some(wim_codecs::Format::Lzx),
            CompressionType::Lzms => Some(wim_codecs::Format::Lzms),
        }
    }

    fn from_hdr_flags(flags: u32) -> Result<Self> {
        if flags & hdr_flags::COMPRESSION == 0 {
            return Ok(CompressionType::None);
        }
        match flags & hdr_flags::COMPRESS_MASK {
            hdr_flags::COMPRESS_XPRESS => Ok(CompressionType::Xpress),
            hdr_flags::COMPRESS_LZX => Ok(CompressionType::Lzx),
            hdr_flags::COMPRESS_LZMS => Ok(CompressionType::Lzms),
            other => Err(ErrorInner::InvalidCompressionType(other).into()),
        }
    }

    fn to_hdr_flags(self) -> u32 {
        match self {
            CompressionType::None => 0,
            CompressionType::Xpress => hdr_flags::COMPRESSION | hdr_flags::COMPRESS_XPRESS,
            CompressionType::Lzx => hdr_flags::COMPRESSION | hdr_flags::COMPRESS_LZX,
            CompressionType::Lzms => hdr_flags::COMPRESSION | hdr_flags::COMPRESS_LZMS,
        }
    }
}

/// A resource header as embedded in the file header and blob table: a
/// 56-bit stored size packed with one flag byte, then the file offset and
/// the uncompressed size.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReshdrDisk {
    pub size_in_wim: [u8; 7],
    pub flags: u8,
    pub offset_in_wim: le::U64,
    pub uncompressed_size: le::U64,
}

const _: () = assert!(size_of::<ReshdrDisk>() == 24);

impl ReshdrDisk {
    pub fn get_size_in_wim(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..7].copy_from_slice(&self.size_in_wim);
        u64::from_le_bytes(bytes)
    }

    pub fn set_size_in_wim(&mut self, size: u64) {
        debug_assert!(size < 1 << 56);
        self.size_in_wim.copy_from_slice(&size.to_le_bytes()[..7]);
    }
}

impl fmt::Debug for ReshdrDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReshdrDisk")
            .field("size_in_wim", &self.get_size_in_wim())
            .field("flags", &format_args!("{:#04x}", self.flags))
            .field("offset_in_wim", &self.offset_in_wim.get())
            .field("uncompressed_size", &self.uncompressed_size.get())
            .finish()
    }
}

/// A resource header in friendlier in-memory form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceHeader {
    pub offset_in_wim: u64,
    pub size_in_wim: u64,
    pub uncompressed_size: u64,
    pub flags: u8,
}

impl ResourceHeader {
    pub fn from_disk(disk: &ReshdrDisk) -> Self {
        ResourceHeader {
            offset_in_wim: disk.offset_in_wim.get(),
            size_in_wim: disk.get_size_in_wim(),
            uncompressed_size: disk.uncompressed_size.get(),
            flags: disk.flags,
        }
    }

    pub fn to_disk(self) -> ReshdrDisk {
        let mut disk = ReshdrDisk::new_zeroed();
        disk.set_size_in_wim(self.size_in_wim);
        disk.flags = self.flags;
        disk.offset_in_wim = self.offset_in_wim.into();
        disk.uncompressed_size = self.uncompressed_size.into();
        disk
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & res_flags::COMPRESSED != 0
    }

    pub fn is_metadata(&self) -> bool {
        self.flags & res_flags::METADATA != 0
    }

    pub fn is_solid(&self) -> bool {
        self.flags & res_flags::SOLID != 0
    }

    /// End of the stored byte range in the file.
    pub fn end_offset(&self) -> u64 {
        self.offset_in_wim + self.size_in_wim
    }
}

/// The 208-byte on-disk header.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct HeaderDisk {
    pub magic: [u8; 8],
    pub hdr_size: le::U32,
    pub version: le::U32,
    pub flags: le::U32,
    pub chunk_size: le::U32,
    pub guid: [u8; GUID_LEN],
    pub part_number: le::U16,
    pub total_parts: le::U16,
    pub image_count: le::U32,
    pub blob_table: ReshdrDisk,
    pub xml_data: ReshdrDisk,
    pub boot_metadata: ReshdrDisk,
    pub boot_idx: le::U32,
    pub integrity_table: ReshdrDisk,
    pub unused: [u8; 60],
}

const _: () = assert!(size_of::<HeaderDisk>() == 208);

impl fmt::Debug for HeaderDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderDisk")
            .field("magic", &format_args!("b\"{}\"", self.magic.escape_ascii()))
            .field("version", &format_args!("{:#x}", self.version.get()))
            .field("flags", &format_args!("{:#x}", self.flags.get()))
            .field("chunk_size", &self.chunk_size.get())
            .field("part_number", &self.part_number.get())
            .field("total_parts", &self.total_parts.get())
            .field("image_count", &self.image_count.get())
            .field("boot_idx", &self.boot_idx.get())
            .finish_non_exhaustive()
    }
}

/// The header in validated in-memory form.
#[derive(Debug, Clone)]
pub struct WimHeader {
    pub is_pipable: bool,
    pub version: u32,
    pub flags: u32,
    pub compression: CompressionType,
    pub chunk_size: u32,
    pub guid: [u8; GUID_LEN],
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub blob_table: ResourceHeader,
    pub xml_data: ResourceHeader,
    pub boot_metadata: ResourceHeader,
    pub boot_idx: u32,
    pub integrity_table: ResourceHeader,
}

impl WimHeader {
    /// A fresh header for an empty WIM with the given compression.
    pub fn new(compression: CompressionType, chunk_size: u32, guid: [u8; GUID_LEN]) -> Self {
        let version = match compression {
            CompressionType::Lzms => WIM_VERSION_SOLID,
            _ => WIM_VERSION_DEFAULT,
        };
        WimHeader {
            is_pipable: false,
            version,
            flags: compression.to_hdr_flags(),
            compression,
            chunk_size,
            guid,
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            blob_table: ResourceHeader::default(),
            xml_data: ResourceHeader::default(),
            boot_metadata: ResourceHeader::default(),
            boot_idx: 0,
            integrity_table: ResourceHeader::default(),
        }
    }

    pub fn parse(disk: &HeaderDisk) -> Result<Self> {
        let is_pipable = match disk.magic {
            WIM_MAGIC => false,
            PIPABLE_WIM_MAGIC => true,
            _ => return Err(ErrorInner::NotAWim.into()),
        };
        if u64::from(disk.hdr_size.get()) != HEADER_SIZE {
            return Err(ErrorInner::InvalidHeader("wrong header size field").into());
        }
        let version = disk.version.get();
        if version != WIM_VERSION_DEFAULT && version != WIM_VERSION_SOLID {
            return Err(ErrorInner::UnknownVersion(version).into());
        }
        let flags = disk.flags.get();
        let compression = CompressionType::from_hdr_flags(flags)?;
        let chunk_size = disk.chunk_size.get();
        if compression != CompressionType::None && !compression.is_valid_chunk_size(chunk_size) {
            return Err(ErrorInner::InvalidChunkSize(chunk_size).into());
        }
        let part_number = disk.part_number.get();
        let total_parts = disk.total_parts.get();
        if total_parts == 0 || part_number == 0 || part_number > total_parts {
            return Err(ErrorInner::InvalidHeader("bad part numbers").into());
        }
        Ok(WimHeader {
            is_pipable,
            version,
            flags,
            compression,
            chunk_size,
            guid: disk.guid,
            part_number,
            total_parts,
            image_count: disk.image_count.get(),
            blob_table: ResourceHeader::from_disk(&disk.blob_table),
            xml_data: ResourceHeader::from_disk(&disk.xml_data),
            boot_metadata: ResourceHeader::from_disk(&disk.boot_metadata),
            boot_idx: disk.boot_idx.get(),
            integrity_table: ResourceHeader::from_disk(&disk.integrity_table),
        })
    }

    pub fn to_disk(&self) -> HeaderDisk {
        let mut disk = HeaderDisk::new_zeroed();
        disk.magic = if self.is_pipable {
            PIPABLE_WIM_MAGIC
        } else {
            WIM_MAGIC
        };
        disk.hdr_size = (HEADER_SIZE as u32).into();
        disk.version = self.version.into();
        disk.flags = self.flags.into();
        disk.chunk_size = self.chunk_size.into();
        disk.guid = self.guid;
        disk.part_number = self.part_number.into();
        disk.total_parts = self.total_parts.into();
        disk.image_count = self.image_count.into();
        disk.blob_table = self.blob_table.to_disk();
        disk.xml_data = self.xml_data.to_disk();
        disk.boot_metadata = self.boot_metadata.to_disk();
        disk.boot_idx = self.boot_idx.into();
        disk.integrity_table = self.integrity_table.to_disk();
        disk
    }

    pub fn set_compression(&mut self, compression: CompressionType) {
        self.flags &= !(hdr_flags::COMPRESSION | hdr_flags::COMPRESS_MASK);
        self.flags |= compression.to_hdr_flags();
        self.compression = compression;
        self.version = match compression {
            CompressionType::Lzms => WIM_VERSION_SOLID,
            _ => WIM_VERSION_DEFAULT,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut hdr = WimHeader::new(CompressionType::Lzx, 1 << 15, [7u8; GUID_LEN]);
        hdr.image_count = 3;
        hdr.boot_idx = 2;
        hdr.blob_table = ResourceHeader {
            offset_in_wim: 4096,
            size_in_wim: 150,
            uncompressed_size: 150,
            flags: 0,
        };
        let parsed = WimHeader::parse(&hdr.to_disk()).unwrap();
        assert!(!parsed.is_pipable);
        assert_eq!(parsed.compression, CompressionType::Lzx);
        assert_eq!(parsed.chunk_size, 1 << 15);
        assert_eq!(parsed.image_count, 3);
        assert_eq!(parsed.boot_idx, 2);
        assert_eq!(parsed.blob_table, hdr.blob_table);
        assert_eq!(parsed.guid, [7u8; GUID_LEN]);
    }

    #[test]
    fn reshdr_size_packing() {
        let mut disk = ReshdrDisk::new_zeroed();
        disk.set_size_in_wim((1 << 56) - 1);
        assert_eq!(disk.get_size_in_wim(), (1 << 56) - 1);
        disk.set_size_in_wim(0x1234_5678_9ABC);
        assert_eq!(disk.get_size_in_wim(), 0x1234_5678_9ABC);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let hdr = WimHeader::new(CompressionType::None, 1 << 15, [0u8; GUID_LEN]);
        let mut disk = hdr.to_disk();
        disk.magic = *b"NOTAWIM\0";
        assert!(WimHeader::parse(&disk).is_err());

        let mut disk = hdr.to_disk();
        disk.version = 0x999u32.into();
        assert!(WimHeader::parse(&disk).is_err());
    }

    #[test]
    fn lzms_header_uses_solid_version() {
        let hdr = WimHeader::new(CompressionType::Lzms, 1 << 17, [0u8; GUID_LEN]);
        assert_eq!(hdr.version, WIM_VERSION_SOLID);
        let parsed = WimHeader::parse(&hdr.to_disk()).unwrap();
        assert_eq!(parsed.compression, CompressionType::Lzms);
    }
}
