//! Reading resources: chunk tables, solid resources, pipable framing.
//!
//! A compressed resource is a sequence of fixed-size uncompressed chunks,
//! each stored either compressed or raw (when compression did not shrink
//! it). A chunk table in front of the data (after it, for pipable WIMs)
//! gives the offset of every chunk past the first. Solid resources pack
//! several blobs behind one compression stream and carry their own header
//! with the real uncompressed size, chunk size and compression format.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use positioned_io::ReadAt;
use zerocopy::{little_endian as le, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::header::{res_flags, CompressionType, ResourceHeader};

/// Which file a resource's bytes live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSource {
    /// The WIM file this descriptor's container owns.
    Local,
    /// Another WIM file, e.g. after a cross-WIM export or when opening a
    /// spanned set.
    External(PathBuf),
}

/// An in-memory descriptor for one stored resource.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub offset_in_wim: u64,
    pub size_in_wim: u64,
    pub uncompressed_size: u64,
    pub flags: u8,
    pub compression: CompressionType,
    pub chunk_size: u32,
    pub is_pipable: bool,
    pub source: ResourceSource,
    /// Whether the solid alt-header has been read into the fields above.
    solid_loaded: bool,
    /// Absolute chunk start offsets within the chunk region, one entry per
    /// chunk plus the end sentinel. Parsed on first access.
    chunk_starts: Option<Arc<[u64]>>,
}

impl ResourceDescriptor {
    pub fn from_reshdr(
        reshdr: &ResourceHeader,
        compression: CompressionType,
        chunk_size: u32,
    ) -> Self {
        let compressed = reshdr.is_compressed();
        ResourceDescriptor {
            offset_in_wim: reshdr.offset_in_wim,
            size_in_wim: reshdr.size_in_wim,
            uncompressed_size: reshdr.uncompressed_size,
            flags: reshdr.flags,
            compression: if compressed {
                compression
            } else {
                CompressionType::None
            },
            chunk_size,
            is_pipable: false,
            source: ResourceSource::Local,
            solid_loaded: false,
            chunk_starts: None,
        }
    }

    /// Descriptor for a solid resource located by its blob table entry.
    /// The uncompressed size, chunk size and compression format are read
    /// from the resource's own header on first access.
    pub fn for_solid_resource(reshdr: &ResourceHeader) -> Self {
        ResourceDescriptor {
            offset_in_wim: reshdr.offset_in_wim,
            size_in_wim: reshdr.size_in_wim,
            uncompressed_size: 0,
            flags: reshdr.flags,
            compression: CompressionType::None,
            chunk_size: 0,
            is_pipable: false,
            source: ResourceSource::Local,
            solid_loaded: false,
            chunk_starts: None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & res_flags::COMPRESSED != 0
    }

    pub fn is_solid(&self) -> bool {
        self.flags & res_flags::SOLID != 0
    }

    pub fn to_reshdr(&self) -> ResourceHeader {
        ResourceHeader {
            offset_in_wim: self.offset_in_wim,
            size_in_wim: self.size_in_wim,
            uncompressed_size: self.uncompressed_size,
            flags: self.flags,
        }
    }
}

/// Header in front of a solid resource's chunk table.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct SolidHeaderDisk {
    pub uncompressed_size: le::U64,
    pub chunk_size: le::U32,
    pub compression_format: le::U32,
}

pub const SOLID_HEADER_SIZE: u64 = size_of::<SolidHeaderDisk>() as u64;

impl fmt::Debug for SolidHeaderDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolidHeaderDisk")
            .field("uncompressed_size", &self.uncompressed_size.get())
            .field("chunk_size", &self.chunk_size.get())
            .field("compression_format", &self.compression_format.get())
            .finish()
    }
}

/// Wire values of the solid-header compression format field.
pub const SOLID_COMPRESSION_NONE: u32 = 0;
pub const SOLID_COMPRESSION_XPRESS: u32 = 1;
pub const SOLID_COMPRESSION_LZX: u32 = 2;
pub const SOLID_COMPRESSION_LZMS: u32 = 3;

pub fn compression_to_solid_wire(ctype: CompressionType) -> u32 {
    match ctype {
        CompressionType::None => SOLID_COMPRESSION_NONE,
        CompressionType::Xpress => SOLID_COMPRESSION_XPRESS,
        CompressionType::Lzx => SOLID_COMPRESSION_LZX,
        CompressionType::Lzms => SOLID_COMPRESSION_LZMS,
    }
}

pub fn compression_from_solid_wire(wire: u32) -> Result<CompressionType> {
    match wire {
        SOLID_COMPRESSION_NONE => Ok(CompressionType::None),
        SOLID_COMPRESSION_XPRESS => Ok(CompressionType::Xpress),
        SOLID_COMPRESSION_LZX => Ok(CompressionType::Lzx),
        SOLID_COMPRESSION_LZMS => Ok(CompressionType::Lzms),
        other => Err(ErrorInner::InvalidCompressionType(other).into()),
    }
}

/// Size in bytes of one chunk table entry for a resource of `usize` bytes.
pub fn chunk_entry_size(uncompressed_size: u64) -> u64 {
    if uncompressed_size > u32::MAX as u64 {
        8
    } else {
        4
    }
}

pub fn num_chunks(uncompressed_size: u64, chunk_size: u32) -> u64 {
    uncompressed_size.div_ceil(u64::from(chunk_size))
}

/// Per-chunk header preceding every chunk of a pipable resource, so a
/// sequential reader can walk chunks without the (trailing) chunk table.
pub const PIPABLE_CHUNK_HEADER_SIZE: u64 = 4;

/// Cached state for reading resources of one container: decompressed-chunk
/// LRU, reusable decompressors, and lazily opened external part files.
pub struct ResourceReader {
    cache: LruCache<(usize, u64), Arc<Vec<u8>>>,
    decompressors: Vec<((wim_codecs::Format, u32), wim_codecs::Decompressor)>,
    external_files: HashMap<PathBuf, File>,
}

impl fmt::Debug for ResourceReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceReader")
            .field("cached_chunks", &self.cache.len())
            .field("external_files", &self.external_files.len())
            .finish_non_exhaustive()
    }
}

impl Default for ResourceReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceReader {
    /// A handful of chunks is enough: reads are overwhelmingly sequential.
    const CACHE_CHUNKS: usize = 8;

    pub fn new() -> Self {
        ResourceReader {
            cache: LruCache::new(NonZeroUsize::new(Self::CACHE_CHUNKS).expect("nonzero")),
            decompressors: Vec::new(),
            external_files: HashMap::new(),
        }
    }

    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    fn file_for<'a>(
        &'a mut self,
        local: Option<&'a File>,
        res: &ResourceDescriptor,
    ) -> Result<&'a File> {
        match &res.source {
            ResourceSource::Local => {
                local.ok_or_else(|| ErrorInner::NoFilename.into())
            }
            ResourceSource::External(path) => {
                if !self.external_files.contains_key(path) {
                    let f = File::open(path).io_ctx(IoOp::Open)?;
                    self.external_files.insert(path.clone(), f);
                }
                Ok(&self.external_files[path])
            }
        }
    }

    fn decompressor(
        &mut self,
        format: wim_codecs::Format,
        chunk_size: u32,
    ) -> Result<&mut wim_codecs::Decompressor> {
        let key = (format, chunk_size);
        if let Some(i) = self.decompressors.iter().position(|(k, _)| *k == key) {
            return Ok(&mut self.decompressors[i].1);
        }
        let d = wim_codecs::Decompressor::new(format, chunk_size)
            .ok_or(ErrorInner::InvalidChunkSize(chunk_size))?;
        self.decompressors.push((key, d));
        Ok(&mut self.decompressors.last_mut().expect("just pushed").1)
    }

    /// Load the solid alt-header into the descriptor if not done yet.
    pub(crate) fn load_solid_header(&mut self, local: Option<&File>, res: &mut ResourceDescriptor) -> Result<()> {
        if !res.is_solid() || res.solid_loaded {
            return Ok(());
        }
        let file = self.file_for(local, res)?;
        let mut hdr = SolidHeaderDisk::new_zeroed();
        file.read_exact_at(res.offset_in_wim, hdr.as_mut_bytes())
            .io_ctx(IoOp::Read)?;
        let compression = compression_from_solid_wire(hdr.compression_format.get())?;
        let chunk_size = hdr.chunk_size.get();
        if compression != CompressionType::None && !compression.is_valid_chunk_size(chunk_size) {
            return Err(ErrorInner::InvalidChunkSize(chunk_size).into());
        }
        res.uncompressed_size = hdr.uncompressed_size.get();
        res.chunk_size = chunk_size;
        res.compression = compression;
        res.solid_loaded = true;
        Ok(())
    }

    /// Parse (and memoize) the chunk start offsets of a compressed
    /// resource. The returned array has one entry per chunk plus an end
    /// sentinel, all relative to the start of the chunk region.
    fn chunk_starts(
        &mut self,
        local: Option<&File>,
        res: &mut ResourceDescriptor,
    ) -> Result<Arc<[u64]>> {
        if let Some(starts) = &res.chunk_starts {
            return Ok(starts.clone());
        }

        let nchunks = num_chunks(res.uncompressed_size, res.chunk_size);
        let entry_size = chunk_entry_size(res.uncompressed_size);
        let (num_entries, table_offset, region_len) = if res.is_solid() {
            let table_bytes = nchunks * entry_size;
            (
                nchunks,
                res.offset_in_wim + SOLID_HEADER_SIZE,
                res.size_in_wim
                    .checked_sub(SOLID_HEADER_SIZE + table_bytes)
                    .ok_or(ErrorInner::UnexpectedEof)?,
            )
        } else if res.is_pipable {
            let table_bytes = (nchunks - 1) * entry_size;
            (
                nchunks - 1,
                res.offset_in_wim + res.size_in_wim - table_bytes,
                res.size_in_wim
                    .checked_sub(table_bytes)
                    .ok_or(ErrorInner::UnexpectedEof)?,
            )
        } else {
            let table_bytes = (nchunks - 1) * entry_size;
            (
                nchunks - 1,
                res.offset_in_wim,
                res.size_in_wim
                    .checked_sub(table_bytes)
                    .ok_or(ErrorInner::UnexpectedEof)?,
            )
        };

        let file = self.file_for(local, res)?;
        let mut raw = vec![0u8; (num_entries * entry_size) as usize];
        file.read_exact_at(table_offset, &mut raw).io_ctx(IoOp::Read)?;

        let mut starts = Vec::with_capacity(nchunks as usize + 1);
        if !res.is_solid() {
            starts.push(0);
        }
        for entry in raw.chunks_exact(entry_size as usize) {
            let v = if entry_size == 4 {
                u64::from(u32::from_le_bytes(entry.try_into().expect("4 bytes")))
            } else {
                u64::from_le_bytes(entry.try_into().expect("8 bytes"))
            };
            starts.push(v);
        }
        starts.push(region_len);

        // Offsets must be nondecreasing and inside the region.
        if starts.windows(2).any(|w| w[0] > w[1]) {
            return Err(ErrorInner::InvalidBlobTableEntry("chunk table not sorted").into());
        }

        let starts: Arc<[u64]> = starts.into();
        res.chunk_starts = Some(starts.clone());
        Ok(starts)
    }

    /// Read `out.len()` bytes at `offset` within the uncompressed view of
    /// resource `res_index`.
    pub fn read_range(
        &mut self,
        local: Option<&File>,
        res_index: usize,
        res: &mut ResourceDescriptor,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.load_solid_header(local, res)?;

        if offset + out.len() as u64 > res.uncompressed_size {
            return Err(ErrorInner::UnexpectedEof.into());
        }

        if !res.is_compressed() && !res.is_solid() {
            let file = self.file_for(local, res)?;
            return file
                .read_exact_at(res.offset_in_wim + offset, out)
                .io_ctx(IoOp::Read);
        }

        let chunk_size = u64::from(res.chunk_size);
        let starts = self.chunk_starts(local, res)?;
        let chunks_start = if res.is_solid() {
            res.offset_in_wim + SOLID_HEADER_SIZE + (starts.len() as u64 - 1) * chunk_entry_size(res.uncompressed_size)
        } else if res.is_pipable {
            res.offset_in_wim
        } else {
            res.offset_in_wim + (starts.len() as u64 - 2) * chunk_entry_size(res.uncompressed_size)
        };

        let mut pos = offset;
        let end = offset + out.len() as u64;
        while pos < end {
            let chunk_idx = pos / chunk_size;
            let chunk_off = pos % chunk_size;
            let chunk_ulen =
                chunk_size.min(res.uncompressed_size - chunk_idx * chunk_size) as usize;

            let chunk = self.read_chunk(local, res_index, res, &starts, chunks_start, chunk_idx, chunk_ulen)?;

            let take = ((chunk_ulen as u64 - chunk_off).min(end - pos)) as usize;
            let dst = (pos - offset) as usize;
            out[dst..dst + take]
                .copy_from_slice(&chunk[chunk_off as usize..chunk_off as usize + take]);
            pos += take as u64;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn read_chunk(
        &mut self,
        local: Option<&File>,
        res_index: usize,
        res: &ResourceDescriptor,
        starts: &[u64],
        chunks_start: u64,
        chunk_idx: u64,
        chunk_ulen: usize,
    ) -> Result<Arc<Vec<u8>>> {
        if let Some(chunk) = self.cache.get(&(res_index, chunk_idx)) {
            return Ok(chunk.clone());
        }

        let mut cstart = chunks_start + starts[chunk_idx as usize];
        let mut clen = (starts[chunk_idx as usize + 1] - starts[chunk_idx as usize]) as usize;
        if res.is_pipable {
            // Skip the per-chunk size header.
            cstart += PIPABLE_CHUNK_HEADER_SIZE;
            clen = clen
                .checked_sub(PIPABLE_CHUNK_HEADER_SIZE as usize)
                .ok_or(ErrorInner::UnexpectedEof)?;
        }

        let file = self.file_for(local, res)?;
        let mut cdata = vec![0u8; clen];
        file.read_exact_at(cstart, &mut cdata).io_ctx(IoOp::Read)?;

        let chunk = if clen == chunk_ulen {
            // Stored raw: compression would not have shrunk this chunk.
            cdata
        } else {
            let format = res
                .compression
                .codec_format()
                .ok_or(ErrorInner::Decompression)?;
            let mut out = vec![0u8; chunk_ulen];
            self.decompressor(format, res.chunk_size)?
                .decompress(&cdata, &mut out)
                .map_err(|_| ErrorInner::Decompression)?;
            out
        };

        let chunk = Arc::new(chunk);
        self.cache.put((res_index, chunk_idx), chunk.clone());
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_arithmetic() {
        assert_eq!(num_chunks(1, 1 << 15), 1);
        assert_eq!(num_chunks(1 << 15, 1 << 15), 1);
        assert_eq!(num_chunks((1 << 15) + 1, 1 << 15), 2);
        assert_eq!(chunk_entry_size(u32::MAX as u64), 4);
        assert_eq!(chunk_entry_size(u32::MAX as u64 + 1), 8);
    }

    #[test]
    fn solid_wire_mapping() {
        for ctype in [
            CompressionType::None,
            CompressionType::Xpress,
            CompressionType::Lzx,
            CompressionType::Lzms,
        ] {
            let wire = compression_to_solid_wire(ctype);
            assert_eq!(compression_from_solid_wire(wire).unwrap(), ctype);
        }
        assert!(compression_from_solid_wire(99).is_err());
    }
}
