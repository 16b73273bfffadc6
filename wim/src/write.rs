//! The write orchestrator: planning the blob set, streaming resources
//! through the chunk compressor, and the three write strategies (fresh
//! write, in-place append, in-place compaction).

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use fs2::FileExt;
use positioned_io::{ReadAt, WriteAt};
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::blob::{BlobLocation, BlobSizeTable, BlobHasher, Sha1Hash, SOLID_RESOURCE_MAGIC};
use crate::compress::{ChunkPipeline, ChunkResult};
use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::header::{
    hdr_flags, res_flags, CompressionType, ResourceHeader, WimHeader, HEADER_SIZE,
    WIM_VERSION_SOLID,
};
use crate::integrity::{self, IntegrityTable, INTEGRITY_CHUNK_SIZE};
use crate::metadata;
use crate::progress::{Progress, ProgressFn};
use crate::resource::{
    chunk_entry_size, compression_to_solid_wire, num_chunks, ResourceDescriptor, ResourceSource,
    SolidHeaderDisk, PIPABLE_CHUNK_HEADER_SIZE,
};
use crate::wim::fire;
use crate::{Images, Wim, WriteFlags};

/// Compression and chunk size used for solid resources this library
/// writes. LZMS with 4MiB chunks keeps match-finder memory reasonable
/// while still deduplicating across blob boundaries well.
pub(crate) const SOLID_COMPRESSION: CompressionType = CompressionType::Lzms;
pub(crate) const SOLID_CHUNK_SIZE: u32 = 1 << 22;

/// Header written in front of every blob in a pipable WIM so a sequential
/// reader can identify it without seeking.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct PwmBlobHeaderDisk {
    pub magic: le::U64,
    pub uncompressed_size: le::U64,
    pub hash: [u8; 20],
    pub flags: le::U32,
}

pub(crate) const PWM_BLOB_MAGIC: u64 = 0x3142_4F4C_424D_5750; // "PWMBLOB1" LE

impl fmt::Debug for PwmBlobHeaderDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PwmBlobHeaderDisk")
            .field("uncompressed_size", &self.uncompressed_size.get())
            .field("flags", &self.flags.get())
            .finish_non_exhaustive()
    }
}

/// Where output bytes go: a positioned file, or a forward-only stream
/// (pipable output to a pipe).
pub(crate) enum OutDest {
    File { file: File, pos: u64 },
    Stream { w: Box<dyn Write>, pos: u64 },
}

impl fmt::Debug for OutDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutDest::File { pos, .. } => write!(f, "OutDest::File @ {pos}"),
            OutDest::Stream { pos, .. } => write!(f, "OutDest::Stream @ {pos}"),
        }
    }
}

impl OutDest {
    pub fn pos(&self) -> u64 {
        match self {
            OutDest::File { pos, .. } | OutDest::Stream { pos, .. } => *pos,
        }
    }

    pub fn can_seek(&self) -> bool {
        matches!(self, OutDest::File { .. })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            OutDest::File { file, pos } => {
                file.write_all_at(*pos, data).io_ctx(IoOp::Write)?;
                *pos += data.len() as u64;
                Ok(())
            }
            OutDest::Stream { w, pos } => {
                w.write_all(data).io_ctx(IoOp::Write)?;
                *pos += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Positioned write; only valid on seekable output.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            OutDest::File { file, .. } => file.write_all_at(offset, data).io_ctx(IoOp::Write),
            OutDest::Stream { .. } => {
                Err(ErrorInner::Unsupported("positioned write on a stream").into())
            }
        }
    }

    /// Move the write cursor back; only valid on seekable output.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        match self {
            OutDest::File { pos, .. } => {
                *pos = offset;
                Ok(())
            }
            OutDest::Stream { .. } => Err(ErrorInner::Unsupported("seek on a stream").into()),
        }
    }

    /// Reserve `n` zero bytes (a chunk table to be patched later).
    pub fn reserve(&mut self, n: u64) -> Result<()> {
        let zeros = [0u8; 4096];
        let mut left = n;
        while left > 0 {
            let take = (zeros.len() as u64).min(left) as usize;
            self.write(&zeros[..take])?;
            left -= take as u64;
        }
        Ok(())
    }
}

/// Identity of a blob in the write plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum BlobId {
    Hashed(Sha1Hash),
    Unhashed(usize),
}

#[derive(Debug)]
pub(crate) struct PlannedBlob {
    pub id: BlobId,
    pub size: u64,
    pub location: BlobLocation,
    pub out_refcnt: u32,
    /// The data already lives in the output file (in-place append); only a
    /// table entry is emitted.
    pub filtered: bool,
    /// Copy this resource byte-for-byte instead of recompressing.
    pub raw_copy: Option<usize>,
}

/// A written (or reused) blob headed for the output blob table.
#[derive(Debug)]
pub(crate) struct WrittenBlob {
    pub hash: Sha1Hash,
    pub out_refcnt: u32,
    /// For solid members, `offset_in_wim` is the offset inside the solid
    /// resource's uncompressed view.
    pub reshdr: ResourceHeader,
    pub solid_group: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct SolidGroup {
    pub reshdr: ResourceHeader,
}

/// Everything the finalization step needs to write tables and the header.
#[derive(Debug, Default)]
pub(crate) struct WriteResults {
    pub blobs: Vec<WrittenBlob>,
    pub solid_groups: Vec<SolidGroup>,
    /// `(hash, reshdr)` per selected image, in image order. For an
    /// in-place append of an unmodified image this points at the existing
    /// metadata resource.
    pub metadata: Vec<(Sha1Hash, ResourceHeader)>,
    /// `(source resource, new offset)` of resources already raw-copied.
    pub raw_copied: Vec<(usize, u64)>,
    pub needs_solid_version: bool,
}

#[derive(Debug)]
pub(crate) struct WriteConfig {
    pub flags: WriteFlags,
    pub images: Vec<u32>,
    pub pipable: bool,
    pub ctype: CompressionType,
    pub chunk_size: u32,
    /// Soft filter: blobs already stored in the output file stay put.
    pub append: bool,
    pub num_threads: u32,
}

struct CurResource {
    start: u64,
    usize_total: u64,
    solid: bool,
    compressed: bool,
    entry_size: u64,
    /// Chunk start offsets within the chunk region.
    entries: Vec<u64>,
    stored: u64,
    /// Uncompressed bytes accepted so far.
    filled: u64,
    pending: Vec<u8>,
}

/// Streaming writer for one or more resources, mirroring the original's
/// `write_blobs_ctx`.
pub(crate) struct WriteBlobsCtx {
    out: OutDest,
    pipeline: ChunkPipeline,
    ctype: CompressionType,
    chunk_size: u32,
    pipable: bool,
    done: Vec<ChunkResult>,
    res: Option<CurResource>,
    pub total_bytes: u64,
    pub completed_bytes: u64,
    pub total_streams: u64,
    pub completed_streams: u64,
}

impl fmt::Debug for WriteBlobsCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBlobsCtx")
            .field("out", &self.out)
            .field("ctype", &self.ctype)
            .field("chunk_size", &self.chunk_size)
            .field("pipable", &self.pipable)
            .finish_non_exhaustive()
    }
}

impl WriteBlobsCtx {
    pub fn new(
        out: OutDest,
        ctype: CompressionType,
        chunk_size: u32,
        pipable: bool,
        num_threads: u32,
    ) -> Result<Self> {
        let pipeline = ChunkPipeline::new(ctype, chunk_size, num_threads)
            .map_err(|err| ErrorInner::Io(IoOp::Open, err))?;
        Ok(WriteBlobsCtx {
            out,
            pipeline,
            ctype,
            chunk_size,
            pipable,
            done: Vec::new(),
            res: None,
            total_bytes: 0,
            completed_bytes: 0,
            total_streams: 0,
            completed_streams: 0,
        })
    }

    pub fn into_out(self) -> OutDest {
        self.out
    }

    fn is_compressing(&self) -> bool {
        self.ctype != CompressionType::None
    }

    /// Begin a resource of known uncompressed size. For solid resources a
    /// different compressor may be configured per call.
    pub fn begin_resource(&mut self, usize_total: u64, solid: bool) -> Result<()> {
        debug_assert!(self.res.is_none());
        let start = self.out.pos();
        let compressed = solid || self.is_compressing();
        let entry_size = chunk_entry_size(usize_total);
        let nchunks = num_chunks(usize_total, self.chunk_size);

        if solid {
            let hdr = SolidHeaderDisk {
                uncompressed_size: usize_total.into(),
                chunk_size: self.chunk_size.into(),
                compression_format: compression_to_solid_wire(self.ctype).into(),
            };
            self.out.write(hdr.as_bytes())?;
            self.out.reserve(nchunks * entry_size)?;
        } else if compressed && !self.pipable {
            self.out.reserve(nchunks.saturating_sub(1) * entry_size)?;
        }

        self.res = Some(CurResource {
            start,
            usize_total,
            solid,
            compressed,
            entry_size,
            entries: Vec::new(),
            stored: 0,
            filled: 0,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Offset within the resource's uncompressed view where the next fed
    /// byte will land.
    pub fn fill_offset(&self) -> u64 {
        self.res.as_ref().map_or(0, |r| r.filled)
    }

    /// Feed uncompressed data into the current resource.
    pub fn feed(
        &mut self,
        mut data: &[u8],
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        while !data.is_empty() {
            let res = self.res.as_mut().expect("no open resource");
            if !res.compressed {
                res.filled += data.len() as u64;
                self.out.write(data)?;
                self.bump_progress(data.len() as u64, progress)?;
                break;
            }

            let room = self.chunk_size as usize - res.pending.len();
            let take = room.min(data.len());
            res.pending.extend_from_slice(&data[..take]);
            res.filled += take as u64;
            data = &data[take..];

            if res.pending.len() == self.chunk_size as usize {
                let chunk = std::mem::take(&mut res.pending);
                let mut done = std::mem::take(&mut self.done);
                self.pipeline.submit(chunk, &mut done);
                self.write_ready(&mut done, progress)?;
                self.done = done;
            }
        }
        Ok(())
    }

    fn write_ready(
        &mut self,
        done: &mut Vec<ChunkResult>,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        for result in done.drain(..) {
            let ulen = result.uncompressed.len();
            let stored: &[u8] = match &result.compressed {
                Some(c) if c.len() < ulen => c,
                _ => &result.uncompressed,
            };
            let res = self.res.as_mut().expect("no open resource");
            res.entries.push(res.stored);
            if self.pipable {
                let hdr = (stored.len() as u32).to_le_bytes();
                self.out.write(&hdr)?;
                res.stored += PIPABLE_CHUNK_HEADER_SIZE;
            }
            res.stored += stored.len() as u64;
            self.out.write(stored)?;
            self.bump_progress(ulen as u64, progress)?;
        }
        Ok(())
    }

    fn bump_progress(
        &mut self,
        bytes: u64,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        self.completed_bytes += bytes;
        fire(
            progress,
            &Progress::WriteStreams {
                total_bytes: self.total_bytes,
                completed_bytes: self.completed_bytes,
                total_streams: self.total_streams,
                completed_streams: self.completed_streams,
            },
        )
    }

    /// Finish the current resource and return its final header.
    ///
    /// When a compressed non-solid resource fails to shrink, the caller
    /// must rewrite it raw; that case is reported via `needs_rewrite` in
    /// the returned state instead of silently keeping the bloat (the
    /// pipable layout keeps the compressed form, since its chunk table is
    /// already streamed behind the data).
    pub fn end_resource(
        &mut self,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<FinishedResource> {
        // Flush the partial final chunk.
        let res = self.res.as_mut().expect("no open resource");
        debug_assert_eq!(res.filled, res.usize_total, "resource underfilled");
        if res.compressed && !res.pending.is_empty() {
            let chunk = std::mem::take(&mut res.pending);
            let mut done = std::mem::take(&mut self.done);
            self.pipeline.submit(chunk, &mut done);
            self.write_ready(&mut done, progress)?;
            self.done = done;
        }
        let mut done = std::mem::take(&mut self.done);
        self.pipeline.drain(&mut done);
        self.write_ready(&mut done, progress)?;
        self.done = done;

        let res = self.res.take().expect("no open resource");
        let end = self.out.pos();

        if !res.compressed {
            return Ok(FinishedResource {
                reshdr: ResourceHeader {
                    offset_in_wim: res.start,
                    size_in_wim: res.usize_total,
                    uncompressed_size: res.usize_total,
                    flags: 0,
                },
                needs_rewrite: false,
            });
        }

        // Chunk table: trailing for pipable output, patched in front
        // otherwise. Solid tables carry every entry; normal ones skip the
        // implicit first chunk.
        let table_entries: &[u64] = if res.solid {
            &res.entries
        } else {
            res.entries.get(1..).unwrap_or(&[])
        };
        let mut table = Vec::with_capacity(table_entries.len() * res.entry_size as usize);
        for &e in table_entries {
            if res.entry_size == 4 {
                table.extend_from_slice(&(e as u32).to_le_bytes());
            } else {
                table.extend_from_slice(&e.to_le_bytes());
            }
        }

        if self.pipable {
            self.out.write(&table)?;
        } else {
            let table_offset = if res.solid {
                res.start + size_of::<SolidHeaderDisk>() as u64
            } else {
                res.start
            };
            self.out.write_at(table_offset, &table)?;
        }
        let end = self.out.pos().max(end);

        if res.solid {
            return Ok(FinishedResource {
                reshdr: ResourceHeader {
                    offset_in_wim: res.start,
                    size_in_wim: end - res.start,
                    uncompressed_size: res.usize_total,
                    flags: res_flags::SOLID | res_flags::COMPRESSED,
                },
                needs_rewrite: false,
            });
        }

        let total_stored = end - res.start;
        let single_raw_chunk = res.entries.len() == 1 && res.stored == res.usize_total;
        if single_raw_chunk && !self.pipable {
            // The lone chunk did not compress; its bytes are already the
            // raw data, so just clear the compressed flag.
            return Ok(FinishedResource {
                reshdr: ResourceHeader {
                    offset_in_wim: res.start,
                    size_in_wim: res.usize_total,
                    uncompressed_size: res.usize_total,
                    flags: 0,
                },
                needs_rewrite: false,
            });
        }

        let needs_rewrite = !self.pipable && total_stored >= res.usize_total;
        Ok(FinishedResource {
            reshdr: ResourceHeader {
                offset_in_wim: res.start,
                size_in_wim: total_stored,
                uncompressed_size: res.usize_total,
                flags: res_flags::COMPRESSED,
            },
            needs_rewrite,
        })
    }
}

#[derive(Debug)]
pub(crate) struct FinishedResource {
    pub reshdr: ResourceHeader,
    pub needs_rewrite: bool,
}

// ---------------------------------------------------------------------------
// Blob sources.

/// Re-readable source of one blob's bytes.
pub(crate) enum BlobReadSource {
    Buffer(std::sync::Arc<[u8]>),
    File(std::path::PathBuf),
    InWim { res: usize, offset_in_res: u64, size: u64 },
}

impl BlobReadSource {
    pub(crate) fn from_location(loc: &BlobLocation, size: u64) -> Self {
        match loc {
            BlobLocation::Buffer(b) => BlobReadSource::Buffer(b.clone()),
            BlobLocation::File(p) => BlobReadSource::File(p.clone()),
            BlobLocation::InWim { res, offset_in_res } => BlobReadSource::InWim {
                res: *res,
                offset_in_res: *offset_in_res,
                size,
            },
        }
    }
}

/// Stream a blob's bytes into `sink` without involving the write context,
/// hashing along the way.
pub(crate) fn stream_blob(
    wim: &mut Wim,
    source: &BlobReadSource,
    sink: &mut dyn FnMut(&[u8]) -> Result<()>,
) -> Result<Sha1Hash> {
    let mut hasher = BlobHasher::new();
    match source {
        BlobReadSource::Buffer(buf) => {
            hasher.update(buf);
            sink(buf)?;
        }
        BlobReadSource::File(path) => {
            use std::io::Read;
            let mut f = File::open(path).io_ctx(IoOp::Open)?;
            let mut buf = vec![0u8; 1 << 16];
            loop {
                let n = f.read(&mut buf).io_ctx(IoOp::Read)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                sink(&buf[..n])?;
            }
        }
        BlobReadSource::InWim { res, offset_in_res, size } => {
            let step = 1usize << 17;
            let mut buf = vec![0u8; step];
            let mut done = 0u64;
            while done < *size {
                let take = ((*size - done).min(step as u64)) as usize;
                wim.reader.read_range(
                    wim.file.as_ref(),
                    *res,
                    &mut wim.resources[*res],
                    offset_in_res + done,
                    &mut buf[..take],
                )?;
                hasher.update(&buf[..take]);
                sink(&buf[..take])?;
                done += take as u64;
            }
        }
    }
    Ok(hasher.finalize())
}

/// Hash a blob without writing it anywhere.
pub(crate) fn hash_blob(wim: &mut Wim, source: &BlobReadSource) -> Result<Sha1Hash> {
    stream_blob(wim, source, &mut |_| Ok(()))
}

// ---------------------------------------------------------------------------
// Planning.

pub(crate) fn plan_blobs(wim: &mut Wim, cfg: &WriteConfig) -> Result<Vec<PlannedBlob>> {
    for (_, blob) in wim.blob_table.iter_mut() {
        blob.out_refcnt = 0;
    }

    let writing_all = cfg.images.len() == wim.images.len();
    let streams_ok = cfg.flags.contains(WriteFlags::STREAMS_OK)
        && writing_all
        && wim.images.iter().all(|i| !i.modified)
        && !wim.deletion_occurred;

    let mut order: Vec<BlobId> = Vec::new();
    let mut unhashed_refs: HashMap<usize, u32> = HashMap::new();

    if streams_ok {
        for (hash, blob) in wim.blob_table.iter_mut() {
            if blob.refcnt > 0 {
                blob.out_refcnt = blob.refcnt;
                order.push(BlobId::Hashed(*hash));
            }
        }
    } else {
        let images = &wim.images;
        let blob_table = &mut wim.blob_table;
        for &img in &cfg.images {
            let mut streams = Vec::new();
            images[img as usize - 1]
                .image
                .for_each_stream(&mut |s| streams.push(*s));
            for stream in streams {
                let hash = match stream {
                    crate::StreamRef::Empty => continue,
                    crate::StreamRef::Hash(h) => h,
                    crate::StreamRef::Unhashed(id) => match blob_table.resolved_hash(id) {
                        Some(h) => h,
                        None => {
                            let refs = unhashed_refs.entry(id).or_insert(0);
                            if *refs == 0 {
                                order.push(BlobId::Unhashed(id));
                            }
                            *refs += 1;
                            continue;
                        }
                    },
                };
                match blob_table.get_mut(&hash) {
                    Some(blob) => {
                        if blob.out_refcnt == 0 {
                            order.push(BlobId::Hashed(hash));
                        }
                        blob.out_refcnt += 1;
                    }
                    None => {
                        return Err(ErrorInner::ResourceNotFound(hash.to_string()).into());
                    }
                }
            }
        }
    }

    let skip_external = cfg.flags.contains(WriteFlags::SKIP_EXTERNAL_WIMS);
    let mut planned: Vec<PlannedBlob> = Vec::new();
    let mut planned_index: HashMap<Sha1Hash, usize> = HashMap::new();

    for id in order {
        match id {
            BlobId::Hashed(hash) => {
                let blob = wim.blob_table.get(&hash).expect("planned above");
                let mut filtered = false;
                if let BlobLocation::InWim { res, .. } = blob.location {
                    match wim.resources[res].source {
                        ResourceSource::Local => filtered = cfg.append,
                        ResourceSource::External(_) => {
                            if skip_external {
                                // Hard filter: dropped from the output
                                // entirely; image references stay.
                                continue;
                            }
                        }
                    }
                }
                planned_index.insert(hash, planned.len());
                planned.push(PlannedBlob {
                    id: BlobId::Hashed(hash),
                    size: blob.size,
                    location: blob.location.clone(),
                    out_refcnt: blob.out_refcnt,
                    filtered,
                    raw_copy: None,
                });
            }
            BlobId::Unhashed(id) => {
                let u = wim.blob_table.unhashed(id).expect("planned above");
                planned.push(PlannedBlob {
                    id: BlobId::Unhashed(id),
                    size: u.size,
                    location: u.location.clone(),
                    out_refcnt: unhashed_refs[&id],
                    filtered: false,
                    raw_copy: None,
                });
            }
        }
    }

    // Size-uniqueness decides which unhashed blobs may be streamed without
    // pre-hashing: a unique-size blob cannot duplicate anything in the
    // write set. Filters (and the pipable blob header, which needs the
    // hash up front) force pre-hashing regardless.
    let mut size_table = BlobSizeTable::with_capacity(planned.len());
    for p in planned.iter().filter(|p| !p.filtered) {
        size_table.insert(p.size);
    }
    let must_prehash_all = cfg.append || cfg.pipable || skip_external;

    let mut i = 0;
    while i < planned.len() {
        let BlobId::Unhashed(id) = planned[i].id else {
            i += 1;
            continue;
        };
        if !must_prehash_all && size_table.is_unique(planned[i].size) {
            i += 1;
            continue;
        }

        let source = BlobReadSource::from_location(&planned[i].location, planned[i].size);
        let hash = hash_blob(wim, &source)?;
        let existed_before = wim.blob_table.get(&hash).is_some();
        wim.blob_table.resolve_unhashed(id, hash);

        if let Some(&other) = planned_index.get(&hash) {
            // Duplicate of a blob already in the write set: transfer the
            // references and drop this copy.
            planned[other].out_refcnt += planned[i].out_refcnt;
            planned.remove(i);
            reindex(&mut planned_index, &planned);
            continue;
        }
        if existed_before {
            let blob = wim.blob_table.get(&hash).expect("present");
            // Present in the container already (e.g. appended duplicate of
            // an existing blob): emit only the table entry.
            let filtered = cfg.append && matches!(blob.location, BlobLocation::InWim { .. });
            planned[i].id = BlobId::Hashed(hash);
            planned[i].filtered = filtered;
            planned[i].location = blob.location.clone();
        } else {
            planned[i].id = BlobId::Hashed(hash);
        }
        let blob = wim.blob_table.get_mut(&hash).expect("present");
        blob.out_refcnt += planned[i].out_refcnt;
        planned_index.insert(hash, i);
        i += 1;
    }

    find_raw_copy_blobs(wim, cfg, &mut planned)?;
    Ok(planned)
}

fn reindex(index: &mut HashMap<Sha1Hash, usize>, planned: &[PlannedBlob]) {
    index.clear();
    for (i, p) in planned.iter().enumerate() {
        if let BlobId::Hashed(h) = p.id {
            index.insert(h, i);
        }
    }
}

/// Mark blobs whose stored form can be copied byte-for-byte.
fn find_raw_copy_blobs(
    wim: &mut Wim,
    cfg: &WriteConfig,
    planned: &mut [PlannedBlob],
) -> Result<()> {
    if cfg.flags.contains(WriteFlags::RECOMPRESS) {
        return Ok(());
    }

    // Referenced byte tallies per solid source resource.
    let mut solid_referenced: HashMap<usize, u64> = HashMap::new();
    for p in planned.iter() {
        if p.filtered {
            continue;
        }
        if let BlobLocation::InWim { res, .. } = p.location {
            wim.ensure_solid_loaded(res)?;
            if wim.resources[res].is_solid() {
                *solid_referenced.entry(res).or_insert(0) += p.size;
            }
        }
    }

    for p in planned.iter_mut() {
        if p.filtered {
            continue;
        }
        let BlobLocation::InWim { res, .. } = p.location else {
            continue;
        };
        let desc = &wim.resources[res];
        if desc.is_pipable != cfg.pipable {
            continue;
        }
        if desc.is_solid() {
            // A solid resource is copied whole; only worth it while most
            // of it is still referenced.
            let referenced = solid_referenced.get(&res).copied().unwrap_or(0);
            if desc.uncompressed_size > 0 && referenced * 3 >= desc.uncompressed_size * 2 {
                p.raw_copy = Some(res);
            }
        } else if desc.is_compressed()
            && desc.compression == cfg.ctype
            && desc.chunk_size == cfg.chunk_size
        {
            p.raw_copy = Some(res);
        } else if !desc.is_compressed() && cfg.ctype == CompressionType::None {
            p.raw_copy = Some(res);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Data writing.

/// Write all planned blob data and the selected images' metadata.
pub(crate) fn write_blobs(
    wim: &mut Wim,
    ctx: &mut WriteBlobsCtx,
    cfg: &WriteConfig,
    planned: Vec<PlannedBlob>,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<WriteResults> {
    let mut results = WriteResults::default();

    let (mut to_write, entry_only): (Vec<_>, Vec<_>) = planned
        .into_iter()
        .partition(|p| !p.filtered && p.raw_copy.is_none());
    let (raw_copy, filtered): (Vec<_>, Vec<_>) =
        entry_only.into_iter().partition(|p| p.raw_copy.is_some());

    ctx.total_streams = to_write.len() as u64 + raw_copy.len() as u64;
    ctx.total_bytes = to_write.iter().map(|p| p.size).sum();

    let solid_mode = cfg.flags.contains(WriteFlags::SOLID) && !to_write.is_empty();
    if solid_mode && !cfg.flags.contains(WriteFlags::NO_SOLID_SORT) {
        // No capture names survive to this layer, so order by size then
        // identity, grouping similar-sized data.
        to_write.sort_by_key(|p| (p.size, p.id));
    }

    if solid_mode {
        write_solid_group(wim, ctx, &to_write, &mut results, progress)?;
        results.needs_solid_version = true;
    } else {
        for p in &to_write {
            write_one_blob(wim, ctx, cfg, p, &mut results, progress)?;
        }
    }

    // Raw copies preserve the stored bytes (and chunk tables) exactly.
    for p in &raw_copy {
        write_raw_copy(wim, ctx, cfg, p, &mut results, progress)?;
    }

    // Filtered blobs only need table entries pointing at where they
    // already are.
    for p in &filtered {
        let BlobId::Hashed(hash) = p.id else {
            return Err(ErrorInner::InvalidParam("unhashed blob cannot be filtered").into());
        };
        let BlobLocation::InWim { res, offset_in_res } = p.location else {
            return Err(ErrorInner::InvalidParam("filtered blob must be in the WIM").into());
        };
        let desc = &wim.resources[res];
        if desc.is_solid() {
            let group = ensure_solid_group(&mut results, desc.to_reshdr());
            results.blobs.push(WrittenBlob {
                hash,
                out_refcnt: p.out_refcnt,
                reshdr: ResourceHeader {
                    offset_in_wim: offset_in_res,
                    size_in_wim: p.size,
                    uncompressed_size: p.size,
                    flags: res_flags::SOLID | res_flags::COMPRESSED,
                },
                solid_group: Some(group),
            });
        } else {
            results.blobs.push(WrittenBlob {
                hash,
                out_refcnt: p.out_refcnt,
                reshdr: desc.to_reshdr(),
                solid_group: None,
            });
        }
    }

    if !results.solid_groups.is_empty() {
        results.needs_solid_version = true;
    }

    write_metadata_resources(wim, ctx, cfg, &mut results, progress)?;
    Ok(results)
}

fn ensure_solid_group(results: &mut WriteResults, reshdr: ResourceHeader) -> usize {
    if let Some(i) = results
        .solid_groups
        .iter()
        .position(|g| g.reshdr.offset_in_wim == reshdr.offset_in_wim)
    {
        return i;
    }
    results.solid_groups.push(SolidGroup { reshdr });
    results.solid_groups.len() - 1
}

fn write_one_blob(
    wim: &mut Wim,
    ctx: &mut WriteBlobsCtx,
    cfg: &WriteConfig,
    p: &PlannedBlob,
    results: &mut WriteResults,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<()> {
    let source = BlobReadSource::from_location(&p.location, p.size);

    if cfg.pipable {
        let hash = match p.id {
            BlobId::Hashed(h) => h,
            // Planning pre-hashes everything in pipable mode.
            BlobId::Unhashed(_) => {
                return Err(ErrorInner::InvalidParam("unhashed blob in pipable write").into())
            }
        };
        let hdr = PwmBlobHeaderDisk {
            magic: PWM_BLOB_MAGIC.into(),
            uncompressed_size: p.size.into(),
            hash: hash.0,
            flags: 0u32.into(),
        };
        ctx.out.write(hdr.as_bytes())?;
    }

    ctx.begin_resource(p.size, false)?;
    let hash = stream_blob_into_ctx(wim, &source, ctx, progress)?;
    let finished = ctx.end_resource(progress)?;

    let mut reshdr = finished.reshdr;
    if finished.needs_rewrite {
        // The compressed form did not shrink; rewrite the resource raw.
        ctx.out.seek_to(reshdr.offset_in_wim)?;
        ctx.begin_resource_uncompressed(p.size);
        stream_blob_into_ctx(wim, &source, ctx, progress)?;
        let finished = ctx.end_resource(progress)?;
        reshdr = finished.reshdr;
    }

    let final_hash = match p.id {
        BlobId::Hashed(h) => {
            if h != hash {
                return Err(ErrorInner::InvalidResourceHash.into());
            }
            h
        }
        BlobId::Unhashed(id) => {
            // Streamed-without-prehash case; record the resolution now.
            wim.blob_table.resolve_unhashed(id, hash);
            if let Some(blob) = wim.blob_table.get_mut(&hash) {
                blob.out_refcnt += p.out_refcnt;
            }
            hash
        }
    };

    ctx.completed_streams += 1;
    results.blobs.push(WrittenBlob {
        hash: final_hash,
        out_refcnt: p.out_refcnt,
        reshdr,
        solid_group: None,
    });
    Ok(())
}

/// Feed a blob into the write context (borrow gymnastics: the context
/// cannot be captured by the sink closure while `wim` streams from its own
/// resources, so this drives the copy loop manually).
fn stream_blob_into_ctx(
    wim: &mut Wim,
    source: &BlobReadSource,
    ctx: &mut WriteBlobsCtx,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<Sha1Hash> {
    let mut hasher = BlobHasher::new();
    match source {
        BlobReadSource::Buffer(buf) => {
            hasher.update(buf);
            ctx.feed(buf, progress)?;
        }
        BlobReadSource::File(path) => {
            use std::io::Read;
            let mut f = File::open(path).io_ctx(IoOp::Open)?;
            let mut buf = vec![0u8; 1 << 16];
            loop {
                let n = f.read(&mut buf).io_ctx(IoOp::Read)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                ctx.feed(&buf[..n], progress)?;
            }
        }
        BlobReadSource::InWim { res, offset_in_res, size } => {
            let step = 1usize << 17;
            let mut buf = vec![0u8; step];
            let mut done = 0u64;
            while done < *size {
                let take = ((*size - done).min(step as u64)) as usize;
                wim.reader.read_range(
                    wim.file.as_ref(),
                    *res,
                    &mut wim.resources[*res],
                    offset_in_res + done,
                    &mut buf[..take],
                )?;
                hasher.update(&buf[..take]);
                ctx.feed(&buf[..take], progress)?;
                done += take as u64;
            }
        }
    }
    Ok(hasher.finalize())
}

impl WriteBlobsCtx {
    /// Open an uncompressed resource (for the rewrite-raw fallback).
    fn begin_resource_uncompressed(&mut self, usize_total: u64) {
        debug_assert!(self.res.is_none());
        self.res = Some(CurResource {
            start: self.out.pos(),
            usize_total,
            solid: false,
            compressed: false,
            entry_size: chunk_entry_size(usize_total),
            entries: Vec::new(),
            stored: 0,
            filled: 0,
            pending: Vec::new(),
        });
    }
}

fn write_solid_group(
    wim: &mut Wim,
    ctx: &mut WriteBlobsCtx,
    blobs: &[PlannedBlob],
    results: &mut WriteResults,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<()> {
    let total: u64 = blobs.iter().map(|p| p.size).sum();
    ctx.begin_resource(total, true)?;

    let group_index = results.solid_groups.len();
    let mut member_info = Vec::with_capacity(blobs.len());

    for p in blobs {
        let offset_in_res = ctx.fill_offset();
        let source = BlobReadSource::from_location(&p.location, p.size);
        let hash = stream_blob_into_ctx(wim, &source, ctx, progress)?;

        let final_hash = match p.id {
            BlobId::Hashed(h) => {
                if h != hash {
                    return Err(ErrorInner::InvalidResourceHash.into());
                }
                h
            }
            BlobId::Unhashed(id) => {
                wim.blob_table.resolve_unhashed(id, hash);
                if let Some(blob) = wim.blob_table.get_mut(&hash) {
                    blob.out_refcnt += p.out_refcnt;
                }
                hash
            }
        };
        ctx.completed_streams += 1;
        member_info.push((final_hash, p.out_refcnt, offset_in_res, p.size));
    }

    let finished = ctx.end_resource(progress)?;
    results.solid_groups.push(SolidGroup {
        reshdr: finished.reshdr,
    });
    for (hash, out_refcnt, offset_in_res, size) in member_info {
        results.blobs.push(WrittenBlob {
            hash,
            out_refcnt,
            reshdr: ResourceHeader {
                offset_in_wim: offset_in_res,
                size_in_wim: size,
                uncompressed_size: size,
                flags: res_flags::SOLID | res_flags::COMPRESSED,
            },
            solid_group: Some(group_index),
        });
    }
    Ok(())
}

fn write_raw_copy(
    wim: &mut Wim,
    ctx: &mut WriteBlobsCtx,
    cfg: &WriteConfig,
    p: &PlannedBlob,
    results: &mut WriteResults,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<()> {
    let res_index = p.raw_copy.expect("raw copy marked");
    let BlobId::Hashed(hash) = p.id else {
        return Err(ErrorInner::InvalidParam("raw copy of unhashed blob").into());
    };
    let BlobLocation::InWim { offset_in_res, .. } = p.location else {
        return Err(ErrorInner::InvalidParam("raw copy source must be in a WIM").into());
    };

    let desc = wim.resources[res_index].clone();
    let solid = desc.is_solid();

    // A solid resource is copied once; later members just add entries.
    let new_offset = match copied_from(&results.raw_copied, res_index) {
        Some(off) => off,
        None => {
            if cfg.pipable && !solid {
                let hdr = PwmBlobHeaderDisk {
                    magic: PWM_BLOB_MAGIC.into(),
                    uncompressed_size: p.size.into(),
                    hash: hash.0,
                    flags: 0u32.into(),
                };
                ctx.out.write(hdr.as_bytes())?;
            }
            let new_offset = ctx.out.pos();
            copy_resource_bytes(wim, ctx, &desc)?;
            results.raw_copied.push((res_index, new_offset));
            fire(
                progress,
                &Progress::WriteStreams {
                    total_bytes: ctx.total_bytes,
                    completed_bytes: ctx.completed_bytes,
                    total_streams: ctx.total_streams,
                    completed_streams: ctx.completed_streams,
                },
            )?;
            new_offset
        }
    };

    if solid {
        let mut reshdr = desc.to_reshdr();
        reshdr.offset_in_wim = new_offset;
        let group = ensure_solid_group(results, reshdr);
        results.blobs.push(WrittenBlob {
            hash,
            out_refcnt: p.out_refcnt,
            reshdr: ResourceHeader {
                offset_in_wim: offset_in_res,
                size_in_wim: p.size,
                uncompressed_size: p.size,
                flags: res_flags::SOLID | res_flags::COMPRESSED,
            },
            solid_group: Some(group),
        });
    } else {
        let mut reshdr = desc.to_reshdr();
        reshdr.offset_in_wim = new_offset;
        results.blobs.push(WrittenBlob {
            hash,
            out_refcnt: p.out_refcnt,
            reshdr,
            solid_group: None,
        });
    }
    ctx.completed_streams += 1;
    Ok(())
}

fn copied_from(raw_copied: &[(usize, u64)], res: usize) -> Option<u64> {
    raw_copied.iter().find(|(r, _)| *r == res).map(|(_, o)| *o)
}

fn copy_resource_bytes(wim: &mut Wim, ctx: &mut WriteBlobsCtx, desc: &ResourceDescriptor) -> Result<()> {
    let src_file_owned;
    let src_file: &File = match &desc.source {
        ResourceSource::Local => wim.file.as_ref().ok_or(ErrorInner::NoFilename)?,
        ResourceSource::External(path) => {
            src_file_owned = File::open(path).io_ctx(IoOp::Open)?;
            &src_file_owned
        }
    };
    let mut buf = vec![0u8; 1 << 20];
    let mut done = 0u64;
    while done < desc.size_in_wim {
        let take = ((desc.size_in_wim - done).min(buf.len() as u64)) as usize;
        src_file
            .read_exact_at(desc.offset_in_wim + done, &mut buf[..take])
            .io_ctx(IoOp::Read)?;
        ctx.out.write(&buf[..take])?;
        done += take as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Metadata resources.

fn write_metadata_resources(
    wim: &mut Wim,
    ctx: &mut WriteBlobsCtx,
    cfg: &WriteConfig,
    results: &mut WriteResults,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<()> {
    for &img in &cfg.images {
        let entry = &wim.images[img as usize - 1];

        // An unmodified image appended in place keeps its existing
        // metadata resource untouched.
        if cfg.append && !entry.modified {
            if let Some(res) = entry.metadata_res {
                let mut reshdr = wim.resources[res].to_reshdr();
                reshdr.flags |= res_flags::METADATA;
                results.metadata.push((entry.metadata_hash, reshdr));
                continue;
            }
        }

        // Unmodified images whose stored form matches the output format
        // can be raw-copied, keeping their hash.
        if !entry.modified && !cfg.flags.contains(WriteFlags::RECOMPRESS) {
            if let Some(res) = entry.metadata_res {
                let desc = wim.resources[res].clone();
                if desc.is_pipable == cfg.pipable
                    && (!desc.is_compressed()
                        || (desc.compression == cfg.ctype && desc.chunk_size == cfg.chunk_size))
                {
                    if cfg.pipable {
                        let hdr = PwmBlobHeaderDisk {
                            magic: PWM_BLOB_MAGIC.into(),
                            uncompressed_size: desc.uncompressed_size.into(),
                            hash: entry.metadata_hash.0,
                            flags: u32::from(res_flags::METADATA).into(),
                        };
                        ctx.out.write(hdr.as_bytes())?;
                    }
                    let new_offset = ctx.out.pos();
                    copy_resource_bytes(wim, ctx, &desc)?;
                    let mut reshdr = desc.to_reshdr();
                    reshdr.offset_in_wim = new_offset;
                    reshdr.flags |= res_flags::METADATA;
                    results.metadata.push((wim.images[img as usize - 1].metadata_hash, reshdr));
                    continue;
                }
            }
        }

        // Serialize fresh metadata.
        let bytes = metadata::encode(&wim.images[img as usize - 1].image, &wim.blob_table)?;
        let hash = Sha1Hash::of(&bytes);

        if cfg.pipable {
            let hdr = PwmBlobHeaderDisk {
                magic: PWM_BLOB_MAGIC.into(),
                uncompressed_size: (bytes.len() as u64).into(),
                hash: hash.0,
                flags: u32::from(res_flags::METADATA).into(),
            };
            ctx.out.write(hdr.as_bytes())?;
        }

        ctx.begin_resource(bytes.len() as u64, false)?;
        ctx.feed(&bytes, progress)?;
        let finished = ctx.end_resource(progress)?;
        let mut reshdr = finished.reshdr;
        if finished.needs_rewrite {
            ctx.out.seek_to(reshdr.offset_in_wim)?;
            ctx.begin_resource_uncompressed(bytes.len() as u64);
            ctx.feed(&bytes, progress)?;
            reshdr = ctx.end_resource(progress)?.reshdr;
        }
        reshdr.flags |= res_flags::METADATA;
        results.metadata.push((hash, reshdr));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Finalization.

pub(crate) struct FinalizeOutcome {
    pub blob_table: ResourceHeader,
    pub xml: ResourceHeader,
    pub integrity: Option<(IntegrityTable, ResourceHeader)>,
    pub end_offset: u64,
}

/// Write the blob table, XML data, optional integrity table, and return
/// the headers to put into the file header. The caller writes the header.
#[allow(clippy::too_many_arguments)]
pub(crate) fn finalize_tables(
    wim: &mut Wim,
    out: &mut OutDest,
    cfg: &WriteConfig,
    results: &WriteResults,
    selected_xml: &[u32],
    old_integrity: Option<(&IntegrityTable, u64)>,
    progress: &mut Option<Box<ProgressFn>>,
) -> Result<FinalizeOutcome> {
    // Assemble entries sorted by (solid?, group offset, offset).
    #[derive(Debug)]
    struct Entry {
        key: (bool, u64, u64),
        reshdr: ResourceHeader,
        part: u16,
        refcnt: u32,
        hash: Sha1Hash,
        magic_usize: bool,
    }
    let mut entries = Vec::new();

    for group in &results.solid_groups {
        entries.push(Entry {
            key: (true, group.reshdr.offset_in_wim, 0),
            reshdr: group.reshdr,
            part: 1,
            refcnt: 1,
            hash: Sha1Hash::ZERO,
            magic_usize: true,
        });
    }
    for blob in &results.blobs {
        let key = match blob.solid_group {
            Some(g) => (
                true,
                results.solid_groups[g].reshdr.offset_in_wim,
                blob.reshdr.offset_in_wim + 1,
            ),
            None => (false, 0, blob.reshdr.offset_in_wim),
        };
        entries.push(Entry {
            key,
            reshdr: blob.reshdr,
            part: 1,
            refcnt: blob.out_refcnt.max(1),
            hash: blob.hash,
            magic_usize: false,
        });
    }
    for (hash, reshdr) in &results.metadata {
        entries.push(Entry {
            key: (false, 0, reshdr.offset_in_wim),
            reshdr: *reshdr,
            part: 1,
            refcnt: 1,
            hash: *hash,
            magic_usize: false,
        });
    }
    entries.sort_by_key(|e| e.key);

    let mut table_bytes = Vec::with_capacity(entries.len() * crate::blob::BLOB_DISK_ENTRY_SIZE);
    for e in &entries {
        let mut reshdr = e.reshdr;
        if e.magic_usize {
            reshdr.uncompressed_size = SOLID_RESOURCE_MAGIC;
        }
        table_bytes.extend_from_slice(&crate::blob::encode_entry(
            &reshdr, e.part, e.refcnt, &e.hash,
        ));
    }

    let blob_table_offset = out.pos();
    out.write(&table_bytes)?;
    let blob_table = ResourceHeader {
        offset_in_wim: blob_table_offset,
        size_in_wim: table_bytes.len() as u64,
        uncompressed_size: table_bytes.len() as u64,
        flags: 0,
    };

    // XML data, covering the selected images.
    let mut xml = crate::xml::XmlInfo {
        total_bytes: out.pos(),
        images: Vec::new(),
    };
    for &img in selected_xml {
        xml.images.push(wim.xml.images[img as usize - 1].clone());
    }
    let xml_bytes = xml.emit();
    let xml_offset = out.pos();
    out.write(&xml_bytes)?;
    let xml_reshdr = ResourceHeader {
        offset_in_wim: xml_offset,
        size_in_wim: xml_bytes.len() as u64,
        uncompressed_size: xml_bytes.len() as u64,
        flags: 0,
    };

    // Integrity table.
    let want_integrity = !cfg.pipable
        && out.can_seek()
        && (cfg.flags.contains(WriteFlags::CHECK_INTEGRITY)
            || (old_integrity.is_some() && !cfg.flags.contains(WriteFlags::NO_CHECK_INTEGRITY)));
    let integrity_out = if want_integrity {
        let OutDest::File { file, .. } = &*out else {
            unreachable!("can_seek checked");
        };
        let end = blob_table.end_offset();
        let mut table = integrity::compute(
            file,
            HEADER_SIZE,
            end,
            old_integrity.map_or(INTEGRITY_CHUNK_SIZE, |(t, _)| t.chunk_size),
            old_integrity,
            &mut |done, total| {
                fire(
                    progress,
                    &Progress::CalcIntegrity {
                        total_chunks: total,
                        completed_chunks: done,
                    },
                )
            },
        )?;
        let bytes = table.emit();
        let offset = out.pos();
        out.write(&bytes)?;
        Some((
            table,
            ResourceHeader {
                offset_in_wim: offset,
                size_in_wim: bytes.len() as u64,
                uncompressed_size: bytes.len() as u64,
                flags: 0,
            },
        ))
    } else {
        None
    };

    Ok(FinalizeOutcome {
        blob_table,
        xml: xml_reshdr,
        integrity: integrity_out,
        end_offset: out.pos(),
    })
}

/// Build the final header for a finished write.
pub(crate) fn build_final_header(
    wim: &Wim,
    cfg: &WriteConfig,
    results: &WriteResults,
    outcome: &FinalizeOutcome,
    guid: [u8; 16],
) -> WimHeader {
    let mut hdr = wim.hdr.clone();
    hdr.is_pipable = cfg.pipable;
    hdr.set_compression(cfg.ctype);
    if results.needs_solid_version {
        hdr.version = WIM_VERSION_SOLID;
    }
    hdr.chunk_size = cfg.chunk_size;
    hdr.guid = guid;
    hdr.part_number = 1;
    hdr.total_parts = 1;
    hdr.image_count = cfg.images.len() as u32;
    hdr.blob_table = outcome.blob_table;
    hdr.xml_data = outcome.xml;
    hdr.integrity_table = outcome
        .integrity
        .as_ref()
        .map(|(_, r)| *r)
        .unwrap_or_default();
    hdr.flags &= !(hdr_flags::WRITE_IN_PROGRESS | hdr_flags::SPANNED);

    // Boot index: remap into the selection.
    hdr.boot_idx = 0;
    let mut boot_metadata = ResourceHeader::default();
    if wim.hdr.boot_idx != 0 {
        if let Some(new_idx) = cfg.images.iter().position(|&i| i == wim.hdr.boot_idx) {
            hdr.boot_idx = new_idx as u32 + 1;
            if let Some((_, reshdr)) = results.metadata.get(new_idx) {
                boot_metadata = *reshdr;
            }
        }
    }
    hdr.boot_metadata = boot_metadata;
    hdr
}

// ---------------------------------------------------------------------------
// Public write entry points.

impl Wim {
    /// Write the selected image(s) to a new file at `path`.
    pub fn write(
        &mut self,
        path: impl AsRef<Path>,
        images: Images,
        flags: WriteFlags,
        num_threads: u32,
    ) -> Result<()> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .io_ctx(IoOp::Open)?;
        self.write_to_file(file, images, flags, num_threads)
    }

    /// Write the selected image(s) to an open file. With
    /// [`WriteFlags::PIPABLE`] the file may be a pipe; everything is
    /// written strictly sequentially.
    pub fn write_to_fd(
        &mut self,
        file: File,
        images: Images,
        flags: WriteFlags,
        num_threads: u32,
    ) -> Result<()> {
        self.write_to_file(file, images, flags, num_threads)
    }

    fn write_to_file(
        &mut self,
        file: File,
        images: Images,
        flags: WriteFlags,
        num_threads: u32,
    ) -> Result<()> {
        let flags = flags.validated()?;
        let image_list = self.resolve_images(images)?;
        let pipable = flags.contains(WriteFlags::PIPABLE);

        let cfg = WriteConfig {
            flags,
            images: image_list,
            pipable,
            ctype: if flags.contains(WriteFlags::SOLID) {
                SOLID_COMPRESSION
            } else {
                self.hdr.compression
            },
            chunk_size: if flags.contains(WriteFlags::SOLID) {
                SOLID_CHUNK_SIZE
            } else {
                self.hdr.chunk_size
            },
            append: false,
            num_threads,
        };

        let guid = if flags.contains(WriteFlags::RETAIN_GUID) {
            self.hdr.guid
        } else {
            rand::random()
        };

        let mut progress = self.progress.take();
        let result = self.write_fresh(&file, &cfg, guid, &mut progress);
        self.progress = progress;
        result
    }

    fn write_fresh(
        &mut self,
        file: &File,
        cfg: &WriteConfig,
        guid: [u8; 16],
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        let mut out = if cfg.pipable {
            let w = file.try_clone().io_ctx(IoOp::Open)?;
            OutDest::Stream { w: Box::new(w), pos: 0 }
        } else {
            let out_file = file.try_clone().io_ctx(IoOp::Open)?;
            OutDest::File { file: out_file, pos: 0 }
        };

        // Placeholder header; rewritten (or re-appended, for pipable
        // output) once everything else is in place.
        let mut placeholder = self.hdr.clone();
        placeholder.is_pipable = cfg.pipable;
        placeholder.flags |= hdr_flags::WRITE_IN_PROGRESS;
        out.write(placeholder.to_disk().as_bytes())?;

        let planned = plan_blobs(self, cfg)?;
        let mut ctx = WriteBlobsCtx::new(out, cfg.ctype, cfg.chunk_size, cfg.pipable, cfg.num_threads)?;
        let results = write_blobs(self, &mut ctx, cfg, planned, progress)?;
        let mut out = ctx.into_out();

        let outcome = finalize_tables(self, &mut out, cfg, &results, &cfg.images, None, progress)?;

        let hdr = build_final_header(self, cfg, &results, &outcome, guid);
        if cfg.pipable {
            out.write(hdr.to_disk().as_bytes())?;
        } else {
            out.write_at(0, hdr.to_disk().as_bytes())?;
        }
        let end = out.pos();
        drop(out);

        if !cfg.pipable {
            file.set_len(end).io_ctx(IoOp::Truncate)?;
        }
        if cfg.flags.contains(WriteFlags::FSYNC) {
            file.sync_all().io_ctx(IoOp::Write)?;
        }
        Ok(())
    }

    /// Commit pending changes back to the backing file, choosing among
    /// in-place append, temp-file rebuild and (opt-in) in-place
    /// compaction.
    pub fn overwrite(&mut self, flags: WriteFlags, num_threads: u32) -> Result<()> {
        let flags = flags.validated()?;
        if self.path.is_none() || self.file.is_none() {
            return Err(ErrorInner::NoFilename.into());
        }
        if self.readonly && !flags.contains(WriteFlags::IGNORE_READONLY) {
            return Err(ErrorInner::WimIsReadonly.into());
        }

        if flags.contains(WriteFlags::UNSAFE_COMPACT) {
            return self.overwrite_compact(flags, num_threads);
        }
        if !self.has_pending_changes(flags) {
            return Ok(());
        }
        if self.can_overwrite_inplace(flags) {
            return self.overwrite_inplace(flags, num_threads);
        }
        self.overwrite_via_tempfile(flags, num_threads)
    }

    /// Whether `overwrite` has anything to do. With no pending changes and
    /// no layout-changing flags, overwriting is a no-op on the file bytes.
    fn has_pending_changes(&self, flags: WriteFlags) -> bool {
        if self.images.iter().any(|i| i.modified) || self.deletion_occurred {
            return true;
        }
        if flags.contains(WriteFlags::REBUILD)
            || flags.contains(WriteFlags::RECOMPRESS)
            || flags.contains(WriteFlags::SOLID)
        {
            return true;
        }
        if flags.contains(WriteFlags::PIPABLE) != self.hdr.is_pipable
            && (flags.contains(WriteFlags::PIPABLE) || flags.contains(WriteFlags::NOT_PIPABLE))
        {
            return true;
        }
        if flags.contains(WriteFlags::CHECK_INTEGRITY) && self.integrity.is_none() {
            return true;
        }
        if flags.contains(WriteFlags::NO_CHECK_INTEGRITY) && self.integrity.is_some() {
            return true;
        }
        false
    }

    fn can_overwrite_inplace(&self, flags: WriteFlags) -> bool {
        if flags.contains(WriteFlags::REBUILD)
            || flags.contains(WriteFlags::RECOMPRESS)
            || flags.contains(WriteFlags::SOLID)
        {
            return false;
        }
        // Converting to or from the pipable layout moves everything.
        if flags.contains(WriteFlags::PIPABLE) != self.hdr.is_pipable {
            return false;
        }
        // The pipable layout cannot be appended to at all (its header
        // lives at the end of the file).
        if self.hdr.is_pipable {
            return false;
        }
        // Image deletion leaves stale data; without soft-delete the file
        // must be rebuilt to reclaim it.
        if self.deletion_occurred && !flags.contains(WriteFlags::SOFT_DELETE) {
            return false;
        }
        // Metadata entries select image indices by their offset order in
        // the blob table. Appending rewritten metadata keeps that order
        // only when the modified images are a suffix of the list, i.e.
        // they were newly added.
        let mut seen_modified = false;
        for entry in &self.images {
            if entry.modified {
                seen_modified = true;
            } else if seen_modified {
                return false;
            }
        }
        true
    }

    fn overwrite_config(&self, flags: WriteFlags, append: bool, num_threads: u32) -> WriteConfig {
        WriteConfig {
            flags,
            images: (1..=self.images.len() as u32).collect(),
            pipable: flags.contains(WriteFlags::PIPABLE) || (self.hdr.is_pipable && !flags.contains(WriteFlags::NOT_PIPABLE)),
            ctype: if flags.contains(WriteFlags::SOLID) {
                SOLID_COMPRESSION
            } else {
                self.hdr.compression
            },
            chunk_size: if flags.contains(WriteFlags::SOLID) {
                SOLID_CHUNK_SIZE
            } else {
                self.hdr.chunk_size
            },
            append,
            num_threads,
        }
    }

    fn overwrite_inplace(&mut self, flags: WriteFlags, num_threads: u32) -> Result<()> {
        let cfg = self.overwrite_config(flags, true, num_threads);
        let file = self.file.as_ref().expect("checked by overwrite");
        let orig_len = file.metadata().io_ctx(IoOp::Stat)?.len();
        lock_exclusive(file)?;

        let mut progress = self.progress.take();
        let result = self.overwrite_inplace_inner(&cfg, orig_len, &mut progress);
        self.progress = progress;

        let file = self.file.as_ref().expect("still open");
        if result.is_err() {
            // Best effort: drop everything appended and restore the old
            // header, leaving the previous container intact.
            let _ = file.set_len(orig_len);
            if let Ok(mut writer) = file.try_clone() {
                let _ = writer.write_all_at(0, self.hdr.to_disk().as_bytes());
            }
        }
        unlock(file);
        result
    }

    fn overwrite_inplace_inner(
        &mut self,
        cfg: &WriteConfig,
        orig_len: u64,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        let file = self.file.as_ref().expect("checked");
        let mut out_file = file.try_clone().io_ctx(IoOp::Open)?;

        // Mark the write in progress so an interrupted file is detected on
        // reopen; the rest of the old container stays valid until the
        // final header rewrite.
        let mut wip_hdr = self.hdr.clone();
        wip_hdr.flags |= hdr_flags::WRITE_IN_PROGRESS;
        out_file
            .write_all_at(0, wip_hdr.to_disk().as_bytes())
            .io_ctx(IoOp::Write)?;

        // New data goes after everything already in the file, so a crash
        // before the header rewrite leaves the old container readable.
        let out = OutDest::File { file: out_file, pos: orig_len };

        let old_integrity_end = self.hdr.blob_table.end_offset();

        let planned = plan_blobs(self, cfg)?;
        let mut ctx =
            WriteBlobsCtx::new(out, cfg.ctype, cfg.chunk_size, cfg.pipable, cfg.num_threads)?;
        let results = write_blobs(self, &mut ctx, cfg, planned, progress)?;
        let mut out = ctx.into_out();

        let old_integrity = self.integrity.take();
        let outcome = finalize_tables(
            self,
            &mut out,
            cfg,
            &results,
            &cfg.images,
            old_integrity.as_ref().map(|t| (t, old_integrity_end)),
            progress,
        )?;

        let hdr = build_final_header(self, cfg, &results, &outcome, self.hdr.guid);
        out.write_at(0, hdr.to_disk().as_bytes())?;
        let end = out.pos();
        drop(out);

        let file = self.file.as_ref().expect("still open");
        file.set_len(end).io_ctx(IoOp::Truncate)?;
        if cfg.flags.contains(WriteFlags::FSYNC) {
            file.sync_all().io_ctx(IoOp::Write)?;
        }

        self.apply_results(hdr, &results, &outcome);
        Ok(())
    }

    fn overwrite_via_tempfile(&mut self, flags: WriteFlags, num_threads: u32) -> Result<()> {
        let path = self.path.clone().expect("checked by overwrite");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::Builder::new()
            .prefix(".wim-tmp")
            .tempfile_in(dir)
            .io_ctx(IoOp::Open)?;

        let cfg = self.overwrite_config(flags, false, num_threads);
        let mut progress = self.progress.take();
        let result = self.write_fresh(tmp.as_file(), &cfg, self.hdr.guid, &mut progress);
        let result = result.and_then(|()| {
            fire(
                &mut progress,
                &Progress::Rename {
                    from: tmp.path(),
                    to: &path,
                },
            )
        });
        self.progress = progress;
        result?;

        // Close our handle before replacing the file, then adopt the new
        // one.
        self.file = None;
        self.reader.invalidate();
        tmp.persist(&path)
            .map_err(|e| ErrorInner::Io(IoOp::Rename, e.error))?;

        let progress = self.progress.take();
        let mut reopened = Wim::open(&path, crate::OpenFlags::default().write_access())?;
        reopened.progress = progress;
        *self = reopened;
        Ok(())
    }

    fn overwrite_compact(&mut self, flags: WriteFlags, num_threads: u32) -> Result<()> {
        let cfg = self.overwrite_config(flags, true, num_threads);
        if cfg.pipable {
            return Err(ErrorInner::Unsupported("compacting a pipable WIM").into());
        }
        let file = self.file.as_ref().expect("checked by overwrite");
        lock_exclusive(file)?;

        let mut progress = self.progress.take();
        let result = self.overwrite_compact_inner(&cfg, &mut progress);
        self.progress = progress;

        let file = self.file.as_ref().expect("still open");
        unlock(file);
        // A failed compaction may have destroyed the file; nothing to
        // restore. That is what makes it "unsafe".
        result
    }

    fn overwrite_compact_inner(
        &mut self,
        cfg: &WriteConfig,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        // Refuse overlapping resources before moving anything.
        let mut order: Vec<usize> = (0..self.resources.len()).collect();
        order.sort_by_key(|&i| self.resources[i].offset_in_wim);
        for pair in order.windows(2) {
            let a = &self.resources[pair[0]];
            let b = &self.resources[pair[1]];
            if a.offset_in_wim + a.size_in_wim > b.offset_in_wim {
                return Err(ErrorInner::ResourceOrder.into());
            }
        }

        let file = self.file.as_ref().expect("checked");
        let mut wip_hdr = self.hdr.clone();
        wip_hdr.flags |= hdr_flags::WRITE_IN_PROGRESS;
        let mut writer = file.try_clone().io_ctx(IoOp::Open)?;
        writer
            .write_all_at(0, wip_hdr.to_disk().as_bytes())
            .io_ctx(IoOp::Write)?;

        // Slide every kept resource down toward the header, in ascending
        // offset order so moves never overlap their own source.
        let mut cursor = HEADER_SIZE;
        let mut buf = vec![0u8; 1 << 20];
        for &i in &order {
            let (src_off, len) = {
                let r = &self.resources[i];
                (r.offset_in_wim, r.size_in_wim)
            };
            if src_off != cursor {
                debug_assert!(cursor < src_off);
                let mut done = 0u64;
                while done < len {
                    let take = ((len - done).min(buf.len() as u64)) as usize;
                    file.read_exact_at(src_off + done, &mut buf[..take])
                        .io_ctx(IoOp::Read)?;
                    writer
                        .write_all_at(cursor + done, &buf[..take])
                        .io_ctx(IoOp::Write)?;
                    done += take as u64;
                }
                self.resources[i].offset_in_wim = cursor;
            }
            cursor += len;
        }
        self.reader.invalidate();

        let out_file = file.try_clone().io_ctx(IoOp::Open)?;
        let out = OutDest::File { file: out_file, pos: cursor };

        let planned = plan_blobs(self, cfg)?;
        let mut ctx =
            WriteBlobsCtx::new(out, cfg.ctype, cfg.chunk_size, cfg.pipable, cfg.num_threads)?;
        let results = write_blobs(self, &mut ctx, cfg, planned, progress)?;
        let mut out = ctx.into_out();

        // Ranges moved, so the old integrity digests are useless.
        self.integrity = None;
        let outcome = finalize_tables(self, &mut out, cfg, &results, &cfg.images, None, progress)?;

        let hdr = build_final_header(self, cfg, &results, &outcome, self.hdr.guid);
        out.write_at(0, hdr.to_disk().as_bytes())?;
        let end = out.pos();
        drop(out);

        let file = self.file.as_ref().expect("still open");
        file.set_len(end).io_ctx(IoOp::Truncate)?;
        if cfg.flags.contains(WriteFlags::FSYNC) {
            file.sync_all().io_ctx(IoOp::Write)?;
        }

        self.apply_results(hdr, &results, &outcome);
        Ok(())
    }

    /// Fold a successful in-place write back into the in-memory state.
    fn apply_results(&mut self, hdr: WimHeader, results: &WriteResults, outcome: &FinalizeOutcome) {
        self.hdr = hdr;
        self.integrity = outcome.integrity.as_ref().map(|(t, _)| t.clone());

        // Solid groups become fresh resource descriptors.
        let mut group_res = Vec::with_capacity(results.solid_groups.len());
        for group in &results.solid_groups {
            self.resources.push(ResourceDescriptor::for_solid_resource(&group.reshdr));
            group_res.push(self.resources.len() - 1);
        }

        for blob in &results.blobs {
            let location = match blob.solid_group {
                Some(g) => BlobLocation::InWim {
                    res: group_res[g],
                    offset_in_res: blob.reshdr.offset_in_wim,
                },
                None => {
                    self.resources.push(ResourceDescriptor::from_reshdr(
                        &blob.reshdr,
                        self.hdr.compression,
                        self.hdr.chunk_size,
                    ));
                    BlobLocation::InWim {
                        res: self.resources.len() - 1,
                        offset_in_res: 0,
                    }
                }
            };
            if let Some(desc) = self.blob_table.get_mut(&blob.hash) {
                desc.location = location;
                desc.refcnt = desc.refcnt.max(blob.out_refcnt);
            }
        }

        for (entry, (hash, reshdr)) in self.images.iter_mut().zip(&results.metadata) {
            if entry.modified {
                self.resources.push(ResourceDescriptor::from_reshdr(
                    reshdr,
                    self.hdr.compression,
                    self.hdr.chunk_size,
                ));
                entry.metadata_res = Some(self.resources.len() - 1);
                entry.metadata_hash = *hash;
                entry.modified = false;
            }
        }
        self.deletion_occurred = false;
        self.reader.invalidate();
    }
}

fn lock_exclusive(file: &File) -> Result<()> {
    file.try_lock_exclusive().map_err(|err| {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            ErrorInner::AlreadyLocked.into()
        } else {
            crate::Error::from(ErrorInner::Io(IoOp::Open, err))
        }
    })
}

fn unlock(file: &File) {
    let _ = FileExt::unlock(file);
}
