//! The `Wim` handle: opening, creating, and editing containers in memory.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use positioned_io::ReadAt;
use zerocopy::{FromZeros, IntoBytes};

use crate::blob::{BlobDescriptor, BlobLocation, BlobTable, MetadataEntry, Sha1Hash};
use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::header::{
    hdr_flags, CompressionType, HeaderDisk, ResourceHeader, WimHeader, GUID_LEN, HEADER_SIZE,
};
use crate::integrity::{self, IntegrityTable};
use crate::metadata::{self, attributes, filetime_from_unix, Dentry, Image, NamedStream, StreamRef};
use crate::progress::{Progress, ProgressAction, ProgressFn};
use crate::resource::{ResourceDescriptor, ResourceReader};
use crate::scan::{StreamData, TreeEntry, TreeSource};
use crate::xml::{ImageInfo, XmlInfo};
use crate::{Images, OpenFlags};

/// One image as held by the handle.
pub(crate) struct ImageEntry {
    pub image: Image,
    /// Hash of the serialized metadata resource, when it is unmodified and
    /// backed by a resource in this WIM.
    pub metadata_hash: Sha1Hash,
    pub metadata_res: Option<usize>,
    pub modified: bool,
}

impl fmt::Debug for ImageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageEntry")
            .field("metadata_hash", &self.metadata_hash)
            .field("metadata_res", &self.metadata_res)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}

/// An open WIM container.
///
/// A handle is single-threaded; open several handles to work on several
/// containers concurrently.
pub struct Wim {
    pub(crate) path: Option<PathBuf>,
    pub(crate) file: Option<File>,
    pub(crate) hdr: WimHeader,
    pub(crate) blob_table: BlobTable,
    pub(crate) resources: Vec<ResourceDescriptor>,
    pub(crate) images: Vec<ImageEntry>,
    pub(crate) xml: XmlInfo,
    pub(crate) integrity: Option<IntegrityTable>,
    pub(crate) reader: ResourceReader,
    pub(crate) readonly: bool,
    pub(crate) deletion_occurred: bool,
    pub(crate) progress: Option<Box<ProgressFn>>,
}

impl fmt::Debug for Wim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wim")
            .field("path", &self.path)
            .field("compression", &self.hdr.compression)
            .field("chunk_size", &self.hdr.chunk_size)
            .field("image_count", &self.hdr.image_count)
            .field("blobs", &self.blob_table.len())
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

impl Wim {
    /// Create a new, empty, in-memory WIM using the default chunk size of
    /// the chosen compression format.
    pub fn create(compression: CompressionType) -> Result<Self> {
        Self::create_with_chunk_size(compression, compression.default_chunk_size())
    }

    pub fn create_with_chunk_size(compression: CompressionType, chunk_size: u32) -> Result<Self> {
        if !compression.is_valid_chunk_size(chunk_size) {
            return Err(ErrorInner::InvalidChunkSize(chunk_size).into());
        }
        Ok(Wim {
            path: None,
            file: None,
            hdr: WimHeader::new(compression, chunk_size, rand::random()),
            blob_table: BlobTable::new(),
            resources: Vec::new(),
            images: Vec::new(),
            xml: XmlInfo::default(),
            integrity: None,
            reader: ResourceReader::new(),
            readonly: false,
            deletion_occurred: false,
            progress: None,
        })
    }

    /// Open an existing WIM file.
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let want_write = flags.contains(OpenFlags::WRITE_ACCESS);
        let file = match OpenOptions::new().read(true).write(want_write).open(&path) {
            Ok(f) => f,
            Err(err) if want_write && err.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ErrorInner::WimIsReadonly.into());
            }
            Err(err) => return Err(ErrorInner::Io(IoOp::Open, err).into()),
        };
        let file_len = file.metadata().io_ctx(IoOp::Stat)?.len();
        if file_len < HEADER_SIZE {
            return Err(ErrorInner::NotAWim.into());
        }

        let mut disk = HeaderDisk::new_zeroed();
        file.read_exact_at(0, disk.as_mut_bytes()).io_ctx(IoOp::Read)?;
        let mut hdr = WimHeader::parse(&disk)?;

        if hdr.is_pipable {
            // The leading header of a pipable WIM is a placeholder written
            // before the sizes were known; the trailing copy is
            // authoritative.
            if file_len < 2 * HEADER_SIZE {
                return Err(ErrorInner::InvalidPipableWim("file too short").into());
            }
            file.read_exact_at(file_len - HEADER_SIZE, disk.as_mut_bytes())
                .io_ctx(IoOp::Read)?;
            hdr = WimHeader::parse(&disk)
                .map_err(|_| ErrorInner::InvalidPipableWim("bad trailing header"))?;
            if !hdr.is_pipable {
                return Err(ErrorInner::InvalidPipableWim("trailing header not pipable").into());
            }
        }
        if hdr.flags & hdr_flags::WRITE_IN_PROGRESS != 0 {
            return Err(ErrorInner::InvalidHeader("a write to this file was interrupted").into());
        }
        if hdr.total_parts != 1 && !flags.contains(OpenFlags::SPLIT_OK) {
            return Err(ErrorInner::SplitUnsupported.into());
        }

        let readonly = hdr.flags & hdr_flags::READONLY != 0 || hdr.total_parts != 1;
        if want_write && readonly {
            return Err(ErrorInner::WimIsReadonly.into());
        }

        let mut this = Wim {
            path: Some(path),
            file: Some(file),
            hdr,
            blob_table: BlobTable::new(),
            resources: Vec::new(),
            images: Vec::new(),
            xml: XmlInfo::default(),
            integrity: None,
            reader: ResourceReader::new(),
            readonly,
            deletion_occurred: false,
            progress: None,
        };
        this.load_tables(flags)?;
        Ok(this)
    }

    fn load_tables(&mut self, flags: OpenFlags) -> Result<()> {
        // Blob table.
        let metadata_entries: Vec<MetadataEntry>;
        if self.hdr.blob_table.size_in_wim != 0 {
            if self.hdr.blob_table.uncompressed_size > 1 << 30 {
                return Err(ErrorInner::InvalidBlobTableEntry("blob table too large").into());
            }
            let raw = self.read_whole_resource(self.hdr.blob_table)?;
            let mut resources = Vec::new();
            let (table, metadata) = BlobTable::parse(
                &raw,
                self.hdr.part_number,
                self.hdr.chunk_size,
                self.hdr.compression,
                &mut resources,
            )?;
            if self.hdr.is_pipable {
                for r in &mut resources {
                    r.is_pipable = true;
                }
            }
            self.blob_table = table;
            self.resources = resources;
            metadata_entries = metadata;
        } else {
            metadata_entries = Vec::new();
        }

        // XML data.
        if self.hdr.xml_data.size_in_wim != 0 {
            let raw = self.read_whole_resource(self.hdr.xml_data)?;
            self.xml = XmlInfo::parse(&raw)?;
        }

        // Integrity table.
        if self.hdr.integrity_table.size_in_wim != 0 {
            let raw = self.read_whole_resource(self.hdr.integrity_table)?;
            self.integrity = Some(IntegrityTable::parse(&raw)?);
        }
        if flags.contains(OpenFlags::CHECK_INTEGRITY) {
            self.verify_integrity()?;
        }

        // Image metadata, present only in part 1 of a spanned set.
        let has_metadata = self.hdr.part_number == 1
            && self.hdr.flags & hdr_flags::RESOURCE_ONLY == 0;
        if has_metadata {
            if metadata_entries.len() as u32 != self.hdr.image_count
                || self.xml.images.len() as u32 != self.hdr.image_count
            {
                return Err(ErrorInner::ImageCount.into());
            }
            for entry in &metadata_entries {
                let res = &self.resources[entry.res];
                if res.uncompressed_size > 1 << 30 {
                    return Err(
                        ErrorInner::InvalidMetadataResource("metadata resource too large").into(),
                    );
                }
                let mut raw = vec![0u8; res.uncompressed_size as usize];
                self.reader.read_range(
                    self.file.as_ref(),
                    entry.res,
                    &mut self.resources[entry.res],
                    0,
                    &mut raw,
                )?;
                if Sha1Hash::of(&raw) != entry.hash {
                    return Err(ErrorInner::InvalidResourceHash.into());
                }
                let image = metadata::decode(&raw)?;
                self.images.push(ImageEntry {
                    image,
                    metadata_hash: entry.hash,
                    metadata_res: Some(entry.res),
                    modified: false,
                });
            }
        }

        if self.hdr.boot_idx > self.hdr.image_count {
            return Err(ErrorInner::InvalidHeader("boot index out of range").into());
        }
        Ok(())
    }

    /// Read a whole top-level resource (blob table, XML data, integrity
    /// table) into memory.
    fn read_whole_resource(&mut self, reshdr: ResourceHeader) -> Result<Vec<u8>> {
        let mut res =
            ResourceDescriptor::from_reshdr(&reshdr, self.hdr.compression, self.hdr.chunk_size);
        let mut out = vec![0u8; reshdr.uncompressed_size as usize];
        self.reader
            .read_range(self.file.as_ref(), usize::MAX, &mut res, 0, &mut out)?;
        // These one-off reads share the index usize::MAX; drop whatever
        // they may have cached so they cannot shadow each other.
        self.reader.invalidate();
        Ok(out)
    }

    /// Verify the stored integrity table, if any.
    pub fn verify_integrity(&mut self) -> Result<()> {
        let Some(table) = &self.integrity else {
            return Ok(());
        };
        let file = self.file.as_ref().ok_or(ErrorInner::NoFilename)?;
        let end = self.hdr.blob_table.end_offset();
        let mut progress = self.progress.take();
        let result = integrity::verify(file, HEADER_SIZE, end, table, &mut |done, total| {
            fire(&mut progress, &Progress::VerifyIntegrity {
                total_chunks: total,
                completed_chunks: done,
            })
        });
        self.progress = progress;
        result
    }

    // Accessors.

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn image_count(&self) -> u32 {
        self.hdr.image_count
    }

    pub fn guid(&self) -> [u8; GUID_LEN] {
        self.hdr.guid
    }

    pub fn compression_type(&self) -> CompressionType {
        self.hdr.compression
    }

    pub fn chunk_size(&self) -> u32 {
        self.hdr.chunk_size
    }

    pub fn is_pipable(&self) -> bool {
        self.hdr.is_pipable
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// 1-based boot image index; 0 means none.
    pub fn boot_index(&self) -> u32 {
        self.hdr.boot_idx
    }

    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index > self.hdr.image_count {
            return Err(ErrorInner::InvalidImage(index).into());
        }
        self.hdr.boot_idx = index;
        Ok(())
    }

    /// Register the progress callback used by long operations.
    pub fn set_progress(&mut self, cb: Box<ProgressFn>) {
        self.progress = Some(cb);
    }

    pub(crate) fn image_entry(&self, index: u32) -> Result<&ImageEntry> {
        if index == 0 || index > self.images.len() as u32 {
            return Err(ErrorInner::InvalidImage(index).into());
        }
        Ok(&self.images[index as usize - 1])
    }

    /// The in-memory tree of an image (1-based).
    pub fn image(&self, index: u32) -> Result<&Image> {
        Ok(&self.image_entry(index)?.image)
    }

    pub fn image_name(&self, index: u32) -> Result<&str> {
        self.image_entry(index)?;
        Ok(&self.xml.images[index as usize - 1].name)
    }

    pub fn image_description(&self, index: u32) -> Result<Option<&str>> {
        self.image_entry(index)?;
        Ok(self.xml.images[index as usize - 1].description.as_deref())
    }

    pub fn set_image_name(&mut self, index: u32, name: &str) -> Result<()> {
        self.image_entry(index)?;
        if !name.is_empty() {
            if let Some(existing) = self.image_index_by_name(name) {
                if existing != index {
                    return Err(ErrorInner::ImageNameCollision(name.to_owned()).into());
                }
            }
        }
        self.xml.images[index as usize - 1].name = name.to_owned();
        Ok(())
    }

    pub fn set_image_description(&mut self, index: u32, desc: Option<&str>) -> Result<()> {
        self.image_entry(index)?;
        self.xml.images[index as usize - 1].description = desc.map(str::to_owned);
        Ok(())
    }

    /// Case-insensitive image name lookup.
    pub fn image_index_by_name(&self, name: &str) -> Option<u32> {
        self.xml
            .images
            .iter()
            .position(|img| metadata::names_equal(&img.name, name))
            .map(|i| i as u32 + 1)
    }

    /// Resolve a 1-based index or image name.
    pub fn resolve_image(&self, name_or_index: &str) -> Result<u32> {
        if let Ok(index) = name_or_index.parse::<u32>() {
            self.image_entry(index)?;
            return Ok(index);
        }
        self.image_index_by_name(name_or_index)
            .ok_or_else(|| ErrorInner::InvalidImage(0).into())
    }

    pub(crate) fn resolve_images(&self, images: Images) -> Result<Vec<u32>> {
        match images {
            Images::All => Ok((1..=self.images.len() as u32).collect()),
            Images::One(i) => {
                self.image_entry(i)?;
                Ok(vec![i])
            }
        }
    }

    // Image editing.

    /// Capture a new image from `source` and append it. Returns the new
    /// image's 1-based index.
    pub fn add_image(&mut self, source: &mut dyn TreeSource, name: &str) -> Result<u32> {
        self.check_writable()?;
        if !name.is_empty() && self.image_index_by_name(name).is_some() {
            return Err(ErrorInner::ImageNameCollision(name.to_owned()).into());
        }

        let mut progress = self.progress.take();
        let result = self.add_image_inner(source, name, &mut progress);
        self.progress = progress;
        result
    }

    fn add_image_inner(
        &mut self,
        source: &mut dyn TreeSource,
        name: &str,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<u32> {
        let description = source.describe();
        fire(progress, &Progress::ScanBegin { source: &description })?;
        let tree = source.capture()?;

        let mut image = Image::new();
        let mut entries = 0u64;
        let mut security_ids: Vec<Vec<u8>> = Vec::new();
        image.root = self.convert_entry(tree, "", true, &mut image.security, &mut security_ids, &mut entries, progress)?;
        fire(progress, &Progress::ScanEnd { entries })?;

        let (dir_count, file_count) = image.count_entries();
        let total_bytes = self.image_total_bytes(&image);
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| filetime_from_unix(d.as_secs()));

        self.images.push(ImageEntry {
            image,
            metadata_hash: Sha1Hash::ZERO,
            metadata_res: None,
            modified: true,
        });
        self.xml.images.push(ImageInfo {
            name: name.to_owned(),
            description: None,
            dir_count,
            file_count,
            total_bytes,
            creation_time: now,
            last_modification_time: now,
        });
        self.hdr.image_count += 1;
        Ok(self.hdr.image_count)
    }

    #[allow(clippy::too_many_arguments)]
    fn convert_entry(
        &mut self,
        entry: TreeEntry,
        parent_path: &str,
        is_root: bool,
        security: &mut metadata::SecurityData,
        security_ids: &mut Vec<Vec<u8>>,
        entries: &mut u64,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<Dentry> {
        let path = if is_root {
            String::from("/")
        } else {
            format!("{}/{}", parent_path.trim_end_matches('/'), entry.name)
        };
        fire(progress, &Progress::ScanDentry { path: &path })?;
        *entries += 1;

        let mut dentry = if entry.is_directory {
            Dentry::new_directory(if is_root { String::new() } else { entry.name.clone() })
        } else {
            Dentry::new_file(entry.name.clone())
        };
        if let Some(attrs) = entry.attributes {
            dentry.attributes = if entry.is_directory {
                attrs | attributes::DIRECTORY
            } else {
                attrs & !attributes::DIRECTORY
            };
        }
        dentry.creation_time = entry.creation_time;
        dentry.last_access_time = entry.last_access_time;
        dentry.last_write_time = entry.last_write_time;

        if let Some(sd) = entry.security_descriptor {
            let id = match security_ids.iter().position(|s| *s == sd) {
                Some(i) => i as u32,
                None => {
                    security_ids.push(sd.clone());
                    security.descriptors.push(sd);
                    security.descriptors.len() as u32 - 1
                }
            };
            dentry.security_id = Some(id);
        }

        for spec in entry.streams {
            let stream = self.register_stream(&spec.data, spec.known_hash)?;
            if spec.name.is_empty() {
                dentry.unnamed_stream = stream;
            } else {
                dentry.named_streams.push(NamedStream {
                    name: spec.name,
                    stream,
                });
            }
        }

        for child in entry.children {
            let converted =
                self.convert_entry(child, &path, false, security, security_ids, entries, progress)?;
            dentry.add_child(converted)?;
        }
        Ok(dentry)
    }

    fn register_stream(
        &mut self,
        data: &StreamData,
        known_hash: Option<Sha1Hash>,
    ) -> Result<StreamRef> {
        let size = data.size()?;
        if size == 0 {
            return Ok(StreamRef::Empty);
        }
        let location = match data {
            StreamData::File(p) => BlobLocation::File(p.clone()),
            StreamData::Bytes(b) => BlobLocation::Buffer(b.clone()),
        };
        match known_hash {
            Some(hash) => {
                self.blob_table.insert_or_merge(
                    hash,
                    BlobDescriptor {
                        size,
                        refcnt: 1,
                        out_refcnt: 0,
                        location,
                    },
                );
                Ok(StreamRef::Hash(hash))
            }
            None => {
                let id = self.blob_table.add_unhashed(size, location);
                self.blob_table
                    .unhashed_mut(id)
                    .expect("just added")
                    .refcnt = 1;
                Ok(StreamRef::Unhashed(id))
            }
        }
    }

    /// Delete an image (1-based), dropping its blob references.
    pub fn delete_image(&mut self, index: u32) -> Result<()> {
        self.check_writable()?;
        self.image_entry(index)?;

        let entry = self.images.remove(index as usize - 1);
        let mut to_unref = Vec::new();
        entry.image.for_each_stream(&mut |s| to_unref.push(*s));
        for stream in to_unref {
            match stream {
                StreamRef::Empty => {}
                StreamRef::Hash(h) => {
                    if let Some(blob) = self.blob_table.get_mut(&h) {
                        blob.refcnt = blob.refcnt.saturating_sub(1);
                    }
                }
                StreamRef::Unhashed(id) => {
                    if let Some(h) = self.blob_table.resolved_hash(id) {
                        if let Some(blob) = self.blob_table.get_mut(&h) {
                            blob.refcnt = blob.refcnt.saturating_sub(1);
                        }
                    } else if let Some(u) = self.blob_table.unhashed_mut(id) {
                        u.refcnt = u.refcnt.saturating_sub(1);
                    }
                }
            }
        }

        self.xml.images.remove(index as usize - 1);
        self.hdr.image_count -= 1;
        if self.hdr.boot_idx == index {
            self.hdr.boot_idx = 0;
        } else if self.hdr.boot_idx > index {
            self.hdr.boot_idx -= 1;
        }
        self.deletion_occurred = true;
        Ok(())
    }

    /// Make sure a solid resource's own header has been read.
    pub(crate) fn ensure_solid_loaded(&mut self, res: usize) -> Result<()> {
        self.reader
            .load_solid_header(self.file.as_ref(), &mut self.resources[res])
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ErrorInner::WimIsReadonly.into());
        }
        Ok(())
    }

    // Blob access.

    /// All hashes currently in the blob table.
    pub fn blob_hashes(&self) -> Vec<Sha1Hash> {
        let mut v: Vec<Sha1Hash> = self.blob_table.hashes().copied().collect();
        v.sort();
        v
    }

    /// The size of the blob with the given hash.
    pub fn blob_size(&self, hash: &Sha1Hash) -> Result<u64> {
        self.blob_table
            .get(hash)
            .map(|b| b.size)
            .ok_or_else(|| ErrorInner::ResourceNotFound(hash.to_string()).into())
    }

    /// Stream a blob's bytes to `sink`, verifying the SHA-1 on the way.
    pub fn read_blob_with(
        &mut self,
        hash: &Sha1Hash,
        sink: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let blob = self
            .blob_table
            .get(hash)
            .cloned()
            .ok_or_else(|| ErrorInner::ResourceNotFound(hash.to_string()))?;

        let mut hasher = crate::blob::BlobHasher::new();
        match &blob.location {
            BlobLocation::Buffer(buf) => {
                hasher.update(buf);
                sink(buf)?;
            }
            BlobLocation::File(path) => {
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
            BlobLocation::InWim { res, offset_in_res } => {
                let step = 1 << 17;
                let mut buf = vec![0u8; step];
                let mut done = 0u64;
                while done < blob.size {
                    let take = ((blob.size - done).min(step as u64)) as usize;
                    self.reader.read_range(
                        self.file.as_ref(),
                        *res,
                        &mut self.resources[*res],
                        offset_in_res + done,
                        &mut buf[..take],
                    )?;
                    hasher.update(&buf[..take]);
                    sink(&buf[..take])?;
                    done += take as u64;
                }
            }
        }

        if hasher.finalize() != *hash {
            return Err(ErrorInner::InvalidResourceHash.into());
        }
        Ok(())
    }

    /// Read a whole blob into memory.
    pub fn read_blob(&mut self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.blob_size(hash)? as usize);
        self.read_blob_with(hash, &mut |chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(out)
    }

    fn image_total_bytes(&self, image: &Image) -> u64 {
        let mut total = 0u64;
        image.for_each_stream(&mut |s| {
            total += match s {
                StreamRef::Empty => 0,
                StreamRef::Hash(h) => self.blob_table.get(h).map_or(0, |b| b.size),
                StreamRef::Unhashed(id) => self.blob_table.unhashed(*id).map_or(0, |u| u.size),
            };
        });
        total
    }

    /// Iterate the directory tree of an image, depth-first. The callback
    /// may abort the walk.
    pub fn iterate_dir_tree(
        &self,
        image: u32,
        path: &str,
        recursive: bool,
        cb: &mut dyn FnMut(&IterEntry<'_>) -> ProgressAction,
    ) -> Result<()> {
        let img = self.image(image)?;
        let start = img
            .lookup(path)
            .ok_or(ErrorInner::InvalidParam("path does not exist in the image"))?;

        fn walk(
            d: &Dentry,
            path: &str,
            depth: u32,
            recursive: bool,
            cb: &mut dyn FnMut(&IterEntry<'_>) -> ProgressAction,
        ) -> Result<()> {
            let entry = IterEntry { path: path.to_owned(), dentry: d, depth };
            if cb(&entry) == ProgressAction::Abort {
                return Err(ErrorInner::AbortedByProgress.into());
            }
            if depth == 0 || recursive {
                for c in &d.children {
                    let child_path = format!("{}/{}", path.trim_end_matches('/'), c.name);
                    walk(c, &child_path, depth + 1, recursive, cb)?;
                }
            }
            Ok(())
        }

        let norm = if path.is_empty() { "/" } else { path };
        walk(start, norm, 0, recursive, cb)
    }
}

/// One entry yielded by [`Wim::iterate_dir_tree`].
#[derive(Debug)]
pub struct IterEntry<'a> {
    /// Full path within the image, `/`-separated.
    pub path: String,
    pub dentry: &'a Dentry,
    /// 0 for the starting entry.
    pub depth: u32,
}

/// Invoke the progress callback, mapping an abort request to an error.
pub(crate) fn fire(
    progress: &mut Option<Box<ProgressFn>>,
    info: &Progress<'_>,
) -> Result<()> {
    if let Some(cb) = progress {
        if cb(info) == ProgressAction::Abort {
            return Err(ErrorInner::AbortedByProgress.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::MemTreeSource;

    #[test]
    fn create_and_add_image() {
        let mut w = Wim::create(CompressionType::Lzx).unwrap();
        assert_eq!(w.image_count(), 0);

        let mut src = MemTreeSource::new();
        src.add_file("readme.txt", b"hello\n".to_vec());
        src.add_file("sub/notes.txt", b"hi\n".to_vec());
        src.add_file("sub/empty.bin", Vec::new());
        let idx = w.add_image(&mut src, "A").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(w.image_count(), 1);
        assert_eq!(w.image_name(1).unwrap(), "A");

        let img = w.image(1).unwrap();
        let readme = img.lookup("/readme.txt").unwrap();
        assert!(matches!(readme.unnamed_stream, StreamRef::Unhashed(_)));
        let empty = img.lookup("/sub/empty.bin").unwrap();
        assert_eq!(empty.unnamed_stream, StreamRef::Empty);

        // Name collisions are case-insensitive.
        let mut src2 = MemTreeSource::new();
        let err = w.add_image(&mut src2, "a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ImageNameCollision);
    }

    #[test]
    fn delete_image_adjusts_boot_and_refs() {
        let mut w = Wim::create(CompressionType::None).unwrap();
        let mut src = MemTreeSource::new();
        src.add_file("x", b"shared".to_vec());
        w.add_image(&mut src, "one").unwrap();
        let mut src = MemTreeSource::new();
        src.add_file("y", b"other".to_vec());
        w.add_image(&mut src, "two").unwrap();
        w.set_boot_index(2).unwrap();

        w.delete_image(1).unwrap();
        assert_eq!(w.image_count(), 1);
        assert_eq!(w.boot_index(), 1);
        assert_eq!(w.image_name(1).unwrap(), "two");
        assert!(w.deletion_occurred);
    }

    #[test]
    fn resolve_image_by_name_or_index() {
        let mut w = Wim::create(CompressionType::None).unwrap();
        let mut src = MemTreeSource::new();
        src.add_file("f", b"d".to_vec());
        w.add_image(&mut src, "Alpha").unwrap();
        assert_eq!(w.resolve_image("1").unwrap(), 1);
        assert_eq!(w.resolve_image("alpha").unwrap(), 1);
        assert!(w.resolve_image("2").is_err());
        assert!(w.resolve_image("beta").is_err());
    }

    #[test]
    fn iterate_tree_respects_abort() {
        let mut w = Wim::create(CompressionType::None).unwrap();
        let mut src = MemTreeSource::new();
        src.add_file("a/b.txt", b"1".to_vec());
        src.add_file("c.txt", b"2".to_vec());
        w.add_image(&mut src, "img").unwrap();

        let mut seen = Vec::new();
        w.iterate_dir_tree(1, "/", true, &mut |e| {
            seen.push(e.path.clone());
            ProgressAction::Continue
        })
        .unwrap();
        assert!(seen.contains(&"/a/b.txt".to_string()));
        assert!(seen.contains(&"/c.txt".to_string()));

        let err = w
            .iterate_dir_tree(1, "/", true, &mut |_| ProgressAction::Abort)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::AbortedByProgress);
    }
}
