//! Image metadata: security descriptors and the directory-entry tree.
//!
//! Each image's metadata resource starts with a table of security
//! descriptors, followed by the root directory entry and, at the offsets
//! the entries name, the child lists of every directory. Entries and named
//! stream entries are 8-byte aligned; a zero length terminates each child
//! list.

use std::collections::VecDeque;
use std::fmt;

use zerocopy::{little_endian as le, FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::blob::{BlobTable, Sha1Hash};
use crate::error::{ErrorInner, Result};

/// `FILE_ATTRIBUTE_*` bits carried per dentry.
pub mod attributes {
    pub const READONLY: u32 = 0x0001;
    pub const HIDDEN: u32 = 0x0002;
    pub const SYSTEM: u32 = 0x0004;
    pub const DIRECTORY: u32 = 0x0010;
    pub const ARCHIVE: u32 = 0x0020;
    pub const NORMAL: u32 = 0x0080;
    pub const REPARSE_POINT: u32 = 0x0400;
}

/// Seconds-based Unix time to Windows FILETIME (100ns since 1601).
#[must_use]
pub fn filetime_from_unix(secs: u64) -> u64 {
    secs * 10_000_000 + 116_444_736_000_000_000
}

/// What a stream's content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRef {
    /// The empty stream; stored as the all-zero digest, owns no blob.
    Empty,
    /// A blob known by hash.
    Hash(Sha1Hash),
    /// A not-yet-hashed blob registered in the blob table.
    Unhashed(usize),
}

impl StreamRef {
    pub(crate) fn on_disk_hash(self, blob_table: &BlobTable) -> Result<Sha1Hash> {
        match self {
            StreamRef::Empty => Ok(Sha1Hash::ZERO),
            StreamRef::Hash(hash) => Ok(hash),
            StreamRef::Unhashed(id) => blob_table
                .resolved_hash(id)
                .ok_or_else(|| ErrorInner::InvalidParam("unhashed blob not yet written").into()),
        }
    }
}

/// A named (alternate) data stream.
#[derive(Debug, Clone)]
pub struct NamedStream {
    pub name: String,
    pub stream: StreamRef,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct Dentry {
    /// Empty only for the root.
    pub name: String,
    pub short_name: String,
    pub attributes: u32,
    /// Index into the image's security descriptor table.
    pub security_id: Option<u32>,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
    /// Set only when `attributes` has the reparse-point bit.
    pub reparse_tag: u32,
    pub hard_link_group_id: u64,
    pub unnamed_stream: StreamRef,
    pub named_streams: Vec<NamedStream>,
    pub children: Vec<Dentry>,
}

impl Dentry {
    pub fn new_file(name: impl Into<String>) -> Self {
        Dentry {
            name: name.into(),
            short_name: String::new(),
            attributes: attributes::NORMAL,
            security_id: None,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            reparse_tag: 0,
            hard_link_group_id: 0,
            unnamed_stream: StreamRef::Empty,
            named_streams: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn new_directory(name: impl Into<String>) -> Self {
        Dentry {
            attributes: attributes::DIRECTORY,
            ..Self::new_file(name)
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & attributes::DIRECTORY != 0
    }

    /// Case-insensitive (but case-preserving) child lookup.
    pub fn child(&self, name: &str) -> Option<&Dentry> {
        self.children
            .iter()
            .find(|c| names_equal(&c.name, name))
    }

    /// Add a child, rejecting case-insensitive name collisions.
    pub fn add_child(&mut self, child: Dentry) -> Result<&mut Dentry> {
        if !self.is_directory() {
            return Err(ErrorInner::InvalidParam("parent is not a directory").into());
        }
        if child.name.is_empty() {
            return Err(ErrorInner::InvalidParam("dentry name is empty").into());
        }
        if self.child(&child.name).is_some() {
            return Err(ErrorInner::InvalidParam("duplicate name in directory").into());
        }
        self.children.push(child);
        Ok(self.children.last_mut().expect("just pushed"))
    }
}

/// WIM name equality: case-insensitive, case-preserving.
pub(crate) fn names_equal(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// The security descriptor table of one image. Descriptors are opaque
/// self-relative `SECURITY_DESCRIPTOR` blobs.
#[derive(Debug, Clone, Default)]
pub struct SecurityData {
    pub descriptors: Vec<Vec<u8>>,
}

/// The in-memory form of one image.
#[derive(Debug, Clone)]
pub struct Image {
    pub root: Dentry,
    pub security: SecurityData,
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

impl Image {
    pub fn new() -> Self {
        Image {
            root: Dentry::new_directory(""),
            security: SecurityData::default(),
        }
    }

    /// Look up a dentry by `/`-separated path; `/` or the empty string is
    /// the root.
    pub fn lookup(&self, path: &str) -> Option<&Dentry> {
        let mut cur = &self.root;
        for part in path.split(['/', '\\']).filter(|p| !p.is_empty()) {
            cur = cur.child(part)?;
        }
        Some(cur)
    }

    /// Visit every stream of every dentry.
    pub fn for_each_stream(&self, f: &mut dyn FnMut(&StreamRef)) {
        fn walk(d: &Dentry, f: &mut dyn FnMut(&StreamRef)) {
            f(&d.unnamed_stream);
            for s in &d.named_streams {
                f(&s.stream);
            }
            for c in &d.children {
                walk(c, f);
            }
        }
        walk(&self.root, f);
    }

    /// (directory count, file count) as recorded in the XML data.
    pub fn count_entries(&self) -> (u64, u64) {
        fn walk(d: &Dentry, dirs: &mut u64, files: &mut u64) {
            for c in &d.children {
                if c.is_directory() {
                    *dirs += 1;
                } else {
                    *files += 1;
                }
                walk(c, dirs, files);
            }
        }
        let (mut dirs, mut files) = (0, 0);
        walk(&self.root, &mut dirs, &mut files);
        (dirs, files)
    }
}

const DENTRY_DISK_SIZE: usize = 102;
const STREAM_ENTRY_DISK_SIZE: usize = 38;
const NO_SECURITY_ID: u32 = u32::MAX;

#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct DentryDisk {
    length: le::U64,
    attributes: le::U32,
    security_id: le::U32,
    subdir_offset: le::U64,
    unused_1: le::U64,
    unused_2: le::U64,
    creation_time: le::U64,
    last_access_time: le::U64,
    last_write_time: le::U64,
    default_hash: [u8; 20],
    rp_unknown_1: le::U32,
    /// Reparse tag, or the low half of the hard link group id.
    tag_or_link_low: le::U32,
    /// Reparse reserved fields, or the high half of the link group id.
    rp_or_link_high: le::U32,
    num_named_streams: le::U16,
    short_name_nbytes: le::U16,
    file_name_nbytes: le::U16,
}

const _: () = assert!(size_of::<DentryDisk>() == DENTRY_DISK_SIZE);

#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct StreamEntryDisk {
    length: le::U64,
    reserved: le::U64,
    hash: [u8; 20],
    stream_name_nbytes: le::U16,
}

const _: () = assert!(size_of::<StreamEntryDisk>() == STREAM_ENTRY_DISK_SIZE);

impl fmt::Debug for DentryDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DentryDisk")
            .field("length", &self.length.get())
            .field("attributes", &format_args!("{:#x}", self.attributes.get()))
            .field("subdir_offset", &self.subdir_offset.get())
            .finish_non_exhaustive()
    }
}

fn align8(v: u64) -> u64 {
    (v + 7) & !7
}

fn pad8(buf: &mut Vec<u8>) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

fn utf16le_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn utf16le_parse(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ErrorInner::Encoding("odd UTF-16 byte length").into());
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| ErrorInner::Encoding("unpaired UTF-16 surrogate").into())
}

/// Serialize an image to the payload of its metadata resource.
pub fn encode(image: &Image, blob_table: &BlobTable) -> Result<Vec<u8>> {
    let mut buf = encode_security(&image.security);
    pad8(&mut buf);

    // Write the root, then lay out each directory's child list (plus its
    // zero terminator) in breadth-first order, patching subdir offsets as
    // the lists land.
    let mut pending: VecDeque<(usize, &Dentry)> = VecDeque::new();

    let patch = write_dentry(&mut buf, &image.root, blob_table)?;
    pending.push_back((patch, &image.root));

    while let Some((patch, dir)) = pending.pop_front() {
        let list_start = buf.len() as u64;
        buf[patch..patch + 8].copy_from_slice(&list_start.to_le_bytes());
        for child in &dir.children {
            let p = write_dentry(&mut buf, child, blob_table)?;
            if child.is_directory() {
                pending.push_back((p, child));
            }
        }
        buf.extend_from_slice(&[0u8; 8]);
    }

    Ok(buf)
}

/// Append one dentry (with its named stream entries); returns the buffer
/// position of its `subdir_offset` field for later patching. Non-directory
/// entries keep the zero already written there.
fn write_dentry(buf: &mut Vec<u8>, d: &Dentry, blob_table: &BlobTable) -> Result<usize> {
    let fname = utf16le_bytes(&d.name);
    let sname = utf16le_bytes(&d.short_name);
    let length = DENTRY_DISK_SIZE
        + if fname.is_empty() { 0 } else { fname.len() + 2 }
        + if sname.is_empty() { 0 } else { sname.len() + 2 };

    let mut disk = DentryDisk::new_zeroed();
    disk.length = (length as u64).into();
    disk.attributes = d.attributes.into();
    disk.security_id = d.security_id.unwrap_or(NO_SECURITY_ID).into();
    disk.creation_time = d.creation_time.into();
    disk.last_access_time = d.last_access_time.into();
    disk.last_write_time = d.last_write_time.into();
    disk.default_hash = d.unnamed_stream.on_disk_hash(blob_table)?.0;
    if d.attributes & attributes::REPARSE_POINT != 0 {
        disk.tag_or_link_low = d.reparse_tag.into();
    } else {
        disk.tag_or_link_low = (d.hard_link_group_id as u32).into();
        disk.rp_or_link_high = ((d.hard_link_group_id >> 32) as u32).into();
    }
    disk.num_named_streams = (d.named_streams.len() as u16).into();
    disk.short_name_nbytes = (sname.len() as u16).into();
    disk.file_name_nbytes = (fname.len() as u16).into();

    let start = buf.len();
    buf.extend_from_slice(disk.as_bytes());
    if !fname.is_empty() {
        buf.extend_from_slice(&fname);
        buf.extend_from_slice(&[0, 0]);
    }
    if !sname.is_empty() {
        buf.extend_from_slice(&sname);
        buf.extend_from_slice(&[0, 0]);
    }
    pad8(buf);

    for stream in &d.named_streams {
        let name = utf16le_bytes(&stream.name);
        let length = STREAM_ENTRY_DISK_SIZE + name.len() + 2;
        let mut entry = StreamEntryDisk::new_zeroed();
        entry.length = (length as u64).into();
        entry.hash = stream.stream.on_disk_hash(blob_table)?.0;
        entry.stream_name_nbytes = (name.len() as u16).into();
        buf.extend_from_slice(entry.as_bytes());
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&[0, 0]);
        pad8(buf);
    }

    Ok(start + 16) // offset of `subdir_offset` within DentryDisk
}

fn encode_security(sec: &SecurityData) -> Vec<u8> {
    let mut buf = Vec::new();
    let total: u64 = 8
        + 8 * sec.descriptors.len() as u64
        + sec.descriptors.iter().map(|d| d.len() as u64).sum::<u64>();
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&(sec.descriptors.len() as u32).to_le_bytes());
    for d in &sec.descriptors {
        buf.extend_from_slice(&(d.len() as u64).to_le_bytes());
    }
    for d in &sec.descriptors {
        buf.extend_from_slice(d);
    }
    buf
}

/// Parse a metadata resource payload.
pub fn decode(data: &[u8]) -> Result<Image> {
    let (security, sec_len) = parse_security(data)?;
    let root_offset = align8(sec_len);
    let (mut root, root_span) = parse_dentry(data, root_offset)?;
    if !root.name.is_empty() || !root.is_directory() {
        return Err(ErrorInner::InvalidMetadataResource("root entry must be an unnamed directory").into());
    }
    let subdir = root_subdir(data, root_offset)?;
    if subdir != 0 {
        parse_children(data, subdir, root_offset + root_span, &mut root, &security, 0)?;
    }
    Ok(Image { root, security })
}

fn root_subdir(data: &[u8], root_offset: u64) -> Result<u64> {
    let disk = read_dentry_disk(data, root_offset)?;
    Ok(disk.subdir_offset.get())
}

fn read_dentry_disk(data: &[u8], offset: u64) -> Result<DentryDisk> {
    let start = usize::try_from(offset).map_err(|_| ErrorInner::UnexpectedEof)?;
    let raw = data
        .get(start..start + DENTRY_DISK_SIZE)
        .ok_or(ErrorInner::UnexpectedEof)?;
    DentryDisk::read_from_bytes(raw)
        .map_err(|_| ErrorInner::InvalidMetadataResource("short dentry").into())
}

/// Parse one dentry (and its stream entries) at `offset`. Returns the
/// dentry and the number of bytes it spans, stream entries included.
fn parse_dentry(data: &[u8], offset: u64) -> Result<(Dentry, u64)> {
    let disk = read_dentry_disk(data, offset)?;
    let length = disk.length.get();
    if length < DENTRY_DISK_SIZE as u64 {
        return Err(ErrorInner::InvalidMetadataResource("dentry length too small").into());
    }

    let fname_len = usize::from(disk.file_name_nbytes.get());
    let sname_len = usize::from(disk.short_name_nbytes.get());
    let names_needed = DENTRY_DISK_SIZE as u64
        + if fname_len == 0 { 0 } else { fname_len as u64 + 2 }
        + if sname_len == 0 { 0 } else { sname_len as u64 + 2 };
    if length < names_needed {
        return Err(ErrorInner::InvalidMetadataResource("names exceed dentry length").into());
    }

    let base = offset as usize;
    let mut cursor = base + DENTRY_DISK_SIZE;
    let name = if fname_len > 0 {
        let raw = data
            .get(cursor..cursor + fname_len)
            .ok_or(ErrorInner::UnexpectedEof)?;
        cursor += fname_len + 2;
        utf16le_parse(raw)?
    } else {
        String::new()
    };
    let short_name = if sname_len > 0 {
        let raw = data
            .get(cursor..cursor + sname_len)
            .ok_or(ErrorInner::UnexpectedEof)?;
        utf16le_parse(raw)?
    } else {
        String::new()
    };

    let attributes_v = disk.attributes.get();
    let is_reparse = attributes_v & attributes::REPARSE_POINT != 0;
    let mut dentry = Dentry {
        name,
        short_name,
        attributes: attributes_v,
        security_id: match disk.security_id.get() {
            NO_SECURITY_ID => None,
            id => Some(id),
        },
        creation_time: disk.creation_time.get(),
        last_access_time: disk.last_access_time.get(),
        last_write_time: disk.last_write_time.get(),
        reparse_tag: if is_reparse { disk.tag_or_link_low.get() } else { 0 },
        hard_link_group_id: if is_reparse {
            0
        } else {
            u64::from(disk.tag_or_link_low.get())
                | (u64::from(disk.rp_or_link_high.get()) << 32)
        },
        unnamed_stream: match Sha1Hash(disk.default_hash) {
            h if h.is_zero() => StreamRef::Empty,
            h => StreamRef::Hash(h),
        },
        named_streams: Vec::new(),
        children: Vec::new(),
    };

    // Stream entries follow the 8-aligned dentry.
    let mut span = align8(length);
    for _ in 0..disk.num_named_streams.get() {
        let estart = base as u64 + span;
        let es = usize::try_from(estart).map_err(|_| ErrorInner::UnexpectedEof)?;
        let raw = data
            .get(es..es + STREAM_ENTRY_DISK_SIZE)
            .ok_or(ErrorInner::UnexpectedEof)?;
        let entry = StreamEntryDisk::read_from_bytes(raw)
            .map_err(|_| ErrorInner::InvalidMetadataResource("short stream entry"))?;
        let name_len = usize::from(entry.stream_name_nbytes.get());
        let raw_name = data
            .get(es + STREAM_ENTRY_DISK_SIZE..es + STREAM_ENTRY_DISK_SIZE + name_len)
            .ok_or(ErrorInner::UnexpectedEof)?;
        let sname = utf16le_parse(raw_name)?;
        let hash = Sha1Hash(entry.hash);
        let stream = if hash.is_zero() {
            StreamRef::Empty
        } else {
            StreamRef::Hash(hash)
        };
        if sname.is_empty() {
            // Some writers store the unnamed stream as an anonymous entry.
            if matches!(dentry.unnamed_stream, StreamRef::Empty) {
                dentry.unnamed_stream = stream;
            }
        } else {
            dentry.named_streams.push(NamedStream { name: sname, stream });
        }
        if entry.length.get() < STREAM_ENTRY_DISK_SIZE as u64 {
            return Err(ErrorInner::InvalidMetadataResource("stream entry length too small").into());
        }
        span += align8(entry.length.get());
    }

    Ok((dentry, span))
}

/// Parse the child list at `offset` into `parent`, recursing into
/// subdirectories. Offsets must move strictly forward, which bounds the
/// recursion on corrupt input.
fn parse_children(
    data: &[u8],
    offset: u64,
    min_offset: u64,
    parent: &mut Dentry,
    security: &SecurityData,
    depth: u32,
) -> Result<()> {
    if depth > 1024 {
        return Err(ErrorInner::InvalidMetadataResource("directory tree too deep").into());
    }
    if offset < min_offset {
        return Err(ErrorInner::InvalidMetadataResource("backward subdir offset").into());
    }

    let mut cursor = offset;
    loop {
        let pos = usize::try_from(cursor).map_err(|_| ErrorInner::UnexpectedEof)?;
        let len_raw = data.get(pos..pos + 8).ok_or(ErrorInner::UnexpectedEof)?;
        if u64::from_le_bytes(len_raw.try_into().expect("8 bytes")) == 0 {
            break;
        }

        let (mut child, span) = parse_dentry(data, cursor)?;
        if child.name.is_empty() {
            return Err(ErrorInner::InvalidMetadataResource("unnamed non-root dentry").into());
        }
        if let Some(sid) = child.security_id {
            if sid as usize >= security.descriptors.len() {
                return Err(ErrorInner::InvalidMetadataResource("security id out of range").into());
            }
        }
        if parent.child(&child.name).is_some() {
            return Err(ErrorInner::InvalidMetadataResource("duplicate name in directory").into());
        }

        let disk = read_dentry_disk(data, cursor)?;
        let subdir = disk.subdir_offset.get();
        if child.is_directory() && subdir != 0 {
            parse_children(data, subdir, cursor + span, &mut child, security, depth + 1)?;
        }
        parent.children.push(child);
        cursor += span;
    }
    Ok(())
}

fn parse_security(data: &[u8]) -> Result<(SecurityData, u64)> {
    let header = data.get(..8).ok_or(ErrorInner::UnexpectedEof)?;
    let total = u32::from_le_bytes(header[..4].try_into().expect("4 bytes")) as u64;
    let num = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;

    if total < 8 + 8 * num as u64 || total > data.len() as u64 {
        return Err(ErrorInner::InvalidSecurityData("table size out of range").into());
    }

    let mut sizes = Vec::with_capacity(num);
    for i in 0..num {
        let at = 8 + 8 * i;
        let raw = data.get(at..at + 8).ok_or(ErrorInner::UnexpectedEof)?;
        sizes.push(u64::from_le_bytes(raw.try_into().expect("8 bytes")));
    }

    let mut descriptors = Vec::with_capacity(num);
    let mut cursor = 8 + 8 * num as u64;
    for size in sizes {
        let end = cursor
            .checked_add(size)
            .filter(|&e| e <= total)
            .ok_or(ErrorInner::InvalidSecurityData("descriptor overruns table"))?;
        descriptors.push(data[cursor as usize..end as usize].to_vec());
        cursor = end;
    }

    Ok((SecurityData { descriptors }, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Image {
        let mut image = Image::new();
        image.security.descriptors.push(vec![1, 2, 3, 4, 5]);
        image.security.descriptors.push(vec![9; 20]);

        let mut docs = Dentry::new_directory("Docs");
        docs.security_id = Some(1);
        let mut readme = Dentry::new_file("readme.txt");
        readme.unnamed_stream = StreamRef::Hash(Sha1Hash::of(b"hello\n"));
        readme.named_streams.push(NamedStream {
            name: "meta".into(),
            stream: StreamRef::Hash(Sha1Hash::of(b"m")),
        });
        readme.creation_time = filetime_from_unix(1_700_000_000);
        docs.add_child(readme).unwrap();
        docs.add_child(Dentry::new_directory("empty")).unwrap();
        image.root.add_child(docs).unwrap();

        let mut empty_file = Dentry::new_file("zero.bin");
        empty_file.unnamed_stream = StreamRef::Empty;
        image.root.add_child(empty_file).unwrap();

        image
    }

    #[test]
    fn tree_roundtrip() {
        let image = sample_image();
        let table = BlobTable::new();
        let bytes = encode(&image, &table).unwrap();
        let parsed = decode(&bytes).unwrap();

        assert_eq!(parsed.security.descriptors, image.security.descriptors);
        assert_eq!(parsed.root.children.len(), 2);

        let docs = parsed.lookup("/Docs").unwrap();
        assert!(docs.is_directory());
        assert_eq!(docs.security_id, Some(1));
        assert_eq!(docs.children.len(), 2);

        let readme = parsed.lookup("/Docs/readme.txt").unwrap();
        assert_eq!(
            readme.unnamed_stream,
            StreamRef::Hash(Sha1Hash::of(b"hello\n"))
        );
        assert_eq!(readme.named_streams.len(), 1);
        assert_eq!(readme.named_streams[0].name, "meta");
        assert_eq!(readme.creation_time, filetime_from_unix(1_700_000_000));

        let zero = parsed.lookup("/zero.bin").unwrap();
        assert_eq!(zero.unnamed_stream, StreamRef::Empty);

        assert!(parsed.lookup("/Docs/empty").unwrap().children.is_empty());

        // Case-insensitive lookup, case-preserving storage.
        assert!(parsed.lookup("/docs/README.TXT").is_some());
        assert_eq!(parsed.lookup("/Docs").unwrap().name, "Docs");
    }

    #[test]
    fn counts() {
        let image = sample_image();
        let (dirs, files) = image.count_entries();
        assert_eq!(dirs, 2);
        assert_eq!(files, 2);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut dir = Dentry::new_directory("d");
        dir.add_child(Dentry::new_file("A.txt")).unwrap();
        assert!(dir.add_child(Dentry::new_file("a.TXT")).is_err());
    }

    #[test]
    fn corrupt_metadata_rejected() {
        // Truncated security header.
        assert!(decode(&[0u8; 4]).is_err());

        // Valid empty image, then flip the root into a file.
        let image = Image::new();
        let table = BlobTable::new();
        let bytes = encode(&image, &table).unwrap();
        assert!(decode(&bytes).is_ok());

        let mut bad = bytes.clone();
        // Root dentry starts at offset 8 (empty security table, aligned).
        let attr_off = 8 + 8;
        bad[attr_off..attr_off + 4].copy_from_slice(&attributes::NORMAL.to_le_bytes());
        assert!(decode(&bad).is_err());
    }
}
