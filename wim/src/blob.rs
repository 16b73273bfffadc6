//! Blob descriptors and the content-addressed blob table.
//!
//! Every distinct byte sequence stored in a WIM is a blob, identified by
//! the SHA-1 of its uncompressed content and stored at most once. The blob
//! table maps hashes to descriptors recording where the data currently
//! lives: inside a WIM resource, in a file waiting to be captured, or in an
//! in-memory buffer. Blobs scanned from disk start out *unhashed* and get
//! their digest filled in the first time the writer reads them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use sha1::{Digest, Sha1};
use zerocopy::{little_endian as le, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{ErrorInner, Result};
use crate::header::{res_flags, ReshdrDisk, ResourceHeader};
use crate::resource::ResourceDescriptor;

/// A SHA-1 digest identifying a blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    /// The all-zero digest, reserved to mean "empty stream, no blob".
    pub const ZERO: Sha1Hash = Sha1Hash([0; 20]);

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Hash a complete in-memory buffer.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Sha1Hash(Sha1::digest(data).into())
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Where a blob's data currently lives.
#[derive(Debug, Clone)]
pub enum BlobLocation {
    /// Stored in a WIM resource, possibly at an offset inside a solid one.
    InWim { res: usize, offset_in_res: u64 },
    /// An on-disk file captured by a scanner but not yet written.
    File(PathBuf),
    /// An in-memory buffer.
    Buffer(Arc<[u8]>),
}

/// A blob known by hash.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub size: u64,
    /// References from every image in the containing WIM.
    pub refcnt: u32,
    /// References from the image set being written; rebuilt per write.
    pub out_refcnt: u32,
    pub location: BlobLocation,
}

/// A blob whose hash is not yet known. The owning streams reference it by
/// index and are rewritten once the hash is computed.
#[derive(Debug, Clone)]
pub struct UnhashedBlob {
    pub size: u64,
    pub location: BlobLocation,
    pub refcnt: u32,
    /// Filled in when the writer first reads the data.
    pub resolved: Option<Sha1Hash>,
}

/// Magic `uncompressed_size` marking a blob table entry that describes a
/// solid resource itself rather than a blob inside one.
pub const SOLID_RESOURCE_MAGIC: u64 = 0x1_0000_0000;

/// On-disk blob table entry: an embedded resource header, the owning part
/// number, the reference count and the hash.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct BlobDiskEntry {
    pub reshdr: ReshdrDisk,
    pub part_number: le::U16,
    pub refcnt: le::U32,
    pub hash: [u8; 20],
}

pub const BLOB_DISK_ENTRY_SIZE: usize = 50;
const _: () = assert!(size_of::<BlobDiskEntry>() == BLOB_DISK_ENTRY_SIZE);

impl fmt::Debug for BlobDiskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobDiskEntry")
            .field("reshdr", &self.reshdr)
            .field("part_number", &self.part_number.get())
            .field("refcnt", &self.refcnt.get())
            .field("hash", &Sha1Hash(self.hash))
            .finish()
    }
}

/// A metadata resource located by the blob table; its position among the
/// metadata entries selects the image index.
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub hash: Sha1Hash,
    pub res: usize,
}

/// The in-memory blob table: hash-keyed descriptors plus the id-indexed
/// unhashed list.
#[derive(Debug, Default)]
pub struct BlobTable {
    map: IndexMap<Sha1Hash, BlobDescriptor>,
    unhashed: Vec<Option<UnhashedBlob>>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &Sha1Hash) -> Option<&BlobDescriptor> {
        self.map.get(hash)
    }

    pub fn get_mut(&mut self, hash: &Sha1Hash) -> Option<&mut BlobDescriptor> {
        self.map.get_mut(hash)
    }

    pub fn insert(&mut self, hash: Sha1Hash, blob: BlobDescriptor) -> Result<()> {
        if self.map.insert(hash, blob).is_some() {
            return Err(ErrorInner::InvalidBlobTableEntry("duplicate hash").into());
        }
        Ok(())
    }

    /// Insert or merge: if the hash already exists, fold the reference
    /// counts into the existing descriptor and report `false`.
    pub fn insert_or_merge(&mut self, hash: Sha1Hash, blob: BlobDescriptor) -> bool {
        match self.map.entry(hash) {
            indexmap::map::Entry::Occupied(mut ent) => {
                let existing = ent.get_mut();
                existing.refcnt += blob.refcnt;
                existing.out_refcnt += blob.out_refcnt;
                false
            }
            indexmap::map::Entry::Vacant(ent) => {
                ent.insert(blob);
                true
            }
        }
    }

    pub fn remove(&mut self, hash: &Sha1Hash) -> Option<BlobDescriptor> {
        self.map.shift_remove(hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Sha1Hash, &BlobDescriptor)> {
        self.map.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Sha1Hash, &mut BlobDescriptor)> {
        self.map.iter_mut()
    }

    pub fn hashes(&self) -> impl Iterator<Item = &Sha1Hash> {
        self.map.keys()
    }

    /// Register a new unhashed blob and return its id.
    pub fn add_unhashed(&mut self, size: u64, location: BlobLocation) -> usize {
        self.unhashed.push(Some(UnhashedBlob {
            size,
            location,
            refcnt: 0,
            resolved: None,
        }));
        self.unhashed.len() - 1
    }

    pub fn unhashed(&self, id: usize) -> Option<&UnhashedBlob> {
        self.unhashed.get(id).and_then(Option::as_ref)
    }

    pub fn unhashed_mut(&mut self, id: usize) -> Option<&mut UnhashedBlob> {
        self.unhashed.get_mut(id).and_then(Option::as_mut)
    }

    /// The hash an unhashed blob resolved to, if it has been read yet.
    pub fn resolved_hash(&self, id: usize) -> Option<Sha1Hash> {
        self.unhashed.get(id).and_then(|u| u.as_ref()).and_then(|u| u.resolved)
    }

    /// Record the computed hash of an unhashed blob, deduplicating against
    /// the hashed table. Returns the final descriptor's hash; the unhashed
    /// slot keeps a tombstone with the resolution for later stream fixup.
    pub fn resolve_unhashed(&mut self, id: usize, hash: Sha1Hash) -> Sha1Hash {
        let Some(unhashed) = self.unhashed.get_mut(id).and_then(Option::as_mut) else {
            return hash;
        };
        unhashed.resolved = Some(hash);
        let blob = BlobDescriptor {
            size: unhashed.size,
            refcnt: unhashed.refcnt,
            out_refcnt: 0,
            location: unhashed.location.clone(),
        };
        self.insert_or_merge(hash, blob);
        hash
    }

    /// Parse the on-disk blob table of one WIM part.
    ///
    /// Entries for other parts of a spanned set are skipped. Returns the
    /// metadata entries in image order; resources are appended to the
    /// arena.
    pub fn parse(
        data: &[u8],
        part_number: u16,
        chunk_size: u32,
        compression: crate::header::CompressionType,
        resources: &mut Vec<ResourceDescriptor>,
    ) -> Result<(BlobTable, Vec<MetadataEntry>)> {
        if data.len() % BLOB_DISK_ENTRY_SIZE != 0 {
            return Err(
                ErrorInner::InvalidBlobTableEntry("table size is not a multiple of 50").into(),
            );
        }

        let mut table = BlobTable::new();
        let mut metadata = Vec::new();
        let mut last_solid_res: Option<usize> = None;

        for raw in data.chunks_exact(BLOB_DISK_ENTRY_SIZE) {
            let entry = BlobDiskEntry::read_from_bytes(raw)
                .map_err(|_| ErrorInner::InvalidBlobTableEntry("short entry"))?;
            let reshdr = ResourceHeader::from_disk(&entry.reshdr);

            if reshdr.flags & res_flags::FREE != 0 {
                continue;
            }
            if entry.part_number.get() != part_number {
                continue;
            }

            if reshdr.flags & res_flags::SOLID != 0 {
                if reshdr.uncompressed_size == SOLID_RESOURCE_MAGIC {
                    // The solid resource itself; its real uncompressed size
                    // and chunk size live in its own header in the file.
                    resources.push(ResourceDescriptor::for_solid_resource(&reshdr));
                    last_solid_res = Some(resources.len() - 1);
                    continue;
                }
                // A blob inside the most recent solid resource.
                let res = last_solid_res.ok_or(ErrorInner::ResourceOrder)?;
                let blob = BlobDescriptor {
                    size: reshdr.uncompressed_size,
                    refcnt: entry.refcnt.get(),
                    out_refcnt: 0,
                    location: BlobLocation::InWim {
                        res,
                        offset_in_res: reshdr.offset_in_wim,
                    },
                };
                table.insert(Sha1Hash(entry.hash), blob)?;
                continue;
            }

            // A non-solid entry is its own resource holding one blob.
            resources.push(ResourceDescriptor::from_reshdr(
                &reshdr,
                compression,
                chunk_size,
            ));
            let res = resources.len() - 1;

            if reshdr.is_metadata() {
                metadata.push(MetadataEntry {
                    hash: Sha1Hash(entry.hash),
                    res,
                });
            } else {
                let blob = BlobDescriptor {
                    size: reshdr.uncompressed_size,
                    refcnt: entry.refcnt.get(),
                    out_refcnt: 0,
                    location: BlobLocation::InWim {
                        res,
                        offset_in_res: 0,
                    },
                };
                table.insert(Sha1Hash(entry.hash), blob)?;
            }
        }

        Ok((table, metadata))
    }
}

/// Serialize a blob table entry.
pub fn encode_entry(
    reshdr: &ResourceHeader,
    part_number: u16,
    refcnt: u32,
    hash: &Sha1Hash,
) -> [u8; BLOB_DISK_ENTRY_SIZE] {
    let entry = BlobDiskEntry {
        reshdr: reshdr.to_disk(),
        part_number: part_number.into(),
        refcnt: refcnt.into(),
        hash: hash.0,
    };
    let mut out = [0u8; BLOB_DISK_ENTRY_SIZE];
    out.copy_from_slice(entry.as_bytes());
    out
}

/// Marks blobs whose uncompressed size is unique within a write set, so
/// they can be streamed without pre-hashing: two blobs of different sizes
/// can never be duplicates of each other.
#[derive(Debug)]
pub struct BlobSizeTable {
    slots: Vec<Option<(u64, bool)>>,
    mask: usize,
}

impl BlobSizeTable {
    pub fn with_capacity(num_blobs: usize) -> Self {
        let cap = (num_blobs * 2).next_power_of_two().max(16);
        BlobSizeTable {
            slots: vec![None; cap],
            mask: cap - 1,
        }
    }

    fn probe(&self, size: u64) -> usize {
        let mut i = (size.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & self.mask;
        loop {
            match self.slots[i] {
                Some((s, _)) if s != size => i = (i + 1) & self.mask,
                _ => return i,
            }
        }
    }

    pub fn insert(&mut self, size: u64) {
        let i = self.probe(size);
        self.slots[i] = match self.slots[i] {
            None => Some((size, true)),
            Some(_) => Some((size, false)),
        };
    }

    pub fn is_unique(&self, size: u64) -> bool {
        matches!(self.slots[self.probe(size)], Some((_, true)))
    }
}

/// A streaming SHA-1 hasher for blob data.
#[derive(Debug, Default)]
pub struct BlobHasher(Sha1);

impl BlobHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Sha1Hash {
        Sha1Hash(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CompressionType;

    #[test]
    fn entry_roundtrip() {
        let reshdr = ResourceHeader {
            offset_in_wim: 0xDEAD_BEEF,
            size_in_wim: 1234,
            uncompressed_size: 5678,
            flags: res_flags::COMPRESSED,
        };
        let hash = Sha1Hash::of(b"hello");
        let bytes = encode_entry(&reshdr, 1, 7, &hash);
        let mut resources = Vec::new();
        let (table, metadata) =
            BlobTable::parse(&bytes, 1, 1 << 15, CompressionType::Lzx, &mut resources).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(resources.len(), 1);
        let blob = table.get(&hash).unwrap();
        assert_eq!(blob.size, 5678);
        assert_eq!(blob.refcnt, 7);
    }

    #[test]
    fn duplicate_hash_rejected() {
        let reshdr = ResourceHeader {
            offset_in_wim: 0,
            size_in_wim: 10,
            uncompressed_size: 10,
            flags: 0,
        };
        let hash = Sha1Hash::of(b"x");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_entry(&reshdr, 1, 1, &hash));
        bytes.extend_from_slice(&encode_entry(&reshdr, 1, 1, &hash));
        let mut resources = Vec::new();
        assert!(
            BlobTable::parse(&bytes, 1, 1 << 15, CompressionType::None, &mut resources).is_err()
        );
    }

    #[test]
    fn solid_blob_requires_preceding_resource() {
        let blob_hdr = ResourceHeader {
            offset_in_wim: 0,
            size_in_wim: 0,
            uncompressed_size: 100,
            flags: res_flags::SOLID | res_flags::COMPRESSED,
        };
        let mut resources = Vec::new();
        let bytes = encode_entry(&blob_hdr, 1, 1, &Sha1Hash::of(b"y"));
        let err = BlobTable::parse(&bytes, 1, 1 << 15, CompressionType::Lzms, &mut resources)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceOrder);
    }

    #[test]
    fn size_uniqueness() {
        let mut t = BlobSizeTable::with_capacity(4);
        t.insert(100);
        t.insert(200);
        t.insert(100);
        assert!(!t.is_unique(100));
        assert!(t.is_unique(200));
        assert!(!t.is_unique(300));
    }

    #[test]
    fn unhashed_resolution_merges_duplicates() {
        let mut table = BlobTable::new();
        let hash = Sha1Hash::of(b"dup");
        table
            .insert(
                hash,
                BlobDescriptor {
                    size: 3,
                    refcnt: 1,
                    out_refcnt: 0,
                    location: BlobLocation::Buffer(Arc::from(b"dup".to_vec())),
                },
            )
            .unwrap();

        let id = table.add_unhashed(3, BlobLocation::Buffer(Arc::from(b"dup".to_vec())));
        table.unhashed_mut(id).unwrap().refcnt = 2;
        let final_hash = table.resolve_unhashed(id, hash);
        assert_eq!(final_hash, hash);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&hash).unwrap().refcnt, 3);
        assert_eq!(table.resolved_hash(id), Some(hash));
    }
}
