//! Cross-WIM image export.
//!
//! Exporting copies an image's metadata into the destination and
//! references every blob it needs by hash. Blob data is not moved until
//! the destination is written, at which point blobs still living in the
//! source file are either raw-copied (same compression format) or
//! recompressed.

use crate::blob::{BlobDescriptor, BlobLocation, Sha1Hash};
use crate::error::{ErrorInner, Result};
use crate::metadata::{Dentry, StreamRef};
use crate::resource::{ResourceDescriptor, ResourceSource};
use crate::wim::ImageEntry;
use crate::write::{hash_blob, BlobReadSource};
use crate::{Images, Wim};

crate::flag_type! {
    /// Flags for [`Wim::export_image`].
    ExportFlags {
        /// Mark the exported image as the destination's boot image.
        boot => BOOT = 0x1,
    }
}

impl Wim {
    /// Export image(s) from this WIM into `dst`.
    ///
    /// `dest_name` and `dest_description` may only be given when exporting
    /// a single image; otherwise names carry over from the source.
    pub fn export_image(
        &mut self,
        src_image: Images,
        dst: &mut Wim,
        dest_name: Option<&str>,
        dest_description: Option<&str>,
        flags: ExportFlags,
    ) -> Result<()> {
        dst.check_writable()?;
        let images = self.resolve_images(src_image)?;
        if images.len() > 1 && (dest_name.is_some() || dest_description.is_some()) {
            return Err(ErrorInner::InvalidParam(
                "a name or description needs a single source image",
            )
            .into());
        }

        for &img in &images {
            let name = match dest_name {
                Some(n) => n.to_owned(),
                None => self.image_name(img)?.to_owned(),
            };
            if !name.is_empty() && dst.image_index_by_name(&name).is_some() {
                return Err(ErrorInner::ImageNameCollision(name).into());
            }

            // Resolve any still-unhashed streams in the source so the
            // copied tree references blobs by hash only.
            let mut tree = self.image_entry(img)?.image.clone();
            self.resolve_tree_hashes(&mut tree.root)?;

            // Reference every blob in the destination.
            let mut res_map: std::collections::HashMap<usize, usize> =
                std::collections::HashMap::new();
            let mut hashes = Vec::new();
            tree.for_each_stream(&mut |s| {
                if let StreamRef::Hash(h) = s {
                    hashes.push(*h);
                }
            });
            for hash in hashes {
                self.reference_blob_into(&hash, dst, &mut res_map)?;
            }

            let mut info = self.xml.images[img as usize - 1].clone();
            info.name = name;
            if let Some(desc) = dest_description {
                info.description = Some(desc.to_owned());
            }

            dst.images.push(ImageEntry {
                image: tree,
                metadata_hash: Sha1Hash::ZERO,
                metadata_res: None,
                modified: true,
            });
            dst.xml.images.push(info);
            dst.hdr.image_count += 1;

            if flags.contains(ExportFlags::BOOT) {
                dst.hdr.boot_idx = dst.hdr.image_count;
            }
        }
        Ok(())
    }

    /// Rewrite `Unhashed` stream references to their resolved hashes,
    /// hashing the underlying data on demand.
    fn resolve_tree_hashes(&mut self, dentry: &mut Dentry) -> Result<()> {
        let mut fix = |wim: &mut Wim, stream: &mut StreamRef| -> Result<()> {
            if let StreamRef::Unhashed(id) = *stream {
                let hash = match wim.blob_table.resolved_hash(id) {
                    Some(h) => h,
                    None => {
                        let u = wim
                            .blob_table
                            .unhashed(id)
                            .ok_or(ErrorInner::InvalidParam("dangling unhashed blob"))?;
                        let source = BlobReadSource::from_unhashed(u);
                        let hash = hash_blob(wim, &source)?;
                        wim.blob_table.resolve_unhashed(id, hash);
                        hash
                    }
                };
                *stream = StreamRef::Hash(hash);
            }
            Ok(())
        };
        fix(self, &mut dentry.unnamed_stream)?;
        let mut named = std::mem::take(&mut dentry.named_streams);
        for s in &mut named {
            fix(self, &mut s.stream)?;
        }
        dentry.named_streams = named;

        let mut children = std::mem::take(&mut dentry.children);
        for c in &mut children {
            self.resolve_tree_hashes(c)?;
        }
        dentry.children = children;
        Ok(())
    }

    /// Make `hash` available in `dst`, registering a cross-WIM resource
    /// reference when the data lives in this container's file.
    fn reference_blob_into(
        &self,
        hash: &Sha1Hash,
        dst: &mut Wim,
        res_map: &mut std::collections::HashMap<usize, usize>,
    ) -> Result<()> {
        if let Some(existing) = dst.blob_table.get_mut(hash) {
            existing.refcnt += 1;
            return Ok(());
        }
        let src_blob = self
            .blob_table
            .get(hash)
            .ok_or_else(|| ErrorInner::ResourceNotFound(hash.to_string()))?;

        let location = match &src_blob.location {
            BlobLocation::File(p) => BlobLocation::File(p.clone()),
            BlobLocation::Buffer(b) => BlobLocation::Buffer(b.clone()),
            BlobLocation::InWim { res, offset_in_res } => {
                let dst_res = match res_map.get(res) {
                    Some(&r) => r,
                    None => {
                        let mut desc: ResourceDescriptor = self.resources[*res].clone();
                        if desc.source == ResourceSource::Local {
                            let path = self
                                .path
                                .clone()
                                .ok_or(ErrorInner::NoFilename)?;
                            desc.source = ResourceSource::External(path);
                        }
                        dst.resources.push(desc);
                        let r = dst.resources.len() - 1;
                        res_map.insert(*res, r);
                        r
                    }
                };
                BlobLocation::InWim {
                    res: dst_res,
                    offset_in_res: *offset_in_res,
                }
            }
        };

        dst.blob_table.insert(
            *hash,
            BlobDescriptor {
                size: src_blob.size,
                refcnt: 1,
                out_refcnt: 0,
                location,
            },
        )?;
        Ok(())
    }
}

impl BlobReadSource {
    pub(crate) fn from_unhashed(u: &crate::blob::UnhashedBlob) -> Self {
        BlobReadSource::from_location(&u.location, u.size)
    }
}
