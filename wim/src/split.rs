//! Splitting a WIM into a spanned set, and joining one back together.
//!
//! Every part of a spanned set shares the GUID and carries the blob table
//! and XML data describing the whole set; blob table entries name the part
//! holding each resource. Part 1 holds the image metadata. `part_size` is
//! a soft bound: a single resource larger than it still goes into one part
//! whole.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use positioned_io::ReadAt;
use zerocopy::IntoBytes;

use crate::blob::{encode_entry, Sha1Hash};
use crate::error::{ErrorInner, IoOp, IoResultExt, Result};
use crate::header::{hdr_flags, res_flags, ResourceHeader, HEADER_SIZE};
use crate::progress::{Progress, ProgressFn};
use crate::resource::ResourceSource;
use crate::wim::fire;
use crate::write::OutDest;
use crate::{Images, OpenFlags, Wim, WriteFlags};

#[derive(Debug)]
struct SplitResource {
    res: usize,
    part: usize,
    new_offset: u64,
    is_metadata: Option<u32>,
    hash: Sha1Hash,
    refcnt: u32,
    entry_reshdr: ResourceHeader,
}

impl Wim {
    /// Split this (file-backed, fully written) WIM into parts of at most
    /// `part_size` bytes each. `base_path` names part 1; later parts get
    /// the part number inserted before the extension.
    pub fn split(&mut self, base_path: impl AsRef<Path>, part_size: u64, flags: WriteFlags) -> Result<()> {
        let base_path = base_path.as_ref();
        let _ = flags.validated()?;
        if part_size == 0 {
            return Err(ErrorInner::InvalidParam("part size must be nonzero").into());
        }
        if self.hdr.is_pipable {
            return Err(ErrorInner::SplitUnsupported.into());
        }
        if self.file.is_none() {
            return Err(ErrorInner::NoFilename.into());
        }
        if self.images.iter().any(|i| i.modified) || self.deletion_occurred {
            return Err(ErrorInner::InvalidParam(
                "write pending changes before splitting",
            )
            .into());
        }

        let mut progress = self.progress.take();
        let result = self.split_inner(base_path, part_size, &mut progress);
        self.progress = progress;
        result
    }

    fn split_inner(
        &mut self,
        base_path: &Path,
        part_size: u64,
        progress: &mut Option<Box<ProgressFn>>,
    ) -> Result<()> {
        // Everything splittable is a resource of this file. Metadata
        // resources must land in part 1.
        let mut planned: Vec<SplitResource> = Vec::new();

        for (idx, entry) in self.images.iter().enumerate() {
            let res = entry
                .metadata_res
                .ok_or(ErrorInner::InvalidParam("image metadata is not stored yet"))?;
            planned.push(SplitResource {
                res,
                part: 0,
                new_offset: 0,
                is_metadata: Some(idx as u32),
                hash: entry.metadata_hash,
                refcnt: 1,
                entry_reshdr: ResourceHeader::default(),
            });
        }
        for (hash, blob) in self.blob_table.iter() {
            let crate::blob::BlobLocation::InWim { res, .. } = blob.location else {
                return Err(ErrorInner::InvalidParam("blob has no stored resource").into());
            };
            if self.resources[res].is_solid() {
                // Keep it simple and correct: splitting solid WIMs is not
                // supported, as in the original.
                return Err(ErrorInner::SplitUnsupported.into());
            }
            planned.push(SplitResource {
                res,
                part: 0,
                new_offset: 0,
                is_metadata: None,
                hash: *hash,
                refcnt: blob.refcnt,
                entry_reshdr: ResourceHeader::default(),
            });
        }

        // Greedy partition: metadata first (pinning it into part 1), then
        // blobs; a new part starts when the next resource would overflow a
        // non-empty part.
        let overhead = HEADER_SIZE;
        let mut part_ends: Vec<u64> = vec![overhead];
        for sr in planned.iter_mut() {
            let len = self.resources[sr.res].size_in_wim;
            let part = part_ends.len() - 1;
            let fits = part_ends[part] + len <= part_size;
            let may_open_new = sr.is_metadata.is_none() && part_ends[part] > overhead;
            let part = if fits || !may_open_new {
                part
            } else {
                part_ends.push(overhead);
                part_ends.len() - 1
            };
            sr.part = part;
            sr.new_offset = part_ends[part];
            part_ends[part] += len;
        }
        let total_parts = part_ends.len() as u16;

        // Write each part: header, its resources, then the whole-set blob
        // table and XML.
        for part in 0..total_parts {
            fire(
                progress,
                &Progress::SplitBeginPart {
                    part_number: part + 1,
                    total_parts,
                },
            )?;

            let path = part_path(base_path, part + 1)?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .io_ctx(IoOp::Open)?;
            let out_file = file.try_clone().io_ctx(IoOp::Open)?;
            let mut out = OutDest::File { file: out_file, pos: 0 };

            let mut hdr = self.hdr.clone();
            hdr.flags |= hdr_flags::SPANNED | hdr_flags::WRITE_IN_PROGRESS;
            hdr.part_number = part + 1;
            hdr.total_parts = total_parts;
            out.write(hdr.to_disk().as_bytes())?;

            // Copy this part's resources.
            let src = self.file.as_ref().expect("checked in split");
            let mut buf = vec![0u8; 1 << 20];
            for sr in planned.iter().filter(|sr| sr.part == part as usize) {
                let desc = &self.resources[sr.res];
                debug_assert_eq!(out.pos(), sr.new_offset);
                let mut done = 0u64;
                while done < desc.size_in_wim {
                    let take = ((desc.size_in_wim - done).min(buf.len() as u64)) as usize;
                    src.read_exact_at(desc.offset_in_wim + done, &mut buf[..take])
                        .io_ctx(IoOp::Read)?;
                    out.write(&buf[..take])?;
                    done += take as u64;
                }
            }

            // Whole-set blob table; entries carry the owning part number.
            let mut table_bytes = Vec::new();
            for sr in &planned {
                let desc = &self.resources[sr.res];
                let mut reshdr = desc.to_reshdr();
                reshdr.offset_in_wim = sr.new_offset;
                reshdr.flags |= res_flags::SPANNED;
                if sr.is_metadata.is_some() {
                    reshdr.flags |= res_flags::METADATA;
                }
                table_bytes.extend_from_slice(&encode_entry(
                    &reshdr,
                    sr.part as u16 + 1,
                    sr.refcnt,
                    &sr.hash,
                ));
            }
            let blob_table_offset = out.pos();
            out.write(&table_bytes)?;
            hdr.blob_table = ResourceHeader {
                offset_in_wim: blob_table_offset,
                size_in_wim: table_bytes.len() as u64,
                uncompressed_size: table_bytes.len() as u64,
                flags: 0,
            };

            let xml_bytes = self.xml.emit();
            let xml_offset = out.pos();
            out.write(&xml_bytes)?;
            hdr.xml_data = ResourceHeader {
                offset_in_wim: xml_offset,
                size_in_wim: xml_bytes.len() as u64,
                uncompressed_size: xml_bytes.len() as u64,
                flags: 0,
            };

            hdr.integrity_table = ResourceHeader::default();
            hdr.flags &= !hdr_flags::WRITE_IN_PROGRESS;
            out.write_at(0, hdr.to_disk().as_bytes())?;
            let bytes = out.pos();
            drop(out);
            file.set_len(bytes).io_ctx(IoOp::Truncate)?;

            fire(
                progress,
                &Progress::SplitEndPart {
                    part_number: part + 1,
                    total_parts,
                    bytes,
                },
            )?;
        }
        Ok(())
    }
}

/// `base.swm` -> `base2.swm`, `base3.swm`, ...
fn part_path(base: &Path, part: u16) -> Result<PathBuf> {
    if part == 1 {
        return Ok(base.to_path_buf());
    }
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or(ErrorInner::NoFilename)?;
    let mut name = format!("{stem}{part}");
    if let Some(ext) = base.extension().and_then(|e| e.to_str()) {
        name.push('.');
        name.push_str(ext);
    }
    Ok(base.with_file_name(name))
}

/// Join the parts of a spanned set into a fresh standalone WIM at
/// `output`.
///
/// The parts' GUIDs must match and their part numbers must form a
/// permutation of `1..=N`.
pub fn join(
    parts: &[impl AsRef<Path>],
    output: impl AsRef<Path>,
    open_flags: OpenFlags,
    write_flags: WriteFlags,
) -> Result<()> {
    if parts.is_empty() {
        return Err(ErrorInner::SplitInvalid("no parts given".into()).into());
    }

    let mut opened: Vec<Wim> = Vec::with_capacity(parts.len());
    for p in parts {
        opened.push(Wim::open(p.as_ref(), open_flags.split_ok())?);
    }

    let guid = opened[0].guid();
    let mut seen = vec![false; opened.len()];
    for w in &opened {
        if w.guid() != guid {
            return Err(ErrorInner::SplitInvalid("GUID mismatch between parts".into()).into());
        }
        if w.hdr.total_parts as usize != opened.len() {
            return Err(ErrorInner::SplitInvalid(format!(
                "expected {} parts, given {}",
                w.hdr.total_parts,
                opened.len()
            ))
            .into());
        }
        let n = w.hdr.part_number as usize;
        if n == 0 || n > seen.len() || seen[n - 1] {
            return Err(
                ErrorInner::SplitInvalid("part numbers are not a permutation".into()).into(),
            );
        }
        seen[n - 1] = true;
    }

    let first = opened
        .iter()
        .position(|w| w.hdr.part_number == 1)
        .expect("permutation verified");
    let mut base = opened.swap_remove(first);

    // Import the other parts' blobs as external references, then write the
    // whole set as one container.
    for part in &opened {
        let part_path = part.path().ok_or(ErrorInner::NoFilename)?.to_path_buf();
        let mut res_map = std::collections::HashMap::new();
        for (hash, blob) in part.blob_table.iter() {
            if base.blob_table.get(hash).is_some() {
                continue;
            }
            let crate::blob::BlobLocation::InWim { res, offset_in_res } = blob.location else {
                continue;
            };
            let dst_res = match res_map.get(&res) {
                Some(&r) => r,
                None => {
                    let mut desc = part.resources[res].clone();
                    desc.source = ResourceSource::External(part_path.clone());
                    base.resources.push(desc);
                    let r = base.resources.len() - 1;
                    res_map.insert(res, r);
                    r
                }
            };
            let mut blob = blob.clone();
            blob.location = crate::blob::BlobLocation::InWim {
                res: dst_res,
                offset_in_res,
            };
            base.blob_table.insert(*hash, blob)?;
        }
    }

    // The joined output is a normal standalone WIM again.
    base.readonly = false;
    base.hdr.part_number = 1;
    base.hdr.total_parts = 1;
    base.hdr.flags &= !hdr_flags::SPANNED;

    base.write(output, Images::All, write_flags.retain_guid(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_paths() {
        assert_eq!(part_path(Path::new("x.swm"), 1).unwrap(), Path::new("x.swm"));
        assert_eq!(part_path(Path::new("x.swm"), 2).unwrap(), Path::new("x2.swm"));
        assert_eq!(
            part_path(Path::new("dir/arch.swm"), 12).unwrap(),
            Path::new("dir/arch12.swm")
        );
    }
}
