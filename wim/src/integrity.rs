//! The optional integrity table: SHA-1 digests over fixed-size chunks of
//! the file range from the end of the header to the end of the blob table.

use std::fs::File;

use positioned_io::ReadAt;
use sha1::{Digest, Sha1};

use crate::blob::Sha1Hash;
use crate::error::{ErrorInner, IoOp, IoResultExt, Result};

/// 10MiB, the conventional integrity chunk size.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

const HEADER_SIZE: usize = 12;

/// A parsed integrity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityTable {
    pub chunk_size: u32,
    pub digests: Vec<Sha1Hash>,
}

impl IntegrityTable {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ErrorInner::InvalidIntegrityTable("table too small").into());
        }
        let size = u32::from_le_bytes(data[0..4].try_into().expect("4 bytes")) as usize;
        let num_entries = u32::from_le_bytes(data[4..8].try_into().expect("4 bytes")) as usize;
        let chunk_size = u32::from_le_bytes(data[8..12].try_into().expect("4 bytes"));

        if chunk_size == 0 {
            return Err(ErrorInner::InvalidIntegrityTable("zero chunk size").into());
        }
        let expected = HEADER_SIZE + num_entries * 20;
        if size != expected || data.len() < expected {
            return Err(ErrorInner::InvalidIntegrityTable("size does not match entry count").into());
        }

        let digests = data[HEADER_SIZE..expected]
            .chunks_exact(20)
            .map(|c| Sha1Hash(c.try_into().expect("20 bytes")))
            .collect();
        Ok(IntegrityTable { chunk_size, digests })
    }

    #[must_use]
    pub fn emit(&self) -> Vec<u8> {
        let size = HEADER_SIZE + self.digests.len() * 20;
        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(&(size as u32).to_le_bytes());
        out.extend_from_slice(&(self.digests.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        for d in &self.digests {
            out.extend_from_slice(&d.0);
        }
        out
    }

    /// Number of chunks needed to cover `len` bytes.
    pub fn num_chunks(len: u64, chunk_size: u32) -> u64 {
        len.div_ceil(u64::from(chunk_size))
    }
}

/// Compute the integrity table over `file[start..end)`.
///
/// When appending, digests from `old` covering chunks that are fully inside
/// both the old range `[start, old_end)` and the new one are reused instead
/// of re-read. `progress(done, total)` is called per chunk and may abort by
/// returning an error.
pub fn compute(
    file: &File,
    start: u64,
    end: u64,
    chunk_size: u32,
    old: Option<(&IntegrityTable, u64)>,
    progress: &mut dyn FnMut(u64, u64) -> Result<()>,
) -> Result<IntegrityTable> {
    debug_assert!(end >= start);
    let len = end - start;
    let num_chunks = IntegrityTable::num_chunks(len, chunk_size);
    let mut digests = Vec::with_capacity(num_chunks as usize);
    let mut buf = vec![0u8; chunk_size as usize];

    for i in 0..num_chunks {
        let chunk_start = start + i * u64::from(chunk_size);
        let chunk_end = (chunk_start + u64::from(chunk_size)).min(end);

        let reused = old.and_then(|(table, old_end)| {
            (table.chunk_size == chunk_size && chunk_end <= old_end)
                .then(|| table.digests.get(i as usize).copied())
                .flatten()
        });
        let digest = match reused {
            Some(d) => d,
            None => {
                let buf = &mut buf[..(chunk_end - chunk_start) as usize];
                file.read_exact_at(chunk_start, buf).io_ctx(IoOp::Read)?;
                Sha1Hash(Sha1::digest(&buf).into())
            }
        };
        digests.push(digest);
        progress(i + 1, num_chunks)?;
    }

    Ok(IntegrityTable { chunk_size, digests })
}

/// Verify `file[start..end)` against a stored table.
pub fn verify(
    file: &File,
    start: u64,
    end: u64,
    table: &IntegrityTable,
    progress: &mut dyn FnMut(u64, u64) -> Result<()>,
) -> Result<()> {
    let len = end - start;
    let num_chunks = IntegrityTable::num_chunks(len, table.chunk_size);
    if table.digests.len() as u64 != num_chunks {
        return Err(ErrorInner::InvalidIntegrityTable("entry count does not cover the range").into());
    }
    let mut buf = vec![0u8; table.chunk_size as usize];
    for i in 0..num_chunks {
        let chunk_start = start + i * u64::from(table.chunk_size);
        let chunk_end = (chunk_start + u64::from(table.chunk_size)).min(end);
        let buf = &mut buf[..(chunk_end - chunk_start) as usize];
        file.read_exact_at(chunk_start, buf).io_ctx(IoOp::Read)?;
        if Sha1Hash(Sha1::digest(&buf).into()) != table.digests[i as usize] {
            return Err(ErrorInner::Integrity.into());
        }
        progress(i + 1, num_chunks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn emit_parse_roundtrip() {
        let table = IntegrityTable {
            chunk_size: INTEGRITY_CHUNK_SIZE,
            digests: vec![Sha1Hash::of(b"a"), Sha1Hash::of(b"b")],
        };
        assert_eq!(IntegrityTable::parse(&table.emit()).unwrap(), table);
    }

    #[test]
    fn parse_rejects_bad_size_field() {
        let table = IntegrityTable {
            chunk_size: 4096,
            digests: vec![Sha1Hash::of(b"a")],
        };
        let mut bytes = table.emit();
        bytes[0] ^= 1;
        assert!(IntegrityTable::parse(&bytes).is_err());
    }

    #[test]
    fn compute_verify_and_reuse() {
        let mut f = tempfile::tempfile().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();

        let mut nop = |_done, _total| Ok(());
        let table = compute(&f, 100, 10_000, 1024, None, &mut nop).unwrap();
        verify(&f, 100, 10_000, &table, &mut nop).unwrap();

        // Extending the range reuses old full-chunk digests.
        f.write_all(&data).unwrap();
        let extended = compute(&f, 100, 20_000, 1024, Some((&table, 10_000)), &mut nop).unwrap();
        verify(&f, 100, 20_000, &extended, &mut nop).unwrap();
        let fresh = compute(&f, 100, 20_000, 1024, None, &mut nop).unwrap();
        assert_eq!(extended, fresh);

        // A flipped digest fails verification.
        let mut bad = table.clone();
        bad.digests[3].0[0] ^= 0x80;
        let err = verify(&f, 100, 10_000, &bad, &mut nop).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Integrity);
    }
}
