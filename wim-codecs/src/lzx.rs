//! The LZX compression format, as used for WIM chunks.
//!
//! An LZX stream is a sequence of blocks of three types: verbatim (Huffman
//! coded, raw offset bits), aligned-offset (adds a 3-bit aligned code for
//! the low offset bits) and uncompressed. The main alphabet combines 256
//! literals with (offset slot, length header) pairs; lengths past the 7
//! header values continue in a 249-symbol length code. Codeword lengths are
//! delta-coded against the previous block's lengths through a 20-symbol
//! precode. A three-entry recent-offset queue shortens repeated offsets.
//!
//! Chunks of x86 machine code get their `0xE8` call displacements converted
//! to absolute addresses before compression; the decoder reverses it.

use crate::bits::{lz_copy, Bitstream, Bitwriter};
use crate::huffman::{make_canonical_code, DecodeTable};
use crate::{CorruptError, Result};

const MIN_MATCH_LEN: usize = 2;
const MAX_MATCH_LEN: usize = 257;
const NUM_CHARS: usize = 256;
const NUM_LEN_HEADERS: usize = 8;
const NUM_PRIMARY_LENS: usize = NUM_LEN_HEADERS - 1;
const LENCODE_NUM_SYMBOLS: usize = 249;
const PRECODE_NUM_SYMBOLS: usize = 20;
const ALIGNEDCODE_NUM_SYMBOLS: usize = 8;
const NUM_RECENT_OFFSETS: usize = 3;
const OFFSET_ADJUSTMENT: u32 = 2;

const BLOCKTYPE_VERBATIM: u32 = 1;
const BLOCKTYPE_ALIGNED: u32 = 2;
const BLOCKTYPE_UNCOMPRESSED: u32 = 3;
const DEFAULT_BLOCK_SIZE: usize = 32768;

const MAINCODE_TABLEBITS: u32 = 11;
const LENCODE_TABLEBITS: u32 = 10;
const PRECODE_TABLEBITS: u32 = 8;
const ALIGNEDCODE_TABLEBITS: u32 = 7;
const MAX_MAIN_CODEWORD_LEN: u32 = 16;
const MAX_PRE_CODEWORD_LEN: u32 = 15;
const MAX_ALIGNED_CODEWORD_LEN: u32 = 7;

const MAX_OFFSET_SLOTS: usize = 50;
const MAX_NUM_MAIN_SYMS: usize = NUM_CHARS + MAX_OFFSET_SLOTS * NUM_LEN_HEADERS;

/// First formatted offset of each offset slot, plus a sentinel.
#[rustfmt::skip]
const OFFSET_SLOT_BASE: [u32; MAX_OFFSET_SLOTS + 1] = [
    0,       1,       2,       3,       4,
    6,       8,       12,      16,      24,
    32,      48,      64,      96,      128,
    192,     256,     384,     512,     768,
    1024,    1536,    2048,    3072,    4096,
    6144,    8192,    12288,   16384,   24576,
    32768,   49152,   65536,   98304,   131072,
    196608,  262144,  393216,  524288,  655360,
    786432,  917504,  1048576, 1179648, 1310720,
    1441792, 1572864, 1703936, 1835008, 1966080,
    2097152,
];

/// Raw bits carried by each offset slot.
#[rustfmt::skip]
const EXTRA_OFFSET_BITS: [u32; MAX_OFFSET_SLOTS] = [
    0,  0,  0,  0,  1,
    1,  2,  2,  3,  3,
    4,  4,  5,  5,  6,
    6,  7,  7,  8,  8,
    9,  9,  10, 10, 11,
    11, 12, 12, 13, 13,
    14, 14, 15, 15, 16,
    16, 17, 17, 17, 17,
    17, 17, 17, 17, 17,
    17, 17, 17, 17, 17,
];

/// The fixed "file size" every WIM LZX stream assumes for E8 translation.
const E8_MAGIC_FILESIZE: i32 = 12_000_000;
/// E8 translation applies to the first 32KiB of each fresh window only.
const E8_FILTER_SPAN: usize = 32768;

fn offset_slot(adjusted_offset: u32) -> usize {
    debug_assert!(adjusted_offset < OFFSET_SLOT_BASE[MAX_OFFSET_SLOTS]);
    OFFSET_SLOT_BASE
        .partition_point(|&base| base <= adjusted_offset)
        .saturating_sub(1)
}

fn num_offset_slots(window_order: u32) -> usize {
    // The format never uses the offset that would make the first two bytes
    // match the last two, so the top slot comes from window_size - 1.
    let max_adjusted = (1u32 << window_order) - 1;
    offset_slot(max_adjusted) + 1
}

/// Reverse the E8 translation on the first 32KiB of a decompressed chunk.
fn e8_undo(data: &mut [u8]) {
    let span = data.len().min(E8_FILTER_SPAN);
    if span <= 10 {
        return;
    }
    let mut i = 0;
    while i < span - 10 {
        if data[i] != 0xE8 {
            i += 1;
            continue;
        }
        let pos = i as i32;
        let disp: [u8; 4] = data[i + 1..i + 5].try_into().expect("4 bytes");
        let abs = i32::from_le_bytes(disp);
        if abs >= 0 {
            if abs < E8_MAGIC_FILESIZE {
                data[i + 1..i + 5].copy_from_slice(&(abs - pos).to_le_bytes());
            }
        } else if abs >= -pos {
            data[i + 1..i + 5].copy_from_slice(&(abs + E8_MAGIC_FILESIZE).to_le_bytes());
        }
        i += 5;
    }
}

/// Apply the E8 translation before compression; the inverse of [`e8_undo`].
fn e8_apply(data: &mut [u8]) {
    let span = data.len().min(E8_FILTER_SPAN);
    if span <= 10 {
        return;
    }
    let mut i = 0;
    while i < span - 10 {
        if data[i] != 0xE8 {
            i += 1;
            continue;
        }
        let pos = i as i32;
        let disp: [u8; 4] = data[i + 1..i + 5].try_into().expect("4 bytes");
        let rel = i32::from_le_bytes(disp);
        if rel >= -pos && rel < E8_MAGIC_FILESIZE {
            let abs = if rel < E8_MAGIC_FILESIZE - pos {
                rel + pos
            } else {
                rel - E8_MAGIC_FILESIZE
            };
            data[i + 1..i + 5].copy_from_slice(&abs.to_le_bytes());
        }
        i += 5;
    }
}

/// Decompressor for LZX streams of one window size.
#[derive(Debug)]
pub struct LzxDecompressor {
    window_order: u32,
    num_main_syms: usize,
    maincode_lens: [u8; MAX_NUM_MAIN_SYMS],
    lencode_lens: [u8; LENCODE_NUM_SYMBOLS],
    alignedcode_lens: [u8; ALIGNEDCODE_NUM_SYMBOLS],
}

impl LzxDecompressor {
    pub fn new(max_block_size: u32) -> Option<Self> {
        if !max_block_size.is_power_of_two() {
            return None;
        }
        let window_order = max_block_size.trailing_zeros();
        if !(15..=21).contains(&window_order) {
            return None;
        }
        Some(LzxDecompressor {
            window_order,
            num_main_syms: NUM_CHARS + num_offset_slots(window_order) * NUM_LEN_HEADERS,
            maincode_lens: [0; MAX_NUM_MAIN_SYMS],
            lencode_lens: [0; LENCODE_NUM_SYMBOLS],
            alignedcode_lens: [0; ALIGNEDCODE_NUM_SYMBOLS],
        })
    }

    pub fn decompress(&mut self, data: &[u8], out: &mut [u8]) -> Result<()> {
        if out.len() > (1usize << self.window_order) {
            return Err(CorruptError);
        }

        // Codeword lengths start at zero for the delta coding.
        self.maincode_lens[..self.num_main_syms].fill(0);
        self.lencode_lens.fill(0);

        let mut is = Bitstream::new(data);
        let mut recent = [1u32; NUM_RECENT_OFFSETS];
        let mut pos = 0usize;

        while pos < out.len() {
            let (block_type, block_size) = self.read_block_header(&mut is)?;
            let block_end = pos
                .checked_add(block_size)
                .filter(|&e| e <= out.len())
                .ok_or(CorruptError)?;

            if block_type == BLOCKTYPE_UNCOMPRESSED {
                // Realign to a coding unit; a stream already aligned skips
                // a full unit here.
                is.ensure_bits(1);
                is.align();
                for r in &mut recent {
                    *r = is.read_u32();
                    if *r == 0 {
                        return Err(CorruptError);
                    }
                }
                is.read_bytes(&mut out[pos..block_end]).ok_or(CorruptError)?;
                if block_size % 2 != 0 {
                    is.read_byte();
                }
                pos = block_end;
                continue;
            }

            let aligned_table = if block_type == BLOCKTYPE_ALIGNED {
                for len in &mut self.alignedcode_lens {
                    *len = is.read_bits(3) as u8;
                }
                Some(DecodeTable::build(
                    &self.alignedcode_lens,
                    ALIGNEDCODE_TABLEBITS,
                    MAX_ALIGNED_CODEWORD_LEN,
                )?)
            } else if block_type == BLOCKTYPE_VERBATIM {
                None
            } else {
                return Err(CorruptError);
            };

            let num_main_syms = self.num_main_syms;
            read_codeword_lens(&mut is, &mut self.maincode_lens[..NUM_CHARS])?;
            read_codeword_lens(&mut is, &mut self.maincode_lens[NUM_CHARS..num_main_syms])?;
            let main_table = DecodeTable::build(
                &self.maincode_lens[..num_main_syms],
                MAINCODE_TABLEBITS,
                MAX_MAIN_CODEWORD_LEN,
            )?;
            read_codeword_lens(&mut is, &mut self.lencode_lens)?;
            let len_table = DecodeTable::build(
                &self.lencode_lens,
                LENCODE_TABLEBITS,
                MAX_MAIN_CODEWORD_LEN,
            )?;

            while pos < block_end {
                let mainsym = usize::from(main_table.decode(&mut is));
                if mainsym < NUM_CHARS {
                    out[pos] = mainsym as u8;
                    pos += 1;
                    continue;
                }
                if mainsym >= self.num_main_syms {
                    return Err(CorruptError);
                }

                let len_hdr = (mainsym - NUM_CHARS) % NUM_LEN_HEADERS;
                let slot = (mainsym - NUM_CHARS) / NUM_LEN_HEADERS;

                let mut length = MIN_MATCH_LEN + len_hdr;
                if len_hdr == NUM_PRIMARY_LENS {
                    length += usize::from(len_table.decode(&mut is));
                }

                let offset;
                if slot < NUM_RECENT_OFFSETS {
                    offset = recent[slot];
                    recent[slot] = recent[0];
                    recent[0] = offset;
                } else {
                    let extra = EXTRA_OFFSET_BITS[slot];
                    let mut off = OFFSET_SLOT_BASE[slot] - OFFSET_ADJUSTMENT;
                    match &aligned_table {
                        Some(aligned) if extra >= 3 => {
                            off += is.read_bits(extra - 3) << 3;
                            off += u32::from(aligned.decode(&mut is));
                        }
                        _ => off += is.read_bits(extra),
                    }
                    offset = off;
                    recent[2] = recent[1];
                    recent[1] = recent[0];
                    recent[0] = offset;
                }

                if offset as usize > pos || length > block_end - pos {
                    return Err(CorruptError);
                }
                lz_copy(out, pos, length, offset as usize);
                pos += length;
            }
        }

        e8_undo(out);
        Ok(())
    }

    fn read_block_header(&self, is: &mut Bitstream<'_>) -> Result<(u32, usize)> {
        is.ensure_bits(4);
        let block_type = is.pop_bits(3);
        let block_size = if is.pop_bits(1) != 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            let mut size = is.read_bits(16) as usize;
            if self.window_order >= 16 {
                size = (size << 8) | is.read_bits(8) as usize;
            }
            size
        };
        if block_size == 0 {
            return Err(CorruptError);
        }
        Ok((block_type, block_size))
    }
}

/// Read precode-compressed codeword lengths, delta-coded against `lens`.
fn read_codeword_lens(is: &mut Bitstream<'_>, lens: &mut [u8]) -> Result<()> {
    let mut precode_lens = [0u8; PRECODE_NUM_SYMBOLS];
    for len in &mut precode_lens {
        *len = is.read_bits(4) as u8;
    }
    let precode = DecodeTable::build(&precode_lens, PRECODE_TABLEBITS, MAX_PRE_CODEWORD_LEN)?;

    let mut i = 0usize;
    while i < lens.len() {
        let presym = u32::from(precode.decode(is));
        let (run_len, len) = match presym {
            0..=16 => {
                lens[i] = delta_len(lens[i], presym);
                i += 1;
                continue;
            }
            17 => (4 + is.read_bits(4) as usize, 0),
            18 => (20 + is.read_bits(5) as usize, 0),
            19 => {
                let run = 4 + is.read_bits(1) as usize;
                let presym = u32::from(precode.decode(is));
                if presym > 16 {
                    return Err(CorruptError);
                }
                (run, delta_len(lens[i], presym))
            }
            _ => return Err(CorruptError),
        };
        let run_len = run_len.min(lens.len() - i);
        lens[i..i + run_len].fill(len);
        i += run_len;
    }
    Ok(())
}

#[inline]
fn delta_len(old: u8, presym: u32) -> u8 {
    ((17 + u32::from(old) - presym) % 17) as u8
}

#[derive(Clone, Copy)]
enum Item {
    Literal(u8),
    /// `adjusted_offset` below [`NUM_RECENT_OFFSETS`] names a queue slot.
    Match {
        length: u32,
        adjusted_offset: u32,
    },
}

const HASH_BITS: u32 = 15;
const CHAIN_DEPTH: u32 = 48;

#[inline]
fn hash3(data: &[u8], pos: usize) -> usize {
    let v = u32::from(data[pos])
        | (u32::from(data[pos + 1]) << 8)
        | (u32::from(data[pos + 2]) << 16);
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

/// Greedy compressor emitting one verbatim block per chunk.
#[derive(Debug)]
pub struct LzxCompressor {
    window_order: u32,
    num_main_syms: usize,
    head: Vec<u32>,
    prev: Vec<u32>,
    buf: Vec<u8>,
}

impl LzxCompressor {
    pub fn new(max_block_size: u32) -> Self {
        let window_order = max_block_size.trailing_zeros();
        debug_assert!((15..=21).contains(&window_order));
        LzxCompressor {
            window_order,
            num_main_syms: NUM_CHARS + num_offset_slots(window_order) * NUM_LEN_HEADERS,
            head: vec![u32::MAX; 1 << HASH_BITS],
            prev: vec![0; max_block_size as usize],
            buf: Vec::new(),
        }
    }

    pub fn compress(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        debug_assert!(data.len() <= self.prev.len());
        self.head.fill(u32::MAX);
        self.buf.clear();
        self.buf.extend_from_slice(data);
        e8_apply(&mut self.buf);

        let mut main_freqs = vec![0u32; self.num_main_syms];
        let mut len_freqs = [0u32; LENCODE_NUM_SYMBOLS];
        let mut items: Vec<Item> = Vec::with_capacity(data.len() / 2);

        let mut recent = [1u32; NUM_RECENT_OFFSETS];
        let data = &self.buf[..];
        let mut pos = 0usize;
        while pos < data.len() {
            let max_len = (data.len() - pos).min(MAX_MATCH_LEN);

            // Repeat offsets are cheap, so check the queue first.
            let mut rep_len = 0usize;
            let mut rep_slot = 0usize;
            for (slot, &off) in recent.iter().enumerate() {
                let off = off as usize;
                if off <= pos {
                    let len = common_prefix(data, pos - off, pos, max_len);
                    if len > rep_len {
                        rep_len = len;
                        rep_slot = slot;
                    }
                }
            }

            let (exp_len, exp_offset) =
                find_match(&self.head, &self.prev, data, pos, max_len);

            let (length, adjusted_offset) = if rep_len >= 3 && rep_len + 1 >= exp_len {
                let offset = recent[rep_slot];
                recent[rep_slot] = recent[0];
                recent[0] = offset;
                (rep_len, rep_slot as u32)
            } else if exp_len >= 3 {
                recent[2] = recent[1];
                recent[1] = recent[0];
                recent[0] = exp_offset as u32;
                (exp_len, exp_offset as u32 + OFFSET_ADJUSTMENT)
            } else {
                main_freqs[usize::from(data[pos])] += 1;
                items.push(Item::Literal(data[pos]));
                if pos + 3 <= data.len() {
                    insert_hash(&mut self.head, &mut self.prev, data, pos);
                }
                pos += 1;
                continue;
            };

            let len_hdr = (length - MIN_MATCH_LEN).min(NUM_PRIMARY_LENS);
            let slot = if adjusted_offset < NUM_RECENT_OFFSETS as u32 {
                adjusted_offset as usize
            } else {
                offset_slot(adjusted_offset)
            };
            main_freqs[NUM_CHARS + slot * NUM_LEN_HEADERS + len_hdr] += 1;
            if len_hdr == NUM_PRIMARY_LENS {
                len_freqs[length - MIN_MATCH_LEN - NUM_PRIMARY_LENS] += 1;
            }
            items.push(Item::Match {
                length: length as u32,
                adjusted_offset,
            });
            for p in pos..(pos + length).min(data.len().saturating_sub(2)) {
                insert_hash(&mut self.head, &mut self.prev, data, p);
            }
            pos += length;
        }

        let mut main_lens = vec![0u8; self.num_main_syms];
        let mut main_codewords = vec![0u32; self.num_main_syms];
        make_canonical_code(
            &main_freqs,
            MAX_MAIN_CODEWORD_LEN,
            &mut main_lens,
            &mut main_codewords,
        );
        let mut len_lens = [0u8; LENCODE_NUM_SYMBOLS];
        let mut len_codewords = [0u32; LENCODE_NUM_SYMBOLS];
        make_canonical_code(
            &len_freqs,
            MAX_MAIN_CODEWORD_LEN,
            &mut len_lens,
            &mut len_codewords,
        );

        let mut os = Bitwriter::new();

        // Verbatim block header.
        os.put_bits(BLOCKTYPE_VERBATIM, 3);
        if data.len() == DEFAULT_BLOCK_SIZE {
            os.put_bits(1, 1);
        } else {
            os.put_bits(0, 1);
            if self.window_order >= 16 {
                os.put_bits((data.len() >> 8) as u32, 16);
                os.put_bits((data.len() & 0xFF) as u32, 8);
            } else {
                os.put_bits(data.len() as u32, 16);
            }
        }

        write_codeword_lens(&mut os, &main_lens[..NUM_CHARS]);
        write_codeword_lens(&mut os, &main_lens[NUM_CHARS..]);
        write_codeword_lens(&mut os, &len_lens);

        for item in &items {
            match *item {
                Item::Literal(b) => {
                    let sym = usize::from(b);
                    os.put_bits(main_codewords[sym], u32::from(main_lens[sym]));
                }
                Item::Match {
                    length,
                    adjusted_offset,
                } => {
                    let length = length as usize;
                    let len_hdr = (length - MIN_MATCH_LEN).min(NUM_PRIMARY_LENS);
                    let slot = if adjusted_offset < NUM_RECENT_OFFSETS as u32 {
                        adjusted_offset as usize
                    } else {
                        offset_slot(adjusted_offset)
                    };
                    let sym = NUM_CHARS + slot * NUM_LEN_HEADERS + len_hdr;
                    os.put_bits(main_codewords[sym], u32::from(main_lens[sym]));
                    if len_hdr == NUM_PRIMARY_LENS {
                        let lensym = length - MIN_MATCH_LEN - NUM_PRIMARY_LENS;
                        os.put_bits(len_codewords[lensym], u32::from(len_lens[lensym]));
                    }
                    if slot >= NUM_RECENT_OFFSETS {
                        os.put_bits(
                            adjusted_offset - OFFSET_SLOT_BASE[slot],
                            EXTRA_OFFSET_BITS[slot],
                        );
                    }
                }
            }
            if os.byte_len() >= data.len() {
                return None;
            }
        }

        let out = os.finish();
        (out.len() < data.len()).then_some(out)
    }

}

#[inline]
fn insert_hash(head: &mut [u32], prev: &mut [u32], data: &[u8], pos: usize) {
    let h = hash3(data, pos);
    prev[pos] = head[h];
    head[h] = pos as u32;
}

fn find_match(
    head: &[u32],
    prev: &[u32],
    data: &[u8],
    pos: usize,
    max_len: usize,
) -> (usize, usize) {
    if pos + 3 > data.len() {
        return (0, 0);
    }
    let mut best_len = 0usize;
    let mut best_offset = 0usize;
    let mut cand = head[hash3(data, pos)];
    let mut depth = CHAIN_DEPTH;
    while cand != u32::MAX && depth > 0 {
        let cpos = cand as usize;
        let len = common_prefix(data, cpos, pos, max_len);
        if len > best_len {
            best_len = len;
            best_offset = pos - cpos;
            if len == max_len {
                break;
            }
        }
        cand = prev[cpos];
        depth -= 1;
    }
    (best_len, best_offset)
}

/// Emit codeword lengths through the precode, delta-coded against an
/// all-zero previous block (this compressor writes one block per chunk).
fn write_codeword_lens(os: &mut Bitwriter, lens: &[u8]) {
    let mut precode_freqs = [0u32; PRECODE_NUM_SYMBOLS];
    for &len in lens {
        let presym = (17 - u32::from(len)) % 17;
        precode_freqs[presym as usize] += 1;
    }
    let mut precode_lens = [0u8; PRECODE_NUM_SYMBOLS];
    let mut precode_codewords = [0u32; PRECODE_NUM_SYMBOLS];
    make_canonical_code(
        &precode_freqs,
        MAX_PRE_CODEWORD_LEN,
        &mut precode_lens,
        &mut precode_codewords,
    );

    for &len in &precode_lens {
        os.put_bits(u32::from(len), 4);
    }
    for &len in lens {
        let presym = ((17 - u32::from(len)) % 17) as usize;
        os.put_bits(precode_codewords[presym], u32::from(precode_lens[presym]));
    }
}

#[inline]
fn common_prefix(data: &[u8], a: usize, b: usize, max_len: usize) -> usize {
    let mut n = 0;
    while n < max_len && data[a + n] == data[b + n] {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_with(order: u32, data: &[u8]) {
        let size = 1u32 << order;
        let mut c = LzxCompressor::new(size);
        let mut d = LzxDecompressor::new(size).unwrap();
        if let Some(compressed) = c.compress(data) {
            assert!(compressed.len() < data.len());
            let mut out = vec![0u8; data.len()];
            d.decompress(&compressed, &mut out).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn roundtrip_text() {
        let data: Vec<u8> = b"It was the best of times, it was the worst of times. "
            .iter()
            .copied()
            .cycle()
            .take(32768)
            .collect();
        roundtrip_with(15, &data);
    }

    #[test]
    fn roundtrip_default_block_size_flag() {
        // Exactly 32KiB exercises the default-block-size header bit.
        let data = vec![0x41u8; DEFAULT_BLOCK_SIZE];
        roundtrip_with(15, &data);
    }

    #[test]
    fn roundtrip_large_window() {
        let mut data = Vec::with_capacity(1 << 17);
        for i in 0..(1usize << 17) {
            data.push((i % 251) as u8 ^ ((i / 4096) as u8));
        }
        roundtrip_with(17, &data);
    }

    #[test]
    fn roundtrip_e8_heavy() {
        // Synthetic x86-ish code with call displacements, forcing the E8
        // filter through both good and compensating translations.
        let mut data = Vec::new();
        while data.len() < 24000 {
            data.extend_from_slice(&[0x55, 0x89, 0xE5]);
            data.push(0xE8);
            let rel = -(data.len() as i32) / 2;
            data.extend_from_slice(&rel.to_le_bytes());
            data.extend_from_slice(&[0x90; 7]);
            data.push(0xE8);
            data.extend_from_slice(&0x1234i32.to_le_bytes());
        }
        roundtrip_with(15, &data);
    }

    #[test]
    fn e8_filter_is_involutive() {
        let mut data = Vec::new();
        for i in 0..2000u32 {
            data.push(if i % 9 == 0 { 0xE8 } else { (i % 256) as u8 });
        }
        let orig = data.clone();
        e8_apply(&mut data);
        e8_undo(&mut data);
        assert_eq!(data, orig);
    }

    #[test]
    fn offset_slot_table_consistent() {
        for slot in 0..MAX_OFFSET_SLOTS {
            let width = OFFSET_SLOT_BASE[slot + 1] - OFFSET_SLOT_BASE[slot];
            assert_eq!(width, 1 << EXTRA_OFFSET_BITS[slot], "slot {slot}");
            assert_eq!(offset_slot(OFFSET_SLOT_BASE[slot]), slot);
            assert_eq!(offset_slot(OFFSET_SLOT_BASE[slot + 1] - 1), slot);
        }
        assert_eq!(num_offset_slots(15), 30);
        assert_eq!(num_offset_slots(16), 32);
        assert_eq!(num_offset_slots(21), 50);
    }

    #[test]
    fn rejects_truncated_garbage() {
        let mut d = LzxDecompressor::new(1 << 15).unwrap();
        let mut out = vec![0u8; 1024];
        // All-zero input decodes an empty precode, which cannot produce
        // any symbol; construction rejects it.
        assert!(d.decompress(&[0u8; 8], &mut out).is_err());
    }
}
