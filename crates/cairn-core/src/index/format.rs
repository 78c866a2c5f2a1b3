//! Version 2 pack-index binary format.
//!
//! Layout: a fixed 17-byte header, `entry_count` sorted entries of
//! `key_size + entry_size` bytes, `pack_count` pack records of 5 bytes,
//! `format_count` format records of 6 bytes, then an extra-data region
//! holding pack blob names. Multi-byte integers are big-endian.
//!
//! Entry body (16..=19 bytes; the builder picks the smallest size that
//! fits the dataset):
//!
//! ```text
//!   0-3   timestamp seconds, relative to the header base timestamp
//!   4-7   pack offset bits 0..30; bit 31 = deleted flag
//!   8-10  original length bits 0..23
//!  11-13  packed length bits 0..23
//!  14-15  pack-ID index, low 16 bits
//!    16   format-ID index            (present when >1 unique format)
//!    17   pack-ID index bits 16..23  (present when >2^16 packs)
//!    18   original length bits 24..27 in the high nibble,
//!         packed length bits 24..27 in the low nibble
//!                                    (present when any length >= 2^24)
//! ```

use std::collections::HashMap;
use std::io::Write;

use cairn_types::blob_id::BlobId;
use cairn_types::content_id::ContentId;

use crate::error::{CairnError, Result};

use super::{ContentInfo, IdRange};

/// Index format version written and understood by this module.
pub const INDEX_VERSION: u8 = 2;

const V2_HEADER_SIZE: usize = 17;
const V2_PACK_INFO_SIZE: u64 = 5;
const V2_FORMAT_INFO_SIZE: u64 = 6;
const V2_MAX_FORMAT_COUNT: usize = 255;
const V2_MAX_UNIQUE_PACK_COUNT: usize = 1 << 24;
const V2_MAX_SHORT_PACK_COUNT: usize = 1 << 16;
const V2_MAX_CONTENT_LENGTH: u32 = 1 << 28;
const V2_MAX_SHORT_CONTENT_LENGTH: u32 = 1 << 24;
const V2_MAX_PACK_OFFSET: u32 = 1 << 30;
const V2_DELETED_MARKER: u32 = 0x8000_0000;
const V2_PACK_OFFSET_MASK: u32 = 0x7fff_ffff;

const V2_ENTRY_MIN_LENGTH: usize = 16;
const V2_ENTRY_MAX_LENGTH: usize = 19;
const V2_MAX_ENTRY_STRIDE: usize = 256;

const ENTRY_OFFSET_TIMESTAMP: usize = 0;
const ENTRY_OFFSET_PACK_OFFSET_AND_FLAGS: usize = 4;
const ENTRY_OFFSET_ORIGINAL_LENGTH: usize = 8;
const ENTRY_OFFSET_PACKED_LENGTH: usize = 11;
const ENTRY_OFFSET_PACK_BLOB_ID: usize = 14;
const ENTRY_OFFSET_FORMAT_ID: usize = 16;
const ENTRY_OFFSET_EXTENDED_PACK_BLOB_ID: usize = 17;
const ENTRY_OFFSET_HIGH_LENGTH_BITS: usize = 18;
const HIGH_LENGTH_SHIFT: u32 = 24;

/// Positioned reads over an index source. `buf` must be filled completely;
/// a short read is an error.
pub trait ReadAt: Send + Sync {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    fn size(&self) -> u64;
}

impl<T> ReadAt for T
where
    T: AsRef<[u8]> + Send + Sync,
{
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let data = self.as_ref();
        let start = usize::try_from(offset)
            .map_err(|_| CairnError::InvalidIndex("read offset out of range".into()))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| CairnError::InvalidIndex("short read".into()))?;
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.as_ref().len() as u64
    }
}

/// One unique content-encoding format referenced by index entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FormatInfo {
    compression_header_id: u32,
    format_version: u8,
    encryption_key_id: u8,
}

impl FormatInfo {
    fn of(info: &ContentInfo) -> Self {
        Self {
            compression_header_id: info.compression_header_id,
            format_version: info.format_version,
            encryption_key_id: info.encryption_key_id,
        }
    }
}

#[derive(Debug, Clone)]
struct HeaderInfo {
    key_size: usize,
    entry_size: usize,
    entry_count: usize,
    pack_count: u32,
    format_count: u8,
    base_timestamp: u32,

    // derived
    stride: usize,
    entries_offset: u64,
    packs_offset: u64,
    formats_offset: u64,
}

/// Read-only view of one v2 pack index. Lookups are O(log N) positioned
/// reads; iteration streams entries in key order. The underlying reader is
/// released when the index is dropped.
pub struct PackIndex {
    reader: Box<dyn ReadAt>,
    hdr: HeaderInfo,
    formats: Vec<FormatInfo>,
}

impl PackIndex {
    /// Parse and validate the header, pre-reading the formats table.
    pub fn open(reader: Box<dyn ReadAt>) -> Result<Self> {
        let mut header = [0u8; V2_HEADER_SIZE];
        reader
            .read_exact_at(&mut header, 0)
            .map_err(|_| CairnError::InvalidIndex("invalid header".into()))?;

        if header[0] != INDEX_VERSION {
            return Err(CairnError::InvalidIndex(format!(
                "unsupported index version: {}",
                header[0]
            )));
        }

        let hdr = HeaderInfo {
            key_size: header[1] as usize,
            entry_size: be16(&header[2..4]) as usize,
            entry_count: be32(&header[4..8]) as usize,
            pack_count: be32(&header[8..12]),
            format_count: header[12],
            base_timestamp: be32(&header[13..17]),
            stride: 0,
            entries_offset: 0,
            packs_offset: 0,
            formats_offset: 0,
        };

        if hdr.key_size <= 1
            || hdr.entry_size < V2_ENTRY_MIN_LENGTH
            || hdr.entry_size > V2_ENTRY_MAX_LENGTH
        {
            return Err(CairnError::InvalidIndex("invalid header".into()));
        }

        let stride = hdr.key_size + hdr.entry_size;
        if stride > V2_MAX_ENTRY_STRIDE {
            return Err(CairnError::InvalidIndex(
                "invalid header: entry stride too big".into(),
            ));
        }

        let entries_offset = V2_HEADER_SIZE as u64;
        let packs_offset = entries_offset + (hdr.entry_count as u64) * (stride as u64);
        let formats_offset = packs_offset + u64::from(hdr.pack_count) * V2_PACK_INFO_SIZE;

        if formats_offset + u64::from(hdr.format_count) * V2_FORMAT_INFO_SIZE > reader.size() {
            return Err(CairnError::InvalidIndex("truncated index".into()));
        }
        if hdr.entry_count > 0 && hdr.format_count == 0 {
            return Err(CairnError::InvalidIndex("missing formats table".into()));
        }

        let mut formats_buf = vec![0u8; hdr.format_count as usize * V2_FORMAT_INFO_SIZE as usize];
        reader
            .read_exact_at(&mut formats_buf, formats_offset)
            .map_err(|_| CairnError::InvalidIndex("unable to read formats table".into()))?;

        let formats = formats_buf
            .chunks_exact(V2_FORMAT_INFO_SIZE as usize)
            .map(|f| FormatInfo {
                compression_header_id: be32(&f[0..4]),
                format_version: f[4],
                encryption_key_id: f[5],
            })
            .collect();

        Ok(Self {
            reader,
            hdr: HeaderInfo {
                stride,
                entries_offset,
                packs_offset,
                formats_offset,
                ..hdr
            },
            formats,
        })
    }

    pub fn approximate_count(&self) -> usize {
        self.hdr.entry_count
    }

    /// Look up one content ID. Returns `None` when not present.
    pub fn get_info(&self, content_id: &ContentId) -> Result<Option<ContentInfo>> {
        let key = content_id.key_bytes();
        if key.len() != self.hdr.key_size {
            return Err(CairnError::InvalidIndex(format!(
                "invalid content ID '{content_id}': key length {} vs {}",
                key.len(),
                self.hdr.key_size
            )));
        }

        let mut entry = vec![0u8; self.hdr.stride];
        let pos = self.find_key_position(&key, &mut entry)?;
        if pos >= self.hdr.entry_count {
            return Ok(None);
        }

        self.read_entry(pos, &mut entry)?;
        if entry[..key.len()] != key[..] {
            return Ok(None);
        }

        let id = ContentId::from_key_bytes(&entry[..self.hdr.key_size])?;
        Ok(Some(self.decode_entry(id, &entry[self.hdr.key_size..])?))
    }

    /// Invoke `cb` for every entry within `range`, in ascending key order.
    /// Callback errors terminate the iteration and propagate unchanged.
    pub fn iterate(
        &self,
        range: &IdRange,
        cb: &mut dyn FnMut(ContentInfo) -> Result<()>,
    ) -> Result<()> {
        for item in self.iter(range)? {
            cb(item?)?;
        }
        Ok(())
    }

    /// Streaming iterator over the entries within `range`.
    pub fn iter(&self, range: &IdRange) -> Result<PackIndexIter<'_>> {
        let pos = self.find_entry_ge(&range.start)?;
        Ok(PackIndexIter {
            index: self,
            pos,
            end: range.end.clone(),
            buf: vec![0u8; self.hdr.stride],
            done: false,
        })
    }

    fn entry_offset(&self, pos: usize) -> u64 {
        self.hdr.entries_offset + (pos as u64) * (self.hdr.stride as u64)
    }

    fn read_entry(&self, pos: usize, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact_at(buf, self.entry_offset(pos))
    }

    /// First position whose decoded ID is >= `bound` (string comparison).
    fn find_entry_ge(&self, bound: &str) -> Result<usize> {
        let mut buf = vec![0u8; self.hdr.stride];
        let (mut lo, mut hi) = (0usize, self.hdr.entry_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.read_entry(mid, &mut buf)?;
            let id = ContentId::from_key_bytes(&buf[..self.hdr.key_size])?;
            if id.as_str() >= bound {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// First position whose key bytes are >= `key`.
    fn find_key_position(&self, key: &[u8], buf: &mut [u8]) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.hdr.entry_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.read_entry(mid, buf)?;
            if &buf[..key.len()] >= key {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    fn pack_blob_id_at(&self, index: u32) -> Result<BlobId> {
        if index >= self.hdr.pack_count {
            return Err(CairnError::InvalidIndex(format!(
                "pack index {index} out of range"
            )));
        }

        let mut record = [0u8; V2_PACK_INFO_SIZE as usize];
        self.reader.read_exact_at(
            &mut record,
            self.hdr.packs_offset + u64::from(index) * V2_PACK_INFO_SIZE,
        )?;

        let name_len = record[0] as usize;
        let name_offset = u64::from(be32(&record[1..5]));

        let mut name = vec![0u8; name_len];
        self.reader.read_exact_at(&mut name, name_offset)?;

        String::from_utf8(name)
            .map(BlobId::from)
            .map_err(|_| CairnError::InvalidIndex("pack blob name is not UTF-8".into()))
    }

    fn decode_entry(&self, content_id: ContentId, e: &[u8]) -> Result<ContentInfo> {
        if e.len() < V2_ENTRY_MIN_LENGTH {
            return Err(CairnError::InvalidIndex(format!(
                "invalid entry length: {}",
                e.len()
            )));
        }

        let timestamp_seconds = i64::from(be32(&e[ENTRY_OFFSET_TIMESTAMP..]))
            + i64::from(self.hdr.base_timestamp);

        let offset_and_flags = be32(&e[ENTRY_OFFSET_PACK_OFFSET_AND_FLAGS..]);
        let deleted = offset_and_flags & V2_DELETED_MARKER != 0;
        let pack_offset = offset_and_flags & V2_PACK_OFFSET_MASK;

        let mut original_length = be24(&e[ENTRY_OFFSET_ORIGINAL_LENGTH..]);
        let mut packed_length = be24(&e[ENTRY_OFFSET_PACKED_LENGTH..]);
        if e.len() > ENTRY_OFFSET_HIGH_LENGTH_BITS {
            let high = e[ENTRY_OFFSET_HIGH_LENGTH_BITS];
            original_length |= u32::from(high >> 4) << HIGH_LENGTH_SHIFT;
            packed_length |= u32::from(high & 0x0f) << HIGH_LENGTH_SHIFT;
        }

        let mut pack_index = u32::from(be16(&e[ENTRY_OFFSET_PACK_BLOB_ID..]));
        if e.len() > ENTRY_OFFSET_EXTENDED_PACK_BLOB_ID {
            pack_index |= u32::from(e[ENTRY_OFFSET_EXTENDED_PACK_BLOB_ID]) << 16;
        }

        let format_index = if e.len() > ENTRY_OFFSET_FORMAT_ID {
            e[ENTRY_OFFSET_FORMAT_ID] as usize
        } else {
            0
        };
        let format = self.formats.get(format_index).copied().ok_or_else(|| {
            CairnError::InvalidIndex(format!("format index {format_index} out of range"))
        })?;

        Ok(ContentInfo {
            content_id,
            timestamp_seconds,
            pack_blob_id: self.pack_blob_id_at(pack_index)?,
            pack_offset,
            original_length,
            packed_length,
            compression_header_id: format.compression_header_id,
            format_version: format.format_version,
            encryption_key_id: format.encryption_key_id,
            deleted,
        })
    }
}

impl std::fmt::Debug for PackIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackIndex")
            .field("entries", &self.hdr.entry_count)
            .field("packs", &self.hdr.pack_count)
            .field("formats", &self.formats.len())
            .finish()
    }
}

/// Iterator over index entries within a range, in ascending key order.
pub struct PackIndexIter<'a> {
    index: &'a PackIndex,
    pos: usize,
    end: String,
    buf: Vec<u8>,
    done: bool,
}

impl Iterator for PackIndexIter<'_> {
    type Item = Result<ContentInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.index.hdr.entry_count {
            return None;
        }

        if let Err(e) = self.index.read_entry(self.pos, &mut self.buf) {
            self.done = true;
            return Some(Err(e));
        }

        let id = match ContentId::from_key_bytes(&self.buf[..self.index.hdr.key_size]) {
            Ok(id) => id,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        if id.as_str() >= self.end.as_str() {
            self.done = true;
            return None;
        }

        self.pos += 1;
        Some(
            self.index
                .decode_entry(id, &self.buf[self.index.hdr.key_size..]),
        )
    }
}

/// Encode `sorted` (ascending by content ID, unique) as a v2 index.
pub(super) fn build_v2(sorted: &[&ContentInfo], out: &mut dyn Write) -> Result<()> {
    let first = sorted
        .first()
        .ok_or_else(|| CairnError::InvalidIndex("cannot build an empty index".into()))?;

    let key_len = first.content_id.key_len();
    if key_len <= 1 {
        return Err(CairnError::InvalidIndex(format!(
            "invalid key length: {key_len}"
        )));
    }

    // Unique format and pack tables, in first-appearance order.
    let mut formats: Vec<FormatInfo> = Vec::new();
    let mut format_map: HashMap<FormatInfo, u8> = HashMap::new();
    let mut packs: Vec<BlobId> = Vec::new();
    let mut pack_map: HashMap<BlobId, usize> = HashMap::new();

    let mut max_length = 0u32;
    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;

    for info in sorted {
        if info.content_id.key_len() != key_len {
            return Err(CairnError::InvalidIndex(format!(
                "inconsistent key length: {} vs {key_len}",
                info.content_id.key_len()
            )));
        }
        if info.packed_length >= V2_MAX_CONTENT_LENGTH
            || info.original_length >= V2_MAX_CONTENT_LENGTH
        {
            return Err(CairnError::InvalidIndex(format!(
                "content length too high (packed {}, original {}, max {})",
                info.packed_length, info.original_length, V2_MAX_CONTENT_LENGTH
            )));
        }
        if info.pack_offset >= V2_MAX_PACK_OFFSET {
            return Err(CairnError::InvalidIndex(format!(
                "pack offset {} is too high",
                info.pack_offset
            )));
        }
        if info.timestamp_seconds < 0 {
            return Err(CairnError::InvalidIndex(
                "negative entry timestamp".into(),
            ));
        }
        if info.pack_blob_id.as_str().len() > u8::MAX as usize {
            return Err(CairnError::InvalidIndex(
                "pack blob name too long".into(),
            ));
        }

        let f = FormatInfo::of(info);
        if !format_map.contains_key(&f) {
            format_map.insert(f, formats.len() as u8);
            formats.push(f);
        }
        if !pack_map.contains_key(&info.pack_blob_id) {
            pack_map.insert(info.pack_blob_id.clone(), packs.len());
            packs.push(info.pack_blob_id.clone());
        }

        max_length = max_length.max(info.packed_length).max(info.original_length);
        min_ts = min_ts.min(info.timestamp_seconds);
        max_ts = max_ts.max(info.timestamp_seconds);
    }

    if formats.len() > V2_MAX_FORMAT_COUNT {
        return Err(CairnError::InvalidIndex(format!(
            "too many unique formats: {} (max {V2_MAX_FORMAT_COUNT})",
            formats.len()
        )));
    }
    if packs.len() > V2_MAX_UNIQUE_PACK_COUNT {
        return Err(CairnError::InvalidIndex(format!(
            "too many unique pack IDs: {} (max {V2_MAX_UNIQUE_PACK_COUNT})",
            packs.len()
        )));
    }

    // Base timestamp: minimum entry timestamp, so relative values fit u32.
    let base_timestamp =
        u32::try_from(min_ts).map_err(|_| CairnError::InvalidIndex("timestamp too high".into()))?;
    if u32::try_from(max_ts - i64::from(base_timestamp)).is_err() {
        return Err(CairnError::InvalidIndex("timestamp span too wide".into()));
    }

    // Smallest entry size that fits the dataset.
    let mut entry_size = V2_ENTRY_MIN_LENGTH;
    if formats.len() > 1 {
        entry_size = entry_size.max(ENTRY_OFFSET_FORMAT_ID + 1);
    }
    if packs.len() > V2_MAX_SHORT_PACK_COUNT {
        entry_size = entry_size.max(ENTRY_OFFSET_EXTENDED_PACK_BLOB_ID + 1);
    }
    if max_length >= V2_MAX_SHORT_CONTENT_LENGTH {
        entry_size = entry_size.max(ENTRY_OFFSET_HIGH_LENGTH_BITS + 1);
    }

    // Extra-data region: pack blob names in pack-table order.
    let mut extra_data: Vec<u8> = Vec::new();
    let mut name_offsets: Vec<u32> = Vec::with_capacity(packs.len());
    for pack in &packs {
        name_offsets.push(extra_data.len() as u32);
        extra_data.extend_from_slice(pack.as_str().as_bytes());
    }
    let extra_data_offset = V2_HEADER_SIZE as u32
        + (sorted.len() * (key_len + entry_size)) as u32
        + (packs.len() as u32) * V2_PACK_INFO_SIZE as u32
        + (formats.len() as u32) * V2_FORMAT_INFO_SIZE as u32;

    // Header.
    let mut header = [0u8; V2_HEADER_SIZE];
    header[0] = INDEX_VERSION;
    header[1] = key_len as u8;
    header[2..4].copy_from_slice(&(entry_size as u16).to_be_bytes());
    header[4..8].copy_from_slice(&(sorted.len() as u32).to_be_bytes());
    header[8..12].copy_from_slice(&(packs.len() as u32).to_be_bytes());
    header[12] = formats.len() as u8;
    header[13..17].copy_from_slice(&base_timestamp.to_be_bytes());
    out.write_all(&header)?;

    // Sorted entries.
    for info in sorted {
        out.write_all(&info.content_id.key_bytes())?;

        let mut e = [0u8; V2_ENTRY_MAX_LENGTH];
        let rel_ts = (info.timestamp_seconds - i64::from(base_timestamp)) as u32;
        e[ENTRY_OFFSET_TIMESTAMP..ENTRY_OFFSET_TIMESTAMP + 4]
            .copy_from_slice(&rel_ts.to_be_bytes());

        let mut offset_and_flags = info.pack_offset;
        if info.deleted {
            offset_and_flags |= V2_DELETED_MARKER;
        }
        e[ENTRY_OFFSET_PACK_OFFSET_AND_FLAGS..ENTRY_OFFSET_PACK_OFFSET_AND_FLAGS + 4]
            .copy_from_slice(&offset_and_flags.to_be_bytes());

        put_be24(&mut e[ENTRY_OFFSET_ORIGINAL_LENGTH..], info.original_length);
        put_be24(&mut e[ENTRY_OFFSET_PACKED_LENGTH..], info.packed_length);

        let pack_index = pack_map[&info.pack_blob_id];
        e[ENTRY_OFFSET_PACK_BLOB_ID..ENTRY_OFFSET_PACK_BLOB_ID + 2]
            .copy_from_slice(&(pack_index as u16).to_be_bytes());
        e[ENTRY_OFFSET_FORMAT_ID] = format_map[&FormatInfo::of(info)];
        e[ENTRY_OFFSET_EXTENDED_PACK_BLOB_ID] = (pack_index >> 16) as u8;
        e[ENTRY_OFFSET_HIGH_LENGTH_BITS] = ((info.packed_length >> HIGH_LENGTH_SHIFT) as u8)
            | (((info.original_length >> HIGH_LENGTH_SHIFT) as u8) << 4);

        debug_assert!(
            e[entry_size..].iter().all(|b| *b == 0),
            "entry bits beyond the selected entry size must be zero"
        );
        out.write_all(&e[..entry_size])?;
    }

    // Pack records.
    for (pack, offset) in packs.iter().zip(&name_offsets) {
        let mut record = [0u8; V2_PACK_INFO_SIZE as usize];
        record[0] = pack.as_str().len() as u8;
        record[1..5].copy_from_slice(&(extra_data_offset + offset).to_be_bytes());
        out.write_all(&record)?;
    }

    // Format records.
    for f in &formats {
        let mut record = [0u8; V2_FORMAT_INFO_SIZE as usize];
        record[0..4].copy_from_slice(&f.compression_header_id.to_be_bytes());
        record[4] = f.format_version;
        record[5] = f.encryption_key_id;
        out.write_all(&record)?;
    }

    out.write_all(&extra_data)?;
    Ok(())
}

fn be16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be24(b: &[u8]) -> u32 {
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn put_be24(b: &mut [u8], v: u32) {
    b[0] = (v >> 16) as u8;
    b[1] = (v >> 8) as u8;
    b[2] = v as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Builder;

    fn info(id: &str, ts: i64, pack: &str, offset: u32) -> ContentInfo {
        ContentInfo {
            content_id: ContentId::parse(id).unwrap(),
            timestamp_seconds: ts,
            pack_blob_id: BlobId::from(pack),
            pack_offset: offset,
            original_length: 100,
            packed_length: 80,
            compression_header_id: 0,
            format_version: 1,
            encryption_key_id: 0,
            deleted: false,
        }
    }

    fn build_index(infos: Vec<ContentInfo>) -> PackIndex {
        let mut b = Builder::new();
        for i in infos {
            b.add(i);
        }
        let mut buf = Vec::new();
        b.build(&mut buf).unwrap();
        PackIndex::open(Box::new(buf)).unwrap()
    }

    fn ids_in_range(ndx: &PackIndex, range: IdRange) -> Vec<String> {
        let mut out = Vec::new();
        ndx.iterate(&range, &mut |i| {
            out.push(i.content_id.to_string());
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn roundtrip_three_entries() {
        let mut deleted = info("de1e1e", 4, "xx", 111);
        deleted.deleted = true;

        let ndx = build_index(vec![
            ContentInfo {
                original_length: 100,
                packed_length: 80,
                ..info("aabbcc", 1, "xx", 11)
            },
            ContentInfo {
                original_length: 200,
                packed_length: 200,
                ..info("ddeeff", 1, "xx", 111)
            },
            deleted,
        ]);

        assert_eq!(ndx.approximate_count(), 3);

        let i = ndx
            .get_info(&ContentId::parse("ddeeff").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(i.pack_offset, 111);
        assert_eq!(i.original_length, 200);
        assert_eq!(i.packed_length, 200);
        assert_eq!(i.timestamp_seconds, 1);
        assert_eq!(i.pack_blob_id, BlobId::from("xx"));
        assert!(!i.deleted);

        let i = ndx
            .get_info(&ContentId::parse("de1e1e").unwrap())
            .unwrap()
            .unwrap();
        assert!(i.deleted);
        assert_eq!(i.timestamp_seconds, 4);

        assert_eq!(
            ids_in_range(&ndx, IdRange::all()),
            vec!["aabbcc", "ddeeff", "de1e1e"]
        );
    }

    #[test]
    fn get_info_missing_returns_none() {
        let ndx = build_index(vec![info("aabbcc", 1, "xx", 0)]);
        assert!(ndx
            .get_info(&ContentId::parse("bbccdd").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn get_info_rejects_mismatched_key_length() {
        let ndx = build_index(vec![info("aabbcc", 1, "xx", 0)]);
        assert!(ndx.get_info(&ContentId::parse("aabbccdd").unwrap()).is_err());
    }

    #[test]
    fn iterate_ranges() {
        let ndx = build_index(vec![
            info("aabbcc", 1, "xx", 0),
            info("ddeeff", 1, "xx", 0),
            info("de1e1e", 1, "xx", 0),
            info("k010203", 1, "xx", 0),
            info("xaabbcc", 1, "xx", 0),
        ]);

        assert_eq!(
            ids_in_range(&ndx, IdRange::all()),
            vec!["aabbcc", "ddeeff", "de1e1e", "k010203", "xaabbcc"]
        );
        assert_eq!(
            ids_in_range(&ndx, IdRange::new("a", "e")),
            vec!["aabbcc", "ddeeff", "de1e1e"]
        );
        assert_eq!(
            ids_in_range(&ndx, IdRange::new("dd", "df")),
            vec!["ddeeff", "de1e1e"]
        );
        assert_eq!(ids_in_range(&ndx, IdRange::prefixed("dd")), vec!["ddeeff"]);
        assert_eq!(ids_in_range(&ndx, IdRange::new("zz", "zzz")), Vec::<String>::new());

        // Strictly ascending.
        let all = ids_in_range(&ndx, IdRange::all());
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
    }

    #[test]
    fn iterate_callback_error_propagates() {
        let ndx = build_index(vec![info("aabbcc", 1, "xx", 0), info("ddeeff", 1, "xx", 0)]);
        let err = ndx
            .iterate(&IdRange::all(), &mut |_| {
                Err(CairnError::Other("stop".into()))
            })
            .unwrap_err();
        assert!(matches!(err, CairnError::Other(msg) if msg == "stop"));
    }

    #[test]
    fn entry_size_grows_only_as_required() {
        // Single format, short lengths: minimal 16-byte entries.
        let ndx = build_index(vec![info("aabbcc", 1, "xx", 0)]);
        assert_eq!(ndx.hdr.entry_size, 16);

        // Second unique format requires the format-ID byte.
        let mut other_format = info("ddeeff", 1, "xx", 0);
        other_format.format_version = 2;
        let ndx = build_index(vec![info("aabbcc", 1, "xx", 0), other_format]);
        assert_eq!(ndx.hdr.entry_size, 17);

        // Lengths >= 2^24 require the high-nibble byte.
        let mut big = info("aabbcc", 1, "xx", 0);
        big.original_length = 20 << 20;
        big.packed_length = 17 << 20;
        let ndx = build_index(vec![big.clone()]);
        assert_eq!(ndx.hdr.entry_size, 19);
        let got = ndx.get_info(&big.content_id).unwrap().unwrap();
        assert_eq!(got.original_length, 20 << 20);
        assert_eq!(got.packed_length, 17 << 20);
    }

    #[test]
    fn entry_size_grows_for_many_packs() {
        let mut b = Builder::new();
        for i in 0..(V2_MAX_SHORT_PACK_COUNT + 1) {
            b.add(info(
                &format!("{i:08x}"),
                1,
                &format!("pack{i}"),
                0,
            ));
        }
        let mut buf = Vec::new();
        b.build(&mut buf).unwrap();
        let ndx = PackIndex::open(Box::new(buf)).unwrap();
        assert_eq!(ndx.hdr.entry_size, 18);

        let probe = ContentId::parse(&format!("{:08x}", V2_MAX_SHORT_PACK_COUNT)).unwrap();
        let got = ndx.get_info(&probe).unwrap().unwrap();
        assert_eq!(
            got.pack_blob_id,
            BlobId::from(format!("pack{}", V2_MAX_SHORT_PACK_COUNT))
        );
    }

    #[test]
    fn build_refuses_oversized_content() {
        let mut b = Builder::new();
        let mut i = info("aabbcc", 1, "xx", 0);
        i.packed_length = V2_MAX_CONTENT_LENGTH;
        b.add(i);
        assert!(b.build(&mut Vec::new()).is_err());
    }

    #[test]
    fn build_refuses_oversized_pack_offset() {
        let mut b = Builder::new();
        b.add(info("aabbcc", 1, "xx", V2_MAX_PACK_OFFSET));
        assert!(b.build(&mut Vec::new()).is_err());
    }

    #[test]
    fn build_refuses_too_many_formats() {
        let mut b = Builder::new();
        for i in 0..=(V2_MAX_FORMAT_COUNT as u32) {
            let mut e = info(&format!("{i:08x}"), 1, "xx", 0);
            e.compression_header_id = i;
            b.add(e);
        }
        assert!(b.build(&mut Vec::new()).is_err());
    }

    #[test]
    fn build_refuses_empty_builder() {
        let b = Builder::new();
        assert!(b.build(&mut Vec::new()).is_err());
    }

    #[test]
    fn build_refuses_inconsistent_key_lengths() {
        let mut b = Builder::new();
        b.add(info("aabbcc", 1, "xx", 0));
        b.add(info("aabbccdd", 1, "xx", 0));
        assert!(b.build(&mut Vec::new()).is_err());
    }

    #[test]
    fn open_rejects_invalid_headers() {
        let mut buf = Vec::new();
        let mut b = Builder::new();
        b.add(info("aabbcc", 1, "xx", 0));
        b.build(&mut buf).unwrap();

        // Wrong version byte.
        let mut bad = buf.clone();
        bad[0] = 3;
        assert!(PackIndex::open(Box::new(bad)).is_err());

        // Key size of 1 is invalid.
        let mut bad = buf.clone();
        bad[1] = 1;
        assert!(PackIndex::open(Box::new(bad)).is_err());

        // Entry size below the minimum.
        let mut bad = buf.clone();
        bad[2..4].copy_from_slice(&15u16.to_be_bytes());
        assert!(PackIndex::open(Box::new(bad)).is_err());

        // Truncated file.
        let bad = buf[..10].to_vec();
        assert!(PackIndex::open(Box::new(bad)).is_err());
    }

    #[test]
    fn base_timestamp_is_applied_on_read() {
        let ndx = build_index(vec![
            info("aabbcc", 1_700_000_001, "xx", 0),
            info("ddeeff", 1_700_000_009, "xx", 0),
        ]);
        assert_eq!(ndx.hdr.base_timestamp, 1_700_000_001);
        let got = ndx
            .get_info(&ContentId::parse("ddeeff").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(got.timestamp_seconds, 1_700_000_009);
    }
}
