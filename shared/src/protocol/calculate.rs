//! Packed raw data gathered from several subdevices
//!
//! Layout (all fields little-endian `u32`; the three header positions are byte
//! offsets from the start of the buffer):
//!
//! ```text
//! +-------+-----------+----------------+--------------+-----------------+
//! | magic | dataCount | rawDataOffsets | rawDataSizes | rawDataOffset   |   header
//! +-------+-----------+----------------+--------------+-----------------+
//! | offsets[dataCount]                                                  |
//! | sizes[dataCount]                                                    |
//! | raw data of subdevice 0, subdevice 1, ...                           |
//! +---------------------------------------------------------------------+
//! ```
//!
//! `offsets[i]` is relative to `rawDataOffset`, so `offsets[0]` is always 0.

use crate::types::result::{MetricsError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Marks a buffer as packed multi-subdevice data
pub const CALCULATE_HEADER_MAGIC: u32 = 0xFFFE_DCBA;

const U32: usize = std::mem::size_of::<u32>();

fn calculate_bincode() -> impl bincode::config::Options {
    bincode::config::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricGroupCalculateHeader {
    pub magic: u32,
    pub data_count: u32,
    /// Byte position of the offsets array
    pub raw_data_offsets: u32,
    /// Byte position of the sizes array
    pub raw_data_sizes: u32,
    /// Byte position of the first subdevice's raw data
    pub raw_data_offset: u32,
}

impl MetricGroupCalculateHeader {
    pub const SIZE: usize = 5 * U32;

    /// Header describing `data_count` parts
    pub fn new(data_count: u32) -> Self {
        let raw_data_offsets = Self::SIZE as u32;
        let raw_data_sizes = raw_data_offsets + data_count * U32 as u32;
        let raw_data_offset = raw_data_sizes + data_count * U32 as u32;
        Self {
            magic: CALCULATE_HEADER_MAGIC,
            data_count,
            raw_data_offsets,
            raw_data_sizes,
            raw_data_offset,
        }
    }

    /// Bytes taken by the header and both tables for `parts` parts
    pub fn prefix_size(parts: usize) -> usize {
        Self::SIZE + 2 * parts * U32
    }

    /// Does `raw` start with a packed header
    pub fn is_packed(raw: &[u8]) -> bool {
        Self::decode(raw).is_some()
    }

    pub fn read_from(raw: &[u8]) -> Option<Self> {
        Self::decode(raw)
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        calculate_bincode()
            .deserialize::<Self>(&raw[..Self::SIZE])
            .ok()
            .filter(|header| header.magic == CALCULATE_HEADER_MAGIC)
    }

    fn write_to(&self, out: &mut [u8]) -> Result<()> {
        calculate_bincode()
            .serialize_into(&mut out[..Self::SIZE], self)
            .map_err(|e| MetricsError::unknown(format!("calculate header encode: {}", e)))
    }
}

/// Encode `values` as consecutive `u32` starting at byte `at`
fn write_table(out: &mut [u8], at: usize, values: &[u32]) -> Result<()> {
    let end = at + values.len() * U32;
    let mut cursor = &mut out[at..end];
    for value in values {
        calculate_bincode()
            .serialize_into(&mut cursor, value)
            .map_err(|e| MetricsError::unknown(format!("calculate table encode: {}", e)))?;
    }
    Ok(())
}

/// Decode `count` consecutive `u32` starting at byte `at`
fn read_table(raw: &[u8], at: usize, count: usize) -> Result<Vec<u32>> {
    raw[at..at + count * U32]
        .chunks_exact(U32)
        .map(|chunk| {
            calculate_bincode()
                .deserialize::<u32>(chunk)
                .map_err(|e| MetricsError::invalid_argument(format!("calculate table decode: {}", e)))
        })
        .collect()
}

/// Size of a packed buffer that reserves `per_part` bytes for each of `parts` parts
pub fn packed_capacity(parts: usize, per_part: usize) -> usize {
    MetricGroupCalculateHeader::prefix_size(parts) + parts * per_part
}

/// Pack `parts` regions into `out`
///
/// The space after the header is split evenly; `fill(i, region)` writes part
/// `i` into its region and returns how many bytes it used. Parts are laid out
/// back to back so unused capacity of one part is available to the next.
/// Returns the total number of bytes used.
pub fn pack_with<F>(out: &mut [u8], parts: usize, mut fill: F) -> Result<usize>
where
    F: FnMut(usize, &mut [u8]) -> Result<usize>,
{
    if parts == 0 {
        return Err(MetricsError::invalid_argument("packed data needs at least one part"));
    }
    let prefix = MetricGroupCalculateHeader::prefix_size(parts);
    if out.len() < prefix {
        return Err(MetricsError::InvalidSize {
            required: prefix,
            provided: out.len(),
        });
    }

    let header = MetricGroupCalculateHeader::new(parts as u32);
    let capacity = (out.len() - prefix) / parts;

    let mut offsets = Vec::with_capacity(parts);
    let mut sizes = Vec::with_capacity(parts);
    let mut offset = 0usize;
    for i in 0..parts {
        let start = prefix + offset;
        let region = &mut out[start..start + capacity];
        let written = fill(i, region)?;
        if written > capacity {
            return Err(MetricsError::unknown(format!(
                "part {} wrote {} bytes into a {} byte region",
                i, written, capacity
            )));
        }
        offsets.push(offset as u32);
        sizes.push(written as u32);
        offset += written;
    }

    header.write_to(out)?;
    write_table(out, header.raw_data_offsets as usize, &offsets)?;
    write_table(out, header.raw_data_sizes as usize, &sizes)?;
    Ok(prefix + offset)
}

/// Pack already gathered parts into a new buffer
pub fn pack(parts: &[&[u8]]) -> Result<Vec<u8>> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let prefix = MetricGroupCalculateHeader::prefix_size(parts.len());
    // Even split must give every part room for the largest one
    let largest = parts.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut out = vec![0u8; packed_capacity(parts.len(), largest).max(prefix + total)];
    let used = pack_with(&mut out, parts.len(), |i, region| {
        region[..parts[i].len()].copy_from_slice(parts[i]);
        Ok(parts[i].len())
    })?;
    out.truncate(used);
    Ok(out)
}

/// Validated view over a packed buffer
#[derive(Debug, Clone)]
pub struct PackedRawData<'a> {
    header: MetricGroupCalculateHeader,
    offsets: Vec<u32>,
    sizes: Vec<u32>,
    data: &'a [u8],
}

impl<'a> PackedRawData<'a> {
    /// Parse and validate a packed buffer
    ///
    /// Every part must lie inside the buffer and parts must not overlap.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let header = MetricGroupCalculateHeader::read_from(raw)
            .ok_or_else(|| MetricsError::invalid_argument("raw data is not packed"))?;
        let count = header.data_count as usize;

        let table_end = |start: u32| start as usize + count * U32;
        if table_end(header.raw_data_offsets) > raw.len()
            || table_end(header.raw_data_sizes) > raw.len()
            || header.raw_data_offset as usize > raw.len()
        {
            return Err(MetricsError::invalid_argument("packed header points past the buffer"));
        }

        let offsets = read_table(raw, header.raw_data_offsets as usize, count)?;
        let sizes = read_table(raw, header.raw_data_sizes as usize, count)?;
        let data = &raw[header.raw_data_offset as usize..];

        let mut previous_end = 0u64;
        for i in 0..count {
            let start = offsets[i] as u64;
            let end = start + sizes[i] as u64;
            if end > data.len() as u64 {
                return Err(MetricsError::invalid_argument(format!(
                    "part {} ends at {} beyond {} bytes of raw data",
                    i,
                    end,
                    data.len()
                )));
            }
            if start < previous_end {
                return Err(MetricsError::invalid_argument(format!("part {} overlaps part {}", i, i - 1)));
            }
            previous_end = end;
        }

        Ok(Self {
            header,
            offsets,
            sizes,
            data,
        })
    }

    pub fn header(&self) -> &MetricGroupCalculateHeader {
        &self.header
    }

    pub fn data_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn part(&self, index: usize) -> Option<&'a [u8]> {
        let start = *self.offsets.get(index)? as usize;
        let size = *self.sizes.get(index)? as usize;
        let data: &'a [u8] = self.data;
        Some(&data[start..start + size])
    }

    pub fn parts(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.data_count()).filter_map(move |i| self.part(i))
    }
}
