//! The i3dm container.
//!
//! File layout (little-endian):
//!   00  : [u8;4]  magic = b"i3dm"
//!   04  : u32     version = 1
//!   08  : u32     byte_length (whole file)
//!   0C  : u32     feature table JSON length (multiple of 8)
//!   10  : u32     feature table binary length (multiple of 8)
//!   14  : u32     batch table JSON length   = 0
//!   18  : u32     batch table binary length = 0
//!   1C  : u32     gltf_format = 1 (embedded glb)
//!   20  : feature table JSON, space padded
//!   ..  : POSITION f32x3[N] | NORMAL_UP f32x3[N] | NORMAL_RIGHT f32x3[N] | SCALE f32[N], zero padded
//!   ..  : glb bytes, verbatim
//!
//! Property byte offsets in the JSON are relative to the start of the binary block.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{I3dmError, Result};
use crate::instances::TileBuffer;

pub const I3DM_MAGIC: [u8; 4] = *b"i3dm";
pub const I3DM_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 32;

/// Feature table and binary blocks are aligned to this many bytes.
const ALIGN: usize = 8;

const VEC3_BYTES: usize = 12;
const SCALAR_BYTES: usize = 4;

/// Bytes of feature-table binary per instance before padding.
pub const BYTES_PER_INSTANCE: usize = 3 * VEC3_BYTES + SCALAR_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I3dmHeader {
    pub version: u32,
    pub byte_length: u32,
    pub feature_table_json_byte_length: u32,
    pub feature_table_binary_byte_length: u32,
    pub batch_table_json_byte_length: u32,
    pub batch_table_binary_byte_length: u32,
    pub gltf_format: u32,
}

impl I3dmHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&I3DM_MAGIC);
        for v in [
            self.version,
            self.byte_length,
            self.feature_table_json_byte_length,
            self.feature_table_binary_byte_length,
            self.batch_table_json_byte_length,
            self.batch_table_binary_byte_length,
            self.gltf_format,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Byte offset of the glb payload.
    pub fn glb_offset(&self) -> usize {
        HEADER_LEN
            + self.feature_table_json_byte_length as usize
            + self.feature_table_binary_byte_length as usize
            + self.batch_table_json_byte_length as usize
            + self.batch_table_binary_byte_length as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentType {
    #[serde(rename = "FLOAT")]
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    #[serde(rename = "VEC3")]
    Vec3,
    #[serde(rename = "SCALAR")]
    Scalar,
}

/// Where a per-instance property lives inside the feature table binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryBodyReference {
    #[serde(rename = "byteOffset")]
    pub byte_offset: u32,
    #[serde(rename = "componentType")]
    pub component_type: ComponentType,
    #[serde(rename = "type")]
    pub element_type: ElementType,
}

/// Feature table JSON. Field order here is the key order on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    #[serde(rename = "INSTANCES_LENGTH")]
    pub instances_length: u32,
    #[serde(rename = "RTC_CENTER")]
    pub rtc_center: [f64; 3],
    #[serde(rename = "POSITION")]
    pub position: BinaryBodyReference,
    #[serde(rename = "NORMAL_UP")]
    pub normal_up: BinaryBodyReference,
    #[serde(rename = "NORMAL_RIGHT")]
    pub normal_right: BinaryBodyReference,
    #[serde(rename = "SCALE")]
    pub scale: BinaryBodyReference,
}

impl FeatureTable {
    fn for_buffer(buffer: &TileBuffer) -> Result<Self> {
        // Every offset below is bounded by the binary block length.
        u32::try_from(buffer.len() * BYTES_PER_INSTANCE)
            .map_err(|_| I3dmError::invalid_input("too many instances for one tile"))?;
        let count = buffer.len() as u32;

        let vec3 = |index: u32| BinaryBodyReference {
            byte_offset: index * count * VEC3_BYTES as u32,
            component_type: ComponentType::Float,
            element_type: ElementType::Vec3,
        };

        Ok(Self {
            instances_length: count,
            rtc_center: buffer.origin,
            position: vec3(0),
            normal_up: vec3(1),
            normal_right: vec3(2),
            scale: BinaryBodyReference {
                byte_offset: 3 * count * VEC3_BYTES as u32,
                component_type: ComponentType::Float,
                element_type: ElementType::Scalar,
            },
        })
    }
}

/// A decoded tile.
#[derive(Debug, Clone)]
pub struct I3dmTile {
    pub header: I3dmHeader,
    pub feature_table: FeatureTable,
    pub positions: Vec<[f32; 3]>,
    pub ups: Vec<[f32; 3]>,
    pub rights: Vec<[f32; 3]>,
    pub scales: Vec<f32>,
    pub glb: Vec<u8>,
}

#[inline]
fn padded_len(len: usize) -> usize {
    len.div_ceil(ALIGN) * ALIGN
}

#[inline]
fn pad_to_alignment(buf: &mut Vec<u8>, fill: u8) {
    buf.resize(padded_len(buf.len()), fill);
}

#[cfg(target_endian = "little")]
fn push_f32s<T: bytemuck::Pod>(out: &mut Vec<u8>, values: &[T]) {
    // [f32; 3] and f32 are both Pod; on LE hosts the in-memory bytes are the wire bytes.
    out.extend_from_slice(bytemuck::cast_slice(values));
}

#[cfg(not(target_endian = "little"))]
fn push_f32s<T: bytemuck::Pod>(out: &mut Vec<u8>, values: &[T]) {
    let floats: &[f32] = bytemuck::cast_slice(values);
    for f in floats {
        out.extend_from_slice(&f.to_le_bytes());
    }
}

/// Pack a glb and its instance buffers into one i3dm tile.
pub fn encode_tile(glb: &[u8], buffer: &TileBuffer) -> Result<Vec<u8>> {
    if buffer.is_empty() {
        return Err(I3dmError::invalid_input("need at least one instance"));
    }

    if !buffer.is_consistent() {
        return Err(I3dmError::invalid_input("instance arrays differ in length"));
    }

    let table = FeatureTable::for_buffer(buffer)?;

    let mut json = serde_json::to_vec(&table)?;
    pad_to_alignment(&mut json, b' ');

    let n = buffer.len();
    let mut body = Vec::with_capacity(padded_len(n * BYTES_PER_INSTANCE));
    push_f32s(&mut body, &buffer.positions);
    push_f32s(&mut body, &buffer.ups);
    push_f32s(&mut body, &buffer.rights);
    push_f32s(&mut body, &buffer.scales);
    pad_to_alignment(&mut body, 0);

    let total = HEADER_LEN + json.len() + body.len() + glb.len();
    let byte_length = u32::try_from(total)
        .map_err(|_| I3dmError::invalid_input(format!("tile of {total} bytes exceeds u32 byteLength")))?;

    let header = I3dmHeader {
        version: I3DM_VERSION,
        byte_length,
        feature_table_json_byte_length: json.len() as u32,
        feature_table_binary_byte_length: body.len() as u32,
        batch_table_json_byte_length: 0,
        batch_table_binary_byte_length: 0,
        gltf_format: 1,
    };

    let mut out = Vec::with_capacity(total);
    header.write_to(&mut out);
    out.extend_from_slice(&json);
    out.extend_from_slice(&body);
    out.extend_from_slice(glb);

    debug_assert_eq!(out.len(), total);
    debug!(
        "Encoded i3dm: {} instances, json {} B, binary {} B, glb {} B, total {} B",
        n,
        json.len(),
        body.len(),
        glb.len(),
        total
    );

    Ok(out)
}

/// Encode and write a tile to `path`. Returns the number of bytes written.
pub fn write_file<P: AsRef<Path>>(path: P, glb: &[u8], buffer: &TileBuffer) -> Result<usize> {
    let bytes = encode_tile(glb, buffer)?;

    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    file.flush()?;

    Ok(bytes.len())
}

#[inline(always)]
fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(I3dmError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

#[inline(always)]
fn le_u32(buf: &mut &[u8]) -> Result<u32> {
    let b = take(buf, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_f32s(bin: &[u8], reference: &BinaryBodyReference, count: usize, width: usize) -> Result<Vec<f32>> {
    let start = reference.byte_offset as usize;
    let end = start + count * width * 4;

    let raw = bin
        .get(start..end)
        .ok_or_else(|| I3dmError::bad(format!("property at {start}..{end} outside binary block of {} bytes", bin.len())))?;

    Ok(raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_vec3s(bin: &[u8], reference: &BinaryBodyReference, count: usize) -> Result<Vec<[f32; 3]>> {
    if reference.element_type != ElementType::Vec3 {
        return Err(I3dmError::bad("expected VEC3 property"));
    }

    let flat = read_f32s(bin, reference, count, 3)?;
    Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

/// Parse a tile from a contiguous byte slice, seeking by the declared lengths and offsets.
pub fn parse_i3dm_bytes(data: &[u8]) -> Result<I3dmTile> {
    let mut p = data;

    if take(&mut p, 4)? != I3DM_MAGIC {
        return Err(I3dmError::bad("bad i3dm magic"));
    }

    let header = I3dmHeader {
        version: le_u32(&mut p)?,
        byte_length: le_u32(&mut p)?,
        feature_table_json_byte_length: le_u32(&mut p)?,
        feature_table_binary_byte_length: le_u32(&mut p)?,
        batch_table_json_byte_length: le_u32(&mut p)?,
        batch_table_binary_byte_length: le_u32(&mut p)?,
        gltf_format: le_u32(&mut p)?,
    };

    if header.version != I3DM_VERSION {
        return Err(I3dmError::bad(format!("unsupported i3dm version {}", header.version)));
    }

    let declared = header.byte_length as usize;
    if declared > data.len() {
        return Err(I3dmError::Truncated);
    }
    if declared != data.len() {
        return Err(I3dmError::bad(format!(
            "byteLength {} does not match {} bytes of input",
            declared,
            data.len()
        )));
    }

    if header.gltf_format != 1 {
        return Err(I3dmError::bad("only embedded glb (gltfFormat = 1) is supported"));
    }

    let json = take(&mut p, header.feature_table_json_byte_length as usize)?;
    let bin = take(&mut p, header.feature_table_binary_byte_length as usize)?;

    // Batch table carries nothing we use.
    take(
        &mut p,
        header.batch_table_json_byte_length as usize + header.batch_table_binary_byte_length as usize,
    )?;

    // Trailing space padding is JSON whitespace.
    let feature_table: FeatureTable = serde_json::from_slice(json)?;
    let count = feature_table.instances_length as usize;

    let positions = read_vec3s(bin, &feature_table.position, count)?;
    let ups = read_vec3s(bin, &feature_table.normal_up, count)?;
    let rights = read_vec3s(bin, &feature_table.normal_right, count)?;

    if feature_table.scale.element_type != ElementType::Scalar {
        return Err(I3dmError::bad("expected SCALAR for SCALE"));
    }
    let scales = read_f32s(bin, &feature_table.scale, count, 1)?;

    Ok(I3dmTile {
        header,
        feature_table,
        positions,
        ups,
        rights,
        scales,
        glb: p.to_vec(),
    })
}

/// Fast path: prefer mmap; fall back to a single read.
#[cfg(feature = "mmap")]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<I3dmTile> {
    let file = File::open(path)?;
    let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
    parse_i3dm_bytes(&map)
}

#[cfg(not(feature = "mmap"))]
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<I3dmTile> {
    let bytes = std::fs::read(path)?;
    parse_i3dm_bytes(&bytes)
}
