//! The immutable post-build index representation: one contiguous buffer
//! laid out for cache-friendly level-0 scans, either heap-owned or backed
//! by a read-only memory mapping.
//!
//! Buffer layout (little-endian):
//!
//! ```text
//! [reserved: 36 bytes, zeroed]
//! [max_level: i32][enterpoint_id: i32][num_nodes: i32][metric: i32]
//! [data_dim: u64]
//! [memory_per_data: u64][memory_per_link_level0: u64]
//! [memory_per_node_level0: u64][memory_per_node_higher_level: u64]
//! [reserved: 12 bytes, zeroed]
//! [level-0 block: num_nodes records]
//! [higher-level block: one record per (node, level > 0) pair]
//! ```
//!
//! A level-0 record is `[higher_level_offset: i32][degree: i32]
//! [neighbors: i32 x max_m0, zero-padded][vector: f32 x dim]`; a
//! higher-level record is `[degree: i32][neighbors: i32 x max_m]`. The
//! records for node `i` above level 0 start at index `higher_level_offset`
//! in the higher-level block, one record per level in ascending order.
//! The reserved regions stand in for fields of older format revisions and
//! must stay in place for compatibility.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::slice;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use tracing::{debug, info};

use crate::distance::Metric;
use crate::error::{Error, Result};
use crate::node::{NodeLinks, VectorSet};
use crate::types::PointId;

/// Deprecated builder parameters at the head of the header: four 8-byte
/// words and one 4-byte word.
const RESERVED_HEAD: usize = 4 * 8 + 4;
/// Legacy trailing offset fields, shortened by 4 bytes in an old format
/// revision; kept byte-for-byte for compatibility.
const RESERVED_TAIL: usize = 2 * 8 - 4;
pub(crate) const HEADER_SIZE: usize = RESERVED_HEAD + 4 * 4 + 8 + 4 * 8 + RESERVED_TAIL;

/// A heap buffer with 4-byte alignment, so `i32`/`f32` views into the
/// serialized model are valid on the owned path as well as through mmap.
struct AlignedBuf {
    words: Vec<u32>,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Result<Self> {
        let words_len = len.div_ceil(4);
        let mut words: Vec<u32> = Vec::new();
        words.try_reserve_exact(words_len).map_err(|_| Error::Alloc {
            megabytes: (len / (1024 * 1024)) as u64,
        })?;
        words.resize(words_len, 0);
        Ok(Self { words, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

enum ModelBuf {
    Owned(AlignedBuf),
    Mapped(Mmap),
}

impl ModelBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            ModelBuf::Owned(buf) => buf.as_slice(),
            ModelBuf::Mapped(mmap) => &mmap[..],
        }
    }
}

/// The sealed, searchable index. Dropping the last reference releases the
/// buffer (and unmaps it when mmap-backed).
pub(crate) struct Model {
    buf: ModelBuf,
    max_level: usize,
    enterpoint_id: PointId,
    num_nodes: usize,
    metric: Metric,
    data_dim: usize,
    memory_per_data: usize,
    memory_per_link_level0: usize,
    memory_per_node_level0: usize,
    memory_per_node_higher_level: usize,
    level0_offset: usize,
    higher_level_offset: usize,
}

struct Header {
    max_level: i32,
    enterpoint_id: i32,
    num_nodes: i32,
    metric: Metric,
    data_dim: u64,
    memory_per_data: u64,
    memory_per_link_level0: u64,
    memory_per_node_level0: u64,
    memory_per_node_higher_level: u64,
}

impl Model {
    /// Serialize a finished build graph into the contiguous layout.
    pub fn from_graph(
        nodes: &[NodeLinks],
        vectors: &VectorSet,
        metric: Metric,
        enterpoint: PointId,
        max_level: usize,
        max_m: usize,
        max_m0: usize,
    ) -> Result<Model> {
        let num_nodes = nodes.len();
        debug_assert!(num_nodes > 0 && num_nodes < i32::MAX as usize);
        let dim = vectors.dim();

        let total_level: usize = nodes.iter().map(|node| node.level).sum();
        let memory_per_node_higher_level = 4 * (1 + max_m);
        let memory_per_data = 4 * dim;
        let memory_per_link_level0 = 4 * (2 + max_m0);
        let memory_per_node_level0 = memory_per_link_level0 + memory_per_data;

        let level0_offset = HEADER_SIZE;
        let higher_level_offset = level0_offset + num_nodes * memory_per_node_level0;
        let model_size = higher_level_offset + total_level * memory_per_node_higher_level;

        let mut buf = AlignedBuf::zeroed(model_size)?;
        let bytes = buf.as_mut_slice();

        let mut cursor = Cursor::new(&mut bytes[RESERVED_HEAD..HEADER_SIZE - RESERVED_TAIL]);
        write_header(
            &mut cursor,
            &Header {
                max_level: max_level as i32,
                enterpoint_id: enterpoint.0 as i32,
                num_nodes: num_nodes as i32,
                metric,
                data_dim: dim as u64,
                memory_per_data: memory_per_data as u64,
                memory_per_link_level0: memory_per_link_level0 as u64,
                memory_per_node_level0: memory_per_node_level0 as u64,
                memory_per_node_higher_level: memory_per_node_higher_level as u64,
            },
        );

        let mut higher_offset = 0usize;
        for (i, node) in nodes.iter().enumerate() {
            let base = level0_offset + i * memory_per_node_level0;
            if node.level > 0 {
                write_i32(bytes, base, higher_offset as i32);
            }
            write_links(bytes, base + 4, &node.friends[0]);

            let vector_base = base + memory_per_link_level0;
            for (j, &x) in vectors.get(PointId(i as u32)).iter().enumerate() {
                bytes[vector_base + 4 * j..vector_base + 4 * j + 4]
                    .copy_from_slice(&x.to_le_bytes());
            }

            if node.level > 0 {
                for level in 1..=node.level {
                    let record = higher_level_offset
                        + (higher_offset + level - 1) * memory_per_node_higher_level;
                    write_links(bytes, record, &node.friends[level]);
                }
                higher_offset += node.level;
            }
        }

        debug!(bytes = model_size, nodes = num_nodes, "serialized model");
        Ok(Model {
            buf: ModelBuf::Owned(buf),
            max_level,
            enterpoint_id: enterpoint,
            num_nodes,
            metric,
            data_dim: dim,
            memory_per_data,
            memory_per_link_level0,
            memory_per_node_level0,
            memory_per_node_higher_level,
            level0_offset,
            higher_level_offset,
        })
    }

    /// Load a model from disk, either by mapping the file read-only or by
    /// reading it into an owned buffer.
    ///
    /// `expected_dim` of 0 accepts whatever dimension the file declares.
    pub fn load(path: &Path, use_mmap: bool, expected_dim: usize) -> Result<Model> {
        let mut file = File::open(path).map_err(Error::io_err(path, "failed to open model file"))?;
        let file_size = file
            .metadata()
            .map_err(Error::io_err(path, "failed to stat model file"))?
            .len() as usize;
        if file_size < HEADER_SIZE {
            return Err(Error::Io {
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "file smaller than header"),
                path: path.into(),
                context: "failed to read model file".into(),
            });
        }

        let buf = if use_mmap {
            let mmap = unsafe { Mmap::map(&file) }
                .map_err(Error::io_err(path, "failed to mmap model file"))?;
            ModelBuf::Mapped(mmap)
        } else {
            let mut owned = AlignedBuf::zeroed(file_size)?;
            file.read_exact(owned.as_mut_slice())
                .map_err(Error::io_err(path, "failed to read model file"))?;
            ModelBuf::Owned(owned)
        };

        let model = Model::from_buf(buf, expected_dim)?;
        info!(
            path = %path.display(),
            use_mmap,
            nodes = model.num_nodes,
            dim = model.data_dim,
            "loaded model"
        );
        Ok(model)
    }

    /// Write the buffer to disk verbatim.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).map_err(Error::io_err(path, "failed to create model file"))?;
        file.write_all(self.bytes())
            .map_err(Error::io_err(path, "failed to write model file"))?;
        debug!(path = %path.display(), bytes = self.bytes().len(), "saved model");
        Ok(())
    }

    fn from_buf(buf: ModelBuf, expected_dim: usize) -> Result<Model> {
        let header = parse_header(buf.as_slice(), expected_dim)?;

        let num_nodes = header.num_nodes as usize;
        let level0_bytes = (num_nodes as u64)
            .checked_mul(header.memory_per_node_level0)
            .filter(|total| HEADER_SIZE as u64 + total <= buf.as_slice().len() as u64)
            .ok_or_else(|| Error::format("truncated level-0 block"))?;
        let model = Model {
            max_level: header.max_level as usize,
            enterpoint_id: PointId(header.enterpoint_id as u32),
            num_nodes,
            metric: header.metric,
            data_dim: header.data_dim as usize,
            memory_per_data: header.memory_per_data as usize,
            memory_per_link_level0: header.memory_per_link_level0 as usize,
            memory_per_node_level0: header.memory_per_node_level0 as usize,
            memory_per_node_higher_level: header.memory_per_node_higher_level as usize,
            level0_offset: HEADER_SIZE,
            higher_level_offset: HEADER_SIZE + level0_bytes as usize,
            buf,
        };
        model.validate()?;
        Ok(model)
    }

    /// Structural audit of a freshly parsed buffer, so searches can index
    /// records without bounds surprises.
    fn validate(&self) -> Result<()> {
        let len = self.bytes().len();
        if self.num_nodes == 0 {
            return Err(Error::format("model contains no nodes"));
        }
        if self.memory_per_data != 4 * self.data_dim
            || self.memory_per_link_level0 < 8
            || self.memory_per_node_higher_level < 4
            || self.memory_per_node_level0 != self.memory_per_link_level0 + self.memory_per_data
        {
            return Err(Error::format("inconsistent record sizes in header"));
        }
        if self.enterpoint_id.idx() >= self.num_nodes {
            return Err(Error::format("enterpoint id out of range"));
        }
        if self.higher_level_offset > len {
            return Err(Error::format("truncated level-0 block"));
        }
        let higher_bytes = len - self.higher_level_offset;
        if higher_bytes % self.memory_per_node_higher_level != 0 {
            return Err(Error::format("truncated higher-level block"));
        }

        let max_m0 = self.memory_per_link_level0 / 4 - 2;
        let max_m = self.memory_per_node_higher_level / 4 - 1;
        let total_levels = higher_bytes / self.memory_per_node_higher_level;

        for id in 0..self.num_nodes {
            let record = self.level0_record(id);
            let offset = read_i32(record, 0);
            if offset < 0 || offset as usize > total_levels {
                return Err(Error::format("higher-level offset out of range"));
            }
            let degree = read_i32(record, 4);
            if degree < 0 || degree as usize > max_m0 {
                return Err(Error::format("level-0 degree exceeds cap"));
            }
            for pid in neighbor_ids(&record[4..]) {
                if pid.idx() >= self.num_nodes {
                    return Err(Error::format("level-0 neighbor id out of range"));
                }
            }
        }

        for index in 0..total_levels {
            let base = self.higher_level_offset + index * self.memory_per_node_higher_level;
            let record = &self.bytes()[base..base + self.memory_per_node_higher_level];
            let degree = read_i32(record, 0);
            if degree < 0 || degree as usize > max_m {
                return Err(Error::format("higher-level degree exceeds cap"));
            }
            for pid in neighbor_ids(record) {
                if pid.idx() >= self.num_nodes {
                    return Err(Error::format("higher-level neighbor id out of range"));
                }
            }
        }

        Ok(())
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn enterpoint_id(&self) -> PointId {
        self.enterpoint_id
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    #[inline]
    fn level0_record(&self, id: usize) -> &[u8] {
        let base = self.level0_offset + id * self.memory_per_node_level0;
        &self.bytes()[base..base + self.memory_per_node_level0]
    }

    /// Index of the node's first higher-level record. Meaningless for
    /// nodes whose level is 0.
    #[inline]
    pub fn higher_offset_of(&self, id: PointId) -> usize {
        read_i32(self.level0_record(id.idx()), 0) as usize
    }

    #[inline]
    pub fn level0_neighbors(&self, id: PointId) -> impl Iterator<Item = PointId> + '_ {
        neighbor_ids(&self.level0_record(id.idx())[4..])
    }

    /// Neighbors of a node at `level >= 1`, given the node's higher-level
    /// record offset.
    #[inline]
    pub fn higher_neighbors(
        &self,
        higher_offset: usize,
        level: usize,
    ) -> impl Iterator<Item = PointId> + '_ {
        debug_assert!(level >= 1);
        let base =
            self.higher_level_offset + (higher_offset + level - 1) * self.memory_per_node_higher_level;
        neighbor_ids(&self.bytes()[base..base + self.memory_per_node_higher_level])
    }

    pub fn level0_degree(&self, id: PointId) -> usize {
        read_i32(self.level0_record(id.idx()), 4) as usize
    }

    /// Zero-copy view of a stored vector.
    ///
    /// Both buffer variants are 4-byte aligned (mmap is page aligned, the
    /// owned buffer is word backed) and every vector sits at a 4-byte
    /// multiple, so the reinterpretation is in bounds and aligned.
    #[inline]
    pub fn vector(&self, id: PointId) -> &[f32] {
        let start = self.level0_offset
            + id.idx() * self.memory_per_node_level0
            + self.memory_per_link_level0;
        let bytes = &self.bytes()[start..start + self.memory_per_data];
        debug_assert_eq!(bytes.as_ptr() as usize % 4, 0);
        unsafe { slice::from_raw_parts(bytes.as_ptr() as *const f32, self.data_dim) }
    }
}

fn write_header(cursor: &mut Cursor<&mut [u8]>, header: &Header) {
    // the slice is pre-sized; none of these can fail
    cursor.write_i32::<LittleEndian>(header.max_level).unwrap();
    cursor.write_i32::<LittleEndian>(header.enterpoint_id).unwrap();
    cursor.write_i32::<LittleEndian>(header.num_nodes).unwrap();
    cursor
        .write_i32::<LittleEndian>(header.metric.code())
        .unwrap();
    cursor.write_u64::<LittleEndian>(header.data_dim).unwrap();
    cursor
        .write_u64::<LittleEndian>(header.memory_per_data)
        .unwrap();
    cursor
        .write_u64::<LittleEndian>(header.memory_per_link_level0)
        .unwrap();
    cursor
        .write_u64::<LittleEndian>(header.memory_per_node_level0)
        .unwrap();
    cursor
        .write_u64::<LittleEndian>(header.memory_per_node_higher_level)
        .unwrap();
}

fn parse_header(bytes: &[u8], expected_dim: usize) -> Result<Header> {
    let mut cursor = Cursor::new(&bytes[RESERVED_HEAD..HEADER_SIZE - RESERVED_TAIL]);
    let read_err = |_| Error::format("header ended unexpectedly");

    let max_level = cursor.read_i32::<LittleEndian>().map_err(read_err)?;
    let enterpoint_id = cursor.read_i32::<LittleEndian>().map_err(read_err)?;
    let num_nodes = cursor.read_i32::<LittleEndian>().map_err(read_err)?;
    let metric_code = cursor.read_i32::<LittleEndian>().map_err(read_err)?;
    let metric = Metric::from_code(metric_code)
        .ok_or_else(|| Error::format(format!("unknown distance metric code: {metric_code}")))?;
    let data_dim = cursor.read_u64::<LittleEndian>().map_err(read_err)?;
    if expected_dim > 0 && data_dim != expected_dim as u64 {
        return Err(Error::format(format!(
            "index dimension ({expected_dim}) != model dimension ({data_dim})"
        )));
    }
    if max_level < 0 || enterpoint_id < 0 || num_nodes <= 0 {
        return Err(Error::format("negative counts in header"));
    }

    Ok(Header {
        max_level,
        enterpoint_id,
        num_nodes,
        metric,
        data_dim,
        memory_per_data: cursor.read_u64::<LittleEndian>().map_err(read_err)?,
        memory_per_link_level0: cursor.read_u64::<LittleEndian>().map_err(read_err)?,
        memory_per_node_level0: cursor.read_u64::<LittleEndian>().map_err(read_err)?,
        memory_per_node_higher_level: cursor.read_u64::<LittleEndian>().map_err(read_err)?,
    })
}

#[inline]
fn read_i32(record: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(record[offset..offset + 4].try_into().unwrap())
}

#[inline]
fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Iterate the ids of a `[degree][ids...]` link record.
#[inline]
fn neighbor_ids(record: &[u8]) -> impl Iterator<Item = PointId> + '_ {
    let degree = read_i32(record, 0) as usize;
    record[4..4 + 4 * degree]
        .chunks_exact(4)
        .map(|chunk| PointId(i32::from_le_bytes(chunk.try_into().unwrap()) as u32))
}

fn write_links(bytes: &mut [u8], offset: usize, friends: &[PointId]) {
    write_i32(bytes, offset, friends.len() as i32);
    for (j, pid) in friends.iter().enumerate() {
        write_i32(bytes, offset + 4 + 4 * j, pid.0 as i32);
    }
}
