//! On-disk chunk index: CWVI vector slab + chunk list + manifest.
//!
//! Format (little-endian):
//!
//! `index.cwvi` header (fixed 16 bytes + CRC32):
//!   Magic: "CWVI" (4 bytes)
//!   Version: u16
//!   Dimension: u32
//!   Quantization: u8 (0=f32, 1=f16)
//!   Normalized: u8 (1 = vectors are L2-normalized)
//!   Count: u32
//!   HeaderCRC32: u32 (CRC32 of the 16 header bytes)
//! followed by Count × Dimension × bytes_per_component of vector data,
//! memory-mapped on load.
//!
//! `chunks.bin` is a MessagePack list of chunk records, positionally
//! aligned with the slab; `manifest.json` is a small sidecar repeating
//! dimension / quantization / normalization / count. The three files are
//! one versioned unit: any disagreement between them fails the load.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use memmap2::Mmap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::DocumentChunk;

pub const CWVI_MAGIC: [u8; 4] = *b"CWVI";
pub const CWVI_VERSION: u16 = 1;
const HEADER_BYTES: usize = 16;

pub const INDEX_FILE: &str = "index.cwvi";
pub const CHUNKS_FILE: &str = "chunks.bin";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Row count above which scans go through rayon.
const PARALLEL_THRESHOLD: usize = 8192;
const PARALLEL_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    F32,
    F16,
}

impl Quantization {
    fn to_u8(self) -> u8 {
        match self {
            Quantization::F32 => 0,
            Quantization::F16 => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Quantization::F32),
            1 => Ok(Quantization::F16),
            other => bail!("unknown quantization value: {other}"),
        }
    }

    fn bytes_per_component(self) -> usize {
        match self {
            Quantization::F32 => 4,
            Quantization::F16 => 2,
        }
    }
}

/// Sidecar manifest; must agree with the slab header and the chunk list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u16,
    pub dimension: u32,
    pub quantization: Quantization,
    pub normalized: bool,
    pub chunk_count: u32,
}

/// Metadata filter: every listed key must be present with the given value.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub equals: std::collections::BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn matches(&self, chunk: &DocumentChunk) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| chunk.metadata.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

#[derive(Debug)]
enum Slab {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Mmap { mmap: Mmap, offset: usize },
}

/// A candidate row and its raw cosine similarity.
#[derive(Debug, Clone, Copy)]
pub struct IndexHit {
    pub row: usize,
    pub similarity: f32,
}

/// Normalized-vector index over a parallel chunk list.
#[derive(Debug)]
pub struct ChunkIndex {
    dimension: usize,
    quantization: Quantization,
    normalized: bool,
    slab: Slab,
    chunks: Vec<Arc<DocumentChunk>>,
}

impl ChunkIndex {
    /// Index with no chunks; every search returns nothing.
    pub fn empty() -> Self {
        Self {
            dimension: 0,
            quantization: Quantization::F32,
            normalized: true,
            slab: Slab::F32(Vec::new()),
            chunks: Vec::new(),
        }
    }

    /// Build from ingested chunks. Embeddings move into the slab; the
    /// stored chunk records keep content and metadata only.
    pub fn build(
        chunks: Vec<DocumentChunk>,
        quantization: Quantization,
        normalize: bool,
    ) -> Result<Self> {
        if chunks.is_empty() {
            return Ok(Self::empty());
        }
        let dimension = chunks
            .first()
            .map(|c| c.embedding.len())
            .ok_or_else(|| anyhow!("cannot build an index from zero chunks"))?;
        if dimension == 0 {
            bail!("chunk embeddings are empty");
        }

        let mut stored = Vec::with_capacity(chunks.len());
        let mut vectors: Vec<f32> = Vec::with_capacity(chunks.len() * dimension);
        for (i, mut chunk) in chunks.into_iter().enumerate() {
            if chunk.embedding.len() != dimension {
                bail!(
                    "chunk {i} dimension mismatch: expected {dimension}, got {}",
                    chunk.embedding.len()
                );
            }
            let mut embedding = std::mem::take(&mut chunk.embedding);
            if normalize {
                l2_normalize(&mut embedding);
            }
            vectors.extend_from_slice(&embedding);
            stored.push(Arc::new(chunk));
        }

        let slab = match quantization {
            Quantization::F32 => Slab::F32(vectors),
            Quantization::F16 => Slab::F16(vectors.iter().map(|v| f16::from_f32(*v)).collect()),
        };

        Ok(Self {
            dimension,
            quantization,
            normalized: normalize,
            slab,
            chunks: stored,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    pub fn chunk(&self, row: usize) -> Option<&Arc<DocumentChunk>> {
        self.chunks.get(row)
    }

    pub fn manifest(&self) -> IndexManifest {
        IndexManifest {
            version: CWVI_VERSION,
            dimension: self.dimension as u32,
            quantization: self.quantization,
            normalized: self.normalized,
            chunk_count: self.chunks.len() as u32,
        }
    }

    /// Top-k rows by similarity. The filter-free path is a straight slab
    /// scan; with a filter, rows are gated on chunk metadata first.
    pub fn search_top_k(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            bail!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            );
        }

        let hits = if self.chunks.len() >= PARALLEL_THRESHOLD {
            self.scan_parallel(query, k, filter)
        } else {
            self.scan_range(0..self.chunks.len(), query, k, filter)
        };

        let mut results: Vec<IndexHit> = hits
            .into_iter()
            .map(|s| IndexHit {
                row: s.row,
                similarity: s.similarity,
            })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.row.cmp(&b.row))
        });
        Ok(results)
    }

    fn scan_range(
        &self,
        range: std::ops::Range<usize>,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Vec<Scored> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        for row in range {
            if let Some(filter) = filter {
                if !filter.matches(&self.chunks[row]) {
                    continue;
                }
            }
            let similarity = self.similarity_at(row, query);
            heap.push(std::cmp::Reverse(Scored { row, similarity }));
            if heap.len() > k {
                heap.pop();
            }
        }
        heap.into_iter().map(|r| r.0).collect()
    }

    fn scan_parallel(&self, query: &[f32], k: usize, filter: Option<&MetadataFilter>) -> Vec<Scored> {
        let ranges: Vec<std::ops::Range<usize>> = (0..self.chunks.len())
            .step_by(PARALLEL_CHUNK_SIZE)
            .map(|start| start..(start + PARALLEL_CHUNK_SIZE).min(self.chunks.len()))
            .collect();

        let partials: Vec<Vec<Scored>> = ranges
            .into_par_iter()
            .map(|range| self.scan_range(range, query, k, filter))
            .collect();

        // Merge thread-local top-k lists.
        let mut heap = BinaryHeap::with_capacity(k + 1);
        for partial in partials {
            for scored in partial {
                heap.push(std::cmp::Reverse(scored));
                if heap.len() > k {
                    heap.pop();
                }
            }
        }
        heap.into_iter().map(|r| r.0).collect()
    }

    fn similarity_at(&self, row: usize, query: &[f32]) -> f32 {
        let start = row * self.dimension;
        match &self.slab {
            Slab::F32(values) => dot(&values[start..start + self.dimension], query),
            Slab::F16(values) => dot_f16(&values[start..start + self.dimension], query),
            Slab::Mmap { mmap, offset } => {
                let bytes_per = self.quantization.bytes_per_component();
                let base = offset + start * bytes_per;
                let bytes = &mmap[base..base + self.dimension * bytes_per];
                match self.quantization {
                    Quantization::F32 => {
                        let mut sum = 0.0f32;
                        for (chunk, q) in bytes.chunks_exact(4).zip(query) {
                            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                            sum += v * q;
                        }
                        sum
                    }
                    Quantization::F16 => {
                        let mut sum = 0.0f32;
                        for (chunk, q) in bytes.chunks_exact(2).zip(query) {
                            let v = f16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
                            sum += v * q;
                        }
                        sum
                    }
                }
            }
        }
    }

    /// Persist slab + chunk list + manifest into `dir` as one unit.
    /// Writes go through temp files with atomic renames.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create index directory {dir:?}"))?;

        // Vector slab.
        let index_path = dir.join(INDEX_FILE);
        let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        {
            let mut file =
                File::create(&tmp).with_context(|| format!("create {tmp:?}"))?;
            let mut header = Vec::with_capacity(HEADER_BYTES);
            header.extend_from_slice(&CWVI_MAGIC);
            header.extend_from_slice(&CWVI_VERSION.to_le_bytes());
            header.extend_from_slice(&(self.dimension as u32).to_le_bytes());
            header.push(self.quantization.to_u8());
            header.push(u8::from(self.normalized));
            header.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header);
            file.write_all(&header)?;
            file.write_all(&hasher.finalize().to_le_bytes())?;
            self.write_slab(&mut file)?;
            file.sync_all().context("fsync vector slab")?;
        }
        std::fs::rename(&tmp, &index_path)
            .with_context(|| format!("rename {tmp:?}"))?;

        // Chunk list, positionally aligned with the slab.
        let chunks_path = dir.join(CHUNKS_FILE);
        let tmp = dir.join(format!("{CHUNKS_FILE}.tmp"));
        {
            let records: Vec<&DocumentChunk> =
                self.chunks.iter().map(Arc::as_ref).collect();
            // Named encoding: chunks skip empty embeddings, so positional
            // struct arrays would not round-trip.
            let bytes = rmp_serde::to_vec_named(&records).context("encode chunk list")?;
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all().context("fsync chunk list")?;
        }
        std::fs::rename(&tmp, &chunks_path)?;

        // Manifest sidecar.
        let manifest_path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.manifest())?)?;
        std::fs::rename(&tmp, &manifest_path)?;

        tracing::info!(?dir, count = self.chunks.len(), "index_saved");
        Ok(())
    }

    fn write_slab<W: Write>(&self, writer: &mut W) -> Result<()> {
        match &self.slab {
            Slab::F32(values) => {
                for v in values {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
            Slab::F16(values) => {
                for v in values {
                    writer.write_all(&v.to_le_bytes())?;
                }
            }
            Slab::Mmap { mmap, offset } => {
                writer.write_all(&mmap[*offset..])?;
            }
        }
        Ok(())
    }

    /// Load the three files back as one versioned unit.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_raw = std::fs::read(dir.join(MANIFEST_FILE))
            .with_context(|| format!("read {MANIFEST_FILE} in {dir:?}"))?;
        let manifest: IndexManifest =
            serde_json::from_slice(&manifest_raw).context("parse index manifest")?;
        if manifest.version != CWVI_VERSION {
            bail!("unsupported index version: {}", manifest.version);
        }

        let chunks_raw = std::fs::read(dir.join(CHUNKS_FILE))
            .with_context(|| format!("read {CHUNKS_FILE} in {dir:?}"))?;
        let records: Vec<DocumentChunk> =
            rmp_serde::from_slice(&chunks_raw).context("decode chunk list")?;
        let chunks: Vec<Arc<DocumentChunk>> = records.into_iter().map(Arc::new).collect();

        let file = File::open(dir.join(INDEX_FILE))
            .with_context(|| format!("open {INDEX_FILE} in {dir:?}"))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap vector slab")? };
        if mmap.len() < HEADER_BYTES + 4 {
            bail!("vector slab is truncated");
        }

        let header = &mmap[..HEADER_BYTES];
        if header[0..4] != CWVI_MAGIC {
            bail!("invalid CWVI magic");
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != CWVI_VERSION {
            bail!("unsupported CWVI version: {version}");
        }
        let dimension = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let quantization = Quantization::from_u8(header[10])?;
        let normalized = header[11] != 0;
        let count =
            u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;

        let crc_stored = u32::from_le_bytes([
            mmap[HEADER_BYTES],
            mmap[HEADER_BYTES + 1],
            mmap[HEADER_BYTES + 2],
            mmap[HEADER_BYTES + 3],
        ]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        let crc_actual = hasher.finalize();
        if crc_actual != crc_stored {
            bail!("header CRC mismatch (expected {crc_stored:#010x}, got {crc_actual:#010x})");
        }

        // The three files must describe the same index.
        if manifest.dimension as usize != dimension
            || manifest.quantization != quantization
            || manifest.normalized != normalized
            || manifest.chunk_count as usize != count
        {
            bail!("manifest disagrees with vector slab header");
        }
        if chunks.len() != count {
            bail!(
                "chunk list length mismatch: slab has {count}, list has {}",
                chunks.len()
            );
        }

        let offset = HEADER_BYTES + 4;
        let expected = offset + count * dimension * quantization.bytes_per_component();
        if mmap.len() != expected {
            bail!(
                "vector slab size mismatch: expected {expected}, got {}",
                mmap.len()
            );
        }

        Ok(Self {
            dimension,
            quantization,
            normalized,
            slab: Slab::Mmap { mmap, offset },
            chunks,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    row: usize,
    similarity: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.similarity.total_cmp(&other.similarity) == Ordering::Equal && self.row == other.row
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.similarity
            .total_cmp(&other.similarity)
            .then_with(|| other.row.cmp(&self.row))
    }
}

/// In-place L2 normalization; zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// SIMD dot product, 8 lanes at a time, scalar tail.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    use wide::f32x8;

    let lanes = a.len().min(b.len()) / 8 * 8;
    let mut sum = f32x8::ZERO;
    for base in (0..lanes).step_by(8) {
        let va: [f32; 8] = a[base..base + 8].try_into().expect("8-lane chunk");
        let vb: [f32; 8] = b[base..base + 8].try_into().expect("8-lane chunk");
        sum += f32x8::from(va) * f32x8::from(vb);
    }
    let mut total = sum.reduce_add();
    for (x, y) in a[lanes..].iter().zip(&b[lanes..]) {
        total += x * y;
    }
    total
}

fn dot_f16(a: &[f16], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x.to_f32() * y).sum()
}
