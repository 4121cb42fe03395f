//! IVF-flat index and its PZIV binary format.
//!
//! The index partitions the vector set into `nlist` clusters around
//! k-means-trained centroids (the coarse quantizer). Each cluster owns an
//! inverted list of (row id, raw vector) members. Search probes the
//! `nprobe` nearest clusters instead of scanning all vectors.
//!
//! Format overview (little-endian):
//!
//! Header (22 bytes):
//!   Magic: "PZIV" (4 bytes)
//!   Version: u16
//!   Dimension: u32
//!   ListCount: u32 (nlist)
//!   VectorCount: u32
//!   HeaderCRC32: u32 (CRC32 of header bytes before this field)
//!
//! ListLengths: nlist x u32 (entries per inverted list)
//! RowIds: count x u32, concatenated in list order
//! Vector slab: count x dimension x f32, contiguous in list order,
//!   32-byte aligned.
//!
//! The centroid slab (nlist x dimension x f32) precedes the vector slab,
//! starting at the same 32-byte alignment boundary. The artifact is
//! immutable once written; rebuilding is the only mutation path.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use memmap2::Mmap;
use rand::Rng;

use crate::matrix::bytes_as_f32;

pub const PZIV_MAGIC: [u8; 4] = *b"PZIV";
pub const PZIV_VERSION: u16 = 1;
pub const VECTOR_ALIGN_BYTES: usize = 32;
const HEADER_LEN_BYTES: usize = 22;

/// Sentinel row id padding an under-filled result, which callers filter.
pub const NO_MATCH_ROW: i64 = -1;

/// Probe count default leans toward recall; result sets are small and cached.
pub const DEFAULT_NPROBE: usize = 32;

const KMEANS_ITERATIONS: usize = 25;

/// Flat L2 quantizer: `nlist` centroids trained by k-means over a sample.
pub struct CoarseQuantizer {
    dimension: usize,
    centroids: Vec<f32>,
}

impl CoarseQuantizer {
    /// Train on `training`, a row-major flat matrix of unit vectors.
    /// `nlist` must not exceed the number of training rows.
    pub fn train<R: Rng>(
        dimension: usize,
        nlist: usize,
        training: &[f32],
        rng: &mut R,
    ) -> Result<Self> {
        if dimension == 0 {
            bail!("dimension must be non-zero");
        }
        if !training.len().is_multiple_of(dimension) {
            bail!(
                "training set length {} is not a multiple of dimension {dimension}",
                training.len()
            );
        }
        let n = training.len() / dimension;
        if nlist == 0 || nlist > n {
            bail!("nlist {nlist} out of range for {n} training vectors");
        }

        let row = |i: usize| &training[i * dimension..(i + 1) * dimension];

        let mut centroids = Vec::with_capacity(nlist * dimension);
        for i in rand::seq::index::sample(rng, n, nlist) {
            centroids.extend_from_slice(row(i));
        }

        let mut assignments = vec![usize::MAX; n];
        for _ in 0..KMEANS_ITERATIONS {
            let mut changed = false;
            for (i, slot) in assignments.iter_mut().enumerate() {
                let best = nearest_centroid(&centroids, dimension, row(i));
                if best != *slot {
                    *slot = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![0f32; nlist * dimension];
            let mut counts = vec![0usize; nlist];
            for (i, &cluster) in assignments.iter().enumerate() {
                counts[cluster] += 1;
                let sum = &mut sums[cluster * dimension..(cluster + 1) * dimension];
                for (acc, value) in sum.iter_mut().zip(row(i)) {
                    *acc += value;
                }
            }
            for cluster in 0..nlist {
                let target = &mut centroids[cluster * dimension..(cluster + 1) * dimension];
                if counts[cluster] == 0 {
                    // Reseed an empty cluster from a random training row.
                    target.copy_from_slice(row(rng.gen_range(0..n)));
                } else {
                    let inv = 1.0 / counts[cluster] as f32;
                    for (slot, sum) in target.iter_mut().zip(
                        sums[cluster * dimension..(cluster + 1) * dimension].iter(),
                    ) {
                        *slot = sum * inv;
                    }
                }
            }
        }

        Ok(Self {
            dimension,
            centroids,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len() / self.dimension
    }

    /// Index of the nearest centroid under squared L2.
    pub fn assign(&self, vector: &[f32]) -> Result<usize> {
        if vector.len() != self.dimension {
            bail!(
                "vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            );
        }
        Ok(nearest_centroid(&self.centroids, self.dimension, vector))
    }
}

#[derive(Debug)]
enum VectorSlab {
    Owned(Vec<f32>),
    Mmap {
        mmap: Mmap,
        offset: usize,
        len_bytes: usize,
    },
}

#[derive(Debug)]
pub struct IvfIndex {
    dimension: usize,
    nprobe: usize,
    centroids: Vec<f32>,
    /// Entry offsets per list, `nlist + 1` long.
    list_offsets: Vec<usize>,
    /// Row ids concatenated in list order.
    row_ids: Vec<u32>,
    slab: VectorSlab,
    /// Row id -> slab entry position, for reconstruction.
    positions: HashMap<u32, usize>,
}

impl IvfIndex {
    /// Populate a trained quantizer with every vector of the collection,
    /// assigning each to its nearest centroid's inverted list.
    pub fn build<I>(quantizer: CoarseQuantizer, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, Vec<f32>)>,
    {
        let dimension = quantizer.dimension();
        let nlist = quantizer.nlist();

        let mut list_ids: Vec<Vec<u32>> = vec![Vec::new(); nlist];
        let mut list_vectors: Vec<Vec<f32>> = vec![Vec::new(); nlist];
        for (row_id, vector) in entries {
            let cluster = quantizer.assign(&vector)?;
            list_ids[cluster].push(row_id);
            list_vectors[cluster].extend_from_slice(&vector);
        }

        let count: usize = list_ids.iter().map(Vec::len).sum();
        let mut list_offsets = Vec::with_capacity(nlist + 1);
        let mut row_ids = Vec::with_capacity(count);
        let mut slab = Vec::with_capacity(count * dimension);
        list_offsets.push(0);
        for (ids, vectors) in list_ids.into_iter().zip(list_vectors) {
            row_ids.extend_from_slice(&ids);
            slab.extend_from_slice(&vectors);
            list_offsets.push(row_ids.len());
        }

        let positions = position_map(&row_ids)?;
        Ok(Self {
            dimension,
            nprobe: DEFAULT_NPROBE,
            centroids: quantizer.centroids,
            list_offsets,
            row_ids,
            slab: VectorSlab::Owned(slab),
            positions,
        })
    }

    pub fn with_nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe.max(1);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn nlist(&self) -> usize {
        self.list_offsets.len() - 1
    }

    pub fn count(&self) -> usize {
        self.row_ids.len()
    }

    /// Raw approximate search: scan the `nprobe` nearest lists and return
    /// exactly `requested` entries ascending by squared L2 distance, padded
    /// with `(NO_MATCH_ROW, f32::MAX)` when fewer candidates exist.
    pub fn search(&self, query: &[f32], requested: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != self.dimension {
            bail!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            );
        }
        if requested == 0 {
            return Ok(Vec::new());
        }

        let nlist = self.nlist();
        let mut ranked: Vec<(f32, usize)> = (0..nlist)
            .map(|cluster| {
                let centroid = &self.centroids[cluster * self.dimension..(cluster + 1) * self.dimension];
                (squared_l2(centroid, query), cluster)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(self.nprobe.min(nlist));

        let mut heap = BinaryHeap::with_capacity(requested + 1);
        for &(_, cluster) in &ranked {
            let start = self.list_offsets[cluster];
            let end = self.list_offsets[cluster + 1];
            let vectors = self.entry_vectors(start, end - start)?;
            for (slot, &row_id) in self.row_ids[start..end].iter().enumerate() {
                let vector = &vectors[slot * self.dimension..(slot + 1) * self.dimension];
                heap.push(Candidate {
                    distance: squared_l2(vector, query),
                    row_id,
                });
                if heap.len() > requested {
                    heap.pop();
                }
            }
        }

        let mut results: Vec<(i64, f32)> = heap
            .into_iter()
            .map(|c| (i64::from(c.row_id), c.distance))
            .collect();
        results.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        results.resize(requested, (NO_MATCH_ROW, f32::MAX));
        Ok(results)
    }

    /// Raw vector for a stored row, if resident. The IVF-flat artifact
    /// retains raw vectors, so this is the primary reconstruction path.
    pub fn reconstruct(&self, row: usize) -> Option<Vec<f32>> {
        let row = u32::try_from(row).ok()?;
        let position = *self.positions.get(&row)?;
        let vectors = self.entry_vectors(position, 1).ok()?;
        Some(vectors.to_vec())
    }

    fn entry_vectors(&self, position: usize, entries: usize) -> Result<&[f32]> {
        let start = position * self.dimension;
        let end = (position + entries) * self.dimension;
        match &self.slab {
            VectorSlab::Owned(values) => values
                .get(start..end)
                .ok_or_else(|| anyhow!("vector slab slice out of bounds")),
            VectorSlab::Mmap {
                mmap,
                offset,
                len_bytes,
            } => {
                let byte_start = offset
                    .checked_add(start * 4)
                    .ok_or_else(|| anyhow!("vector slab overflow"))?;
                let byte_end = offset
                    .checked_add(end * 4)
                    .ok_or_else(|| anyhow!("vector slab overflow"))?;
                if byte_end > offset + len_bytes {
                    bail!("vector slab slice out of bounds");
                }
                let bytes = mmap
                    .get(byte_start..byte_end)
                    .ok_or_else(|| anyhow!("vector slab slice out of bounds"))?;
                bytes_as_f32(bytes)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = path.with_extension("pziv.tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("create temp index file {}", temp_path.display()))?;
        self.write_to(&mut file)?;
        file.sync_all().context("fsync index temp file")?;
        sync_dir(parent).context("fsync index directory")?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("rename index temp file {}", temp_path.display()))?;
        sync_dir(parent).context("fsync index directory post-rename")?;
        Ok(())
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        if cfg!(target_endian = "big") {
            bail!("PZIV write is only supported on little-endian targets");
        }
        let nlist = self.nlist();
        let count = self.count();
        let nlist_u32 = u32::try_from(nlist).map_err(|_| anyhow!("nlist out of range"))?;
        let count_u32 = u32::try_from(count).map_err(|_| anyhow!("count out of range"))?;
        let dimension_u32 =
            u32::try_from(self.dimension).map_err(|_| anyhow!("dimension out of range"))?;

        let mut buf = Vec::with_capacity(HEADER_LEN_BYTES);
        buf.extend_from_slice(&PZIV_MAGIC);
        buf.extend_from_slice(&PZIV_VERSION.to_le_bytes());
        buf.extend_from_slice(&dimension_u32.to_le_bytes());
        buf.extend_from_slice(&nlist_u32.to_le_bytes());
        buf.extend_from_slice(&count_u32.to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        writer.write_all(&buf)?;
        writer.write_all(&hasher.finalize().to_le_bytes())?;

        for window in self.list_offsets.windows(2) {
            let len = u32::try_from(window[1] - window[0])
                .map_err(|_| anyhow!("list length out of range"))?;
            writer.write_all(&len.to_le_bytes())?;
        }
        for row_id in &self.row_ids {
            writer.write_all(&row_id.to_le_bytes())?;
        }

        let ids_end = ids_end_bytes(nlist, count)?;
        let padding = align_up(ids_end, VECTOR_ALIGN_BYTES) - ids_end;
        if padding > 0 {
            writer.write_all(&vec![0u8; padding])?;
        }

        writer.write_all(f32_as_bytes(&self.centroids))?;
        let vectors = self.entry_vectors(0, count)?;
        writer.write_all(f32_as_bytes(vectors))?;
        Ok(())
    }

    /// Load a persisted artifact via mmap. Lists, centroids, and the row-id
    /// table are copied out (they are small and hot); the vector slab stays
    /// mapped.
    pub fn load(path: &Path) -> Result<Self> {
        if cfg!(target_endian = "big") {
            bail!("PZIV load is only supported on little-endian targets");
        }
        let file =
            File::open(path).with_context(|| format!("open index file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap index file")? };

        let mut cursor = Cursor::new(&mmap[..]);
        let (dimension, nlist, count) = read_header(&mut cursor).context("read PZIV header")?;

        let lens_start = HEADER_LEN_BYTES;
        let ids_start = lens_start
            .checked_add(nlist.checked_mul(4).ok_or_else(|| anyhow!("size overflow"))?)
            .ok_or_else(|| anyhow!("size overflow"))?;
        let ids_end = ids_end_bytes(nlist, count)?;
        let centroids_start = align_up(ids_end, VECTOR_ALIGN_BYTES);
        let slab_start = centroids_start
            .checked_add(
                nlist
                    .checked_mul(dimension)
                    .and_then(|n| n.checked_mul(4))
                    .ok_or_else(|| anyhow!("size overflow"))?,
            )
            .ok_or_else(|| anyhow!("size overflow"))?;
        let slab_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| anyhow!("size overflow"))?;
        let expected_len = slab_start
            .checked_add(slab_len)
            .ok_or_else(|| anyhow!("size overflow"))?;
        if mmap.len() != expected_len {
            bail!(
                "index file size mismatch (expected {expected_len}, got {})",
                mmap.len()
            );
        }

        let lengths = read_u32_values(&mmap[lens_start..ids_start])?;
        let mut list_offsets = Vec::with_capacity(nlist + 1);
        let mut total = 0usize;
        list_offsets.push(0);
        for len in &lengths {
            total = total
                .checked_add(*len as usize)
                .ok_or_else(|| anyhow!("list length overflow"))?;
            list_offsets.push(total);
        }
        if total != count {
            bail!("list lengths sum to {total}, header declares {count}");
        }

        let row_ids = read_u32_values(&mmap[ids_start..ids_end])?;
        let centroids = bytes_as_f32(&mmap[centroids_start..slab_start])?.to_vec();
        let positions = position_map(&row_ids)?;

        tracing::info!(dimension, nlist, count, path = %path.display(), "ivf_index_mapped");
        Ok(Self {
            dimension,
            nprobe: DEFAULT_NPROBE,
            centroids,
            list_offsets,
            row_ids,
            slab: VectorSlab::Mmap {
                mmap,
                offset: slab_start,
                len_bytes: slab_len,
            },
            positions,
        })
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<(usize, usize, usize)> {
    let mut buf = [0u8; HEADER_LEN_BYTES - 4];
    reader.read_exact(&mut buf)?;
    if buf[..4] != PZIV_MAGIC {
        bail!("invalid PZIV magic: {:?}", &buf[..4]);
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != PZIV_VERSION {
        bail!("unsupported PZIV version: {version}");
    }
    let dimension = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let nlist = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let count = u32::from_le_bytes([buf[14], buf[15], buf[16], buf[17]]);

    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let crc_expected = u32::from_le_bytes(crc_buf);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    let crc_actual = hasher.finalize();
    if crc_actual != crc_expected {
        bail!("header CRC mismatch (expected {crc_expected:#010x}, got {crc_actual:#010x})");
    }
    if dimension == 0 {
        bail!("dimension must be non-zero");
    }
    if nlist == 0 {
        bail!("nlist must be non-zero");
    }
    Ok((dimension as usize, nlist as usize, count as usize))
}

fn ids_end_bytes(nlist: usize, count: usize) -> Result<usize> {
    HEADER_LEN_BYTES
        .checked_add(nlist.checked_mul(4).ok_or_else(|| anyhow!("size overflow"))?)
        .and_then(|v| v.checked_add(count.checked_mul(4)?))
        .ok_or_else(|| anyhow!("size overflow"))
}

fn position_map(row_ids: &[u32]) -> Result<HashMap<u32, usize>> {
    let mut positions = HashMap::with_capacity(row_ids.len());
    for (position, &row_id) in row_ids.iter().enumerate() {
        if positions.insert(row_id, position).is_some() {
            bail!("row id {row_id} appears in more than one inverted list");
        }
    }
    Ok(positions)
}

fn read_u32_values(bytes: &[u8]) -> Result<Vec<u32>> {
    if !bytes.len().is_multiple_of(4) {
        bail!("u32 byte slice length is not a multiple of 4");
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn f32_as_bytes(values: &[f32]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, values.len() * 4) }
}

fn align_up(value: usize, align: usize) -> usize {
    let rem = value % align;
    if rem == 0 { value } else { value + (align - rem) }
}

fn nearest_centroid(centroids: &[f32], dimension: usize, vector: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for (cluster, centroid) in centroids.chunks_exact(dimension).enumerate() {
        let dist = squared_l2(centroid, vector);
        if dist < best_dist {
            best_dist = dist;
            best = cluster;
        }
    }
    best
}

#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[derive(Debug)]
struct Candidate {
    distance: f32,
    row_id: u32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance) == Ordering::Equal && self.row_id == other.row_id
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.row_id.cmp(&other.row_id))
    }
}

fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::TempDir;

    fn unit(dimension: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0f32; dimension];
        v[axis] = 1.0;
        v
    }

    fn sample_index(nlist: usize) -> IvfIndex {
        let dimension = 4;
        let vectors: Vec<Vec<f32>> = (0..4).map(|axis| unit(dimension, axis)).collect();
        let training: Vec<f32> = vectors.iter().flatten().copied().collect();
        let mut rng = StdRng::seed_from_u64(7);
        let quantizer = CoarseQuantizer::train(dimension, nlist, &training, &mut rng).unwrap();
        IvfIndex::build(
            quantizer,
            vectors.into_iter().enumerate().map(|(i, v)| (i as u32, v)),
        )
        .unwrap()
    }

    #[test]
    fn search_orders_by_ascending_distance() -> Result<()> {
        let index = sample_index(2);
        let query = vec![0.9, 0.1, 0.0, 0.0];
        let results = index.search(&query, 4)?;
        let rows: Vec<i64> = results.iter().map(|r| r.0).collect();
        assert_eq!(rows[0], 0);
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
        Ok(())
    }

    #[test]
    fn search_pads_with_sentinels() -> Result<()> {
        // nlist == count and nprobe capped at nlist, so every vector is
        // reachable; requesting more than exist forces sentinel padding.
        let index = sample_index(4);
        let results = index.search(&unit(4, 0), 10)?;
        assert_eq!(results.len(), 10);
        assert!(results[..4].iter().all(|r| r.0 != NO_MATCH_ROW));
        assert!(results[4..].iter().all(|r| r.0 == NO_MATCH_ROW));
        Ok(())
    }

    #[test]
    fn search_rejects_wrong_dimension() {
        let index = sample_index(2);
        assert!(index.search(&[1.0, 0.0], 3).is_err());
    }

    #[test]
    fn reconstruct_returns_stored_vectors() {
        let index = sample_index(2);
        for row in 0..4 {
            assert_eq!(index.reconstruct(row).unwrap(), unit(4, row));
        }
        assert!(index.reconstruct(99).is_none());
    }

    #[test]
    fn save_load_round_trip() -> Result<()> {
        let index = sample_index(2);
        let dir = TempDir::new()?;
        let path = dir.path().join("index.pziv");
        index.save(&path)?;

        let loaded = IvfIndex::load(&path)?;
        assert_eq!(loaded.dimension(), index.dimension());
        assert_eq!(loaded.nlist(), index.nlist());
        assert_eq!(loaded.count(), index.count());
        for row in 0..index.count() {
            assert_eq!(loaded.reconstruct(row), index.reconstruct(row));
        }
        let query = vec![0.2, 0.9, 0.1, 0.0];
        assert_eq!(loaded.search(&query, 4)?, index.search(&query, 4)?);
        Ok(())
    }

    #[test]
    fn corrupted_header_is_rejected() -> Result<()> {
        let index = sample_index(2);
        let dir = TempDir::new()?;
        let path = dir.path().join("index.pziv");
        index.save(&path)?;

        let mut bytes = std::fs::read(&path)?;
        bytes[8] ^= 0b0001_0000;
        std::fs::write(&path, &bytes)?;
        assert!(IvfIndex::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn kmeans_survives_degenerate_training() -> Result<()> {
        // One centroid per training point forces empty-cluster reseeding.
        let dimension = 3;
        let training: Vec<f32> = vec![
            1.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            0.0, 1.0, 0.0,
        ];
        let mut rng = StdRng::seed_from_u64(3);
        let quantizer = CoarseQuantizer::train(dimension, 3, &training, &mut rng)?;
        assert_eq!(quantizer.nlist(), 3);
        Ok(())
    }

    #[test]
    fn train_rejects_oversized_nlist() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(CoarseQuantizer::train(2, 3, &[1.0, 0.0, 0.0, 1.0], &mut rng).is_err());
    }
}
