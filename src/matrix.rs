//! Memory-mapped raw embedding matrix, the reconstruction fallback source.
//!
//! The file is a NumPy `.npy` array (versions 1.0 and 2.0) holding a dense
//! little-endian float32 matrix of shape (N, d) in C order, row order
//! matching the metadata catalog. Read-only at serve time.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use memmap2::Mmap;

const NPY_MAGIC: [u8; 6] = *b"\x93NUMPY";

#[derive(Debug)]
pub struct EmbeddingMatrix {
    mmap: Mmap,
    data_offset: usize,
    rows: usize,
    dim: usize,
}

impl EmbeddingMatrix {
    pub fn open(path: &Path) -> Result<Self> {
        if cfg!(target_endian = "big") {
            bail!("embedding matrix load is only supported on little-endian targets");
        }
        let file =
            File::open(path).with_context(|| format!("open embedding file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap embedding file")? };

        let (header, data_offset) = read_npy_header(&mmap)?;
        let (rows, dim) = parse_npy_dict(&header)?;

        let expected = data_offset
            .checked_add(
                rows.checked_mul(dim)
                    .and_then(|n| n.checked_mul(4))
                    .ok_or_else(|| anyhow!("matrix size overflow"))?,
            )
            .ok_or_else(|| anyhow!("matrix size overflow"))?;
        if mmap.len() != expected {
            bail!(
                "embedding file size mismatch (expected {expected}, got {})",
                mmap.len()
            );
        }

        tracing::info!(rows, dim, path = %path.display(), "embedding_matrix_mapped");
        Ok(Self {
            mmap,
            data_offset,
            rows,
            dim,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, row: usize) -> Result<&[f32]> {
        if row >= self.rows {
            bail!("row {row} out of range (matrix has {} rows)", self.rows);
        }
        let start = self.data_offset + row * self.dim * 4;
        let bytes = self
            .mmap
            .get(start..start + self.dim * 4)
            .ok_or_else(|| anyhow!("row {row} out of bounds"))?;
        bytes_as_f32(bytes)
    }
}

fn read_npy_header(bytes: &[u8]) -> Result<(String, usize)> {
    if bytes.len() < 10 || bytes[..6] != NPY_MAGIC {
        bail!("not an NPY file (bad magic)");
    }
    let major = bytes[6];
    let (header_len, header_start): (usize, usize) = match major {
        1 => {
            let len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            (len, 10)
        }
        2 => {
            if bytes.len() < 12 {
                bail!("truncated NPY v2 header");
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12)
        }
        other => bail!("unsupported NPY version {other}"),
    };
    let header_end = header_start
        .checked_add(header_len)
        .ok_or_else(|| anyhow!("NPY header length overflow"))?;
    let header = bytes
        .get(header_start..header_end)
        .ok_or_else(|| anyhow!("truncated NPY header"))?;
    let header = std::str::from_utf8(header).context("NPY header is not valid UTF-8")?;
    Ok((header.to_string(), header_end))
}

/// Extract (rows, dim) from the header dict, insisting on a little-endian
/// float32 C-order rank-2 array.
fn parse_npy_dict(header: &str) -> Result<(usize, usize)> {
    let descr = dict_value(header, "descr").ok_or_else(|| anyhow!("NPY header has no descr"))?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    if descr != "<f4" {
        bail!("unsupported NPY dtype {descr:?} (expected <f4)");
    }

    let order = dict_value(header, "fortran_order")
        .ok_or_else(|| anyhow!("NPY header has no fortran_order"))?;
    if order.starts_with("True") {
        bail!("Fortran-order NPY matrices are not supported");
    }

    let shape = dict_value(header, "shape").ok_or_else(|| anyhow!("NPY header has no shape"))?;
    let inner = shape
        .strip_prefix('(')
        .and_then(|s| s.find(')').map(|end| &s[..end]))
        .ok_or_else(|| anyhow!("malformed NPY shape {shape:?}"))?;
    let dims: Vec<usize> = inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("parse NPY shape dimension"))
        .collect::<Result<_>>()?;
    match dims.as_slice() {
        [rows, dim] => Ok((*rows, *dim)),
        other => bail!("expected a 2-D matrix, got shape of rank {}", other.len()),
    }
}

/// Value substring following `'key':` in the header dict, trimmed but
/// otherwise raw (runs to the next top-level separator).
fn dict_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let start = header.find(&pattern)? + pattern.len();
    let rest = header[start..].trim_start();
    if rest.starts_with('(') {
        let end = rest.find(')')? + 1;
        Some(&rest[..end])
    } else {
        let end = rest.find([',', '}'])?;
        Some(rest[..end].trim_end())
    }
}

pub(crate) fn bytes_as_f32(bytes: &[u8]) -> Result<&[f32]> {
    if !bytes.len().is_multiple_of(4) {
        bail!("f32 byte slice length is not a multiple of 4");
    }
    // SAFETY: we validate length and alignment before using the slice as f32.
    let (prefix, aligned, suffix) = unsafe { bytes.align_to::<f32>() };
    if !prefix.is_empty() || !suffix.is_empty() {
        bail!("f32 byte slice is not aligned");
    }
    Ok(aligned)
}

/// Write a float32 C-order matrix as NPY v1.0, the shape the builder and
/// the fallback path consume. Data starts on a 64-byte boundary.
pub fn write_npy(path: &Path, rows: &[Vec<f32>], dim: usize) -> Result<()> {
    for (i, row) in rows.iter().enumerate() {
        if row.len() != dim {
            bail!("row {i} has dimension {}, expected {dim}", row.len());
        }
    }
    let dict = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows.len(),
        dim
    );
    // Pad the header so the data offset is a multiple of 64, per the format.
    let unpadded = NPY_MAGIC.len() + 4 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = u16::try_from(dict.len() + padding + 1)
        .map_err(|_| anyhow!("NPY header too long"))?;

    let mut file =
        File::create(path).with_context(|| format!("create NPY file {}", path.display()))?;
    file.write_all(&NPY_MAGIC)?;
    file.write_all(&[1, 0])?;
    file.write_all(&header_len.to_le_bytes())?;
    file.write_all(dict.as_bytes())?;
    file.write_all(&vec![b' '; padding])?;
    file.write_all(b"\n")?;
    for row in rows {
        for value in row {
            file.write_all(&value.to_le_bytes())?;
        }
    }
    file.sync_all().context("fsync NPY file")?;
    Ok(())
}
