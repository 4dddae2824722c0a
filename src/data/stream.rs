//! Out-of-core access to the position-level activation stream.
//!
//! The stream is a row-major sequence of raw hidden-state vectors, one row
//! per position, plus a parallel entity-id index of the same length. Rows are
//! read through [`ActivationSource::read`] in bounded blocks so resident
//! memory tracks the block size, never the stream length.

use crate::error::{EnrichError, Result};
use nalgebra::DMatrix;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Lazy chunked reader over position rows.
pub trait ActivationSource: Send {
    /// Total number of positions in the stream.
    fn n_positions(&self) -> usize;

    /// Width of each position row.
    fn dim(&self) -> usize;

    /// Read a contiguous block of rows as a dense `(range.len(), dim)` matrix.
    fn read(&mut self, range: Range<usize>) -> Result<DMatrix<f32>>;
}

fn check_range(range: &Range<usize>, n_positions: usize) -> Result<()> {
    if range.start > range.end || range.end > n_positions {
        return Err(EnrichError::InvalidParameter(format!(
            "Position range {}..{} outside stream of {} positions",
            range.start, range.end, n_positions
        )));
    }
    Ok(())
}

/// A fully materialized stream, for small inputs and tests.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    rows: DMatrix<f32>,
}

impl InMemorySource {
    /// Wrap a `(n_positions, dim)` matrix.
    pub fn new(rows: DMatrix<f32>) -> Self {
        Self { rows }
    }

    /// Build from row-major data.
    pub fn from_rows(n_positions: usize, dim: usize, data: &[f32]) -> Result<Self> {
        if data.len() != n_positions * dim {
            return Err(EnrichError::DimensionMismatch {
                expected: n_positions * dim,
                actual: data.len(),
            });
        }
        Ok(Self::new(DMatrix::from_row_slice(n_positions, dim, data)))
    }
}

impl ActivationSource for InMemorySource {
    fn n_positions(&self) -> usize {
        self.rows.nrows()
    }

    fn dim(&self) -> usize {
        self.rows.ncols()
    }

    fn read(&mut self, range: Range<usize>) -> Result<DMatrix<f32>> {
        check_range(&range, self.n_positions())?;
        Ok(self.rows.rows(range.start, range.len()).into_owned())
    }
}

/// Row-major little-endian `f32` file, read with seek + bounded reads.
#[derive(Debug)]
pub struct RawF32Source {
    path: PathBuf,
    reader: BufReader<File>,
    n_positions: usize,
    dim: usize,
}

impl RawF32Source {
    /// Open a raw activation file whose rows are `dim` floats wide.
    pub fn open<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(EnrichError::InvalidParameter(
                "Activation row width must be positive".to_string(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let n_bytes = file.metadata()?.len() as usize;
        let row_bytes = dim * std::mem::size_of::<f32>();
        if n_bytes % row_bytes != 0 {
            return Err(EnrichError::DimensionMismatch {
                expected: (n_bytes / row_bytes + 1) * row_bytes,
                actual: n_bytes,
            });
        }
        Ok(Self {
            path,
            reader: BufReader::new(file),
            n_positions: n_bytes / row_bytes,
            dim,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivationSource for RawF32Source {
    fn n_positions(&self) -> usize {
        self.n_positions
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn read(&mut self, range: Range<usize>) -> Result<DMatrix<f32>> {
        check_range(&range, self.n_positions)?;
        let row_bytes = self.dim * std::mem::size_of::<f32>();
        self.reader
            .seek(SeekFrom::Start((range.start * row_bytes) as u64))?;

        let mut buf = vec![0u8; range.len() * row_bytes];
        self.reader.read_exact(&mut buf)?;
        let values: Vec<f32> = buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(DMatrix::from_row_slice(range.len(), self.dim, &values))
    }
}

/// Write rows as a raw little-endian `f32` file.
pub fn write_raw_f32<P: AsRef<Path>>(path: P, rows: &DMatrix<f32>) -> Result<()> {
    let mut bytes = Vec::with_capacity(rows.len() * 4);
    for r in 0..rows.nrows() {
        for v in rows.row(r).iter() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Parallel entity-id index for a stream.
///
/// Positions of one entity must be contiguous and entity ids must be
/// non-decreasing along the stream, so every entity owns one position span.
/// Entities with no positions own an empty span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIndex {
    ids: Vec<u32>,
    /// `offsets[e]..offsets[e + 1]` are the positions of entity `e`.
    offsets: Vec<usize>,
}

impl EntityIndex {
    /// Validate ids against the declared entity count and build spans.
    pub fn new(ids: Vec<u32>, n_entities: usize) -> Result<Self> {
        let mut offsets = vec![0usize; n_entities + 1];
        let mut previous: Option<u32> = None;

        for (position, &id) in ids.iter().enumerate() {
            if id as usize >= n_entities {
                return Err(EnrichError::EntityOutOfRange {
                    id: id as u64,
                    position,
                    n_entities,
                });
            }
            if let Some(prev) = previous {
                if id < prev {
                    return Err(EnrichError::StreamNotGrouped {
                        id,
                        previous: prev,
                        position,
                    });
                }
            }
            offsets[id as usize + 1] += 1;
            previous = Some(id);
        }
        for e in 0..n_entities {
            offsets[e + 1] += offsets[e];
        }

        Ok(Self { ids, offsets })
    }

    /// Read a raw little-endian `u32` id file.
    pub fn from_file<P: AsRef<Path>>(path: P, n_entities: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() % 4 != 0 {
            return Err(EnrichError::InvalidParameter(format!(
                "Entity id file length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let ids = bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(ids, n_entities)
    }

    /// Write ids as a raw little-endian `u32` file.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes: Vec<u8> = self.ids.iter().flat_map(|id| id.to_le_bytes()).collect();
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Number of positions indexed.
    pub fn n_positions(&self) -> usize {
        self.ids.len()
    }

    /// Declared number of entities.
    pub fn n_entities(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Entity ids of a position range.
    pub fn ids(&self, range: Range<usize>) -> &[u32] {
        &self.ids[range]
    }

    /// Position span covering entities `entities.start..entities.end`.
    pub fn positions_of(&self, entities: Range<usize>) -> Range<usize> {
        self.offsets[entities.start]..self.offsets[entities.end]
    }
}
