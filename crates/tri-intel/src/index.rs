// Vector Index
// Exact inner-product search over a flat f32 matrix, persisted as a small
// versioned binary file with an NDJSON meta sidecar.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

const ANN_MAGIC: &[u8; 4] = b"TANN";
const ANN_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index file malformed: {0}")]
    Malformed(&'static str),
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
}

/// Inner-product similarity index.
pub trait VectorIndex {
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError>;
    /// Top-k `(row, score)` pairs, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flat exhaustive index; rows are stored in insertion order so row indexes
/// line up with the meta sidecar lines.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("ann.tmp");
        {
            let mut handle = fs::File::create(&tmp)?;
            handle.write_all(ANN_MAGIC)?;
            handle.write_all(&ANN_VERSION.to_le_bytes())?;
            handle.write_all(&(self.dim as u32).to_le_bytes())?;
            handle.write_all(&(self.len() as u32).to_le_bytes())?;
            let mut bytes = Vec::with_capacity(self.data.len() * 4);
            for value in &self.data {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            handle.write_all(&bytes)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let mut handle = fs::File::open(path)?;
        let mut header = [0u8; 16];
        handle.read_exact(&mut header)?;
        if &header[0..4] != ANN_MAGIC {
            return Err(IndexError::Malformed("bad magic"));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        if version != ANN_VERSION {
            return Err(IndexError::Malformed("unsupported version"));
        }
        let dim = u32::from_le_bytes(header[8..12].try_into().expect("4 bytes")) as usize;
        let count = u32::from_le_bytes(header[12..16].try_into().expect("4 bytes")) as usize;
        if dim == 0 {
            return Err(IndexError::Malformed("zero dimension"));
        }

        let mut bytes = Vec::new();
        handle.read_to_end(&mut bytes)?;
        if bytes.len() != dim * count * 4 {
            return Err(IndexError::Malformed("payload size mismatch"));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4 bytes")))
            .collect();
        Ok(Self { dim, data })
    }
}

impl VectorIndex for FlatIndex {
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        for vector in vectors {
            if vector.len() != self.dim {
                return Err(IndexError::Dimension {
                    expected: self.dim,
                    got: vector.len(),
                });
            }
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dim || k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, vector)| {
                let score: f32 = vector.iter().zip(query.iter()).map(|(a, b)| a * b).sum();
                (row, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }
}
