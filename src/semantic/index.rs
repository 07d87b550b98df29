//! Exact nearest-neighbor index over squared Euclidean distance.
//!
//! Vectors are stored row-major in one flat buffer. Position `i` in the index is
//! the position of the document the vector was computed from.

use std::cmp::Ordering;

/// Magic tag at the start of a serialized index.
const INDEX_MAGIC: [u8; 4] = *b"FL2I";

/// Current serialization version
const INDEX_VERSION: u8 = 1;

/// magic(4) + version(1) + dimensions(4) + count(8)
const INDEX_HEADER_SIZE: usize = 17;

/// Flat (brute-force) L2 index.
///
/// Search cost is `O(n·d)` and recall is exact, so results depend only on the
/// stored vectors and the query.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dimensions: usize,
    data: Vec<f32>,
}

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Insertion position of the matched vector
    pub position: usize,
    /// Squared Euclidean distance to the query
    pub distance: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector at position {0} has a non-finite component")]
    NonFinite(usize),

    #[error("Index dimensions must be greater than zero")]
    ZeroDimensions,

    #[error("Corrupt index data: {0}")]
    Corrupt(String),
}

impl FlatL2Index {
    /// Create an empty index for vectors of `dimensions` components.
    #[cfg(test)]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            data: Vec::new(),
        }
    }

    /// Build an index over every row of `matrix`, in order.
    pub fn build(dimensions: usize, matrix: &[Vec<f32>]) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }

        let mut index = Self {
            dimensions,
            data: Vec::with_capacity(dimensions * matrix.len()),
        };
        for row in matrix {
            index.add(row)?;
        }
        Ok(index)
    }

    /// Append one vector. Its position is the current `len()`.
    pub fn add(&mut self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite(self.len()));
        }

        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    /// Vector stored at `position`.
    #[cfg(test)]
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimensions)?;
        self.data.get(start..start + self.dimensions)
    }

    /// Iterate over stored vectors in insertion order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }

    /// Find up to `k` nearest vectors to `query`.
    ///
    /// Results are sorted by ascending distance, ties by ascending position.
    /// `k == 0` or `k >= len()` returns every entry.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let mut results: Vec<Neighbor> = self
            .vectors()
            .enumerate()
            .map(|(position, vector)| Neighbor {
                position,
                distance: squared_l2(query, vector),
            })
            .collect();

        let limit = if k == 0 { results.len() } else { k };
        if limit < results.len() {
            results.select_nth_unstable_by(limit - 1, compare_neighbors);
            results.truncate(limit);
        }
        results.sort_by(compare_neighbors);

        Ok(results)
    }

    /// Serialize to a self-describing little-endian blob.
    ///
    /// Layout: magic `FL2I`, version u8, dimensions u32, count u64, then
    /// `count * dimensions` f32 values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INDEX_HEADER_SIZE + self.data.len() * 4);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.push(INDEX_VERSION);
        bytes.extend_from_slice(&(self.dimensions as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Rebuild an index from [`FlatL2Index::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < INDEX_HEADER_SIZE {
            return Err(IndexError::Corrupt(format!(
                "blob is {} bytes, header needs {INDEX_HEADER_SIZE}",
                bytes.len()
            )));
        }
        if bytes[0..4] != INDEX_MAGIC {
            return Err(IndexError::Corrupt("bad magic".to_string()));
        }
        if bytes[4] != INDEX_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }

        let dimensions = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[9..17]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        if dimensions == 0 {
            return Err(IndexError::ZeroDimensions);
        }

        let expected = count
            .checked_mul(dimensions)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| IndexError::Corrupt("vector count overflows".to_string()))?;
        let payload = &bytes[INDEX_HEADER_SIZE..];
        if payload.len() != expected {
            return Err(IndexError::Corrupt(format!(
                "expected {expected} bytes of vectors, found {}",
                payload.len()
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self { dimensions, data })
    }
}

/// Squared Euclidean distance, accumulated left to right.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn compare_neighbors(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.position.cmp(&b.position))
}
