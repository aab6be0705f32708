//! Communication compression for model payloads.
//!
//! - **TopK**: keep the largest-magnitude `keep_ratio` fraction of the delta
//!   against the global model (lossy, used by device-scale rounds)
//! - **Lossless**: LZ4 over the CBOR encoding (exact, used by
//!   organization-scale rounds)
//! - **Exact**: dense vectors, no compression

use crate::model::{SparseDelta, UpdatePayload};
use crate::serialization::{from_cbor, to_cbor, SerializationError};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Default fraction of coordinates a top-k delta keeps.
pub const DEFAULT_KEEP_RATIO: f64 = 0.1;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload dimension {got} does not match global model dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("sparse index {index} out of range for dimension {dimension}")]
    IndexOutOfRange { index: u32, dimension: usize },

    #[error("sparse delta has {indices} indices but {values} values")]
    SparseLengthMismatch { indices: usize, values: usize },

    #[error("sparse index {0} appears more than once")]
    DuplicateIndex(u32),

    #[error("LZ4 decompression failed: {0}")]
    Decompress(String),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

/// How a model payload is encoded for transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompressionCodec {
    Exact,
    Lossless,
    TopK { keep_ratio: f64 },
}

impl CompressionCodec {
    pub fn top_k() -> Self {
        CompressionCodec::TopK {
            keep_ratio: DEFAULT_KEEP_RATIO,
        }
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self, CompressionCodec::TopK { .. })
    }

    /// Encode a participant's trained parameters against the round's global model.
    pub fn encode_update(&self, global: &[f64], params: &[f64]) -> Result<UpdatePayload, CodecError> {
        match self {
            CompressionCodec::Exact => Ok(UpdatePayload::Dense(params.to_vec())),
            CompressionCodec::Lossless => Ok(UpdatePayload::Compressed(compress_parameters(params)?)),
            CompressionCodec::TopK { keep_ratio } => {
                if global.len() != params.len() {
                    return Err(CodecError::DimensionMismatch {
                        expected: global.len(),
                        got: params.len(),
                    });
                }
                let delta: Vec<f64> = params.iter().zip(global).map(|(p, g)| p - g).collect();
                Ok(UpdatePayload::SparseDelta(top_k(&delta, *keep_ratio)))
            }
        }
    }

    /// Encode the global model pushed to participants.
    ///
    /// The downlink is never sparsified; participants need the exact model.
    pub fn encode_model(&self, params: &[f64]) -> Result<UpdatePayload, CodecError> {
        match self {
            CompressionCodec::Lossless => Ok(UpdatePayload::Compressed(compress_parameters(params)?)),
            _ => Ok(UpdatePayload::Dense(params.to_vec())),
        }
    }
}

/// Number of coordinates a top-k delta of dimension `n` keeps.
fn keep_count(n: usize, keep_ratio: f64) -> usize {
    if n == 0 {
        return 0;
    }
    let ratio = keep_ratio.clamp(0.0, 1.0);
    ((n as f64 * ratio).floor() as usize).clamp(1, n)
}

/// Keep the largest-magnitude coordinates of `delta`.
///
/// Ties break on the lower index, so the result is deterministic.
pub fn top_k(delta: &[f64], keep_ratio: f64) -> SparseDelta {
    let k = keep_count(delta.len(), keep_ratio);
    let mut ranked: Vec<usize> = (0..delta.len()).collect();
    ranked.sort_by(|&a, &b| delta[b].abs().total_cmp(&delta[a].abs()).then(a.cmp(&b)));
    ranked.truncate(k);
    ranked.sort_unstable();

    SparseDelta {
        values: ranked.iter().map(|&i| delta[i]).collect(),
        indices: ranked.into_iter().map(|i| i as u32).collect(),
        dimension: delta.len(),
    }
}

/// Turn a received payload back into a dense parameter vector.
pub fn materialize(global: &[f64], payload: &UpdatePayload) -> Result<Vec<f64>, CodecError> {
    match payload {
        UpdatePayload::Dense(params) => Ok(params.clone()),
        UpdatePayload::Compressed(bytes) => decompress_parameters(bytes),
        UpdatePayload::SparseDelta(delta) => {
            if delta.dimension != global.len() {
                return Err(CodecError::DimensionMismatch {
                    expected: global.len(),
                    got: delta.dimension,
                });
            }
            if delta.indices.len() != delta.values.len() {
                return Err(CodecError::SparseLengthMismatch {
                    indices: delta.indices.len(),
                    values: delta.values.len(),
                });
            }
            let mut seen = HashSet::with_capacity(delta.indices.len());
            for &index in &delta.indices {
                if index as usize >= delta.dimension {
                    return Err(CodecError::IndexOutOfRange {
                        index,
                        dimension: delta.dimension,
                    });
                }
                if !seen.insert(index) {
                    return Err(CodecError::DuplicateIndex(index));
                }
            }
            let mut params = global.to_vec();
            for (&i, &v) in delta.indices.iter().zip(&delta.values) {
                params[i as usize] += v;
            }
            Ok(params)
        }
    }
}

/// LZ4 over the CBOR encoding of a parameter vector.
pub fn compress_parameters(params: &[f64]) -> Result<Vec<u8>, CodecError> {
    Ok(compress_prepend_size(&to_cbor(&params)?))
}

pub fn decompress_parameters(bytes: &[u8]) -> Result<Vec<f64>, CodecError> {
    let raw = decompress_bytes(bytes)?;
    Ok(from_cbor(&raw)?)
}

pub fn compress_bytes(bytes: &[u8]) -> Vec<u8> {
    compress_prepend_size(bytes)
}

pub fn decompress_bytes(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    decompress_size_prepended(bytes).map_err(|e| CodecError::Decompress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_keeps_largest_magnitudes() {
        let delta = vec![0.1, -5.0, 0.2, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let sparse = top_k(&delta, 0.2);
        assert_eq!(sparse.indices, vec![1, 3]);
        assert_eq!(sparse.values, vec![-5.0, 3.0]);
        assert_eq!(sparse.dimension, 10);
    }

    #[test]
    fn test_top_k_reaches_ninety_percent_reduction() {
        let delta: Vec<f64> = (0..1000).map(|i| (i as f64).sin()).collect();
        let sparse = top_k(&delta, DEFAULT_KEEP_RATIO);
        assert!(sparse.reduction() >= 0.9);
        assert_eq!(sparse.nnz(), 100);
    }

    #[test]
    fn test_top_k_keeps_at_least_one() {
        let sparse = top_k(&[2.0], DEFAULT_KEEP_RATIO);
        assert_eq!(sparse.nnz(), 1);
        assert!(top_k(&[], DEFAULT_KEEP_RATIO).indices.is_empty());
    }

    #[test]
    fn test_materialize_sparse_delta() {
        let global = vec![1.0, 1.0, 1.0];
        let payload = CompressionCodec::TopK { keep_ratio: 0.34 }
            .encode_update(&global, &[1.0, 4.0, 1.5])
            .unwrap();
        assert_eq!(materialize(&global, &payload).unwrap(), vec![1.0, 4.0, 1.0]);
    }

    #[test]
    fn test_materialize_rejects_bad_sparse_delta() {
        let payload = UpdatePayload::SparseDelta(SparseDelta {
            indices: vec![9],
            values: vec![1.0],
            dimension: 2,
        });
        assert!(matches!(
            materialize(&[0.0, 0.0], &payload),
            Err(CodecError::IndexOutOfRange { index: 9, .. })
        ));
        assert!(matches!(
            materialize(&[0.0], &payload),
            Err(CodecError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_materialize_rejects_inconsistent_sparse_delta() {
        let truncated = UpdatePayload::SparseDelta(SparseDelta {
            indices: vec![0, 1],
            values: vec![1.0],
            dimension: 2,
        });
        assert!(matches!(
            materialize(&[0.0, 0.0], &truncated),
            Err(CodecError::SparseLengthMismatch { indices: 2, values: 1 })
        ));

        let repeated = UpdatePayload::SparseDelta(SparseDelta {
            indices: vec![1, 0, 1],
            values: vec![1.0, 1.0, 1.0],
            dimension: 2,
        });
        assert!(matches!(
            materialize(&[0.0, 0.0], &repeated),
            Err(CodecError::DuplicateIndex(1))
        ));
    }

    #[test]
    fn test_lossless_is_exact() {
        let params = vec![0.1, -2.5e-9, 1e300, 3.0];
        let payload = CompressionCodec::Lossless.encode_update(&[], &params).unwrap();
        assert!(matches!(payload, UpdatePayload::Compressed(_)));
        assert_eq!(materialize(&[], &payload).unwrap(), params);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(decompress_parameters(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_codec_toml_shape() {
        let codec: CompressionCodec = toml::from_str("kind = \"top_k\"\nkeep_ratio = 0.05").unwrap();
        assert_eq!(codec, CompressionCodec::TopK { keep_ratio: 0.05 });
        assert!(codec.is_lossy());
    }
}
