//! Read-only view over the scores a forward pass produces.

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use crate::error::{WorkerError, WorkerResult};

/// Scores laid out as `(batch, sequence, vocab)` in one flat buffer.
///
/// Row `i` covers `data[i * vocab .. (i + 1) * vocab]`, so a position index
/// addresses rows across the whole buffer, not within one batch entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogitsView {
    dims: [usize; 3],
    data: Vec<f32>,
}

impl LogitsView {
    pub fn new(dims: [usize; 3], data: Vec<f32>) -> WorkerResult<Self> {
        if dims[2] == 0 {
            return Err(WorkerError::EmptyVocabulary);
        }
        let expected = dims.iter().product::<usize>();
        if expected != data.len() {
            return Err(WorkerError::LogitsShape {
                dims,
                expected,
                got: data.len(),
            });
        }
        Ok(Self { dims, data })
    }

    /// A single row of scores, shaped `(1, 1, vocab)`.
    pub fn from_scores(scores: Vec<f32>) -> WorkerResult<Self> {
        Self::new([1, 1, scores.len()], scores)
    }

    /// Copy a model output tensor to the host.
    ///
    /// Rank 1 is read as `(vocab)`, rank 2 as `(batch, vocab)` for the last
    /// position only, rank 3 as `(batch, sequence, vocab)`.
    pub fn from_tensor(logits: &Tensor) -> Result<Self> {
        let dims = match logits.dims() {
            &[v] => [1, 1, v],
            &[b, v] => [b, 1, v],
            &[b, s, v] => [b, s, v],
            other => bail!("expected logits of rank 1 to 3, got shape {other:?}"),
        };
        let data = logits
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self::new(dims, data)?)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn batch_size(&self) -> usize {
        self.dims[0]
    }

    pub fn sequence_length(&self) -> usize {
        self.dims[1]
    }

    pub fn vocab_size(&self) -> usize {
        self.dims[2]
    }

    /// Number of addressable score rows (`batch * sequence`).
    pub fn rows(&self) -> usize {
        self.data.len() / self.vocab_size()
    }

    /// Scores at `position`, or the last row when `None`.
    pub fn row(&self, position: Option<usize>) -> WorkerResult<&[f32]> {
        let rows = self.rows();
        let position = match position {
            Some(p) if p < rows => p,
            Some(p) => return Err(WorkerError::PositionOutOfRange { position: p, rows }),
            None => rows.checked_sub(1).ok_or(WorkerError::PositionOutOfRange {
                position: 0,
                rows,
            })?,
        };
        let vocab = self.vocab_size();
        let start = position * vocab;
        Ok(&self.data[start..start + vocab])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
