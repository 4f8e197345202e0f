use crate::error::{shape_error, DoReMiError};

/// Per-token losses of a micro-batch, `[batch_size, seq_len]` row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLosses {
    batch_size: usize,
    seq_len: usize,
    data: Vec<f32>,
}

impl TokenLosses {
    pub fn new(batch_size: usize, seq_len: usize, data: Vec<f32>) -> Result<Self, DoReMiError> {
        if data.len() != batch_size * seq_len {
            return Err(shape_error!(
                "{} losses do not fill [{batch_size}, {seq_len}]",
                data.len()
            ));
        }
        Ok(Self {
            batch_size,
            seq_len,
            data,
        })
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, DoReMiError> {
        let seq_len = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(row) = rows.iter().position(|row| row.len() != seq_len) {
            return Err(shape_error!(
                "row {row} has {} losses, row 0 has {seq_len}",
                rows[row].len()
            ));
        }
        Self::new(rows.len(), seq_len, rows.concat())
    }

    pub fn filled(batch_size: usize, seq_len: usize, value: f32) -> Self {
        Self {
            batch_size,
            seq_len,
            data: vec![value; batch_size * seq_len],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.batch_size, self.seq_len]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.seq_len..(i + 1) * self.seq_len]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact(0) panics
        self.data.chunks_exact(self.seq_len.max(1)).take(self.batch_size)
    }

    pub(crate) fn zip_map(
        &self,
        other: &Self,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Self, DoReMiError> {
        if self.shape() != other.shape() {
            return Err(shape_error!(
                "losses {:?} and reference losses {:?} differ in shape",
                self.shape(),
                other.shape()
            ));
        }
        Ok(Self {
            batch_size: self.batch_size,
            seq_len: self.seq_len,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }
}

/// This rank's slice of the vocabulary logits, `[num_tokens, vocab_size / tp]`.
///
/// Tensor-parallel rank `r` holds vocabulary entries
/// `[r * shard_width, (r + 1) * shard_width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedLogits {
    num_tokens: usize,
    vocab_size: usize,
    shard_width: usize,
    data: Vec<f32>,
}

impl ShardedLogits {
    pub fn new(
        num_tokens: usize,
        vocab_size: usize,
        tp_size: usize,
        data: Vec<f32>,
    ) -> Result<Self, DoReMiError> {
        if tp_size == 0 || vocab_size % tp_size != 0 {
            return Err(shape_error!(
                "vocab size {vocab_size} does not split evenly over {tp_size} tensor parallel ranks"
            ));
        }
        let shard_width = vocab_size / tp_size;
        if data.len() != num_tokens * shard_width {
            return Err(shape_error!(
                "{} logits do not fill [{num_tokens}, {shard_width}]",
                data.len()
            ));
        }
        Ok(Self {
            num_tokens,
            vocab_size,
            shard_width,
            data,
        })
    }

    /// Cuts the shard for `tp_rank` out of full `[num_tokens, vocab_size]` logits.
    pub fn shard_of(
        full: &[f32],
        num_tokens: usize,
        vocab_size: usize,
        tp_rank: usize,
        tp_size: usize,
    ) -> Result<Self, DoReMiError> {
        if full.len() != num_tokens * vocab_size {
            return Err(shape_error!(
                "{} logits do not fill [{num_tokens}, {vocab_size}]",
                full.len()
            ));
        }
        if tp_size == 0 || vocab_size % tp_size != 0 || tp_rank >= tp_size {
            return Err(shape_error!(
                "cannot take shard {tp_rank} of {tp_size} from a vocabulary of {vocab_size}"
            ));
        }
        let width = vocab_size / tp_size;
        let data = full
            .chunks_exact(vocab_size.max(1))
            .flat_map(|row| row[tp_rank * width..(tp_rank + 1) * width].iter().copied())
            .collect();
        Self::new(num_tokens, vocab_size, tp_size, data)
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn shard_width(&self) -> usize {
        self.shard_width
    }

    pub fn row(&self, token: usize) -> &[f32] {
        &self.data[token * self.shard_width..(token + 1) * self.shard_width]
    }
}
