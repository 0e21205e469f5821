//! Next-token language model over caption token ids.

use crate::error::{CaptionerError, Result};
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};

#[derive(Debug, Clone)]
pub struct Lm {
    embedding: Embedding,
    output: Linear,
}

impl Lm {
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(vocab_size, hidden_size, vb.pp("embedding"))?;
        let output = linear(hidden_size, vocab_size, vb.pp("output"))?;
        Ok(Self { embedding, output })
    }

    /// Mean negative log likelihood of each caption token given the previous one, padding
    /// targets excluded.
    pub fn loss(&self, captions: &Tensor) -> Result<Tensor> {
        let (_, len) = captions.dims2()?;
        if len < 2 {
            return Err(CaptionerError::Dataset(format!(
                "captions need at least two tokens, got {len}"
            )));
        }
        let inputs = captions.narrow(1, 0, len - 1)?;
        let targets = captions.narrow(1, 1, len - 1)?.contiguous()?;
        let log_probs = candle_nn::ops::log_softmax(&self.forward(&inputs)?, D::Minus1)?;
        let picked = log_probs
            .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
            .squeeze(D::Minus1)?;
        let mask = targets.ne(0u32)?.to_dtype(DType::F32)?;
        let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
        Ok((picked.mul(&mask)?.sum_all()?.neg()? / count as f64)?)
    }
}

impl Module for Lm {
    /// `[N, T]` token ids to `[N, T, vocab_size]` next-token logits.
    fn forward(&self, tokens: &Tensor) -> candle_core::Result<Tensor> {
        self.output.forward(&self.embedding.forward(tokens)?)
    }
}
