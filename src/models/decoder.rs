//! Bag-of-words caption decoder: predicts which vocabulary words describe a feature vector.

use crate::error::Result;
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

#[derive(Debug, Clone)]
pub struct Decoder {
    hidden: Linear,
    output: Linear,
    vocab_size: usize,
}

impl Decoder {
    pub fn new(
        feature_size: usize,
        hidden_size: usize,
        vocab_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = linear(feature_size, hidden_size, vb.pp("hidden"))?;
        let output = linear(hidden_size, vocab_size, vb.pp("output"))?;
        Ok(Self {
            hidden,
            output,
            vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Word ids whose predicted probability reaches `threshold`, one list per feature row. The
    /// padding id 0 is never predicted.
    pub fn predict_words(&self, features: &Tensor, threshold: f32) -> Result<Vec<Vec<u32>>> {
        let probs = candle_nn::ops::sigmoid(&self.forward(features)?)?;
        let probs = probs.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(probs
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .enumerate()
                    .skip(1)
                    .filter(|(_, p)| *p >= threshold)
                    .map(|(id, _)| id as u32)
                    .collect()
            })
            .collect())
    }
}

impl Module for Decoder {
    fn forward(&self, features: &Tensor) -> candle_core::Result<Tensor> {
        self.output.forward(&self.hidden.forward(features)?.relu()?)
    }
}

/// Multi-hot `[N, vocab_size]` targets from `[N, T]` caption token ids, ignoring padding (0).
pub fn bag_of_words(captions: &Tensor, vocab_size: usize) -> Result<Tensor> {
    let device = captions.device();
    let vocab = Tensor::arange(0u32, vocab_size as u32, device)?.reshape((1, 1, vocab_size))?;
    let hits = captions
        .to_dtype(DType::U32)?
        .unsqueeze(D::Minus1)?
        .broadcast_eq(&vocab)?
        .to_dtype(DType::F32)?
        .max(1)?;
    let mut not_padding = vec![1f32; vocab_size];
    not_padding[0] = 0.0;
    let not_padding = Tensor::from_vec(not_padding, (1, vocab_size), device)?;
    Ok(hits.broadcast_mul(&not_padding)?)
}
