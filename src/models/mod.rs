//! The captioner consists of a convolutional encoder, a bag-of-words decoder and an optional
//! language model over captions

mod decoder;
mod encoder;
mod lm;

use crate::dataset::hold_out;
use crate::error::Result;
use crate::kwargs::Kwargs;
use crate::state::Parameterized;
pub use decoder::{bag_of_words, Decoder};
pub use encoder::{EncoderConfig, EncoderKind, PyramidConvEncoder, STAGES_LAYER};
pub use lm::Lm;
use candle_core::{Device, Module, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder};
use log::info;

pub const DECODER_LAYER: &str = "decoder";
pub const LM_LAYER: &str = "lm";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptionerConfig {
    pub feature_size: usize,
    pub vocab_size: usize,
    #[serde(default = "CaptionerConfig::default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "CaptionerConfig::default_lm")]
    pub lm: bool,
}

impl CaptionerConfig {
    fn default_hidden_size() -> usize {
        128
    }

    fn default_lm() -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct Captioner {
    decoder: Decoder,
    lm: Option<Lm>,
}

impl Captioner {
    pub fn new(config: &CaptionerConfig, vb: VarBuilder) -> Result<Self> {
        let decoder = Decoder::new(
            config.feature_size,
            config.hidden_size,
            config.vocab_size,
            vb.pp(DECODER_LAYER),
        )?;
        let lm = if config.lm {
            Some(Lm::new(config.vocab_size, config.hidden_size, vb.pp(LM_LAYER))?)
        } else {
            None
        };
        Ok(Self { decoder, lm })
    }

    pub fn from_kwargs(kwargs: &Kwargs, vb: VarBuilder) -> Result<Self> {
        Self::new(&kwargs.parse()?, vb)
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn lm(&self) -> Option<&Lm> {
        self.lm.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Fraction of samples held out for validation.
    pub hold_out: f64,
    pub device: Device,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            learning_rate: 1e-3,
            hold_out: 0.1,
            device: Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FitReport {
    /// Mean training loss of every epoch.
    pub train_losses: Vec<f32>,
    /// Mean validation loss of every epoch, empty without held out samples.
    pub validation_losses: Vec<f32>,
}

fn index_tensor(indices: &[usize], device: &Device) -> Result<Tensor> {
    let len = indices.len();
    let indices: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    Ok(Tensor::from_vec(indices, len, device)?)
}

/// Mean of `loss` over `indices` in batches, optionally stepping `optimizer` after each batch.
fn run_epoch<L>(
    indices: &[usize],
    options: &FitOptions,
    mut optimizer: Option<&mut AdamW>,
    loss: &L,
) -> Result<f32>
where
    L: Fn(&Tensor) -> Result<Tensor>,
{
    let mut total = 0f32;
    for batch in indices.chunks(options.batch_size.max(1)) {
        let batch_loss = loss(&index_tensor(batch, &options.device)?)?;
        if let Some(optimizer) = optimizer.as_deref_mut() {
            optimizer.backward_step(&batch_loss)?;
        }
        total += batch_loss.to_scalar::<f32>()? * batch.len() as f32;
    }
    Ok(total / indices.len().max(1) as f32)
}

/// Train the vars of `layers` on `samples` examples. `loss` maps a tensor of sample indices to a
/// scalar loss.
fn fit<M, L>(
    model: &Parameterized<M>,
    layers: &[String],
    samples: usize,
    options: &FitOptions,
    loss: L,
) -> Result<FitReport>
where
    L: Fn(&Tensor) -> Result<Tensor>,
{
    let (train, validation) = hold_out(samples, options.hold_out)?;
    let params = ParamsAdamW {
        lr: options.learning_rate,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(model.layer_vars(layers)?, params)?;
    let mut report = FitReport::default();
    for epoch in 0..options.epochs {
        let train_loss = run_epoch(&train, options, Some(&mut optimizer), &loss)?;
        report.train_losses.push(train_loss);
        if validation.is_empty() {
            info!("{:?} epoch {}: train loss {:.4}", layers, epoch + 1, train_loss);
        } else {
            let validation_loss = run_epoch(&validation, options, None, &loss)?;
            report.validation_losses.push(validation_loss);
            info!(
                "{:?} epoch {}: train loss {:.4}, validation loss {:.4}",
                layers,
                epoch + 1,
                train_loss,
                validation_loss
            );
        }
    }
    Ok(report)
}

impl Parameterized<Captioner> {
    /// Train the decoder to predict the words of `captions` from `inputs`.
    ///
    /// `inputs` are either precomputed features or images; images are run through `encoder`,
    /// whose parameters are left alone.
    pub fn fit_decoder(
        &self,
        inputs: &Tensor,
        captions: &Tensor,
        encoder: Option<&PyramidConvEncoder>,
        options: &FitOptions,
    ) -> Result<FitReport> {
        let targets = bag_of_words(captions, self.decoder.vocab_size())?;
        let inputs = inputs.to_device(&options.device)?;
        let targets = targets.to_device(&options.device)?;
        fit(
            self,
            &[DECODER_LAYER.to_string()],
            inputs.dim(0)?,
            options,
            |batch: &Tensor| {
                let x = inputs.index_select(batch, 0)?;
                let features = match encoder {
                    Some(encoder) => encoder.forward(&x)?.detach(),
                    None => x,
                };
                let logits = self.decoder.forward(&features)?;
                let y = targets.index_select(batch, 0)?;
                Ok(candle_nn::loss::binary_cross_entropy_with_logit(&logits, &y)?)
            },
        )
    }

    /// Train the language model on `captions`. Without a language model nothing is trained.
    pub fn fit_lm(&self, captions: &Tensor, options: &FitOptions) -> Result<FitReport> {
        let Some(lm) = &self.lm else {
            return Ok(FitReport::default());
        };
        let captions = captions.to_device(&options.device)?;
        fit(
            self,
            &[LM_LAYER.to_string()],
            captions.dim(0)?,
            options,
            |batch: &Tensor| lm.loss(&captions.index_select(batch, 0)?),
        )
    }
}
