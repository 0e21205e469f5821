//! Convolutional image encoder
//!
//! A pyramid of strided 3x3 convolutions followed by global average pooling. The `resnet18` and
//! `resnet50` configs only differ in depth and width.

use crate::error::Result;
use crate::kwargs::Kwargs;
use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Resnet18,
    #[default]
    Resnet50,
}

impl EncoderKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet50 => "resnet50",
        }
    }

    fn widths(&self) -> &'static [usize] {
        match self {
            Self::Resnet18 => &[16, 32, 64],
            Self::Resnet50 => &[32, 64, 128, 256],
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderConfig {
    #[serde(default)]
    pub config: EncoderKind,
    #[serde(default = "EncoderConfig::default_in_channels")]
    pub in_channels: usize,
}

impl EncoderConfig {
    fn default_in_channels() -> usize {
        3
    }
}

pub const STAGES_LAYER: &str = "stages";

#[derive(Debug, Clone)]
pub struct PyramidConvEncoder {
    stages: Vec<Conv2d>,
    feature_size: usize,
}

impl PyramidConvEncoder {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp(STAGES_LAYER);
        let mut stages = Vec::new();
        let mut in_channels = config.in_channels;
        for (i, &width) in config.config.widths().iter().enumerate() {
            let stage = conv2d(
                in_channels,
                width,
                3,
                Conv2dConfig {
                    stride: 2,
                    padding: 1,
                    ..Default::default()
                },
                vb.pp(i),
            )?;
            stages.push(stage);
            in_channels = width;
        }
        Ok(Self {
            stages,
            feature_size: in_channels,
        })
    }

    pub fn from_kwargs(kwargs: &Kwargs, vb: VarBuilder) -> Result<Self> {
        Self::new(&kwargs.parse()?, vb)
    }

    pub fn feature_size(&self) -> usize {
        self.feature_size
    }

    /// Layer names of the pyramid stages, `stages.0` first.
    pub fn layer_names(&self) -> Vec<String> {
        (0..self.stages.len())
            .map(|i| format!("{STAGES_LAYER}.{i}"))
            .collect()
    }

    /// Encode `images` in batches, returning `[N, feature_size]` features.
    pub fn map(&self, images: &Tensor, batch_size: usize) -> Result<Tensor> {
        let n = images.dim(0)?;
        let mut features = Vec::new();
        for start in (0..n).step_by(batch_size.max(1)) {
            let end = usize::min(start + batch_size.max(1), n);
            features.push(self.forward(&images.i(start..end)?)?.detach());
        }
        debug!("precomputed features for {} images", n);
        Ok(Tensor::cat(&features, 0)?)
    }
}

impl Module for PyramidConvEncoder {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = x.clone();
        for stage in &self.stages {
            x = stage.forward(&x)?.relu()?;
        }
        x.mean((2, 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_encoder_config_from_kwargs() -> Result<()> {
        let config: EncoderConfig = Kwargs::new().with("config", "resnet18").parse()?;
        assert_eq!(config.config, EncoderKind::Resnet18);
        assert_eq!(config.in_channels, 3);

        let config: EncoderConfig = Kwargs::new().parse()?;
        assert_eq!(config.config, EncoderKind::Resnet50);
        assert!(Kwargs::new()
            .with("config", "vgg")
            .parse::<EncoderConfig>()
            .is_err());
        Ok(())
    }

    #[test]
    fn test_encoder_forward() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = PyramidConvEncoder::from_kwargs(&Kwargs::from([("config", "resnet18")]), vb)?;
        assert_eq!(encoder.feature_size(), 64);
        assert_eq!(encoder.layer_names(), vec!["stages.0", "stages.1", "stages.2"]);

        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &device)?;
        assert_eq!(encoder.forward(&x)?.dims(), &[2, 64]);
        Ok(())
    }

    #[test]
    fn test_encoder_map() -> Result<()> {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let encoder = PyramidConvEncoder::from_kwargs(&Kwargs::new(), vb)?;
        let images = Tensor::zeros((5, 3, 16, 16), DType::F32, &device)?;
        assert_eq!(encoder.map(&images, 2)?.dims(), &[5, 256]);
        Ok(())
    }
}
