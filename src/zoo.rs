//! Well-known datasets and model configs.
//!
//! Every dataset key names a network and the image dataset its units were annotated on. On disk a
//! dataset lives at `<root>/<network>-<images>.safetensors` and holds `images` (`[N, C, H, W]`) and
//! `captions` (`[N, T]` token ids, 0 for padding).

use crate::config::{DatasetConfig, ModelConfig};
use crate::dataset::{ConcatDataset, TensorDataset};
use crate::error::{CaptionerError, Result};
use crate::kwargs::Kwargs;
use crate::models::{Captioner, EncoderKind, PyramidConvEncoder, STAGES_LAYER};
use log::info;
use std::path::{Path, PathBuf};

pub const KEY_ALEXNET_IMAGENET: &str = "alexnet/imagenet";
pub const KEY_ALEXNET_PLACES365: &str = "alexnet/places365";
pub const KEY_RESNET152_IMAGENET: &str = "resnet152/imagenet";
pub const KEY_RESNET152_PLACES365: &str = "resnet152/places365";
pub const KEY_BIGGAN_IMAGENET: &str = "biggan/imagenet";
pub const KEY_BIGGAN_PLACES365: &str = "biggan/places365";

pub const DATASET_KEYS: [&str; 6] = [
    KEY_ALEXNET_IMAGENET,
    KEY_ALEXNET_PLACES365,
    KEY_RESNET152_IMAGENET,
    KEY_RESNET152_PLACES365,
    KEY_BIGGAN_IMAGENET,
    KEY_BIGGAN_PLACES365,
];

pub const IMAGES: &str = "images";
pub const CAPTIONS: &str = "captions";

pub fn dataset_config(key: &str) -> Result<DatasetConfig<TensorDataset>> {
    if !DATASET_KEYS.contains(&key) {
        return Err(CaptionerError::UnknownZooKey(key.to_string()));
    }
    Ok(DatasetConfig::new(
        TensorDataset::from_kwargs,
        Kwargs::new().with("names", vec![IMAGES, CAPTIONS]),
    ))
}

pub fn dataset_file(root: &Path, key: &str) -> PathBuf {
    root.join(format!("{}.safetensors", key.replace('/', "-")))
}

/// Load the datasets of `keys` from `root` and join them in order.
pub fn datasets<K: AsRef<str>>(root: &Path, keys: &[K]) -> Result<ConcatDataset> {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let key = key.as_ref();
        let dataset = dataset_config(key)?.load(dataset_file(root, key), &Kwargs::new())?;
        info!("loaded dataset {} with {} samples", key, dataset.len());
        parts.push(dataset);
    }
    ConcatDataset::new(parts)
}

/// Image encoder config, restoring every pyramid stage when weights are loaded.
pub fn encoder_config(kind: EncoderKind) -> ModelConfig<PyramidConvEncoder> {
    ModelConfig::new(
        PyramidConvEncoder::from_kwargs,
        Kwargs::new().with("config", kind.name()),
    )
    .with_layers([STAGES_LAYER])
}

/// Captioner config, `feature_size` and `vocab_size` must be passed when loading.
pub fn captioner_config() -> ModelConfig<Captioner> {
    ModelConfig::new(Captioner::from_kwargs, Kwargs::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn write_dataset(root: &Path, key: &str, samples: usize) -> Result<()> {
        let device = Device::Cpu;
        TensorDataset::new([
            (
                IMAGES.to_string(),
                Tensor::zeros((samples, 3, 4, 4), DType::F32, &device)?,
            ),
            (
                CAPTIONS.to_string(),
                Tensor::ones((samples, 5), DType::U32, &device)?,
            ),
            (
                "unused".to_string(),
                Tensor::zeros(samples, DType::F32, &device)?,
            ),
        ])?
        .save(dataset_file(root, key))
    }

    #[test]
    fn test_dataset_file() {
        assert_eq!(
            dataset_file(Path::new("data"), KEY_BIGGAN_PLACES365),
            PathBuf::from("data/biggan-places365.safetensors")
        );
    }

    #[test]
    fn test_unknown_key() {
        assert!(matches!(
            dataset_config("vgg16/imagenet"),
            Err(CaptionerError::UnknownZooKey(_))
        ));
    }

    #[test]
    fn test_datasets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path(), KEY_ALEXNET_IMAGENET, 2)?;
        write_dataset(dir.path(), KEY_RESNET152_PLACES365, 3)?;

        let dataset = datasets(dir.path(), &[KEY_ALEXNET_IMAGENET, KEY_RESNET152_PLACES365])?;
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.tensor(IMAGES)?.dims(), &[5, 3, 4, 4]);
        assert_eq!(dataset.tensor(CAPTIONS)?.dims(), &[5, 5]);
        // only the zoo's tensors are kept
        assert!(dataset.tensor("unused").is_err());

        assert!(datasets(dir.path(), &[KEY_BIGGAN_IMAGENET]).is_err());
        Ok(())
    }

    #[test]
    fn test_encoder_config_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("encoder.safetensors");
        let config = encoder_config(EncoderKind::Resnet18);
        let saved = config.build(&Kwargs::new())?;
        saved.save(&file)?;

        let (encoder, layers) = config.load(&file, &Kwargs::new())?;
        assert_eq!(layers, vec![STAGES_LAYER.to_string()]);
        assert_eq!(encoder.feature_size(), 64);
        let expected = saved.state_dict()?;
        for (key, tensor) in encoder.state_dict()? {
            let diff = (&tensor - &expected[&key])?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-3, "{key} differs by {diff}");
        }
        Ok(())
    }
}
