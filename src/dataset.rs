//! In-memory tensor datasets read from safetensors files.

use crate::error::{CaptionerError, Result};
use crate::kwargs::Kwargs;
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::path::Path;

/// Named tensors sharing their leading (sample) dimension.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    names: Vec<String>,
    tensors: Vec<Tensor>,
    len: usize,
}

#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorDatasetArgs {
    /// Only keep these tensors, all of them when absent.
    #[serde(default)]
    names: Option<Vec<String>>,
}

impl TensorDataset {
    pub fn new<I>(tensors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut named: Vec<(String, Tensor)> = tensors.into_iter().collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        let Some((_, first)) = named.first() else {
            return Err(CaptionerError::Dataset("dataset holds no tensors".to_string()));
        };
        let len = first.dims().first().copied().ok_or_else(|| {
            CaptionerError::Dataset("dataset tensors need a sample dimension".to_string())
        })?;
        for (name, tensor) in &named {
            if tensor.dims().first() != Some(&len) {
                return Err(CaptionerError::Dataset(format!(
                    "tensor '{name}' has shape {:?}, expected {len} samples",
                    tensor.dims()
                )));
            }
        }
        let (names, tensors) = named.into_iter().unzip();
        Ok(Self {
            names,
            tensors,
            len,
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        Self::new(candle_core::safetensors::load(path.as_ref(), device)?)
    }

    /// Dataset factory: reads `path` onto the CPU, keeping the tensors listed under the `names`
    /// keyword when given.
    pub fn from_kwargs(path: &Path, kwargs: &Kwargs) -> Result<Self> {
        let args: TensorDatasetArgs = kwargs.parse()?;
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        match args.names {
            None => Self::new(tensors),
            Some(names) => {
                let mut selected = Vec::with_capacity(names.len());
                for name in names {
                    let tensor = tensors.remove(&name).ok_or_else(|| {
                        CaptionerError::Dataset(format!(
                            "no tensor '{name}' in '{}'",
                            path.display()
                        ))
                    })?;
                    selected.push((name, tensor));
                }
                Self::new(selected)
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<&str, Tensor> = self
            .names
            .iter()
            .map(String::as_str)
            .zip(self.tensors.iter().cloned())
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.tensors[i])
    }

    /// The `index`th sample of every tensor, in name order.
    pub fn get(&self, index: usize) -> Result<Vec<Tensor>> {
        if index >= self.len {
            return Err(CaptionerError::Dataset(format!(
                "index {index} out of range for {} samples",
                self.len
            )));
        }
        self.tensors
            .iter()
            .map(|tensor| tensor.get(index).map_err(Into::into))
            .collect()
    }
}

/// Several datasets with the same tensor names, read back to back.
#[derive(Debug, Clone)]
pub struct ConcatDataset {
    parts: Vec<TensorDataset>,
}

impl ConcatDataset {
    pub fn new(parts: Vec<TensorDataset>) -> Result<Self> {
        if let Some(first) = parts.first() {
            for part in &parts[1..] {
                if part.names() != first.names() {
                    return Err(CaptionerError::Dataset(format!(
                        "cannot concatenate datasets with tensors {:?} and {:?}",
                        first.names(),
                        part.names()
                    )));
                }
            }
        }
        Ok(Self { parts })
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(TensorDataset::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, mut index: usize) -> Result<Vec<Tensor>> {
        for part in &self.parts {
            if index < part.len() {
                return part.get(index);
            }
            index -= part.len();
        }
        Err(CaptionerError::Dataset(format!(
            "index out of range for {} samples",
            self.len()
        )))
    }

    /// The named tensor of every part joined along the sample dimension.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let tensors = self
            .parts
            .iter()
            .map(|part| {
                part.tensor(name)
                    .ok_or_else(|| CaptionerError::Dataset(format!("no tensor '{name}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        if tensors.is_empty() {
            return Err(CaptionerError::Dataset("empty dataset".to_string()));
        }
        Ok(Tensor::cat(&tensors, 0)?)
    }
}

/// Split `len` sample indices into training and validation indices, holding out the last
/// `fraction` of them.
pub fn hold_out(len: usize, fraction: f64) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(0.0..1.0).contains(&fraction) {
        return Err(CaptionerError::Dataset(format!(
            "hold out fraction must be in [0, 1), got {fraction}"
        )));
    }
    // at least one training sample is kept
    let held = ((len as f64 * fraction).round() as usize).min(len.saturating_sub(1));
    let indices: Vec<usize> = (0..len).collect();
    let (train, validation) = indices.split_at(len - held);
    Ok((train.to_vec(), validation.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn dataset(samples: usize) -> Result<TensorDataset> {
        let device = Device::Cpu;
        TensorDataset::new([
            (
                "images".to_string(),
                Tensor::arange(0f32, samples as f32, &device)?.reshape((samples, 1))?,
            ),
            (
                "captions".to_string(),
                Tensor::zeros((samples, 4), DType::U32, &device)?,
            ),
        ])
    }

    #[test]
    fn test_tensor_dataset() -> Result<()> {
        let dataset = dataset(5)?;
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.names(), &["captions", "images"]);
        let sample = dataset.get(3)?;
        assert_eq!(sample[0].dims(), &[4]);
        assert_eq!(sample[1].to_vec1::<f32>()?, vec![3.0]);
        assert!(dataset.get(5).is_err());
        Ok(())
    }

    #[test]
    fn test_tensor_dataset_mismatched_samples() -> Result<()> {
        let device = Device::Cpu;
        let result = TensorDataset::new([
            ("a".to_string(), Tensor::zeros(3, DType::F32, &device)?),
            ("b".to_string(), Tensor::zeros(4, DType::F32, &device)?),
        ]);
        assert!(matches!(result, Err(CaptionerError::Dataset(_))));
        assert!(TensorDataset::new(Vec::<(String, Tensor)>::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_from_kwargs_selects_names() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("data.safetensors");
        dataset(3)?.save(&file)?;

        let all = TensorDataset::from_kwargs(&file, &Kwargs::new())?;
        assert_eq!(all.names().len(), 2);

        let names = Kwargs::new().with("names", vec!["images"]);
        let images = TensorDataset::from_kwargs(&file, &names)?;
        assert_eq!(images.names(), &["images"]);

        let names = Kwargs::new().with("names", vec!["missing"]);
        assert!(TensorDataset::from_kwargs(&file, &names).is_err());
        Ok(())
    }

    #[test]
    fn test_concat_dataset() -> Result<()> {
        let concat = ConcatDataset::new(vec![dataset(2)?, dataset(3)?])?;
        assert_eq!(concat.len(), 5);
        assert_eq!(concat.get(2)?[1].to_vec1::<f32>()?, vec![0.0]);
        assert_eq!(concat.get(4)?[1].to_vec1::<f32>()?, vec![2.0]);
        assert!(concat.get(5).is_err());
        assert_eq!(concat.tensor("images")?.dims(), &[5, 1]);
        assert!(concat.tensor("missing").is_err());
        Ok(())
    }

    #[test]
    fn test_hold_out() -> Result<()> {
        let (train, validation) = hold_out(10, 0.1)?;
        assert_eq!(train, (0..9).collect::<Vec<_>>());
        assert_eq!(validation, vec![9]);

        let (train, validation) = hold_out(10, 0.0)?;
        assert_eq!(train.len(), 10);
        assert!(validation.is_empty());

        let (train, validation) = hold_out(1, 0.5)?;
        assert_eq!(train, vec![0]);
        assert!(validation.is_empty());

        let (train, validation) = hold_out(2, 0.9)?;
        assert_eq!((train, validation), (vec![0], vec![1]));

        let (train, validation) = hold_out(0, 0.5)?;
        assert!(train.is_empty() && validation.is_empty());

        assert!(hold_out(10, 1.0).is_err());
        assert!(hold_out(10, -0.5).is_err());
        Ok(())
    }
}
