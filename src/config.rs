//! Declarative model and dataset configs.
//!
//! A [`Config`] pairs a factory with default keyword arguments. [`ModelConfig::load`] builds a
//! model and restores (part of) its parameters from a safetensors file, [`DatasetConfig::load`]
//! builds a dataset from a data file.
//!
//! ```no_run
//! # use captioner::config::ModelConfig;
//! # use captioner::kwargs::Kwargs;
//! # use captioner::models::PyramidConvEncoder;
//! let mut config = ModelConfig::new(PyramidConvEncoder::from_kwargs, Kwargs::from([("config", "resnet18")]));
//! config.layers = vec!["stages.0".to_string()];
//! let (encoder, layers) = config.load("encoder.safetensors", &Kwargs::new())?;
//! # Ok::<(), captioner::error::CaptionerError>(())
//! ```

use crate::error::{CaptionerError, Result};
use crate::hf::HfWeights;
use crate::kwargs::Kwargs;
use crate::state::{select_matching, Parameterized, StateDict};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use log::debug;
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// Builds a model from keyword arguments, creating its parameters through `vb`.
pub trait ModelFactory<M> {
    fn create(&self, kwargs: &Kwargs, vb: VarBuilder) -> Result<M>;
}

impl<M, F> ModelFactory<M> for F
where
    F: Fn(&Kwargs, VarBuilder) -> Result<M>,
{
    fn create(&self, kwargs: &Kwargs, vb: VarBuilder) -> Result<M> {
        self(kwargs, vb)
    }
}

/// Builds a dataset from the data file at `path` and keyword arguments.
pub trait DatasetFactory<D> {
    fn create(&self, path: &Path, kwargs: &Kwargs) -> Result<D>;
}

impl<D, F> DatasetFactory<D> for F
where
    F: Fn(&Path, &Kwargs) -> Result<D>,
{
    fn create(&self, path: &Path, kwargs: &Kwargs) -> Result<D> {
        self(path, kwargs)
    }
}

pub struct Config<F> {
    pub factory: F,
    pub defaults: Kwargs,
}

impl<F> Config<F> {
    pub fn new(factory: F, defaults: Kwargs) -> Self {
        Self { factory, defaults }
    }

    /// Final factory arguments for one call: the defaults, with `overrides` taking precedence.
    pub fn merge(&self, overrides: &Kwargs) -> Kwargs {
        self.defaults.merged(overrides)
    }
}

pub struct ModelConfig<M> {
    config: Config<Box<dyn ModelFactory<M>>>,
    /// Layers to restore and report, empty meaning the whole model.
    pub layers: Vec<String>,
    pub load_weights: bool,
    pub device: Device,
    pub dtype: DType,
}

impl<M> ModelConfig<M> {
    pub fn new<F>(factory: F, defaults: Kwargs) -> Self
    where
        F: ModelFactory<M> + 'static,
    {
        Self {
            config: Config::new(Box::new(factory), defaults),
            layers: Vec::new(),
            load_weights: true,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    pub fn with_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Construct a freshly initialized model, no weights are read.
    pub fn build(&self, overrides: &Kwargs) -> Result<Parameterized<M>> {
        let kwargs = self.merge(overrides);
        debug!("building model with {:?}", kwargs.keys().collect::<Vec<_>>());
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype, &self.device);
        let model = self.factory.create(&kwargs, vb)?;
        Ok(Parameterized::new(model, varmap))
    }

    /// Build the model and, when `load_weights` is set, restore the parameters of `layers` from
    /// the safetensors file at `path`.
    ///
    /// Returns the model and the `layers` it was loaded with.
    pub fn load<P: AsRef<Path>>(
        &self,
        path: P,
        overrides: &Kwargs,
    ) -> Result<(Parameterized<M>, Vec<String>)> {
        let path = path.as_ref();
        let model = self.build(overrides)?;
        if !self.load_weights {
            debug!("weights loading disabled, keeping initial parameters");
            return Ok((model, self.layers.clone()));
        }
        if !path.is_file() {
            return Err(CaptionerError::ModelPathNotFound(path.to_path_buf()));
        }
        debug!("loading weights file '{}'", path.display());
        let saved: StateDict = candle_core::safetensors::load(path, &self.device)?
            .into_iter()
            .collect();
        let selected = select_matching(&saved, &model.state_dict()?, &self.layers)?;
        debug!(
            "restoring {} of {} saved parameters for layers {:?}",
            selected.len(),
            saved.len(),
            self.layers
        );
        model.load_state_dict(&selected)?;
        Ok((model, self.layers.clone()))
    }

    /// Like [`ModelConfig::load`], with the weights file fetched from the HuggingFace hub.
    pub fn load_hf(
        &self,
        weights: &HfWeights,
        overrides: &Kwargs,
    ) -> Result<(Parameterized<M>, Vec<String>)> {
        if !self.load_weights {
            return Ok((self.build(overrides)?, self.layers.clone()));
        }
        self.load(weights.resolve()?, overrides)
    }
}

impl<M> Deref for ModelConfig<M> {
    type Target = Config<Box<dyn ModelFactory<M>>>;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl<M> DerefMut for ModelConfig<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.config
    }
}

pub struct DatasetConfig<D> {
    config: Config<Box<dyn DatasetFactory<D>>>,
}

impl<D> DatasetConfig<D> {
    pub fn new<F>(factory: F, defaults: Kwargs) -> Self
    where
        F: DatasetFactory<D> + 'static,
    {
        Self {
            config: Config::new(Box::new(factory), defaults),
        }
    }

    /// Build the dataset stored at `path`. Factory errors are returned as is.
    pub fn load<P: AsRef<Path>>(&self, path: P, overrides: &Kwargs) -> Result<D> {
        let path = path.as_ref();
        debug!("loading dataset '{}'", path.display());
        self.factory.create(path, &self.merge(overrides))
    }
}

impl<D> Deref for DatasetConfig<D> {
    type Target = Config<Box<dyn DatasetFactory<D>>>;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl<D> DerefMut for DatasetConfig<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.config
    }
}
