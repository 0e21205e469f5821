//! HuggingFace API

use crate::error::Result;
use hf_hub::api::sync::ApiBuilder;
use log::debug;
use std::path::PathBuf;

/// A weights file published in a HuggingFace model repo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HfWeights {
    pub repo: String,
    pub file: String,
}

impl HfWeights {
    pub fn new(repo: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            file: file.into(),
        }
    }

    /// Download the file, or reuse the local hub cache, and return its path.
    pub fn resolve(&self) -> Result<PathBuf> {
        let api = ApiBuilder::new().with_progress(true).build()?;
        let repo = api.model(self.repo.clone());
        debug!("using weights from HuggingFace repo '{}'", self.repo);
        let path = repo.get(&self.file)?;
        debug!("using weights file '{}' at {:?}", self.file, path);
        Ok(path)
    }
}
