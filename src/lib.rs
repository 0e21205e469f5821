pub mod config;
pub mod dataset;
pub mod error;
pub mod hf;
pub mod kwargs;
pub mod models;
pub mod state;
pub mod zoo;

pub use config::{DatasetConfig, ModelConfig};
pub use error::Result;
pub use kwargs::Kwargs;
