//! Keyword arguments passed to factories.
//!
//! Values are plain JSON values so that defaults and overrides of any shape can be stored side by
//! side. A factory that wants typed arguments deserializes the whole bundle into its own struct
//! with [`Kwargs::parse`], or picks single entries with [`Kwargs::get`].

use crate::error::{CaptionerError, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Kwargs(Map<String, Value>);

impl Kwargs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Typed lookup of a single argument, `Ok(None)` when absent.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.0
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|e| CaptionerError::InvalidKwargs(format!("'{name}': {e}")))
            })
            .transpose()
    }

    /// Deserialize the whole bundle into `T`.
    ///
    /// With `#[serde(deny_unknown_fields)]` on `T` this rejects keywords the factory does not
    /// accept, mirroring a constructor that refuses unexpected arguments.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| CaptionerError::InvalidKwargs(e.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Combine `self` as defaults with `overrides`: colliding keys take the override, the rest of
    /// both sides is kept.
    pub fn merged(&self, overrides: &Kwargs) -> Kwargs {
        let mut merged = self.0.clone();
        for (name, value) in &overrides.0 {
            merged.insert(name.clone(), value.clone());
        }
        Kwargs(merged)
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Kwargs {
    fn from(entries: [(K, V); N]) -> Self {
        entries
            .into_iter()
            .fold(Kwargs::new(), |kwargs, (name, value)| kwargs.with(name, value))
    }
}

impl From<Map<String, Value>> for Kwargs {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
