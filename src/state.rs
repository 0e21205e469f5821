//! State dictionaries and partial parameter restoration.
//!
//! A state dictionary maps dotted parameter names (`decoder.hidden.weight`) to tensors. A *layer*
//! is a dotted prefix of such names: `decoder` and `decoder.hidden` are both layers containing
//! `decoder.hidden.weight`.

use crate::error::{CaptionerError, Result};
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

pub type StateDict = BTreeMap<String, Tensor>;

/// Summary of differences between two state dicts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateDictDiff {
    /// Keys that exist in the expected state but are missing from the loaded one.
    pub missing_keys: Vec<String>,
    /// Keys that exist in the loaded state but not in the expected one.
    pub unexpected_keys: Vec<String>,
    /// `(key, expected_shape, loaded_shape)` for keys present on both sides.
    pub shape_mismatches: Vec<(String, Vec<usize>, Vec<usize>)>,
}

impl StateDictDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.shape_mismatches.is_empty()
    }
}

impl fmt::Display for StateDictDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_keys.is_empty() {
            parts.push(format!("missing keys {:?}", self.missing_keys));
        }
        if !self.unexpected_keys.is_empty() {
            parts.push(format!("unexpected keys {:?}", self.unexpected_keys));
        }
        for (key, expected, loaded) in &self.shape_mismatches {
            parts.push(format!(
                "shape of '{key}' is {loaded:?}, model expects {expected:?}"
            ));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// Whether parameter `key` belongs to `layer`, matching whole dotted components only: `enc`
/// contains `enc.weight` but not `encoder.weight`.
pub fn layer_matches(key: &str, layer: &str) -> bool {
    key.strip_prefix(layer)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

fn in_layers(key: &str, layers: &[String]) -> bool {
    layers.is_empty() || layers.iter().any(|layer| layer_matches(key, layer))
}

/// Compare an expected state (usually the model's own) with a loaded one.
pub fn diff_state_dict(expected: &StateDict, loaded: &StateDict) -> StateDictDiff {
    let mut diff = StateDictDiff::default();
    for (key, expected_tensor) in expected {
        match loaded.get(key) {
            None => diff.missing_keys.push(key.clone()),
            Some(loaded_tensor) if expected_tensor.dims() != loaded_tensor.dims() => {
                diff.shape_mismatches.push((
                    key.clone(),
                    expected_tensor.dims().to_vec(),
                    loaded_tensor.dims().to_vec(),
                ));
            }
            Some(_) => {}
        }
    }
    diff.unexpected_keys = loaded
        .keys()
        .filter(|key| !expected.contains_key(*key))
        .cloned()
        .collect();
    diff
}

/// Select the entries of `saved` that should be restored into a model whose current state is
/// `target`.
///
/// An empty `layers` selects everything. Within the selected layers the saved entries must line
/// up exactly with the target: same keys, same shapes. A layer that names nothing in `saved`
/// contributes nothing.
pub fn select_matching(
    saved: &StateDict,
    target: &StateDict,
    layers: &[String],
) -> Result<StateDict> {
    for layer in layers {
        if !saved.keys().any(|key| layer_matches(key, layer)) {
            warn!("layer '{layer}' matches no saved parameter, nothing restored for it");
        }
    }
    let selected: StateDict = saved
        .iter()
        .filter(|(key, _)| in_layers(key, layers))
        .map(|(key, tensor)| (key.clone(), tensor.clone()))
        .collect();
    let expected: StateDict = target
        .iter()
        .filter(|(key, _)| in_layers(key, layers))
        .map(|(key, tensor)| (key.clone(), tensor.clone()))
        .collect();
    let diff = diff_state_dict(&expected, &selected);
    if !diff.is_empty() {
        return Err(CaptionerError::StateDictMismatch(diff));
    }
    Ok(selected)
}

/// `target` with every parameter inside `layers` replaced by its saved value. Neither input is
/// modified.
pub fn restore_matching(
    saved: &StateDict,
    target: &StateDict,
    layers: &[String],
) -> Result<StateDict> {
    let mut restored = target.clone();
    restored.extend(select_matching(saved, target, layers)?);
    Ok(restored)
}

/// A model together with the [`VarMap`] that owns its parameters.
///
/// The model's layers hold tensors sharing storage with the vars, so restoring a var updates the
/// model in place.
pub struct Parameterized<M> {
    model: M,
    varmap: VarMap,
}

impl<M> Parameterized<M> {
    pub fn new(model: M, varmap: VarMap) -> Self {
        Self { model, varmap }
    }

    fn vars(&self) -> Result<HashMap<String, Var>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("var map lock poisoned: {e}")))?;
        Ok(data.clone())
    }

    /// Current parameters. The tensors share storage with the model, later restores show through.
    pub fn state_dict(&self) -> Result<StateDict> {
        Ok(self
            .vars()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect())
    }

    /// Trainable vars of the given layers, all of them when `layers` is empty.
    pub fn layer_vars(&self, layers: &[String]) -> Result<Vec<Var>> {
        let mut vars: Vec<(String, Var)> = self
            .vars()?
            .into_iter()
            .filter(|(name, _)| in_layers(name, layers))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars.into_iter().map(|(_, var)| var).collect())
    }

    /// Overwrite the parameters named in `state`, leaving every other parameter untouched.
    ///
    /// Values are converted to the dtype and device of the parameter they replace. Names the model
    /// does not have and shape differences fail before anything is written.
    pub fn load_state_dict(&self, state: &StateDict) -> Result<()> {
        let vars = self.vars()?;
        let mut diff = StateDictDiff::default();
        for (name, tensor) in state {
            match vars.get(name) {
                None => diff.unexpected_keys.push(name.clone()),
                Some(var) if var.dims() != tensor.dims() => diff.shape_mismatches.push((
                    name.clone(),
                    var.dims().to_vec(),
                    tensor.dims().to_vec(),
                )),
                Some(_) => {}
            }
        }
        if !diff.is_empty() {
            return Err(CaptionerError::StateDictMismatch(diff));
        }
        for (name, tensor) in state {
            let var = &vars[name];
            let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&tensor)?;
        }
        debug!("restored {} parameters", state.len());
        Ok(())
    }

    /// Write all parameters to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path.as_ref())?;
        debug!("saved parameters to '{}'", path.as_ref().display());
        Ok(())
    }
}

impl<M> Deref for Parameterized<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

impl<M> DerefMut for Parameterized<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{linear, VarBuilder};

    fn state(entries: &[(&str, usize, f32)]) -> StateDict {
        entries
            .iter()
            .map(|(name, len, value)| {
                let tensor = Tensor::full(*value, *len, &Device::Cpu).unwrap();
                (name.to_string(), tensor)
            })
            .collect()
    }

    fn value(tensor: &Tensor) -> f32 {
        tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_layer_matches() {
        assert!(layer_matches("enc.weight", "enc"));
        assert!(layer_matches("enc.block.weight", "enc.block"));
        assert!(layer_matches("enc", "enc"));
        assert!(!layer_matches("encoder.weight", "enc"));
        assert!(!layer_matches("dec.weight", "enc"));
    }

    #[test]
    fn test_restore_matching_selected_layer_only() -> Result<()> {
        let saved = state(&[("a.weight", 4, 1.0), ("b.weight", 2, 1.0)]);
        let target = state(&[("a.weight", 4, 0.0), ("b.weight", 2, 0.0)]);
        let restored = restore_matching(&saved, &target, &["a".to_string()])?;
        assert_eq!(value(&restored["a.weight"]), 1.0);
        assert_eq!(value(&restored["b.weight"]), 0.0);
        // inputs are left alone
        assert_eq!(value(&target["a.weight"]), 0.0);
        Ok(())
    }

    #[test]
    fn test_restore_matching_all_layers() -> Result<()> {
        let saved = state(&[("a.weight", 2, 1.0), ("b.weight", 2, 2.0)]);
        let target = state(&[("a.weight", 2, 0.0), ("b.weight", 2, 0.0)]);
        let restored = restore_matching(&saved, &target, &[])?;
        assert_eq!(value(&restored["a.weight"]), 1.0);
        assert_eq!(value(&restored["b.weight"]), 2.0);
        Ok(())
    }

    #[test]
    fn test_select_matching_unknown_layer_is_noop() -> Result<()> {
        let saved = state(&[("a.weight", 2, 1.0)]);
        let target = state(&[("a.weight", 2, 0.0)]);
        let selected = select_matching(&saved, &target, &["missing".to_string()])?;
        assert!(selected.is_empty());
        Ok(())
    }

    #[test]
    fn test_select_matching_shape_mismatch() {
        let saved = state(&[("a.weight", 3, 1.0)]);
        let target = state(&[("a.weight", 2, 0.0)]);
        let err = select_matching(&saved, &target, &[]).unwrap_err();
        match err {
            CaptionerError::StateDictMismatch(diff) => {
                assert_eq!(
                    diff.shape_mismatches,
                    vec![("a.weight".to_string(), vec![2], vec![3])]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_select_matching_missing_and_unexpected() {
        let saved = state(&[("a.bias", 2, 1.0)]);
        let target = state(&[("a.weight", 2, 0.0), ("b.weight", 2, 0.0)]);
        let err = select_matching(&saved, &target, &["a".to_string()]).unwrap_err();
        match err {
            CaptionerError::StateDictMismatch(diff) => {
                assert_eq!(diff.missing_keys, vec!["a.weight".to_string()]);
                assert_eq!(diff.unexpected_keys, vec!["a.bias".to_string()]);
                assert!(diff.to_string().contains("missing keys"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_parameterized_load_state_dict() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = linear(2, 3, vb.pp("proj"))?;
        let model = Parameterized::new(layer, varmap);

        let update = state(&[("proj.bias", 3, 5.0)]);
        model.load_state_dict(&update)?;
        assert_eq!(model.bias().map(value), Some(5.0));
        assert_eq!(value(&model.state_dict()?["proj.bias"]), 5.0);
        assert_eq!(model.layer_vars(&["proj".to_string()])?.len(), 2);

        let bad = state(&[("proj.bias", 4, 5.0)]);
        assert!(matches!(
            model.load_state_dict(&bad),
            Err(CaptionerError::StateDictMismatch(_))
        ));
        Ok(())
    }
}
