//! Named parameter storage and weight-decay grouping.
//!
//! Parameters are kept as 2-D `f32` matrices (vectors are stored as `1 x n`)
//! and addressed by a stable [`ParamId`] assigned at registration. Optimizer
//! state is indexed by the same id.
//!
//! Weight decay is split into two groups: parameters whose name matches one
//! of the no-decay patterns (biases and normalisation weights) never decay.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sftpack_core::{Result, SftPackError};

/// Name fragments of parameters excluded from weight decay.
pub const NO_DECAY_PATTERNS: &[&str] = &["bias", "layer_norm.weight", "norm.weight"];

/// Stable index of a registered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub usize);

impl ParamId {
    /// Position of the parameter in its set.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered, named collection of parameter matrices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    names: Vec<String>,
    tensors: Vec<Array2<f32>>,
}

impl ParameterSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::InvalidArgument`] for a duplicate name or an
    /// empty matrix.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Array2<f32>) -> Result<ParamId> {
        let name = name.into();
        if self.id_of(&name).is_some() {
            return Err(SftPackError::InvalidArgument(format!(
                "duplicate parameter name '{name}'"
            )));
        }
        if tensor.is_empty() {
            return Err(SftPackError::InvalidArgument(format!(
                "parameter '{name}' has no elements"
            )));
        }
        self.names.push(name);
        self.tensors.push(tensor);
        Ok(ParamId(self.tensors.len() - 1))
    }

    /// Builder-style [`Self::insert`].
    pub fn with(mut self, name: impl Into<String>, tensor: Array2<f32>) -> Result<Self> {
        self.insert(name, tensor)?;
        Ok(self)
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether no parameter is registered.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar elements.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.len()).sum()
    }

    /// Look up a parameter id by name.
    pub fn id_of(&self, name: &str) -> Option<ParamId> {
        self.names.iter().position(|n| n == name).map(ParamId)
    }

    /// Name of a parameter.
    pub fn name(&self, id: ParamId) -> Option<&str> {
        self.names.get(id.0).map(String::as_str)
    }

    /// Parameter matrix by id.
    pub fn get(&self, id: ParamId) -> Option<&Array2<f32>> {
        self.tensors.get(id.0)
    }

    /// Mutable parameter matrix by id.
    pub fn get_mut(&mut self, id: ParamId) -> Option<&mut Array2<f32>> {
        self.tensors.get_mut(id.0)
    }

    /// All parameter matrices in id order.
    pub fn tensors(&self) -> &[Array2<f32>] {
        &self.tensors
    }

    /// Mutable parameter matrices in id order.
    pub fn tensors_mut(&mut self) -> &mut [Array2<f32>] {
        &mut self.tensors
    }

    /// `(id, name, tensor)` triples in id order.
    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &str, &Array2<f32>)> {
        self.names
            .iter()
            .zip(&self.tensors)
            .enumerate()
            .map(|(i, (name, tensor))| (ParamId(i), name.as_str(), tensor))
    }

    /// Shapes in id order.
    pub fn shapes(&self) -> Vec<(usize, usize)> {
        self.tensors.iter().map(|t| t.dim()).collect()
    }

    /// Zero matrices shaped like every parameter.
    pub fn zeros_like(&self) -> Vec<Array2<f32>> {
        self.tensors.iter().map(|t| Array2::zeros(t.dim())).collect()
    }

    /// Replace all values with those of `other`, which must have the same
    /// names and shapes.
    ///
    /// # Errors
    ///
    /// Returns [`SftPackError::ShapeMismatch`] or
    /// [`SftPackError::InvalidArgument`] when the layouts differ.
    pub fn load_from(&mut self, other: &ParameterSet) -> Result<()> {
        if self.names != other.names {
            return Err(SftPackError::InvalidArgument(format!(
                "parameter names differ: expected {:?}, got {:?}",
                self.names, other.names
            )));
        }
        for (dst, src) in self.tensors.iter_mut().zip(&other.tensors) {
            if dst.dim() != src.dim() {
                return Err(SftPackError::ShapeMismatch {
                    expected: dst.shape().to_vec(),
                    actual: src.shape().to_vec(),
                });
            }
            dst.assign(src);
        }
        Ok(())
    }
}

/// A group of parameters with shared weight decay.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    /// Parameters in this group.
    pub param_ids: Vec<ParamId>,
    /// Weight decay for this group.
    pub weight_decay: f64,
    /// Description of this group (for logging).
    pub description: String,
}

impl ParameterGroup {
    /// Create an empty group.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            param_ids: Vec::new(),
            weight_decay: 0.0,
            description: description.into(),
        }
    }

    /// Set the weight decay.
    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Check if this group contains a parameter.
    pub fn contains(&self, id: ParamId) -> bool {
        self.param_ids.contains(&id)
    }

    /// Number of parameters in this group.
    pub fn len(&self) -> usize {
        self.param_ids.len()
    }

    /// Check if group is empty.
    pub fn is_empty(&self) -> bool {
        self.param_ids.is_empty()
    }
}

/// Splits parameters into decayed and non-decayed groups by name.
#[derive(Debug, Clone)]
pub struct ParameterGroupBuilder {
    no_decay_patterns: Vec<String>,
    decay: ParameterGroup,
    no_decay: ParameterGroup,
}

impl ParameterGroupBuilder {
    /// Builder with the default no-decay patterns.
    pub fn new(weight_decay: f64) -> Self {
        Self {
            no_decay_patterns: NO_DECAY_PATTERNS.iter().map(|p| (*p).to_string()).collect(),
            decay: ParameterGroup::new("decay").with_weight_decay(weight_decay),
            no_decay: ParameterGroup::new("no_decay"),
        }
    }

    /// Add a no-decay pattern.
    pub fn add_no_decay_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.no_decay_patterns.push(pattern.into());
        self
    }

    /// Whether `name` is excluded from weight decay.
    pub fn is_no_decay(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.no_decay_patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// Classify one parameter.
    pub fn add_parameter(&mut self, id: ParamId, name: &str) {
        if self.is_no_decay(name) {
            self.no_decay.param_ids.push(id);
        } else {
            self.decay.param_ids.push(id);
        }
    }

    /// Classify every parameter of a set.
    pub fn add_parameters(&mut self, params: &ParameterSet) {
        for (id, name, _) in params.iter() {
            self.add_parameter(id, name);
        }
    }

    /// Human-readable grouping summary.
    pub fn summary(&self) -> String {
        format!(
            "Parameter groups:\n  - {} decayed params (wd={:.2e})\n  - {} no-decay params",
            self.decay.len(),
            self.decay.weight_decay,
            self.no_decay.len(),
        )
    }

    /// Build the non-empty groups.
    pub fn build(self) -> Vec<ParameterGroup> {
        [self.decay, self.no_decay]
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect()
    }
}

/// Group the parameters of `params` with the default no-decay patterns.
pub fn create_parameter_groups(params: &ParameterSet, weight_decay: f64) -> Vec<ParameterGroup> {
    let mut builder = ParameterGroupBuilder::new(weight_decay);
    builder.add_parameters(params);
    builder.build()
}

/// Weight decay per parameter id, for `len` parameters.
pub fn weight_decay_by_id(groups: &[ParameterGroup], len: usize) -> Vec<f64> {
    let mut decay = vec![0.0; len];
    for group in groups {
        for id in &group.param_ids {
            if let Some(slot) = decay.get_mut(id.0) {
                *slot = group.weight_decay;
            }
        }
    }
    decay
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_params() -> ParameterSet {
        ParameterSet::new()
            .with("embed.weight", Array2::zeros((8, 4)))
            .unwrap()
            .with("layers.0.attn.q_proj.weight", Array2::zeros((4, 4)))
            .unwrap()
            .with("layers.0.attn.q_proj.bias", Array2::zeros((1, 4)))
            .unwrap()
            .with("layers.0.input_layer_norm.weight", Array2::zeros((1, 4)))
            .unwrap()
            .with("final_norm.weight", Array2::zeros((1, 4)))
            .unwrap()
    }

    #[test]
    fn test_no_decay_grouping() {
        let params = model_params();
        let groups = create_parameter_groups(&params, 0.1);
        assert_eq!(groups.len(), 2);

        let decay = groups.iter().find(|g| g.description == "decay").unwrap();
        assert_eq!(decay.param_ids, vec![ParamId(0), ParamId(1)]);
        assert!((decay.weight_decay - 0.1).abs() < 1e-12);

        let no_decay = groups.iter().find(|g| g.description == "no_decay").unwrap();
        assert_eq!(no_decay.len(), 3);
        assert_eq!(no_decay.weight_decay, 0.0);

        let by_id = weight_decay_by_id(&groups, params.len());
        assert_eq!(by_id, vec![0.1, 0.1, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_custom_pattern() {
        let mut builder = ParameterGroupBuilder::new(0.01).add_no_decay_pattern("embed");
        builder.add_parameters(&model_params());
        let groups = builder.build();
        let decay = groups.iter().find(|g| g.description == "decay").unwrap();
        assert_eq!(decay.param_ids, vec![ParamId(1)]);
    }

    #[test]
    fn test_duplicate_and_empty_rejected() {
        let mut params = model_params();
        assert!(params.insert("embed.weight", Array2::zeros((1, 1))).is_err());
        assert!(params.insert("empty", Array2::zeros((0, 3))).is_err());
        assert_eq!(params.len(), 5);
        assert_eq!(params.num_elements(), 32 + 16 + 12);
    }

    #[test]
    fn test_load_from_checks_layout() {
        let mut params = model_params();
        let mut other = model_params();
        other.tensors_mut()[1].fill(2.0);
        params.load_from(&other).unwrap();
        assert_eq!(params.tensors()[1][[3, 3]], 2.0);

        let wrong = ParameterSet::new().with("embed.weight", Array2::zeros((8, 4))).unwrap();
        assert!(params.load_from(&wrong).is_err());
    }
}
