use crate::autograd::Variable;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use std::hash::{DefaultHasher, Hash, Hasher};

/// An ordered collection of named, trainable rank-2 tensors.
///
/// Order is significant: gradients, optimizer state and checkpoints all
/// refer to parameters by position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet<T: TensorElem> {
    names: Vec<String>,
    tensors: Vec<Tensor<T, 2>>,
}

impl<T: TensorElem> Default for ParameterSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TensorElem> ParameterSet<T> {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            tensors: Vec::new(),
        }
    }

    /// Appends a parameter. Names must be unique.
    pub fn push(&mut self, name: impl Into<String>, tensor: Tensor<T, 2>) -> Result<()> {
        let name = name.into();
        if self.names.contains(&name) {
            return Err(TensorError::Unsupported(format!(
                "duplicate parameter name `{name}`"
            )));
        }
        self.names.push(name);
        self.tensors.push(tensor);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn tensors(&self) -> &[Tensor<T, 2>] {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut [Tensor<T, 2>] {
        &mut self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<T, 2>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.tensors[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<T, 2>)> {
        self.names.iter().map(String::as_str).zip(self.tensors.iter())
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::size).sum()
    }

    /// Wraps every parameter in a fresh autograd leaf.
    pub fn to_variables(&self) -> Vec<Variable<T, 2>>
    where
        T: 'static,
    {
        self.tensors.iter().cloned().map(Variable::new).collect()
    }

    /// Overwrites all values with `other`'s, which must have the same layout.
    pub fn copy_from(&mut self, other: &Self) -> Result<()> {
        if self.fingerprint() != other.fingerprint() {
            return Err(TensorError::ShapeMismatch {
                expected: self.layout(),
                got: other.layout(),
            });
        }
        self.tensors.clone_from(&other.tensors);
        Ok(())
    }

    /// Hash of names, ordering and shapes. Values do not participate.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (name, tensor) in self.iter() {
            name.hash(&mut hasher);
            tensor.shape().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn layout(&self) -> Vec<usize> {
        self.tensors.iter().flat_map(|t| *t.shape()).collect()
    }
}
