//! Automatic Differentiation (Autograd) module.
//!
//! Reverse-mode AD over a define-by-run tape. Every operation on a
//! [`Variable`] records a [`GraphNode`] that knows how to push the output
//! gradient back to its inputs; [`Variable::backward`] walks those nodes in
//! reverse topological order.
//!
//! Graphs are built from `Rc` links, so a graph never leaves the thread that
//! built it. Each replica builds its own graph for its own sub-batch and only
//! the resulting gradient tensors (plain `Send` data) cross thread boundaries.
//!
//! ```rust
//! use mirrored_rs::autograd::Variable;
//! use mirrored_rs::tensor::Tensor;
//!
//! // f(x) = sum(x * x), df/dx = 2x
//! let x = Variable::new(Tensor::<f32, 2>::new(vec![3.0, -1.0], [1, 2]).unwrap());
//! let y = x.mul(&x).unwrap().sum_all().unwrap();
//! y.backward().unwrap();
//!
//! assert_eq!(x.grad().unwrap().data(), &[6.0, -2.0]);
//! ```

use crate::tensor::{Result, Tensor, TensorElem};
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

pub mod engine;
pub mod ops;

/// Shared, lazily initialised gradient slot.
pub type GradCell<T, const RANK: usize> = Rc<RefCell<Option<Tensor<T, RANK>>>>;

/// A node in the computation graph.
///
/// This trait represents an operation that can be backpropagated through.
pub trait GraphNode: Debug {
    /// Computes the gradient for this node and propagates it to its inputs.
    fn backward(&self) -> Result<()>;
    /// Returns the nodes that produced this node's inputs.
    fn parents(&self) -> Vec<Rc<dyn GraphNode>>;
}

/// A variable in the computation graph.
///
/// Wraps a `Tensor` and tracks its gradient and the operation that created it.
#[derive(Clone, Debug)]
pub struct Variable<T, const RANK: usize>
where
    T: TensorElem,
{
    /// The actual tensor data.
    pub data: Tensor<T, RANK>,
    /// The gradient of the loss with respect to this variable.
    pub grad: GradCell<T, RANK>,
    /// The node in the computation graph that produced this variable.
    pub node: Option<Rc<dyn GraphNode>>,
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Creates a new leaf variable.
    ///
    /// Leaf variables are the inputs to the computation graph (parameters,
    /// features, constant masks). They do not have a parent node.
    pub fn new(data: Tensor<T, RANK>) -> Self {
        Self {
            data,
            grad: Rc::new(RefCell::new(None)),
            node: None,
        }
    }

    /// Creates a new variable with an associated graph node.
    ///
    /// The node must hold `grad` as its output gradient cell.
    pub fn with_node(data: Tensor<T, RANK>, grad: GradCell<T, RANK>, node: Rc<dyn GraphNode>) -> Self {
        Self {
            data,
            grad,
            node: Some(node),
        }
    }

    /// Returns a copy of the accumulated gradient, if any flowed here.
    pub fn grad(&self) -> Option<Tensor<T, RANK>> {
        self.grad.borrow().clone()
    }

    /// Triggers the backward pass starting from this variable.
    ///
    /// The gradient of this variable is seeded with ones.
    pub fn backward(&self) -> Result<()> {
        if self.grad.borrow().is_none() {
            *self.grad.borrow_mut() = Some(Tensor::ones(*self.data.shape()));
        }

        engine::backward(self.node.clone())
    }

    pub(crate) fn parent_nodes(inputs: &[&Option<Rc<dyn GraphNode>>]) -> Vec<Rc<dyn GraphNode>> {
        inputs.iter().filter_map(|n| (*n).clone()).collect()
    }
}

/// Adds `delta` into a gradient cell, initialising it on first use.
pub(crate) fn accumulate<T, const RANK: usize>(
    cell: &GradCell<T, RANK>,
    delta: Tensor<T, RANK>,
) -> Result<()>
where
    T: TensorElem,
{
    let mut slot = cell.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.add_assign(&delta),
        None => {
            *slot = Some(delta);
            Ok(())
        }
    }
}

/// Computes `d loss / d param` for every entry of `params`.
///
/// Parameters the loss does not depend on receive a zero gradient, so the
/// returned list always lines up index-for-index with `params`.
pub fn grad<T>(loss: &Variable<T, 0>, params: &[Variable<T, 2>]) -> Result<Vec<Tensor<T, 2>>>
where
    T: TensorElem + 'static,
{
    loss.backward()?;
    Ok(params
        .iter()
        .map(|p| p.grad().unwrap_or_else(|| p.data.zeros_like()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_creation() {
        let data = Tensor::new(vec![1.0, 2.0], [2]).unwrap();
        let var = Variable::new(data.clone());

        assert_eq!(var.data.data(), data.data());
        assert!(var.grad().is_none());
        assert!(var.node.is_none());
    }

    #[test]
    fn test_variable_backward_seed() {
        let var = Variable::new(Tensor::new(vec![1.0], []).unwrap());

        // Backward on a leaf just seeds the gradient
        var.backward().unwrap();
        assert_eq!(var.grad().unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_accumulate() {
        let cell: GradCell<f32, 1> = Rc::new(RefCell::new(None));
        accumulate(&cell, Tensor::new(vec![1.0, 2.0], [2]).unwrap()).unwrap();
        accumulate(&cell, Tensor::new(vec![0.5, 0.5], [2]).unwrap()).unwrap();
        assert_eq!(cell.borrow().as_ref().unwrap().data(), &[1.5, 2.5]);
    }

    #[test]
    fn test_grad_unused_param_is_zero() {
        let w = Variable::new(Tensor::<f64, 2>::new(vec![2.0], [1, 1]).unwrap());
        let unused = Variable::new(Tensor::<f64, 2>::new(vec![5.0, 5.0], [1, 2]).unwrap());

        let loss = w.mul(&w).unwrap().sum_all().unwrap();
        let grads = grad(&loss, &[w, unused]).unwrap();

        assert_eq!(grads[0].data(), &[4.0]);
        assert_eq!(grads[1].data(), &[0.0, 0.0]);
    }
}
