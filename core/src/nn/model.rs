use crate::autograd::Variable;
use crate::tensor::{Result, TensorElem};
use std::fmt::Debug;

/// A differentiable function of its parameters.
///
/// `Send + Sync` lets every replica thread share one model description while
/// each owns its own parameter values.
pub trait Model<T: TensorElem>: Debug + Send + Sync {
    /// Names of the parameters `forward` expects, in order.
    fn parameter_names(&self) -> Vec<String>;

    /// Builds the forward graph for `inputs` (`[batch, features]`).
    ///
    /// `params` must line up with [`Model::parameter_names`].
    fn forward(&self, params: &[Variable<T, 2>], inputs: &Variable<T, 2>) -> Result<Variable<T, 2>>;
}
