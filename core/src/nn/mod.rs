//! Layers and parameter containers.
//!
//! Models here are stateless descriptions of an architecture. The trainable
//! values live in a [`ParameterSet`], which each replica owns a private copy
//! of; a forward pass receives those values as autograd leaves.

pub mod linear;
pub mod mlp;
pub mod model;
pub mod parameter;

pub use linear::Linear;
pub use mlp::Mlp;
pub use model::Model;
pub use parameter::ParameterSet;
