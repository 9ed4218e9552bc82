//! Operations for the autograd system.
//!
//! Each operation computes its forward value eagerly and records a node whose
//! `backward` distributes the output gradient to the operand gradient cells.

use super::{GradCell, GraphNode, Variable, accumulate};
use crate::tensor::{Result, Tensor, TensorElem};
use num_traits::Float;
use std::cell::RefCell;
use std::fmt::Debug;
use std::rc::Rc;

fn new_cell<T: TensorElem, const RANK: usize>() -> GradCell<T, RANK> {
    Rc::new(RefCell::new(None))
}

fn take_grad<T: TensorElem, const RANK: usize>(cell: &GradCell<T, RANK>) -> Option<Tensor<T, RANK>> {
    cell.borrow().clone()
}

// --- Add Node ---
#[derive(Debug)]
struct AddNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for AddNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        // d(x+y)/dx = d(x+y)/dy = 1
        accumulate(&self.lhs_grad, grad.clone())?;
        accumulate(&self.rhs_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Sub Node ---
#[derive(Debug)]
struct SubNode<T: TensorElem, const RANK: usize> {
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for SubNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        let neg = grad.map(|g| T::zero() - g);
        accumulate(&self.lhs_grad, grad)?;
        accumulate(&self.rhs_grad, neg)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Mul Node ---
#[derive(Debug)]
struct MulNode<T: TensorElem, const RANK: usize> {
    lhs_data: Tensor<T, RANK>,
    rhs_data: Tensor<T, RANK>,
    lhs_grad: GradCell<T, RANK>,
    rhs_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for MulNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        // d(x*y)/dx = y, d(x*y)/dy = x
        accumulate(&self.lhs_grad, (&grad * &self.rhs_data)?)?;
        accumulate(&self.rhs_grad, (&grad * &self.lhs_data)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- Scale Node ---
#[derive(Debug)]
struct ScaleNode<T: TensorElem, const RANK: usize> {
    factor: T,
    input_grad: GradCell<T, RANK>,
    out_grad: GradCell<T, RANK>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem, const RANK: usize> GraphNode for ScaleNode<T, RANK> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        accumulate(&self.input_grad, grad.scale(self.factor))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T, const RANK: usize> Variable<T, RANK>
where
    T: TensorElem + 'static,
{
    /// Element-wise addition.
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        let data = (&self.data + &rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(AddNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Element-wise subtraction.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        let data = (&self.data - &rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(SubNode {
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Element-wise multiplication.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        let data = (&self.data * &rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(MulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Multiplication by a constant.
    pub fn scale(&self, factor: T) -> Self {
        let data = self.data.scale(factor);
        let out_grad = new_cell();
        let node = Rc::new(ScaleNode {
            factor,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node]),
        });
        Variable::with_node(data, out_grad, node)
    }
}

// --- MatMul Node ---
#[derive(Debug)]
struct MatMulNode<T: TensorElem> {
    lhs_data: Tensor<T, 2>,
    rhs_data: Tensor<T, 2>,
    lhs_grad: GradCell<T, 2>,
    rhs_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for MatMulNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        // C = A B  =>  dA = dC B^T, dB = A^T dC
        accumulate(&self.lhs_grad, grad.matmul(&self.rhs_data.transpose()?)?)?;
        accumulate(&self.rhs_grad, self.lhs_data.transpose()?.matmul(&grad)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- AddRow Node ---
#[derive(Debug)]
struct AddRowNode<T: TensorElem> {
    input_grad: GradCell<T, 2>,
    row_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for AddRowNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        accumulate(&self.row_grad, grad.sum_cols()?)?;
        accumulate(&self.input_grad, grad)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- ReLU Node ---
#[derive(Debug)]
struct ReluNode<T: TensorElem> {
    input_data: Tensor<T, 2>,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for ReluNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        let mask = self
            .input_data
            .map(|x| if x > T::zero() { T::one() } else { T::zero() });
        accumulate(&self.input_grad, (&grad * &mask)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- SumRows Node ---
#[derive(Debug)]
struct SumRowsNode<T: TensorElem> {
    cols: usize,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SumRowsNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        accumulate(&self.input_grad, grad.broadcast_cols(self.cols)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- SumAll Node ---
#[derive(Debug)]
struct SumAllNode<T: TensorElem> {
    shape: [usize; 2],
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 0>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for SumAllNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        accumulate(&self.input_grad, Tensor::full(self.shape, grad.data()[0]))
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

// --- LogSoftmax Node ---
#[derive(Debug)]
struct LogSoftmaxNode<T: TensorElem> {
    softmax: Tensor<T, 2>,
    input_grad: GradCell<T, 2>,
    out_grad: GradCell<T, 2>,
    parents: Vec<Rc<dyn GraphNode>>,
}

impl<T: TensorElem> GraphNode for LogSoftmaxNode<T> {
    fn backward(&self) -> Result<()> {
        let Some(grad) = take_grad(&self.out_grad) else {
            return Ok(());
        };
        // dx = g - softmax * sum_j(g_j)
        let totals = grad.sum_rows()?.broadcast_cols(self.softmax.cols())?;
        let correction = (&self.softmax * &totals)?;
        accumulate(&self.input_grad, (&grad - &correction)?)
    }

    fn parents(&self) -> Vec<Rc<dyn GraphNode>> {
        self.parents.clone()
    }
}

impl<T> Variable<T, 2>
where
    T: TensorElem + 'static,
{
    /// Matrix multiplication `[m, k] x [k, n] -> [m, n]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        let data = self.data.matmul(&rhs.data)?;
        let out_grad = new_cell();
        let node = Rc::new(MatMulNode {
            lhs_data: self.data.clone(),
            rhs_data: rhs.data.clone(),
            lhs_grad: self.grad.clone(),
            rhs_grad: rhs.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node, &rhs.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Adds a `[1, n]` row (typically a bias) to every row.
    pub fn add_row(&self, row: &Self) -> Result<Self> {
        let data = self.data.add_row(&row.data)?;
        let out_grad = new_cell();
        let node = Rc::new(AddRowNode {
            input_grad: self.grad.clone(),
            row_grad: row.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node, &row.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Rectified linear unit.
    pub fn relu(&self) -> Self {
        let data = self
            .data
            .map(|x| if x > T::zero() { x } else { T::zero() });
        let out_grad = new_cell();
        let node = Rc::new(ReluNode {
            input_data: self.data.clone(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node]),
        });
        Variable::with_node(data, out_grad, node)
    }

    /// `[m, n] -> [m, 1]`.
    pub fn sum_rows(&self) -> Result<Self> {
        let data = self.data.sum_rows()?;
        let out_grad = new_cell();
        let node = Rc::new(SumRowsNode {
            cols: self.data.cols(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }

    /// Sums every element into a scalar.
    pub fn sum_all(&self) -> Result<Variable<T, 0>> {
        let data = Tensor::new(vec![self.data.sum()], [])?;
        let out_grad = new_cell();
        let node = Rc::new(SumAllNode {
            shape: *self.data.shape(),
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node]),
        });
        Ok(Variable::with_node(data, out_grad, node))
    }
}

impl<T> Variable<T, 2>
where
    T: TensorElem + Float + 'static,
{
    /// Row-wise log-softmax, stabilised by subtracting each row's maximum.
    pub fn log_softmax(&self) -> Result<Self> {
        let [rows, cols] = *self.data.shape();
        let mut out = Vec::with_capacity(rows * cols);
        let mut softmax = Vec::with_capacity(rows * cols);

        if cols > 0 {
            for row in self.data.data().chunks(cols) {
                let max = row.iter().copied().fold(T::neg_infinity(), T::max);
                let total = row.iter().fold(T::zero(), |acc, &x| acc + (x - max).exp());
                let log_total = total.ln();
                for &x in row {
                    let shifted = x - max - log_total;
                    out.push(shifted);
                    softmax.push(shifted.exp());
                }
            }
        }

        let out_grad = new_cell();
        let node = Rc::new(LogSoftmaxNode {
            softmax: Tensor::new(softmax, [rows, cols])?,
            input_grad: self.grad.clone(),
            out_grad: out_grad.clone(),
            parents: Self::parent_nodes(&[&self.node]),
        });
        Ok(Variable::with_node(Tensor::new(out, [rows, cols])?, out_grad, node))
    }
}
