//! Compute graph: declarative tensor and scalar definitions
//!
//! Nodes live in an arena and are addressed by `NodeId`. Identity, not
//! structural equality, is what lowering keys buffers on: two identical grid
//! definitions added twice are two distinct values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::ir::{Expr, Type, UnaryOp, Var};
use crate::reduce::ReduceOp;

/// Handle of a node inside a `ComputeGraph`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// What kind of value a node produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Tensor { dtype: ScalarType, shape: Vec<usize> },
    Scalar { dtype: ScalarType },
}

impl NodeKind {
    pub fn dtype(&self) -> ScalarType {
        match self {
            NodeKind::Tensor { dtype, .. } | NodeKind::Scalar { dtype } => *dtype,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Tensor { .. } => "tensor",
            NodeKind::Scalar { .. } => "scalar",
        }
    }

    /// Storage type for a buffer holding this node
    pub fn storage_type(&self) -> Type {
        match self {
            NodeKind::Tensor { dtype, shape } => Type::tensor(*dtype, shape),
            NodeKind::Scalar { dtype } => Type::Scalar(*dtype),
        }
    }
}

/// Elementwise tensor definition: `out[axes] = value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCompute {
    pub shape: Vec<usize>,
    pub axes: Vec<Var>,
    pub value: Expr,
}

/// Reduction of `value` over every point of `shape`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceCompute {
    pub shape: Vec<usize>,
    pub axes: Vec<Var>,
    pub value: Expr,
    pub op: ReduceOp,
}

/// Index of the best `value` over `0..extent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgReduceCompute {
    pub extent: usize,
    pub axis: Var,
    pub value: Expr,
    pub op: ReduceOp,
    pub index_dtype: ScalarType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Compute {
    Grid(GridCompute),
    Reduce(ReduceCompute),
    ArgReduce(ArgReduceCompute),
}

impl Compute {
    pub fn pattern_name(&self) -> &'static str {
        match self {
            Compute::Grid(_) => "grid",
            Compute::Reduce(_) => "reduce",
            Compute::ArgReduce(_) => "arg-reduce",
        }
    }
}

/// A node; `compute == None` marks an input whose storage is external
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeNode {
    pub name: String,
    pub kind: NodeKind,
    pub compute: Option<Compute>,
}

impl ComputeNode {
    pub fn is_input(&self) -> bool {
        self.compute.is_none()
    }
}

/// Arena of compute nodes plus the variable id counter shared by all axes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeGraph {
    nodes: Vec<ComputeNode>,
    next_var: u32,
}

impl ComputeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> LowerResult<&ComputeNode> {
        self.nodes
            .get(id.0 as usize)
            .ok_or_else(|| LowerError::invalid_ir(format!("unknown node {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ComputeNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }

    /// Smallest variable id not yet handed out
    pub fn var_watermark(&self) -> u32 {
        self.next_var
    }

    pub fn fresh_var(&mut self, hint: impl Into<String>, ty: Type) -> Var {
        let var = Var::new(self.next_var, hint, ty);
        self.next_var += 1;
        var
    }

    /// A fresh `i32` loop axis
    pub fn new_axis(&mut self, hint: impl Into<String>) -> Var {
        self.fresh_var(hint, Type::Scalar(ScalarType::I32))
    }

    /// Insert a node as-is, without checking the kind/compute pairing
    pub fn add_node(&mut self, node: ComputeNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn tensor_input(&mut self, name: impl Into<String>, dtype: ScalarType, shape: &[usize]) -> NodeId {
        self.add_node(ComputeNode {
            name: name.into(),
            kind: NodeKind::Tensor {
                dtype,
                shape: shape.to_vec(),
            },
            compute: None,
        })
    }

    pub fn scalar_input(&mut self, name: impl Into<String>, dtype: ScalarType) -> NodeId {
        self.add_node(ComputeNode {
            name: name.into(),
            kind: NodeKind::Scalar { dtype },
            compute: None,
        })
    }

    /// Add a grid compute over `axes`; the element type is inferred from `value`
    pub fn add_grid(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        axes: Vec<Var>,
        value: Expr,
    ) -> LowerResult<NodeId> {
        check_axes(shape, &axes)?;
        let dtype = self.infer_type(&value)?;
        Ok(self.add_node(ComputeNode {
            name: name.into(),
            kind: NodeKind::Tensor {
                dtype,
                shape: shape.to_vec(),
            },
            compute: Some(Compute::Grid(GridCompute {
                shape: shape.to_vec(),
                axes,
                value,
            })),
        }))
    }

    pub fn add_reduce(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        axes: Vec<Var>,
        value: Expr,
        op: ReduceOp,
    ) -> LowerResult<NodeId> {
        if op.is_arg() {
            return Err(LowerError::invalid_param(format!(
                "`{}` is an arg-reduction; use add_arg_reduce",
                op
            )));
        }
        check_axes(shape, &axes)?;
        let dtype = self.infer_type(&value)?;
        Ok(self.add_node(ComputeNode {
            name: name.into(),
            kind: NodeKind::Scalar { dtype },
            compute: Some(Compute::Reduce(ReduceCompute {
                shape: shape.to_vec(),
                axes,
                value,
                op,
            })),
        }))
    }

    pub fn add_arg_reduce(
        &mut self,
        name: impl Into<String>,
        extent: usize,
        axis: Var,
        value: Expr,
        op: ReduceOp,
        index_dtype: ScalarType,
    ) -> LowerResult<NodeId> {
        if !op.is_arg() {
            return Err(LowerError::invalid_param(format!(
                "`{}` is not an arg-reduction",
                op
            )));
        }
        if !index_dtype.is_integer() {
            return Err(LowerError::invalid_param(format!(
                "arg-reduce index type must be an integer, got {}",
                index_dtype
            )));
        }
        // type-check the value even though the node reports the index type
        self.infer_type(&value)?;
        Ok(self.add_node(ComputeNode {
            name: name.into(),
            kind: NodeKind::Scalar { dtype: index_dtype },
            compute: Some(Compute::ArgReduce(ArgReduceCompute {
                extent,
                axis,
                value,
                op,
                index_dtype,
            })),
        }))
    }

    /// Grid compute with axes named `hints`, value built by `f`
    pub fn grid<F>(&mut self, name: &str, shape: &[usize], hints: &[&str], f: F) -> LowerResult<NodeId>
    where
        F: FnOnce(&mut Self, &[Var]) -> LowerResult<Expr>,
    {
        let axes: Vec<Var> = hints.iter().map(|h| self.new_axis(*h)).collect();
        let value = f(self, &axes)?;
        self.add_grid(name, shape, axes, value)
    }

    /// Reduce compute with axes named `hints`, value built by `f`
    pub fn reduce<F>(
        &mut self,
        name: &str,
        shape: &[usize],
        hints: &[&str],
        op: ReduceOp,
        f: F,
    ) -> LowerResult<NodeId>
    where
        F: FnOnce(&mut Self, &[Var]) -> LowerResult<Expr>,
    {
        let axes: Vec<Var> = hints.iter().map(|h| self.new_axis(*h)).collect();
        let value = f(self, &axes)?;
        self.add_reduce(name, shape, axes, value, op)
    }

    /// Arg-reduce compute over one axis named `hint`
    pub fn arg_reduce<F>(
        &mut self,
        name: &str,
        extent: usize,
        hint: &str,
        op: ReduceOp,
        index_dtype: ScalarType,
        f: F,
    ) -> LowerResult<NodeId>
    where
        F: FnOnce(&mut Self, &Var) -> LowerResult<Expr>,
    {
        let axis = self.new_axis(hint);
        let value = f(self, &axis)?;
        self.add_arg_reduce(name, extent, axis, value, op, index_dtype)
    }

    /// Scalar type of an expression
    pub fn infer_type(&self, expr: &Expr) -> LowerResult<ScalarType> {
        match expr {
            Expr::Var(var) => var.ty.as_scalar().ok_or_else(|| {
                LowerError::invalid_ir(format!("variable `{}` of type {} used as a scalar", var, var.ty))
            }),
            Expr::Const(c) => Ok(c.dtype),
            Expr::Node(id) => {
                let node = self.node(*id)?;
                match &node.kind {
                    NodeKind::Scalar { dtype } => Ok(*dtype),
                    NodeKind::Tensor { .. } => Err(LowerError::invalid_ir(format!(
                        "tensor `{}` used as a scalar; index it",
                        node.name
                    ))),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lt = self.infer_type(lhs)?;
                let rt = self.infer_type(rhs)?;
                if op.is_predicate() {
                    Ok(ScalarType::Bool)
                } else {
                    Ok(lt.promote(rt))
                }
            }
            Expr::Unary { op, operand } => {
                let t = self.infer_type(operand)?;
                match op {
                    UnaryOp::Neg => Ok(t),
                    UnaryOp::Not => Ok(ScalarType::Bool),
                }
            }
            Expr::Cast { to, .. } => to
                .as_scalar()
                .ok_or_else(|| LowerError::invalid_ir(format!("cast to non-scalar type {}", to))),
            Expr::TensorElement { base, indices } => self.element_type(base, indices.len()),
            Expr::Call { func, .. } => Err(LowerError::invalid_ir(format!(
                "cannot infer the type of a call to `{}`",
                func
            ))),
        }
    }

    fn element_type(&self, base: &Expr, rank: usize) -> LowerResult<ScalarType> {
        match base {
            Expr::Node(id) => {
                let node = self.node(*id)?;
                match &node.kind {
                    NodeKind::Tensor { dtype, shape } => {
                        if shape.len() != rank {
                            return Err(LowerError::invalid_ir(format!(
                                "{}-d tensor `{}` indexed with {} indices",
                                shape.len(),
                                node.name,
                                rank
                            )));
                        }
                        Ok(*dtype)
                    }
                    NodeKind::Scalar { .. } => Err(LowerError::invalid_ir(format!(
                        "scalar `{}` cannot be indexed",
                        node.name
                    ))),
                }
            }
            Expr::Var(var) => var.ty.element_type().ok_or_else(|| {
                LowerError::invalid_ir(format!("variable `{}` of type {} cannot be indexed", var, var.ty))
            }),
            other => Err(LowerError::invalid_ir(format!("cannot index expression {}", other))),
        }
    }
}

fn check_axes(shape: &[usize], axes: &[Var]) -> LowerResult<()> {
    if shape.len() != axes.len() {
        return Err(LowerError::invalid_ir(format!(
            "{} axes given for a {}-d shape",
            axes.len(),
            shape.len()
        )));
    }
    Ok(())
}

/// A kernel-level task: the inputs it reads and the outputs it writes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_infers_dtype() {
        let mut g = ComputeGraph::new();
        let a = g.tensor_input("A", ScalarType::F16, &[4, 4]);
        let b = g
            .grid("B", &[4, 4], &["i", "j"], |_, ax| {
                Ok(Expr::element(Expr::Node(a), vec![ax[1].clone().into(), ax[0].clone().into()]))
            })
            .unwrap();
        let node = g.node(b).unwrap();
        assert_eq!(node.kind, NodeKind::Tensor { dtype: ScalarType::F16, shape: vec![4, 4] });
        assert!(!node.is_input());
    }

    #[test]
    fn test_axis_count_must_match_shape() {
        let mut g = ComputeGraph::new();
        let i = g.new_axis("i");
        let result = g.add_grid("B", &[2, 2], vec![i.clone()], i.into());
        assert!(matches!(result, Err(LowerError::InvalidIr { .. })));
    }

    #[test]
    fn test_reduce_rejects_arg_ops() {
        let mut g = ComputeGraph::new();
        let k = g.new_axis("k");
        assert!(g.add_reduce("s", &[4], vec![k.clone()], k.clone().into(), ReduceOp::ArgMax).is_err());
        assert!(g
            .add_arg_reduce("s", 4, k.clone(), k.clone().into(), ReduceOp::Sum, ScalarType::I32)
            .is_err());
        assert!(g
            .add_arg_reduce("s", 4, k.clone(), k.into(), ReduceOp::ArgMax, ScalarType::F32)
            .is_err());
    }

    #[test]
    fn test_indexing_rank_checked() {
        let mut g = ComputeGraph::new();
        let a = g.tensor_input("A", ScalarType::F32, &[4, 4]);
        let e = Expr::element(Expr::Node(a), vec![Expr::int(0)]);
        assert!(g.infer_type(&e).is_err());
        let e = Expr::element(Expr::Node(a), vec![Expr::int(0), Expr::int(1)]) + Expr::int(1);
        assert_eq!(g.infer_type(&e).unwrap(), ScalarType::F32);
    }

    #[test]
    fn test_fresh_vars_are_unique() {
        let mut g = ComputeGraph::new();
        let i = g.new_axis("i");
        let j = g.new_axis("i");
        assert_ne!(i, j);
        assert_eq!(g.var_watermark(), 2);
    }
}
