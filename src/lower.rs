//! Loop expansion: compute nodes to imperative loop nests
//!
//! Given an expression that may reference compute nodes, emit the statements
//! computing it and return the expression holding its value.
//!
//! For example
//!
//! ```text
//! C = grid[i: 3, j: 3] => sum[k: 3] => A[i, k] * B[k, j]
//! ```
//!
//! with `A`, `B` and `C` in the input map expands to
//!
//! ```text
//! for (i = 0; i < 3; i++)
//!   for (j = 0; j < 3; j++) {
//!     s = 0;
//!     for (k = 0; k < 3; k++)
//!       s = s + A[i, k] * B[k, j];
//!     C[i, j] = s;
//!   }
//! ```
//!
//! Nodes absent from the input map get fresh storage, returned in
//! `Expansion::new_buffers` for the caller to declare. There is no cache
//! across occurrences: a node referenced twice is computed twice, into the
//! same buffer.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::builder::StmtBuilder;
use crate::error::{LowerError, LowerResult};
use crate::graph::{
    ArgReduceCompute, Compute, ComputeGraph, ComputeNode, GridCompute, NodeId, NodeKind,
    ReduceCompute, Task,
};
use crate::ir::{Expr, Function, FunctionKind, Stmt, Type, Var};

/// Result of expanding one expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    /// Statements computing the value
    pub stmt: Stmt,
    /// Expression holding the value once `stmt` has run
    pub value: Expr,
    /// Storage created for nodes that were not in the input map
    pub new_buffers: BTreeMap<NodeId, Var>,
    /// First variable id not used by this expansion, including inline declarations
    pub next_var: u32,
}

/// Expand `expr` into loops, reusing the storage in `input_map`
pub fn expand_loop(
    graph: &ComputeGraph,
    expr: &Expr,
    input_map: &HashMap<NodeId, Var>,
) -> LowerResult<Expansion> {
    LoopExpander::new(graph, input_map, 0).expand(expr)
}

/// Parameter variables of a task: inputs first, then outputs
pub fn params_from_task(graph: &mut ComputeGraph, task: &Task) -> LowerResult<Vec<Var>> {
    let mut params = Vec::with_capacity(task.inputs.len() + task.outputs.len());
    for id in task.inputs.iter().chain(task.outputs.iter()) {
        let node = graph.node(*id)?;
        let (hint, ty) = (node.name.clone(), node.kind.storage_type());
        params.push(graph.fresh_var(hint, ty));
    }
    Ok(params)
}

/// Lower a whole task into one function.
///
/// Inputs and outputs become parameters; every output is expanded in order
/// and intermediate storage is declared as function locals.
pub fn lower_task(graph: &mut ComputeGraph, task: &Task, kind: FunctionKind) -> LowerResult<Function> {
    let params = params_from_task(graph, task)?;
    let mut input_map: HashMap<NodeId, Var> = task
        .inputs
        .iter()
        .chain(task.outputs.iter())
        .copied()
        .zip(params.iter().cloned())
        .collect();

    let mut stmts = Vec::new();
    let mut local_vars = Vec::new();
    let mut next_var = 0;
    for output in &task.outputs {
        let expansion = LoopExpander::new(graph, &input_map, next_var).expand(&Expr::Node(*output))?;
        next_var = expansion.next_var;
        // later outputs see earlier intermediates as storage, keeping ids unique
        for (id, var) in expansion.new_buffers {
            input_map.insert(id, var.clone());
            local_vars.push(var);
        }
        stmts.push(expansion.stmt);
    }
    debug!(task = %task.name, params = params.len(), locals = local_vars.len(), "lowered task");
    Ok(Function {
        name: task.name.clone(),
        kind,
        params,
        local_vars,
        body: Stmt::from_stmts(stmts),
        ret_type: Type::Void,
    })
}

struct LoopExpander<'a> {
    graph: &'a ComputeGraph,
    input_map: &'a HashMap<NodeId, Var>,
    sb: StmtBuilder,
    new_buffers: BTreeMap<NodeId, Var>,
    next_var: u32,
}

impl<'a> LoopExpander<'a> {
    fn new(graph: &'a ComputeGraph, input_map: &'a HashMap<NodeId, Var>, first_var: u32) -> Self {
        // ids above every graph axis, every caller-supplied buffer and `first_var`
        let next_var = input_map
            .values()
            .map(|v| v.id + 1)
            .fold(graph.var_watermark().max(first_var), u32::max);
        Self {
            graph,
            input_map,
            sb: StmtBuilder::new(),
            new_buffers: BTreeMap::new(),
            next_var,
        }
    }

    fn expand(mut self, expr: &Expr) -> LowerResult<Expansion> {
        let value = self.visit(expr)?;
        Ok(Expansion {
            stmt: self.sb.finish()?,
            value,
            new_buffers: self.new_buffers,
            next_var: self.next_var,
        })
    }

    fn fresh_var(&mut self, hint: impl Into<String>, ty: Type) -> Var {
        let var = Var::new(self.next_var, hint, ty);
        self.next_var += 1;
        var
    }

    /// Storage for `id`: the caller's, a buffer from an earlier occurrence, or a new one
    fn buffer_for(&mut self, id: NodeId, hint: &str, ty: Type) -> Var {
        if let Some(var) = self.input_map.get(&id) {
            return var.clone();
        }
        if let Some(var) = self.new_buffers.get(&id) {
            return var.clone();
        }
        let var = self.fresh_var(hint, ty);
        self.new_buffers.insert(id, var.clone());
        var
    }

    /// Rewrite an expression, expanding every compute node it references
    fn visit(&mut self, expr: &Expr) -> LowerResult<Expr> {
        match expr {
            Expr::Var(_) | Expr::Const(_) => Ok(expr.clone()),
            Expr::Node(id) => self.visit_node(*id),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.visit(lhs)?;
                let rhs = self.visit(rhs)?;
                Ok(Expr::binary(*op, lhs, rhs))
            }
            Expr::Unary { op, operand } => Ok(Expr::unary(*op, self.visit(operand)?)),
            Expr::Cast { expr, to } => Ok(Expr::cast(self.visit(expr)?, to.clone())),
            Expr::TensorElement { base, indices } => {
                let base = self.visit(base)?;
                let indices = indices
                    .iter()
                    .map(|i| self.visit(i))
                    .collect::<LowerResult<Vec<_>>>()?;
                Ok(Expr::element(base, indices))
            }
            Expr::Call { func, args } => {
                let args = args
                    .iter()
                    .map(|a| self.visit(a))
                    .collect::<LowerResult<Vec<_>>>()?;
                Ok(Expr::call(func.clone(), args))
            }
        }
    }

    fn visit_node(&mut self, id: NodeId) -> LowerResult<Expr> {
        let graph = self.graph;
        let node = graph.node(id)?;
        match (&node.kind, &node.compute) {
            (_, None) => match self.input_map.get(&id) {
                Some(var) => Ok(Expr::Var(var.clone())),
                None => Err(LowerError::unsupported(format!(
                    "input {} `{}` has no storage in the input map",
                    node.kind.kind_name(),
                    node.name
                ))),
            },
            (NodeKind::Tensor { .. }, Some(Compute::Grid(grid))) => self.expand_grid(id, node, grid),
            (NodeKind::Scalar { .. }, Some(Compute::Reduce(reduce))) => {
                self.expand_reduce(id, node, reduce)
            }
            (NodeKind::Scalar { .. }, Some(Compute::ArgReduce(arg))) => {
                self.expand_arg_reduce(id, node, arg)
            }
            (kind, Some(compute)) => Err(LowerError::unsupported(format!(
                "{} compute on {} node `{}`",
                compute.pattern_name(),
                kind.kind_name(),
                node.name
            ))),
        }
    }

    fn expand_grid(&mut self, id: NodeId, node: &ComputeNode, grid: &GridCompute) -> LowerResult<Expr> {
        debug!(node = %node.name, shape = ?grid.shape, "expanding grid compute");
        let buf = self.buffer_for(id, &node.name, node.kind.storage_type());

        for (axis, extent) in grid.axes.iter().zip(&grid.shape) {
            self.sb.enter_for(axis.clone(), Expr::int(*extent as i64));
        }

        // innermost body
        let value = self.visit(&grid.value)?;
        self.sb.append(Stmt::BufferStore {
            buf: buf.clone(),
            indices: grid.axes.iter().map(Expr::from).collect(),
            value,
        });

        for _ in &grid.shape {
            self.sb.exit_body()?;
        }
        Ok(Expr::Var(buf))
    }

    fn expand_reduce(
        &mut self,
        id: NodeId,
        node: &ComputeNode,
        reduce: &ReduceCompute,
    ) -> LowerResult<Expr> {
        debug!(node = %node.name, op = %reduce.op, shape = ?reduce.shape, "expanding reduce compute");
        let op = reduce.op;
        if op.is_arg() {
            return Err(LowerError::unsupported(format!(
                "arg operation `{}` in plain reduce `{}`",
                op, node.name
            )));
        }
        let dtype = self.graph.infer_type(&reduce.value)?;
        let acc = match self.new_buffers.get(&id) {
            Some(var) => var.clone(),
            None => {
                let var = self.fresh_var(node.name.clone(), Type::Scalar(dtype));
                self.new_buffers.insert(id, var.clone());
                var
            }
        };

        self.sb.append(Stmt::assign(&acc, op.identity(dtype)));
        for (axis, extent) in reduce.axes.iter().zip(&reduce.shape) {
            self.sb.enter_for(axis.clone(), Expr::int(*extent as i64));
        }

        let value = self.visit(&reduce.value)?;
        self.sb
            .append(Stmt::assign(&acc, op.combine(Expr::Var(acc.clone()), value)));

        for _ in &reduce.shape {
            self.sb.exit_body()?;
        }

        let count: usize = reduce.shape.iter().product();
        let result = op.finalize(Expr::Var(acc), count);
        if let Some(external) = self.input_map.get(&id) {
            trace!(node = %node.name, "writing reduce result to external storage");
            self.sb.append(Stmt::assign(external, result.clone()));
        }
        Ok(result)
    }

    fn expand_arg_reduce(
        &mut self,
        id: NodeId,
        node: &ComputeNode,
        arg: &ArgReduceCompute,
    ) -> LowerResult<Expr> {
        debug!(node = %node.name, op = %arg.op, extent = arg.extent, "expanding arg-reduce compute");
        let op = arg.op;
        let value_dtype = self.graph.infer_type(&arg.value)?;

        let acc_index = match self.new_buffers.get(&id) {
            Some(var) => var.clone(),
            None => {
                let var = self.fresh_var(format!("{}_idx", node.name), Type::Scalar(arg.index_dtype));
                self.new_buffers.insert(id, var.clone());
                var
            }
        };
        // the best value is declared locally, so each occurrence needs its own
        let acc_value = self.fresh_var(format!("{}_val", node.name), Type::Scalar(value_dtype));

        self.sb
            .append(Stmt::declare(&acc_value, Some(op.identity(value_dtype))));
        self.sb.append(Stmt::assign(
            &acc_index,
            Expr::constant(arg.index_dtype.zero(), arg.index_dtype),
        ));

        self.sb.enter_for(arg.axis.clone(), Expr::int(arg.extent as i64));
        let value = self.visit(&arg.value)?;
        let cond = op.compare(value.clone(), Expr::Var(acc_value.clone()))?;
        let axis = arg.axis.clone();
        let index_dtype = arg.index_dtype;
        self.sb.if_then(cond, |sb| {
            sb.append(Stmt::assign(&acc_value, value));
            sb.append(Stmt::assign(
                &acc_index,
                Expr::cast(Expr::Var(axis), Type::Scalar(index_dtype)),
            ));
            Ok(())
        })?;
        self.sb.exit_body()?;

        if let Some(external) = self.input_map.get(&id) {
            trace!(node = %node.name, "writing arg-reduce index to external storage");
            self.sb
                .append(Stmt::assign(external, Expr::Var(acc_index.clone())));
        }
        Ok(Expr::Var(acc_index))
    }
}
