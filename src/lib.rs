//! Tensor Lowering and GPU Intrinsic Synthesis
//!
//! This library expands tensor compute definitions (grid, reduce and
//! arg-reduce nodes) into imperative loop nests, and synthesizes the GPU
//! device functions (`cp.async`, `mma.sync`, `ldmatrix`) that generated
//! kernels call into.
//!
//! # Example
//!
//! ```rust
//! use tensor_lowering::{lower_source, FunctionKind};
//!
//! let source = "
//!     input A: f32[2, 3];
//!     input B: f32[3, 2];
//!     let C = grid[i: 2, j: 2] => sum[k: 3] => A[i, k] * B[k, j];
//! ";
//! let func = lower_source(source, "matmul", FunctionKind::Host).unwrap();
//! println!("{}", func);
//! ```

pub mod builder;
pub mod dtype;
pub mod error;
pub mod flatten;
pub mod graph;
pub mod intrinsics;
pub mod ir;
pub mod lexer;
pub mod lower;
pub mod mapping;
pub mod parser;
pub mod pipeline;
pub mod reduce;
pub mod schedule;
pub mod target;

pub use builder::{FunctionBuilder, StmtBuilder};
pub use dtype::{ConstValue, ScalarType};
pub use error::{LowerError, LowerResult};
pub use flatten::{flatten_function, flatten_tensor_index};
pub use graph::{ComputeGraph, ComputeNode, NodeId, NodeKind, Task};
pub use intrinsics::{FunctionRegistry, MmaConfig};
pub use ir::{Expr, Function, FunctionKind, Stmt, Type, Var};
pub use lower::{expand_loop, lower_task, params_from_task, Expansion};
pub use mapping::TaskMapping;
pub use parser::{parse, ComputeProgram, Parser};
pub use pipeline::{simulate, AsyncCopyQueue, PipelineEvent};
pub use reduce::ReduceOp;
pub use schedule::{MatmulSchedule, Schedule};
pub use target::TargetConfig;

/// Parse a compute definition and lower its outputs into one function
pub fn lower_source(source: &str, name: &str, kind: FunctionKind) -> LowerResult<Function> {
    let mut program = parse(source)?;
    let task = program.task(name)?;
    lower_task(&mut program.graph, &task, kind)
}
