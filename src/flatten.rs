//! Row-major flattening of multi-dimensional tensor accesses
//!
//! `A: float[3, 4]` becomes `A: float[12]`, `A[i, j]` becomes
//! `A[((i * 4) + j)]` and stores are rewritten the same way.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{LowerError, LowerResult};
use crate::ir::{AsmOperand, AsmStmt, Expr, Function, Stmt, Type, Var};

/// Flatten every tensor access in `stmt`
pub fn flatten_tensor_index(stmt: &Stmt) -> LowerResult<Stmt> {
    Flattener::default().stmt(stmt)
}

/// Flatten a function body along with its tensor parameters and locals
pub fn flatten_function(func: &Function) -> LowerResult<Function> {
    let mut flattener = Flattener::default();
    let params = func.params.iter().map(|p| flattener.var(p)).collect();
    let local_vars = func.local_vars.iter().map(|v| flattener.var(v)).collect();
    let body = flattener.stmt(&func.body)?;
    debug!(function = %func.name, tensors = flattener.memo.len(), "flattened tensor indices");
    Ok(Function {
        name: func.name.clone(),
        kind: func.kind,
        params,
        local_vars,
        body,
        ret_type: func.ret_type.clone(),
    })
}

#[derive(Default)]
struct Flattener {
    memo: HashMap<Var, Var>,
}

impl Flattener {
    /// The 1-D replacement of a tensor variable; other variables are unchanged
    fn var(&mut self, var: &Var) -> Var {
        let Type::Tensor { dtype, shape } = &var.ty else {
            return var.clone();
        };
        if let Some(flat) = self.memo.get(var) {
            return flat.clone();
        }
        let size: usize = shape.iter().product();
        let flat = Var::new(var.id, var.hint.clone(), Type::tensor(*dtype, &[size]));
        self.memo.insert(var.clone(), flat.clone());
        flat
    }

    fn index(&mut self, base: &Expr, indices: &[Expr]) -> LowerResult<Vec<Expr>> {
        let indices = indices
            .iter()
            .map(|i| self.expr(i))
            .collect::<LowerResult<Vec<_>>>()?;
        let shape = match base {
            Expr::Var(Var {
                ty: Type::Tensor { shape, .. },
                ..
            }) => shape,
            Expr::Var(Var {
                ty: Type::Pointer(_),
                hint,
                ..
            }) => {
                if indices.len() != 1 {
                    return Err(LowerError::invalid_ir(format!(
                        "pointer {} indexed with {} indices",
                        hint,
                        indices.len()
                    )));
                }
                return Ok(indices);
            }
            _ => {
                return Err(LowerError::invalid_ir(format!(
                    "cannot infer a layout for {}",
                    base
                )));
            }
        };
        if indices.len() != shape.len() {
            return Err(LowerError::invalid_ir(format!(
                "access to {}-d tensor {} {:?} with {} indices",
                shape.len(),
                base,
                shape,
                indices.len()
            )));
        }
        let mut iter = indices.into_iter().zip(shape.iter());
        let Some((first, _)) = iter.next() else {
            return Ok(vec![Expr::int(0)]);
        };
        let flat = iter.fold(first, |acc, (index, extent)| {
            acc * Expr::int(*extent as i64) + index
        });
        Ok(vec![flat])
    }

    fn expr(&mut self, expr: &Expr) -> LowerResult<Expr> {
        Ok(match expr {
            Expr::Var(var) => Expr::Var(self.var(var)),
            Expr::Const(_) | Expr::Node(_) => expr.clone(),
            Expr::Binary { op, lhs, rhs } => Expr::binary(*op, self.expr(lhs)?, self.expr(rhs)?),
            Expr::Unary { op, operand } => Expr::unary(*op, self.expr(operand)?),
            Expr::Cast { expr, to } => Expr::cast(self.expr(expr)?, to.clone()),
            Expr::TensorElement { base, indices } => {
                let flat = self.index(base, indices)?;
                Expr::element(self.expr(base)?, flat)
            }
            Expr::Call { func, args } => Expr::call(
                func.clone(),
                args.iter()
                    .map(|a| self.expr(a))
                    .collect::<LowerResult<Vec<_>>>()?,
            ),
        })
    }

    fn operands(&mut self, operands: &[AsmOperand]) -> LowerResult<Vec<AsmOperand>> {
        operands
            .iter()
            .map(|op| Ok(AsmOperand::new(op.constraint.clone(), self.expr(&op.value)?)))
            .collect()
    }

    fn stmt(&mut self, stmt: &Stmt) -> LowerResult<Stmt> {
        Ok(match stmt {
            Stmt::Seq(stmts) => Stmt::Seq(
                stmts
                    .iter()
                    .map(|s| self.stmt(s))
                    .collect::<LowerResult<Vec<_>>>()?,
            ),
            Stmt::Declare { var, init } => Stmt::Declare {
                var: self.var(var),
                init: init.as_ref().map(|e| self.expr(e)).transpose()?,
            },
            Stmt::Assign { var, value } => Stmt::Assign {
                var: self.var(var),
                value: self.expr(value)?,
            },
            Stmt::BufferStore {
                buf,
                indices,
                value,
            } => Stmt::BufferStore {
                indices: self.index(&Expr::Var(buf.clone()), indices)?,
                buf: self.var(buf),
                value: self.expr(value)?,
            },
            Stmt::For { var, extent, body } => Stmt::For {
                var: var.clone(),
                extent: self.expr(extent)?,
                body: Box::new(self.stmt(body)?),
            },
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => Stmt::If {
                cond: self.expr(cond)?,
                then_body: Box::new(self.stmt(then_body)?),
                else_body: match else_body {
                    Some(body) => Some(Box::new(self.stmt(body)?)),
                    None => None,
                },
            },
            Stmt::Evaluate(expr) => Stmt::Evaluate(self.expr(expr)?),
            Stmt::Return(expr) => Stmt::Return(self.expr(expr)?),
            Stmt::Asm(asm) => Stmt::Asm(AsmStmt {
                template: asm.template.clone(),
                outputs: self.operands(&asm.outputs)?,
                inputs: self.operands(&asm.inputs)?,
                is_volatile: asm.is_volatile,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ScalarType;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flatten_store_and_load() {
        let a = Var::new(0, "A", Type::tensor(ScalarType::F32, &[3, 4]));
        let b = Var::new(1, "B", Type::tensor(ScalarType::F32, &[4, 3]));
        let i = Var::scalar(2, "i", ScalarType::I32);
        let j = Var::scalar(3, "j", ScalarType::I32);
        let stmt = Stmt::BufferStore {
            buf: b,
            indices: vec![Expr::from(&j), Expr::from(&i)],
            value: Expr::element(a.into(), vec![Expr::from(&i), Expr::from(&j)]),
        };
        let flat = flatten_tensor_index(&stmt).unwrap();
        assert_eq!(flat.to_string(), "B[((j * 3) + i)] = A[((i * 4) + j)];\n");
        let Stmt::BufferStore { buf, .. } = flat else {
            panic!("Expected store");
        };
        assert_eq!(buf.ty, Type::tensor(ScalarType::F32, &[12]));
    }

    #[test]
    fn test_rank_mismatch_is_invalid_ir() {
        let a = Var::new(0, "A", Type::tensor(ScalarType::F32, &[3, 4]));
        let stmt = Stmt::Evaluate(Expr::element(a.into(), vec![Expr::int(1)]));
        assert!(matches!(
            flatten_tensor_index(&stmt),
            Err(LowerError::InvalidIr { .. })
        ));
    }

    #[test]
    fn test_flatten_function_params() {
        use crate::builder::FunctionBuilder;
        use crate::ir::FunctionKind;

        let mut fb = FunctionBuilder::new("f", FunctionKind::Host);
        let a = fb.param("A", Type::tensor(ScalarType::I32, &[2, 2, 2]));
        let p = fb.param("p", Type::pointer(Type::Scalar(ScalarType::I32)));
        fb.append(Stmt::BufferStore {
            buf: a,
            indices: vec![Expr::int(1), Expr::int(0), Expr::int(1)],
            value: Expr::element(p.into(), vec![Expr::int(3)]),
        });
        let func = flatten_function(&fb.finish().unwrap()).unwrap();
        assert_eq!(func.params[0].ty, Type::tensor(ScalarType::I32, &[8]));
        assert_eq!(func.body.to_string(), "A[((((1 * 2) + 0) * 2) + 1)] = p[3];\n");
    }
}
