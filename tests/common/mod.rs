//! Reference interpreter for lowered functions
//!
//! Every scalar is held as `f64`; casts to integer types truncate.

use std::collections::HashMap;

use tensor_lowering::ir::{BinaryOp, UnaryOp};
use tensor_lowering::{Expr, Function, Stmt, Type, Var};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Tensor { shape: Vec<usize>, data: Vec<f64> },
}

impl Value {
    pub fn tensor(shape: &[usize], data: Vec<f64>) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        Value::Tensor {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Value::tensor(shape, vec![0.0; shape.iter().product()])
    }

    pub fn scalar(&self) -> f64 {
        match self {
            Value::Scalar(v) => *v,
            other => panic!("expected scalar, got {:?}", other),
        }
    }

    pub fn data(&self) -> &[f64] {
        match self {
            Value::Tensor { data, .. } => data,
            other => panic!("expected tensor, got {:?}", other),
        }
    }
}

#[derive(Default)]
pub struct Interpreter {
    env: HashMap<u32, Value>,
    /// Number of stores per (buffer id, flat index)
    pub stores: HashMap<(u32, usize), usize>,
}

impl Interpreter {
    /// Run `func` with `args` bound to its parameters; returns the final parameter values
    pub fn run(func: &Function, args: Vec<Value>) -> (Vec<Value>, Interpreter) {
        assert_eq!(func.params.len(), args.len(), "argument count");
        let mut interp = Interpreter::default();
        for (param, arg) in func.params.iter().zip(args) {
            interp.env.insert(param.id, arg);
        }
        for local in &func.local_vars {
            let init = match &local.ty {
                Type::Tensor { shape, .. } => Value::zeros(shape),
                _ => Value::Scalar(0.0),
            };
            interp.env.insert(local.id, init);
        }
        interp.exec(&func.body);
        let results = func
            .params
            .iter()
            .map(|p| interp.env[&p.id].clone())
            .collect();
        (results, interp)
    }

    fn exec(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Seq(stmts) => stmts.iter().for_each(|s| self.exec(s)),
            Stmt::Declare { var, init } => {
                let value = match init {
                    Some(init) => Value::Scalar(self.eval(init)),
                    None => Value::Scalar(0.0),
                };
                self.env.insert(var.id, value);
            }
            Stmt::Assign { var, value } => {
                let value = self.eval(value);
                self.env.insert(var.id, Value::Scalar(value));
            }
            Stmt::BufferStore {
                buf,
                indices,
                value,
            } => {
                let value = self.eval(value);
                let flat = self.flat_index(buf, indices);
                *self.stores.entry((buf.id, flat)).or_insert(0) += 1;
                match self.env.get_mut(&buf.id) {
                    Some(Value::Tensor { data, .. }) => data[flat] = value,
                    other => panic!("store into non-tensor {}: {:?}", buf, other),
                }
            }
            Stmt::For { var, extent, body } => {
                let extent = self.eval(extent) as i64;
                for i in 0..extent {
                    self.env.insert(var.id, Value::Scalar(i as f64));
                    self.exec(body);
                }
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if self.eval(cond) != 0.0 {
                    self.exec(then_body);
                } else if let Some(else_body) = else_body {
                    self.exec(else_body);
                }
            }
            Stmt::Evaluate(_) | Stmt::Return(_) | Stmt::Asm(_) => {}
        }
    }

    fn flat_index(&mut self, buf: &Var, indices: &[Expr]) -> usize {
        let shape = match &buf.ty {
            Type::Tensor { shape, .. } => shape.clone(),
            other => panic!("indexing non-tensor type {}", other),
        };
        assert_eq!(shape.len(), indices.len(), "rank of {}", buf);
        let mut flat = 0usize;
        for (index, extent) in indices.iter().zip(&shape) {
            let index = self.eval(index) as usize;
            assert!(index < *extent, "index {} out of range for {}", index, buf);
            flat = flat * extent + index;
        }
        flat
    }

    fn eval(&mut self, expr: &Expr) -> f64 {
        match expr {
            Expr::Var(var) => self.env[&var.id].scalar(),
            Expr::Const(c) => c.value.as_f64(),
            Expr::Node(id) => panic!("unlowered node {}", id),
            Expr::Binary { op, lhs, rhs } => {
                let (a, b) = (self.eval(lhs), self.eval(rhs));
                let truth = |t: bool| if t { 1.0 } else { 0.0 };
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Mod => a % b,
                    BinaryOp::Min => a.min(b),
                    BinaryOp::Max => a.max(b),
                    BinaryOp::Lt => truth(a < b),
                    BinaryOp::Le => truth(a <= b),
                    BinaryOp::Gt => truth(a > b),
                    BinaryOp::Ge => truth(a >= b),
                    BinaryOp::Eq => truth(a == b),
                    BinaryOp::Ne => truth(a != b),
                    BinaryOp::And => truth(a != 0.0 && b != 0.0),
                    BinaryOp::Or => truth(a != 0.0 || b != 0.0),
                }
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand);
                match op {
                    UnaryOp::Neg => -v,
                    UnaryOp::Not => {
                        if v == 0.0 {
                            1.0
                        } else {
                            0.0
                        }
                    }
                }
            }
            Expr::Cast { expr, to } => {
                let v = self.eval(expr);
                match to.as_scalar() {
                    Some(dtype) if dtype.is_integer() => v.trunc(),
                    _ => v,
                }
            }
            Expr::TensorElement { base, indices } => {
                let Expr::Var(buf) = &**base else {
                    panic!("element of non-variable {}", base);
                };
                let flat = self.flat_index(buf, indices);
                self.env[&buf.id].data()[flat]
            }
            Expr::Call { func, .. } => panic!("cannot interpret call to {}", func),
        }
    }
}
