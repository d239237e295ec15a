//! Imperative loop-nest IR
//!
//! Expressions, statements and device functions produced by lowering and by
//! intrinsic synthesis. Every type renders as CUDA-like pseudo code through
//! `Display` and serializes with serde for the `--json` CLI output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::{ConstValue, ScalarType};
use crate::graph::NodeId;

/// Value type of a variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Scalar(ScalarType),
    Tensor { dtype: ScalarType, shape: Vec<usize> },
    Pointer(Box<Type>),
    Reference(Box<Type>),
    Void,
}

impl Type {
    pub fn tensor(dtype: ScalarType, shape: &[usize]) -> Self {
        Type::Tensor {
            dtype,
            shape: shape.to_vec(),
        }
    }

    pub fn pointer(base: Type) -> Self {
        Type::Pointer(Box::new(base))
    }

    pub fn reference(base: Type) -> Self {
        Type::Reference(Box::new(base))
    }

    pub fn void_pointer() -> Self {
        Type::pointer(Type::Void)
    }

    /// The scalar type, if this is a scalar
    pub fn as_scalar(&self) -> Option<ScalarType> {
        match self {
            Type::Scalar(dtype) => Some(*dtype),
            Type::Reference(inner) => inner.as_scalar(),
            _ => None,
        }
    }

    /// The element type of a tensor or typed pointer
    pub fn element_type(&self) -> Option<ScalarType> {
        match self {
            Type::Tensor { dtype, .. } => Some(*dtype),
            Type::Pointer(base) => base.as_scalar(),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(dtype) => write!(f, "{}", dtype.c_name()),
            Type::Tensor { dtype, shape } => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                write!(f, "{}[{}]", dtype.c_name(), dims.join(", "))
            }
            Type::Pointer(base) => write!(f, "{}*", base),
            Type::Reference(base) => write!(f, "{}&", base),
            Type::Void => write!(f, "void"),
        }
    }
}

/// A named, typed variable; `id` keeps variables with the same hint apart
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    pub id: u32,
    pub hint: String,
    pub ty: Type,
}

impl Var {
    pub fn new(id: u32, hint: impl Into<String>, ty: Type) -> Self {
        Self {
            id,
            hint: hint.into(),
            ty,
        }
    }

    pub fn scalar(id: u32, hint: impl Into<String>, dtype: ScalarType) -> Self {
        Self::new(id, hint, Type::Scalar(dtype))
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hint)
    }
}

/// A typed literal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub value: ConstValue,
    pub dtype: ScalarType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    /// Comparisons and logical connectives produce `bool`
    pub fn is_predicate(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Const(Constant),
    /// Reference to a compute-graph node; removed by lowering
    Node(NodeId),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to: Type,
    },
    TensorElement {
        base: Box<Expr>,
        indices: Vec<Expr>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn constant(value: ConstValue, dtype: ScalarType) -> Self {
        Expr::Const(Constant { value, dtype })
    }

    /// An `i32` integer literal
    pub fn int(value: i64) -> Self {
        Expr::constant(ConstValue::Int(value), ScalarType::I32)
    }

    /// An `f32` float literal
    pub fn float(value: f64) -> Self {
        Expr::constant(ConstValue::Float(value), ScalarType::F32)
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn cast(expr: Expr, to: Type) -> Self {
        Expr::Cast {
            expr: Box::new(expr),
            to,
        }
    }

    pub fn element(base: Expr, indices: Vec<Expr>) -> Self {
        Expr::TensorElement {
            base: Box::new(base),
            indices,
        }
    }

    pub fn call(func: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            func: func.into(),
            args,
        }
    }

    pub fn min(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Min, lhs, rhs)
    }

    pub fn max(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Max, lhs, rhs)
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, lhs, rhs)
    }

    pub fn gt(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Gt, lhs, rhs)
    }

    /// Value of an integer literal, if this is one
    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Expr::Const(c) => c.value.as_i64(),
            _ => None,
        }
    }
}

impl From<Var> for Expr {
    fn from(var: Var) -> Self {
        Expr::Var(var)
    }
}

impl From<&Var> for Expr {
    fn from(var: &Var) -> Self {
        Expr::Var(var.clone())
    }
}

macro_rules! impl_expr_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_expr_op!(Add, add, BinaryOp::Add);
impl_expr_op!(Sub, sub, BinaryOp::Sub);
impl_expr_op!(Mul, mul, BinaryOp::Mul);
impl_expr_op!(Div, div, BinaryOp::Div);
impl_expr_op!(Rem, rem, BinaryOp::Mod);

impl std::ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl Expr {
    /// Push every variable referenced by this expression onto `out`
    pub fn collect_vars<'a>(&'a self, out: &mut Vec<&'a Var>) {
        match self {
            Expr::Var(var) => out.push(var),
            Expr::Const(_) | Expr::Node(_) => {}
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
            Expr::Unary { operand, .. } => operand.collect_vars(out),
            Expr::Cast { expr, .. } => expr.collect_vars(out),
            Expr::TensorElement { base, indices } => {
                base.collect_vars(out);
                indices.iter().for_each(|i| i.collect_vars(out));
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_vars(out)),
        }
    }

    fn fmt_named(&self, f: &mut fmt::Formatter<'_>, names: &VarNames) -> fmt::Result {
        match self {
            Expr::Var(var) => f.write_str(names.name(var)),
            Expr::Const(c) => write!(f, "{}", c.value),
            Expr::Node(id) => write!(f, "{}", id),
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::Min | BinaryOp::Max => {
                    write!(f, "{}({}, {})", op.symbol(), Named(lhs, names), Named(rhs, names))
                }
                _ => write!(f, "({} {} {})", Named(lhs, names), op.symbol(), Named(rhs, names)),
            },
            Expr::Unary { op, operand } => match op {
                UnaryOp::Neg => write!(f, "(-{})", Named(operand, names)),
                UnaryOp::Not => write!(f, "(!{})", Named(operand, names)),
            },
            Expr::Cast { expr, to } => write!(f, "(({}){})", to, Named(expr, names)),
            Expr::TensorElement { base, indices } => {
                write!(f, "{}[{}]", Named(base, names), join(indices, ", ", names))
            }
            Expr::Call { func, args } => write!(f, "{}({})", func, join(args, ", ", names)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        self.fmt_named(f, &VarNames::new(vars))
    }
}

/// Rendered variable names; distinct variables sharing a hint get their id appended
#[derive(Debug, Default)]
struct VarNames {
    names: HashMap<u32, String>,
}

impl VarNames {
    fn new<'a>(vars: impl IntoIterator<Item = &'a Var>) -> Self {
        let mut ids_by_hint: BTreeMap<&str, BTreeSet<u32>> = BTreeMap::new();
        for var in vars {
            ids_by_hint.entry(var.hint.as_str()).or_default().insert(var.id);
        }
        let names = ids_by_hint
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .flat_map(|(hint, ids)| ids.into_iter().map(move |id| (id, format!("{}_{}", hint, id))))
            .collect();
        Self { names }
    }

    fn name<'a>(&'a self, var: &'a Var) -> &'a str {
        self.names.get(&var.id).map_or(var.hint.as_str(), String::as_str)
    }
}

struct Named<'a>(&'a Expr, &'a VarNames);

impl fmt::Display for Named<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_named(f, self.1)
    }
}

/// An operand of an inline assembly statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsmOperand {
    pub constraint: String,
    pub value: Expr,
}

impl AsmOperand {
    pub fn new(constraint: impl Into<String>, value: Expr) -> Self {
        Self {
            constraint: constraint.into(),
            value,
        }
    }
}

/// Inline PTX; `%N` placeholders number outputs first, then inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsmStmt {
    pub template: String,
    pub outputs: Vec<AsmOperand>,
    pub inputs: Vec<AsmOperand>,
    pub is_volatile: bool,
}

/// Statement tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Seq(Vec<Stmt>),
    Declare {
        var: Var,
        init: Option<Expr>,
    },
    Assign {
        var: Var,
        value: Expr,
    },
    BufferStore {
        buf: Var,
        indices: Vec<Expr>,
        value: Expr,
    },
    For {
        var: Var,
        extent: Expr,
        body: Box<Stmt>,
    },
    If {
        cond: Expr,
        then_body: Box<Stmt>,
        else_body: Option<Box<Stmt>>,
    },
    Evaluate(Expr),
    Return(Expr),
    Asm(AsmStmt),
}

impl Stmt {
    /// Collapse a statement list; a single statement is returned as-is
    pub fn from_stmts(mut stmts: Vec<Stmt>) -> Self {
        if stmts.len() == 1 {
            stmts.remove(0)
        } else {
            Stmt::Seq(stmts)
        }
    }

    pub fn assign(var: &Var, value: Expr) -> Self {
        Stmt::Assign {
            var: var.clone(),
            value,
        }
    }

    pub fn declare(var: &Var, init: Option<Expr>) -> Self {
        Stmt::Declare {
            var: var.clone(),
            init,
        }
    }

    /// Push every variable declared, assigned or read in this statement onto `out`
    pub fn collect_vars<'a>(&'a self, out: &mut Vec<&'a Var>) {
        match self {
            Stmt::Seq(stmts) => stmts.iter().for_each(|s| s.collect_vars(out)),
            Stmt::Declare { var, init } => {
                out.push(var);
                if let Some(init) = init {
                    init.collect_vars(out);
                }
            }
            Stmt::Assign { var, value } => {
                out.push(var);
                value.collect_vars(out);
            }
            Stmt::BufferStore {
                buf,
                indices,
                value,
            } => {
                out.push(buf);
                indices.iter().for_each(|i| i.collect_vars(out));
                value.collect_vars(out);
            }
            Stmt::For { var, extent, body } => {
                out.push(var);
                extent.collect_vars(out);
                body.collect_vars(out);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                cond.collect_vars(out);
                then_body.collect_vars(out);
                if let Some(else_body) = else_body {
                    else_body.collect_vars(out);
                }
            }
            Stmt::Evaluate(expr) | Stmt::Return(expr) => expr.collect_vars(out),
            Stmt::Asm(asm) => asm
                .outputs
                .iter()
                .chain(&asm.inputs)
                .for_each(|op| op.value.collect_vars(out)),
        }
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, level: usize, names: &VarNames) -> fmt::Result {
        let pad = "  ".repeat(level);
        match self {
            Stmt::Seq(stmts) => {
                for stmt in stmts {
                    stmt.fmt_indented(f, level, names)?;
                }
                Ok(())
            }
            Stmt::Declare { var, init } => match init {
                Some(init) => writeln!(
                    f,
                    "{}{} {} = {};",
                    pad,
                    var.ty,
                    names.name(var),
                    Named(init, names)
                ),
                None => writeln!(f, "{}{} {};", pad, var.ty, names.name(var)),
            },
            Stmt::Assign { var, value } => {
                writeln!(f, "{}{} = {};", pad, names.name(var), Named(value, names))
            }
            Stmt::BufferStore {
                buf,
                indices,
                value,
            } => writeln!(
                f,
                "{}{}[{}] = {};",
                pad,
                names.name(buf),
                join(indices, ", ", names),
                Named(value, names)
            ),
            Stmt::For { var, extent, body } => {
                let name = names.name(var);
                writeln!(
                    f,
                    "{}for ({} {} = 0; {} < {}; {}++) {{",
                    pad,
                    var.ty,
                    name,
                    name,
                    Named(extent, names),
                    name
                )?;
                body.fmt_indented(f, level + 1, names)?;
                writeln!(f, "{}}}", pad)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                writeln!(f, "{}if ({}) {{", pad, Named(cond, names))?;
                then_body.fmt_indented(f, level + 1, names)?;
                if let Some(else_body) = else_body {
                    writeln!(f, "{}}} else {{", pad)?;
                    else_body.fmt_indented(f, level + 1, names)?;
                }
                writeln!(f, "{}}}", pad)
            }
            Stmt::Evaluate(expr) => writeln!(f, "{}{};", pad, Named(expr, names)),
            Stmt::Return(expr) => writeln!(f, "{}return {};", pad, Named(expr, names)),
            Stmt::Asm(asm) => {
                let operands = |ops: &[AsmOperand]| {
                    ops.iter()
                        .map(|op| format!("\"{}\"({})", op.constraint, Named(&op.value, names)))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                writeln!(
                    f,
                    "{}asm{}(\"{}\" : {} : {});",
                    pad,
                    if asm.is_volatile { " volatile" } else { "" },
                    asm.template,
                    operands(&asm.outputs),
                    operands(&asm.inputs)
                )
            }
        }
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        self.fmt_indented(f, 0, &VarNames::new(vars))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    CudaDevice,
    CudaKernel,
    Host,
}

impl FunctionKind {
    fn qualifier(self) -> &'static str {
        match self {
            FunctionKind::CudaDevice => "__device__ __forceinline__ ",
            FunctionKind::CudaKernel => "__global__ ",
            FunctionKind::Host => "",
        }
    }
}

/// A function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    pub params: Vec<Var>,
    pub local_vars: Vec<Var>,
    pub body: Stmt,
    pub ret_type: Type,
}

impl Function {
    /// Parameters, locals and every variable in the body, in order of appearance
    pub fn vars(&self) -> Vec<&Var> {
        let mut vars: Vec<&Var> = self.params.iter().chain(&self.local_vars).collect();
        self.body.collect_vars(&mut vars);
        vars
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = VarNames::new(self.vars());
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {}", p.ty, names.name(p)))
            .collect();
        writeln!(
            f,
            "{}{} {}({}) {{",
            self.kind.qualifier(),
            self.ret_type,
            self.name,
            params.join(", ")
        )?;
        for var in &self.local_vars {
            writeln!(f, "  {} {};", var.ty, names.name(var))?;
        }
        self.body.fmt_indented(f, 1, &names)?;
        writeln!(f, "}}")
    }
}

fn join(items: &[Expr], sep: &str, names: &VarNames) -> String {
    items
        .iter()
        .map(|e| Named(e, names).to_string())
        .collect::<Vec<_>>()
        .join(sep)
}
