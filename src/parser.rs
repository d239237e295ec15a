//! Parser for the compute definition language
//!
//! Parses programs like:
//!
//! ```text
//! input A: f32[4, 8];
//! input B: f32[8, 4];
//! let C = grid[i: 4, j: 4] => sum[k: 8] => A[i, k] * B[k, j];
//! let best = argmax<i64>[k: 4] => C[0, k];
//! output C, best;
//! ```
//!
//! `grid` is only legal at the top of a `let`; reductions may appear anywhere
//! an expression can. The body after `=>` extends as far as possible, so
//! parenthesize a reduction to combine its result with other terms.

use std::collections::HashMap;

use tracing::debug;

use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::graph::{ComputeGraph, NodeId, NodeKind, Task};
use crate::ir::{BinaryOp, Expr, Type, UnaryOp, Var};
use crate::lexer::{Lexer, Token};
use crate::reduce::ReduceOp;

/// A parsed program: the compute graph plus its named nodes
#[derive(Debug, Clone)]
pub struct ComputeProgram {
    pub graph: ComputeGraph,
    /// Input nodes in declaration order
    pub inputs: Vec<NodeId>,
    /// `let` bindings in declaration order
    pub bindings: Vec<(String, NodeId)>,
    /// Nodes named by `output` statements
    pub outputs: Vec<NodeId>,
}

impl ComputeProgram {
    /// Node bound to `name`, input or `let`
    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.graph
            .iter()
            .filter(|(id, _)| self.inputs.contains(id) || self.bindings.iter().any(|(_, b)| b == id))
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
    }

    /// Task reading every input and writing the declared outputs, or the last binding
    pub fn task(&self, name: &str) -> LowerResult<Task> {
        let outputs = if self.outputs.is_empty() {
            match self.bindings.last() {
                Some((_, id)) => vec![*id],
                None => return Err(LowerError::parse_error("program defines no computation")),
            }
        } else {
            self.outputs.clone()
        };
        Ok(Task {
            name: name.to_string(),
            inputs: self.inputs.clone(),
            outputs,
        })
    }
}

/// Parse a complete program
pub fn parse(source: &str) -> LowerResult<ComputeProgram> {
    Parser::new(source)?.parse_program()
}

/// Recursive-descent parser building a compute graph directly
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
    graph: ComputeGraph,
    symbols: HashMap<String, NodeId>,
    inputs: Vec<NodeId>,
    bindings: Vec<(String, NodeId)>,
    outputs: Vec<NodeId>,
    /// Axis variables in scope, innermost last
    axes: Vec<(String, Var)>,
    binding: String,
    reductions: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> LowerResult<Self> {
        let mut parser = Self {
            lexer: Lexer::new(source),
            current: None,
            graph: ComputeGraph::new(),
            symbols: HashMap::new(),
            inputs: Vec::new(),
            bindings: Vec::new(),
            outputs: Vec::new(),
            axes: Vec::new(),
            binding: String::new(),
            reductions: 0,
        };
        parser.advance()?;
        Ok(parser)
    }

    /// Advance to the next token, returning the previous one
    fn advance(&mut self) -> LowerResult<Option<Token>> {
        let prev = self.current.take();
        self.current = match self.lexer.next() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(())) => {
                return Err(LowerError::LexerError {
                    position: self.lexer.span().start,
                    message: "unrecognized character".to_string(),
                })
            }
            None => None,
        };
        Ok(prev)
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Check the token after the current one
    fn check_next(&mut self, expected: &Token) -> bool {
        matches!(
            self.lexer.peek(),
            Some(Ok(tok)) if std::mem::discriminant(tok) == std::mem::discriminant(expected)
        )
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> LowerResult<()> {
        if self.check(&expected) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", expected)))
        }
    }

    fn unexpected(&self, wanted: &str) -> LowerError {
        match &self.current {
            Some(tok) => LowerError::parse_error(format!("Expected {}, got '{}'", wanted, tok)),
            None => LowerError::parse_error(format!("Expected {}, got end of input", wanted)),
        }
    }

    fn expect_ident(&mut self) -> LowerResult<String> {
        match self.current.clone() {
            Some(Token::Ident(name)) => {
                self.advance()?;
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_extent(&mut self) -> LowerResult<usize> {
        match self.current {
            Some(Token::Int(n)) if n > 0 => {
                self.advance()?;
                Ok(n as usize)
            }
            _ => Err(self.unexpected("positive extent")),
        }
    }

    fn parse_dtype(&mut self) -> LowerResult<ScalarType> {
        let name = self.expect_ident()?;
        ScalarType::from_name(&name)
            .ok_or_else(|| LowerError::parse_error(format!("Unknown data type: {}", name)))
    }

    /// Parse a complete program (multiple statements)
    pub fn parse_program(mut self) -> LowerResult<ComputeProgram> {
        while self.current.is_some() {
            self.parse_statement()?;
        }
        debug!(
            nodes = self.graph.len(),
            bindings = self.bindings.len(),
            "parsed compute program"
        );
        Ok(ComputeProgram {
            graph: self.graph,
            inputs: self.inputs,
            bindings: self.bindings,
            outputs: self.outputs,
        })
    }

    fn parse_statement(&mut self) -> LowerResult<()> {
        match self.current {
            Some(Token::Input) => self.parse_input(),
            Some(Token::Let) => self.parse_let(),
            Some(Token::Output) => self.parse_output(),
            _ => Err(self.unexpected("'input', 'let' or 'output'")),
        }
    }

    fn declare(&mut self, name: String, id: NodeId) -> LowerResult<()> {
        if self.symbols.contains_key(&name) {
            return Err(LowerError::parse_error(format!("`{}` is already defined", name)));
        }
        self.symbols.insert(name, id);
        Ok(())
    }

    /// `input A: f32[4, 8];` or `input s: f32;`
    fn parse_input(&mut self) -> LowerResult<()> {
        self.expect(Token::Input)?;
        let name = self.expect_ident()?;
        self.expect(Token::Colon)?;
        let dtype = self.parse_dtype()?;
        let id = if self.check(&Token::LBracket) {
            self.advance()?;
            let mut shape = vec![self.expect_extent()?];
            while self.check(&Token::Comma) {
                self.advance()?;
                shape.push(self.expect_extent()?);
            }
            self.expect(Token::RBracket)?;
            self.graph.tensor_input(name.clone(), dtype, &shape)
        } else {
            self.graph.scalar_input(name.clone(), dtype)
        };
        self.expect(Token::Semicolon)?;
        self.declare(name, id)?;
        self.inputs.push(id);
        Ok(())
    }

    /// `let C = grid[..] => ..;` or `let s = sum[..] => ..;`
    fn parse_let(&mut self) -> LowerResult<()> {
        self.expect(Token::Let)?;
        let name = self.expect_ident()?;
        self.expect(Token::Equals)?;
        self.binding = name.clone();
        self.reductions = 0;

        let id = if self.check(&Token::Grid) {
            self.parse_grid(&name)?
        } else if self.at_reduction() {
            self.parse_reduction(Some(name.clone()))?
        } else {
            return Err(self.unexpected("'grid' or a reduction"));
        };
        self.expect(Token::Semicolon)?;
        self.declare(name.clone(), id)?;
        self.bindings.push((name, id));
        Ok(())
    }

    /// `output C, best;`
    fn parse_output(&mut self) -> LowerResult<()> {
        self.expect(Token::Output)?;
        loop {
            let name = self.expect_ident()?;
            let id = *self
                .symbols
                .get(&name)
                .ok_or_else(|| LowerError::parse_error(format!("Unknown output: {}", name)))?;
            self.outputs.push(id);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(Token::Semicolon)
    }

    /// `[i: 4, j: 8]`
    fn parse_axes(&mut self) -> LowerResult<Vec<(String, usize)>> {
        self.expect(Token::LBracket)?;
        let mut axes = Vec::new();
        loop {
            let name = self.expect_ident()?;
            self.expect(Token::Colon)?;
            axes.push((name, self.expect_extent()?));
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance()?;
        }
        self.expect(Token::RBracket)?;
        Ok(axes)
    }

    /// Parse `=> body` with `axes` in scope
    fn parse_body(&mut self, axes: &[(String, usize)]) -> LowerResult<(Vec<Var>, Expr)> {
        self.expect(Token::FatArrow)?;
        let vars: Vec<Var> = axes.iter().map(|(name, _)| self.graph.new_axis(name.clone())).collect();
        let depth = self.axes.len();
        self.axes
            .extend(axes.iter().map(|(name, _)| name.clone()).zip(vars.iter().cloned()));
        let body = self.parse_expr();
        self.axes.truncate(depth);
        Ok((vars, body?))
    }

    fn parse_grid(&mut self, name: &str) -> LowerResult<NodeId> {
        self.expect(Token::Grid)?;
        let axes = self.parse_axes()?;
        let shape: Vec<usize> = axes.iter().map(|(_, extent)| *extent).collect();
        let (vars, value) = self.parse_body(&axes)?;
        self.graph.add_grid(name, &shape, vars, value)
    }

    /// Current token names a reduction and is followed by `[` or `<`
    fn at_reduction(&mut self) -> bool {
        let is_op = matches!(&self.current, Some(Token::Ident(name)) if ReduceOp::from_name(name).is_some());
        is_op && (self.check_next(&Token::LBracket) || self.check_next(&Token::Lt))
    }

    /// `sum[k: 8] => ..` or `argmax<i64>[k: 4] => ..`
    fn parse_reduction(&mut self, name: Option<String>) -> LowerResult<NodeId> {
        let op_name = self.expect_ident()?;
        let op = ReduceOp::from_name(&op_name)
            .ok_or_else(|| LowerError::parse_error(format!("Unknown reduction: {}", op_name)))?;

        let index_dtype = if self.check(&Token::Lt) {
            if !op.is_arg() {
                return Err(LowerError::parse_error(format!(
                    "`{}` does not take an index type",
                    op
                )));
            }
            self.advance()?;
            let dtype = self.parse_dtype()?;
            self.expect(Token::Gt)?;
            dtype
        } else {
            ScalarType::I32
        };

        let axes = self.parse_axes()?;
        let name = name.unwrap_or_else(|| format!("{}_{}{}", self.binding, op.name(), self.reductions));
        self.reductions += 1;
        let shape: Vec<usize> = axes.iter().map(|(_, extent)| *extent).collect();
        let (mut vars, value) = self.parse_body(&axes)?;

        if op.is_arg() {
            let (Some(axis), [extent]) = (vars.pop(), shape.as_slice()) else {
                return Err(LowerError::parse_error(format!(
                    "`{}` reduces exactly one axis, got {}",
                    op,
                    shape.len()
                )));
            };
            self.graph
                .add_arg_reduce(name, *extent, axis, value, op, index_dtype)
        } else {
            self.graph.add_reduce(name, &shape, vars, value, op)
        }
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> LowerResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> LowerResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(&Token::OrOr) {
            self.advance()?;
            let right = self.parse_and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> LowerResult<Expr> {
        let mut left = self.parse_comparison()?;
        while self.check(&Token::AndAnd) {
            self.advance()?;
            let right = self.parse_comparison()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    /// Comparisons do not chain
    fn parse_comparison(&mut self) -> LowerResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.current {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance()?;
        let right = self.parse_additive()?;
        Ok(Expr::binary(op, left, right))
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> LowerResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.current {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_multiplicative()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse multiplicative expressions: a * b, a / b, a % b
    fn parse_multiplicative(&mut self) -> LowerResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    /// Parse unary expressions: -a, !a
    fn parse_unary(&mut self) -> LowerResult<Expr> {
        let op = match self.current {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Bang) => UnaryOp::Not,
            _ => return self.parse_primary(),
        };
        self.advance()?;
        Ok(Expr::unary(op, self.parse_unary()?))
    }

    /// Literals, names, tensor elements, reductions, casts and min/max calls
    fn parse_primary(&mut self) -> LowerResult<Expr> {
        match self.current.clone() {
            Some(Token::Int(n)) => {
                self.advance()?;
                Ok(Expr::int(n))
            }
            Some(Token::Float(x)) => {
                self.advance()?;
                Ok(Expr::float(x))
            }
            Some(Token::LParen) => {
                self.advance()?;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.at_reduction() {
                    return Ok(Expr::Node(self.parse_reduction(None)?));
                }
                if self.check_next(&Token::LParen) {
                    return self.parse_call(&name);
                }
                self.advance()?;
                self.parse_name(&name)
            }
            Some(Token::Grid) => Err(LowerError::parse_error(
                "grid is only allowed at the top of a let binding",
            )),
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `max(a, b)`, `min(a, b)` or a cast such as `f32(x)`
    fn parse_call(&mut self, name: &str) -> LowerResult<Expr> {
        self.advance()?;
        self.expect(Token::LParen)?;
        let mut args = vec![self.parse_expr()?];
        while self.check(&Token::Comma) {
            self.advance()?;
            args.push(self.parse_expr()?);
        }
        self.expect(Token::RParen)?;

        match (name, args.as_slice()) {
            ("max", [lhs, rhs]) => Ok(Expr::max(lhs.clone(), rhs.clone())),
            ("min", [lhs, rhs]) => Ok(Expr::min(lhs.clone(), rhs.clone())),
            (_, [arg]) => match ScalarType::from_name(name) {
                Some(dtype) => Ok(Expr::cast(arg.clone(), Type::Scalar(dtype))),
                None => Err(LowerError::parse_error(format!("Unknown function: {}", name))),
            },
            _ => Err(LowerError::parse_error(format!(
                "Unknown function: {} with {} argument(s)",
                name,
                args.len()
            ))),
        }
    }

    /// Axis, scalar node, or tensor element `A[i, j]`
    fn parse_name(&mut self, name: &str) -> LowerResult<Expr> {
        if let Some((_, var)) = self.axes.iter().rev().find(|(axis, _)| axis == name) {
            return Ok(Expr::Var(var.clone()));
        }
        let id = *self
            .symbols
            .get(name)
            .ok_or_else(|| LowerError::parse_error(format!("Unknown name: {}", name)))?;
        let is_tensor = matches!(self.graph.node(id)?.kind, NodeKind::Tensor { .. });

        if !self.check(&Token::LBracket) {
            if is_tensor {
                return Err(LowerError::parse_error(format!(
                    "tensor `{}` must be indexed",
                    name
                )));
            }
            return Ok(Expr::Node(id));
        }
        if !is_tensor {
            return Err(LowerError::parse_error(format!("scalar `{}` cannot be indexed", name)));
        }
        self.advance()?;
        let mut indices = vec![self.parse_expr()?];
        while self.check(&Token::Comma) {
            self.advance()?;
            indices.push(self.parse_expr()?);
        }
        self.expect(Token::RBracket)?;
        Ok(Expr::element(Expr::Node(id), indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Compute;

    const MATMUL: &str = "
        input A: f32[4, 8];
        input B: f32[8, 4];
        let C = grid[i: 4, j: 4] => sum[k: 8] => A[i, k] * B[k, j];
    ";

    #[test]
    fn test_parse_matmul() {
        let program = parse(MATMUL).unwrap();
        assert_eq!(program.inputs.len(), 2);
        assert_eq!(program.bindings.len(), 1);
        // A, B, the inner reduction and C
        assert_eq!(program.graph.len(), 4);

        let c = program.lookup("C").unwrap();
        let node = program.graph.node(c).unwrap();
        if let Some(Compute::Grid(grid)) = &node.compute {
            assert_eq!(grid.shape, vec![4, 4]);
            assert!(matches!(grid.value, Expr::Node(_)));
        } else {
            panic!("Expected grid compute");
        }

        let task = program.task("matmul").unwrap();
        assert_eq!(task.outputs, vec![c]);
    }

    #[test]
    fn test_nested_reduction_name() {
        let program = parse(MATMUL).unwrap();
        let names: Vec<&str> = program.graph.iter().map(|(_, n)| n.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C_sum0", "C"]);
    }

    #[test]
    fn test_parse_arg_reduce() {
        let program = parse(
            "input x: f32[4];
             let best = argmax<i64>[k: 4] => x[k];
             output best;",
        )
        .unwrap();
        let best = program.lookup("best").unwrap();
        let node = program.graph.node(best).unwrap();
        assert_eq!(node.kind, NodeKind::Scalar { dtype: ScalarType::I64 });
        assert!(matches!(node.compute, Some(Compute::ArgReduce(_))));
        assert_eq!(program.outputs, vec![best]);
    }

    #[test]
    fn test_parse_precedence() {
        let program = parse(
            "input x: f32[4];
             let y = grid[i: 4] => -x[i] + 2.0 * x[i] > max(x[i], 1.0) && !(x[i] == 0.5);",
        )
        .unwrap();
        let y = program.lookup("y").unwrap();
        let Some(Compute::Grid(grid)) = &program.graph.node(y).unwrap().compute else {
            panic!("Expected grid compute");
        };
        assert!(matches!(grid.value, Expr::Binary { op: BinaryOp::And, .. }));
        assert_eq!(program.graph.node(y).unwrap().kind.dtype(), ScalarType::Bool);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("let x = 3;"), Err(LowerError::ParseError { .. })));
        assert!(matches!(
            parse("input A: f32[4]; let y = grid[i: 4] => A;"),
            Err(LowerError::ParseError { .. })
        ));
        assert!(matches!(
            parse("input A: f32[4]; let y = grid[i: 4] => B[i];"),
            Err(LowerError::ParseError { .. })
        ));
        assert!(matches!(
            parse("input A: f32[4]; input A: f32[2];"),
            Err(LowerError::ParseError { .. })
        ));
        assert!(matches!(
            parse("input x: f32[4]; let s = sum<i32>[k: 4] => x[k];"),
            Err(LowerError::ParseError { .. })
        ));
        assert!(matches!(
            parse("input x: f32[2, 2]; let s = argmin[a: 2, b: 2] => x[a, b];"),
            Err(LowerError::ParseError { .. })
        ));
        assert!(matches!(parse("input $"), Err(LowerError::LexerError { position: 6, .. })));
    }

    #[test]
    fn test_axes_are_scoped() {
        let err = parse(
            "input A: f32[4, 4];
             let r = grid[i: 4] => (sum[k: 4] => A[i, k]) + A[i, k];",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown name: k"));
    }

    #[test]
    fn test_task_without_bindings() {
        let program = parse("input A: f32[4];").unwrap();
        assert!(program.task("empty").is_err());
    }
}
