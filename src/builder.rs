//! Incremental statement and function construction
//!
//! `StmtBuilder` keeps a stack of open scopes (`for` bodies, `if` branches)
//! so recursive lowering can append statements at the current nesting level.

use crate::error::{LowerError, LowerResult};
use crate::ir::{Expr, Function, FunctionKind, Stmt, Type, Var};

#[derive(Debug)]
enum ScopeKind {
    Root,
    For { var: Var, extent: Expr },
    If { cond: Expr },
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    stmts: Vec<Stmt>,
}

/// Builds a statement tree through nested scopes
#[derive(Debug)]
pub struct StmtBuilder {
    scopes: Vec<Scope>,
}

impl StmtBuilder {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                kind: ScopeKind::Root,
                stmts: Vec::new(),
            }],
        }
    }

    /// Append a statement to the innermost open scope
    pub fn append(&mut self, stmt: Stmt) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.stmts.push(stmt);
        }
    }

    /// Open a `for var in 0..extent` body
    pub fn enter_for(&mut self, var: Var, extent: Expr) {
        self.scopes.push(Scope {
            kind: ScopeKind::For { var, extent },
            stmts: Vec::new(),
        });
    }

    /// Open an `if cond` body
    pub fn enter_if(&mut self, cond: Expr) {
        self.scopes.push(Scope {
            kind: ScopeKind::If { cond },
            stmts: Vec::new(),
        });
    }

    /// Close the innermost scope and append it to its parent
    pub fn exit_body(&mut self) -> LowerResult<()> {
        if self.scopes.len() <= 1 {
            return Err(LowerError::invalid_ir("exit_body called without an open scope"));
        }
        let Some(scope) = self.scopes.pop() else {
            return Err(LowerError::invalid_ir("statement builder has no root scope"));
        };
        let body = Box::new(Stmt::from_stmts(scope.stmts));
        let stmt = match scope.kind {
            ScopeKind::For { var, extent } => Stmt::For { var, extent, body },
            ScopeKind::If { cond } => Stmt::If {
                cond,
                then_body: body,
                else_body: None,
            },
            ScopeKind::Root => {
                return Err(LowerError::invalid_ir("cannot exit the root scope"));
            }
        };
        self.append(stmt);
        Ok(())
    }

    /// Run `body` inside an `if cond` scope
    pub fn if_then<F>(&mut self, cond: Expr, body: F) -> LowerResult<()>
    where
        F: FnOnce(&mut Self) -> LowerResult<()>,
    {
        self.enter_if(cond);
        body(self)?;
        self.exit_body()
    }

    /// Number of scopes still open below the root
    pub fn depth(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }

    /// Finish building; every opened scope must have been closed
    pub fn finish(mut self) -> LowerResult<Stmt> {
        if self.scopes.len() != 1 {
            return Err(LowerError::invalid_ir(format!(
                "{} scope(s) left open when finishing statement builder",
                self.depth()
            )));
        }
        match self.scopes.pop() {
            Some(root) => Ok(Stmt::from_stmts(root.stmts)),
            None => Err(LowerError::invalid_ir("statement builder has no root scope")),
        }
    }
}

impl Default for StmtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::AddAssign<Stmt> for StmtBuilder {
    fn add_assign(&mut self, stmt: Stmt) {
        self.append(stmt);
    }
}

/// Builds a `Function`; variable ids are local to the function
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    kind: FunctionKind,
    ret_type: Type,
    params: Vec<Var>,
    local_vars: Vec<Var>,
    next_var: u32,
    pub body: StmtBuilder,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, kind: FunctionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ret_type: Type::Void,
            params: Vec::new(),
            local_vars: Vec::new(),
            next_var: 0,
            body: StmtBuilder::new(),
        }
    }

    pub fn with_ret_type(mut self, ret_type: Type) -> Self {
        self.ret_type = ret_type;
        self
    }

    /// Create a variable without attaching it to the signature or locals
    pub fn fresh_var(&mut self, hint: impl Into<String>, ty: Type) -> Var {
        let var = Var::new(self.next_var, hint, ty);
        self.next_var += 1;
        var
    }

    pub fn param(&mut self, hint: impl Into<String>, ty: Type) -> Var {
        let var = self.fresh_var(hint, ty);
        self.params.push(var.clone());
        var
    }

    pub fn local(&mut self, hint: impl Into<String>, ty: Type) -> Var {
        let var = self.fresh_var(hint, ty);
        self.local_vars.push(var.clone());
        var
    }

    pub fn append(&mut self, stmt: Stmt) {
        self.body.append(stmt);
    }

    pub fn finish(self) -> LowerResult<Function> {
        Ok(Function {
            name: self.name,
            kind: self.kind,
            params: self.params,
            local_vars: self.local_vars,
            body: self.body.finish()?,
            ret_type: self.ret_type,
        })
    }
}
