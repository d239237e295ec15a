//! Process-wide symbol table of synthesized device functions
//!
//! Functions are registered once under their generated name and looked up by
//! name when a call expression is constructed. The global instance is filled
//! by a single `register_all` pass the first time it is requested.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use tracing::{debug, trace};

use crate::error::{LowerError, LowerResult};
use crate::ir::{Expr, Function};

/// Prefix shared by every synthesized device function
pub const CUDA_PREFIX: &str = "cuda_";

/// Name-keyed table of device functions
#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Function>,
}

static GLOBAL_REGISTRY: OnceLock<FunctionRegistry> = OnceLock::new();

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in intrinsic
    pub fn with_builtins() -> LowerResult<Self> {
        let mut registry = Self::new();
        super::register_all(&mut registry)?;
        debug!(functions = registry.len(), "registered builtin intrinsics");
        Ok(registry)
    }

    /// The global registry, populated on first use
    pub fn global() -> LowerResult<&'static FunctionRegistry> {
        if let Some(registry) = GLOBAL_REGISTRY.get() {
            return Ok(registry);
        }
        let registry = Self::with_builtins()?;
        Ok(GLOBAL_REGISTRY.get_or_init(|| registry))
    }

    /// Add `function` under its own name; names are written once
    pub fn register(&mut self, function: Function) -> LowerResult<()> {
        if self.functions.contains_key(&function.name) {
            return Err(LowerError::duplicate(function.name));
        }
        trace!(name = %function.name, "registering device function");
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn lookup(&self, name: &str) -> LowerResult<&Function> {
        self.get(name)
            .ok_or_else(|| LowerError::unknown_function(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }
}

/// Call `cuda_{name}`, which must already be registered with a matching arity
pub fn call_cuda(registry: &FunctionRegistry, name: &str, args: Vec<Expr>) -> LowerResult<Expr> {
    let func_name = format!("{}{}", CUDA_PREFIX, name);
    let function = registry.lookup(&func_name)?;
    if function.params.len() != args.len() {
        return Err(LowerError::invalid_param(format!(
            "`{}` takes {} argument(s), got {}",
            func_name,
            function.params.len(),
            args.len()
        )));
    }
    Ok(Expr::call(func_name, args))
}
