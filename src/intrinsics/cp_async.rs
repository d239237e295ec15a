//! Asynchronous global-to-shared copies (`cp.async`)
//!
//! Copies are issued without blocking. `commit_group` closes every copy issued
//! since the previous commit into one pending group, `wait_group(n)` blocks
//! until at most `n` groups are pending and `wait_all` until none are.
//!
//! When the source byte count passed to a copy is smaller than the copy size
//! the hardware fills the rest of the destination with zeros.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::registry::{call_cuda, FunctionRegistry, CUDA_PREFIX};
use crate::builder::FunctionBuilder;
use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::ir::{AsmOperand, AsmStmt, Expr, FunctionKind, Stmt, Type};

/// Legal copy sizes in bytes
pub const CP_ASYNC_SIZES: [usize; 3] = [4, 8, 16];

/// Legal L2 prefetch sizes in bytes; 0 disables the hint
pub const PREFETCH_BYTES: [usize; 4] = [0, 64, 128, 256];

/// `wait_group(n)` accepts `n` in `0..MAX_WAIT_GROUPS`
pub const MAX_WAIT_GROUPS: usize = 10;

const CVTA_NAME: &str = "cvta_generic_to_shared";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    /// Cache in L1 and L2 (`.ca`)
    Always,
    /// Cache in L2 only (`.cg`)
    Global,
}

impl CacheLevel {
    pub fn suffix(self) -> &'static str {
        match self {
            CacheLevel::Always => "ca",
            CacheLevel::Global => "cg",
        }
    }

    pub fn from_name(name: &str) -> LowerResult<Self> {
        match name {
            "always" => Ok(CacheLevel::Always),
            "global" => Ok(CacheLevel::Global),
            other => Err(LowerError::invalid_param(format!(
                "cache level candidates: [always, global], got {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLevel::Always => write!(f, "always"),
            CacheLevel::Global => write!(f, "global"),
        }
    }
}

/// One legal (size, cache level, prefetch) combination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpAsyncVariant {
    pub cp_size: usize,
    pub cache_level: CacheLevel,
    pub prefetch_bytes: usize,
}

impl CpAsyncVariant {
    pub fn new(cp_size: usize, cache_level: CacheLevel, prefetch_bytes: usize) -> LowerResult<Self> {
        if !CP_ASYNC_SIZES.contains(&cp_size) {
            return Err(LowerError::invalid_param(format!(
                "cp_size must be either 4, 8, or 16, got {}",
                cp_size
            )));
        }
        if !PREFETCH_BYTES.contains(&prefetch_bytes) {
            return Err(LowerError::invalid_param(format!(
                "prefetch_bytes must be either 0, 64, 128 or 256, got {}",
                prefetch_bytes
            )));
        }
        if cache_level == CacheLevel::Global && cp_size != 16 {
            return Err(LowerError::invalid_param(format!(
                "cache level global requires cp_size 16, got {}",
                cp_size
            )));
        }
        Ok(Self {
            cp_size,
            cache_level,
            prefetch_bytes,
        })
    }

    /// Every legal variant, in registration order
    pub fn all() -> Vec<Self> {
        let mut variants = Vec::new();
        for cp_size in CP_ASYNC_SIZES {
            for prefetch_bytes in PREFETCH_BYTES {
                for cache_level in [CacheLevel::Always, CacheLevel::Global] {
                    if let Ok(variant) = Self::new(cp_size, cache_level, prefetch_bytes) {
                        variants.push(variant);
                    }
                }
            }
        }
        variants
    }

    /// Name without the `cuda_` prefix, e.g. `cp_async_size_16_cg_l2_128B`
    pub fn name(&self) -> String {
        let prefetch = if self.prefetch_bytes > 0 {
            format!("_l2_{}B", self.prefetch_bytes)
        } else {
            String::new()
        };
        format!(
            "cp_async_size_{}_{}{}",
            self.cp_size,
            self.cache_level.suffix(),
            prefetch
        )
    }

    pub fn func_name(&self) -> String {
        format!("{}{}", CUDA_PREFIX, self.name())
    }

    /// `%0` shared address, `%1` global address, `%2` copy size, `%3` source size
    pub fn template(&self) -> String {
        let prefetch = if self.prefetch_bytes > 0 {
            format!(".L2::{}B", self.prefetch_bytes)
        } else {
            String::new()
        };
        format!(
            "cp.async.{}.shared.global{} [%0], [%1], %2, %3;",
            self.cache_level.suffix(),
            prefetch
        )
    }
}

/// `cuda_cvta_generic_to_shared`: generic pointer to 32-bit shared address
pub fn register_cvta(registry: &mut FunctionRegistry) -> LowerResult<()> {
    let mut fb = FunctionBuilder::new(format!("{}{}", CUDA_PREFIX, CVTA_NAME), FunctionKind::CudaDevice)
        .with_ret_type(Type::Scalar(ScalarType::U32));
    let ptr = fb.param("ptr", Type::void_pointer());
    let addr = fb.local("addr", Type::Scalar(ScalarType::U32));
    fb.append(Stmt::Asm(AsmStmt {
        template: "{ .reg .u64 smem_ptr; cvta.to.shared.u64 smem_ptr, %1; cvt.u32.u64 %0, smem_ptr; }"
            .to_string(),
        outputs: vec![AsmOperand::new("=r", Expr::from(&addr))],
        inputs: vec![AsmOperand::new("l", ptr.into())],
        is_volatile: false,
    }));
    fb.append(Stmt::Return(addr.into()));
    registry.register(fb.finish()?)
}

/// Shared-window address of a generic pointer
pub fn cvta_generic_to_shared(registry: &FunctionRegistry, ptr: Expr) -> LowerResult<Expr> {
    call_cuda(registry, CVTA_NAME, vec![ptr])
}

pub fn register_cp_async(registry: &mut FunctionRegistry) -> LowerResult<()> {
    let cvta = format!("{}{}", CUDA_PREFIX, CVTA_NAME);
    registry.lookup(&cvta)?;
    let variants = CpAsyncVariant::all();
    for variant in &variants {
        let mut fb = FunctionBuilder::new(variant.func_name(), FunctionKind::CudaDevice);
        let dst = fb.param("dst", Type::void_pointer());
        let src = fb.param("src", Type::void_pointer());
        let src_size = fb.param("src_size", Type::Scalar(ScalarType::I32));
        let smem = fb.fresh_var("dst_smem_ptr", Type::Scalar(ScalarType::U32));
        fb.append(Stmt::declare(&smem, Some(Expr::call(cvta.clone(), vec![dst.into()]))));
        fb.append(Stmt::Asm(AsmStmt {
            template: variant.template(),
            outputs: vec![],
            inputs: vec![
                AsmOperand::new("r", smem.into()),
                AsmOperand::new("l", src.into()),
                AsmOperand::new("n", Expr::int(variant.cp_size as i64)),
                AsmOperand::new("r", src_size.into()),
            ],
            is_volatile: true,
        }));
        registry.register(fb.finish()?)?;
    }
    debug!(variants = variants.len(), "registered cp.async variants");
    Ok(())
}

pub fn register_cp_async_commit_group(registry: &mut FunctionRegistry) -> LowerResult<()> {
    let mut fb = FunctionBuilder::new(
        format!("{}cp_async_commit_group", CUDA_PREFIX),
        FunctionKind::CudaDevice,
    );
    fb.append(asm_only("cp.async.commit_group;"));
    registry.register(fb.finish()?)
}

pub fn register_cp_async_wait_group(registry: &mut FunctionRegistry) -> LowerResult<()> {
    for groups in 0..MAX_WAIT_GROUPS {
        let mut fb = FunctionBuilder::new(
            format!("{}cp_async_wait_group_{}", CUDA_PREFIX, groups),
            FunctionKind::CudaDevice,
        );
        fb.append(asm_only(&format!("cp.async.wait_group {};", groups)));
        registry.register(fb.finish()?)?;
    }
    Ok(())
}

pub fn register_cp_async_wait_all(registry: &mut FunctionRegistry) -> LowerResult<()> {
    let mut fb = FunctionBuilder::new(
        format!("{}cp_async_wait_all", CUDA_PREFIX),
        FunctionKind::CudaDevice,
    );
    fb.append(asm_only("cp.async.wait_all;"));
    registry.register(fb.finish()?)
}

fn asm_only(template: &str) -> Stmt {
    Stmt::Asm(AsmStmt {
        template: template.to_string(),
        outputs: vec![],
        inputs: vec![],
        is_volatile: true,
    })
}

/// Copy `cp_size` bytes from global `src` to shared `dst` asynchronously.
///
/// `src_size` defaults to `cp_size`; a smaller value zero-fills the tail.
pub fn cp_async(
    registry: &FunctionRegistry,
    dst: Expr,
    src: Expr,
    cp_size: usize,
    src_size: Option<Expr>,
    cache_level: CacheLevel,
    prefetch_bytes: usize,
) -> LowerResult<Expr> {
    let variant = CpAsyncVariant::new(cp_size, cache_level, prefetch_bytes)?;
    if let Some(size) = src_size.as_ref().and_then(Expr::as_const_int) {
        if size < 0 || size as usize > cp_size {
            return Err(LowerError::invalid_param(format!(
                "src_size must be within 0..={}, got {}",
                cp_size, size
            )));
        }
    }
    let src_size = src_size.unwrap_or_else(|| Expr::int(cp_size as i64));
    call_cuda(registry, &variant.name(), vec![dst, src, src_size])
}

/// Close all copies issued since the last commit into one group
pub fn cp_async_commit_group(registry: &FunctionRegistry) -> LowerResult<Expr> {
    call_cuda(registry, "cp_async_commit_group", vec![])
}

/// Block until at most `n` committed groups are still pending
pub fn cp_async_wait_group(registry: &FunctionRegistry, n: usize) -> LowerResult<Expr> {
    if n >= MAX_WAIT_GROUPS {
        return Err(LowerError::invalid_param(format!(
            "wait_group count must be in [0, {}), got {}",
            MAX_WAIT_GROUPS, n
        )));
    }
    call_cuda(registry, &format!("cp_async_wait_group_{}", n), vec![])
}

/// Block until every prior copy has completed
pub fn cp_async_wait_all(registry: &FunctionRegistry) -> LowerResult<Expr> {
    call_cuda(registry, "cp_async_wait_all", vec![])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> FunctionRegistry {
        FunctionRegistry::with_builtins().unwrap()
    }

    #[test]
    fn test_variant_validation() {
        assert!(CpAsyncVariant::new(16, CacheLevel::Global, 0).is_ok());
        assert!(CpAsyncVariant::new(8, CacheLevel::Global, 0).is_err());
        assert!(CpAsyncVariant::new(4, CacheLevel::Always, 100).is_err());
        assert!(CpAsyncVariant::new(2, CacheLevel::Always, 0).is_err());
        assert!(CacheLevel::from_name("streaming").is_err());
    }

    #[test]
    fn test_variant_space() {
        let variants = CpAsyncVariant::all();
        // 3 sizes x 4 prefetch with .ca, plus 4 prefetch with .cg for size 16
        assert_eq!(variants.len(), 16);
        assert!(variants
            .iter()
            .all(|v| v.cache_level == CacheLevel::Always || v.cp_size == 16));
    }

    #[test]
    fn test_names_and_template() {
        let v = CpAsyncVariant::new(16, CacheLevel::Global, 128).unwrap();
        assert_eq!(v.func_name(), "cuda_cp_async_size_16_cg_l2_128B");
        assert_eq!(
            v.template(),
            "cp.async.cg.shared.global.L2::128B [%0], [%1], %2, %3;"
        );
        let v = CpAsyncVariant::new(4, CacheLevel::Always, 0).unwrap();
        assert_eq!(v.name(), "cp_async_size_4_ca");
        assert_eq!(v.template(), "cp.async.ca.shared.global [%0], [%1], %2, %3;");
    }

    #[test]
    fn test_cp_async_call_defaults_src_size() {
        let registry = registry();
        let dst = Expr::int(0);
        let src = Expr::int(1);
        let call = cp_async(&registry, dst.clone(), src.clone(), 8, None, CacheLevel::Always, 64).unwrap();
        assert_eq!(
            call,
            Expr::call("cuda_cp_async_size_8_ca_l2_64B", vec![dst, src, Expr::int(8)])
        );
    }

    #[test]
    fn test_cp_async_call_validation() {
        let registry = registry();
        let call = |size, level, prefetch, src_size| {
            cp_async(&registry, Expr::int(0), Expr::int(0), size, src_size, level, prefetch)
        };
        assert!(call(16, CacheLevel::Global, 0, None).is_ok());
        assert!(call(8, CacheLevel::Global, 0, None).is_err());
        assert!(call(4, CacheLevel::Always, 100, None).is_err());
        assert!(call(4, CacheLevel::Always, 0, Some(Expr::int(8))).is_err());
        assert!(call(16, CacheLevel::Always, 0, Some(Expr::int(3))).is_ok());
    }

    #[test]
    fn test_wait_group_bounds() {
        let registry = registry();
        assert_eq!(
            cp_async_wait_group(&registry, 0).unwrap(),
            Expr::call("cuda_cp_async_wait_group_0", vec![])
        );
        assert!(cp_async_wait_group(&registry, 9).is_ok());
        assert!(matches!(
            cp_async_wait_group(&registry, 10),
            Err(LowerError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_cvta_returns_address() {
        let registry = registry();
        let func = registry.lookup("cuda_cvta_generic_to_shared").unwrap();
        assert_eq!(func.ret_type, Type::Scalar(ScalarType::U32));
        let Stmt::Seq(stmts) = &func.body else {
            panic!("Expected sequence");
        };
        let Stmt::Asm(asm) = &stmts[0] else {
            panic!("Expected asm");
        };
        assert_eq!(stmts[1], Stmt::Return(asm.outputs[0].value.clone()));
        assert!(func.to_string().contains("  return addr;\n"));
    }

    #[test]
    fn test_wait_group_body() {
        let registry = registry();
        let func = registry.lookup("cuda_cp_async_wait_group_3").unwrap();
        let Stmt::Asm(asm) = &func.body else {
            panic!("Expected asm body");
        };
        assert_eq!(asm.template, "cp.async.wait_group 3;");
    }

    #[test]
    fn test_copy_body_operands() {
        let registry = registry();
        let func = registry.lookup("cuda_cp_async_size_16_ca").unwrap();
        assert_eq!(func.params.len(), 3);
        let Stmt::Seq(stmts) = &func.body else {
            panic!("Expected sequence");
        };
        let Stmt::Asm(asm) = &stmts[1] else {
            panic!("Expected asm");
        };
        let constraints: Vec<&str> = asm.inputs.iter().map(|o| o.constraint.as_str()).collect();
        assert_eq!(constraints, vec!["r", "l", "n", "r"]);
        assert_eq!(asm.inputs[2].value, Expr::int(16));
        assert!(asm.outputs.is_empty());
    }
}
