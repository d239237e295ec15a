//! Synthesized GPU device functions
//!
//! Every intrinsic is a small device function wrapping one inline-assembly
//! statement. They are registered once into a [`FunctionRegistry`] and used by
//! building a call expression to their registered name.

pub mod cp_async;
pub mod ldmatrix;
pub mod mma;
pub mod registry;

pub use cp_async::{
    cp_async, cp_async_commit_group, cp_async_wait_all, cp_async_wait_group, cvta_generic_to_shared,
    CacheLevel, CpAsyncVariant,
};
pub use ldmatrix::{ldmatrix, LdMatrixVariant};
pub use mma::{mma_sync, MmaConfig};
pub use registry::{call_cuda, FunctionRegistry, CUDA_PREFIX};

use tracing::debug;

use crate::error::LowerResult;

/// Intrinsic families, as listed by the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    CpAsync,
    Pipeline,
    Mma,
    LdMatrix,
}

impl Family {
    /// Family a registered function belongs to; `None` for helpers
    pub fn of(name: &str) -> Option<Family> {
        let name = name.strip_prefix(CUDA_PREFIX)?;
        if name.starts_with("cp_async_size_") {
            Some(Family::CpAsync)
        } else if name.starts_with("cp_async_") {
            Some(Family::Pipeline)
        } else if name.starts_with("mma_") {
            Some(Family::Mma)
        } else if name.starts_with("ldmatrix_") {
            Some(Family::LdMatrix)
        } else {
            None
        }
    }
}

/// Register every built-in intrinsic into `registry`
pub fn register_all(registry: &mut FunctionRegistry) -> LowerResult<()> {
    cp_async::register_cvta(registry)?;
    cp_async::register_cp_async(registry)?;
    cp_async::register_cp_async_commit_group(registry)?;
    cp_async::register_cp_async_wait_group(registry)?;
    cp_async::register_cp_async_wait_all(registry)?;
    mma::register_mma(registry)?;
    ldmatrix::register_ldmatrix(registry)?;
    debug!(total = registry.len(), "intrinsic registration complete");
    Ok(())
}
