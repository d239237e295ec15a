//! Warp-cooperative 8x8 matrix loads from shared memory (`ldmatrix`)

use tracing::trace;

use super::registry::{call_cuda, FunctionRegistry, CUDA_PREFIX};
use crate::builder::FunctionBuilder;
use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::ir::{AsmOperand, AsmStmt, Expr, FunctionKind, Stmt, Type};

/// Legal matrix counts per instruction
pub const LDMATRIX_COUNTS: [usize; 3] = [1, 2, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LdMatrixVariant {
    pub num: usize,
    /// Address operand is already a 32-bit shared-window address
    pub shared_space_addr: bool,
    pub trans: bool,
}

impl LdMatrixVariant {
    pub fn new(num: usize, shared_space_addr: bool, trans: bool) -> LowerResult<Self> {
        if !LDMATRIX_COUNTS.contains(&num) {
            return Err(LowerError::invalid_param(format!(
                "ldmatrix loads 1, 2, or 4 matrices, got {}",
                num
            )));
        }
        Ok(Self {
            num,
            shared_space_addr,
            trans,
        })
    }

    pub fn all() -> Vec<Self> {
        let mut variants = Vec::new();
        for num in LDMATRIX_COUNTS {
            for trans in [false, true] {
                for shared_space_addr in [false, true] {
                    variants.push(Self {
                        num,
                        shared_space_addr,
                        trans,
                    });
                }
            }
        }
        variants
    }

    pub fn name(&self) -> String {
        format!(
            "ldmatrix_x{}{}{}",
            self.num,
            if self.shared_space_addr { "_shared" } else { "" },
            if self.trans { "_trans" } else { "" }
        )
    }

    pub fn func_name(&self) -> String {
        format!("{}{}", CUDA_PREFIX, self.name())
    }

    pub fn inst_name(&self) -> String {
        format!(
            "ldmatrix.sync.aligned.m8n8.x{}{}{}.b16",
            self.num,
            if self.trans { ".trans" } else { "" },
            if self.shared_space_addr { ".shared" } else { "" }
        )
    }

    /// `{%0, ..}, [%num];`
    pub fn template(&self) -> String {
        let regs: Vec<String> = (0..self.num).map(|i| format!("%{}", i)).collect();
        format!("{} {{{}}}, [%{}];", self.inst_name(), regs.join(", "), self.num)
    }
}

pub fn register_ldmatrix(registry: &mut FunctionRegistry) -> LowerResult<()> {
    for variant in LdMatrixVariant::all() {
        let mut fb = FunctionBuilder::new(variant.func_name(), FunctionKind::CudaDevice);
        let regs: Vec<_> = (0..variant.num)
            .map(|i| fb.param(format!("reg{}", i), Type::reference(Type::Scalar(ScalarType::U32))))
            .collect();
        let (smem_type, constraint) = if variant.shared_space_addr {
            (Type::Scalar(ScalarType::U32), "r")
        } else {
            (Type::void_pointer(), "l")
        };
        let smem = fb.param("smem", smem_type);
        fb.append(Stmt::Asm(AsmStmt {
            template: variant.template(),
            outputs: regs.iter().map(|r| AsmOperand::new("=r", r.into())).collect(),
            inputs: vec![AsmOperand::new(constraint, smem.into())],
            is_volatile: false,
        }));
        trace!(name = %variant.func_name(), "synthesized ldmatrix");
        registry.register(fb.finish()?)?;
    }
    Ok(())
}

/// Load `regs.len()` 8x8 b16 matrices whose rows are addressed per lane by `smem`
pub fn ldmatrix(
    registry: &FunctionRegistry,
    regs: Vec<Expr>,
    smem: Expr,
    shared_space_addr: bool,
    trans: bool,
) -> LowerResult<Expr> {
    let variant = LdMatrixVariant::new(regs.len(), shared_space_addr, trans)?;
    let mut args = regs;
    args.push(smem);
    call_cuda(registry, &variant.name(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_names() {
        let v = LdMatrixVariant::new(4, true, true).unwrap();
        assert_eq!(v.func_name(), "cuda_ldmatrix_x4_shared_trans");
        assert_eq!(
            v.template(),
            "ldmatrix.sync.aligned.m8n8.x4.trans.shared.b16 {%0, %1, %2, %3}, [%4];"
        );
        let v = LdMatrixVariant::new(1, false, false).unwrap();
        assert_eq!(v.template(), "ldmatrix.sync.aligned.m8n8.x1.b16 {%0}, [%1];");
        assert_eq!(LdMatrixVariant::all().len(), 12);
    }

    #[test]
    fn test_call_validates_count() {
        let registry = FunctionRegistry::with_builtins().unwrap();
        let regs = |n: usize| (0..n).map(|i| Expr::int(i as i64)).collect::<Vec<_>>();
        let call = ldmatrix(&registry, regs(2), Expr::int(9), false, false).unwrap();
        assert_eq!(
            call,
            Expr::call("cuda_ldmatrix_x2", vec![Expr::int(0), Expr::int(1), Expr::int(9)])
        );
        assert!(matches!(
            ldmatrix(&registry, regs(3), Expr::int(0), false, false),
            Err(LowerError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_body_operands() {
        let registry = FunctionRegistry::with_builtins().unwrap();
        let func = registry.lookup("cuda_ldmatrix_x2_shared").unwrap();
        assert_eq!(func.params.len(), 3);
        assert_eq!(func.params[2].ty, Type::Scalar(ScalarType::U32));
        let Stmt::Asm(asm) = &func.body else {
            panic!("Expected asm body");
        };
        assert_eq!(asm.outputs.len(), 2);
        assert_eq!(asm.inputs[0].constraint, "r");

        let func = registry.lookup("cuda_ldmatrix_x1").unwrap();
        let Stmt::Asm(asm) = &func.body else {
            panic!("Expected asm body");
        };
        assert_eq!(asm.inputs[0].constraint, "l");
    }
}
