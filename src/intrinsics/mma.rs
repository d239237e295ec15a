//! Warp-level matrix multiply-accumulate (`mma.sync`)
//!
//! Each supported shape/dtype combination is described by an [`MmaConfig`]
//! whose task mappings define which lane holds which fragment element.

use serde::Serialize;
use tracing::trace;

use super::registry::{call_cuda, FunctionRegistry, CUDA_PREFIX};
use crate::builder::FunctionBuilder;
use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::ir::{AsmOperand, AsmStmt, Expr, FunctionKind, Stmt, Type, Var};
use crate::mapping::{col_repeat, col_spatial, compose, row_repeat, row_spatial, TaskMapping};
use crate::target::TargetConfig;

/// One `mma.sync` shape with its fragment layouts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MmaConfig {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub input_dtype: ScalarType,
    pub output_dtype: ScalarType,
    pub a_load_map: TaskMapping,
    pub b_load_map: TaskMapping,
    pub c_store_map: TaskMapping,
    /// Fragment elements held by each lane
    pub a_elements: usize,
    pub b_elements: usize,
    pub c_elements: usize,
    /// 32-bit registers per lane
    pub a_regs: usize,
    pub b_regs: usize,
    pub c_regs: usize,
}

impl MmaConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        m: usize,
        n: usize,
        k: usize,
        input_dtype: ScalarType,
        output_dtype: ScalarType,
        a_load_map: TaskMapping,
        b_load_map: TaskMapping,
        c_store_map: TaskMapping,
    ) -> LowerResult<Self> {
        let target = TargetConfig::default();
        let config = Self {
            m,
            n,
            k,
            input_dtype,
            output_dtype,
            a_elements: target.elements_per_lane(m * k)?,
            b_elements: target.elements_per_lane(k * n)?,
            c_elements: target.elements_per_lane(m * n)?,
            a_regs: target.regs_per_lane(input_dtype, m * k)?,
            b_regs: target.regs_per_lane(input_dtype, k * n)?,
            c_regs: target.regs_per_lane(output_dtype, m * n)?,
            a_load_map,
            b_load_map,
            c_store_map,
        };
        config.check_fragment(&target, "A", &config.a_load_map, [m, k], config.a_elements)?;
        config.check_fragment(&target, "B", &config.b_load_map, [k, n], config.b_elements)?;
        config.check_fragment(&target, "C", &config.c_store_map, [m, n], config.c_elements)?;
        Ok(config)
    }

    fn check_fragment(
        &self,
        target: &TargetConfig,
        operand: &str,
        mapping: &TaskMapping,
        shape: [usize; 2],
        elements: usize,
    ) -> LowerResult<()> {
        target.bind(mapping)?;
        if mapping.task_shape() != shape || mapping.tasks_per_worker() != elements {
            return Err(LowerError::config(format!(
                "{} fragment mapping {} of {} does not cover a {}x{} tile with {} element(s) per lane",
                operand,
                mapping,
                self.key(),
                shape[0],
                shape[1],
                elements
            )));
        }
        Ok(())
    }

    /// e.g. `mma.sync.aligned.m16n8k8.row.col.f32.f16.f16.f32`
    pub fn inst_name(&self) -> String {
        format!(
            "mma.sync.aligned.m{}n{}k{}.row.col.{}.{}.{}.{}",
            self.m,
            self.n,
            self.k,
            self.output_dtype.short_name(),
            self.input_dtype.short_name(),
            self.input_dtype.short_name(),
            self.output_dtype.short_name()
        )
    }

    /// Registered name without the `cuda_` prefix
    pub fn name(&self) -> String {
        self.inst_name().replace('.', "_")
    }

    pub fn func_name(&self) -> String {
        format!("{}{}", CUDA_PREFIX, self.name())
    }

    /// Table key, e.g. `m16n8k16_bf16_f32`
    pub fn key(&self) -> String {
        format!(
            "m{}n{}k{}_{}_{}",
            self.m,
            self.n,
            self.k,
            self.input_dtype.short_name(),
            self.output_dtype.short_name()
        )
    }

    /// `{C}, {A}, {B}, {C}` with placeholders numbered outputs first
    pub fn template(&self) -> String {
        let regs = |range: std::ops::Range<usize>| {
            range
                .map(|i| format!("%{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let (c, a, b) = (self.c_regs, self.a_regs, self.b_regs);
        format!(
            "{} {{{}}}, {{{}}}, {{{}}}, {{{}}};",
            self.inst_name(),
            regs(0..c),
            regs(c..c + a),
            regs(c + a..c + a + b),
            regs(0..c)
        )
    }

    /// Every supported configuration
    pub fn all() -> LowerResult<Vec<MmaConfig>> {
        use ScalarType::{BF16, F16, F32, TF32};

        let c_map = chain(&[row_repeat(&[2, 1]), row_spatial(&[8, 4]), row_repeat(&[1, 2])])?;
        let a_k8 = chain(&[row_repeat(&[2, 1]), row_spatial(&[8, 4]), row_repeat(&[1, 2])])?;
        let b_k8 = chain(&[col_spatial(&[4, 8]), col_repeat(&[2, 1])])?;
        let a_k16 = chain(&[col_repeat(&[2, 2]), row_spatial(&[8, 4]), row_repeat(&[1, 2])])?;
        let b_k16 = chain(&[col_repeat(&[2, 1]), col_spatial(&[4, 8]), col_repeat(&[2, 1])])?;

        let mut configs = Vec::new();
        for output in [F16, F32] {
            configs.push(Self::new(16, 8, 8, F16, output, a_k8.clone(), b_k8.clone(), c_map.clone())?);
            configs.push(Self::new(16, 8, 16, F16, output, a_k16.clone(), b_k16.clone(), c_map.clone())?);
        }
        configs.push(Self::new(16, 8, 8, BF16, F32, a_k8, b_k8, c_map.clone())?);
        configs.push(Self::new(16, 8, 16, BF16, F32, a_k16, b_k16, c_map.clone())?);
        configs.push(Self::new(
            16,
            8,
            4,
            TF32,
            F32,
            chain(&[row_repeat(&[2, 1]), row_spatial(&[8, 4])])?,
            col_spatial(&[4, 8]),
            c_map.clone(),
        )?);
        configs.push(Self::new(
            16,
            8,
            8,
            TF32,
            F32,
            chain(&[col_repeat(&[2, 2]), row_spatial(&[8, 4])])?,
            chain(&[col_repeat(&[2, 1]), col_spatial(&[4, 8])])?,
            c_map,
        )?);
        Ok(configs)
    }

    /// Find a configuration by its table key
    pub fn lookup(key: &str) -> LowerResult<MmaConfig> {
        Self::all()?
            .into_iter()
            .find(|config| config.key() == key)
            .ok_or_else(|| LowerError::invalid_param(format!("no mma configuration named `{}`", key)))
    }
}

impl std::fmt::Display for MmaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inst_name())
    }
}

fn chain(mappings: &[TaskMapping]) -> LowerResult<TaskMapping> {
    let Some((first, rest)) = mappings.split_first() else {
        return Err(LowerError::config("cannot compose an empty list of mappings"));
    };
    rest.iter()
        .try_fold(first.clone(), |acc, next| compose(&acc, next))
}

fn reg(base: &Var, index: usize) -> Expr {
    Expr::element(base.into(), vec![Expr::int(index as i64)])
}

pub fn register_mma(registry: &mut FunctionRegistry) -> LowerResult<()> {
    for config in MmaConfig::all()? {
        let mut fb = FunctionBuilder::new(config.func_name(), FunctionKind::CudaDevice);
        let a = fb.param("a", Type::pointer(Type::Scalar(config.input_dtype)));
        let b = fb.param("b", Type::pointer(Type::Scalar(config.input_dtype)));
        let c = fb.param("c", Type::pointer(Type::Scalar(config.output_dtype)));
        let u32_ptr = Type::pointer(Type::Scalar(ScalarType::U32));
        let ra = fb.local("ra", u32_ptr.clone());
        let rb = fb.local("rb", u32_ptr.clone());
        let rc = fb.local("rc", u32_ptr.clone());

        fb.append(Stmt::assign(&ra, Expr::cast(a.into(), u32_ptr.clone())));
        fb.append(Stmt::assign(&rb, Expr::cast(b.into(), u32_ptr.clone())));
        fb.append(Stmt::assign(&rc, Expr::cast(c.into(), u32_ptr)));

        let inputs = (0..config.a_regs)
            .map(|i| AsmOperand::new("r", reg(&ra, i)))
            .chain((0..config.b_regs).map(|i| AsmOperand::new("r", reg(&rb, i))))
            .collect();
        fb.append(Stmt::Asm(AsmStmt {
            template: config.template(),
            outputs: (0..config.c_regs)
                .map(|i| AsmOperand::new("+r", reg(&rc, i)))
                .collect(),
            inputs,
            is_volatile: false,
        }));
        trace!(name = %config.func_name(), "synthesized mma");
        registry.register(fb.finish()?)?;
    }
    Ok(())
}

/// `C += A * B` on fragments addressed by `a`, `b` and `c`
pub fn mma_sync(registry: &FunctionRegistry, config: &MmaConfig, a: Expr, b: Expr, c: Expr) -> LowerResult<Expr> {
    call_cuda(registry, &config.name(), vec![a, b, c])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table() {
        let configs = MmaConfig::all().unwrap();
        let keys: Vec<String> = configs.iter().map(MmaConfig::key).collect();
        assert_eq!(
            keys,
            vec![
                "m16n8k8_f16_f16",
                "m16n8k16_f16_f16",
                "m16n8k8_f16_f32",
                "m16n8k16_f16_f32",
                "m16n8k8_bf16_f32",
                "m16n8k16_bf16_f32",
                "m16n8k4_tf32_f32",
                "m16n8k8_tf32_f32",
            ]
        );
        for config in &configs {
            assert!(config.a_load_map.is_partition(), "{}", config.key());
            assert!(config.b_load_map.is_partition(), "{}", config.key());
            assert!(config.c_store_map.is_partition(), "{}", config.key());
        }
    }

    #[test]
    fn test_register_counts() {
        let config = MmaConfig::lookup("m16n8k8_f16_f32").unwrap();
        assert_eq!((config.a_regs, config.b_regs, config.c_regs), (2, 1, 4));
        assert_eq!((config.a_elements, config.b_elements, config.c_elements), (4, 2, 4));

        let config = MmaConfig::lookup("m16n8k16_f16_f16").unwrap();
        assert_eq!((config.a_regs, config.b_regs, config.c_regs), (4, 2, 2));

        let config = MmaConfig::lookup("m16n8k4_tf32_f32").unwrap();
        assert_eq!((config.a_regs, config.b_regs, config.c_regs), (2, 1, 4));

        assert!(MmaConfig::lookup("m8n8k4_f64_f64").is_err());
    }

    #[test]
    fn test_template_order() {
        let config = MmaConfig::lookup("m16n8k8_f16_f32").unwrap();
        assert_eq!(
            config.template(),
            "mma.sync.aligned.m16n8k8.row.col.f32.f16.f16.f32 \
             {%0, %1, %2, %3}, {%4, %5}, {%6}, {%0, %1, %2, %3};"
        );
        assert_eq!(
            config.func_name(),
            "cuda_mma_sync_aligned_m16n8k8_row_col_f32_f16_f16_f32"
        );
    }

    #[test]
    fn test_rejects_mismatched_fragment() {
        let err = MmaConfig::new(
            16,
            8,
            8,
            ScalarType::F16,
            ScalarType::F32,
            col_spatial(&[4, 8]),
            col_spatial(&[4, 8]),
            col_spatial(&[4, 8]),
        )
        .unwrap_err();
        assert!(matches!(err, LowerError::ConfigError { .. }));
    }

    #[test]
    fn test_body_operands() {
        let registry = FunctionRegistry::with_builtins().unwrap();
        let config = MmaConfig::lookup("m16n8k16_bf16_f32").unwrap();
        let func = registry.lookup(&config.func_name()).unwrap();
        assert_eq!(func.params.len(), 3);
        assert_eq!(func.local_vars.len(), 3);
        let Stmt::Seq(stmts) = &func.body else {
            panic!("Expected sequence");
        };
        let Stmt::Asm(asm) = &stmts[3] else {
            panic!("Expected asm");
        };
        assert_eq!(asm.outputs.len(), config.c_regs);
        assert_eq!(asm.inputs.len(), config.a_regs + config.b_regs);
        assert!(asm.outputs.iter().all(|o| o.constraint == "+r"));
        assert!(asm.inputs.iter().all(|o| o.constraint == "r"));
        assert!(!asm.is_volatile);

        let call = mma_sync(&registry, &config, Expr::int(0), Expr::int(1), Expr::int(2)).unwrap();
        assert!(matches!(call, Expr::Call { ref func, .. } if *func == config.func_name()));
    }
}
