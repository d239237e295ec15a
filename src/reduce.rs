//! Reduce operations
//!
//! Each operation supplies the identity to start an accumulator from, the
//! associative combine step, the finalize step applied once the loops close,
//! and for arg-reductions the predicate deciding whether a candidate replaces
//! the current best.

use serde::{Deserialize, Serialize};

use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::ir::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    Prod,
    ArgMax,
    ArgMin,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::Prod => "prod",
            ReduceOp::ArgMax => "argmax",
            ReduceOp::ArgMin => "argmin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "sum" => ReduceOp::Sum,
            "mean" | "avg" => ReduceOp::Mean,
            "max" => ReduceOp::Max,
            "min" => ReduceOp::Min,
            "prod" => ReduceOp::Prod,
            "argmax" => ReduceOp::ArgMax,
            "argmin" => ReduceOp::ArgMin,
            _ => return None,
        };
        Some(op)
    }

    /// Whether this operation reports an index rather than a value
    pub fn is_arg(self) -> bool {
        matches!(self, ReduceOp::ArgMax | ReduceOp::ArgMin)
    }

    /// Initial accumulator value for `dtype`
    pub fn identity(self, dtype: ScalarType) -> Expr {
        let value = match self {
            ReduceOp::Sum | ReduceOp::Mean => dtype.zero(),
            ReduceOp::Prod => dtype.one(),
            ReduceOp::Max | ReduceOp::ArgMax => dtype.min_value(),
            ReduceOp::Min | ReduceOp::ArgMin => dtype.max_value(),
        };
        Expr::constant(value, dtype)
    }

    /// Fold `value` into `acc`
    pub fn combine(self, acc: Expr, value: Expr) -> Expr {
        match self {
            ReduceOp::Sum | ReduceOp::Mean => acc + value,
            ReduceOp::Prod => acc * value,
            ReduceOp::Max | ReduceOp::ArgMax => Expr::max(acc, value),
            ReduceOp::Min | ReduceOp::ArgMin => Expr::min(acc, value),
        }
    }

    /// Post-process the accumulated value over `count` elements
    pub fn finalize(self, acc: Expr, count: usize) -> Expr {
        match self {
            ReduceOp::Mean => acc / Expr::int(count as i64),
            _ => acc,
        }
    }

    /// Predicate under which `candidate` replaces `best`.
    ///
    /// Strict comparison: on ties the earliest position is kept.
    pub fn compare(self, candidate: Expr, best: Expr) -> LowerResult<Expr> {
        match self {
            ReduceOp::ArgMax => Ok(Expr::gt(candidate, best)),
            ReduceOp::ArgMin => Ok(Expr::lt(candidate, best)),
            _ => Err(LowerError::unsupported(format!(
                "reduce operation `{}` has no arg comparison",
                self.name()
            ))),
        }
    }
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::ConstValue;
    use crate::ir::{BinaryOp, Constant};

    fn const_of(e: &Expr) -> ConstValue {
        match e {
            Expr::Const(Constant { value, .. }) => *value,
            other => panic!("Expected constant, got {}", other),
        }
    }

    #[test]
    fn test_identities() {
        assert_eq!(const_of(&ReduceOp::Sum.identity(ScalarType::F32)), ConstValue::Float(0.0));
        assert_eq!(const_of(&ReduceOp::Prod.identity(ScalarType::I32)), ConstValue::Int(1));
        assert_eq!(
            const_of(&ReduceOp::Max.identity(ScalarType::I32)),
            ConstValue::Int(i32::MIN as i64)
        );
        assert_eq!(
            const_of(&ReduceOp::ArgMin.identity(ScalarType::U8)),
            ConstValue::UInt(255)
        );
    }

    #[test]
    fn test_mean_divides_by_count() {
        let acc = Expr::float(1.0);
        let finalized = ReduceOp::Mean.finalize(acc.clone(), 8);
        assert_eq!(finalized, Expr::binary(BinaryOp::Div, acc.clone(), Expr::int(8)));
        assert_eq!(ReduceOp::Sum.finalize(acc.clone(), 8), acc);
    }

    #[test]
    fn test_arg_compare_is_strict() {
        let cmp = ReduceOp::ArgMax.compare(Expr::int(5), Expr::int(5)).unwrap();
        assert_eq!(cmp, Expr::binary(BinaryOp::Gt, Expr::int(5), Expr::int(5)));
        let cmp = ReduceOp::ArgMin.compare(Expr::int(1), Expr::int(2)).unwrap();
        assert_eq!(cmp, Expr::binary(BinaryOp::Lt, Expr::int(1), Expr::int(2)));
        assert!(ReduceOp::Sum.compare(Expr::int(1), Expr::int(2)).is_err());
    }

    #[test]
    fn test_names() {
        for op in [ReduceOp::Sum, ReduceOp::Mean, ReduceOp::ArgMax, ReduceOp::Prod] {
            assert_eq!(ReduceOp::from_name(op.name()), Some(op));
        }
        assert!(ReduceOp::ArgMin.is_arg());
        assert!(!ReduceOp::Min.is_arg());
    }
}
