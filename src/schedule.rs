//! Kernel schedules
//!
//! A schedule is a bag of tuning knobs (tile sizes, pipeline depth, the mma
//! shape) plus the quantities derived from them. Constructing one checks every
//! hardware precondition and fails with a recoverable
//! [`LowerError::ScheduleConstraint`] so a caller can move on to the next
//! candidate.
//!
//! For C = A @ B where A is MxK and B is KxN:
//! - each block computes a `block_m x block_n` tile of C, stepping through K
//!   in `block_k` slices staged through shared memory
//! - each warp owns a `warp_m x warp_n` sub-tile, built from mma fragments

use std::fmt;

use serde::Serialize;

use crate::error::{LowerError, LowerResult};
use crate::intrinsics::cp_async::MAX_WAIT_GROUPS;
use crate::intrinsics::MmaConfig;
use crate::target::TargetConfig;

/// Common interface of kernel schedules
pub trait Schedule {
    fn name(&self) -> &'static str;

    /// Tunable parameters in display order
    fn keys(&self) -> Vec<(&'static str, String)>;

    /// Quantities computed from the keys
    fn derived_keys(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// `Name(key: value, ...)` over keys then derived keys
    fn render(&self) -> String {
        let items: Vec<String> = self
            .keys()
            .into_iter()
            .chain(self.derived_keys())
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        format!("{}({})", self.name(), items.join(", "))
    }

    /// Fail with a schedule-constraint error carrying this schedule unless `cond`
    fn check(&self, cond: bool, msg: &str) -> LowerResult<()> {
        if cond {
            Ok(())
        } else {
            Err(LowerError::schedule(self.render(), msg))
        }
    }
}

/// Number of tiles along each problem dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileGrid {
    pub m_tiles: usize,
    pub n_tiles: usize,
    pub k_tiles: usize,
}

impl TileGrid {
    pub fn blocks(&self) -> usize {
        self.m_tiles * self.n_tiles
    }
}

/// Tensor-core matmul schedule with a multi-stage copy pipeline
#[derive(Debug, Clone, Serialize)]
pub struct MatmulSchedule {
    pub block_m: usize,
    pub block_n: usize,
    pub block_k: usize,
    pub warp_m: usize,
    pub warp_n: usize,
    /// Shared-memory buffers in flight
    pub stages: usize,
    pub mma: MmaConfig,
    #[serde(skip)]
    target: TargetConfig,
}

impl MatmulSchedule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target: &TargetConfig,
        block_m: usize,
        block_n: usize,
        block_k: usize,
        warp_m: usize,
        warp_n: usize,
        stages: usize,
        mma: MmaConfig,
    ) -> LowerResult<Self> {
        let schedule = Self {
            block_m,
            block_n,
            block_k,
            warp_m,
            warp_n,
            stages,
            mma,
            target: target.clone(),
        };
        schedule.check(block_m > 0 && block_n > 0 && block_k > 0, "tile sizes must be positive")?;
        schedule.check(warp_m > 0 && warp_n > 0, "warp tile sizes must be positive")?;
        schedule.check(
            block_m % warp_m == 0 && block_n % warp_n == 0,
            "warp tile must divide block tile",
        )?;
        schedule.check(
            warp_m % schedule.mma.m == 0 && warp_n % schedule.mma.n == 0,
            "mma shape must divide warp tile",
        )?;
        schedule.check(block_k % schedule.mma.k == 0, "mma k must divide block_k")?;
        schedule.check(
            (1..=MAX_WAIT_GROUPS).contains(&stages),
            "stages must be in [1, 10]",
        )?;
        schedule.check(
            schedule.threads() <= target.max_threads_per_block,
            "too many threads per block",
        )?;
        schedule.check(
            schedule.smem_bytes() <= target.max_shared_bytes,
            "shared memory budget exceeded",
        )?;
        Ok(schedule)
    }

    /// 128x128x32 block, 64x64 warps, three stages
    pub fn default_for(target: &TargetConfig, mma: MmaConfig) -> LowerResult<Self> {
        Self::new(target, 128, 128, 32, 64, 64, 3, mma)
    }

    pub fn warps(&self) -> usize {
        (self.block_m / self.warp_m) * (self.block_n / self.warp_n)
    }

    pub fn threads(&self) -> usize {
        self.warps() * self.target.warp_size
    }

    /// mma instructions per warp per `k` step, along M and N
    pub fn mma_count(&self) -> (usize, usize) {
        (self.warp_m / self.mma.m, self.warp_n / self.mma.n)
    }

    /// Shared memory holding every stage of the A and B slices
    pub fn smem_bytes(&self) -> usize {
        let per_stage = (self.block_m + self.block_n) * self.block_k;
        per_stage * self.stages * self.mma.input_dtype.nbytes()
    }

    /// Groups allowed to stay pending while the oldest stage is consumed
    pub fn steady_state_wait_groups(&self) -> usize {
        self.stages.saturating_sub(2)
    }

    /// Tile a concrete `m x k` by `k x n` problem
    pub fn validate(&self, m: usize, n: usize, k: usize) -> LowerResult<TileGrid> {
        self.check(m > 0 && n > 0 && k > 0, "problem sizes must be positive")?;
        self.check(
            k % self.mma.k == 0,
            &format!("k = {} is not a multiple of mma k = {}", k, self.mma.k),
        )?;
        Ok(TileGrid {
            m_tiles: (m + self.block_m - 1) / self.block_m,
            n_tiles: (n + self.block_n - 1) / self.block_n,
            k_tiles: (k + self.block_k - 1) / self.block_k,
        })
    }
}

impl Schedule for MatmulSchedule {
    fn name(&self) -> &'static str {
        "MatmulSchedule"
    }

    fn keys(&self) -> Vec<(&'static str, String)> {
        vec![
            ("block_m", self.block_m.to_string()),
            ("block_n", self.block_n.to_string()),
            ("block_k", self.block_k.to_string()),
            ("warp_m", self.warp_m.to_string()),
            ("warp_n", self.warp_n.to_string()),
            ("stages", self.stages.to_string()),
            ("mma", self.mma.key()),
        ]
    }

    fn derived_keys(&self) -> Vec<(&'static str, String)> {
        vec![
            ("threads", self.threads().to_string()),
            ("smem_bytes", self.smem_bytes().to_string()),
        ]
    }
}

impl fmt::Display for MatmulSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mma() -> MmaConfig {
        MmaConfig::lookup("m16n8k16_f16_f32").unwrap()
    }

    #[test]
    fn test_default_schedule() {
        let target = TargetConfig::default();
        let schedule = MatmulSchedule::default_for(&target, mma()).unwrap();
        assert_eq!(schedule.warps(), 4);
        assert_eq!(schedule.threads(), 128);
        assert_eq!(schedule.mma_count(), (4, 8));
        assert_eq!(schedule.smem_bytes(), 3 * 256 * 32 * 2);
        assert_eq!(schedule.steady_state_wait_groups(), 1);
    }

    #[test]
    fn test_display() {
        let target = TargetConfig::default();
        let schedule = MatmulSchedule::new(&target, 64, 64, 16, 32, 32, 2, mma()).unwrap();
        assert_eq!(
            schedule.to_string(),
            "MatmulSchedule(block_m: 64, block_n: 64, block_k: 16, warp_m: 32, warp_n: 32, \
             stages: 2, mma: m16n8k16_f16_f32, threads: 128, smem_bytes: 8192)"
        );
    }

    #[test]
    fn test_constraint_errors_are_recoverable() {
        let target = TargetConfig::default();
        let err = MatmulSchedule::new(&target, 64, 64, 16, 48, 32, 2, mma()).unwrap_err();
        assert!(err.is_recoverable());
        if let LowerError::ScheduleConstraint { object, message } = err {
            assert!(object.starts_with("MatmulSchedule(block_m: 64"));
            assert_eq!(message, "warp tile must divide block tile");
        } else {
            panic!("Expected schedule constraint");
        }

        // 8 stages of 256x256x64 halves do not fit in 48 KiB
        assert!(MatmulSchedule::new(&target, 256, 256, 64, 64, 64, 8, mma()).is_err());
        assert!(MatmulSchedule::new(&target, 64, 64, 16, 32, 32, 0, mma()).is_err());
    }

    #[test]
    fn test_validate_problem() {
        let target = TargetConfig::default();
        let schedule = MatmulSchedule::new(&target, 64, 64, 16, 32, 32, 2, mma()).unwrap();
        let grid = schedule.validate(100, 64, 48).unwrap();
        assert_eq!(grid, TileGrid { m_tiles: 2, n_tiles: 1, k_tiles: 3 });
        assert_eq!(grid.blocks(), 2);
        assert!(schedule.validate(64, 64, 20).is_err());
        assert!(schedule.validate(0, 64, 16).is_err());
    }
}
