//! Target description for intrinsic synthesis
//!
//! Register packing and lane binding are derived from these parameters.

use serde::{Deserialize, Serialize};

use crate::dtype::ScalarType;
use crate::error::{LowerError, LowerResult};
use crate::mapping::TaskMapping;

/// Configuration of the GPU execution target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Lanes in one warp
    pub warp_size: usize,
    /// Width of one general-purpose register in bits
    pub register_bits: usize,
    /// Upper bound on threads per block
    pub max_threads_per_block: usize,
    /// Static shared memory available to one block, in bytes
    pub max_shared_bytes: usize,
}

impl TargetConfig {
    pub fn new(warp_size: usize, register_bits: usize) -> Self {
        Self {
            warp_size,
            register_bits,
            ..Self::sm80()
        }
    }

    /// Ampere-class defaults
    pub fn sm80() -> Self {
        Self {
            warp_size: 32,
            register_bits: 32,
            max_threads_per_block: 1024,
            max_shared_bytes: 48 * 1024,
        }
    }

    /// Bits one warp-wide register group holds
    pub fn bits_per_register_group(&self) -> usize {
        self.warp_size * self.register_bits
    }

    /// Registers each lane needs to hold `num_elements` values of `dtype`
    /// spread over the warp.
    pub fn regs_per_lane(&self, dtype: ScalarType, num_elements: usize) -> LowerResult<usize> {
        let total_bits = dtype.nbits() * num_elements;
        let group = self.bits_per_register_group();
        if group == 0 || total_bits % group != 0 {
            return Err(LowerError::config(format!(
                "{} x {} ({} bits) does not pack into {}-lane groups of {}-bit registers",
                num_elements,
                dtype,
                total_bits,
                self.warp_size,
                self.register_bits
            )));
        }
        Ok(total_bits / group)
    }

    /// Elements each lane holds when `num_elements` are spread over the warp
    pub fn elements_per_lane(&self, num_elements: usize) -> LowerResult<usize> {
        if self.warp_size == 0 || num_elements % self.warp_size != 0 {
            return Err(LowerError::config(format!(
                "{} elements cannot be split evenly over {} lanes",
                num_elements, self.warp_size
            )));
        }
        Ok(num_elements / self.warp_size)
    }

    /// Check a fragment mapping against this warp
    pub fn bind(&self, mapping: &TaskMapping) -> LowerResult<()> {
        mapping.bind(self.warp_size)
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::sm80()
    }
}

/// Registers per lane under the default 32 x 32-bit warp
pub fn num_regs(dtype: ScalarType, num_elements: usize) -> LowerResult<usize> {
    TargetConfig::default().regs_per_lane(dtype, num_elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::row_spatial;

    #[test]
    fn test_config() {
        let config = TargetConfig::default();
        assert_eq!(config.bits_per_register_group(), 1024);
        assert_eq!(config, TargetConfig::new(32, 32));
    }

    #[test]
    fn test_register_packing() {
        // 128 halves = 2048 bits = two 32-bit registers on each of 32 lanes
        assert_eq!(num_regs(ScalarType::F16, 128).unwrap(), 2);
        assert_eq!(num_regs(ScalarType::F16, 64).unwrap(), 1);
        assert_eq!(num_regs(ScalarType::F32, 128).unwrap(), 4);
        assert_eq!(num_regs(ScalarType::I8, 128).unwrap(), 1);
    }

    #[test]
    fn test_register_packing_rejects_partial_groups() {
        let err = num_regs(ScalarType::F16, 96).unwrap_err();
        assert!(matches!(err, LowerError::ConfigError { .. }));
        assert!(num_regs(ScalarType::F32, 16).is_err());
    }

    #[test]
    fn test_elements_per_lane() {
        let config = TargetConfig::default();
        assert_eq!(config.elements_per_lane(128).unwrap(), 4);
        assert!(config.elements_per_lane(100).is_err());
        assert!(config.bind(&row_spatial(&[8, 4])).is_ok());
    }
}
