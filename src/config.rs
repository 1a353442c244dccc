//! Engine configuration.
//!
//! All tunables are explicit fields here. There is no environment-variable
//! or global feature-switch state: the configuration is passed to
//! [`PostingEngine::create`](crate::PostingEngine::create) and
//! [`PostingEngine::open`](crate::PostingEngine::open) once.

use crate::{GristError, Result};

/// Hard ceiling for term frequency. Postings beyond the cap are counted
/// but their positions are not stored; the discrepancy is logged.
pub const DEFAULT_TF_CAP: u32 = 0x1FFFF;

/// Bound on the jump-chain maintenance depth in the buffer skip list.
/// Repair past this depth is truncated and logged, not treated as an error.
pub const DEFAULT_MAX_JUMP_DEPTH: usize = 100;

/// Configuration of a [`PostingEngine`](crate::PostingEngine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Byte size of one buffer/locator segment.
    pub segment_size: u32,
    /// Maximum number of segments in the arena file.
    pub max_segments: u32,
    /// Maximum number of segments kept mapped at once. Beyond this the
    /// arena voluntarily expires unreferenced mappings.
    pub segment_cache_size: usize,
    /// Allocation granularity of the chunk heap, in bytes. Power of two.
    pub alignment_block_size: u32,
    /// Emit per-operation debug logs.
    pub debug_logging: bool,
    /// Term frequency cap. See [`DEFAULT_TF_CAP`].
    pub tf_cap: u32,
    /// Jump-chain maintenance depth bound. See [`DEFAULT_MAX_JUMP_DEPTH`].
    pub max_jump_depth: usize,
    /// Number of placement buckets used to spread terms across buffer
    /// segments.
    pub buffer_bucket_count: u32,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            segment_size: 1 << 17,
            max_segments: 1 << 10,
            segment_cache_size: 64,
            alignment_block_size: 16,
            debug_logging: false,
            tf_cap: DEFAULT_TF_CAP,
            max_jump_depth: DEFAULT_MAX_JUMP_DEPTH,
            buffer_bucket_count: 32,
        }
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.segment_size.is_power_of_two() || self.segment_size < (1 << 12) {
            return Err(GristError::InvalidArgument(format!(
                "segment_size must be a power of two >= 4096, got {}",
                self.segment_size
            )));
        }
        // Indirect locators carry a 12-bit segment id and an 18-bit slot index.
        if self.max_segments == 0 || self.max_segments > (1 << 12) {
            return Err(GristError::InvalidArgument(format!(
                "max_segments must be in 1..=4096, got {}",
                self.max_segments
            )));
        }
        if !self.alignment_block_size.is_power_of_two() {
            return Err(GristError::InvalidArgument(format!(
                "alignment_block_size must be a power of two, got {}",
                self.alignment_block_size
            )));
        }
        if self.tf_cap == 0 || self.tf_cap > DEFAULT_TF_CAP {
            return Err(GristError::InvalidArgument(format!(
                "tf_cap must be in 1..={}, got {}",
                DEFAULT_TF_CAP, self.tf_cap
            )));
        }
        if self.buffer_bucket_count == 0 {
            return Err(GristError::InvalidArgument(
                "buffer_bucket_count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_segment() {
        let config = EngineConfig {
            segment_size: 1024,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unaligned_block_size() {
        let config = EngineConfig {
            alignment_block_size: 24,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
