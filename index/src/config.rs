//! Index configuration.
//!
//! The engine reads no environment variables or files of its own. The only
//! tunables are the geometry of non-root blocks, which are fixed when an index
//! is created and stored in its root afterwards.
//!
//! # Invariants
//!
//! - `block_size` is a multiple of 8 between [`IndexConfig::MIN_BLOCK_SIZE`] and
//!   [`IndexConfig::MAX_BLOCK_SIZE`]
//! - `clusters_per_block` is non-zero

/// Geometry of the non-root blocks of a new index.
///
/// # Post-conditions
///
/// After `validate()` succeeds a block of `block_size` bytes can hold the
/// block header, the update-sequence reservation and an `End` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Size in bytes of one index block in the allocation stream.
    pub block_size: u32,
    /// Number of block-address units (VCNs) spanned by one block.
    pub clusters_per_block: u8,
}

/// Error returned when a configuration is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl IndexConfig {
    /// Default block size, matching the usual NTFS index buffer size.
    pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
    /// Smallest block that fits the block header plus an `End` entry.
    pub const MIN_BLOCK_SIZE: u32 = 0x40;
    /// Largest block whose entries' 16-bit length fields can describe them.
    pub const MAX_BLOCK_SIZE: u32 = 0x1_0000;

    /// Create a configuration with the given block size and one cluster per block.
    #[must_use]
    pub const fn with_block_size(block_size: u32) -> Self {
        Self {
            block_size,
            clusters_per_block: 1,
        }
    }

    /// Check the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < Self::MIN_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "block_size".to_string(),
                message: format!(
                    "{} is below the minimum of {}",
                    self.block_size,
                    Self::MIN_BLOCK_SIZE
                ),
            });
        }
        if self.block_size > Self::MAX_BLOCK_SIZE {
            return Err(ConfigError::InvalidValue {
                name: "block_size".to_string(),
                message: format!(
                    "{} exceeds the maximum of {}",
                    self.block_size,
                    Self::MAX_BLOCK_SIZE
                ),
            });
        }
        if self.block_size % 8 != 0 {
            return Err(ConfigError::InvalidValue {
                name: "block_size".to_string(),
                message: format!("{} is not a multiple of 8", self.block_size),
            });
        }
        if self.clusters_per_block == 0 {
            return Err(ConfigError::InvalidValue {
                name: "clusters_per_block".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::with_block_size(Self::DEFAULT_BLOCK_SIZE)
    }
}
