//! Tunables for building, validating and bounding table caches

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tc_core::{TableError, TableResult};

const MIB: u64 = 1024 * 1024;

/// Size budgets enforced by `SizeGuard`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeLimits {
    /// Spreadsheet documents (xlsx, xlsm, xls)
    pub spreadsheet_bytes: u64,

    /// Rendered documents (pdf)
    pub document_bytes: u64,

    /// Metadata files (json)
    pub metadata_bytes: u64,

    /// Everything under a cache root together
    pub total_cache_bytes: u64,

    /// Any single decompressed part inside a spreadsheet container
    pub xml_part_bytes: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        Self {
            spreadsheet_bytes: 50 * MIB,
            document_bytes: 100 * MIB,
            metadata_bytes: 10 * MIB,
            total_cache_bytes: 80 * MIB,
            xml_part_bytes: crate::xlsx::DEFAULT_PART_LIMIT,
        }
    }
}

impl SizeLimits {
    /// The smallest per-file ceiling, applied to unknown file types
    pub fn most_conservative(&self) -> u64 {
        self.spreadsheet_bytes
            .min(self.document_bytes)
            .min(self.metadata_bytes)
    }
}

/// Configuration for the cache layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one subdirectory per dataset
    pub cache_root: PathBuf,

    /// Rows per page when building
    pub page_size: usize,

    /// How many leading pages the integrity check decodes
    pub integrity_sample_size: usize,

    /// Fraction of sampled pages allowed to fail before the cache counts as corrupted
    pub corruption_tolerance: f64,

    /// Column widths never go below this many pixels
    pub min_column_width_px: u32,

    /// Pixels per spreadsheet character-width unit
    pub px_per_char: u32,

    /// Width in characters assumed for columns without a declared width
    pub default_column_chars: f64,

    pub size_limits: SizeLimits,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("table_cache"),
            page_size: 500,
            integrity_sample_size: 5,
            corruption_tolerance: 0.2,
            min_column_width_px: 200,
            px_per_char: 40,
            default_column_chars: 8.0,
            size_limits: SizeLimits::default(),
        }
    }
}

impl CacheConfig {
    /// Default configuration rooted at `cache_root`
    pub fn with_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file; absent keys take their defaults
    pub fn load(path: &Path) -> TableResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&content)
            .map_err(|e| TableError::InvalidFormat(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn save(&self, path: &Path) -> TableResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TableError::InvalidFormat(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values no build could work with
    pub fn validate(&self) -> TableResult<()> {
        if self.page_size == 0 {
            return Err(TableError::InvalidState("page_size must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.corruption_tolerance) {
            return Err(TableError::InvalidState(format!(
                "corruption_tolerance {} is outside 0..=1",
                self.corruption_tolerance
            )));
        }
        Ok(())
    }

    /// Pixel width for a column declared `chars` wide
    pub fn width_px(&self, chars: Option<f64>) -> u32 {
        let chars = chars.unwrap_or(self.default_column_chars).max(0.0);
        let px = (chars * self.px_per_char as f64).round() as u32;
        px.max(self.min_column_width_px)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_budgets() {
        let config = CacheConfig::default();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.size_limits.spreadsheet_bytes, 50 * MIB);
        assert_eq!(config.size_limits.total_cache_bytes, 80 * MIB);
        assert_eq!(config.size_limits.most_conservative(), 10 * MIB);
    }

    #[test]
    fn width_is_scaled_and_floored() {
        let config = CacheConfig::default();
        assert_eq!(config.width_px(None), 320);
        assert_eq!(config.width_px(Some(20.0)), 800);
        assert_eq!(config.width_px(Some(2.0)), 200);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{ "page_size": 50, "size_limits": { "total_cache_bytes": 1024 } }"#).unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.page_size, 50);
        assert_eq!(config.integrity_sample_size, 5);
        assert_eq!(config.size_limits.total_cache_bytes, 1024);
        assert_eq!(config.size_limits.spreadsheet_bytes, 50 * MIB);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let config = CacheConfig::with_root(dir.path().join("root"));
        config.save(&path).unwrap();
        assert_eq!(CacheConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let config = CacheConfig {
            page_size: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(TableError::InvalidState(_))));
    }
}
