//! Compressibility estimate for stored values

use crate::error::{Error, Result};
use std::io::Write;

/// Values shorter than this are reported as incompressible without a trial
pub const MIN_TRIAL_SIZE: usize = 32;

/// Zstd effort level used for trials
pub const TRIAL_LEVEL: i32 = 5;

/// Raw vs. compressed size of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionEstimate {
    pub raw_size: usize,
    pub compressed_size: usize,
}

impl CompressionEstimate {
    /// compressed / raw, or `None` for an empty value
    pub fn ratio(&self) -> Option<f64> {
        if self.raw_size > 0 {
            Some(self.compressed_size as f64 / self.raw_size as f64)
        } else {
            None
        }
    }
}

/// Runs a bounded zstd trial over `data`
///
/// The output buffer never grows past the zstd bound for the input size.
pub fn estimate(data: &[u8]) -> Result<CompressionEstimate> {
    let raw_size = data.len();
    if raw_size < MIN_TRIAL_SIZE {
        return Ok(CompressionEstimate {
            raw_size,
            compressed_size: raw_size,
        });
    }

    let bound = zstd::zstd_safe::compress_bound(raw_size);
    let mut encoder = zstd::Encoder::new(Vec::with_capacity(bound), TRIAL_LEVEL)
        .map_err(|e| Error::Internal(format!("Failed to create zstd encoder: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| Error::Internal(format!("Failed to compress: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Internal(format!("Failed to finish compression: {}", e)))?;

    Ok(CompressionEstimate {
        raw_size,
        compressed_size: compressed.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values_skip_trial() -> Result<()> {
        let est = estimate(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")?;
        assert_eq!(est.raw_size, 31);
        assert_eq!(est.compressed_size, 31);

        let empty = estimate(b"")?;
        assert_eq!(empty.ratio(), None);
        Ok(())
    }

    #[test]
    fn test_repetitive_values_shrink() -> Result<()> {
        let data = b"Hello, World! This is a test of zstd compression. ".repeat(10);
        let est = estimate(&data)?;
        assert_eq!(est.raw_size, data.len());
        assert!(est.compressed_size < est.raw_size);
        Ok(())
    }

    #[test]
    fn test_ratio() {
        let est = CompressionEstimate {
            raw_size: 1000,
            compressed_size: 250,
        };
        assert_eq!(est.ratio(), Some(0.25));
    }
}
