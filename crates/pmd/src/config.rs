//! Tunable configuration for the PMD engine.
//!
//! A plain struct with a `Default` impl and a small validating constructor, rather than a
//! builder macro.

use crate::error::{PmdError, PmdErrorKind, Result};

const MIN_PCO_PERIOD_SECS: u32 = 1;
const MAX_PCO_PERIOD_SECS: u32 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct PmdConfig {
    /// Bound on worker count for parallel MDC replay at activation.
    pub objloadjobs:         usize,
    /// How many MDCs the allocator creates per batch when `mdc_needed` fires (MPOOL_MDC_SET_SZ).
    pub mdc_ncap:            usize,
    /// Pre-compactor tick period, clamped to `[1, 3600]` seconds.
    pub pco_period_secs:     u32,
    /// Per-MDC need-to-compact fill threshold, percent.
    pub pco_pct_full:        u8,
    /// Per-MDC need-to-compact garbage threshold, percent.
    pub pco_pct_garbage:     u8,
    /// Pool-wide threshold past which new MDCs are created, percent full.
    pub crt_mdc_pct_full:    u8,
    /// Pool-wide threshold under which new MDCs are created, percent garbage.
    pub crt_mdc_pct_garbage: u8,
    /// Number of upcoming slots (beyond the pre-compact cursor) excluded from the selector.
    pub pco_nbnoalloc:       usize,
}

impl Default for PmdConfig {
    fn default() -> Self {
        Self {
            objloadjobs:         8,
            mdc_ncap:            8,
            pco_period_secs:     60,
            pco_pct_full:        90,
            pco_pct_garbage:     50,
            crt_mdc_pct_full:    80,
            crt_mdc_pct_garbage: 40,
            pco_nbnoalloc:       2,
        }
    }
}

impl PmdConfig {
    /// Validates ranges and returns a usable config, or `InvalidArgument` describing which
    /// field failed.
    pub fn validated(self) -> Result<Self> {
        if !(MIN_PCO_PERIOD_SECS..=MAX_PCO_PERIOD_SECS).contains(&self.pco_period_secs) {
            return Err(PmdError::new(
                PmdErrorKind::InvalidArgument,
                format!(
                    "pco_period_secs must be in [{MIN_PCO_PERIOD_SECS}, {MAX_PCO_PERIOD_SECS}], got {}",
                    self.pco_period_secs,
                ),
            ));
        }
        for (name, pct) in [
            ("pco_pct_full", self.pco_pct_full),
            ("pco_pct_garbage", self.pco_pct_garbage),
            ("crt_mdc_pct_full", self.crt_mdc_pct_full),
            ("crt_mdc_pct_garbage", self.crt_mdc_pct_garbage),
        ] {
            if pct > 100 {
                return Err(PmdError::new(
                    PmdErrorKind::InvalidArgument,
                    format!("{name} must be a percentage (0..=100), got {pct}"),
                ));
            }
        }
        if self.objloadjobs == 0 || self.mdc_ncap == 0 {
            return Err(PmdError::new(
                PmdErrorKind::InvalidArgument,
                "objloadjobs and mdc_ncap must be nonzero",
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(PmdConfig::default().validated().is_ok());
    }

    #[test]
    fn rejects_out_of_range_period() {
        let cfg = PmdConfig { pco_period_secs: 0, ..PmdConfig::default() };
        assert_eq!(cfg.validated().unwrap_err().kind(), PmdErrorKind::InvalidArgument);

        let cfg = PmdConfig { pco_period_secs: 5000, ..PmdConfig::default() };
        assert_eq!(cfg.validated().unwrap_err().kind(), PmdErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_bad_percentage() {
        let cfg = PmdConfig { pco_pct_full: 101, ..PmdConfig::default() };
        assert_eq!(cfg.validated().unwrap_err().kind(), PmdErrorKind::InvalidArgument);
    }
}
