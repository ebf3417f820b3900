use std::env;

use chrono::Duration;
use serde::Serialize;

use crate::domain::{BasisPoints, GST_RATE_BPS};

/// Business policy knobs. Defaults match the bank's published schedule;
/// each can be overridden from the environment (`KHATA_*`).
#[derive(Debug, Clone, Serialize)]
pub struct Policy {
    /// Charged on principal outstanding when a loan is foreclosed
    pub foreclosure_penalty_bps: BasisPoints,
    /// Charged on the EMI for every day it is late
    pub overdue_penalty_bps_per_day: BasisPoints,
    pub gst_rate_bps: BasisPoints,
    /// Cooling period between disbursement and the loan turning active
    pub activation_delay_secs: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            foreclosure_penalty_bps: 200,
            overdue_penalty_bps_per_day: 200,
            gst_rate_bps: GST_RATE_BPS,
            activation_delay_secs: 24 * 60 * 60,
        }
    }
}

impl Policy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            foreclosure_penalty_bps: env_i64(
                "KHATA_FORECLOSURE_PENALTY_BPS",
                defaults.foreclosure_penalty_bps,
            ),
            overdue_penalty_bps_per_day: env_i64(
                "KHATA_OVERDUE_PENALTY_BPS",
                defaults.overdue_penalty_bps_per_day,
            ),
            gst_rate_bps: env_i64("KHATA_GST_RATE_BPS", defaults.gst_rate_bps),
            activation_delay_secs: env_i64(
                "KHATA_ACTIVATION_DELAY_SECS",
                defaults.activation_delay_secs,
            ),
        }
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::seconds(self.activation_delay_secs)
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|v| *v >= 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.foreclosure_penalty_bps, 200);
        assert_eq!(policy.overdue_penalty_bps_per_day, 200);
        assert_eq!(policy.gst_rate_bps, 1_800);
        assert_eq!(policy.activation_delay(), Duration::hours(24));
    }

    #[test]
    fn test_env_fallback_on_garbage() {
        assert_eq!(env_i64("KHATA_TEST_UNSET_VARIABLE", 42), 42);
    }
}
