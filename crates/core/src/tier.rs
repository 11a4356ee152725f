//! Subscription tiers and the limits derived from them.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Subscription tier of a caller.
///
/// The tier fixes the steady request rate and the default monthly quota. The
/// burst capacity of the rate bucket is always twice the per-minute rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    /// Parse from the `callers.tier` column or a config string.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(CoreError::Validation(format!("Unknown tier '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Steady-state requests per minute.
    pub fn requests_per_minute(self) -> u32 {
        match self {
            Self::Free => 10,
            Self::Starter => 60,
            Self::Pro => 300,
            Self::Enterprise => 1200,
        }
    }

    /// Jobs allowed per billing period unless the caller row overrides it.
    pub fn default_monthly_quota(self) -> i64 {
        match self {
            Self::Free => 100,
            Self::Starter => 5_000,
            Self::Pro => 50_000,
            Self::Enterprise => 500_000,
        }
    }

    /// Burst ceiling of the rate bucket.
    pub fn burst_capacity(self) -> f64 {
        2.0 * f64::from(self.requests_per_minute())
    }

    /// Tokens regained per second.
    pub fn refill_per_second(self) -> f64 {
        f64::from(self.requests_per_minute()) / 60.0
    }
}
