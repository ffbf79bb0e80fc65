//! Monitor configuration.
//!
//! Defaults can be overridden from the environment:
//! - `LEASEWATCH_SWEEP_INTERVAL`: seconds between sweeps (default 60)
//! - `LEASEWATCH_LEASE_THRESHOLD`: seconds a lease may be held before it is
//!   reported (default 60)
//! - `LEASEWATCH_APP_PREFIX`: module prefix of application frames
//! - `LEASEWATCH_EXCLUDED_TYPES`: comma-separated plumbing types never blamed

use std::sync::Arc;
use std::time::Duration;

use crate::stack::{Attribution, NamespaceFilter};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_SKIP_FRAMES: usize = 2;
pub const DEFAULT_EXCLUDED_TYPES: &[&str] = &["BaseDao"];

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub sweep_interval: Duration,
    /// Leases held strictly longer than this are reported.
    pub lease_threshold: Duration,
    /// Leading frames skipped before attribution starts.
    pub skip_frames: usize,
    pub app_prefix: String,
    pub excluded_types: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: env_seconds("LEASEWATCH_SWEEP_INTERVAL")
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            lease_threshold: env_seconds("LEASEWATCH_LEASE_THRESHOLD")
                .unwrap_or(DEFAULT_LEASE_THRESHOLD),
            skip_frames: DEFAULT_SKIP_FRAMES,
            app_prefix: std::env::var("LEASEWATCH_APP_PREFIX").unwrap_or_default(),
            excluded_types: std::env::var("LEASEWATCH_EXCLUDED_TYPES")
                .map(|raw| parse_list(&raw))
                .unwrap_or_else(|_| {
                    DEFAULT_EXCLUDED_TYPES
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
        }
    }
}

impl MonitorConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_lease_threshold(mut self, threshold: Duration) -> Self {
        self.lease_threshold = threshold;
        self
    }

    pub fn with_skip_frames(mut self, skip: usize) -> Self {
        self.skip_frames = skip;
        self
    }

    pub fn with_app_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.app_prefix = prefix.into();
        self
    }

    pub fn with_excluded_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Attribution strategy described by this configuration.
    pub fn attribution(&self) -> Attribution {
        let filter = NamespaceFilter::new(self.app_prefix.clone())
            .exclude_types(self.excluded_types.iter().cloned());
        Attribution::new(self.skip_frames, Arc::new(filter))
    }
}

fn env_seconds(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match parse_seconds(&raw) {
        Some(d) => Some(d),
        None => {
            tracing::warn!(var = name, value = %raw, "Ignoring invalid duration override");
            None
        }
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs = raw.trim().parse::<f64>().ok()?;
    if secs > 0.0 {
        // Rejects NaN, infinity and values past Duration::MAX.
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
