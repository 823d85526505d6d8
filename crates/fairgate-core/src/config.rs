//! Hyperparameters.
//!
//! Every tunable is late-bound: read when a shedder or registry is built,
//! never compiled in. Values come from defaults, a TOML/JSON file, or
//! `FAIRGATE_*` environment variables, in that order of precedence.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::NANOS_PER_MILLI;
use crate::error::{AdmissionError, Result};
use crate::gradient::GradientBounds;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FAIRGATE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum lifetime of a measurement window.
    pub window_time_cycle_ms: u64,
    /// Request count that closes a window early.
    pub window_request_cycle: u64,
    /// Target CPU utilisation in `(0, 1]`.
    pub cpu_usage_upper_bound: f64,
    /// Smoothing factor for the CPU moving average.
    pub cpu_ema_alpha: f64,
    /// Average queueing delay treated as the overload boundary.
    pub avg_queue_ms_upper_bound: f64,
    /// Share of last window's admitted work to shed when overloaded.
    pub drop_rate: f64,
    /// Share of last window's admitted work to re-admit when healthy.
    pub recover_rate: f64,
    /// Tolerated over-shed error before keeping the crossing bucket.
    pub over_shed_bound: f64,
    /// Most overloaded gradient value.
    pub gradient_busiest: f64,
    /// Most idle gradient value.
    pub gradient_idle: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_time_cycle_ms: 1000,
            window_request_cycle: 2048,
            cpu_usage_upper_bound: 0.75,
            cpu_ema_alpha: 0.25,
            avg_queue_ms_upper_bound: 50.0,
            drop_rate: 0.05,
            recover_rate: 0.015,
            over_shed_bound: 1.01,
            gradient_busiest: 0.5,
            gradient_idle: 1.2,
        }
    }
}

impl AdmissionConfig {
    /// Loads a config file; the format follows the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: AdmissionConfig = match ext.to_lowercase().as_str() {
            "toml" => {
                toml::from_str(&contents).map_err(|e| AdmissionError::ConfigParse(e.to_string()))?
            }
            "json" => serde_json::from_str(&contents)
                .map_err(|e| AdmissionError::ConfigParse(e.to_string()))?,
            _ => {
                return Err(AdmissionError::ConfigParse(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `FAIRGATE_*` overrides from `lookup` and validates the result.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_u64(&lookup, "WINDOW_TIME_CYCLE_MS", &mut self.window_time_cycle_ms)?;
        override_u64(&lookup, "WINDOW_REQUEST_CYCLE", &mut self.window_request_cycle)?;
        override_f64(&lookup, "CPU_USAGE_UPPER_BOUND", &mut self.cpu_usage_upper_bound)?;
        override_f64(&lookup, "CPU_EMA_ALPHA", &mut self.cpu_ema_alpha)?;
        override_f64(&lookup, "AVG_QUEUE_MS_UPPER_BOUND", &mut self.avg_queue_ms_upper_bound)?;
        override_f64(&lookup, "DROP_RATE", &mut self.drop_rate)?;
        override_f64(&lookup, "RECOVER_RATE", &mut self.recover_rate)?;
        override_f64(&lookup, "OVER_SHED_BOUND", &mut self.over_shed_bound)?;
        override_f64(&lookup, "GRADIENT_BUSIEST", &mut self.gradient_busiest)?;
        override_f64(&lookup, "GRADIENT_IDLE", &mut self.gradient_idle)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_time_cycle_ms == 0 {
            return Err(AdmissionError::config("window_time_cycle_ms must be positive"));
        }
        if self.window_request_cycle == 0 {
            return Err(AdmissionError::config("window_request_cycle must be positive"));
        }
        check_unit("cpu_usage_upper_bound", self.cpu_usage_upper_bound)?;
        check_unit("cpu_ema_alpha", self.cpu_ema_alpha)?;
        check_unit("drop_rate", self.drop_rate)?;
        check_unit("recover_rate", self.recover_rate)?;
        check_positive("avg_queue_ms_upper_bound", self.avg_queue_ms_upper_bound)?;
        check_positive("over_shed_bound", self.over_shed_bound)?;
        check_positive("gradient_busiest", self.gradient_busiest)?;
        if !(self.gradient_busiest < 1.0 && 1.0 < self.gradient_idle) {
            return Err(AdmissionError::config(format!(
                "gradient range must straddle 1.0, got [{}, {}]",
                self.gradient_busiest, self.gradient_idle
            )));
        }
        Ok(())
    }

    pub fn time_cycle_nanos(&self) -> u64 {
        self.window_time_cycle_ms.saturating_mul(NANOS_PER_MILLI)
    }

    pub fn gradient_bounds(&self) -> GradientBounds {
        GradientBounds {
            busiest: self.gradient_busiest,
            idle: self.gradient_idle,
        }
    }
}

fn env_key(name: &str) -> String {
    format!("{}{}", ENV_PREFIX, name)
}

fn override_u64<F>(lookup: &F, name: &str, slot: &mut u64) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let key = env_key(name);
    if let Some(raw) = lookup(&key) {
        *slot = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| AdmissionError::config(format!("{} is not an integer: {:?}", key, raw)))?;
        debug!(key = %key, value = *slot, "hyperparameter override");
    }
    Ok(())
}

fn override_f64<F>(lookup: &F, name: &str, slot: &mut f64) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let key = env_key(name);
    if let Some(raw) = lookup(&key) {
        *slot = raw
            .trim()
            .parse::<f64>()
            .map_err(|_| AdmissionError::config(format!("{} is not a number: {:?}", key, raw)))?;
        debug!(key = %key, value = *slot, "hyperparameter override");
    }
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(AdmissionError::config(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )))
    }
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(AdmissionError::config(format!(
            "{} must be positive, got {}",
            name, value
        )))
    }
}
