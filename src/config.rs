// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration structures for controllers and the controller manager.

use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, DEFAULT_BASE_DELAY,
    DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for this config.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value parsed but is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main configuration for running controllers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerManagerConfig {
    /// Kubeconfig file for talking to the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch. All namespaces when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// The number of concurrent workers for each controller.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How often the default key is queued regardless of events. Zero disables resync.
    #[serde(default, with = "humantime_serde")]
    pub resync_interval: Duration,

    /// The maximum time to wait for informer caches. Unbounded when unset.
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub cache_sync_timeout: Option<Duration>,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// The duration between each controller starting.
    #[serde(
        default = "default_controller_start_interval",
        with = "humantime_serde"
    )]
    pub controller_start_interval: Duration,

    /// Requeue backoff applied to failed keys.
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerManagerConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: None,
            workers: default_workers(),
            resync_interval: Duration::ZERO,
            cache_sync_timeout: None,
            shutdown_timeout: default_shutdown_timeout(),
            controller_start_interval: default_controller_start_interval(),
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl ControllerManagerConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the YAML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Checks values serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        self.rate_limiter.validate()
    }
}

fn default_workers() -> usize {
    1
}

fn default_controller_start_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Settings of the default controller rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Delay after the first failure of a key.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound of the per-key exponential backoff.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Overall requeues per second.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Requeues allowed before the overall limit kicks in.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl RateLimiterConfig {
    /// Checks that the limiter can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::Invalid(format!(
                "rateLimiter.baseDelay ({}) exceeds rateLimiter.maxDelay ({})",
                humantime::format_duration(self.base_delay),
                humantime::format_duration(self.max_delay)
            )));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "rateLimiter.qps must be positive, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(ConfigError::Invalid(
                "rateLimiter.burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the per-key exponential backoff combined with the overall bucket.
    pub fn build<T>(&self) -> MaxOfRateLimiter<T>
    where
        T: Eq + Hash + Clone + Send + Sync + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

fn default_qps() -> f64 {
    DEFAULT_QPS
}

fn default_burst() -> u32 {
    DEFAULT_BURST
}
