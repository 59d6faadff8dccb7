// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use derive_builder::Builder;
use dynamo_memory::StagingPoolConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use validator::Validate;

pub mod environment_names;

/// System-wide configuration file
const SYSTEM_CONFIG_PATH: &str = "/opt/dynamo/etc/stride.toml";

/// Default iterations per strategy and size during measurement
pub const DEFAULT_MEASURE_ITERATIONS: usize = 8;

/// Default staging reservation, per host arena and per device pool
pub const DEFAULT_STAGING_RESERVE_BYTES: usize = 64 << 20;

/// Host staging is pinned whenever device copies are possible
pub const DEFAULT_PINNED_STAGING: bool = cfg!(feature = "cuda");

// parsed with dynamo_config rather than figment so that "1", "on" and "64MiB" are accepted
const NON_FIGMENT_KEYS: [&str; 6] = [
    "CONFIG_PATH",
    "DISABLE",
    "MEASURE",
    "DEVICE_AWARE",
    "PINNED_STAGING",
    "STAGING_RESERVE_BYTES",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    /// Level directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Stride layer configuration
#[derive(Serialize, Deserialize, Validate, Debug, Builder, Clone, PartialEq)]
#[builder(build_fn(private, name = "build_internal"), derive(Debug, Serialize))]
pub struct StrideConfig {
    /// Forward every call to the wrapped library untouched
    /// Set this at runtime with environment variable DYN_STRIDE_DISABLE
    #[builder(default = "false")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub disable: bool,

    /// Default log level when DYN_LOG is not set
    /// Set this at runtime with environment variable DYN_STRIDE_VERBOSITY
    #[builder(default = "Verbosity::Warn")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub verbosity: Verbosity,

    /// Time every strategy at start-up unless a cached table is found
    /// Set this at runtime with environment variable DYN_STRIDE_MEASURE
    #[builder(default = "true")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub measure: bool,

    /// Iterations per strategy and size during measurement
    /// Set this at runtime with environment variable DYN_STRIDE_MEASURE_ITERATIONS
    #[validate(range(min = 1))]
    #[builder(default = "DEFAULT_MEASURE_ITERATIONS")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub measure_iterations: usize,

    /// Performance table cache; loaded when present, written after measuring
    /// Set this at runtime with environment variable DYN_STRIDE_PERF_CACHE_PATH
    #[builder(default = "None")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub perf_cache_path: Option<PathBuf>,

    /// Bytes reserved for staging, per host arena and per device pool
    /// Set this at runtime with environment variable DYN_STRIDE_STAGING_RESERVE_BYTES
    #[builder(default = "DEFAULT_STAGING_RESERVE_BYTES")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub staging_reserve_bytes: usize,

    /// Back host staging with pinned memory so device copies run asynchronously
    /// Set this at runtime with environment variable DYN_STRIDE_PINNED_STAGING
    #[builder(default = "DEFAULT_PINNED_STAGING")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub pinned_staging: bool,

    /// The wrapped library can read and write device memory itself
    /// Set this at runtime with environment variable DYN_STRIDE_DEVICE_AWARE
    #[builder(default = "false")]
    #[builder_field_attr(serde(skip_serializing_if = "Option::is_none"))]
    pub device_aware: bool,
}

impl Default for StrideConfig {
    fn default() -> Self {
        Self {
            disable: false,
            verbosity: Verbosity::Warn,
            measure: true,
            measure_iterations: DEFAULT_MEASURE_ITERATIONS,
            perf_cache_path: None,
            staging_reserve_bytes: DEFAULT_STAGING_RESERVE_BYTES,
            pinned_staging: DEFAULT_PINNED_STAGING,
            device_aware: false,
        }
    }
}

impl fmt::Display for StrideConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disable={}, ", self.disable)?;
        write!(f, "verbosity={}, ", self.verbosity)?;
        write!(f, "measure={}, ", self.measure)?;
        write!(f, "measure_iterations={}, ", self.measure_iterations)?;
        match &self.perf_cache_path {
            Some(path) => write!(f, "perf_cache_path={}, ", path.display())?,
            None => write!(f, "perf_cache_path=none, ")?,
        }
        write!(f, "staging_reserve_bytes={}, ", self.staging_reserve_bytes)?;
        write!(f, "pinned_staging={}, ", self.pinned_staging)?;
        write!(f, "device_aware={}", self.device_aware)
    }
}

impl StrideConfig {
    pub fn builder() -> StrideConfigBuilder {
        StrideConfigBuilder::default()
    }

    pub(crate) fn figment() -> Figment {
        let config_path =
            std::env::var(environment_names::DYN_STRIDE_CONFIG_PATH).unwrap_or_default();
        Figment::new()
            .merge(Serialized::defaults(StrideConfig::default()))
            .merge(Toml::file(SYSTEM_CONFIG_PATH))
            .merge(Toml::file(config_path))
            .merge(
                Env::prefixed(environment_names::DYN_STRIDE_PREFIX).filter_map(|k| {
                    if NON_FIGMENT_KEYS.contains(&k.as_str()) {
                        return None;
                    }
                    let full_key = format!("{}{}", environment_names::DYN_STRIDE_PREFIX, k.as_str());
                    // filters out empty environment variables
                    match std::env::var(&full_key) {
                        Ok(v) if !v.is_empty() => Some(k.into()),
                        _ => None,
                    }
                }),
            )
    }

    /// Load the configuration, highest priority last:
    /// 1. defaults
    /// 2. /opt/dynamo/etc/stride.toml
    /// 3. the TOML file named by DYN_STRIDE_CONFIG_PATH
    /// 4. DYN_STRIDE_* environment variables
    pub fn from_settings() -> Result<StrideConfig> {
        use environment_names as env;

        let mut config: StrideConfig = Self::figment().extract()?;

        if let Some(disable) = dynamo_config::env_parse_bool(env::DYN_STRIDE_DISABLE)? {
            config.disable = disable;
        }
        if let Some(measure) = dynamo_config::env_parse_bool(env::DYN_STRIDE_MEASURE)? {
            config.measure = measure;
        }
        if let Some(aware) = dynamo_config::env_parse_bool(env::DYN_STRIDE_DEVICE_AWARE)? {
            config.device_aware = aware;
        }
        if let Some(pinned) = dynamo_config::env_parse_bool(env::DYN_STRIDE_PINNED_STAGING)? {
            config.pinned_staging = pinned;
        }
        if let Some(bytes) = dynamo_config::env_parse_byte_size(env::DYN_STRIDE_STAGING_RESERVE_BYTES)? {
            config.staging_reserve_bytes = bytes;
        }

        config.validate()?;
        Ok(config)
    }

    /// Staging pool sized from this configuration.
    pub fn staging_pool_config(&self) -> StagingPoolConfig {
        StagingPoolConfig {
            host_reserve_bytes: self.staging_reserve_bytes,
            device_reserve_bytes: self.staging_reserve_bytes,
            pinned_host: self.pinned_staging,
            ..StagingPoolConfig::default()
        }
    }
}

impl StrideConfigBuilder {
    /// Build and validate the configuration
    pub fn build(&self) -> Result<StrideConfig> {
        let config = self.build_internal()?;
        config.validate()?;
        Ok(config)
    }
}
