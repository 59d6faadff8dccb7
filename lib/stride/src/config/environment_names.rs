// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable names read by the stride layer.
//!
//! Every key of [`super::StrideConfig`] can be set with `DYN_STRIDE_<KEY>`; the constants
//! below are the ones the crate reads by name.

/// Logging environment variables
pub mod logging {
    /// Filter directives overriding the configured verbosity (e.g. "dynamo_stride=debug")
    pub const DYN_LOG: &str = "DYN_LOG";
}

/// Prefix of every stride configuration variable
pub const DYN_STRIDE_PREFIX: &str = "DYN_STRIDE_";

/// Path to an extra TOML configuration file
pub const DYN_STRIDE_CONFIG_PATH: &str = "DYN_STRIDE_CONFIG_PATH";

/// Forward every call to the wrapped library untouched
pub const DYN_STRIDE_DISABLE: &str = "DYN_STRIDE_DISABLE";

/// Default log level: error, warn, info, debug or trace
pub const DYN_STRIDE_VERBOSITY: &str = "DYN_STRIDE_VERBOSITY";

/// Time the strategies at start-up
pub const DYN_STRIDE_MEASURE: &str = "DYN_STRIDE_MEASURE";

/// Iterations per strategy and size during measurement
pub const DYN_STRIDE_MEASURE_ITERATIONS: &str = "DYN_STRIDE_MEASURE_ITERATIONS";

/// File the performance table is loaded from and saved to
pub const DYN_STRIDE_PERF_CACHE_PATH: &str = "DYN_STRIDE_PERF_CACHE_PATH";

/// Bytes reserved for staging buffers, e.g. "64MiB"
pub const DYN_STRIDE_STAGING_RESERVE_BYTES: &str = "DYN_STRIDE_STAGING_RESERVE_BYTES";

/// Back host staging with pinned memory (requires the cuda feature)
pub const DYN_STRIDE_PINNED_STAGING: &str = "DYN_STRIDE_PINNED_STAGING";

/// The wrapped library reads and writes device memory directly
pub const DYN_STRIDE_DEVICE_AWARE: &str = "DYN_STRIDE_DEVICE_AWARE";
