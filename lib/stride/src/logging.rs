// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging for the stride layer.
//!
//! Events go to stderr in the compact `tracing_subscriber::fmt` format. The default level
//! comes from [`crate::config::Verbosity`]; `DYN_LOG` replaces it with arbitrary filter
//! directives, e.g. `DYN_LOG=dynamo_stride::selector=debug,warn`.

use crate::config::Verbosity;
use crate::config::environment_names::logging as env_logging;
use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Install the stderr subscriber. Later calls, and calls after another global subscriber
/// was installed by the host application, do nothing.
pub fn init(verbosity: Verbosity) {
    INIT.call_once(|| {
        let l = fmt::layer()
            .event_format(fmt::format().compact())
            .with_writer(std::io::stderr)
            .with_filter(filters(verbosity));
        if let Err(e) = tracing_subscriber::registry().with(l).try_init() {
            eprintln!("stride logging not installed: {e}");
        }
    });
}

fn filters(verbosity: Verbosity) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level(verbosity).into())
        .with_env_var(env_logging::DYN_LOG)
        .from_env_lossy()
}

fn level(verbosity: Verbosity) -> LevelFilter {
    match verbosity {
        Verbosity::Error => LevelFilter::ERROR,
        Verbosity::Warn => LevelFilter::WARN,
        Verbosity::Info => LevelFilter::INFO,
        Verbosity::Debug => LevelFilter::DEBUG,
        Verbosity::Trace => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_follows_verbosity() {
        temp_env::with_var(env_logging::DYN_LOG, None::<&str>, || {
            assert_eq!(filters(Verbosity::Debug).max_level_hint(), Some(LevelFilter::DEBUG));
            assert_eq!(filters(Verbosity::Error).max_level_hint(), Some(LevelFilter::ERROR));
        });
    }

    #[test]
    fn test_dyn_log_overrides() {
        temp_env::with_var(env_logging::DYN_LOG, Some("trace"), || {
            assert_eq!(filters(Verbosity::Warn).max_level_hint(), Some(LevelFilter::TRACE));
        });
    }

    #[test]
    fn test_init_is_idempotent() {
        init(Verbosity::Warn);
        init(Verbosity::Trace);
    }
}
