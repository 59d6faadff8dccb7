// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration value parsing shared by the workspace crates.
//!
//! Switches such as `DYN_STRIDE_DISABLE=1` are read once at startup. The helpers here
//! give every crate the same interpretation of booleans and byte sizes so that
//! `1`, `true`, `on` and `yes` always mean the same thing.

// ===== Boolean values =====

/// Check if a string is truthy.
///
/// Truthy values: "1", "true", "on", "yes" (case-insensitive)
///
/// Returns `false` for invalid values. Use [`parse_bool`] if you need to error on invalid values.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey.
///
/// Falsey values: "0", "false", "off", "no" (case-insensitive)
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

/// Parse a string as a boolean value, returning an error if invalid.
///
/// # Example
/// ```
/// # use dynamo_config::parse_bool;
/// assert!(parse_bool("on").unwrap());
/// assert!(!parse_bool("0").unwrap());
/// assert!(parse_bool("maybe").is_err());
/// ```
pub fn parse_bool(val: &str) -> anyhow::Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if is_falsey(val) {
        Ok(false)
    } else {
        anyhow::bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

/// Check if an environment variable is truthy.
///
/// Returns `false` if the environment variable is not set or is invalid.
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Parse an environment variable as a boolean, returning an error if invalid.
///
/// * `Ok(Some(_))` - the variable is set to a valid boolean
/// * `Ok(None)` - the variable is not set, or set to the empty string
/// * `Err(_)` - the variable is set to something that is not a boolean
pub fn env_parse_bool(env: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(env) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => parse_bool(&val).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => anyhow::bail!("Failed to read environment variable {}: {}", env, e),
    }
}

// ===== Byte sizes =====

/// Parse a human readable byte size.
///
/// Accepts a plain integer (`"4096"`) or an integer with a binary suffix:
/// `k`/`KiB`, `m`/`MiB`, `g`/`GiB` (case-insensitive, optional `B`).
///
/// # Example
/// ```
/// # use dynamo_config::parse_byte_size;
/// assert_eq!(parse_byte_size("64MiB").unwrap(), 64 * 1024 * 1024);
/// assert_eq!(parse_byte_size("4k").unwrap(), 4096);
/// assert_eq!(parse_byte_size("17").unwrap(), 17);
/// ```
pub fn parse_byte_size(val: &str) -> anyhow::Result<usize> {
    let trimmed = val.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);

    if digits.is_empty() {
        anyhow::bail!("Invalid byte size: '{}'. Expected e.g. 4096, 64KiB, 16MiB", val);
    }

    let base: usize = digits
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid byte size '{}': {}", val, e))?;

    let multiplier: usize = match suffix.trim().to_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        other => anyhow::bail!("Unknown byte size suffix '{}' in '{}'", other, val),
    };

    base.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Byte size '{}' overflows usize", val))
}

/// Parse an environment variable as a byte size.
///
/// Returns `Ok(None)` if the variable is unset or empty.
pub fn env_parse_byte_size(env: &str) -> anyhow::Result<Option<usize>> {
    match std::env::var(env) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => parse_byte_size(&val).map(Some),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => anyhow::bail!("Failed to read environment variable {}: {}", env, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("True"));
        assert!(is_truthy("ON"));
        assert!(is_truthy("yes"));

        assert!(!is_truthy("0"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("random"));
    }

    #[test]
    fn test_is_falsey() {
        assert!(is_falsey("0"));
        assert!(is_falsey("FALSE"));
        assert!(is_falsey("off"));
        assert!(is_falsey("No"));

        assert!(!is_falsey("1"));
        assert!(!is_falsey(""));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("off").unwrap());

        assert!(parse_bool("").is_err());
        assert!(parse_bool("2").is_err());
    }

    #[test]
    fn test_env_parse_bool_not_set() {
        assert_eq!(
            env_parse_bool("DEFINITELY_NOT_SET_VAR_12345").unwrap(),
            None
        );
        assert!(!env_is_truthy("DEFINITELY_NOT_SET_VAR_12345"));
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("0").unwrap(), 0);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("4k").unwrap(), 4096);
        assert_eq!(parse_byte_size("4KiB").unwrap(), 4096);
        assert_eq!(parse_byte_size(" 2 MiB ").unwrap(), 2 << 20);
        assert_eq!(parse_byte_size("1g").unwrap(), 1 << 30);

        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("MiB").is_err());
        assert!(parse_byte_size("12parsecs").is_err());
    }
}
