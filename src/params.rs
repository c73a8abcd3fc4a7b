//! Per-volume parameter parsing.

use log::warn;

use crate::config::ArbiterConfig;

/// Parses `migration_timeout_seconds` out of a raw provisioning string,
/// clamping to `[min, max]` and falling back to `default` on anything
/// that doesn't parse as a positive integer.
///
/// Boundary table:
/// `"abc"`, `"-5"`, `"0"` → default; `"10"` → min; `"30"` → 30;
/// `"3600"` → 3600; `"7200"` → max.
pub fn parse_migration_timeout_seconds(raw: Option<&str>, cfg: &ArbiterConfig) -> u32 {
    let default = cfg.migration_timeout_default_secs;
    let min = cfg.migration_timeout_min_secs;
    let max = cfg.migration_timeout_max_secs;

    let Some(raw) = raw else {
        return default;
    };

    let parsed: i64 = match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!("migration_timeout_seconds={raw:?} is not an integer, using default {default}s");
            return default;
        }
    };

    if parsed <= 0 {
        warn!("migration_timeout_seconds={parsed} is not positive, using default {default}s");
        return default;
    }

    let parsed = parsed as u32;
    if parsed < min {
        warn!("migration_timeout_seconds={parsed} below minimum, clamping up to {min}s");
        min
    } else if parsed > max {
        warn!("migration_timeout_seconds={parsed} above maximum, clamping down to {max}s");
        max
    } else {
        parsed
    }
}
