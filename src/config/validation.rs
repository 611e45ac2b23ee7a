//! Configuration value validation.
//!
//! Low-level checks for individual values plus the whole-config pass run
//! after loading. Errors carry plain messages; the loader wraps them into
//! configuration errors.
use crate::config::ManagerConfig;

/// Validate a string value against a list of allowed values.
pub fn validate_enum(value: &str, allowed: &[&str]) -> Result<(), String> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(format!(
            "invalid value '{}'; allowed values: {}",
            value,
            allowed.join(", ")
        ))
    }
}

/// Validate that a floating-point value is at least `min`.
pub fn validate_min_f64(name: &str, value: f64, min: f64) -> Result<(), String> {
    if value >= min {
        Ok(())
    } else {
        Err(format!("{} must be at least {}, got {}", name, min, value))
    }
}

/// Validate that an integer value is positive.
pub fn validate_positive(name: &str, value: u64) -> Result<(), String> {
    if value > 0 {
        Ok(())
    } else {
        Err(format!("{} must be positive", name))
    }
}

/// Whole-configuration consistency pass.
pub fn validate_config(c: &ManagerConfig) -> Result<(), String> {
    validate_enum(
        &c.scheduler.policy,
        &["fcfs", "files", "time", "worst", "worst-fit", "random", "rand"],
    )
    .map_err(|e| format!("scheduler.policy: {}", e))?;

    validate_min_f64(
        "scheduler.resource_submit_multiplier",
        c.scheduler.resource_submit_multiplier,
        1.0,
    )?;
    validate_min_f64(
        "timeouts.transfer_outlier_factor",
        c.timeouts.transfer_outlier_factor,
        1.0,
    )?;
    validate_min_f64(
        "timeouts.default_transfer_rate",
        c.timeouts.default_transfer_rate,
        1.0,
    )?;

    validate_positive("timeouts.short_timeout", c.timeouts.short_timeout)?;
    validate_positive("timeouts.keepalive_interval", c.timeouts.keepalive_interval)?;
    validate_positive("timeouts.keepalive_timeout", c.timeouts.keepalive_timeout)?;
    validate_positive(
        "timeouts.minimum_transfer_timeout",
        c.timeouts.minimum_transfer_timeout,
    )?;
    validate_positive(
        "manager.catalog_update_interval",
        c.manager.catalog_update_interval,
    )?;

    match (&c.manager.ssl_key, &c.manager.ssl_cert) {
        (Some(_), None) | (None, Some(_)) => {
            return Err("manager.ssl_key and manager.ssl_cert must be set together".to_string());
        }
        _ => {}
    }

    Ok(())
}
