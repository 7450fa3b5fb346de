use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let invalid = |message: String| Err(ConfigError::Validation { message });

    if config.version != "1.0" {
        return invalid(format!("Unsupported config version: {}", config.version));
    }

    let pool = &config.pool;
    if pool.max_workers == 0 {
        return invalid("pool.max_workers must be at least 1".to_string());
    }
    if pool.min_workers > pool.max_workers {
        return invalid(format!(
            "pool.min_workers ({}) exceeds pool.max_workers ({})",
            pool.min_workers, pool.max_workers
        ));
    }

    let guard = &config.guard;
    if guard.warn_threshold_percent >= guard.block_threshold_percent {
        return invalid(format!(
            "guard.warn_threshold_percent ({}) must be below guard.block_threshold_percent ({})",
            guard.warn_threshold_percent, guard.block_threshold_percent
        ));
    }
    if guard.block_threshold_percent > guard.autonomous_trip_percent {
        return invalid(format!(
            "guard.block_threshold_percent ({}) must not exceed guard.autonomous_trip_percent ({})",
            guard.block_threshold_percent, guard.autonomous_trip_percent
        ));
    }
    if guard.autonomous_trip_percent > 100.0 {
        return invalid("guard.autonomous_trip_percent must not exceed 100".to_string());
    }
    let bands = &guard.alert_bands;
    if !(bands.info < bands.warning && bands.warning < bands.critical) {
        return invalid("guard.alert_bands must be ordered info < warning < critical".to_string());
    }
    if guard.breaker.max_failures == 0 {
        return invalid("guard.breaker.max_failures must be at least 1".to_string());
    }

    config
        .migration
        .validate()
        .map_err(|message| ConfigError::Validation {
            message: format!("migration: {}", message),
        })?;

    Ok(())
}
