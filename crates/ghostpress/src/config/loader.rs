use std::path::Path;

use crate::config::schema::GhostpressConfig;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<GhostpressConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<GhostpressConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: GhostpressConfig = serde_json::from_value(json_value)?;

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

fn validate_config(config: &GhostpressConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.engine.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "engine.worker_count must be at least 1".to_string(),
        });
    }

    if config.engine.parallelism == 0 {
        return Err(ConfigError::Validation {
            message: "engine.parallelism must be at least 1".to_string(),
        });
    }

    if config.queue.max_concurrent_jobs == Some(0) {
        return Err(ConfigError::Validation {
            message: "queue.max_concurrent_jobs must be at least 1 when set".to_string(),
        });
    }

    if !(config.simulation.size_ratio > 0.0 && config.simulation.size_ratio <= 1.0) {
        return Err(ConfigError::Validation {
            message: format!(
                "simulation.size_ratio {} is outside (0, 1]",
                config.simulation.size_ratio
            ),
        });
    }

    config
        .defaults
        .validate()
        .map_err(|e| ConfigError::Validation {
            message: format!("Invalid default settings: {}", e),
        })?;

    Ok(())
}
