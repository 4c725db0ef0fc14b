//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles YAML file discovery,
//! environment detection, section merging and environment variable overrides.

use super::error::{ConfigResult, ConfigurationError};
use super::WorkerConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_NAMES: [&str; 2] = ["worker-config.yaml", "worker-config.yml"];
const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];

/// Loaded configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: WorkerConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Environment variable overrides still come from the process environment.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, |key| env::var(key).ok())
    }

    /// Load configuration resolving overrides through `lookup`
    pub fn load_with_overrides<F>(
        config_dir: Option<PathBuf>,
        environment: &str,
        lookup: F,
    ) -> ConfigResult<Arc<ConfigManager>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment)?;
        Self::apply_env_overrides(&mut config, lookup)?;
        config.validate()?;

        let sanitized_config = Self::sanitize_config_for_logging(&config);
        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&sanitized_config)
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = %environment,
            topic = %config.queue.topic,
            namespace = %config.kubernetes.namespace,
            max_concurrent_tasks = config.executor.max_concurrent_tasks,
            "Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration
    pub fn from_config(config: WorkerConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: PathBuf::from("config"),
        }))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Sanitized configuration for debugging output
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect current environment: WORKER_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("WORKER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        const MAX_CONFIG_FILE_SIZE: u64 = 10 * 1024 * 1024; // 10MB limit

        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                metadata.len().to_string(),
                format!(
                    "Configuration file too large ({}MB > {}MB limit)",
                    metadata.len() / (1024 * 1024),
                    MAX_CONFIG_FILE_SIZE / (1024 * 1024)
                ),
            ));
        }

        if !metadata.is_file() {
            return Err(ConfigurationError::invalid_value(
                "file_type",
                "directory or special file",
                "Configuration path must point to a regular file",
            ));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let mut searched_paths = Vec::new();

        for name in CONFIG_FILE_NAMES {
            let config_path = config_directory.join(name);
            searched_paths.push(config_path.clone());

            if config_path.exists() {
                debug!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        Err(ConfigurationError::config_file_not_found(searched_paths))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<WorkerConfig> {
        let config_file = Self::find_config_file(config_directory)?;
        let yaml_content = Self::read_config_file_safely(&config_file)?;

        let mut yaml_data: YamlValue = serde_yaml::from_str(&yaml_content)
            .map_err(|e| ConfigurationError::invalid_yaml(config_file.display().to_string(), e))?;

        if let Some(env_overrides) = yaml_data
            .get(YamlValue::String(environment.to_string()))
            .cloned()
        {
            debug!(
                "Applying environment-specific overrides for: {}",
                environment
            );
            Self::merge_yaml_values(&mut yaml_data, env_overrides);
        }

        if let YamlValue::Mapping(ref mut map) = yaml_data {
            for section in ENVIRONMENTS {
                map.remove(YamlValue::String(section.to_string()));
            }
        }

        serde_yaml::from_value(yaml_data).map_err(|e| {
            ConfigurationError::invalid_yaml(
                config_file.display().to_string(),
                format!("Failed to deserialize configuration: {e}"),
            )
        })
    }

    /// Recursively merge YAML values (environment overrides into base config)
    fn merge_yaml_values(base: &mut YamlValue, override_value: YamlValue) {
        match (&mut *base, override_value) {
            (YamlValue::Mapping(base_map), YamlValue::Mapping(override_map)) => {
                for (key, value) in override_map {
                    if let Some(existing_value) = base_map.get_mut(&key) {
                        Self::merge_yaml_values(existing_value, value);
                    } else {
                        base_map.insert(key, value);
                    }
                }
            }
            (base_ref, override_val) => {
                *base_ref = override_val;
            }
        }
    }

    fn apply_env_overrides<F>(config: &mut WorkerConfig, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(topic) = lookup("WORKER_QUEUE_TOPIC") {
            config.queue.topic = topic;
        }
        if let Some(namespace) = lookup("WORKER_NAMESPACE") {
            config.kubernetes.namespace = namespace;
        }
        if let Some(limit) = lookup("WORKER_MAX_CONCURRENT_TASKS") {
            config.executor.max_concurrent_tasks = limit.parse().map_err(|_| {
                ConfigurationError::environment_override(
                    "WORKER_MAX_CONCURRENT_TASKS",
                    format!("'{limit}' is not a positive integer"),
                )
            })?;
        }
        Ok(())
    }

    fn sanitize_config_for_logging(config: &WorkerConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "key", "token", "credential", "auth"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);

        // Database URLs embed credentials
        if let Some(url) = config_json.pointer_mut("/database/url") {
            *url = serde_json::Value::String("[MASKED]".to_string());
        }
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        *val = serde_json::Value::String("[MASKED]".to_string());
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutPolicy;
    use crate::models::ResourceKind;
    use std::fs;
    use tempfile::TempDir;

    const BASE_CONFIG: &str = r#"
queue:
  topic: worker
  retry_backoff_seconds: 3
executor:
  max_concurrent_tasks: 16
rollout:
  stateless_resource: ReplicationController
timeouts:
  rolling_upgrade: fail
database:
  url: postgresql://worker:secret@db/worker
status:
  endpoints:
    - http://status-a:6363
test:
  executor:
    max_concurrent_tasks: 2
  rollout:
    step_interval_ms: 10
production:
  rollout:
    stateless_resource: Deployment
"#;

    fn write_config(contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("worker-config.yaml"), contents).unwrap();
        dir
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_environment_section_merged() {
        let dir = write_config(BASE_CONFIG);
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", no_env)
                .unwrap();

        let config = manager.config();
        assert_eq!(config.executor.max_concurrent_tasks, 2);
        assert_eq!(config.rollout.step_interval_ms, 10);
        assert_eq!(config.queue.retry_backoff_seconds, 3);
        assert_eq!(config.timeouts.rolling_upgrade, TimeoutPolicy::Fail);
        assert_eq!(config.timeouts.start, TimeoutPolicy::Continue);
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_production_section_selects_deployment() {
        let dir = write_config(BASE_CONFIG);
        let manager = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "production",
            no_env,
        )
        .unwrap();

        assert_eq!(
            manager.config().rollout.stateless_resource,
            ResourceKind::Deployment
        );
        assert_eq!(manager.config().executor.max_concurrent_tasks, 16);
    }

    #[test]
    fn test_env_overrides_applied() {
        let dir = write_config(BASE_CONFIG);
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", |key| {
                match key {
                    "WORKER_QUEUE_TOPIC" => Some("builder".to_string()),
                    "WORKER_MAX_CONCURRENT_TASKS" => Some("9".to_string()),
                    _ => None,
                }
            })
            .unwrap();

        assert_eq!(manager.config().queue.topic, "builder");
        assert_eq!(manager.config().executor.max_concurrent_tasks, 9);
    }

    #[test]
    fn test_bad_env_override_rejected() {
        let dir = write_config(BASE_CONFIG);
        let result =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", |key| {
                (key == "WORKER_MAX_CONCURRENT_TASKS").then(|| "lots".to_string())
            });

        assert!(matches!(
            result,
            Err(ConfigurationError::EnvironmentOverrideError { .. })
        ));
    }

    #[test]
    fn test_missing_file_reports_search_paths() {
        let dir = TempDir::new().unwrap();
        let result =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", no_env);

        match result {
            Err(ConfigurationError::ConfigFileNotFound { searched_paths }) => {
                assert_eq!(searched_paths.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_database_url_masked_in_debug_output() {
        let dir = write_config(BASE_CONFIG);
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", no_env)
                .unwrap();

        let debug = manager.debug_config();
        assert_eq!(debug["database"]["url"], "[MASKED]");
        assert_eq!(debug["queue"]["topic"], "worker");
    }
}
