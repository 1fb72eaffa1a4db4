use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 600_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;
const MIN_RETENTION: u32 = 1;
const MAX_RETENTION: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreviewSettings {
    pub dev_server_timeout_ms: u64,
    pub render_timeout_ms: u64,
    pub memory_retry_delay_ms: u64,
    pub install_command: Vec<String>,
    pub dev_command: Vec<String>,
    pub sandbox_root: PathBuf,
    pub report_database: Option<PathBuf>,
    pub report_retention: u32,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            dev_server_timeout_ms: 30_000,
            render_timeout_ms: 8_000,
            memory_retry_delay_ms: 1_000,
            install_command: ["npm", "install", "--prefer-offline", "--no-audit", "--progress=false"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            dev_command: ["npm", "run", "dev"].into_iter().map(ToString::to_string).collect(),
            sandbox_root: std::env::temp_dir().join("vibe-preview"),
            report_database: None,
            report_retention: 200,
        }
    }
}

impl PreviewSettings {
    /// Defaults, overlaid with the JSON file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|error| AppError::Config(format!("Unable to read {}: {}", path.display(), error)))?;
                let overlay: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|error| AppError::Config(format!("Invalid settings JSON: {}", error)))?;
                Self::default().with_overrides(overlay)?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_overrides(&self, overrides: serde_json::Value) -> AppResult<Self> {
        let mut current = serde_json::to_value(self)?;
        merge_json(&mut current, overrides);
        let next: Self = serde_json::from_value(current)
            .map_err(|error| AppError::Config(format!("Invalid settings override: {}", error)))?;
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> AppResult<()> {
        for (label, value) in [
            ("devServerTimeoutMs", self.dev_server_timeout_ms),
            ("renderTimeoutMs", self.render_timeout_ms),
        ] {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&value) {
                return Err(AppError::Config(format!(
                    "{} must be between {} and {}",
                    label, MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
                )));
            }
        }
        if self.memory_retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(AppError::Config(format!(
                "memoryRetryDelayMs must be at most {}",
                MAX_RETRY_DELAY_MS
            )));
        }
        if self.install_command.is_empty() || self.dev_command.is_empty() {
            return Err(AppError::Config("installCommand and devCommand cannot be empty".to_string()));
        }
        if !(MIN_RETENTION..=MAX_RETENTION).contains(&self.report_retention) {
            return Err(AppError::Config(format!(
                "reportRetention must be between {} and {}",
                MIN_RETENTION, MAX_RETENTION
            )));
        }
        Ok(())
    }

    pub fn dev_server_timeout(&self) -> Duration {
        Duration::from_millis(self.dev_server_timeout_ms)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn memory_retry_delay(&self) -> Duration {
        Duration::from_millis(self.memory_retry_delay_ms)
    }
}

pub(crate) fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (_, serde_json::Value::Null) => {}
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PreviewSettings;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn defaults_match_pipeline_timings() {
        let settings = PreviewSettings::default();
        assert_eq!(settings.dev_server_timeout_ms, 30_000);
        assert_eq!(settings.render_timeout_ms, 8_000);
        assert_eq!(settings.install_command[1], "install");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn overrides_merge_without_resetting_other_fields() {
        let settings = PreviewSettings::default()
            .with_overrides(json!({ "renderTimeoutMs": 12000, "devCommand": null }))
            .expect("override");
        assert_eq!(settings.render_timeout_ms, 12_000);
        assert_eq!(settings.dev_command, vec!["npm", "run", "dev"]);
    }

    #[test]
    fn rejects_out_of_range_timeouts() {
        let error = PreviewSettings::default()
            .with_overrides(json!({ "devServerTimeoutMs": 5 }))
            .expect_err("too short");
        assert!(error.to_string().starts_with("CONFIG_INVALID"));
    }

    #[test]
    fn loads_partial_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "reportRetention": 5 }}"#).expect("write");
        let settings = PreviewSettings::load(Some(file.path())).expect("load");
        assert_eq!(settings.report_retention, 5);
        assert_eq!(settings.render_timeout_ms, 8_000);
    }
}
