use crate::domain::error::{AppError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Control plane configuration, merged from defaults, an optional
/// `distill.toml` next to the working directory, and `DISTILL_`-prefixed
/// environment variables (highest precedence).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Root directory for the database, artifacts and backups.
    pub data_dir: PathBuf,
    /// Database file name, relative to `data_dir`.
    pub db_file: String,
    /// Command used to launch the training worker.
    pub trainer_command: String,
    /// Command used to launch the evaluation worker.
    pub evaluator_command: String,
    /// Dataset whose metrics gate promotion. When unset, every recorded
    /// metric of the candidate and incumbent versions is compared.
    pub guardrail_dataset_id: Option<String>,
    /// Rolling daily database backups to keep.
    pub max_daily_backups: usize,
    /// Seconds a cancelled worker gets to exit on its own before being killed.
    pub cancel_grace_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            db_file: "training.db".to_string(),
            trainer_command: "python3 -m distill_worker.train".to_string(),
            evaluator_command: "python3 -m distill_worker.evaluate".to_string(),
            guardrail_dataset_id: None,
            max_daily_backups: 7,
            cancel_grace_secs: 10,
        }
    }
}

impl ControlPlaneConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("distill.toml"))
    }

    pub fn load_from(config_file: &Path) -> Result<Self> {
        let config: ControlPlaneConfig = Figment::new()
            .merge(Serialized::defaults(ControlPlaneConfig::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("DISTILL_"))
            .extract()
            .map_err(|e| AppError::ValidationError(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.db_file.trim().is_empty() {
            return Err(AppError::ValidationError(
                "db_file must not be empty".to_string(),
            ));
        }
        if self.trainer_command.trim().is_empty() || self.evaluator_command.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Worker commands must not be empty".to_string(),
            ));
        }
        if self.max_daily_backups == 0 {
            return Err(AppError::ValidationError(
                "max_daily_backups must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.db_path(), PathBuf::from("data/training.db"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ControlPlaneConfig::load_from(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.max_daily_backups, 7);
        assert!(config.guardrail_dataset_id.is_none());
    }
}
