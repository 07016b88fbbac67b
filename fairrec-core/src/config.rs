//! Layered configuration loading.
//!
//! Uses `figment` to merge, from lowest to highest priority:
//! 1. Built-in defaults (`T::default()`)
//! 2. Each TOML file, in the order given
//! 3. Environment variables with the given prefix (`__` separates nested keys)
//! 4. Explicit overrides
//!
//! Configuration files are looked up at `~/.config/fairrec/config.toml` and
//! `<workspace>/.fairrec/config.toml`.

use crate::error::CoreError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable prefix used by the CLI (`FAIRREC_EPOCHS=50`).
pub const ENV_PREFIX: &str = "FAIRREC_";

/// Merge defaults, TOML files, environment and overrides into `T`.
pub fn load_layered<T>(files: &[PathBuf], env_prefix: &str, overrides: Option<&T>) -> Result<T, CoreError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    for file in files {
        if file.exists() {
            figment = figment.merge(Toml::file(file));
        } else {
            tracing::warn!(path = %file.display(), "Configuration file not found, skipping");
        }
    }

    figment = figment.merge(Env::prefixed(env_prefix).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| CoreError::Config(Box::new(e)))
}

/// Existing configuration files, user-level first, then workspace-level.
pub fn default_config_files(workspace: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Some(dirs) = directories::ProjectDirs::from("dev", "fairrec", "fairrec") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            files.push(user_config);
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".fairrec").join("config.toml");
        if ws_config.exists() {
            files.push(ws_config);
        }
    }

    files
}

/// Whether any user-level or workspace-level configuration file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    !default_config_files(workspace).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        learner: String,
        epochs: usize,
        learning_rate: f64,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                learner: "adam".into(),
                epochs: 300,
                learning_rate: 0.001,
            }
        }
    }

    #[test]
    fn test_defaults_when_no_sources() {
        let loaded: Sample = load_layered(&[], "FAIRREC_CORE_TEST_NONE_", None).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_later_files_take_priority() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("base.toml");
        let run = dir.path().join("run.toml");
        std::fs::write(&base, "learner = \"sgd\"\nepochs = 10\n").unwrap();
        std::fs::write(&run, "epochs = 20\n").unwrap();

        let loaded: Sample = load_layered(&[base, run], "FAIRREC_CORE_TEST_FILES_", None).unwrap();
        assert_eq!(loaded.learner, "sgd");
        assert_eq!(loaded.epochs, 20);
        assert_eq!(loaded.learning_rate, 0.001);
    }

    #[test]
    fn test_overrides_win() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("run.toml");
        std::fs::write(&file, "epochs = 20\n").unwrap();
        let overrides = Sample {
            learner: "rmsprop".into(),
            epochs: 3,
            learning_rate: 0.5,
        };

        let loaded: Sample =
            load_layered(&[file], "FAIRREC_CORE_TEST_OVERRIDES_", Some(&overrides)).unwrap();
        assert_eq!(loaded, overrides);
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let loaded: Sample = load_layered(
            &[PathBuf::from("/nonexistent/fairrec.toml")],
            "FAIRREC_CORE_TEST_MISSING_",
            None,
        )
        .unwrap();
        assert_eq!(loaded.epochs, 300);
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bad.toml");
        std::fs::write(&file, "epochs = \"many\"\n").unwrap();

        let result: Result<Sample, CoreError> = load_layered(&[file], "FAIRREC_CORE_TEST_BAD_", None);
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_workspace_config_detected() {
        let dir = TempDir::new().unwrap();
        assert!(!default_config_files(Some(dir.path()))
            .iter()
            .any(|p| p.starts_with(dir.path())));

        let cfg_dir = dir.path().join(".fairrec");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(cfg_dir.join("config.toml"), "epochs = 1\n").unwrap();

        assert!(config_exists(Some(dir.path())));
        assert!(default_config_files(Some(dir.path()))
            .iter()
            .any(|p| p.starts_with(dir.path())));
    }
}
