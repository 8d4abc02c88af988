//! Layered configuration loading.
//!
//! Uses `figment` for layering: defaults -> workspace file -> environment ->
//! explicit overrides. Any serde struct with a `Default` can be loaded this
//! way; the engine's `RunnerConfig` is the main consumer.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default name of the workspace-level config file.
pub const CONFIG_FILE: &str = "trainforge.toml";

/// Default prefix for environment overrides (`TRAINFORGE_SEED=7`,
/// `TRAINFORGE_OPTIMIZER__LR=0.01`, ...).
pub const ENV_PREFIX: &str = "TRAINFORGE_";

/// Logging configuration consumed by [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the stderr layer, e.g. `info` or
    /// `trainforge_engine=debug`.
    pub level: String,
    /// Directory for the JSON log file. No file layer when unset.
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the daily-rolling JSON log.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "trainforge.log".to_string(),
        }
    }
}

/// Load a configuration struct from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables prefixed with [`ENV_PREFIX`], nested keys split on `__`
/// 3. `<workspace>/trainforge.toml`
/// 4. `T::default()`
pub fn load_layered<T>(workspace: Option<&Path>, overrides: Option<&T>) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(ws) = workspace {
        let file = ws.join(CONFIG_FILE);
        if file.exists() {
            figment = figment.merge(Toml::file(&file));
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    Ok(figment.extract().map_err(Box::new)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        seed: u64,
        model_version: String,
        optimizer: SampleOptimizer,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct SampleOptimizer {
        lr: f64,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                seed: 42,
                model_version: "model".into(),
                optimizer: SampleOptimizer::default(),
            }
        }
    }

    impl Default for SampleOptimizer {
        fn default() -> Self {
            Self { lr: 0.001 }
        }
    }

    #[test]
    fn test_defaults_without_sources() {
        figment::Jail::expect_with(|_jail| {
            let cfg: Sample = load_layered(None, None).unwrap();
            assert_eq!(cfg, Sample::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                seed = 7
                model_version = "resnet"
                "#,
            )?;
            jail.set_env("TRAINFORGE_OPTIMIZER__LR", "0.01");
            jail.set_env("TRAINFORGE_SEED", "9");

            let cfg: Sample = load_layered(Some(jail.directory()), None).unwrap();
            assert_eq!(cfg.seed, 9);
            assert_eq!(cfg.model_version, "resnet");
            assert_eq!(cfg.optimizer.lr, 0.01);
            Ok(())
        });
    }

    #[test]
    fn test_overrides_win() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("TRAINFORGE_SEED", "9");
            let overrides = Sample {
                seed: 1,
                ..Sample::default()
            };
            let cfg: Sample = load_layered(None, Some(&overrides)).unwrap();
            assert_eq!(cfg.seed, 1);
            Ok(())
        });
    }
}
