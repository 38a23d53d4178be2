//! Layered settings: defaults <- optional config file <- `LEASEHOLD_*` env.
//!
//! Scheduler keys sit at the top level, so `LEASEHOLD_WORKER_COUNT=4` or
//! `worker_count = 4` in `leasehold.toml` both work. Nested keys use a double
//! underscore: `LEASEHOLD_RETRY__BASE_DELAY_MS=500`.

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use leasehold_core::SchedulerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,

    /// `sqlite://...` URL; in-memory store when unset.
    pub database_url: Option<String>,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("leasehold").required(false)),
        };
        builder
            .add_source(
                Environment::with_prefix("LEASEHOLD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("leasehold-settings-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "worker_count = 5\ndatabase_url = \"sqlite://x.db\"\n[retry]\nbase_delay_ms = 250\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.scheduler.worker_count, 5);
        assert_eq!(settings.scheduler.retry.base_delay_ms, 250);
        assert_eq!(settings.scheduler.max_concurrent, SchedulerConfig::default().max_concurrent);
        assert_eq!(settings.database_url.as_deref(), Some("sqlite://x.db"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/leasehold.toml"))).is_err());
    }
}
