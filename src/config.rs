use serde::Deserialize;
use std::path::PathBuf;

/// Startup settings. Sources, lowest priority first: built-in defaults,
/// `lmsgraded.toml` in the working directory, then `LMSGRADED_*` environment
/// variables (a `.env` file is loaded into the environment first).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Workspace opened before the first request, if set.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// `tracing` filter directive; `RUST_LOG` wins when present.
    pub log: String,
}

impl Config {
    pub fn load() -> Result<Self, ::config::ConfigError> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .set_default("log", "info")?
            .add_source(::config::File::with_name("lmsgraded").required(false))
            .add_source(::config::Environment::with_prefix("LMSGRADED"))
            .build()?;

        settings.try_deserialize()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            log: "info".to_string(),
        }
    }
}
