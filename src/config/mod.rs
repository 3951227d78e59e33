//! Layered configuration: built-in defaults, then an optional TOML file, then
//! `POPQ_`-prefixed environment variables (`POPQ_SERVER__PORT=9000`).

mod settings;

use config::{Config, ConfigError, Environment, File};
use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, ServerSettings, Settings};

/// Loads `config/default.{toml,...}` from the working directory if present,
/// merged with the environment and the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Like [`load_config`], but an explicit path replaces `config/default` and
/// must exist.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix("POPQ")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge())
}

#[cfg(test)]
mod tests;
