mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, LoggingSettings, PartialSettings, ServerSettings, Settings, StorageSettings,
    TopicNames, TopicsSettings,
};

pub const ENV_PREFIX: &str = "REPORTBUS";

/// Loads the configuration from `config/default` (if present) and
/// `REPORTBUS_`-prefixed environment variables, `__` separating nested keys
/// (`REPORTBUS_BROKER__URL`). Environment wins over the file.
///
/// Missing required keys are an error; callers treat it as fatal.
pub fn load_config() -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    partial.resolve()
}
