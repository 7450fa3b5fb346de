pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    AlertBands, BreakerConfig, Config, GuardConfig, LogFormat, LoggingConfig, MigrationConfig,
    OutputFormat, PoolConfig, Pricing, QuotaLimits, RetryPolicy, TranscodeOptions,
};
