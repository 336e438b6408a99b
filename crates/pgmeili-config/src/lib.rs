mod env;
mod error;
mod settings;
mod validation;

pub use env::resolve_env;
pub use error::{ConfigError, ConfigResult};
pub use settings::{
    BusSection, MeilisearchSection, OutputPlugin, PgMeiliConfig, PostgresSection,
    ReplicationSection, SlotPolicySetting, SyncEntry, SAMPLE_CONFIG,
};
pub use validation::validate_config;
