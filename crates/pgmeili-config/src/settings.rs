use std::path::Path;
use std::time::Duration;

use pgmeili_core::SyncTarget;
use serde::Deserialize;

use crate::env::resolve_env;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::validate_config;

/// Written by `pgmeili init`.
pub const SAMPLE_CONFIG: &str = r#"# pgmeili configuration
initial_load = true
shutdown_grace_secs = 10

[postgres]
connection_string = "${DATABASE_URL}"

[replication]
slot = "pgmeili"
publication = "pgmeili_pub"
plugin = "wal2json"
slot_policy = "recreate"
status_interval_secs = 10

[meilisearch]
url = "${MEILI_URL:-http://localhost:7700}"
api_key = "${MEILI_MASTER_KEY:-}"
timeout_secs = 30

[bus]
enabled = false
url = "nats://localhost:4222"
stream = "pgmeili"
subject = "pgmeili.changes"
durable = "pgmeili-sync"
queue_capacity = 256

[[sync]]
table = "public.users"
index = "users"
pk = "id"
"#;

/// Top-level configuration as read from `pgmeili.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgMeiliConfig {
    /// Bulk-load tables before streaming. Per-table `initial_load` overrides it.
    #[serde(default)]
    pub initial_load: bool,
    /// How long running work gets to finish after Ctrl-C.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    pub postgres: PostgresSection,
    #[serde(default)]
    pub replication: ReplicationSection,
    pub meilisearch: MeilisearchSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub sync: Vec<SyncEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresSection {
    pub connection_string: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationSection {
    #[serde(default = "default_slot")]
    pub slot: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default)]
    pub plugin: OutputPlugin,
    #[serde(default)]
    pub slot_policy: SlotPolicySetting,
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    /// pgoutput protocol version; 2 and up enables streamed transactions.
    #[serde(default = "default_proto_version")]
    pub proto_version: u32,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            slot: default_slot(),
            publication: default_publication(),
            plugin: OutputPlugin::default(),
            slot_policy: SlotPolicySetting::default(),
            status_interval_secs: default_status_interval(),
            proto_version: default_proto_version(),
        }
    }
}

impl ReplicationSection {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

/// Logical decoding output plugin of the slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPlugin {
    #[default]
    Wal2json,
    Pgoutput,
}

/// What to do with a slot left over from a previous run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicySetting {
    #[default]
    Recreate,
    Resume,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeilisearchSection {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl MeilisearchSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_durable")]
    pub durable: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_bus_url(),
            stream: default_stream(),
            subject: default_subject(),
            durable: default_durable(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// One synced table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncEntry {
    /// Source table; bare names default to the `public` schema.
    pub table: String,
    /// Target index uid.
    pub index: String,
    /// Primary-key column.
    pub pk: String,
    #[serde(default)]
    pub initial_load: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_slot() -> String {
    "pgmeili".into()
}

fn default_publication() -> String {
    "pgmeili_pub".into()
}

fn default_status_interval() -> u64 {
    10
}

fn default_proto_version() -> u32 {
    1
}

fn default_timeout() -> u64 {
    30
}

fn default_bus_url() -> String {
    "nats://localhost:4222".into()
}

fn default_stream() -> String {
    "pgmeili".into()
}

fn default_subject() -> String {
    "pgmeili.changes".into()
}

fn default_durable() -> String {
    "pgmeili-sync".into()
}

fn default_queue_capacity() -> usize {
    256
}

impl PgMeiliConfig {
    /// Parse, resolve `${VAR}` references and validate.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let mut config: PgMeiliConfig = toml::from_str(toml_str)?;
        config.resolve()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    fn resolve(&mut self) -> ConfigResult<()> {
        self.postgres.connection_string =
            resolve_env(&self.postgres.connection_string, "postgres.connection_string")?;
        self.meilisearch.url = resolve_env(&self.meilisearch.url, "meilisearch.url")?;
        self.meilisearch.api_key = match self.meilisearch.api_key.take() {
            Some(key) => {
                let key = resolve_env(&key, "meilisearch.api_key")?;
                (!key.is_empty()).then_some(key)
            }
            None => None,
        };
        self.bus.url = resolve_env(&self.bus.url, "bus.url")?;
        Ok(())
    }

    /// One `SyncTarget` per `[[sync]]` entry, in file order.
    pub fn sync_targets(&self) -> Vec<SyncTarget> {
        self.sync
            .iter()
            .map(|entry| {
                let target = SyncTarget::new(&entry.table, &entry.index, &entry.pk)
                    .with_initial_load(entry.initial_load.unwrap_or(self.initial_load));
                match entry.batch_size {
                    Some(size) => target.with_batch_size(size),
                    None => target,
                }
            })
            .collect()
    }

    /// Schema-qualified names of every synced table.
    pub fn tables(&self) -> Vec<String> {
        self.sync_targets().into_iter().map(|t| t.table).collect()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const MINIMAL: &str = r#"
[postgres]
connection_string = "postgres://localhost/app"

[meilisearch]
url = "http://localhost:7700"

[[sync]]
table = "users"
index = "users"
pk = "id"
"#;

    #[test]
    fn test_parse_minimal() {
        let config = PgMeiliConfig::parse(MINIMAL).unwrap();

        assert!(!config.initial_load);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(10));
        assert_eq!(config.replication.slot, "pgmeili");
        assert_eq!(config.replication.plugin, OutputPlugin::Wal2json);
        assert_eq!(config.replication.slot_policy, SlotPolicySetting::Recreate);
        assert_eq!(config.replication.status_interval(), Duration::from_secs(10));
        assert_eq!(config.meilisearch.api_key, None);
        assert!(!config.bus.enabled);
        assert_eq!(config.tables(), vec!["public.users".to_string()]);
    }

    #[test]
    fn test_parse_full() {
        let config = PgMeiliConfig::parse(
            r#"
initial_load = true
shutdown_grace_secs = 3

[postgres]
connection_string = "postgres://localhost/app"

[replication]
slot = "search_sync"
publication = "search_pub"
plugin = "pgoutput"
slot_policy = "resume"
status_interval_secs = 5
proto_version = 2

[meilisearch]
url = "http://meili:7700"
api_key = "masterKey"
timeout_secs = 5

[bus]
enabled = true
url = "nats://nats:4222"
queue_capacity = 16

[[sync]]
table = "main.tenants"
index = "tenant"
pk = "id"
batch_size = 200

[[sync]]
table = "main.audit"
index = "audit"
pk = "uuid"
initial_load = false
"#,
        )
        .unwrap();

        assert_eq!(config.replication.plugin, OutputPlugin::Pgoutput);
        assert_eq!(config.replication.slot_policy, SlotPolicySetting::Resume);
        assert_eq!(config.replication.proto_version, 2);
        assert_eq!(config.meilisearch.api_key.as_deref(), Some("masterKey"));
        assert_eq!(config.bus.subject, "pgmeili.changes");
        assert_eq!(config.bus.queue_capacity, 16);

        let targets = config.sync_targets();
        assert_eq!(targets[0], SyncTarget::new("main.tenants", "tenant", "id")
            .with_initial_load(true)
            .with_batch_size(200));
        assert!(!targets[1].initial_load);
        assert_eq!(targets[1].primary_key, "uuid");
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        let toml = MINIMAL.replace(
            "[meilisearch]",
            "[replication]\nplugin = \"test_decoding\"\n\n[meilisearch]",
        );
        assert!(matches!(
            PgMeiliConfig::parse(&toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = MINIMAL.replace("pk = \"id\"", "pk = \"id\"\nprimary = \"id\"");
        assert!(matches!(
            PgMeiliConfig::parse(&toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    #[serial]
    fn test_sample_config_parses() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/app");
        std::env::remove_var("MEILI_URL");
        std::env::remove_var("MEILI_MASTER_KEY");

        let config = PgMeiliConfig::parse(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.postgres.connection_string, "postgres://localhost/app");
        assert_eq!(config.meilisearch.url, "http://localhost:7700");
        assert_eq!(config.meilisearch.api_key, None);
        assert!(config.sync_targets()[0].initial_load);

        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_env_references_resolved() {
        std::env::set_var("PGMEILI_TEST_KEY", "secret");
        let toml = MINIMAL.replace(
            "url = \"http://localhost:7700\"",
            "url = \"http://localhost:7700\"\napi_key = \"${PGMEILI_TEST_KEY}\"",
        );
        let config = PgMeiliConfig::parse(&toml).unwrap();
        assert_eq!(config.meilisearch.api_key.as_deref(), Some("secret"));
        std::env::remove_var("PGMEILI_TEST_KEY");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = PgMeiliConfig::load(file.path()).unwrap();
        assert_eq!(config.sync.len(), 1);

        assert!(matches!(
            PgMeiliConfig::load("/nonexistent/pgmeili.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
