use std::collections::HashSet;

use pgmeili_core::qualify_table;

use crate::error::{ConfigError, ConfigResult};
use crate::settings::{OutputPlugin, PgMeiliConfig};

/// Validate a parsed configuration.
pub fn validate_config(config: &PgMeiliConfig) -> ConfigResult<()> {
    validate_postgres(config)?;
    validate_replication(config)?;
    validate_meilisearch(config)?;
    validate_bus(config)?;
    validate_sync(config)?;
    Ok(())
}

fn validate_postgres(config: &PgMeiliConfig) -> ConfigResult<()> {
    if config.postgres.connection_string.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "postgres.connection_string".into(),
        });
    }
    Ok(())
}

fn validate_replication(config: &PgMeiliConfig) -> ConfigResult<()> {
    let replication = &config.replication;
    validate_identifier("replication.slot", &replication.slot)?;
    validate_identifier("replication.publication", &replication.publication)?;
    positive("replication.status_interval_secs", replication.status_interval_secs)?;

    if replication.plugin == OutputPlugin::Pgoutput && !(1..=4).contains(&replication.proto_version)
    {
        return Err(ConfigError::InvalidValue {
            field: "replication.proto_version".into(),
            reason: format!("{} is not a pgoutput protocol version (1-4)", replication.proto_version),
        });
    }
    Ok(())
}

fn validate_meilisearch(config: &PgMeiliConfig) -> ConfigResult<()> {
    if config.meilisearch.url.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "meilisearch.url".into(),
        });
    }
    positive("meilisearch.timeout_secs", config.meilisearch.timeout_secs)
}

fn validate_bus(config: &PgMeiliConfig) -> ConfigResult<()> {
    if !config.bus.enabled {
        return Ok(());
    }
    for (field, value) in [
        ("bus.url", &config.bus.url),
        ("bus.stream", &config.bus.stream),
        ("bus.subject", &config.bus.subject),
        ("bus.durable", &config.bus.durable),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField { field: field.into() });
        }
    }
    positive("bus.queue_capacity", config.bus.queue_capacity as u64)
}

fn validate_sync(config: &PgMeiliConfig) -> ConfigResult<()> {
    if config.sync.is_empty() {
        return Err(ConfigError::NoSyncTables);
    }

    let mut seen = HashSet::new();
    for (i, entry) in config.sync.iter().enumerate() {
        for (name, value) in [("table", &entry.table), ("index", &entry.index), ("pk", &entry.pk)] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("sync[{}].{}", i, name),
                });
            }
        }

        validate_index_uid(&format!("sync[{}].index", i), &entry.index)?;
        if let Some(size) = entry.batch_size {
            positive(&format!("sync[{}].batch_size", i), size as u64)?;
        }

        let table = qualify_table(&entry.table);
        if !seen.insert(table.clone()) {
            return Err(ConfigError::DuplicateTable(table));
        }
    }
    Ok(())
}

/// Slot and publication names: lowercase letters, digits and underscores.
fn validate_identifier(field: &str, value: &str) -> ConfigResult<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(ConfigError::InvalidName {
            field: field.into(),
            value: value.into(),
            reason: "use lowercase letters, digits and underscores",
        });
    }
    Ok(())
}

/// Index uids: alphanumerics, hyphens and underscores.
fn validate_index_uid(field: &str, value: &str) -> ConfigResult<()> {
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ConfigError::InvalidName {
            field: field.into(),
            value: value.into(),
            reason: "use letters, digits, hyphens and underscores",
        });
    }
    Ok(())
}

fn positive(field: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.into(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}
