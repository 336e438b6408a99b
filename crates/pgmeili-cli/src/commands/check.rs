use std::fmt::Write;

use anyhow::Result;
use pgmeili_config::PgMeiliConfig;

pub fn cmd_check(config: &PgMeiliConfig) -> Result<()> {
    print!("{}", summary(config));
    println!("\nConfig is valid.");
    Ok(())
}

fn summary(config: &PgMeiliConfig) -> String {
    let mut out = String::new();
    let replication = &config.replication;

    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        "Slot: {} ({:?}, {:?})",
        replication.slot, replication.plugin, replication.slot_policy
    );
    let _ = writeln!(out, "Publication: {}", replication.publication);
    let _ = writeln!(out, "Meilisearch: {}", config.meilisearch.url);
    if config.bus.enabled {
        let _ = writeln!(out, "Bus: {} ({})", config.bus.url, config.bus.subject);
    }

    let _ = writeln!(out, "\n{:<30} {:<20} {:<12} {:>6}", "Table", "Index", "Key", "Load");
    let _ = writeln!(out, "{:-<71}", "");
    for target in config.sync_targets() {
        let _ = writeln!(
            out,
            "{:<30} {:<20} {:<12} {:>6}",
            target.table,
            target.index,
            target.primary_key,
            if target.initial_load { "yes" } else { "no" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_tables() {
        let config = PgMeiliConfig::parse(
            r#"
[postgres]
connection_string = "postgres://localhost/app"

[meilisearch]
url = "http://localhost:7700"

[[sync]]
table = "main.tenants"
index = "tenant"
pk = "id"
initial_load = true

[[sync]]
table = "users"
index = "users"
pk = "user_id"
"#,
        )
        .unwrap();

        let summary = summary(&config);
        assert!(summary.contains("Slot: pgmeili"));
        assert!(!summary.contains("Bus:"));

        let rows: Vec<&str> = summary
            .lines()
            .filter(|line| line.starts_with("main.") || line.starts_with("public."))
            .collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].contains("tenant") && rows[0].ends_with("yes"));
        assert!(rows[1].contains("user_id") && rows[1].ends_with("no"));
    }
}
