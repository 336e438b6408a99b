//! Publication and quoting helpers.
//!
//! Statements here run over the replication connection's simple-query
//! protocol, so values are inlined and must be quoted.

use pgmeili_core::split_table;

/// Quote an identifier for use in SQL (double quotes).
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Quote a string literal (single quotes).
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quote a possibly schema-qualified table name (e.g., "public.users" -> "public"."users").
/// Unqualified names land in `public`.
pub fn quote_table_name(s: &str) -> String {
    let (schema, table) = split_table(s);
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `CREATE PUBLICATION` covering the given tables, or all tables when none are given.
pub fn create_publication_sql(publication: &str, tables: &[String]) -> String {
    if tables.is_empty() {
        format!("CREATE PUBLICATION {} FOR ALL TABLES", quote_ident(publication))
    } else {
        let quoted = tables
            .iter()
            .map(|t| quote_table_name(t))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            quote_ident(publication),
            quoted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("my\"table"), "\"my\"\"table\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("slot"), "'slot'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_quote_table_name() {
        assert_eq!(quote_table_name("users"), "\"public\".\"users\"");
        assert_eq!(quote_table_name("my_schema.my_table"), "\"my_schema\".\"my_table\"");
        assert_eq!(quote_table_name("public.My\"Table"), "\"public\".\"My\"\"Table\"");
    }

    #[test]
    fn test_create_publication_sql() {
        assert_eq!(
            create_publication_sql("pgmeili_pub", &[]),
            "CREATE PUBLICATION \"pgmeili_pub\" FOR ALL TABLES"
        );
        assert_eq!(
            create_publication_sql(
                "pgmeili_pub",
                &["public.users".to_string(), "billing.invoices".to_string()]
            ),
            "CREATE PUBLICATION \"pgmeili_pub\" FOR TABLE \"public\".\"users\", \"billing\".\"invoices\""
        );
    }
}
