//! Control-plane Postgres connections with TLS support.
//!
//! Used for everything that is not the replication stream itself: the
//! snapshot read and the replica-identity check.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;

use crate::conninfo::ConnectionParams;
use crate::error::{PgError, PgResult};

/// Connect to Postgres with TLS settings based on the sslmode in the connection string.
/// Spawns the connection task and returns only the client.
pub async fn connect_postgres(connection_string: &str) -> PgResult<Client> {
    let params = ConnectionParams::parse(connection_string)?;

    if params.requires_tls() {
        let connector = MakeRustlsConnect::new(tls_config()?);

        let (client, connection) = tokio_postgres::connect(connection_string, connector)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) = tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "Postgres connection error");
            }
        });

        Ok(client)
    }
}

/// rustls client configuration with the webpki root store.
pub(crate) fn tls_config() -> PgResult<ClientConfig> {
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_certs())
            .with_no_client_auth();
    Ok(config)
}

fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}
