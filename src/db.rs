//! Database connection management
//!
//! Builds the connection pool used by the database-backed migration log.

use crate::config::{ConfigError, DatabaseConfig};
use crate::error::GateError;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::debug;

/// Create a connection pool; TLS is used when the URL asked for it
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool, GateError> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    let created = if config.require_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
    };
    let pool = created
        .map_err(|e| GateError::Config(ConfigError::InvalidValue(format!("Failed to create pool: {}", e))))?;

    debug!(
        "Created pool for {}@{}:{}/{} (TLS: {})",
        config.user, config.host, config.port, config.database, config.require_tls
    );
    Ok(pool)
}
