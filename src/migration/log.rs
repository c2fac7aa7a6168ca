//! Applied migration log sources
//!
//! The log is owned by the migration engine; every source here only reads it.

use crate::error::{GateError, GateResult};
use crate::migration::record::{migration_name_from_file, MigrationFile};
use crate::migration::{MigrationKey, MigrationRecord, Operation};
use crate::schema::is_identifier;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use postgres_types::Json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A read-only source of migration records
#[allow(async_fn_in_trait)]
pub trait MigrationLog {
    /// Where the records come from, for log output
    fn describe(&self) -> String;

    /// Every recorded migration, in no particular order
    async fn load(&self) -> GateResult<Vec<MigrationRecord>>;
}

/// Migration files checked into the repository: `<root>/<app>/NNNN_name.json`
pub struct DirectoryMigrationLog {
    root: PathBuf,
}

impl DirectoryMigrationLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn sorted_entries(dir: &Path) -> GateResult<Vec<(String, PathBuf, bool)>> {
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| GateError::io(dir, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| GateError::io(dir, e))? {
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| GateError::io(&path, e))?
                .is_dir();
            entries.push((entry.file_name().to_string_lossy().into_owned(), path, is_dir));
        }
        entries.sort();
        Ok(entries)
    }
}

impl MigrationLog for DirectoryMigrationLog {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    async fn load(&self) -> GateResult<Vec<MigrationRecord>> {
        let mut records = Vec::new();

        for (app_label, app_dir, is_dir) in Self::sorted_entries(&self.root).await? {
            if !is_dir || !is_identifier(&app_label) {
                continue;
            }

            for (file_name, path, is_dir) in Self::sorted_entries(&app_dir).await? {
                let Some(name) = migration_name_from_file(&file_name).filter(|_| !is_dir) else {
                    debug!("Skipping {} (not a migration file)", path.display());
                    continue;
                };

                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| GateError::io(&path, e))?;
                let file: MigrationFile =
                    serde_json::from_str(&raw).map_err(|e| GateError::parse(&path, e))?;

                records.push(MigrationRecord::from_file(&app_label, name, file));
            }
        }

        info!("Loaded {} migration records from {}", records.len(), self.describe());
        Ok(records)
    }
}

/// Migration records stored in a PostgreSQL table
pub struct PostgresMigrationLog {
    pool: Pool,
    table: String,
}

impl PostgresMigrationLog {
    /// `table` must already be validated as a plain identifier
    pub fn new(pool: Pool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

impl MigrationLog for PostgresMigrationLog {
    fn describe(&self) -> String {
        format!("table {}", self.table)
    }

    async fn load(&self) -> GateResult<Vec<MigrationRecord>> {
        let mut client = self.pool.get().await?;

        // The server enforces the no-write contract for the whole read
        let transaction = client.build_transaction().read_only(true).start().await?;

        let query = format!(
            "SELECT app, name, dependencies, operations, applied_at FROM \"{}\" ORDER BY applied_at, app, name",
            self.table
        );
        let rows = transaction.query(query.as_str(), &[]).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let dependencies: Json<Vec<MigrationKey>> = row.try_get("dependencies")?;
            let operations: Json<Vec<Operation>> = row.try_get("operations")?;
            let applied_at: Option<DateTime<Utc>> = row.try_get("applied_at")?;
            let app_label: String = row.try_get("app")?;

            records.push(MigrationRecord {
                app_label: app_label.to_lowercase(),
                name: row.try_get("name")?,
                dependencies: dependencies.0,
                operations: operations.0,
                applied_at,
            });
        }

        // Always rollback - nothing was written anyway
        transaction.rollback().await?;

        info!("Loaded {} migration records from {}", records.len(), self.describe());
        Ok(records)
    }
}

/// The log source selected by configuration
pub enum LogBackend {
    Directory(DirectoryMigrationLog),
    Database(PostgresMigrationLog),
}

impl MigrationLog for LogBackend {
    fn describe(&self) -> String {
        match self {
            LogBackend::Directory(log) => log.describe(),
            LogBackend::Database(log) => log.describe(),
        }
    }

    async fn load(&self) -> GateResult<Vec<MigrationRecord>> {
        match self {
            LogBackend::Directory(log) => log.load().await,
            LogBackend::Database(log) => log.load().await,
        }
    }
}

/// Fixed records, for tests
#[cfg(test)]
pub struct InMemoryMigrationLog(pub Vec<MigrationRecord>);

#[cfg(test)]
impl MigrationLog for InMemoryMigrationLog {
    fn describe(&self) -> String {
        "in-memory log".to_string()
    }

    async fn load(&self) -> GateResult<Vec<MigrationRecord>> {
        Ok(self.0.clone())
    }
}
