//! Migration records
//!
//! One entry of the applied migration log: identity, dependencies, and the
//! operations it performed.

use crate::migration::Operation;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

static MIGRATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})_[a-z0-9_]+$").expect("valid migration name pattern"));

static MIGRATION_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4}_[a-z0-9_]+)\.json$").expect("valid migration file pattern"));

/// Unique identifier of a migration record (e.g., "core.0001_initial")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationKey {
    pub app_label: String,
    pub name: String,
}

impl MigrationKey {
    /// App labels compare case-insensitively, as in `ModelKey`
    pub fn new(app_label: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.as_ref().to_lowercase(),
            name: name.into(),
        }
    }

    pub fn parse(reference: &str) -> Option<Self> {
        let (app, name) = reference.split_once('.')?;
        if app.is_empty() || !MIGRATION_NAME.is_match(name) {
            return None;
        }
        Some(Self::new(app, name))
    }

    /// The four-digit sequence prefix
    pub fn number(&self) -> Option<u32> {
        MIGRATION_NAME
            .captures(&self.name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.name)
    }
}

impl Serialize for MigrationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MigrationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MigrationKey::parse(&raw).ok_or_else(|| {
            de::Error::custom(format!(
                "invalid migration reference '{}' (expected app.NNNN_name)",
                raw
            ))
        })
    }
}

/// Migration name from a `NNNN_name.json` file name
pub fn migration_name_from_file(file_name: &str) -> Option<&str> {
    MIGRATION_FILE
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Body of a migration file; app label and name come from its path
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFile {
    #[serde(default)]
    pub dependencies: Vec<MigrationKey>,
    pub operations: Vec<Operation>,
}

/// A recorded schema change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub app_label: String,
    pub name: String,
    pub dependencies: Vec<MigrationKey>,
    pub operations: Vec<Operation>,
    /// Set when the record comes from a database log
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    pub fn from_file(app_label: &str, name: &str, file: MigrationFile) -> Self {
        Self {
            app_label: app_label.to_lowercase(),
            name: name.to_string(),
            dependencies: file.dependencies,
            operations: file.operations,
            applied_at: None,
        }
    }

    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(&self.app_label, &self.name)
    }
}
