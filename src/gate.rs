//! Migration-Consistency Gate
//!
//! Decides whether the declared models are fully accounted for by the applied
//! migration log. The check is read-only: it loads, replays and compares, and
//! never records or applies anything.

use crate::config::ConfigError;
use crate::declared::ModelSource;
use crate::diff::{Autodetector, PendingDiff};
use crate::error::{CheckFailure, GateError, GateResult};
use crate::migration::{MigrationGraph, MigrationLog, ProjectState};
use std::collections::BTreeSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Result state of a check; computed fresh on every run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Clean,
    Dirty,
}

/// Everything one run computed
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub state: GateState,
    pub diff: PendingDiff,
    /// Checksum of the declared model set
    pub declared_checksum: String,
    /// Checksum of the schema the log accounts for
    pub recorded_checksum: String,
    pub migrations_replayed: usize,
}

pub struct MigrationGate<M, L> {
    models: M,
    log: L,
    apps: Vec<String>,
}

impl<M: ModelSource, L: MigrationLog> MigrationGate<M, L> {
    /// `apps` restricts the check; empty means every app
    pub fn new(models: M, log: L, apps: Vec<String>) -> Self {
        Self { models, log, apps }
    }

    /// Compute the pending diff without judging it
    pub async fn compute(&self) -> GateResult<GateOutcome> {
        let declared = self.models.load()?;
        debug!("Declared models from {}: {}", self.models.describe(), declared.len());

        let records = self.log.load().await?;
        let graph = MigrationGraph::build(records)?;
        let recorded = ProjectState::replay(&graph)?;
        debug!(
            "Replayed {} migrations from {} into {} models",
            graph.len(),
            self.log.describe(),
            recorded.len()
        );

        self.check_scope(&declared.app_labels(), &graph.app_labels())?;

        let diff = Autodetector::diff(&recorded, &declared, &self.apps)
            .with_suggestions(|app_label| graph.next_number(app_label));

        let state = if diff.is_empty() { GateState::Clean } else { GateState::Dirty };

        Ok(GateOutcome {
            state,
            declared_checksum: declared.checksum(),
            recorded_checksum: recorded.checksum(),
            migrations_replayed: graph.len(),
            diff,
        })
    }

    /// Run the gate: `Ok` only when nothing is pending
    pub async fn check(&self) -> Result<GateOutcome, CheckFailure> {
        let span = info_span!("check", check_id = %Uuid::new_v4());
        self.evaluate().instrument(span).await
    }

    async fn evaluate(&self) -> Result<GateOutcome, CheckFailure> {
        info!("Checking {} against {}", self.models.describe(), self.log.describe());

        let outcome = self.compute().await?;
        debug!(
            declared = %outcome.declared_checksum,
            recorded = %outcome.recorded_checksum,
            "Schema checksums"
        );
        match outcome.state {
            GateState::Clean => {
                info!(
                    checksum = %outcome.declared_checksum,
                    "No pending changes ({} migrations replayed)",
                    outcome.migrations_replayed
                );
                Ok(outcome)
            }
            GateState::Dirty => {
                if outcome.diff.has_destructive_changes() {
                    warn!("Pending changes include data-losing operations");
                }
                let summary = &outcome.diff.summary;
                info!(
                    apps = ?outcome.diff.apps(),
                    models_created = summary.models_created,
                    models_deleted = summary.models_deleted,
                    models_modified = summary.models_modified,
                    "{} pending change(s) detected",
                    summary.total_changes
                );
                debug!(
                    "Fields: {} added, {} removed, {} altered; {} option change(s)",
                    summary.fields_added,
                    summary.fields_removed,
                    summary.fields_altered,
                    summary.options_altered
                );
                Err(CheckFailure::PendingChangesDetected(outcome.diff))
            }
        }
    }

    /// Every requested app must exist on at least one side
    fn check_scope(&self, declared: &BTreeSet<String>, recorded: &BTreeSet<String>) -> GateResult<()> {
        for app_label in &self.apps {
            if !declared.contains(app_label) && !recorded.contains(app_label) {
                return Err(GateError::Config(ConfigError::InvalidValue(format!(
                    "unknown app label '{}'",
                    app_label
                ))));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declared::{ManifestModelSource, StaticModelSource};
    use crate::migration::graph::tests::record;
    use crate::migration::log::{DirectoryMigrationLog, InMemoryMigrationLog};
    use crate::migration::{AddField, CreateModel, MigrationRecord, Operation, RenameField};
    use crate::schema::fixtures::*;
    use crate::schema::{FieldKind, FieldState, ModelState};
    use pretty_assertions::assert_eq;

    fn create(model: &ModelState) -> Operation {
        Operation::CreateModel(CreateModel {
            name: model.name.clone(),
            fields: model.fields.clone(),
            options: model.options.clone(),
        })
    }

    /// Log that accounts for exactly the fixture models
    fn full_log() -> Vec<MigrationRecord> {
        let mut core = record("core", "0001_initial", &[]);
        core.operations = vec![create(&site()), create(&satellite_image())];

        let mut alerts = record("alerts", "0001_initial", &["core.0001_initial"]);
        alerts.operations = vec![create(&alert()), create(&alert_rule())];

        vec![alerts, core]
    }

    fn all_models() -> Vec<ModelState> {
        vec![site(), satellite_image(), alert(), alert_rule()]
    }

    #[tokio::test]
    async fn test_empty_log_and_empty_models_is_clean() {
        let gate = MigrationGate::new(StaticModelSource(vec![]), InMemoryMigrationLog(vec![]), vec![]);
        let outcome = gate.check().await.unwrap();
        assert_eq!(outcome.state, GateState::Clean);
        assert!(outcome.diff.is_empty());
    }

    #[tokio::test]
    async fn test_log_covering_models_is_clean() {
        let gate = MigrationGate::new(StaticModelSource(all_models()), InMemoryMigrationLog(full_log()), vec![]);
        let outcome = gate.check().await.unwrap();
        assert_eq!(outcome.state, GateState::Clean);
        assert_eq!(outcome.declared_checksum, outcome.recorded_checksum);
        assert_eq!(outcome.migrations_replayed, 2);
    }

    #[tokio::test]
    async fn test_unrecorded_model_is_detected() {
        let mut log = full_log();
        log.retain(|r| r.app_label == "core");

        let gate = MigrationGate::new(StaticModelSource(all_models()), InMemoryMigrationLog(log), vec![]);
        let failure = gate.check().await.unwrap_err();

        let CheckFailure::PendingChangesDetected(diff) = &failure else {
            panic!("expected pending changes, got {:?}", failure);
        };
        let descriptions: Vec<String> = diff.changes.iter().map(|c| c.description()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Create model alerts.alert (5 fields)",
                "Create model alerts.alertrule (5 fields)",
            ]
        );
        assert_eq!(diff.suggestions[0].to_string(), "alerts/0001_initial");
        assert_eq!(failure.exit_code(Default::default()), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_field_is_detected() {
        let mut models = all_models();
        models[2].fields.push(FieldState::new("severity", FieldKind::Integer));

        let gate = MigrationGate::new(StaticModelSource(models), InMemoryMigrationLog(full_log()), vec![]);
        let failure = gate.check().await.unwrap_err();

        let CheckFailure::PendingChangesDetected(diff) = failure else {
            panic!("expected pending changes");
        };
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes[0].description(), "Add field severity to alerts.alert");
        assert_eq!(diff.suggestions[0].name, "0002_alert_severity");
    }

    #[tokio::test]
    async fn test_recorded_rename_replays_cleanly() {
        let mut log = full_log();
        let mut rename = record("alerts", "0002_rename_target_class", &["alerts.0001_initial"]);
        rename.operations.push(Operation::RenameField(RenameField {
            model_name: "alertrule".to_string(),
            old_name: "target_class".to_string(),
            new_name: "equipment_class".to_string(),
        }));
        log.push(rename);

        let mut models = all_models();
        models[3].fields[3].name = "equipment_class".to_string();
        models[3].options.unique_together = vec![vec![
            "site".to_string(),
            "rule_type".to_string(),
            "equipment_class".to_string(),
        ]];

        let gate = MigrationGate::new(StaticModelSource(models), InMemoryMigrationLog(log), vec![]);
        assert_eq!(gate.check().await.unwrap().state, GateState::Clean);
    }

    #[tokio::test]
    async fn test_checks_are_idempotent() {
        let mut models = all_models();
        models.push(ModelState::new("alerts", "Digest", vec![id_field()]));

        let gate = MigrationGate::new(StaticModelSource(models), InMemoryMigrationLog(full_log()), vec![]);
        let first = gate.compute().await.unwrap();
        let second = gate.compute().await.unwrap();

        assert_eq!(first.diff, second.diff);
        assert_eq!(first.declared_checksum, second.declared_checksum);
    }

    #[tokio::test]
    async fn test_app_scope_ignores_other_apps() {
        let mut log = full_log();
        log.retain(|r| r.app_label == "core");

        let gate = MigrationGate::new(
            StaticModelSource(all_models()),
            InMemoryMigrationLog(log),
            vec!["core".to_string()],
        );
        assert_eq!(gate.check().await.unwrap().state, GateState::Clean);
    }

    #[tokio::test]
    async fn test_unknown_app_scope_fails_computation() {
        let gate = MigrationGate::new(
            StaticModelSource(all_models()),
            InMemoryMigrationLog(full_log()),
            vec!["billing".to_string()],
        );
        let failure = gate.check().await.unwrap_err();
        assert!(matches!(failure, CheckFailure::DiffComputationFailed(GateError::Config(_))));
        assert!(failure.to_string().contains("billing"));
    }

    #[tokio::test]
    async fn test_broken_log_fails_computation() {
        let mut broken = record("alerts", "0001_initial", &[]);
        broken.operations.push(Operation::AddField(AddField {
            model_name: "alert".to_string(),
            field: FieldState::new("severity", FieldKind::Integer),
        }));

        let gate = MigrationGate::new(StaticModelSource(vec![]), InMemoryMigrationLog(vec![broken]), vec![]);
        let failure = gate.check().await.unwrap_err();
        assert!(matches!(failure, CheckFailure::DiffComputationFailed(GateError::Replay { .. })));
    }

    #[tokio::test]
    async fn test_conflicting_leaves_fail_computation() {
        let mut log = full_log();
        log.push(record("alerts", "0002_alert_severity", &["alerts.0001_initial"]));
        log.push(record("alerts", "0002_alertrule_priority", &["alerts.0001_initial"]));

        let gate = MigrationGate::new(StaticModelSource(all_models()), InMemoryMigrationLog(log), vec![]);
        let failure = gate.check().await.unwrap_err();
        assert!(failure.to_string().contains("conflicting migrations in app 'alerts'"));
    }

    #[tokio::test]
    async fn test_unreachable_log_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let gate = MigrationGate::new(
            StaticModelSource(all_models()),
            DirectoryMigrationLog::new(dir.path().join("missing")),
            vec![],
        );
        let failure = gate.check().await.unwrap_err();

        assert_eq!(failure.kind(), "diff_computation_failed");
        assert_eq!(failure.exit_code(crate::error::ExitPolicy::Distinct), 2);
    }

    #[tokio::test]
    async fn test_demo_project_reports_missing_field() {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demo");
        let gate = MigrationGate::new(
            ManifestModelSource::new(root.join("models.json")),
            DirectoryMigrationLog::new(root.join("migrations")),
            vec![],
        );

        let CheckFailure::PendingChangesDetected(diff) = gate.check().await.unwrap_err() else {
            panic!("expected pending changes");
        };
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.changes[0].description(), "Add field severity to alerts.alert");
        assert_eq!(diff.suggestions[0].name, "0002_alert_severity");
    }

    #[tokio::test]
    async fn test_capitalized_app_directory_counts_toward_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("Core");
        std::fs::create_dir_all(&app_dir).unwrap();
        let file = crate::migration::record::MigrationFile {
            dependencies: vec![],
            operations: vec![create(&site())],
        };
        std::fs::write(app_dir.join("0001_initial.json"), serde_json::to_string(&file).unwrap()).unwrap();

        let mut declared = site();
        declared.fields.push(FieldState::new("notes", FieldKind::Text));

        let gate = MigrationGate::new(
            StaticModelSource(vec![declared]),
            DirectoryMigrationLog::new(dir.path()),
            vec![],
        );
        let CheckFailure::PendingChangesDetected(diff) = gate.check().await.unwrap_err() else {
            panic!("expected pending changes");
        };
        assert_eq!(diff.changes[0].description(), "Add field notes to core.site");
        assert_eq!(diff.suggestions[0].to_string(), "core/0002_site_notes");
    }
}
