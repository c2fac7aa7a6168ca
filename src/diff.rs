//! Pending Diff Engine
//!
//! Compares the schema the migration log accounts for with the declared model
//! set and lists the operations a new migration would need. This is the
//! "makemigrations --dry-run" of the gate: it never writes anything.

use crate::migration::{
    AddField, AlterField, AlterModelOptions, AlterUniqueTogether, CreateModel, DeleteModel, Operation,
    RemoveField,
};
use crate::schema::{ModelKey, ModelOptions, ModelSet, ModelState};
use std::collections::BTreeSet;
use std::fmt;

/// Longest joined fragment before a suggested name falls back to "auto"
const MAX_NAME_FRAGMENT: usize = 52;

/// A single outstanding operation
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub app_label: String,
    pub operation: Operation,
    /// What changed, for altered fields and options
    pub detail: Option<String>,
}

impl PendingChange {
    fn new(app_label: &str, operation: Operation) -> Self {
        Self {
            app_label: app_label.to_string(),
            operation,
            detail: None,
        }
    }

    pub fn description(&self) -> String {
        let mut text = self.operation.describe(&self.app_label);
        if let Some(detail) = &self.detail {
            text.push_str(&format!(": {}", detail));
        }
        if self.operation.is_destructive() {
            text.push_str(" [data loss]");
        }
        text
    }
}

/// Summary statistics for the diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub models_created: usize,
    pub models_deleted: usize,
    pub models_modified: usize,
    pub fields_added: usize,
    pub fields_removed: usize,
    pub fields_altered: usize,
    pub options_altered: usize,
    pub total_changes: usize,
}

/// Name the missing migration of one app would take
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedMigration {
    pub app_label: String,
    pub name: String,
}

impl fmt::Display for SuggestedMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_label, self.name)
    }
}

/// Everything needed to reconcile the log with the declared models
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingDiff {
    pub changes: Vec<PendingChange>,
    pub summary: DiffSummary,
    pub suggestions: Vec<SuggestedMigration>,
}

impl PendingDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn has_destructive_changes(&self) -> bool {
        self.changes.iter().any(|c| c.operation.is_destructive())
    }

    /// Apps with outstanding changes, sorted
    pub fn apps(&self) -> BTreeSet<&str> {
        self.changes.iter().map(|c| c.app_label.as_str()).collect()
    }

    /// Fill in one suggested migration per app; `next_number` gives the
    /// sequence number the app's next migration takes
    pub fn with_suggestions(mut self, next_number: impl Fn(&str) -> u32) -> Self {
        let suggestions = self
            .apps()
            .into_iter()
            .map(|app_label| {
                let number = next_number(app_label);
                let fragment = if number == 1 {
                    "initial".to_string()
                } else {
                    let mut fragments: Vec<String> = self
                        .changes
                        .iter()
                        .filter(|c| c.app_label == app_label)
                        .map(|c| c.operation.name_fragment())
                        .collect();
                    fragments.sort();
                    let joined = fragments.join("_");
                    if joined.is_empty() || joined.chars().count() > MAX_NAME_FRAGMENT {
                        "auto".to_string()
                    } else {
                        joined
                    }
                };
                SuggestedMigration {
                    app_label: app_label.to_string(),
                    name: format!("{:04}_{}", number, fragment),
                }
            })
            .collect();
        self.suggestions = suggestions;
        self
    }
}

/// The engine that detects unrecorded model changes
pub struct Autodetector;

impl Autodetector {
    /// Operations turning `from` (replayed log) into `to` (declared models).
    /// An empty `apps` slice means every app.
    pub fn diff(from: &ModelSet, to: &ModelSet, apps: &[String]) -> PendingDiff {
        let mut labels: BTreeSet<String> = from.app_labels();
        labels.extend(to.app_labels());
        if !apps.is_empty() {
            labels.retain(|label| apps.contains(label));
        }

        let mut changes = Vec::new();
        for app_label in &labels {
            Self::diff_app(app_label, from, to, &mut changes);
        }

        let summary = Self::calculate_summary(&changes);
        PendingDiff {
            changes,
            summary,
            suggestions: Vec::new(),
        }
    }

    fn diff_app(app_label: &str, from: &ModelSet, to: &ModelSet, changes: &mut Vec<PendingChange>) {
        let created: Vec<&ModelState> = to
            .app_models(app_label)
            .filter(|m| !from.contains(&m.key()))
            .collect();

        for model in Self::creation_order(created) {
            changes.push(PendingChange::new(
                app_label,
                Operation::CreateModel(CreateModel {
                    name: model.name.clone(),
                    fields: model.fields.clone(),
                    options: model.options.clone(),
                }),
            ));
        }

        for declared in to.app_models(app_label) {
            if let Some(recorded) = from.get(&declared.key()) {
                Self::diff_model(app_label, recorded, declared, changes);
            }
        }

        for recorded in from.app_models(app_label) {
            if !to.contains(&recorded.key()) {
                changes.push(PendingChange::new(
                    app_label,
                    Operation::DeleteModel(DeleteModel {
                        name: recorded.name.clone(),
                    }),
                ));
            }
        }
    }

    /// Created models come after any new model of the same app they reference
    fn creation_order(models: Vec<&ModelState>) -> Vec<&ModelState> {
        let new_keys: BTreeSet<ModelKey> = models.iter().map(|m| m.key()).collect();
        let mut placed: BTreeSet<ModelKey> = BTreeSet::new();
        let mut ordered = Vec::with_capacity(models.len());
        let mut pending = models;

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();

            for model in pending {
                let key = model.key();
                let ready = model
                    .fields
                    .iter()
                    .filter_map(|f| f.relation.as_ref())
                    .all(|r| r.to == key || !new_keys.contains(&r.to) || placed.contains(&r.to));
                if ready {
                    placed.insert(key);
                    ordered.push(model);
                } else {
                    deferred.push(model);
                }
            }

            if deferred.len() == before {
                // Mutual references; keep key order
                ordered.extend(deferred);
                break;
            }
            pending = deferred;
        }

        ordered
    }

    fn diff_model(app_label: &str, recorded: &ModelState, declared: &ModelState, changes: &mut Vec<PendingChange>) {
        let model_name = declared.name.clone();

        // Removed fields
        for field in &recorded.fields {
            if declared.field(&field.name).is_none() {
                changes.push(PendingChange::new(
                    app_label,
                    Operation::RemoveField(RemoveField {
                        model_name: model_name.clone(),
                        name: field.name.clone(),
                    }),
                ));
            }
        }

        // Added fields
        for field in &declared.fields {
            if recorded.field(&field.name).is_none() {
                changes.push(PendingChange::new(
                    app_label,
                    Operation::AddField(AddField {
                        model_name: model_name.clone(),
                        field: field.clone(),
                    }),
                ));
            }
        }

        // Altered fields
        for field in &declared.fields {
            if let Some(before) = recorded.field(&field.name) {
                let modifications = field.changes_from(before);
                if !modifications.is_empty() {
                    changes.push(PendingChange {
                        detail: Some(modifications.join(", ")),
                        ..PendingChange::new(
                            app_label,
                            Operation::AlterField(AlterField {
                                model_name: model_name.clone(),
                                field: field.clone(),
                            }),
                        )
                    });
                }
            }
        }

        if recorded.options.unique_together != declared.options.unique_together {
            changes.push(PendingChange::new(
                app_label,
                Operation::AlterUniqueTogether(AlterUniqueTogether {
                    name: model_name.clone(),
                    unique_together: declared.options.unique_together.clone(),
                }),
            ));
        }

        if !recorded.options.same_presentation(&declared.options) {
            changes.push(PendingChange {
                detail: Some(Self::describe_options(&recorded.options, &declared.options)),
                ..PendingChange::new(
                    app_label,
                    Operation::AlterModelOptions(AlterModelOptions {
                        name: model_name,
                        options: ModelOptions {
                            unique_together: Vec::new(),
                            ..declared.options.clone()
                        },
                    }),
                )
            });
        }
    }

    fn describe_options(before: &ModelOptions, after: &ModelOptions) -> String {
        let mut parts = Vec::new();
        if before.ordering != after.ordering {
            parts.push(format!("ordering [{}] → [{}]", before.ordering.join(", "), after.ordering.join(", ")));
        }
        if before.db_table != after.db_table {
            parts.push("db_table changed".to_string());
        }
        if before.verbose_name != after.verbose_name || before.verbose_name_plural != after.verbose_name_plural {
            parts.push("verbose names changed".to_string());
        }
        parts.join(", ")
    }

    fn calculate_summary(changes: &[PendingChange]) -> DiffSummary {
        let mut summary = DiffSummary {
            total_changes: changes.len(),
            ..DiffSummary::default()
        };

        let mut modified_models: BTreeSet<ModelKey> = BTreeSet::new();

        for change in changes {
            let key = ModelKey::new(&change.app_label, change.operation.model_name());
            match &change.operation {
                Operation::CreateModel(_) => summary.models_created += 1,
                Operation::DeleteModel(_) => summary.models_deleted += 1,
                Operation::AddField(_) => {
                    summary.fields_added += 1;
                    modified_models.insert(key);
                }
                Operation::RemoveField(_) => {
                    summary.fields_removed += 1;
                    modified_models.insert(key);
                }
                Operation::AlterField(_) | Operation::RenameField(_) => {
                    summary.fields_altered += 1;
                    modified_models.insert(key);
                }
                Operation::AlterUniqueTogether(_) | Operation::AlterModelOptions(_) | Operation::RenameModel(_) => {
                    summary.options_altered += 1;
                    modified_models.insert(key);
                }
            }
        }

        summary.models_modified = modified_models.len();
        summary
    }
}
