//! Log replay
//!
//! Rebuilds the schema the applied log accounts for by running every
//! operation forward, in plan order, on an empty model set.

use crate::error::{GateError, GateResult};
use crate::migration::MigrationGraph;
use crate::schema::ModelSet;
use tracing::debug;

pub struct ProjectState;

impl ProjectState {
    /// Cumulative effect of every record in the graph
    pub fn replay(graph: &MigrationGraph) -> GateResult<ModelSet> {
        let mut state = ModelSet::new();

        for record in graph.plan() {
            for operation in &record.operations {
                operation
                    .state_forwards(&record.app_label, &mut state)
                    .map_err(|message| GateError::Replay {
                        migration: record.key(),
                        message,
                    })?;
            }
            debug!(
                "Replayed {} ({} operations)",
                record.key(),
                record.operations.len()
            );
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::graph::tests::record;
    use crate::migration::{AddField, CreateModel, Operation, RemoveField};
    use crate::schema::fixtures::*;
    use crate::schema::{FieldKind, FieldState, ModelKey};

    #[test]
    fn test_replay_builds_cumulative_state() {
        let mut initial = record("core", "0001_initial", &[]);
        let site = site();
        initial.operations.push(Operation::CreateModel(CreateModel {
            name: site.name.clone(),
            fields: site.fields.clone(),
            options: site.options.clone(),
        }));

        let mut second = record("core", "0002_remove_site_metadata", &["core.0001_initial"]);
        second.operations.push(Operation::RemoveField(RemoveField {
            model_name: "site".to_string(),
            name: "metadata".to_string(),
        }));

        let graph = MigrationGraph::build(vec![second, initial]).unwrap();
        let state = ProjectState::replay(&graph).unwrap();

        let model = state.get(&ModelKey::new("core", "site")).unwrap();
        assert!(model.field("metadata").is_none());
        assert_eq!(model.fields.len(), site.fields.len() - 1);
    }

    #[test]
    fn test_replay_error_names_migration() {
        let mut broken = record("alerts", "0001_initial", &[]);
        broken.operations.push(Operation::AddField(AddField {
            model_name: "alert".to_string(),
            field: FieldState::new("severity", FieldKind::Integer),
        }));

        let graph = MigrationGraph::build(vec![broken]).unwrap();
        let err = ProjectState::replay(&graph).unwrap_err();

        assert!(matches!(err, GateError::Replay { .. }));
        assert!(err.to_string().contains("alerts.0001_initial"));
    }
}
