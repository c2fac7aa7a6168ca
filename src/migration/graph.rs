//! Migration dependency graph
//!
//! Orders the applied log so every record is replayed after the records it
//! depends on, and rejects logs that cannot be ordered.

use crate::migration::{MigrationKey, MigrationRecord};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Structural problems in the migration log
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("migration {0} is recorded more than once")]
    Duplicate(MigrationKey),

    #[error("migration {migration} depends on unknown migration {dependency}")]
    MissingDependency {
        migration: MigrationKey,
        dependency: MigrationKey,
    },

    #[error("dependency cycle between {}", join_keys(.0))]
    Cycle(Vec<MigrationKey>),

    #[error("conflicting migrations in app '{app_label}': {} are all leaf nodes", join_keys(.leaves))]
    Conflict {
        app_label: String,
        leaves: Vec<MigrationKey>,
    },
}

fn join_keys(keys: &[MigrationKey]) -> String {
    keys.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
}

/// Validated, ordered migration log
#[derive(Debug, Clone, Default)]
pub struct MigrationGraph {
    nodes: BTreeMap<MigrationKey, MigrationRecord>,
    plan: Vec<MigrationKey>,
}

impl MigrationGraph {
    /// Validate the records and compute the replay order
    pub fn build(records: Vec<MigrationRecord>) -> Result<Self, GraphError> {
        let mut nodes = BTreeMap::new();
        for record in records {
            let key = record.key();
            if nodes.insert(key.clone(), record).is_some() {
                return Err(GraphError::Duplicate(key));
            }
        }

        for (key, record) in &nodes {
            for dependency in &record.dependencies {
                if !nodes.contains_key(dependency) {
                    return Err(GraphError::MissingDependency {
                        migration: key.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let plan = Self::topological_order(&nodes)?;
        let graph = Self { nodes, plan };
        graph.check_conflicts()?;
        Ok(graph)
    }

    /// Kahn's algorithm; ties are broken by key order so the plan is stable
    fn topological_order(
        nodes: &BTreeMap<MigrationKey, MigrationRecord>,
    ) -> Result<Vec<MigrationKey>, GraphError> {
        let mut remaining: BTreeMap<&MigrationKey, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&MigrationKey, Vec<&MigrationKey>> = BTreeMap::new();

        for (key, record) in nodes {
            let unique: BTreeSet<&MigrationKey> = record.dependencies.iter().collect();
            remaining.insert(key, unique.len());
            for dependency in unique {
                dependents.entry(dependency).or_default().push(key);
            }
        }

        let mut ready: BTreeSet<&MigrationKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut plan = Vec::with_capacity(nodes.len());

        while let Some(key) = ready.pop_first() {
            plan.push(key.clone());
            if let Some(children) = dependents.get(key) {
                for &child in children {
                    if let Some(count) = remaining.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(child);
                        }
                    }
                }
            }
        }

        if plan.len() < nodes.len() {
            let placed: BTreeSet<&MigrationKey> = plan.iter().collect();
            let stuck = nodes
                .keys()
                .filter(|k| !placed.contains(k))
                .cloned()
                .collect();
            return Err(GraphError::Cycle(stuck));
        }

        Ok(plan)
    }

    /// More than one leaf per app means two branches were never merged
    fn check_conflicts(&self) -> Result<(), GraphError> {
        for app_label in self.app_labels() {
            let leaves = self.leaves(&app_label);
            if leaves.len() > 1 {
                return Err(GraphError::Conflict { app_label, leaves });
            }
        }
        Ok(())
    }

    pub fn app_labels(&self) -> BTreeSet<String> {
        self.nodes.keys().map(|k| k.app_label.clone()).collect()
    }

    /// Records of `app_label` that no other record of the same app depends on
    pub fn leaves(&self, app_label: &str) -> Vec<MigrationKey> {
        let depended_on: BTreeSet<&MigrationKey> = self
            .nodes
            .values()
            .filter(|r| r.app_label == app_label)
            .flat_map(|r| r.dependencies.iter())
            .filter(|d| d.app_label == app_label)
            .collect();

        self.nodes
            .keys()
            .filter(|k| k.app_label == app_label && !depended_on.contains(k))
            .cloned()
            .collect()
    }

    /// Sequence number the next migration of `app_label` should take
    pub fn next_number(&self, app_label: &str) -> u32 {
        self.nodes
            .keys()
            .filter(|k| k.app_label == app_label)
            .filter_map(|k| k.number())
            .max()
            .map_or(1, |n| n + 1)
    }

    /// Records in replay order
    pub fn plan(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.plan.iter().filter_map(|key| self.nodes.get(key))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn record(app: &str, name: &str, deps: &[&str]) -> MigrationRecord {
        MigrationRecord {
            app_label: app.to_string(),
            name: name.to_string(),
            dependencies: deps.iter().map(|d| MigrationKey::parse(d).unwrap()).collect(),
            operations: vec![],
            applied_at: None,
        }
    }

    fn plan_names(graph: &MigrationGraph) -> Vec<String> {
        graph.plan().map(|r| r.key().to_string()).collect()
    }

    #[test]
    fn test_plan_respects_cross_app_dependencies() {
        let graph = MigrationGraph::build(vec![
            record("alerts", "0001_initial", &["core.0001_initial", "detection.0001_initial"]),
            record("detection", "0001_initial", &["core.0002_site_metadata"]),
            record("core", "0002_site_metadata", &["core.0001_initial"]),
            record("core", "0001_initial", &[]),
        ])
        .unwrap();

        assert_eq!(
            plan_names(&graph),
            vec![
                "core.0001_initial",
                "core.0002_site_metadata",
                "detection.0001_initial",
                "alerts.0001_initial",
            ]
        );
    }

    #[test]
    fn test_empty_log() {
        let graph = MigrationGraph::build(vec![]).unwrap();
        assert_eq!(graph.len(), 0);
        assert_eq!(graph.next_number("core"), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = MigrationGraph::build(vec![
            record("core", "0001_initial", &[]),
            record("core", "0001_initial", &[]),
        ])
        .unwrap_err();
        assert_eq!(err, GraphError::Duplicate(MigrationKey::new("core", "0001_initial")));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = MigrationGraph::build(vec![record("alerts", "0001_initial", &["core.0001_initial"])])
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingDependency { .. }));
        assert!(err.to_string().contains("core.0001_initial"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = MigrationGraph::build(vec![
            record("core", "0001_initial", &["core.0002_b"]),
            record("core", "0002_b", &["core.0001_initial"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(ref keys) if keys.len() == 2));
    }

    #[test]
    fn test_conflicting_leaves_rejected() {
        let err = MigrationGraph::build(vec![
            record("core", "0001_initial", &[]),
            record("core", "0002_site_metadata", &["core.0001_initial"]),
            record("core", "0002_gislayer", &["core.0001_initial"]),
        ])
        .unwrap_err();

        match err {
            GraphError::Conflict { app_label, leaves } => {
                assert_eq!(app_label, "core");
                assert_eq!(leaves.len(), 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_next_number() {
        let graph = MigrationGraph::build(vec![
            record("core", "0001_initial", &[]),
            record("core", "0002_site_metadata", &["core.0001_initial"]),
        ])
        .unwrap();
        assert_eq!(graph.next_number("core"), 3);
        assert_eq!(graph.next_number("alerts"), 1);
        assert_eq!(graph.leaves("core"), vec![MigrationKey::new("core", "0002_site_metadata")]);
    }
}
