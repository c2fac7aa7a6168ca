//! Schema operations
//!
//! The payload of a migration record. Each operation knows how to describe
//! itself and how to move a `ModelSet` forward; replaying a whole log this way
//! yields the schema the log accounts for.

use crate::schema::{normalize_unique_together, FieldState, ModelKey, ModelOptions, ModelSet, ModelState};
use serde::{Deserialize, Serialize};

/// Types of schema operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Operation {
    /// Create a new model
    CreateModel(CreateModel),
    /// Delete an existing model
    DeleteModel(DeleteModel),
    /// Rename a model
    RenameModel(RenameModel),
    /// Add a field to a model
    AddField(AddField),
    /// Remove a field
    RemoveField(RemoveField),
    /// Replace a field definition
    AlterField(AlterField),
    /// Rename a field
    RenameField(RenameField),
    /// Replace the unique_together groups
    AlterUniqueTogether(AlterUniqueTogether),
    /// Replace ordering, verbose names and table name
    AlterModelOptions(AlterModelOptions),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateModel {
    pub name: String,
    pub fields: Vec<FieldState>,
    #[serde(default)]
    pub options: ModelOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteModel {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameModel {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddField {
    pub model_name: String,
    pub field: FieldState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveField {
    pub model_name: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterField {
    pub model_name: String,
    pub field: FieldState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameField {
    pub model_name: String,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterUniqueTogether {
    pub name: String,
    pub unique_together: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterModelOptions {
    pub name: String,
    /// `unique_together` in here is ignored; it has its own operation
    pub options: ModelOptions,
}

impl Operation {
    /// The model this operation targets, as written in the operation
    pub fn model_name(&self) -> &str {
        match self {
            Operation::CreateModel(o) => &o.name,
            Operation::DeleteModel(o) => &o.name,
            Operation::RenameModel(o) => &o.old_name,
            Operation::AddField(o) => &o.model_name,
            Operation::RemoveField(o) => &o.model_name,
            Operation::AlterField(o) => &o.model_name,
            Operation::RenameField(o) => &o.model_name,
            Operation::AlterUniqueTogether(o) => &o.name,
            Operation::AlterModelOptions(o) => &o.name,
        }
    }

    /// Get a human-readable description of the operation
    pub fn describe(&self, app_label: &str) -> String {
        let model = ModelKey::new(app_label, self.model_name());
        match self {
            Operation::CreateModel(o) => format!("Create model {} ({} fields)", model, o.fields.len()),
            Operation::DeleteModel(_) => format!("Delete model {}", model),
            Operation::RenameModel(o) => format!("Rename model {} to {}", model, o.new_name),
            Operation::AddField(o) => format!("Add field {} to {}", o.field.name, model),
            Operation::RemoveField(o) => format!("Remove field {} from {}", o.name, model),
            Operation::AlterField(o) => format!("Alter field {} on {}", o.field.name, model),
            Operation::RenameField(o) => {
                format!("Rename field {} on {} to {}", o.old_name, model, o.new_name)
            }
            Operation::AlterUniqueTogether(o) => format!(
                "Alter unique_together for {} ({} constraint(s))",
                model,
                o.unique_together.len()
            ),
            Operation::AlterModelOptions(_) => format!("Change Meta options on {}", model),
        }
    }

    /// Check if this operation loses data
    pub fn is_destructive(&self) -> bool {
        matches!(self, Operation::DeleteModel(_) | Operation::RemoveField(_))
    }

    /// Fragment used when naming a migration that contains this operation
    pub fn name_fragment(&self) -> String {
        let model = self.model_name().to_lowercase();
        match self {
            Operation::CreateModel(_) => model,
            Operation::DeleteModel(_) => format!("delete_{}", model),
            Operation::RenameModel(o) => format!("rename_{}_{}", model, o.new_name.to_lowercase()),
            Operation::AddField(o) => format!("{}_{}", model, o.field.name.to_lowercase()),
            Operation::RemoveField(o) => format!("remove_{}_{}", model, o.name.to_lowercase()),
            Operation::AlterField(o) => format!("alter_{}_{}", model, o.field.name.to_lowercase()),
            Operation::RenameField(o) => format!(
                "rename_{}_{}_{}",
                o.old_name.to_lowercase(),
                model,
                o.new_name.to_lowercase()
            ),
            Operation::AlterUniqueTogether(_) => format!("alter_{}_unique_together", model),
            Operation::AlterModelOptions(_) => format!("alter_{}_options", model),
        }
    }

    /// Apply this operation to `state`; an error means the log is inconsistent
    pub fn state_forwards(&self, app_label: &str, state: &mut ModelSet) -> Result<(), String> {
        let key = ModelKey::new(app_label, self.model_name());

        match self {
            Operation::CreateModel(o) => {
                if state.contains(&key) {
                    return Err(format!("model {} already exists", key));
                }
                let mut model = ModelState::new(app_label, &o.name, o.fields.clone());
                model.options = o.options.clone();
                if let Some(dup) = first_duplicate(&model.fields) {
                    return Err(format!("model {} declares field '{}' twice", key, dup));
                }
                state.insert(model);
            }
            Operation::DeleteModel(_) => {
                state
                    .remove(&key)
                    .ok_or_else(|| format!("model {} does not exist", key))?;
            }
            Operation::RenameModel(o) => {
                let new_key = ModelKey::new(app_label, &o.new_name);
                // A case-only rename keeps the same key
                if new_key != key && state.contains(&new_key) {
                    return Err(format!("model {} already exists", new_key));
                }
                let mut model = state
                    .remove(&key)
                    .ok_or_else(|| format!("model {} does not exist", key))?;
                model.name = o.new_name.clone();
                state.insert(model);

                // Relations follow the model to its new name
                for model in state.models_mut() {
                    for field in &mut model.fields {
                        if let Some(relation) = field.relation.as_mut() {
                            if relation.to == key {
                                relation.to = new_key.clone();
                            }
                        }
                    }
                }
            }
            Operation::AddField(o) => {
                let model = existing(state, &key)?;
                if model.field(&o.field.name).is_some() {
                    return Err(format!("field {}.{} already exists", key, o.field.name));
                }
                model.fields.push(o.field.clone());
            }
            Operation::RemoveField(o) => {
                let model = existing(state, &key)?;
                let position = model
                    .field_position(&o.name)
                    .ok_or_else(|| format!("field {}.{} does not exist", key, o.name))?;
                model.fields.remove(position);
            }
            Operation::AlterField(o) => {
                let model = existing(state, &key)?;
                let position = model
                    .field_position(&o.field.name)
                    .ok_or_else(|| format!("field {}.{} does not exist", key, o.field.name))?;
                model.fields[position] = o.field.clone();
            }
            Operation::RenameField(o) => {
                let model = existing(state, &key)?;
                if model.field(&o.new_name).is_some() {
                    return Err(format!("field {}.{} already exists", key, o.new_name));
                }
                let position = model
                    .field_position(&o.old_name)
                    .ok_or_else(|| format!("field {}.{} does not exist", key, o.old_name))?;
                model.fields[position].name = o.new_name.clone();
                rename_in_options(&mut model.options, &o.old_name, &o.new_name);
            }
            Operation::AlterUniqueTogether(o) => {
                let model = existing(state, &key)?;
                model.options.unique_together = normalize_unique_together(&o.unique_together);
            }
            Operation::AlterModelOptions(o) => {
                let model = existing(state, &key)?;
                let unique_together = std::mem::take(&mut model.options.unique_together);
                model.options = ModelOptions {
                    unique_together,
                    ..o.options.clone()
                };
            }
        }

        Ok(())
    }
}

fn existing<'a>(state: &'a mut ModelSet, key: &ModelKey) -> Result<&'a mut ModelState, String> {
    state
        .get_mut(key)
        .ok_or_else(|| format!("model {} does not exist", key))
}

fn first_duplicate(fields: &[FieldState]) -> Option<&str> {
    fields
        .iter()
        .enumerate()
        .find(|(i, f)| fields[..*i].iter().any(|other| other.name == f.name))
        .map(|(_, f)| f.name.as_str())
}

fn rename_in_options(options: &mut ModelOptions, old: &str, new: &str) {
    for entry in &mut options.ordering {
        let descending = entry.starts_with('-');
        let bare = entry.trim_start_matches('-');
        let (head, tail) = match bare.split_once("__") {
            Some((head, tail)) => (head, Some(tail)),
            None => (bare, None),
        };
        if head == old {
            let mut renamed = String::new();
            if descending {
                renamed.push('-');
            }
            renamed.push_str(new);
            if let Some(tail) = tail {
                renamed.push_str("__");
                renamed.push_str(tail);
            }
            *entry = renamed;
        }
    }

    for group in &mut options.unique_together {
        for name in group.iter_mut() {
            if name == old {
                *name = new.to_string();
            }
        }
    }
    options.unique_together = normalize_unique_together(&options.unique_together);
}
