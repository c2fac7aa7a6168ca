//! Model State Module
//!
//! The shape of every persisted entity, as declared by the application or as
//! rebuilt by replaying the migration log. Both sides of the gate use these
//! types so they can be compared field by field.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifies a model across apps (e.g., "core.site")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelKey {
    pub app_label: String,
    /// Lower-cased model name
    pub model: String,
}

impl ModelKey {
    pub fn new(app_label: impl AsRef<str>, model: impl AsRef<str>) -> Self {
        Self {
            app_label: app_label.as_ref().to_lowercase(),
            model: model.as_ref().to_lowercase(),
        }
    }

    /// Parse a dotted "app.model" reference
    pub fn parse(reference: &str) -> Option<Self> {
        let (app, model) = reference.split_once('.')?;
        if app.is_empty() || model.is_empty() || model.contains('.') {
            return None;
        }
        Some(Self::new(app, model))
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.model)
    }
}

impl Serialize for ModelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ModelKey::parse(&raw).ok_or_else(|| {
            de::Error::custom(format!("invalid model reference '{}' (expected app.model)", raw))
        })
    }
}

/// Field types understood by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Auto,
    BigAuto,
    Char,
    Text,
    Integer,
    BigInteger,
    Float,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Json,
    File,
    Uuid,
    ForeignKey,
    OneToOne,
    Point,
    Polygon,
}

impl FieldKind {
    pub fn is_relation(self) -> bool {
        matches!(self, FieldKind::ForeignKey | FieldKind::OneToOne)
    }

    pub fn is_geometry(self) -> bool {
        matches!(self, FieldKind::Point | FieldKind::Polygon)
    }
}

/// What happens to dependent rows when the referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    Protect,
    SetNull,
    SetDefault,
    DoNothing,
}

/// Relation target for foreign key and one-to-one fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub to: ModelKey,
    pub on_delete: OnDelete,
}

/// A single field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldState {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub null: bool,
    #[serde(default)]
    pub blank: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_digits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srid: Option<i32>,
    #[serde(default)]
    pub auto_now: bool,
    #[serde(default)]
    pub auto_now_add: bool,
    /// Allowed stored values, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Relation>,
}

impl FieldState {
    /// Minimal field of the given kind; everything else defaulted
    #[cfg(test)]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            null: false,
            blank: false,
            unique: false,
            primary_key: false,
            default: None,
            max_length: None,
            max_digits: None,
            decimal_places: None,
            srid: None,
            auto_now: false,
            auto_now_add: false,
            choices: Vec::new(),
            relation: None,
        }
    }

    /// Check the definition is internally consistent
    pub fn validate(&self, owner: &ModelKey) -> Result<(), String> {
        if !is_identifier(&self.name) {
            return Err(format!("{}: invalid field name '{}'", owner, self.name));
        }
        match (self.kind.is_relation(), &self.relation) {
            (true, None) => {
                return Err(format!("{}.{}: relation field without a target", owner, self.name));
            }
            (false, Some(_)) => {
                return Err(format!(
                    "{}.{}: only foreign_key and one_to_one fields may declare a relation",
                    owner, self.name
                ));
            }
            _ => {}
        }
        if self.kind == FieldKind::Char && self.max_length.is_none() {
            return Err(format!("{}.{}: char field requires maxLength", owner, self.name));
        }
        if self.kind == FieldKind::Decimal {
            match (self.max_digits, self.decimal_places) {
                (Some(digits), Some(places)) if places <= digits => {}
                (Some(_), Some(_)) => {
                    return Err(format!(
                        "{}.{}: decimalPlaces exceeds maxDigits",
                        owner, self.name
                    ));
                }
                _ => {
                    return Err(format!(
                        "{}.{}: decimal field requires maxDigits and decimalPlaces",
                        owner, self.name
                    ));
                }
            }
        }
        if self.srid.is_some() && !self.kind.is_geometry() {
            return Err(format!("{}.{}: srid is only valid on geometry fields", owner, self.name));
        }
        Ok(())
    }

    /// Human-readable list of what differs from `before`
    pub fn changes_from(&self, before: &FieldState) -> Vec<String> {
        let mut changes = Vec::new();

        if before.kind != self.kind {
            changes.push(format!("kind: {:?} → {:?}", before.kind, self.kind));
        }
        if before.null != self.null {
            changes.push(if self.null { "now nullable".to_string() } else { "now NOT NULL".to_string() });
        }
        if before.blank != self.blank {
            changes.push(format!("blank: {} → {}", before.blank, self.blank));
        }
        if before.unique != self.unique {
            changes.push(format!("unique: {} → {}", before.unique, self.unique));
        }
        if before.primary_key != self.primary_key {
            changes.push(format!("primary key: {} → {}", before.primary_key, self.primary_key));
        }
        if before.default != self.default {
            changes.push(format!("default: {} → {}", display_opt(&before.default), display_opt(&self.default)));
        }
        if before.max_length != self.max_length {
            changes.push(format!("max length: {} → {}", display_opt(&before.max_length), display_opt(&self.max_length)));
        }
        if before.max_digits != self.max_digits || before.decimal_places != self.decimal_places {
            changes.push(format!(
                "precision: ({}, {}) → ({}, {})",
                display_opt(&before.max_digits),
                display_opt(&before.decimal_places),
                display_opt(&self.max_digits),
                display_opt(&self.decimal_places)
            ));
        }
        if before.srid != self.srid {
            changes.push(format!("srid: {} → {}", display_opt(&before.srid), display_opt(&self.srid)));
        }
        if before.auto_now != self.auto_now || before.auto_now_add != self.auto_now_add {
            changes.push("timestamp behaviour changed".to_string());
        }
        if before.choices != self.choices {
            changes.push("choices changed".to_string());
        }
        if before.relation != self.relation {
            match (&before.relation, &self.relation) {
                (Some(old), Some(new)) if old.to == new.to => {
                    changes.push(format!("on delete: {:?} → {:?}", old.on_delete, new.on_delete));
                }
                (old, new) => changes.push(format!(
                    "target: {} → {}",
                    old.as_ref().map(|r| r.to.to_string()).unwrap_or_else(|| "none".to_string()),
                    new.as_ref().map(|r| r.to.to_string()).unwrap_or_else(|| "none".to_string())
                )),
            }
        }

        changes
    }
}

fn display_opt<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string())
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Model-level options that are part of the schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_table: Option<String>,
    #[serde(default)]
    pub ordering: Vec<String>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose_name_plural: Option<String>,
}

impl ModelOptions {
    /// Everything except `unique_together`, which has its own operation
    pub fn same_presentation(&self, other: &ModelOptions) -> bool {
        self.db_table == other.db_table
            && self.ordering == other.ordering
            && self.verbose_name == other.verbose_name
            && self.verbose_name_plural == other.verbose_name_plural
    }
}

/// Sort each group, then the groups, dropping duplicates and empty groups
pub fn normalize_unique_together(groups: &[Vec<String>]) -> Vec<Vec<String>> {
    let set: BTreeSet<Vec<String>> = groups
        .iter()
        .filter(|g| !g.is_empty())
        .map(|g| {
            let mut group = g.clone();
            group.sort();
            group.dedup();
            group
        })
        .collect();
    set.into_iter().collect()
}

/// A model (entity) definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub app_label: String,
    pub name: String,
    pub fields: Vec<FieldState>,
    #[serde(default)]
    pub options: ModelOptions,
}

impl ModelState {
    pub fn new(app_label: impl Into<String>, name: impl Into<String>, fields: Vec<FieldState>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            fields,
            options: ModelOptions::default(),
        }
    }

    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.app_label, &self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Normalize option ordering so equal definitions compare equal
    pub fn normalized(mut self) -> Self {
        self.options.unique_together = normalize_unique_together(&self.options.unique_together);
        self
    }

    /// Check names, duplicate fields and option references
    pub fn validate(&self) -> Result<(), String> {
        let key = self.key();
        if !is_identifier(&self.app_label) {
            return Err(format!("invalid app label '{}'", self.app_label));
        }
        if !is_identifier(&self.name) {
            return Err(format!("{}: invalid model name '{}'", self.app_label, self.name));
        }
        if self.fields.is_empty() {
            return Err(format!("{}: model declares no fields", key));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            field.validate(&key)?;
            if !seen.insert(field.name.as_str()) {
                return Err(format!("{}: duplicate field '{}'", key, field.name));
            }
        }

        if self.fields.iter().filter(|f| f.primary_key).count() > 1 {
            return Err(format!("{}: more than one primary key field", key));
        }

        for group in &self.options.unique_together {
            for name in group {
                if !seen.contains(name.as_str()) {
                    return Err(format!("{}: unique_together references unknown field '{}'", key, name));
                }
            }
        }

        for entry in &self.options.ordering {
            if entry == "?" {
                continue;
            }
            // "-site__name" orders by a related field; only the local part is checked
            let name = entry.trim_start_matches('-').split("__").next().unwrap_or_default();
            if !seen.contains(name) {
                return Err(format!("{}: ordering references unknown field '{}'", key, name));
            }
        }

        Ok(())
    }
}

/// A complete set of models keyed by `app.model`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSet {
    models: BTreeMap<ModelKey, ModelState>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate keys
    pub fn from_models(models: impl IntoIterator<Item = ModelState>) -> Result<Self, String> {
        let mut set = Self::new();
        for model in models {
            let key = model.key();
            if set.models.contains_key(&key) {
                return Err(format!("model {} declared twice", key));
            }
            set.models.insert(key, model.normalized());
        }
        Ok(set)
    }

    pub fn insert(&mut self, model: ModelState) -> Option<ModelState> {
        self.models.insert(model.key(), model.normalized())
    }

    pub fn get(&self, key: &ModelKey) -> Option<&ModelState> {
        self.models.get(key)
    }

    pub fn get_mut(&mut self, key: &ModelKey) -> Option<&mut ModelState> {
        self.models.get_mut(key)
    }

    pub fn remove(&mut self, key: &ModelKey) -> Option<ModelState> {
        self.models.remove(key)
    }

    pub fn contains(&self, key: &ModelKey) -> bool {
        self.models.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelKey, &ModelState)> {
        self.models.iter()
    }

    pub fn models_mut(&mut self) -> impl Iterator<Item = &mut ModelState> {
        self.models.values_mut()
    }

    /// Distinct app labels, sorted
    pub fn app_labels(&self) -> BTreeSet<String> {
        self.models.keys().map(|k| k.app_label.clone()).collect()
    }

    /// Models belonging to one app, in key order
    pub fn app_models<'a>(&'a self, app_label: &'a str) -> impl Iterator<Item = &'a ModelState> + 'a {
        self.models
            .iter()
            .filter(move |(k, _)| k.app_label == app_label)
            .map(|(_, m)| m)
    }

    /// SHA-256 over the canonical JSON form
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, model) in &self.models {
            hasher.update(key.to_string().as_bytes());
            // serde_json maps are sorted, so this is stable for equal models
            if let Ok(bytes) = serde_json::to_vec(model) {
                hasher.update(&bytes);
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Models of the site-monitoring application, used across test modules.

    use super::*;

    pub fn char_field(name: &str, max_length: u32) -> FieldState {
        FieldState {
            max_length: Some(max_length),
            ..FieldState::new(name, FieldKind::Char)
        }
    }

    pub fn fk(name: &str, to: &str, on_delete: OnDelete) -> FieldState {
        FieldState {
            null: on_delete == OnDelete::SetNull,
            relation: Some(Relation {
                to: ModelKey::parse(to).unwrap(),
                on_delete,
            }),
            ..FieldState::new(name, FieldKind::ForeignKey)
        }
    }

    pub fn id_field() -> FieldState {
        FieldState {
            primary_key: true,
            ..FieldState::new("id", FieldKind::BigAuto)
        }
    }

    pub fn site() -> ModelState {
        let mut model = ModelState::new(
            "core",
            "Site",
            vec![
                id_field(),
                FieldState { unique: true, ..char_field("name", 255) },
                fk("owner", "auth.user", OnDelete::Cascade),
                FieldState { srid: Some(4326), ..FieldState::new("boundary", FieldKind::Polygon) },
                FieldState { null: true, blank: true, ..FieldState::new("metadata", FieldKind::Json) },
                FieldState { auto_now_add: true, ..FieldState::new("created_at", FieldKind::DateTime) },
                FieldState { auto_now: true, ..FieldState::new("updated_at", FieldKind::DateTime) },
            ],
        );
        model.options.ordering = vec!["created_at".to_string()];
        model
    }

    pub fn satellite_image() -> ModelState {
        ModelState::new(
            "core",
            "SatelliteImage",
            vec![
                id_field(),
                fk("site", "core.site", OnDelete::Cascade),
                FieldState::new("image_file", FieldKind::File),
                FieldState::new("date_captured", FieldKind::DateTime),
                FieldState {
                    default: Some(serde_json::json!("PENDING")),
                    choices: vec!["PENDING".into(), "FETCHED".into(), "FAILED".into()],
                    ..char_field("status", 50)
                },
            ],
        )
    }

    pub fn alert() -> ModelState {
        let mut model = ModelState::new(
            "alerts",
            "Alert",
            vec![
                id_field(),
                char_field("type", 50),
                fk("site", "core.site", OnDelete::Cascade),
                FieldState {
                    default: Some(serde_json::json!("UNREAD")),
                    ..char_field("status", 20)
                },
                FieldState { blank: true, ..FieldState::new("description", FieldKind::Text) },
            ],
        );
        model.options.ordering = vec!["-id".to_string()];
        model
    }

    pub fn alert_rule() -> ModelState {
        let mut model = ModelState::new(
            "alerts",
            "AlertRule",
            vec![
                id_field(),
                fk("site", "core.site", OnDelete::Cascade),
                char_field("rule_type", 50),
                FieldState { null: true, blank: true, ..char_field("target_class", 100) },
                FieldState {
                    default: Some(serde_json::json!(true)),
                    ..FieldState::new("is_active", FieldKind::Boolean)
                },
            ],
        );
        model.options.unique_together = vec![vec![
            "site".to_string(),
            "rule_type".to_string(),
            "target_class".to_string(),
        ]];
        model
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_model_key_parse_and_display() {
        let key = ModelKey::parse("Core.Site").unwrap();
        assert_eq!(key.app_label, "core");
        assert_eq!(key.model, "site");
        assert_eq!(key.to_string(), "core.site");

        assert!(ModelKey::parse("site").is_none());
        assert!(ModelKey::parse("core.").is_none());
        assert!(ModelKey::parse("a.b.c").is_none());
    }

    #[test]
    fn test_checksum_consistency() {
        let a = ModelSet::from_models(vec![site(), alert()]).unwrap();
        let b = ModelSet::from_models(vec![alert(), site()]).unwrap();

        assert_eq!(a.checksum(), b.checksum());

        let c = ModelSet::from_models(vec![site()]).unwrap();
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let err = ModelSet::from_models(vec![site(), site()]).unwrap_err();
        assert!(err.contains("core.site"));
    }

    #[test]
    fn test_validate_rejects_char_without_length() {
        let mut model = site();
        model.fields.push(FieldState::new("code", FieldKind::Char));
        let err = model.validate().unwrap_err();
        assert!(err.contains("maxLength"));
    }

    #[test]
    fn test_validate_rejects_relation_without_target() {
        let mut model = site();
        model.fields.push(FieldState::new("parent", FieldKind::ForeignKey));
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_ordering_field() {
        let mut model = alert();
        model.options.ordering = vec!["-triggered_on".to_string()];
        let err = model.validate().unwrap_err();
        assert!(err.contains("triggered_on"));
    }

    #[test]
    fn test_unique_together_normalized() {
        let groups = vec![
            vec!["b".to_string(), "a".to_string()],
            vec![],
            vec!["a".to_string(), "b".to_string()],
        ];
        assert_eq!(
            normalize_unique_together(&groups),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[test]
    fn test_field_changes_listed() {
        let before = char_field("status", 20);
        let after = FieldState { null: true, ..char_field("status", 30) };
        let changes = after.changes_from(&before);

        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c == "now nullable"));
        assert!(changes.iter().any(|c| c.contains("20 → 30")));
    }
}
