// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! CSV schema value objects (spec.md §3, §4.7).

use std::collections::BTreeSet;
use std::fmt;

/// Field types recognized by the schema validator (spec.md §4.7 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Email,
    Url,
    IpAddress,
    Uuid,
    Enum,
    Custom,
}

/// Constraints attached to a schema field. `predicate` and `default` are
/// runtime-only (not serializable); a schema carrying either loses those
/// two fields across a `to_json`/`Serialize` round trip, consistent with
/// `from_json` being unimplemented (SPEC_FULL.md §9 Open Questions).
#[derive(Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FieldConstraints {
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    #[serde(skip)]
    pub regex: Option<regex::Regex>,
    pub enum_values: BTreeSet<String>,
    #[serde(skip)]
    pub predicate: Option<std::sync::Arc<dyn Fn(&str) -> bool + Send + Sync>>,
    pub default: Option<String>,
    pub aliases: Vec<String>,
}

impl fmt::Debug for FieldConstraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldConstraints")
            .field("required", &self.required)
            .field("min_length", &self.min_length)
            .field("max_length", &self.max_length)
            .field("min_value", &self.min_value)
            .field("max_value", &self.max_value)
            .field("regex", &self.regex.as_ref().map(|r| r.as_str()))
            .field("enum_values", &self.enum_values)
            .field("has_predicate", &self.predicate.is_some())
            .field("default", &self.default)
            .field("aliases", &self.aliases)
            .finish()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub position: usize,
    pub constraints: FieldConstraints,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType, position: usize) -> Self {
        Self {
            name: name.into(),
            field_type,
            position,
            constraints: FieldConstraints::default(),
        }
    }

    pub fn required(mut self) -> Self {
        self.constraints.required = true;
        self
    }

    pub fn matches_name_or_alias(&self, column: &str) -> bool {
        self.name.eq_ignore_ascii_case(column) || self.constraints.aliases.iter().any(|a| a.eq_ignore_ascii_case(column))
    }
}

/// Semantic version with the compatibility rule from spec.md §3: two
/// versions are compatible iff their major components are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn compatible_with(&self, other: &SchemaVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: SchemaVersion,
    pub fields: Vec<SchemaField>,
    pub strict_mode: bool,
    pub allow_extra_columns: bool,
    pub header_required: bool,
    pub description: String,
}

impl Schema {
    pub fn new(name: impl Into<String>, version: SchemaVersion) -> Self {
        Self {
            name: name.into(),
            version,
            fields: Vec::new(),
            strict_mode: false,
            allow_extra_columns: false,
            header_required: true,
            description: String::new(),
        }
    }

    /// Invariant check: field names unique, positions unique, at least
    /// one field (spec.md §3).
    pub fn is_valid(&self) -> bool {
        if self.fields.is_empty() {
            return false;
        }
        let mut names = BTreeSet::new();
        let mut positions = BTreeSet::new();
        for field in &self.fields {
            if !names.insert(field.name.to_ascii_lowercase()) {
                return false;
            }
            if !positions.insert(field.position) {
                return false;
            }
        }
        true
    }

    pub fn field_by_column(&self, column: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.matches_name_or_alias(column))
    }

    /// `from.major == to.major && from <= to` (spec.md §4.7 migration).
    pub fn can_migrate_to(&self, target: SchemaVersion) -> bool {
        self.version.major == target.major && self.version <= target
    }

    /// Copies fields and flags, stamps the new version, and annotates the
    /// description (spec.md §4.7 `migrate`).
    pub fn migrate(&self, target: SchemaVersion) -> Option<Schema> {
        if !self.can_migrate_to(target) {
            return None;
        }
        let mut migrated = self.clone();
        migrated.version = target;
        migrated.description = format!("{} (migrated from {})", self.description, self.version);
        Some(migrated)
    }

    /// Serializes to JSON. `from_json`/`Deserialize` for `Schema` is an
    /// explicit non-goal (SPEC_FULL.md §9): no canonical schema wire
    /// format has been agreed, so round-tripping is intentionally
    /// one-directional.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_iff_major_matches() {
        let a = SchemaVersion::new(1, 2, 0);
        let b = SchemaVersion::new(1, 9, 9);
        let c = SchemaVersion::new(2, 0, 0);
        assert!(a.compatible_with(&b));
        assert!(!a.compatible_with(&c));
    }

    #[test]
    fn migration_preserves_field_count_and_order() {
        let mut schema = Schema::new("probe", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("url", FieldType::Url, 0).required());
        schema.fields.push(SchemaField::new("status", FieldType::Integer, 1));

        let migrated = schema.migrate(SchemaVersion::new(1, 1, 0)).unwrap();
        assert_eq!(migrated.fields.len(), schema.fields.len());
        assert_eq!(migrated.fields[0].name, "url");
        assert_eq!(migrated.fields[1].name, "status");
        assert_eq!(migrated.version, SchemaVersion::new(1, 1, 0));
    }

    #[test]
    fn cannot_migrate_across_major_versions() {
        let schema = Schema::new("probe", SchemaVersion::new(1, 0, 0));
        assert!(!schema.can_migrate_to(SchemaVersion::new(2, 0, 0)));
        assert!(schema.migrate(SchemaVersion::new(2, 0, 0)).is_none());
    }

    #[test]
    fn validity_requires_unique_names_and_positions() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("a", FieldType::String, 0));
        schema.fields.push(SchemaField::new("a", FieldType::String, 1));
        assert!(!schema.is_valid());
    }
}
