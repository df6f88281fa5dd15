// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! # CSV schema validator and registry (C7)
//!
//! Schemas are registered in a two-level `name -> version -> Schema` map
//! (spec.md §4.7). Validation dispatches per field type against a fixed
//! rule table, with per-field error-rate limiting and header checks.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bb_pipeline_domain::error::{CoreError, Severity};
use bb_pipeline_domain::value_objects::{FieldType, ParsedRow, Schema, SchemaField, SchemaVersion};
use regex::Regex;

const EMPTY_MARKERS: &[&str] = &["", "null", "NULL", "N/A"];

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub severity: Severity,
    pub field_name: String,
    pub row_number: u64,
    pub column_number: u64,
    pub message: String,
    pub actual_value: String,
    pub expected_format: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub total_rows: u64,
    pub valid_rows: u64,
    pub error_rows: u64,
    pub warning_rows: u64,
    pub errors: Vec<ValidationError>,
    pub field_error_counts: HashMap<String, u64>,
    pub duration: Duration,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.error_rows == 0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            self.valid_rows as f64 / self.total_rows as f64 * 100.0
        }
    }

    pub fn errors_by_severity(&self, severity: Severity) -> Vec<&ValidationError> {
        self.errors.iter().filter(|e| e.severity == severity).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub max_errors_per_field: u64,
    pub stop_on_first_error: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_errors_per_field: 50,
            stop_on_first_error: false,
        }
    }
}

/// C7. Owns the `name -> version -> Schema` registry; validation is a
/// pure function of a `Schema` and rows, so it takes no lock.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, BTreeMap<SchemaVersion, Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: Schema) {
        self.schemas.entry(schema.name.clone()).or_default().insert(schema.version, schema);
    }

    /// Exact match first, then the highest-versioned schema compatible
    /// with (same major as) the requested version (spec.md §4.7 lookup).
    pub fn get(&self, name: &str, version: SchemaVersion) -> Option<&Schema> {
        let versions = self.schemas.get(name)?;
        if let Some(exact) = versions.get(&version) {
            return Some(exact);
        }
        versions.values().rev().find(|schema| schema.version.compatible_with(&version))
    }

    pub fn get_schema_versions(&self, name: &str) -> Vec<SchemaVersion> {
        self.schemas.get(name).map(|versions| versions.keys().copied().collect()).unwrap_or_default()
    }

    pub fn latest(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)?.values().next_back()
    }
}

/// The ten reserved BB-Pipeline CSV contracts, each seeded at `1.0.0`
/// (spec.md §4.7 supplement, derived from the original module list).
pub fn seed_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    for builder in [
        scope_schema,
        subdomains_schema,
        probe_schema,
        headless_schema,
        discovery_schema,
        jsintel_schema,
        api_catalog_schema,
        api_findings_schema,
        mobile_intel_schema,
        changes_schema,
        final_ranked_schema,
    ] {
        registry.register(builder());
    }
    registry
}

fn base_schema(name: &str) -> Schema {
    Schema::new(name, SchemaVersion::new(1, 0, 0))
}

fn scope_schema() -> Schema {
    let mut schema = base_schema("scope");
    schema.fields.push(SchemaField::new("domain", FieldType::String, 0).required());
    schema.fields.push(SchemaField::new("in_scope", FieldType::Boolean, 1).required());
    schema
}

fn subdomains_schema() -> Schema {
    let mut schema = base_schema("subdomains");
    schema.fields.push(SchemaField::new("subdomain", FieldType::String, 0).required());
    schema.fields.push(SchemaField::new("source", FieldType::String, 1));
    schema.fields.push(SchemaField::new("discovered_at", FieldType::DateTime, 2));
    schema
}

fn probe_schema() -> Schema {
    let mut schema = base_schema("probe");
    schema.fields.push(SchemaField::new("url", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("status_code", FieldType::Integer, 1));
    schema.fields.push(SchemaField::new("ip_address", FieldType::IpAddress, 2));
    schema
}

fn headless_schema() -> Schema {
    let mut schema = base_schema("headless");
    schema.fields.push(SchemaField::new("url", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("title", FieldType::String, 1));
    schema.fields.push(SchemaField::new("screenshot_path", FieldType::String, 2));
    schema
}

fn discovery_schema() -> Schema {
    let mut schema = base_schema("discovery");
    schema.fields.push(SchemaField::new("url", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("method", FieldType::String, 1));
    schema.fields.push(SchemaField::new("param", FieldType::String, 2));
    schema
}

fn jsintel_schema() -> Schema {
    let mut schema = base_schema("jsintel");
    schema.fields.push(SchemaField::new("script_url", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("finding_type", FieldType::String, 1).required());
    schema.fields.push(SchemaField::new("secret_hint", FieldType::String, 2));
    schema
}

fn api_catalog_schema() -> Schema {
    let mut schema = base_schema("api_catalog");
    schema.fields.push(SchemaField::new("endpoint", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("method", FieldType::String, 1).required());
    schema.fields.push(SchemaField::new("auth_required", FieldType::Boolean, 2));
    schema
}

fn api_findings_schema() -> Schema {
    let mut schema = base_schema("api_findings");
    schema.fields.push(SchemaField::new("endpoint", FieldType::Url, 0).required());
    schema.fields.push(SchemaField::new("finding_id", FieldType::Uuid, 1).required());
    schema.fields.push(SchemaField::new("severity", FieldType::Enum, 2));
    schema
}

fn mobile_intel_schema() -> Schema {
    let mut schema = base_schema("mobile_intel");
    schema.fields.push(SchemaField::new("package_id", FieldType::String, 0).required());
    schema.fields.push(SchemaField::new("platform", FieldType::Enum, 1).required());
    schema.fields.push(SchemaField::new("endpoint", FieldType::Url, 2));
    schema
}

fn changes_schema() -> Schema {
    let mut schema = base_schema("changes");
    schema.fields.push(SchemaField::new("target", FieldType::String, 0).required());
    schema.fields.push(SchemaField::new("changed_at", FieldType::DateTime, 1).required());
    schema.fields.push(SchemaField::new("diff_summary", FieldType::String, 2));
    schema
}

fn final_ranked_schema() -> Schema {
    let mut schema = base_schema("final_ranked");
    schema.fields.push(SchemaField::new("target", FieldType::String, 0).required());
    schema.fields.push(SchemaField::new("risk_score", FieldType::Float, 1).required());
    schema.fields.push(SchemaField::new("rank", FieldType::Integer, 2).required());
    schema
}

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap())
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^https?://[A-Za-z0-9.-]+\.[A-Za-z]{2,}(/.*)?$").unwrap())
}

fn ipv4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").unwrap())
}

fn ipv6_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f:]+$").unwrap())
}

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$").unwrap())
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap())
}

fn datetime_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})?$").unwrap())
}

const TRUE_WORDS: &[&str] = &["true", "1", "yes", "y", "on"];
const FALSE_WORDS: &[&str] = &["false", "0", "no", "n", "off"];

/// C7. Stateless dispatcher; owns no registry (that lives in
/// `SchemaRegistry`) so it can be shared freely across threads.
pub struct SchemaValidator {
    config: ValidatorConfig,
}

impl SchemaValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate_header(&self, schema: &Schema, header: &[String]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for field in &schema.fields {
            if field.constraints.required && !header.iter().any(|column| field.matches_name_or_alias(column)) {
                errors.push(ValidationError {
                    severity: Severity::Error,
                    field_name: field.name.clone(),
                    row_number: 0,
                    column_number: (field.position + 1) as u64,
                    message: format!("required field '{}' missing from header", field.name),
                    actual_value: String::new(),
                    expected_format: "present in header".to_string(),
                });
            }
        }
        if !schema.allow_extra_columns {
            for (idx, column) in header.iter().enumerate() {
                if schema.field_by_column(column).is_none() {
                    errors.push(ValidationError {
                        severity: if schema.strict_mode { Severity::Error } else { Severity::Warning },
                        field_name: column.clone(),
                        row_number: 0,
                        column_number: (idx + 1) as u64,
                        message: format!("column '{column}' is not declared in schema"),
                        actual_value: column.clone(),
                        expected_format: "declared schema field".to_string(),
                    });
                }
            }
        }
        errors
    }

    pub fn validate_rows<'a>(&self, schema: &Schema, rows: impl IntoIterator<Item = &'a ParsedRow>) -> ValidationResult {
        let start = Instant::now();
        let mut result = ValidationResult::default();
        let mut suppressed: HashMap<String, bool> = HashMap::new();

        for row in rows {
            result.total_rows += 1;
            let mut row_has_error = false;
            let mut row_has_warning = false;

            'fields: for field in &schema.fields {
                let raw = row.field(field.position).unwrap_or("");
                let trimmed = raw.trim();
                let is_empty = EMPTY_MARKERS.contains(&trimmed);

                if is_empty {
                    if field.constraints.required && field.constraints.default.is_none() {
                        if self.record_error(
                            &mut result,
                            &mut suppressed,
                            ValidationError {
                                severity: Severity::Error,
                                field_name: field.name.clone(),
                                row_number: row.row_number,
                                column_number: (field.position + 1) as u64,
                                message: format!("required field '{}' is empty", field.name),
                                actual_value: raw.to_string(),
                                expected_format: "non-empty value".to_string(),
                            },
                        ) {
                            row_has_error = true;
                        }
                        if self.config.stop_on_first_error {
                            break 'fields;
                        }
                    }
                    continue;
                }

                if let Some(error) = validate_typed(field, trimmed, row.row_number) {
                    let severity = error.severity;
                    if self.record_error(&mut result, &mut suppressed, error) {
                        match severity {
                            Severity::Warning => row_has_warning = true,
                            _ => row_has_error = true,
                        }
                    }
                    if self.config.stop_on_first_error && severity != Severity::Warning {
                        break 'fields;
                    }
                }
            }

            if row_has_error {
                result.error_rows += 1;
            } else if row_has_warning {
                result.warning_rows += 1;
                result.valid_rows += 1;
            } else {
                result.valid_rows += 1;
            }
        }

        result.duration = start.elapsed();
        result
    }

    /// Applies the per-field error-rate limit: once a field has reached
    /// `max_errors_per_field`, one warning is recorded and every
    /// subsequent error on that field is dropped silently (spec.md §4.7).
    fn record_error(&self, result: &mut ValidationResult, suppressed: &mut HashMap<String, bool>, error: ValidationError) -> bool {
        let count = result.field_error_counts.entry(error.field_name.clone()).or_insert(0);
        *count += 1;

        if *suppressed.get(&error.field_name).unwrap_or(&false) {
            return false;
        }

        if *count > self.config.max_errors_per_field {
            suppressed.insert(error.field_name.clone(), true);
            result.errors.push(ValidationError {
                severity: Severity::Warning,
                field_name: error.field_name.clone(),
                row_number: error.row_number,
                column_number: error.column_number,
                message: format!("field '{}' exceeded {} errors; further errors suppressed", error.field_name, self.config.max_errors_per_field),
                actual_value: String::new(),
                expected_format: String::new(),
            });
            return true;
        }

        result.errors.push(error);
        true
    }
}

fn validate_typed(field: &SchemaField, value: &str, row_number: u64) -> Option<ValidationError> {
    let fail = |message: String, expected: &str| {
        Some(ValidationError {
            severity: Severity::Error,
            field_name: field.name.clone(),
            row_number,
            column_number: (field.position + 1) as u64,
            message,
            actual_value: value.to_string(),
            expected_format: expected.to_string(),
        })
    };

    match field.field_type {
        FieldType::String => {
            let constraints = &field.constraints;
            if let Some(min) = constraints.min_length {
                if value.len() < min {
                    return fail(format!("length {} below minimum {min}", value.len()), "longer string");
                }
            }
            if let Some(max) = constraints.max_length {
                if value.len() > max {
                    return fail(format!("length {} above maximum {max}", value.len()), "shorter string");
                }
            }
            if let Some(regex) = &constraints.regex {
                if !regex.is_match(value) {
                    return fail("does not match required pattern".to_string(), regex.as_str());
                }
            }
            None
        }
        FieldType::Integer => match value.parse::<i64>() {
            Ok(n) => check_numeric_range(field, n as f64, row_number, value),
            Err(_) => fail("not a valid 64-bit integer".to_string(), "signed 64-bit integer"),
        },
        FieldType::Float => match value.parse::<f64>() {
            Ok(n) if n.is_finite() => check_numeric_range(field, n, row_number, value),
            _ => fail("not a valid finite floating-point number".to_string(), "finite double"),
        },
        FieldType::Boolean => {
            let lower = value.to_ascii_lowercase();
            if TRUE_WORDS.contains(&lower.as_str()) || FALSE_WORDS.contains(&lower.as_str()) {
                None
            } else {
                fail("not a recognized boolean".to_string(), "true/false/1/0/yes/no/on/off")
            }
        }
        FieldType::Date => {
            if date_regex().is_match(value) {
                None
            } else {
                fail("does not match YYYY-MM-DD".to_string(), "YYYY-MM-DD")
            }
        }
        FieldType::DateTime => {
            if datetime_regex().is_match(value) {
                None
            } else {
                fail("does not match ISO-8601 datetime".to_string(), "ISO-8601 datetime")
            }
        }
        FieldType::Email => {
            if email_regex().is_match(value) {
                None
            } else {
                fail("not a valid email address".to_string(), "user@domain.tld")
            }
        }
        FieldType::Url => {
            if url_regex().is_match(value) {
                None
            } else {
                fail("not a valid http(s) URL".to_string(), "http(s)://host.tld/path")
            }
        }
        FieldType::IpAddress => {
            if is_valid_ipv4(value) || ipv6_regex().is_match(value) {
                None
            } else {
                fail("not a valid IPv4 or IPv6 address".to_string(), "dotted-quad IPv4 or hex IPv6")
            }
        }
        FieldType::Uuid => {
            if uuid_regex().is_match(value) {
                None
            } else {
                fail("not a valid UUID".to_string(), "8-4-4-4-12 hex")
            }
        }
        FieldType::Enum => {
            if field.constraints.enum_values.contains(value) {
                None
            } else {
                fail(format!("'{value}' is not a member of the enum set"), "declared enum value")
            }
        }
        FieldType::Custom => match &field.constraints.predicate {
            Some(predicate) if predicate(value) => None,
            Some(_) => fail("failed custom predicate".to_string(), "predicate-defined format"),
            None => None,
        },
    }
}

fn check_numeric_range(field: &SchemaField, value: f64, row_number: u64, raw: &str) -> Option<ValidationError> {
    let constraints = &field.constraints;
    if let Some(min) = constraints.min_value {
        if value < min {
            return Some(ValidationError {
                severity: Severity::Error,
                field_name: field.name.clone(),
                row_number,
                column_number: (field.position + 1) as u64,
                message: format!("{value} below minimum {min}"),
                actual_value: raw.to_string(),
                expected_format: format!(">= {min}"),
            });
        }
    }
    if let Some(max) = constraints.max_value {
        if value > max {
            return Some(ValidationError {
                severity: Severity::Error,
                field_name: field.name.clone(),
                row_number,
                column_number: (field.position + 1) as u64,
                message: format!("{value} above maximum {max}"),
                actual_value: raw.to_string(),
                expected_format: format!("<= {max}"),
            });
        }
    }
    None
}

fn is_valid_ipv4(value: &str) -> bool {
    let Some(captures) = ipv4_regex().captures(value) else {
        return false;
    };
    (1..=4).all(|i| captures[i].parse::<u16>().is_ok_and(|octet| octet <= 255))
}

/// A required error is still swallowed into `CoreError::Validation` for
/// callers that want a single hard-fail `Result` instead of a
/// `ValidationResult` report.
pub fn first_error_as_core_error(result: &ValidationResult) -> Option<CoreError> {
    let error = result.errors.iter().find(|e| e.severity != Severity::Warning)?;
    Some(CoreError::validation(error.severity, error.field_name.clone(), error.row_number, error.column_number, error.message.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(n: u64, fields: &[&str]) -> ParsedRow {
        ParsedRow::new(n, fields.iter().map(|s| s.to_string()).collect(), None)
    }

    #[test]
    fn seed_registry_contains_all_ten_reserved_schemas() {
        let registry = seed_registry();
        for name in [
            "scope",
            "subdomains",
            "probe",
            "headless",
            "discovery",
            "jsintel",
            "api_catalog",
            "api_findings",
            "mobile_intel",
            "changes",
            "final_ranked",
        ] {
            assert!(registry.get(name, SchemaVersion::new(1, 0, 0)).is_some(), "missing schema {name}");
        }
    }

    #[test]
    fn lookup_falls_back_to_latest_compatible_minor_version() {
        let mut registry = SchemaRegistry::new();
        registry.register(Schema::new("probe", SchemaVersion::new(1, 0, 0)));
        registry.register(Schema::new("probe", SchemaVersion::new(1, 2, 0)));
        let found = registry.get("probe", SchemaVersion::new(1, 1, 0)).unwrap();
        assert_eq!(found.version, SchemaVersion::new(1, 2, 0));
    }

    #[test]
    fn ten_row_file_with_one_malformed_email_reports_one_error_row() {
        let mut schema = Schema::new("contacts", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("email", FieldType::Email, 0).required());
        let validator = SchemaValidator::new(ValidatorConfig::default());

        let mut rows = Vec::new();
        for i in 0..9 {
            rows.push(row(i + 1, &[&format!("user{i}@example.com")]));
        }
        rows.push(row(10, &["not-an-email"]));

        let result = validator.validate_rows(&schema, &rows);
        assert_eq!(result.valid_rows, 9);
        assert_eq!(result.error_rows, 1);
        let error = result.errors.iter().find(|e| e.row_number == 10).unwrap();
        assert_eq!(error.column_number, 1);
    }

    #[test]
    fn empty_required_field_fails_without_default() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("name", FieldType::String, 0).required());
        let validator = SchemaValidator::new(ValidatorConfig::default());
        let result = validator.validate_rows(&schema, &[row(1, &["N/A"])]);
        assert_eq!(result.error_rows, 1);
    }

    #[test]
    fn header_validation_flags_missing_required_column() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("url", FieldType::Url, 0).required());
        let validator = SchemaValidator::new(ValidatorConfig::default());
        let errors = validator.validate_header(&schema, &["other".to_string()]);
        assert!(errors.iter().any(|e| e.field_name == "url"));
    }

    #[test]
    fn extra_column_is_warning_unless_strict() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("url", FieldType::Url, 0));
        let validator = SchemaValidator::new(ValidatorConfig::default());
        let errors = validator.validate_header(&schema, &["url".to_string(), "extra".to_string()]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Warning);
    }

    #[test]
    fn per_field_error_rate_limit_suppresses_after_threshold() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("n", FieldType::Integer, 0).required());
        let validator = SchemaValidator::new(ValidatorConfig { max_errors_per_field: 2, stop_on_first_error: false });
        let rows: Vec<ParsedRow> = (1..=5).map(|i| row(i, &["not-a-number"])).collect();
        let result = validator.validate_rows(&schema, &rows);
        // 2 real errors + 1 suppression warning, then silence.
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn ipv4_rejects_octets_above_255() {
        let mut schema = Schema::new("s", SchemaVersion::new(1, 0, 0));
        schema.fields.push(SchemaField::new("ip", FieldType::IpAddress, 0).required());
        let validator = SchemaValidator::new(ValidatorConfig::default());
        let result = validator.validate_rows(&schema, &[row(1, &["999.1.1.1"])]);
        assert_eq!(result.error_rows, 1);
    }
}
